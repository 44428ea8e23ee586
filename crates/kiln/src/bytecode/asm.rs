//! JSON assembly format.
//!
//! A document describes one module body:
//!
//! ```json
//! {
//!   "name": "<module>",
//!   "code": [
//!     {"line": 1},
//!     ["LOAD_CONST", {"code": {"name": "add", "args": ["a", "b"],
//!        "code": [["LOAD_FAST", "a"], ["LOAD_FAST", "b"], "BINARY_ADD", "RETURN_VALUE"]}}],
//!     ["LOAD_CONST", "add"],
//!     ["MAKE_FUNCTION", 0],
//!     ["STORE_NAME", "add"],
//!     "loop:",
//!     ["JUMP_ABSOLUTE", "loop"]
//!   ]
//! }
//! ```
//!
//! Operands are symbolic: names, locals and cells by name, jumps by label, comparisons by
//! operator (`"<"`, `"exception match"`...), constants inline. Nested `{"code": ...}`
//! constants are function bodies.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use serde::Deserialize;
use serde_json::Value as Json;

use super::{
    builder::{BuildError, CodeBuilder, ConstValue, Label},
    code::Code,
    op::{ArgKind, CompareOp, Opcode},
};
use crate::intern::Interns;

/// Error loading an assembly document.
#[derive(Debug)]
pub enum AsmError {
    Json(serde_json::Error),
    UnknownOpcode { code: String, name: String },
    MissingArgument { code: String, op: Opcode },
    UnexpectedArgument { code: String, op: Opcode },
    BadArgument { code: String, op: Opcode, reason: String },
    DuplicateLabel { code: String, label: String },
    UndefinedLabel { code: String, label: String },
    Build(BuildError),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid assembly document: {err}"),
            Self::UnknownOpcode { code, name } => write!(f, "{code}: unknown opcode '{name}'"),
            Self::MissingArgument { code, op } => write!(f, "{code}: {op} needs an argument"),
            Self::UnexpectedArgument { code, op } => write!(f, "{code}: {op} takes no argument"),
            Self::BadArgument { code, op, reason } => write!(f, "{code}: bad argument for {op}: {reason}"),
            Self::DuplicateLabel { code, label } => write!(f, "{code}: label '{label}' defined twice"),
            Self::UndefinedLabel { code, label } => write!(f, "{code}: label '{label}' is never defined"),
            Self::Build(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for AsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::Build(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AsmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<BuildError> for AsmError {
    fn from(err: BuildError) -> Self {
        Self::Build(err)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AsmFunction {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    first_line: Option<u32>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    kwonly: Vec<String>,
    #[serde(default)]
    varargs: Option<String>,
    #[serde(default)]
    varkw: Option<String>,
    /// Locals declared up front, fixing their slot order.
    #[serde(default)]
    locals: Vec<String>,
    #[serde(default)]
    cellvars: Vec<String>,
    #[serde(default)]
    freevars: Vec<String>,
    #[serde(default)]
    generator: bool,
    code: Vec<AsmItem>,
}

fn default_name() -> String {
    "<module>".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AsmItem {
    /// `"OPNAME"` or `"label:"`.
    Bare(String),
    /// `["OPNAME", operand]`.
    WithArg(String, Json),
    /// `{"line": n}`.
    Line { line: u32 },
}

/// Parses and builds an assembly document into a module code object.
pub fn assemble(source: &str, interns: &mut Interns) -> Result<Arc<Code>, AsmError> {
    let module: AsmFunction = serde_json::from_str(source)?;
    let builder = lower(module, false)?;
    Ok(builder.build(interns)?)
}

fn lower(func: AsmFunction, is_function: bool) -> Result<CodeBuilder, AsmError> {
    let mut builder = if is_function || !func.args.is_empty() {
        let args: Vec<&str> = func.args.iter().map(String::as_str).collect();
        CodeBuilder::function(&func.name, &args)
    } else {
        CodeBuilder::new(&func.name)
    };
    if !func.kwonly.is_empty() {
        let kwonly: Vec<&str> = func.kwonly.iter().map(String::as_str).collect();
        builder = builder.kwonly(&kwonly);
    }
    if let Some(name) = &func.varargs {
        builder = builder.varargs(name);
    }
    if let Some(name) = &func.varkw {
        builder = builder.varkw(name);
    }
    if !func.cellvars.is_empty() {
        let cells: Vec<&str> = func.cellvars.iter().map(String::as_str).collect();
        builder = builder.cellvars(&cells);
    }
    if !func.freevars.is_empty() {
        let frees: Vec<&str> = func.freevars.iter().map(String::as_str).collect();
        builder = builder.freevars(&frees);
    }
    if func.generator {
        builder = builder.generator();
    }
    if let Some(filename) = &func.filename {
        builder = builder.filename(filename);
    }
    if let Some(line) = func.first_line {
        builder = builder.first_line(line);
    }
    for local in &func.locals {
        builder.local_index(local);
    }

    let mut labels = Labels::default();
    for item in func.code {
        match item {
            AsmItem::Line { line } => builder.set_line(line),
            AsmItem::Bare(text) => {
                if let Some(label) = text.strip_suffix(':') {
                    labels.define(&mut builder, label)?;
                } else {
                    let op = parse_opcode(&builder, &text)?;
                    if op.has_arg() {
                        return Err(AsmError::MissingArgument {
                            code: builder.name().to_owned(),
                            op,
                        });
                    }
                    builder.emit(op);
                }
            }
            AsmItem::WithArg(text, arg) => {
                let op = parse_opcode(&builder, &text)?;
                if !op.has_arg() {
                    return Err(AsmError::UnexpectedArgument {
                        code: builder.name().to_owned(),
                        op,
                    });
                }
                emit_with_arg(&mut builder, &mut labels, op, arg)?;
            }
        }
    }
    labels.finish(&builder)?;
    Ok(builder)
}

fn parse_opcode(builder: &CodeBuilder, text: &str) -> Result<Opcode, AsmError> {
    text.parse().map_err(|_| AsmError::UnknownOpcode {
        code: builder.name().to_owned(),
        name: text.to_owned(),
    })
}

fn emit_with_arg(builder: &mut CodeBuilder, labels: &mut Labels, op: Opcode, arg: Json) -> Result<(), AsmError> {
    let bad = |builder: &CodeBuilder, reason: &str| AsmError::BadArgument {
        code: builder.name().to_owned(),
        op,
        reason: reason.to_owned(),
    };
    match op.arg_kind() {
        ArgKind::Const => {
            let value = parse_const(arg).map_err(|reason| bad(builder, &reason))?;
            builder.load_const(value);
        }
        ArgKind::Name => {
            let name = arg.as_str().ok_or_else(|| bad(builder, "expected a name"))?;
            builder.emit_name(op, name);
        }
        ArgKind::Local => {
            let name = arg.as_str().ok_or_else(|| bad(builder, "expected a local name"))?;
            builder.emit_local(op, name);
        }
        ArgKind::Deref => {
            let name = arg.as_str().ok_or_else(|| bad(builder, "expected a cell name"))?;
            builder.emit_deref(op, name);
        }
        ArgKind::RelativeJump | ArgKind::AbsoluteJump => {
            let name = arg.as_str().ok_or_else(|| bad(builder, "expected a label"))?;
            let label = labels.reference(builder, name);
            builder.emit_jump(op, label);
        }
        ArgKind::Compare => {
            let cmp = match &arg {
                Json::String(s) => s.parse::<CompareOp>().ok(),
                Json::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()).and_then(CompareOp::from_repr),
                _ => None,
            }
            .ok_or_else(|| bad(builder, "expected a comparison operator"))?;
            builder.compare(cmp);
        }
        ArgKind::Int | ArgKind::None => {
            let n = arg
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| bad(builder, "expected a non-negative integer"))?;
            builder.emit_arg(op, n);
        }
    }
    Ok(())
}

fn parse_const(value: Json) -> Result<ConstValue, String> {
    Ok(match value {
        Json::Null => ConstValue::None,
        Json::Bool(b) => ConstValue::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConstValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                ConstValue::Float(f)
            } else {
                return Err(format!("integer {n} out of range"));
            }
        }
        Json::String(s) => ConstValue::Str(s),
        Json::Array(items) => ConstValue::Tuple(items.into_iter().map(parse_const).collect::<Result<_, _>>()?),
        Json::Object(mut map) => {
            let body = map.remove("code").ok_or("object constants must be {\"code\": ...}")?;
            let func: AsmFunction = serde_json::from_value(body).map_err(|e| e.to_string())?;
            let builder = lower(func, true).map_err(|e| e.to_string())?;
            ConstValue::Code(Box::new(builder))
        }
    })
}

/// Symbolic labels of one function body.
#[derive(Debug, Default)]
struct Labels {
    map: AHashMap<String, (Label, bool)>,
}

impl Labels {
    fn reference(&mut self, builder: &mut CodeBuilder, name: &str) -> Label {
        if let Some((label, _)) = self.map.get(name) {
            return *label;
        }
        let label = builder.new_label();
        self.map.insert(name.to_owned(), (label, false));
        label
    }

    fn define(&mut self, builder: &mut CodeBuilder, name: &str) -> Result<(), AsmError> {
        let label = self.reference(builder, name);
        let entry = self.map.get_mut(name).expect("label was just referenced");
        if entry.1 {
            return Err(AsmError::DuplicateLabel {
                code: builder.name().to_owned(),
                label: name.to_owned(),
            });
        }
        entry.1 = true;
        builder.bind(label);
        Ok(())
    }

    fn finish(&self, builder: &CodeBuilder) -> Result<(), AsmError> {
        match self.map.iter().find(|(_, (_, defined))| !defined) {
            Some((name, _)) => Err(AsmError::UndefinedLabel {
                code: builder.name().to_owned(),
                label: name.clone(),
            }),
            None => Ok(()),
        }
    }
}
