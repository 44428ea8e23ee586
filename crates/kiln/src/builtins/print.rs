//! Implementation of the print() builtin function.

use crate::{
    args::CallArgs,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap},
    intern::Interns,
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Writes the `str()` of each argument.
///
/// Supports the `sep` (default `" "`) and `end` (default `"\n"`) keyword arguments;
/// either may be `None` to select the default.
pub fn builtin_print(
    heap: &mut Heap<impl ResourceTracker>,
    interns: &Interns,
    print: &mut impl PrintWriter,
    args: CallArgs,
) -> RunResult<Value> {
    let CallArgs { positional, keywords } = args;
    let (sep, end) = match extract_print_kwargs(keywords, heap, interns) {
        Ok(se) => se,
        Err(err) => {
            for value in positional {
                value.drop_with_heap(heap);
            }
            return Err(err);
        }
    };

    // build the whole line first so output is atomic per call
    let mut output = String::new();
    for (i, value) in positional.into_iter().enumerate() {
        if i > 0 {
            output.push_str(sep.as_deref().unwrap_or(" "));
        }
        output.push_str(&value.py_str(heap, interns));
        value.drop_with_heap(heap);
    }
    print.print(&output, end.as_deref().unwrap_or("\n"))?;
    Ok(Value::None)
}

fn extract_print_kwargs(
    keywords: Vec<(Value, Value)>,
    heap: &mut Heap<impl ResourceTracker>,
    interns: &Interns,
) -> RunResult<(Option<String>, Option<String>)> {
    let mut sep = None;
    let mut end = None;
    let mut error = None;
    for (key, value) in keywords {
        if error.is_none() {
            let key_str = key.as_str(heap, interns).unwrap_or_default();
            let slot = match key_str {
                "sep" => Some(&mut sep),
                "end" => Some(&mut end),
                _ => None,
            };
            match slot {
                Some(slot) if value.is_none() => *slot = None,
                Some(slot) => match value.as_str(heap, interns) {
                    Some(s) => *slot = Some(s.to_owned()),
                    None => {
                        error = Some(ExcType::type_error(format!(
                            "{key_str} must be None or a string, not {}",
                            value.type_name(heap)
                        )));
                    }
                },
                None => error = Some(ExcType::type_error_unexpected_keyword("print", key_str)),
            }
        }
        (key, value).drop_with_heap(heap);
    }
    match error {
        Some(err) => Err(err),
        None => Ok((sep, end)),
    }
}
