//! Compiled programs: a module code object plus the intern table its names live in.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{AsmError, BuildError, Code, CodeBuilder, assemble},
    exception_public::Exception,
    host::HostFunctions,
    intern::Interns,
    object::Object,
};

/// Error snapshotting or restoring a [`Program`].
#[derive(Debug)]
pub enum ProgramError {
    Serialize(postcard::Error),
    Deserialize(postcard::Error),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(err) => write!(f, "failed to serialize program: {err}"),
            Self::Deserialize(err) => write!(f, "failed to deserialize program: {err}"),
        }
    }
}

impl std::error::Error for ProgramError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialize(err) | Self::Deserialize(err) => Some(err),
        }
    }
}

/// A module ready to run on an [`ExecutionContext`](crate::ExecutionContext).
///
/// Immutable once built apart from host function registration; any number of runs, on
/// any number of contexts, can share one program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    interns: Interns,
    module: Arc<Code>,
    /// Host functions are closures and cannot be snapshotted; register them again after loading.
    #[serde(skip)]
    host: HostFunctions,
}

impl Program {
    /// Wraps an already built module. `interns` must be the table the code was built with.
    #[must_use]
    pub fn new(module: Arc<Code>, interns: Interns) -> Self {
        Self {
            interns,
            module,
            host: HostFunctions::default(),
        }
    }

    pub fn from_builder(builder: CodeBuilder) -> Result<Self, BuildError> {
        let mut interns = Interns::new();
        let module = builder.build(&mut interns)?;
        Ok(Self::new(module, interns))
    }

    /// Assembles a JSON assembly document, see [`crate::bytecode::assemble`].
    pub fn from_asm(source: &str) -> Result<Self, AsmError> {
        let mut interns = Interns::new();
        let module = assemble(source, &mut interns)?;
        Ok(Self::new(module, interns))
    }

    /// Makes `function` callable from bytecode under `name`.
    ///
    /// Host functions shadow builtins of the same name but not module globals.
    pub fn register_host_function(
        &mut self,
        name: &str,
        function: impl Fn(&[Object]) -> Result<Object, Exception> + Send + Sync + 'static,
    ) {
        self.host.register(name, Arc::new(function));
    }

    #[must_use]
    pub fn module(&self) -> &Arc<Code> {
        &self.module
    }

    #[must_use]
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    pub(crate) fn host_functions(&self) -> &HostFunctions {
        &self.host
    }

    /// Human readable listing of the module and every nested code object.
    #[must_use]
    pub fn disassemble(&self) -> String {
        self.module.disassemble(&self.interns)
    }

    /// Serializes the compiled program to bytes.
    pub fn dump(&self) -> Result<Vec<u8>, ProgramError> {
        postcard::to_allocvec(self).map_err(ProgramError::Serialize)
    }

    /// Restores a program serialized with [`Self::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut program: Self = postcard::from_bytes(bytes).map_err(ProgramError::Deserialize)?;
        program.interns.rebuild_index();
        Ok(program)
    }
}
