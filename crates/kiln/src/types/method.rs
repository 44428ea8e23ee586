use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Value;

/// Native methods reachable through attribute lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub(crate) enum MethodKind {
    #[strum(serialize = "send")]
    GeneratorSend,
    #[strum(serialize = "throw")]
    GeneratorThrow,
    #[strum(serialize = "close")]
    GeneratorClose,
    #[strum(serialize = "append")]
    ListAppend,
    #[strum(serialize = "get")]
    DictGet,
    #[strum(serialize = "keys")]
    DictKeys,
    #[strum(serialize = "__enter__")]
    SuppressEnter,
    #[strum(serialize = "__exit__")]
    SuppressExit,
}

impl MethodKind {
    /// Whether the method can be found on an object of the given type.
    pub fn applies_to(self, type_name: &str) -> bool {
        match self {
            Self::GeneratorSend | Self::GeneratorThrow | Self::GeneratorClose => type_name == "generator",
            Self::ListAppend => type_name == "list",
            Self::DictGet | Self::DictKeys => type_name == "dict",
            Self::SuppressEnter | Self::SuppressExit => type_name == "suppress",
        }
    }

    /// Whether calls through this method are counted as bound-method calls.
    pub fn is_generator_method(self) -> bool {
        matches!(self, Self::GeneratorSend | Self::GeneratorThrow | Self::GeneratorClose)
    }
}

/// A native method bound to its receiver, e.g. `gen.send`.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub method: MethodKind,
}
