pub mod builtins;
pub mod collect;
pub mod dispatch;
pub mod runtime_error;
pub mod scope;
pub mod stack;
pub mod value;
pub mod vm;

pub use builtins::BuiltinKind;
pub use runtime_error::{ErrorKind, RuntimeError};
pub use value::Value;
pub use vm::{Vm, VmConfig};
