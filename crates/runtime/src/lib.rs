//! Ape Runtime: the stack VM, builtin natives and the embedding context.
//!
//! Most embedders only need [`Ape`]:
//!
//! ```no_run
//! use ape_runtime::Ape;
//!
//! let mut ape = Ape::new();
//! ape.set_native_function("host_add", |_heap, args| {
//!     Ok(ape_core::Value::Number(
//!         args.iter().map(|a| a.as_number()).sum(),
//!     ))
//! });
//! ape.execute("println(host_add(1, 2, 3))");
//! ```
//!
//! # Modules
//!
//! - `vm`: fetch-decode-execute loop, frames, recover, GC roots
//! - `builtins`: the builtin native functions
//! - `io`: host I/O hooks (stdout, file read/write)
//! - `context`: the `Ape` context wiring everything together

pub mod builtins;
pub mod context;
pub mod io;
pub mod vm;

pub use context::Ape;
pub use io::Io;
pub use vm::{Vm, VmEnv};

pub use ape_core::{ErrorKind, Heap, NativeError, NativeResult, ScriptError, Value, ValueType};
