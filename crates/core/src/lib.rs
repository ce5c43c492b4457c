//! Ape Core: value model, heap and error machinery shared by the compiler
//! and the virtual machine.
//!
//! Key design principles:
//! - `Value`: a small `Copy` sum type; heap kinds carry a generational
//!   `Handle` into the arena instead of a raw pointer
//! - `Heap`: slot arena with a tracing mark-sweep collector and typed
//!   reuse pools; roots are enumerated by the caller
//! - `ErrorList`: bounded, position-annotated error queue shared by the
//!   lexer, parser, compiler and VM
//!
//! # Modules
//!
//! - `value`: `Value`, `Handle`, type predicates and type masks
//! - `object`: heap object payloads (strings, arrays, maps, functions, ...)
//! - `heap`: arena, allocation, GC, value equality/compare/hash, deep copy
//! - `code`: compiled bytecode plus its parallel source-position table
//! - `error`: error kinds, the bounded error list and tracebacks
//! - `pos`: source files and positions

pub mod code;
pub mod error;
pub mod heap;
pub mod object;
pub mod pos;
pub mod value;

pub use code::CompiledCode;
pub use error::{ErrorKind, ErrorList, ScriptError, Traceback, TracebackItem};
pub use heap::Heap;
pub use object::{
    ErrorData, ExternalData, FunctionData, MapData, NativeData, NativeError, NativeFn,
    NativeResult, ObjectData, StrData,
};
pub use pos::{Pos, SourceFile};
pub use value::{Handle, TypeMask, Value, ValueType};
