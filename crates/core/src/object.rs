//! Heap object payloads.
//!
//! One slot in the arena holds one `ObjectData` variant. The operations
//! that need to chase handles (equality, hashing, deep copy, rendering)
//! live on [`Heap`](crate::heap::Heap); this module only defines the data.

use crate::code::CompiledCode;
use crate::error::{ErrorKind, Traceback};
use crate::heap::Heap;
use crate::value::Value;
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// String payload with a cached hash. A hash of 0 means "not computed yet";
/// computed hashes are forced nonzero.
#[derive(Debug, Default)]
pub struct StrData {
    pub value: String,
    pub hash: u64,
}

impl StrData {
    pub fn new(value: String) -> Self {
        StrData { value, hash: 0 }
    }

    /// Reuse the allocation of a pooled string.
    pub fn reset(&mut self, value: &str) {
        self.value.clear();
        self.value.push_str(value);
        self.hash = 0;
    }
}

/// Insertion-ordered map keyed by the hashable value subset
/// (number, bool, string). Lookup goes through a hash index; collisions
/// within a bucket are resolved by value equality.
#[derive(Debug, Default)]
pub struct MapData {
    pub entries: Vec<(Value, Value)>,
    pub index: HashMap<u64, Vec<u32>>,
}

impl MapData {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// A compiled script function: shared bytecode plus captured free values.
/// The synthetic top-level wrapper is an ordinary function with zero args
/// and locals.
#[derive(Debug)]
pub struct FunctionData {
    pub name: Option<String>,
    pub code: Rc<CompiledCode>,
    pub num_locals: usize,
    pub num_args: usize,
    pub free_vals: Vec<Value>,
}

impl FunctionData {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// Error raised by a native function. Converted into a runtime error with
/// a traceback annotated with the native's name.
#[derive(Debug, Clone)]
pub struct NativeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NativeError {
    pub fn runtime(message: impl Into<String>) -> Self {
        NativeError {
            kind: ErrorKind::Runtime,
            message: message.into(),
        }
    }
}

pub type NativeResult = Result<Value, NativeError>;

/// Host function callable from scripts. Captured state replaces the
/// traditional user-data pointer.
pub type NativeFn = Rc<dyn Fn(&mut Heap, &[Value]) -> NativeResult>;

pub struct NativeData {
    pub name: String,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeData")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// First-class error value.
#[derive(Debug)]
pub struct ErrorData {
    pub message: String,
    pub traceback: Option<Traceback>,
}

/// Opaque host data with optional copy and finalize callbacks. The
/// finalizer runs when the object is swept.
pub struct ExternalData {
    pub data: Rc<dyn Any>,
    pub copy_fn: Option<Rc<dyn Fn(&dyn Any) -> Rc<dyn Any>>>,
    pub destroy_fn: Option<Rc<dyn Fn(&dyn Any)>>,
}

impl std::fmt::Debug for ExternalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalData").finish_non_exhaustive()
    }
}

/// The payload stored in one heap slot.
#[derive(Debug)]
pub enum ObjectData {
    /// Slot on the free list; a live handle never points at this.
    Free,
    Str(StrData),
    Array(Vec<Value>),
    Map(MapData),
    Function(FunctionData),
    Native(NativeData),
    Error(ErrorData),
    External(ExternalData),
}
