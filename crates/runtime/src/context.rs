//! The embedding context.
//!
//! `Ape` owns the whole pipeline: heap, error list, host globals,
//! compiler and VM, wired together exactly once per context. Dropping the
//! context releases everything in reverse construction order.
//!
//! ```no_run
//! use ape_runtime::Ape;
//!
//! let mut ape = Ape::new();
//! let result = ape.execute("var x = 21 * 2");
//! assert_eq!(ape.value_to_string(result), "42");
//! ```

use crate::builtins;
use crate::io::Io;
use crate::vm::{Vm, VmEnv};
use ape_compiler::{code_to_string, CompileEnv, Compiler, GlobalStore, SymbolKind};
use ape_core::{
    ErrorKind, ErrorList, ExternalData, Heap, NativeResult, Pos, ScriptError, Value,
};
use std::any::Any;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Config {
    repl_mode: bool,
    max_exec_time: Option<Duration>,
}

pub struct Ape {
    heap: Heap,
    errors: ErrorList,
    store: GlobalStore,
    compiler: Compiler,
    vm: Vm,
    io: Rc<Io>,
    config: Config,
}

impl Default for Ape {
    fn default() -> Self {
        Self::new()
    }
}

impl Ape {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut store = GlobalStore::new();
        let io = Rc::new(Io::default());
        builtins::install(&mut store, &mut heap, &io);
        let vm = Vm::new(&mut heap);
        Ape {
            heap,
            errors: ErrorList::new(),
            store,
            compiler: Compiler::new(),
            vm,
            io,
            config: Config::default(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// In REPL mode a leading `{` parses as a map literal and bare
    /// expressions are valid statements.
    pub fn set_repl_mode(&mut self, enabled: bool) {
        self.config.repl_mode = enabled;
    }

    /// Wall-clock execution ceiling; negative disables.
    pub fn set_timeout_ms(&mut self, max_execution_time_ms: f64) {
        self.config.max_exec_time = if max_execution_time_ms >= 0.0 {
            Some(Duration::from_secs_f64(max_execution_time_ms / 1000.0))
        } else {
            None
        };
    }

    pub fn set_stdout_write(&mut self, f: impl Fn(&[u8]) -> usize + 'static) {
        self.io.set_stdout_write(Rc::new(f));
    }

    /// Imports and `execute_file` read through this hook.
    pub fn set_file_read(&mut self, f: impl Fn(&str) -> Option<String> + 'static) {
        self.io.set_read_file(Some(Rc::new(f)));
    }

    pub fn set_file_write(&mut self, f: impl Fn(&str, &[u8]) -> usize + 'static) {
        self.io.set_write_file(Some(Rc::new(f)));
    }

    /// Write through the file-write hook; host natives use this so their
    /// output is captured the same way script I/O is. Returns the number
    /// of bytes written (0 when no hook is installed).
    pub fn write_file(&self, path: &str, bytes: &[u8]) -> usize {
        match self.io.write_file_hook() {
            Some(write) => write(path, bytes),
            None => 0,
        }
    }

    /// Read through the file-read hook, like `execute_file` and imports do.
    pub fn read_file(&self, path: &str) -> Option<String> {
        self.io.read_file_hook().and_then(|read| read(path))
    }

    // ------------------------------------------------------------------
    // Host globals
    // ------------------------------------------------------------------

    pub fn set_native_function<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut Heap, &[Value]) -> NativeResult + 'static,
    {
        let native = self.heap.make_native(name, Rc::new(func));
        self.store.set(name, native);
    }

    /// Install a non-reassignable global visible to every script.
    pub fn set_global_constant(&mut self, name: &str, value: Value) {
        self.store.set(name, value);
    }

    /// Resolve a module global or host global by name.
    pub fn get_object(&mut self, name: &str) -> Value {
        match self.compiler.resolve_global(&self.store, name) {
            None => {
                self.errors.add(ScriptError::new(
                    ErrorKind::User,
                    Pos::invalid(),
                    format!("Symbol \"{}\" is not defined", name),
                ));
                Value::Null
            }
            Some(symbol) => match symbol.kind {
                SymbolKind::ModuleGlobal => self
                    .vm
                    .module_global(symbol.index)
                    .unwrap_or(Value::Null),
                SymbolKind::ApeGlobal => {
                    self.store.object_at(symbol.index).unwrap_or(Value::Null)
                }
                _ => {
                    self.errors.add(ScriptError::new(
                        ErrorKind::User,
                        Pos::invalid(),
                        format!("Symbol \"{}\" is not a global", name),
                    ));
                    Value::Null
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn reset_state(&mut self) {
        self.errors.clear();
        self.vm.reset();
    }

    /// Compile and run; returns the value of the last evaluated statement
    /// (null when errors were queued).
    pub fn execute(&mut self, code: &str) -> Value {
        self.reset_state();
        let read_file = self.io.read_file_hook();
        let compiled = {
            let mut env = CompileEnv {
                heap: &mut self.heap,
                store: &self.store,
                repl_mode: self.config.repl_mode,
                read_file: read_file
                    .as_ref()
                    .map(|rc| rc.as_ref() as &dyn Fn(&str) -> Option<String>),
            };
            self.compiler.compile(&mut env, code)
        };
        let compiled = match compiled {
            Ok(code) => code,
            Err(e) => {
                self.errors.add(e);
                return Value::Null;
            }
        };
        let ok = {
            let mut env = VmEnv {
                heap: &mut self.heap,
                errors: &mut self.errors,
                store: &self.store,
                constants: self.compiler.constants(),
                max_exec_time: self.config.max_exec_time,
            };
            self.vm.run(&mut env, compiled)
        };
        if !ok || self.errors.has_errors() {
            return Value::Null;
        }
        self.vm.last_popped()
    }

    /// Read a file through the file-read hook, compile and run it.
    pub fn execute_file(&mut self, path: &str) -> Value {
        self.reset_state();
        let read_file = self.io.read_file_hook();
        let compiled = {
            let mut env = CompileEnv {
                heap: &mut self.heap,
                store: &self.store,
                repl_mode: self.config.repl_mode,
                read_file: read_file
                    .as_ref()
                    .map(|rc| rc.as_ref() as &dyn Fn(&str) -> Option<String>),
            };
            self.compiler.compile_file(&mut env, path)
        };
        let compiled = match compiled {
            Ok(code) => code,
            Err(e) => {
                self.errors.add(e);
                return Value::Null;
            }
        };
        let ok = {
            let mut env = VmEnv {
                heap: &mut self.heap,
                errors: &mut self.errors,
                store: &self.store,
                constants: self.compiler.constants(),
                max_exec_time: self.config.max_exec_time,
            };
            self.vm.run(&mut env, compiled)
        };
        if !ok || self.errors.has_errors() {
            return Value::Null;
        }
        self.vm.last_popped()
    }

    /// Call a script function (or native) by name from the host.
    pub fn call(&mut self, function_name: &str, args: &[Value]) -> Value {
        self.reset_state();
        let callee = self.get_object(function_name);
        if self.errors.has_errors() {
            return Value::Null;
        }
        let mut env = VmEnv {
            heap: &mut self.heap,
            errors: &mut self.errors,
            store: &self.store,
            constants: self.compiler.constants(),
            max_exec_time: self.config.max_exec_time,
        };
        self.vm.call(&mut env, callee, args)
    }

    /// Compile only, returning a bytecode listing.
    pub fn disassemble(&mut self, code: &str) -> Option<String> {
        let read_file = self.io.read_file_hook();
        let mut env = CompileEnv {
            heap: &mut self.heap,
            store: &self.store,
            repl_mode: self.config.repl_mode,
            read_file: read_file
                .as_ref()
                .map(|rc| rc.as_ref() as &dyn Fn(&str) -> Option<String>),
        };
        match self.compiler.compile(&mut env, code) {
            Ok(compiled) => Some(code_to_string(&compiled)),
            Err(e) => {
                self.errors.add(e);
                None
            }
        }
    }

    /// Compile a file only, returning a bytecode listing.
    pub fn disassemble_file(&mut self, path: &str) -> Option<String> {
        let read_file = self.io.read_file_hook();
        let mut env = CompileEnv {
            heap: &mut self.heap,
            store: &self.store,
            repl_mode: self.config.repl_mode,
            read_file: read_file
                .as_ref()
                .map(|rc| rc.as_ref() as &dyn Fn(&str) -> Option<String>),
        };
        match self.compiler.compile_file(&mut env, path) {
            Ok(compiled) => Some(code_to_string(&compiled)),
            Err(e) => {
                self.errors.add(e);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub fn has_errors(&self) -> bool {
        self.errors.has_errors()
    }

    pub fn errors_count(&self) -> usize {
        self.errors.len()
    }

    pub fn error_at(&self, ix: usize) -> Option<&ScriptError> {
        self.errors.get(ix)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ScriptError> {
        self.errors.iter()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn string(&mut self, s: &str) -> Value {
        self.heap.make_string(s)
    }

    pub fn array(&mut self, items: Vec<Value>) -> Value {
        self.heap.make_array_from(items)
    }

    pub fn map(&mut self) -> Value {
        self.heap.make_map()
    }

    /// Returns false when the key is not hashable or the value is not a
    /// map.
    pub fn map_set(&mut self, map: Value, key: Value, value: Value) -> bool {
        match map.handle() {
            Some(h) => self.heap.map_set(h, key, value),
            None => false,
        }
    }

    /// A first-class error value, as the `error` builtin produces.
    pub fn error_value(&mut self, message: &str) -> Value {
        self.heap.make_error(message)
    }

    pub fn external(&mut self, data: Rc<dyn Any>) -> Value {
        self.heap.make_external(ExternalData {
            data,
            copy_fn: None,
            destroy_fn: None,
        })
    }

    pub fn value_to_string(&self, v: Value) -> String {
        self.heap.to_display_string(v)
    }

    pub fn str_of(&self, v: Value) -> Option<&str> {
        match v {
            Value::Str(h) => Some(self.heap.str_value(h)),
            _ => None,
        }
    }

    pub fn number_of(v: Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn bool_of(v: Value) -> Option<bool> {
        match v {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Direct heap access for embedders that build richer structures.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ------------------------------------------------------------------
    // GC pinning
    // ------------------------------------------------------------------

    /// Values retained by the host across executions must be pinned or
    /// a sweep may reclaim them.
    pub fn pin_object(&mut self, v: Value) -> bool {
        self.heap.pin(v)
    }

    pub fn unpin_object(&mut self, v: Value) {
        self.heap.unpin(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_and_returns_the_last_popped_value() {
        let mut ape = Ape::new();
        ape.set_repl_mode(true);
        let result = ape.execute("var x = 2; x * 21");
        assert_eq!(result, Value::Number(42.0));
        assert!(!ape.has_errors());
    }

    #[test]
    fn parse_errors_land_in_the_queue() {
        let mut ape = Ape::new();
        let result = ape.execute("var = 1");
        assert!(result.is_null());
        assert_eq!(ape.errors_count(), 1);
        assert_eq!(ape.error_at(0).unwrap().kind, ErrorKind::Parsing);
        // the queue resets on the next execute
        ape.execute("var ok = 1");
        assert!(!ape.has_errors());
    }

    #[test]
    fn native_functions_and_global_constants() {
        let mut ape = Ape::new();
        ape.set_repl_mode(true);
        ape.set_native_function("twice", |_heap, args| {
            Ok(Value::Number(args[0].as_number() * 2.0))
        });
        ape.set_global_constant("answer", Value::Number(21.0));
        let result = ape.execute("twice(answer)");
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn get_object_resolves_module_globals() {
        let mut ape = Ape::new();
        ape.execute("var greeting = \"hello\"");
        let v = ape.get_object("greeting");
        assert_eq!(ape.str_of(v), Some("hello"));
    }

    #[test]
    fn pinned_values_survive_collections() {
        let mut ape = Ape::new();
        let kept = ape.string("kept");
        ape.pin_object(kept);
        // burn through enough allocations to force sweeps
        ape.execute("for (var i = 0; i < 500; i = i + 1) { var s = \"x\" + to_str(i) }");
        assert_eq!(ape.str_of(kept), Some("kept"));
    }
}
