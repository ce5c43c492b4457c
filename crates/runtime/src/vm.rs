//! The stack virtual machine.
//!
//! A fetch-decode-execute loop over call frames. Each frame caches the
//! `Rc` of its function's compiled code so instruction fetch never touches
//! the heap. Opcode handlers return `Result`; a runtime error walks the
//! frame stack looking for an installed recover handler before it is
//! allowed to terminate the run.
//!
//! The GC runs between instructions whenever the heap's allocation counter
//! crosses its threshold, and once more at the end of every run; the VM
//! enumerates the roots (globals, constants, frames, both stacks, the
//! last-popped slot and the operator-overload key strings).

use ape_compiler::global_store::GlobalStore;
use ape_compiler::opcode::{self, Op, OPCODE_COUNT};
use ape_core::{
    CompiledCode, ErrorKind, ErrorList, FunctionData, Heap, Pos, ScriptError, Traceback, Value,
};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

pub const STACK_SIZE: usize = 2048;
pub const THIS_STACK_SIZE: usize = 256;
pub const MAX_FRAMES: usize = 512;
pub const MAX_GLOBALS: usize = 512;

/// Wall-clock timeout is sampled once per this many instructions.
const TIME_CHECK_INTERVAL: u64 = 1000;

/// Everything the VM borrows for one run.
pub struct VmEnv<'a> {
    pub heap: &'a mut Heap,
    pub errors: &'a mut ErrorList,
    pub store: &'a GlobalStore,
    pub constants: &'a [Value],
    pub max_exec_time: Option<Duration>,
}

/// One activation record.
#[derive(Debug)]
struct Frame {
    function: Value,
    code: Rc<CompiledCode>,
    ip: usize,
    /// ip of the most recently fetched opcode; errors report its position.
    src_ip: usize,
    base_pointer: usize,
    recover_ip: Option<usize>,
    is_recovering: bool,
}

impl Frame {
    fn new(function: Value, code: Rc<CompiledCode>, base_pointer: usize) -> Self {
        Frame {
            function,
            code,
            ip: 0,
            src_ip: 0,
            base_pointer,
            recover_ip: None,
            is_recovering: false,
        }
    }

    fn src_pos(&self) -> Pos {
        self.code.pos_at(self.src_ip)
    }
}

enum Flow {
    Normal,
    Halt,
}

pub struct Vm {
    stack: Vec<Value>,
    sp: usize,
    this_stack: Vec<Value>,
    this_sp: usize,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    globals_count: usize,
    last_popped: Value,
    running: bool,
    /// `__operator_add__`-style method names, indexed by opcode.
    overload_keys: Vec<Value>,
}

impl Vm {
    pub fn new(heap: &mut Heap) -> Self {
        let mut overload_keys = vec![Value::Null; OPCODE_COUNT];
        let mut set = |op: Op, name: &str, heap: &mut Heap| {
            overload_keys[op as usize] = heap.make_string(name);
        };
        set(Op::Add, "__operator_add__", heap);
        set(Op::Sub, "__operator_sub__", heap);
        set(Op::Mul, "__operator_mul__", heap);
        set(Op::Div, "__operator_div__", heap);
        set(Op::Mod, "__operator_mod__", heap);
        set(Op::Or, "__operator_or__", heap);
        set(Op::Xor, "__operator_xor__", heap);
        set(Op::And, "__operator_and__", heap);
        set(Op::Lshift, "__operator_lshift__", heap);
        set(Op::Rshift, "__operator_rshift__", heap);
        set(Op::Minus, "__operator_minus__", heap);
        set(Op::Bang, "__operator_bang__", heap);
        set(Op::Compare, "__cmp__", heap);

        Vm {
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            this_stack: vec![Value::Null; THIS_STACK_SIZE],
            this_sp: 0,
            frames: Vec::new(),
            globals: vec![Value::Null; MAX_GLOBALS],
            globals_count: 0,
            last_popped: Value::Null,
            running: false,
            overload_keys,
        }
    }

    pub fn reset(&mut self) {
        self.sp = 0;
        self.this_sp = 0;
        while !self.frames.is_empty() {
            self.pop_frame();
        }
    }

    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    /// Wrap a compilation result as a synthetic zero-arg `main` function
    /// and execute it to completion. Returns false when errors are queued.
    pub fn run(&mut self, env: &mut VmEnv<'_>, code: Rc<CompiledCode>) -> bool {
        let old_this_sp = self.this_sp;
        let old_frames_count = self.frames.len();
        let main_fn = env.heap.make_function(FunctionData {
            name: Some("main".to_string()),
            code,
            num_locals: 0,
            num_args: 0,
            free_vals: Vec::new(),
        });
        if let Err(e) = self.push(main_fn) {
            env.errors.add(e);
            return false;
        }
        let ok = self.execute_function(env, main_fn);
        while self.frames.len() > old_frames_count {
            self.pop_frame();
        }
        self.this_sp = old_this_sp;
        ok
    }

    /// Host-initiated call of a script or native function.
    pub fn call(&mut self, env: &mut VmEnv<'_>, callee: Value, args: &[Value]) -> Value {
        match callee {
            Value::Function(h) => {
                let Some(function) = env.heap.function_ref(h) else {
                    env.errors.add(ScriptError::new(
                        ErrorKind::User,
                        Pos::invalid(),
                        "Object is not callable",
                    ));
                    return Value::Null;
                };
                if function.num_args != args.len() {
                    let message = format!(
                        "Invalid number of arguments to \"{}\", expected {}, got {}",
                        function.display_name(),
                        function.num_args,
                        args.len()
                    );
                    env.errors
                        .add(ScriptError::runtime(Pos::invalid(), message));
                    return Value::Null;
                }
                let old_this_sp = self.this_sp;
                let old_frames_count = self.frames.len();
                let pushed = self.push(callee).and_then(|_| {
                    for arg in args {
                        self.push(*arg)?;
                    }
                    Ok(())
                });
                if let Err(e) = pushed {
                    env.errors.add(e);
                    return Value::Null;
                }
                let ok = self.execute_function(env, callee);
                if !ok {
                    return Value::Null;
                }
                while self.frames.len() > old_frames_count {
                    self.pop_frame();
                }
                self.this_sp = old_this_sp;
                self.last_popped
            }
            Value::Native(_) => match self.call_native(env, callee, Pos::invalid(), args) {
                Ok(v) => v,
                Err(mut e) => {
                    if e.traceback.is_none() {
                        e.traceback = Some(Traceback::new());
                    }
                    env.errors.add(e);
                    Value::Null
                }
            },
            _ => {
                env.errors.add(ScriptError::new(
                    ErrorKind::User,
                    Pos::invalid(),
                    "Object is not callable",
                ));
                Value::Null
            }
        }
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    fn src_pos(&self) -> Pos {
        self.frames
            .last()
            .map(|f| f.src_pos())
            .unwrap_or_else(Pos::invalid)
    }

    fn runtime_err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::runtime(self.src_pos(), message)
    }

    /// Clearing the grown region keeps stale values out of the GC roots
    /// and doubles as null-initialisation of locals.
    fn set_sp(&mut self, new_sp: usize) {
        if new_sp > self.sp {
            self.stack[self.sp..new_sp].fill(Value::Null);
        }
        self.sp = new_sp;
    }

    fn push(&mut self, v: Value) -> Result<(), ScriptError> {
        if self.sp >= STACK_SIZE {
            return Err(self.runtime_err("Stack overflow"));
        }
        self.stack[self.sp] = v;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        if self.sp == 0 {
            return Value::Null;
        }
        self.sp -= 1;
        let v = self.stack[self.sp];
        self.last_popped = v;
        v
    }

    fn stack_get(&self, nth: usize) -> Value {
        if nth + 1 > self.sp {
            return Value::Null;
        }
        self.stack[self.sp - 1 - nth]
    }

    fn this_push(&mut self, v: Value) -> Result<(), ScriptError> {
        if self.this_sp >= THIS_STACK_SIZE {
            return Err(self.runtime_err("this stack overflow"));
        }
        self.this_stack[self.this_sp] = v;
        self.this_sp += 1;
        Ok(())
    }

    fn this_pop(&mut self) -> Value {
        if self.this_sp == 0 {
            return Value::Null;
        }
        self.this_sp -= 1;
        self.this_stack[self.this_sp]
    }

    fn this_get(&self, nth: usize) -> Value {
        if nth + 1 > self.this_sp {
            return Value::Null;
        }
        self.this_stack[self.this_sp - 1 - nth]
    }

    fn push_frame(&mut self, frame: Frame, num_locals: usize) -> Result<(), ScriptError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_err("Pushing frame failed, frame limit reached"));
        }
        let base = frame.base_pointer;
        self.frames.push(frame);
        self.set_sp(base + num_locals);
        Ok(())
    }

    fn pop_frame(&mut self) -> bool {
        let base = self.frames.last().map(|f| f.base_pointer).unwrap_or(1);
        self.set_sp(base.saturating_sub(1));
        self.frames.pop();
        !self.frames.is_empty()
    }

    // ------------------------------------------------------------------
    // Operand fetch
    // ------------------------------------------------------------------

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("frame");
        let v = opcode::read_u8(&frame.code.bytecode, frame.ip);
        frame.ip += 1;
        v
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("frame");
        let v = opcode::read_u16(&frame.code.bytecode, frame.ip);
        frame.ip += 2;
        v
    }

    fn read_u64(&mut self) -> u64 {
        let frame = self.frames.last_mut().expect("frame");
        let v = opcode::read_u64(&frame.code.bytecode, frame.ip);
        frame.ip += 8;
        v
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn execute_function(&mut self, env: &mut VmEnv<'_>, function: Value) -> bool {
        if self.running {
            env.errors.add(ScriptError::new(
                ErrorKind::User,
                Pos::invalid(),
                "VM is already executing code",
            ));
            return false;
        }
        let Some(handle) = function.handle() else {
            return false;
        };
        let Some(data) = env.heap.function_ref(handle) else {
            return false;
        };
        let code = data.code.clone();
        let num_locals = data.num_locals;
        let num_args = data.num_args;
        let frame = Frame::new(function, code, self.sp - num_args);
        if let Err(e) = self.push_frame(frame, num_locals) {
            env.errors.add(e);
            return false;
        }

        self.running = true;
        self.last_popped = Value::Null;
        self.main_loop(env);
        self.run_gc(env);
        self.running = false;
        !env.errors.has_errors()
    }

    fn main_loop(&mut self, env: &mut VmEnv<'_>) {
        let deadline = env.max_exec_time.map(|budget| (Instant::now(), budget));
        let mut time_check_counter: u64 = 0;

        loop {
            let byte = {
                let Some(frame) = self.frames.last_mut() else {
                    break;
                };
                if frame.ip >= frame.code.bytecode.len() {
                    break;
                }
                frame.src_ip = frame.ip;
                let byte = frame.code.bytecode[frame.ip];
                frame.ip += 1;
                byte
            };

            let result = match Op::from_u8(byte) {
                Some(op) => self.execute_op(env, op),
                None => Err(self.runtime_err(format!("Unknown opcode: 0x{:x}", byte))),
            };

            match result {
                Ok(Flow::Normal) => {}
                Ok(Flow::Halt) => break,
                Err(e) => {
                    if !self.try_recover(env, e) {
                        break;
                    }
                    continue;
                }
            }

            if let Some((started, budget)) = deadline {
                time_check_counter += 1;
                if time_check_counter > TIME_CHECK_INTERVAL {
                    time_check_counter = 0;
                    if started.elapsed() > budget {
                        let e = ScriptError::timeout(
                            self.src_pos(),
                            format!("Execution took more than {} ms", budget.as_millis()),
                        );
                        if !self.try_recover(env, e) {
                            break;
                        }
                        continue;
                    }
                }
            }

            if env.heap.should_sweep() {
                self.run_gc(env);
            }
        }
    }

    /// Walk frames innermost-out for an armed recover handler. When found,
    /// unwind to it, materialise the error as a first-class value with its
    /// traceback, and resume at the handler. Otherwise the error goes to
    /// the queue (with a traceback) and the run ends.
    fn try_recover(&mut self, env: &mut VmEnv<'_>, mut err: ScriptError) -> bool {
        let recoverable = matches!(err.kind, ErrorKind::Runtime | ErrorKind::Timeout)
            && !env.errors.has_errors();
        let recover_ix = if recoverable {
            self.frames
                .iter()
                .rposition(|f| f.recover_ip.is_some() && !f.is_recovering)
        } else {
            None
        };

        let mut traceback = err.traceback.take().unwrap_or_default();
        for frame in self.frames.iter().rev() {
            let name = env
                .heap
                .function_ref(frame.function.handle().expect("function"))
                .map(|f| f.display_name().to_string())
                .unwrap_or_else(|| "anonymous".to_string());
            traceback.append(&name, frame.src_pos());
        }

        match recover_ix {
            Some(ix) => {
                while self.frames.len() > ix + 1 {
                    self.pop_frame();
                }
                let err_obj = env.heap.make_error(&err.message);
                if let Some(h) = err_obj.handle() {
                    env.heap.error_set_traceback(h, traceback);
                }
                if self.push(err_obj).is_err() {
                    err.traceback = Some(Traceback::new());
                    env.errors.add(err);
                    return false;
                }
                let frame = self.frames.last_mut().expect("recover frame");
                frame.ip = frame.recover_ip.expect("recover ip");
                frame.is_recovering = true;
                env.errors.clear();
                true
            }
            None => {
                err.traceback = Some(traceback);
                env.errors.add(err);
                false
            }
        }
    }

    fn run_gc(&mut self, env: &mut VmEnv<'_>) {
        trace!("gc sweep");
        env.heap.unmark_all();
        env.heap.mark_values(env.store.objects());
        env.heap.mark_values(env.constants);
        env.heap.mark_values(&self.globals[..self.globals_count]);
        for frame in &self.frames {
            let function = frame.function;
            env.heap.mark_value(function);
        }
        env.heap.mark_values(&self.stack[..self.sp]);
        env.heap.mark_values(&self.this_stack[..self.this_sp]);
        env.heap.mark_value(self.last_popped);
        env.heap.mark_values(&self.overload_keys);
        env.heap.sweep();
    }

    fn execute_op(&mut self, env: &mut VmEnv<'_>, op: Op) -> Result<Flow, ScriptError> {
        match op {
            Op::Constant => {
                let ix = self.read_u16() as usize;
                let constant = env.constants.get(ix).copied().ok_or_else(|| {
                    self.runtime_err(format!("Constant at {} not found", ix))
                })?;
                self.push(constant)?;
            }
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Or
            | Op::Xor
            | Op::And
            | Op::Lshift
            | Op::Rshift => {
                let right = self.pop();
                let left = self.pop();
                self.execute_binary(env, op, left, right)?;
            }
            Op::Pop => {
                self.pop();
            }
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Compare | Op::CompareEq => {
                let right = self.pop();
                let left = self.pop();
                if !self.try_overload_operator(env, left, right, Op::Compare)? {
                    match env.heap.compare(left, right) {
                        Some(res) => self.push(Value::Number(res))?,
                        None if op == Op::CompareEq => self.push(Value::Number(1.0))?,
                        None => {
                            return Err(self.runtime_err(format!(
                                "Cannot compare {} and {}",
                                left.type_name(),
                                right.type_name()
                            )));
                        }
                    }
                }
            }
            Op::Equal | Op::NotEqual | Op::GreaterThan | Op::GreaterThanEqual => {
                let ordering = self.pop().as_number();
                let res = match op {
                    Op::Equal => dbl_eq(ordering, 0.0),
                    Op::NotEqual => !dbl_eq(ordering, 0.0),
                    Op::GreaterThan => ordering > 0.0,
                    _ => ordering > 0.0 || dbl_eq(ordering, 0.0),
                };
                self.push(Value::Bool(res))?;
            }
            Op::Minus => {
                let operand = self.pop();
                if let Value::Number(n) = operand {
                    self.push(Value::Number(-n))?;
                } else if !self.try_overload_operator(env, operand, Value::Null, Op::Minus)? {
                    return Err(self.runtime_err(format!(
                        "Invalid operand type for MINUS, got {}",
                        operand.type_name()
                    )));
                }
            }
            Op::Bang => {
                let operand = self.pop();
                match operand {
                    Value::Bool(b) => self.push(Value::Bool(!b))?,
                    Value::Null => self.push(Value::Bool(true))?,
                    _ => {
                        if !self.try_overload_operator(env, operand, Value::Null, Op::Bang)? {
                            self.push(Value::Bool(false))?;
                        }
                    }
                }
            }
            Op::Jump => {
                let target = self.read_u16() as usize;
                self.frames.last_mut().expect("frame").ip = target;
            }
            Op::JumpIfFalse => {
                let target = self.read_u16() as usize;
                let test = self.pop();
                if !test.is_truthy() {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }
            Op::JumpIfTrue => {
                let target = self.read_u16() as usize;
                let test = self.pop();
                if test.is_truthy() {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }
            Op::Null => self.push(Value::Null)?,
            Op::DefineModuleGlobal => {
                let ix = self.read_u16() as usize;
                let value = self.pop();
                self.set_global(ix, value)?;
            }
            Op::SetModuleGlobal => {
                let ix = self.read_u16() as usize;
                let new_value = self.pop();
                let old_value = self.get_global(ix)?;
                check_assign(old_value, new_value);
                self.set_global(ix, new_value)?;
            }
            Op::GetModuleGlobal => {
                let ix = self.read_u16() as usize;
                let value = self.get_global(ix)?;
                self.push(value)?;
            }
            Op::Array => {
                let count = self.read_u16() as usize;
                let items = self.stack[self.sp - count..self.sp].to_vec();
                let array = env.heap.make_array_from(items);
                self.set_sp(self.sp - count);
                self.push(array)?;
            }
            Op::MapStart => {
                let _count = self.read_u16();
                let map = env.heap.make_map();
                self.this_push(map)?;
            }
            Op::MapEnd => {
                let kvp_count = self.read_u16() as usize;
                let items_count = kvp_count * 2;
                let map = self.this_pop();
                let Some(mh) = map.handle() else {
                    return Err(self.runtime_err("this stack underflow"));
                };
                for i in (self.sp - items_count..self.sp).step_by(2) {
                    let key = self.stack[i];
                    let value = self.stack[i + 1];
                    if !key.is_hashable() {
                        return Err(self.runtime_err(format!(
                            "Key of type {} is not hashable",
                            key.type_name()
                        )));
                    }
                    env.heap.map_set(mh, key, value);
                }
                self.set_sp(self.sp - items_count);
                self.push(map)?;
            }
            Op::GetThis => {
                let v = self.this_get(0);
                self.push(v)?;
            }
            Op::GetIndex => {
                let index = self.pop();
                let left = self.pop();
                let res = self.get_index(env, left, index)?;
                self.push(res)?;
            }
            Op::GetValueAt => {
                let index = self.pop();
                let left = self.pop();
                let res = self.get_value_at(env, left, index)?;
                self.push(res)?;
            }
            Op::SetIndex => {
                let index = self.pop();
                let left = self.pop();
                let new_value = self.pop();
                self.set_index(env, left, index, new_value)?;
            }
            Op::Call => {
                let num_args = self.read_u8() as usize;
                let callee = self.stack_get(num_args);
                self.call_value(env, callee, num_args)?;
            }
            Op::ReturnValue => {
                let res = self.pop();
                if !self.pop_frame() {
                    return Ok(Flow::Halt);
                }
                self.push(res)?;
            }
            Op::Return => {
                if !self.pop_frame() {
                    self.last_popped = Value::Null;
                    return Ok(Flow::Halt);
                }
                self.push(Value::Null)?;
            }
            Op::DefineLocal => {
                let pos = self.read_u8() as usize;
                let base = self.frames.last().expect("frame").base_pointer;
                let value = self.pop();
                self.stack[base + pos] = value;
            }
            Op::SetLocal => {
                let pos = self.read_u8() as usize;
                let base = self.frames.last().expect("frame").base_pointer;
                let new_value = self.pop();
                let old_value = self.stack[base + pos];
                check_assign(old_value, new_value);
                self.stack[base + pos] = new_value;
            }
            Op::GetLocal => {
                let pos = self.read_u8() as usize;
                let base = self.frames.last().expect("frame").base_pointer;
                let value = self.stack[base + pos];
                self.push(value)?;
            }
            Op::GetApeGlobal => {
                let ix = self.read_u16() as usize;
                let value = env.store.object_at(ix).ok_or_else(|| {
                    self.runtime_err(format!("Global value {} not found", ix))
                })?;
                self.push(value)?;
            }
            Op::Function => {
                let constant_ix = self.read_u16() as usize;
                let num_free = self.read_u8() as usize;
                let constant = env.constants.get(constant_ix).copied().ok_or_else(|| {
                    self.runtime_err(format!("Constant {} not found", constant_ix))
                })?;
                let Value::Function(h) = constant else {
                    return Err(self.runtime_err(format!(
                        "{} is not a function",
                        constant.type_name()
                    )));
                };
                let template = env.heap.function_ref(h).ok_or_else(|| {
                    self.runtime_err("Function constant is gone".to_string())
                })?;
                let data = FunctionData {
                    name: template.name.clone(),
                    code: template.code.clone(),
                    num_locals: template.num_locals,
                    num_args: template.num_args,
                    free_vals: self.stack[self.sp - num_free..self.sp].to_vec(),
                };
                let function = env.heap.make_function(data);
                self.set_sp(self.sp - num_free);
                self.push(function)?;
            }
            Op::GetFree => {
                let free_ix = self.read_u8() as usize;
                let function = self.frames.last().expect("frame").function;
                let value = env
                    .heap
                    .function_free_val(function.handle().expect("function"), free_ix);
                self.push(value)?;
            }
            Op::SetFree => {
                let free_ix = self.read_u8() as usize;
                let value = self.pop();
                let function = self.frames.last().expect("frame").function;
                env.heap
                    .set_function_free_val(function.handle().expect("function"), free_ix, value);
            }
            Op::CurrentFunction => {
                let function = self.frames.last().expect("frame").function;
                self.push(function)?;
            }
            Op::Dup => {
                let value = self.stack_get(0);
                self.push(value)?;
            }
            Op::Len => {
                let value = self.pop();
                let len = match value {
                    Value::Array(h) => env.heap.array_len(h),
                    Value::Map(h) => env.heap.map_len(h),
                    Value::Str(h) => env.heap.str_value(h).len(),
                    _ => {
                        return Err(self.runtime_err(format!(
                            "Cannot get length of {}",
                            value.type_name()
                        )));
                    }
                };
                self.push(Value::Number(len as f64))?;
            }
            Op::Number => {
                let bits = self.read_u64();
                self.push(Value::Number(f64::from_bits(bits)))?;
            }
            Op::SetRecover => {
                let recover_ip = self.read_u16() as usize;
                self.frames.last_mut().expect("frame").recover_ip = Some(recover_ip);
            }
            Op::None => {
                return Err(self.runtime_err("Unknown opcode: 0x0"));
            }
        }
        Ok(Flow::Normal)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn execute_binary(
        &mut self,
        env: &mut VmEnv<'_>,
        op: Op,
        left: Value,
        right: Value,
    ) -> Result<(), ScriptError> {
        if left.is_numeric() && right.is_numeric() {
            let l = left.as_number();
            let r = right.as_number();
            let li = l as i64;
            let ri = r as i64;
            let res = match op {
                Op::Add => l + r,
                Op::Sub => l - r,
                Op::Mul => l * r,
                Op::Div => l / r,
                Op::Mod => l % r,
                Op::Or => (li | ri) as f64,
                Op::Xor => (li ^ ri) as f64,
                Op::And => (li & ri) as f64,
                Op::Lshift => li.wrapping_shl(ri as u32) as f64,
                Op::Rshift => li.wrapping_shr(ri as u32) as f64,
                _ => unreachable!(),
            };
            return self.push(Value::Number(res));
        }
        if op == Op::Add {
            if let (Value::Str(lh), Value::Str(rh)) = (left, right) {
                if env.heap.str_value(lh).is_empty() {
                    return self.push(right);
                }
                if env.heap.str_value(rh).is_empty() {
                    return self.push(left);
                }
                let combined = format!("{}{}", env.heap.str_value(lh), env.heap.str_value(rh));
                let res = env.heap.make_string(&combined);
                return self.push(res);
            }
            if let Value::Array(lh) = left {
                env.heap.array_push(lh, right);
                return self.push(left);
            }
        }
        if self.try_overload_operator(env, left, right, op)? {
            return Ok(());
        }
        Err(self.runtime_err(format!(
            "Invalid operand types for {}, got {} and {}",
            op.def().name,
            left.type_name(),
            right.type_name()
        )))
    }

    /// Before a type error on an arithmetic/comparison/unary opcode with a
    /// map operand, look up the per-opcode method key in the left map then
    /// the right one; a callable found there is invoked with the operands.
    fn try_overload_operator(
        &mut self,
        env: &mut VmEnv<'_>,
        left: Value,
        right: Value,
        op: Op,
    ) -> Result<bool, ScriptError> {
        let left_map = matches!(left, Value::Map(_));
        let right_map = matches!(right, Value::Map(_));
        if !left_map && !right_map {
            return Ok(false);
        }
        let num_operands = if op == Op::Minus || op == Op::Bang { 1 } else { 2 };
        let key = self.overload_keys[op as usize];
        if key.is_null() {
            return Ok(false);
        }
        let mut callee = Value::Null;
        if let Value::Map(h) = left {
            callee = env.heap.map_get(h, key);
        }
        if !callee.is_callable() {
            if let Value::Map(h) = right {
                callee = env.heap.map_get(h, key);
            }
            if !callee.is_callable() {
                return Ok(false);
            }
        }
        self.push(callee)?;
        self.push(left)?;
        if num_operands == 2 {
            self.push(right)?;
        }
        self.call_value(env, callee, num_operands)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    fn get_index(
        &mut self,
        env: &mut VmEnv<'_>,
        left: Value,
        index: Value,
    ) -> Result<Value, ScriptError> {
        match left {
            Value::Array(h) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_err(format!(
                        "Cannot index {} with {}",
                        left.type_name(),
                        index.type_name()
                    )));
                };
                let mut ix = n as i64;
                if ix < 0 {
                    ix += env.heap.array_len(h) as i64;
                }
                Ok(env.heap.array_get(h, ix))
            }
            Value::Map(h) => Ok(env.heap.map_get(h, index)),
            Value::Str(h) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_err(format!(
                        "Cannot index {} with {}",
                        left.type_name(),
                        index.type_name()
                    )));
                };
                let ix = n as i64;
                let byte = (ix >= 0)
                    .then(|| env.heap.str_value(h).as_bytes().get(ix as usize).copied())
                    .flatten();
                match byte {
                    Some(b) => {
                        let s = String::from_utf8_lossy(&[b]).into_owned();
                        Ok(env.heap.make_string(&s))
                    }
                    None => Ok(Value::Null),
                }
            }
            _ => Err(self.runtime_err(format!(
                "Type {} is not indexable",
                left.type_name()
            ))),
        }
    }

    /// Integer-position read used by foreach: array element, `{key, value}`
    /// pair for maps, one-character string for strings.
    fn get_value_at(
        &mut self,
        env: &mut VmEnv<'_>,
        left: Value,
        index: Value,
    ) -> Result<Value, ScriptError> {
        let Value::Number(n) = index else {
            return Err(self.runtime_err(format!(
                "Cannot index {} with {}",
                left.type_name(),
                index.type_name()
            )));
        };
        let ix = n as i64;
        match left {
            Value::Array(h) => Ok(env.heap.array_get(h, ix)),
            Value::Map(h) => {
                if ix < 0 {
                    return Ok(Value::Null);
                }
                Ok(env.heap.map_kv_pair_at(h, ix as usize))
            }
            Value::Str(h) => {
                let byte = (ix >= 0)
                    .then(|| env.heap.str_value(h).as_bytes().get(ix as usize).copied())
                    .flatten();
                match byte {
                    Some(b) => {
                        let s = String::from_utf8_lossy(&[b]).into_owned();
                        Ok(env.heap.make_string(&s))
                    }
                    None => Ok(Value::Null),
                }
            }
            _ => Err(self.runtime_err(format!(
                "Type {} is not indexable",
                left.type_name()
            ))),
        }
    }

    fn set_index(
        &mut self,
        env: &mut VmEnv<'_>,
        left: Value,
        index: Value,
        new_value: Value,
    ) -> Result<(), ScriptError> {
        match left {
            Value::Array(h) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_err(format!(
                        "Cannot index {} with {}",
                        left.type_name(),
                        index.type_name()
                    )));
                };
                if !env.heap.array_set(h, n as i64, new_value) {
                    return Err(
                        self.runtime_err("Setting array item failed (out of bounds?)")
                    );
                }
                Ok(())
            }
            Value::Map(h) => {
                if !index.is_hashable() {
                    return Err(self.runtime_err(format!(
                        "Key of type {} is not hashable",
                        index.type_name()
                    )));
                }
                let old_value = env.heap.map_get(h, index);
                check_assign(old_value, new_value);
                env.heap.map_set(h, index, new_value);
                Ok(())
            }
            _ => Err(self.runtime_err(format!(
                "Type {} is not indexable",
                left.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(
        &mut self,
        env: &mut VmEnv<'_>,
        callee: Value,
        num_args: usize,
    ) -> Result<(), ScriptError> {
        match callee {
            Value::Function(h) => {
                let function = env
                    .heap
                    .function_ref(h)
                    .ok_or_else(|| self.runtime_err("FUNCTION object is not callable"))?;
                if num_args != function.num_args {
                    return Err(self.runtime_err(format!(
                        "Invalid number of arguments to \"{}\", expected {}, got {}",
                        function.display_name(),
                        function.num_args,
                        num_args
                    )));
                }
                let code = function.code.clone();
                let num_locals = function.num_locals;
                let frame = Frame::new(callee, code, self.sp - num_args);
                self.push_frame(frame, num_locals)
            }
            Value::Native(_) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                let src_pos = self.src_pos();
                let res = self.call_native(env, callee, src_pos, &args)?;
                self.set_sp(self.sp - num_args - 1);
                self.push(res)
            }
            _ => Err(self.runtime_err(format!(
                "{} object is not callable",
                callee.type_name()
            ))),
        }
    }

    /// Invoke a native function. A raised error propagates with the
    /// native's name prepended to the traceback; a returned `error` value
    /// gets a traceback attached but does not halt the VM.
    fn call_native(
        &mut self,
        env: &mut VmEnv<'_>,
        callee: Value,
        src_pos: Pos,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        let handle = callee.handle().expect("native function");
        let (name, func) = {
            let native = env
                .heap
                .native_ref(handle)
                .ok_or_else(|| self.runtime_err("NATIVE_FUNCTION object is not callable"))?;
            (native.name.clone(), native.func.clone())
        };
        match func(env.heap, args) {
            Err(native_err) => {
                let mut err = ScriptError::new(native_err.kind, src_pos, native_err.message);
                // `crash` raises on the script's behalf; its own name does
                // not belong in the traceback
                if name != "crash" {
                    let mut tb = Traceback::new();
                    tb.append(&name, Pos::invalid());
                    err.traceback = Some(tb);
                }
                Err(err)
            }
            Ok(res) => {
                if let Value::Error(eh) = res {
                    if env.heap.error_traceback(eh).is_none() {
                        let mut tb = Traceback::new();
                        // the error builtin fabricates a value rather than
                        // failing itself
                        if name != "error" {
                            tb.append(&name, Pos::invalid());
                        }
                        for frame in self.frames.iter().rev() {
                            let fname = env
                                .heap
                                .function_ref(frame.function.handle().expect("function"))
                                .map(|f| f.display_name().to_string())
                                .unwrap_or_else(|| "anonymous".to_string());
                            tb.append(&fname, frame.src_pos());
                        }
                        env.heap.error_set_traceback(eh, tb);
                    }
                }
                Ok(res)
            }
        }
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    fn set_global(&mut self, ix: usize, value: Value) -> Result<(), ScriptError> {
        if ix >= MAX_GLOBALS {
            return Err(self.runtime_err("Global write out of range"));
        }
        self.globals[ix] = value;
        if ix >= self.globals_count {
            self.globals_count = ix + 1;
        }
        Ok(())
    }

    fn get_global(&self, ix: usize) -> Result<Value, ScriptError> {
        if ix >= MAX_GLOBALS {
            return Err(self.runtime_err("Global read out of range"));
        }
        Ok(self.globals[ix])
    }

    /// Resolve a module global by slot for the embedding API.
    pub fn module_global(&self, ix: usize) -> Option<Value> {
        (ix < self.globals_count).then(|| self.globals[ix])
    }
}

/// Cross-type reassignment check. The permissive rule is deliberate:
/// any type may replace any other, and null on either side always passes.
fn check_assign(_old_value: Value, _new_value: Value) -> bool {
    true
}

fn dbl_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}
