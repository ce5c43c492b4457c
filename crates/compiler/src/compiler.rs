//! Single-pass AST → bytecode compiler.
//!
//! The compiler maintains two stacks: *compilation scopes* (one per
//! function being compiled, each owning its bytecode, source positions and
//! break/continue fixup stacks) and *file scopes* (one per source file in
//! the import chain, each owning its symbol table chain and loaded-module
//! set). Source positions are duplicated per emitted byte from a positions
//! stack so every instruction maps back to source.
//!
//! A failed compilation must leave the compiler exactly as it found it
//! (constants, modules, symbol tables), so `compile` snapshots that state
//! up front and restores it on error.

use crate::ast::{CodeBlock, Expr, Expression, FnLiteral, Ident, Operator, Statement, Stmt};
use crate::global_store::GlobalStore;
use crate::opcode::{self, Op};
use crate::optimiser::optimise;
use crate::parser::Parser;
use crate::symbol_table::{Symbol, SymbolKind, SymbolTable};
use ape_core::{CompiledCode, FunctionData, Heap, Pos, ScriptError, SourceFile, Value};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Everything the compiler borrows from its surroundings for one
/// compilation: the heap (constants are heap objects), the host globals
/// (name resolution), and the host configuration that affects compilation.
pub struct CompileEnv<'a> {
    pub heap: &'a mut Heap,
    pub store: &'a GlobalStore,
    pub repl_mode: bool,
    pub read_file: Option<&'a dyn Fn(&str) -> Option<String>>,
}

/// A compiled module: its short name and the exported top-level symbols,
/// re-bound in importers as `name::symbol`.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub symbols: Vec<Symbol>,
}

impl Module {
    fn add_symbol(&mut self, symbol: &Symbol) {
        self.symbols.push(Symbol::new(
            format!("{}::{}", self.name, symbol.name),
            SymbolKind::ModuleGlobal,
            symbol.index,
            false,
        ));
    }
}

#[derive(Debug, Default)]
struct CompilationScope {
    bytecode: Vec<u8>,
    src_positions: Vec<Pos>,
    break_ips: Vec<usize>,
    continue_ips: Vec<usize>,
    last_opcode: Op,
}

#[derive(Debug)]
struct FileScope {
    file: Rc<SourceFile>,
    loaded_module_names: Vec<String>,
    symbol_table: SymbolTable,
}

struct Snapshot {
    constants_len: usize,
    string_constants_positions: HashMap<String, u16>,
    modules: HashMap<String, Module>,
    symbol_table: SymbolTable,
    loaded_module_names: Vec<String>,
    file: Rc<SourceFile>,
}

pub struct Compiler {
    constants: Vec<Value>,
    string_constants_positions: HashMap<String, u16>,
    modules: HashMap<String, Module>,
    file_scopes: Vec<FileScope>,
    scopes: Vec<CompilationScope>,
    src_positions_stack: Vec<Pos>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            constants: Vec::new(),
            string_constants_positions: HashMap::new(),
            modules: HashMap::new(),
            file_scopes: vec![FileScope {
                file: Rc::new(SourceFile::without_source("none")),
                loaded_module_names: Vec::new(),
                symbol_table: SymbolTable::new(0),
            }],
            scopes: vec![CompilationScope::default()],
            src_positions_stack: Vec::new(),
        }
    }

    /// The constant pool. Roots for the GC, operands for the VM.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Resolve a name in the outermost symbol table (module globals and
    /// host globals). Used by the embedding API's by-name lookup.
    pub fn resolve_global(&mut self, store: &GlobalStore, name: &str) -> Option<Symbol> {
        self.file_scopes
            .last_mut()
            .and_then(|fs| fs.symbol_table.resolve(store, name))
    }

    /// Compile a source string against the persistent compiler state
    /// (symbol tables, constants and module cache survive across calls so
    /// a REPL accumulates definitions). On error the state is rolled back
    /// to exactly what it was before the call.
    pub fn compile(
        &mut self,
        env: &mut CompileEnv<'_>,
        code: &str,
    ) -> Result<Rc<CompiledCode>, ScriptError> {
        debug_assert_eq!(self.scopes.len(), 1);
        debug_assert_eq!(self.file_scopes.len(), 1);
        let scope = self.scopes.last_mut().expect("compilation scope");
        scope.bytecode.clear();
        scope.src_positions.clear();
        scope.break_ips.clear();
        scope.continue_ips.clear();
        self.src_positions_stack.clear();

        let snapshot = self.snapshot();
        match self.compile_source(env, code) {
            Ok(()) => {
                let scope = self.scopes.last_mut().expect("compilation scope");
                let code = CompiledCode::new(
                    std::mem::take(&mut scope.bytecode),
                    std::mem::take(&mut scope.src_positions),
                );
                Ok(Rc::new(code))
            }
            Err(e) => {
                self.restore(snapshot);
                Err(e)
            }
        }
    }

    /// Read a file through the host hook and compile it.
    pub fn compile_file(
        &mut self,
        env: &mut CompileEnv<'_>,
        path: &str,
    ) -> Result<Rc<CompiledCode>, ScriptError> {
        let read_file = env.read_file.ok_or_else(|| {
            ScriptError::compilation(Pos::invalid(), "File read function not configured")
        })?;
        let code = read_file(path).ok_or_else(|| {
            ScriptError::compilation(Pos::invalid(), format!("Reading file \"{}\" failed", path))
        })?;

        let prev_file = self.file_scopes[0].file.clone();
        self.file_scopes[0].file = Rc::new(SourceFile::without_source(path));
        let result = self.compile(env, &code);
        self.file_scopes[0].file = prev_file;
        result
    }

    // ------------------------------------------------------------------
    // State management
    // ------------------------------------------------------------------

    fn snapshot(&self) -> Snapshot {
        let top = &self.file_scopes[0];
        Snapshot {
            constants_len: self.constants.len(),
            string_constants_positions: self.string_constants_positions.clone(),
            modules: self.modules.clone(),
            symbol_table: top.symbol_table.clone(),
            loaded_module_names: top.loaded_module_names.clone(),
            file: top.file.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.constants.truncate(snapshot.constants_len);
        self.string_constants_positions = snapshot.string_constants_positions;
        self.modules = snapshot.modules;
        self.file_scopes.truncate(1);
        let top = &mut self.file_scopes[0];
        top.symbol_table = snapshot.symbol_table;
        top.loaded_module_names = snapshot.loaded_module_names;
        top.file = snapshot.file;
        self.scopes = vec![CompilationScope::default()];
        self.src_positions_stack.clear();
    }

    fn compile_source(&mut self, env: &mut CompileEnv<'_>, code: &str) -> Result<(), ScriptError> {
        let path = self.file_scopes.last().expect("file scope").file.path.clone();
        let file = Rc::new(SourceFile::new(&path, code));
        self.file_scopes.last_mut().expect("file scope").file = file.clone();
        let statements = Parser::parse_all(code, Some(file), env.repl_mode)?;
        self.compile_statements(env, &statements)
    }

    fn compile_statements(
        &mut self,
        env: &mut CompileEnv<'_>,
        statements: &[Stmt],
    ) -> Result<(), ScriptError> {
        for stmt in statements {
            self.compile_statement(env, stmt)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compilation scope")
    }

    fn symbol_table(&mut self) -> &mut SymbolTable {
        &mut self
            .file_scopes
            .last_mut()
            .expect("file scope")
            .symbol_table
    }

    fn ip(&self) -> usize {
        self.scopes.last().expect("compilation scope").bytecode.len()
    }

    fn emit(&mut self, op: Op, operands: &[u64]) -> usize {
        let ip = self.ip();
        let pos = self
            .src_positions_stack
            .last()
            .cloned()
            .unwrap_or_else(Pos::invalid);
        let scope = self.scope_mut();
        let len = opcode::make(op, operands, &mut scope.bytecode);
        for _ in 0..len {
            scope.src_positions.push(pos.clone());
        }
        scope.last_opcode = op;
        ip
    }

    fn patch_u16(&mut self, ip: usize, operand: u16) {
        opcode::patch_u16(&mut self.scope_mut().bytecode, ip, operand);
    }

    fn last_opcode_is(&self, op: Op) -> bool {
        self.scopes.last().expect("compilation scope").last_opcode == op
    }

    fn add_constant(&mut self, pos: &Pos, value: Value) -> Result<u64, ScriptError> {
        if self.constants.len() > u16::MAX as usize {
            return Err(ScriptError::compilation(pos.clone(), "Too many constants"));
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u64)
    }

    fn define_symbol(
        &mut self,
        env: &CompileEnv<'_>,
        pos: &Pos,
        name: &str,
        assignable: bool,
        can_shadow: bool,
    ) -> Result<Symbol, ScriptError> {
        let store = env.store;
        let table = self.symbol_table();
        if !can_shadow && !table.is_top_global_scope() && table.resolve(store, name).is_some() {
            return Err(ScriptError::compilation(
                pos.clone(),
                format!("Symbol \"{}\" is already defined", name),
            ));
        }
        table.define(store, name, assignable).ok_or_else(|| {
            ScriptError::compilation(pos.clone(), format!("Cannot define symbol \"{}\"", name))
        })
    }

    fn read_symbol(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                self.emit(Op::GetModuleGlobal, &[symbol.index as u64]);
            }
            SymbolKind::ApeGlobal => {
                self.emit(Op::GetApeGlobal, &[symbol.index as u64]);
            }
            SymbolKind::Local => {
                self.emit(Op::GetLocal, &[symbol.index as u64]);
            }
            SymbolKind::Free => {
                self.emit(Op::GetFree, &[symbol.index as u64]);
            }
            SymbolKind::FunctionSelf => {
                self.emit(Op::CurrentFunction, &[]);
            }
            SymbolKind::This => {
                self.emit(Op::GetThis, &[]);
            }
        }
    }

    fn write_symbol(&mut self, pos: &Pos, symbol: &Symbol, define: bool) -> Result<(), ScriptError> {
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                if define {
                    self.emit(Op::DefineModuleGlobal, &[symbol.index as u64]);
                } else {
                    self.emit(Op::SetModuleGlobal, &[symbol.index as u64]);
                }
                Ok(())
            }
            SymbolKind::Local => {
                if define {
                    self.emit(Op::DefineLocal, &[symbol.index as u64]);
                } else {
                    self.emit(Op::SetLocal, &[symbol.index as u64]);
                }
                Ok(())
            }
            SymbolKind::Free => {
                self.emit(Op::SetFree, &[symbol.index as u64]);
                Ok(())
            }
            _ => Err(ScriptError::compilation(
                pos.clone(),
                format!("Symbol \"{}\" is not assignable", symbol.name),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compile_statement(&mut self, env: &mut CompileEnv<'_>, stmt: &Stmt) -> Result<(), ScriptError> {
        self.src_positions_stack.push(stmt.pos.clone());
        let result = self.compile_statement_inner(env, stmt);
        self.src_positions_stack.pop();
        result
    }

    fn compile_statement_inner(
        &mut self,
        env: &mut CompileEnv<'_>,
        stmt: &Stmt,
    ) -> Result<(), ScriptError> {
        match &stmt.kind {
            Statement::Expression(expr) => {
                self.compile_expression(env, expr)?;
                self.emit(Op::Pop, &[]);
            }
            Statement::Define {
                name,
                value,
                assignable,
            } => {
                self.compile_expression(env, value)?;
                let symbol = self.define_symbol(env, &name.pos, &name.name, *assignable, false)?;
                self.write_symbol(&name.pos, &symbol, true)?;
            }
            Statement::If { cases, alternative } => {
                let mut jump_to_end_ips = Vec::new();
                for (i, case) in cases.iter().enumerate() {
                    self.compile_expression(env, &case.test)?;
                    let next_case_jump_ip = self.emit(Op::JumpIfFalse, &[0xbeef]);
                    self.compile_code_block(env, &case.consequence)?;
                    // the final case falls through to the end
                    if i < cases.len() - 1 || alternative.is_some() {
                        jump_to_end_ips.push(self.emit(Op::Jump, &[0xbeef]));
                    }
                    let after_case_ip = self.ip();
                    self.patch_u16(next_case_jump_ip + 1, after_case_ip as u16);
                }
                if let Some(alternative) = alternative {
                    self.compile_code_block(env, alternative)?;
                }
                let after_alt_ip = self.ip();
                for ip in jump_to_end_ips {
                    self.patch_u16(ip + 1, after_alt_ip as u16);
                }
            }
            Statement::Return(value) => {
                if self.scopes.len() == 1 {
                    return Err(ScriptError::compilation(
                        stmt.pos.clone(),
                        "Nothing to return from",
                    ));
                }
                match value {
                    Some(expr) => {
                        self.compile_expression(env, expr)?;
                        self.emit(Op::ReturnValue, &[]);
                    }
                    None => {
                        self.emit(Op::Return, &[]);
                    }
                }
            }
            Statement::While { test, body } => {
                let before_test_ip = self.ip();
                self.compile_expression(env, test)?;
                let after_test_ip = self.ip();
                self.emit(Op::JumpIfTrue, &[(after_test_ip + 6) as u64]);
                let jump_to_after_body_ip = self.emit(Op::Jump, &[0xdead]);
                self.scope_mut().continue_ips.push(before_test_ip);
                self.scope_mut().break_ips.push(jump_to_after_body_ip);
                self.compile_code_block(env, body)?;
                self.scope_mut().break_ips.pop();
                self.scope_mut().continue_ips.pop();
                self.emit(Op::Jump, &[before_test_ip as u64]);
                let after_body_ip = self.ip();
                self.patch_u16(jump_to_after_body_ip + 1, after_body_ip as u16);
            }
            Statement::Break => {
                let break_ip = self.scopes.last().expect("scope").break_ips.last().copied();
                let break_ip = break_ip.ok_or_else(|| {
                    ScriptError::compilation(stmt.pos.clone(), "Nothing to break from")
                })?;
                self.emit(Op::Jump, &[break_ip as u64]);
            }
            Statement::Continue => {
                let continue_ip = self
                    .scopes
                    .last()
                    .expect("scope")
                    .continue_ips
                    .last()
                    .copied();
                let continue_ip = continue_ip.ok_or_else(|| {
                    ScriptError::compilation(stmt.pos.clone(), "Nothing to continue from")
                })?;
                self.emit(Op::Jump, &[continue_ip as u64]);
            }
            Statement::Foreach {
                iterator,
                source,
                body,
            } => self.compile_foreach(env, stmt, iterator, source, body)?,
            Statement::For {
                init,
                test,
                update,
                body,
            } => self.compile_for(env, init.as_deref(), test.as_ref(), update.as_ref(), body)?,
            Statement::Block(block) => {
                self.compile_code_block(env, block)?;
            }
            Statement::Import { path } => {
                self.import_module(env, &stmt.pos, path)?;
            }
            Statement::Recover { error_ident, body } => {
                self.compile_recover(env, stmt, error_ident, body)?;
            }
        }
        Ok(())
    }

    /// `for (x in seq)` desugars to a hidden index and source snapshot:
    ///
    /// ```text
    ///   @i = 0
    ///   @source = <source>
    ///   loop: x = @source[@i]  (GET_VALUE_AT)
    ///         <body>
    ///         @i = @i + 1; if @i == len(@source) exit
    /// ```
    fn compile_foreach(
        &mut self,
        env: &mut CompileEnv<'_>,
        stmt: &Stmt,
        iterator: &Ident,
        source: &Expr,
        body: &CodeBlock,
    ) -> Result<(), ScriptError> {
        self.symbol_table().push_block_scope();

        // init
        let index_symbol = self.define_symbol(env, &stmt.pos, "@i", false, true)?;
        self.emit(Op::Number, &[0]);
        self.write_symbol(&stmt.pos, &index_symbol, true)?;

        let source_symbol = if let Expression::Ident(ident) = &source.kind {
            let store = env.store;
            self.symbol_table().resolve(store, &ident.name).ok_or_else(|| {
                ScriptError::compilation(
                    source.pos.clone(),
                    format!("Symbol \"{}\" could not be resolved", ident.name),
                )
            })?
        } else {
            self.compile_expression(env, source)?;
            let symbol = self.define_symbol(env, &source.pos, "@source", false, true)?;
            self.write_symbol(&source.pos, &symbol, true)?;
            symbol
        };

        // update
        let jump_to_after_update_ip = self.emit(Op::Jump, &[0xbeef]);
        let update_ip = self.ip();
        self.read_symbol(&index_symbol);
        self.emit(Op::Number, &[1f64.to_bits()]);
        self.emit(Op::Add, &[]);
        self.write_symbol(&stmt.pos, &index_symbol, false)?;
        let after_update_ip = self.ip();
        self.patch_u16(jump_to_after_update_ip + 1, after_update_ip as u16);

        // test
        self.src_positions_stack.push(source.pos.clone());
        self.read_symbol(&source_symbol);
        self.emit(Op::Len, &[]);
        self.src_positions_stack.pop();
        self.read_symbol(&index_symbol);
        self.emit(Op::Compare, &[]);
        self.emit(Op::Equal, &[]);
        let after_test_ip = self.ip();
        self.emit(Op::JumpIfFalse, &[(after_test_ip + 6) as u64]);
        let jump_to_after_body_ip = self.emit(Op::Jump, &[0xdead]);

        self.read_symbol(&source_symbol);
        self.read_symbol(&index_symbol);
        self.emit(Op::GetValueAt, &[]);
        let iter_symbol = self.define_symbol(env, &iterator.pos, &iterator.name, false, false)?;
        self.write_symbol(&iterator.pos, &iter_symbol, true)?;

        // body
        self.scope_mut().continue_ips.push(update_ip);
        self.scope_mut().break_ips.push(jump_to_after_body_ip);
        self.compile_code_block(env, body)?;
        self.scope_mut().break_ips.pop();
        self.scope_mut().continue_ips.pop();

        self.emit(Op::Jump, &[update_ip as u64]);
        let after_body_ip = self.ip();
        self.patch_u16(jump_to_after_body_ip + 1, after_body_ip as u16);

        self.symbol_table().pop_block_scope();
        Ok(())
    }

    fn compile_for(
        &mut self,
        env: &mut CompileEnv<'_>,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &CodeBlock,
    ) -> Result<(), ScriptError> {
        self.symbol_table().push_block_scope();

        // init
        let mut jump_to_after_update_ip = 0;
        if let Some(init) = init {
            self.compile_statement(env, init)?;
            jump_to_after_update_ip = self.emit(Op::Jump, &[0xbeef]);
        }

        // update
        let update_ip = self.ip();
        if let Some(update) = update {
            self.compile_expression(env, update)?;
            self.emit(Op::Pop, &[]);
        }
        if init.is_some() {
            let after_update_ip = self.ip();
            self.patch_u16(jump_to_after_update_ip + 1, after_update_ip as u16);
        }

        // test
        match test {
            Some(test) => self.compile_expression(env, test)?,
            None => {
                self.emit(Op::True, &[]);
            }
        }
        let after_test_ip = self.ip();
        self.emit(Op::JumpIfTrue, &[(after_test_ip + 6) as u64]);
        let jump_to_after_body_ip = self.emit(Op::Jump, &[0xdead]);

        // body
        self.scope_mut().continue_ips.push(update_ip);
        self.scope_mut().break_ips.push(jump_to_after_body_ip);
        self.compile_code_block(env, body)?;
        self.scope_mut().break_ips.pop();
        self.scope_mut().continue_ips.pop();

        self.emit(Op::Jump, &[update_ip as u64]);
        let after_body_ip = self.ip();
        self.patch_u16(jump_to_after_body_ip + 1, after_body_ip as u16);

        self.symbol_table().pop_block_scope();
        Ok(())
    }

    /// `recover (e) { ... }` installs a handler ip in the current frame and
    /// jumps over the handler body. Only allowed inside a function, at the
    /// top of a block, and the handler must leave through `return`.
    fn compile_recover(
        &mut self,
        env: &mut CompileEnv<'_>,
        stmt: &Stmt,
        error_ident: &Ident,
        body: &CodeBlock,
    ) -> Result<(), ScriptError> {
        if self.symbol_table().is_module_global_scope() {
            return Err(ScriptError::compilation(
                stmt.pos.clone(),
                "Recover statement cannot be defined in global scope",
            ));
        }
        if !self.symbol_table().is_top_block_scope() {
            return Err(ScriptError::compilation(
                stmt.pos.clone(),
                "Recover statement cannot be defined within other statements",
            ));
        }

        let recover_ip = self.emit(Op::SetRecover, &[0xbeef]);
        let jump_to_after_recover_ip = self.emit(Op::Jump, &[0xbeef]);
        let after_jump_to_recover_ip = self.ip();
        self.patch_u16(recover_ip + 1, after_jump_to_recover_ip as u16);

        self.symbol_table().push_block_scope();
        let error_symbol =
            self.define_symbol(env, &error_ident.pos, &error_ident.name, false, false)?;
        self.write_symbol(&error_ident.pos, &error_symbol, true)?;
        self.compile_code_block(env, body)?;
        if !self.last_opcode_is(Op::Return) && !self.last_opcode_is(Op::ReturnValue) {
            return Err(ScriptError::compilation(
                stmt.pos.clone(),
                "Recover body must end with a return statement",
            ));
        }
        self.symbol_table().pop_block_scope();

        let after_recover_ip = self.ip();
        self.patch_u16(jump_to_after_recover_ip + 1, after_recover_ip as u16);
        Ok(())
    }

    fn compile_code_block(
        &mut self,
        env: &mut CompileEnv<'_>,
        block: &CodeBlock,
    ) -> Result<(), ScriptError> {
        self.symbol_table().push_block_scope();
        if block.statements.is_empty() {
            self.emit(Op::Null, &[]);
            self.emit(Op::Pop, &[]);
        }
        for stmt in &block.statements {
            self.compile_statement(env, stmt)?;
        }
        self.symbol_table().pop_block_scope();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn compile_expression(&mut self, env: &mut CompileEnv<'_>, expr: &Expr) -> Result<(), ScriptError> {
        let folded = optimise(expr);
        let expr = folded.as_ref().unwrap_or(expr);
        self.src_positions_stack.push(expr.pos.clone());
        let result = self.compile_expression_inner(env, expr);
        self.src_positions_stack.pop();
        result
    }

    fn compile_expression_inner(
        &mut self,
        env: &mut CompileEnv<'_>,
        expr: &Expr,
    ) -> Result<(), ScriptError> {
        match &expr.kind {
            Expression::Infix { op, left, right } => {
                let (opcode, rearrange) = match op {
                    Operator::Plus => (Op::Add, false),
                    Operator::Minus => (Op::Sub, false),
                    Operator::Asterisk => (Op::Mul, false),
                    Operator::Slash => (Op::Div, false),
                    Operator::Modulus => (Op::Mod, false),
                    Operator::Eq => (Op::Equal, false),
                    Operator::NotEq => (Op::NotEqual, false),
                    Operator::Gt => (Op::GreaterThan, false),
                    Operator::Gte => (Op::GreaterThanEqual, false),
                    Operator::Lt => (Op::GreaterThan, true),
                    Operator::Lte => (Op::GreaterThanEqual, true),
                    Operator::BitOr => (Op::Or, false),
                    Operator::BitXor => (Op::Xor, false),
                    Operator::BitAnd => (Op::And, false),
                    Operator::Lshift => (Op::Lshift, false),
                    Operator::Rshift => (Op::Rshift, false),
                    _ => {
                        return Err(ScriptError::compilation(
                            expr.pos.clone(),
                            "Unknown infix operator",
                        ))
                    }
                };
                let (first, second) = if rearrange {
                    (right, left)
                } else {
                    (left, right)
                };
                self.compile_expression(env, first)?;
                self.compile_expression(env, second)?;
                match op {
                    Operator::Eq | Operator::NotEq => {
                        self.emit(Op::CompareEq, &[]);
                    }
                    Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                        self.emit(Op::Compare, &[]);
                    }
                    _ => {}
                }
                self.emit(opcode, &[]);
            }
            Expression::NumberLiteral(n) => {
                self.emit(Op::Number, &[n.to_bits()]);
            }
            Expression::StringLiteral(s) => {
                let pos_ix = match self.string_constants_positions.get(s) {
                    Some(ix) => *ix as u64,
                    None => {
                        let value = env.heap.make_string(s);
                        let ix = self.add_constant(&expr.pos, value)?;
                        self.string_constants_positions.insert(s.clone(), ix as u16);
                        ix
                    }
                };
                self.emit(Op::Constant, &[pos_ix]);
            }
            Expression::NullLiteral => {
                self.emit(Op::Null, &[]);
            }
            Expression::BoolLiteral(b) => {
                self.emit(if *b { Op::True } else { Op::False }, &[]);
            }
            Expression::ArrayLiteral(items) => {
                for item in items {
                    self.compile_expression(env, item)?;
                }
                self.emit(Op::Array, &[items.len() as u64]);
            }
            Expression::MapLiteral { keys, values } => {
                self.emit(Op::MapStart, &[keys.len() as u64]);
                for (key, value) in keys.iter().zip(values) {
                    self.compile_expression(env, key)?;
                    self.compile_expression(env, value)?;
                }
                self.emit(Op::MapEnd, &[keys.len() as u64]);
            }
            Expression::Prefix { op, right } => {
                self.compile_expression(env, right)?;
                let opcode = match op {
                    Operator::Minus => Op::Minus,
                    Operator::Bang => Op::Bang,
                    _ => {
                        return Err(ScriptError::compilation(
                            expr.pos.clone(),
                            "Unknown prefix operator",
                        ))
                    }
                };
                self.emit(opcode, &[]);
            }
            Expression::Ident(ident) => {
                let store = env.store;
                let symbol = self
                    .symbol_table()
                    .resolve(store, &ident.name)
                    .ok_or_else(|| {
                        ScriptError::compilation(
                            ident.pos.clone(),
                            format!("Symbol \"{}\" could not be resolved", ident.name),
                        )
                    })?;
                self.read_symbol(&symbol);
            }
            Expression::Index { left, index } => {
                self.compile_expression(env, left)?;
                self.compile_expression(env, index)?;
                self.emit(Op::GetIndex, &[]);
            }
            Expression::FnLiteral(fn_lit) => {
                self.compile_fn_literal(env, expr, fn_lit)?;
            }
            Expression::Call { function, args } => {
                self.compile_expression(env, function)?;
                for arg in args {
                    self.compile_expression(env, arg)?;
                }
                self.emit(Op::Call, &[args.len() as u64]);
            }
            Expression::Assign {
                dest,
                source,
                is_postfix,
            } => {
                self.compile_assign(env, dest, source, *is_postfix)?;
            }
            Expression::Logical { op, left, right } => {
                self.compile_expression(env, left)?;
                self.emit(Op::Dup, &[]);
                let after_left_jump_ip = if *op == Operator::LogicalAnd {
                    self.emit(Op::JumpIfFalse, &[0xbeef])
                } else {
                    self.emit(Op::JumpIfTrue, &[0xbeef])
                };
                self.emit(Op::Pop, &[]);
                self.compile_expression(env, right)?;
                let after_right_ip = self.ip();
                self.patch_u16(after_left_jump_ip + 1, after_right_ip as u16);
            }
            Expression::Ternary {
                test,
                if_true,
                if_false,
            } => {
                self.compile_expression(env, test)?;
                let else_jump_ip = self.emit(Op::JumpIfFalse, &[0xbeef]);
                self.compile_expression(env, if_true)?;
                let end_jump_ip = self.emit(Op::Jump, &[0xbeef]);
                let else_ip = self.ip();
                self.patch_u16(else_jump_ip + 1, else_ip as u16);
                self.compile_expression(env, if_false)?;
                let end_ip = self.ip();
                self.patch_u16(end_jump_ip + 1, end_ip as u16);
            }
        }
        Ok(())
    }

    fn compile_fn_literal(
        &mut self,
        env: &mut CompileEnv<'_>,
        expr: &Expr,
        fn_lit: &FnLiteral,
    ) -> Result<(), ScriptError> {
        self.scopes.push(CompilationScope::default());
        SymbolTable::push_function_scope(self.symbol_table());

        let result = (|| -> Result<(Vec<Symbol>, usize, CompiledCode), ScriptError> {
            if let Some(name) = &fn_lit.name {
                self.symbol_table()
                    .define_function_name(name, false)
                    .ok_or_else(|| {
                        ScriptError::compilation(
                            expr.pos.clone(),
                            format!("Cannot define symbol \"{}\"", name),
                        )
                    })?;
            }
            self.symbol_table().define_this();
            for param in &fn_lit.params {
                self.define_symbol(env, &param.pos, &param.name, true, false)?;
            }

            self.compile_statements(env, &fn_lit.body.statements)?;
            if !self.last_opcode_is(Op::ReturnValue) && !self.last_opcode_is(Op::Return) {
                self.emit(Op::Return, &[]);
            }

            let free_symbols = self.symbol_table().take_free_symbols();
            let num_locals = self.symbol_table().max_num_definitions;
            let scope = self.scopes.last_mut().expect("fn scope");
            let code = CompiledCode::new(
                std::mem::take(&mut scope.bytecode),
                std::mem::take(&mut scope.src_positions),
            );
            Ok((free_symbols, num_locals, code))
        })();

        self.scopes.pop();
        SymbolTable::pop_function_scope(self.symbol_table());
        let (free_symbols, num_locals, code) = result?;

        let function = env.heap.make_function(FunctionData {
            name: fn_lit.name.clone(),
            code: Rc::new(code),
            num_locals,
            num_args: fn_lit.params.len(),
            free_vals: Vec::new(),
        });
        for symbol in &free_symbols {
            self.read_symbol(symbol);
        }
        let constant_ix = self.add_constant(&expr.pos, function)?;
        self.emit(Op::Function, &[constant_ix, free_symbols.len() as u64]);
        Ok(())
    }

    fn compile_assign(
        &mut self,
        env: &mut CompileEnv<'_>,
        dest: &Expr,
        source: &Expr,
        is_postfix: bool,
    ) -> Result<(), ScriptError> {
        if !matches!(dest.kind, Expression::Ident(_) | Expression::Index { .. }) {
            return Err(ScriptError::compilation(
                dest.pos.clone(),
                "Expression is not assignable",
            ));
        }

        if is_postfix {
            self.compile_expression(env, dest)?;
        }

        self.compile_expression(env, source)?;
        self.emit(Op::Dup, &[]);

        self.src_positions_stack.push(dest.pos.clone());
        let result = (|| -> Result<(), ScriptError> {
            match &dest.kind {
                Expression::Ident(ident) => {
                    let store = env.store;
                    let symbol = match self.symbol_table().resolve(store, &ident.name) {
                        Some(symbol) => symbol,
                        // assignment to an unresolved name implicitly
                        // defines it as assignable
                        None => self
                            .symbol_table()
                            .define(store, &ident.name, true)
                            .ok_or_else(|| {
                                ScriptError::compilation(
                                    ident.pos.clone(),
                                    format!("Cannot define symbol \"{}\"", ident.name),
                                )
                            })?,
                    };
                    if !symbol.assignable {
                        return Err(ScriptError::compilation(
                            dest.pos.clone(),
                            format!("Symbol \"{}\" is not assignable", ident.name),
                        ));
                    }
                    self.write_symbol(&dest.pos, &symbol, false)?;
                }
                Expression::Index { left, index } => {
                    self.compile_expression(env, left)?;
                    self.compile_expression(env, index)?;
                    self.emit(Op::SetIndex, &[]);
                }
                _ => unreachable!("checked above"),
            }
            Ok(())
        })();
        self.src_positions_stack.pop();
        result?;

        if is_postfix {
            self.emit(Op::Pop, &[]);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    fn import_module(
        &mut self,
        env: &mut CompileEnv<'_>,
        pos: &Pos,
        module_path: &str,
    ) -> Result<(), ScriptError> {
        let module_name = module_name_of(module_path).to_string();
        {
            let file_scope = self.file_scopes.last().expect("file scope");
            if file_scope
                .loaded_module_names
                .iter()
                .any(|n| n == &module_name)
            {
                return Err(ScriptError::compilation(
                    pos.clone(),
                    format!("Module \"{}\" was already imported", module_name),
                ));
            }
        }

        let filepath = {
            let file_scope = self.file_scopes.last().expect("file scope");
            let raw = if module_path.starts_with('/') {
                format!("{}.ape", module_path)
            } else {
                format!("{}{}.ape", file_scope.file.dir_path, module_path)
            };
            canonicalise_path(&raw)
        };

        if !self.symbol_table().is_module_global_scope()
            || !self.symbol_table().is_top_block_scope()
        {
            return Err(ScriptError::compilation(
                pos.clone(),
                "Modules can only be imported in global scope",
            ));
        }

        if self.file_scopes.iter().any(|fs| fs.file.path == filepath) {
            return Err(ScriptError::compilation(
                pos.clone(),
                format!("Cyclic reference of file \"{}\"", filepath),
            ));
        }

        if !self.modules.contains_key(&filepath) {
            debug!(module = %module_name, path = %filepath, "compiling imported module");
            let read_file = env.read_file.ok_or_else(|| {
                ScriptError::compilation(
                    pos.clone(),
                    format!(
                        "Cannot import module \"{}\", file read function not configured",
                        filepath
                    ),
                )
            })?;
            let code = read_file(&filepath).ok_or_else(|| {
                ScriptError::compilation(
                    pos.clone(),
                    format!("Reading module file \"{}\" failed", filepath),
                )
            })?;

            self.push_file_scope(&filepath, &code);
            let compiled = (|| {
                let file = self.file_scopes.last().expect("file scope").file.clone();
                let statements = Parser::parse_all(&code, Some(file), env.repl_mode)?;
                self.compile_statements(env, &statements)
            })();
            compiled?;

            let mut module = Module {
                name: module_name.clone(),
                symbols: Vec::new(),
            };
            for symbol in self.symbol_table().module_global_symbols().to_vec() {
                module.add_symbol(&symbol);
            }
            self.pop_file_scope();
            self.modules.insert(filepath.clone(), module);
        }

        let symbols = self.modules[&filepath].symbols.clone();
        for symbol in &symbols {
            self.symbol_table().add_module_symbol(symbol);
        }
        self.file_scopes
            .last_mut()
            .expect("file scope")
            .loaded_module_names
            .push(module_name);
        Ok(())
    }

    fn push_file_scope(&mut self, path: &str, code: &str) {
        let offset = self.symbol_table().next_module_global_offset();
        self.file_scopes.push(FileScope {
            file: Rc::new(SourceFile::new(path, code)),
            loaded_module_names: Vec::new(),
            symbol_table: SymbolTable::new(offset),
        });
    }

    fn pop_file_scope(&mut self) {
        let popped = self.file_scopes.pop().expect("file scope");
        let popped_defs = popped.symbol_table.top_block_num_definitions();
        if let Some(current) = self.file_scopes.last_mut() {
            current.symbol_table.bump_definitions(popped_defs);
        }
    }
}

fn module_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Collapse `.` and `..` segments; keeps the path relative or absolute as
/// given.
fn canonicalise_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::code_to_string;

    fn compile_with(
        compiler: &mut Compiler,
        heap: &mut Heap,
        store: &GlobalStore,
        source: &str,
    ) -> Result<Rc<CompiledCode>, ScriptError> {
        let mut env = CompileEnv {
            heap,
            store,
            repl_mode: true,
            read_file: None,
        };
        compiler.compile(&mut env, source)
    }

    fn compile_src(source: &str) -> Rc<CompiledCode> {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        compile_with(&mut compiler, &mut heap, &store, source).unwrap()
    }

    /// Walk instructions (skipping operands) and collect opcodes.
    fn opcodes(code: &CompiledCode) -> Vec<Op> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < code.bytecode.len() {
            let op = Op::from_u8(code.bytecode[ip]).expect("valid opcode");
            out.push(op);
            ip += 1 + op.def().operand_widths.iter().sum::<usize>();
        }
        out
    }

    #[test]
    fn positions_cover_every_emitted_byte() {
        let code = compile_src("var x = 1 + 2; x = x * 3");
        assert_eq!(code.bytecode.len(), code.src_positions.len());
        assert!(code.src_positions.iter().all(|p| p.is_valid()));
    }

    #[test]
    fn literal_arithmetic_folds_away() {
        let code = compile_src("var x = 2 * 3 + 4");
        let ops = opcodes(&code);
        assert!(!ops.contains(&Op::Mul));
        assert!(!ops.contains(&Op::Add));
        assert!(ops.contains(&Op::Number));
    }

    #[test]
    fn string_concat_folds_and_constants_dedupe() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let code =
            compile_with(&mut compiler, &mut heap, &store, r#"var a = "x" + "y"; var b = "xy""#)
                .unwrap();
        let ops = opcodes(&code);
        assert!(!ops.contains(&Op::Add));
        // both statements reference the same deduplicated constant
        assert_eq!(compiler.constants().len(), 1);
    }

    #[test]
    fn comparison_rewrites_lt_as_swapped_gt() {
        let code = compile_src("var x = 1; var y = 2; var r = x < y");
        let listing = code_to_string(&code);
        assert!(listing.contains("COMPARE"));
        assert!(listing.contains("GREATER_THAN"));
    }

    #[test]
    fn failed_compilation_rolls_back_compiler_state() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        compile_with(&mut compiler, &mut heap, &store, "var a = \"keep\"").unwrap();
        let constants_before = compiler.constants().len();

        let err =
            compile_with(&mut compiler, &mut heap, &store, "var b = \"junk\"; var c = missing")
                .unwrap_err();
        assert_eq!(err.kind, ape_core::ErrorKind::Compilation);
        assert_eq!(compiler.constants().len(), constants_before);

        // the failed compile defined nothing: `b` is unresolved, `a` intact
        assert!(
            compile_with(&mut compiler, &mut heap, &store, "var d = b").is_err(),
            "b must not survive the rolled-back compile"
        );
        compile_with(&mut compiler, &mut heap, &store, "var e = a").unwrap();
    }

    #[test]
    fn break_and_continue_require_a_loop() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let err = compile_with(&mut compiler, &mut heap, &store, "break").unwrap_err();
        assert!(err.message.contains("break"));
        let err = compile_with(&mut compiler, &mut heap, &store, "continue").unwrap_err();
        assert!(err.message.contains("continue"));
    }

    #[test]
    fn return_requires_a_function() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let err = compile_with(&mut compiler, &mut heap, &store, "return 1").unwrap_err();
        assert!(err.message.contains("Nothing to return from"));
    }

    #[test]
    fn recover_placement_rules() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();

        let err = compile_with(
            &mut compiler,
            &mut heap,
            &store,
            "recover (e) { return 1 }",
        )
        .unwrap_err();
        assert!(err.message.contains("global scope"));

        let err = compile_with(
            &mut compiler,
            &mut heap,
            &store,
            "var f = function() { if (true) { recover (e) { return 1 } } return 2 }",
        )
        .unwrap_err();
        assert!(err.message.contains("within other statements"));

        let err = compile_with(
            &mut compiler,
            &mut heap,
            &store,
            "var f = function() { recover (e) { var x = 1 } return 2 }",
        )
        .unwrap_err();
        assert!(err.message.contains("must end with a return"));

        compile_with(
            &mut compiler,
            &mut heap,
            &store,
            "var f = function() { recover (e) { return e } return 2 }",
        )
        .unwrap();
    }

    #[test]
    fn duplicate_definition_in_a_block_fails() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let err = compile_with(
            &mut compiler,
            &mut heap,
            &store,
            "var f = function() { var x = 1; var x = 2; return x }",
        )
        .unwrap_err();
        assert!(err.message.contains("already defined"));
    }

    #[test]
    fn const_assignment_fails() {
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let err = compile_with(&mut compiler, &mut heap, &store, "const c = 1; c = 2").unwrap_err();
        assert!(err.message.contains("not assignable"));
    }

    #[test]
    fn closures_capture_free_variables() {
        let code = compile_src(
            "var make = function(n) { return function() { n = n + 1; return n } }",
        );
        // the outer function constant's body wraps the inner one with a
        // free-variable load
        let listing = code_to_string(&code);
        assert!(listing.contains("FUNCTION"));
    }

    #[test]
    fn imports_compile_once_and_detect_cycles() {
        use std::cell::RefCell;
        use std::collections::HashMap as Files;

        let files: RefCell<Files<String, String>> = RefCell::new(
            [
                ("lib.ape".to_string(), "var helper = 42".to_string()),
                ("a.ape".to_string(), "import \"b\"".to_string()),
                ("b.ape".to_string(), "import \"a\"".to_string()),
                (
                    "main.ape".to_string(),
                    "import \"lib\"\nvar x = lib::helper".to_string(),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let reads = RefCell::new(Vec::new());
        let read = |path: &str| -> Option<String> {
            reads.borrow_mut().push(path.to_string());
            files.borrow().get(path).cloned()
        };

        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let mut env = CompileEnv {
            heap: &mut heap,
            store: &store,
            repl_mode: false,
            read_file: Some(&read),
        };

        let main = files.borrow()["main.ape"].clone();
        compiler.compile(&mut env, &main).unwrap();
        assert_eq!(reads.borrow().as_slice(), ["lib.ape"]);

        // cycle: a imports b imports a
        let a = files.borrow()["a.ape"].clone();
        let mut compiler = Compiler::new();
        let mut env = CompileEnv {
            heap: &mut heap,
            store: &store,
            repl_mode: false,
            read_file: Some(&read),
        };
        let err = compiler.compile(&mut env, &a).unwrap_err();
        assert_eq!(err.kind, ape_core::ErrorKind::Compilation);
        assert!(err.message.contains("Cyclic"));
    }

    #[test]
    fn importing_twice_from_one_file_fails() {
        let read = |path: &str| -> Option<String> {
            (path == "m.ape").then(|| "var x = 1".to_string())
        };
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let mut env = CompileEnv {
            heap: &mut heap,
            store: &store,
            repl_mode: false,
            read_file: Some(&read),
        };
        let err = compiler
            .compile(&mut env, "import \"m\"\nimport \"m\"")
            .unwrap_err();
        assert!(err.message.contains("already imported"));
    }

    #[test]
    fn import_is_global_scope_only() {
        let read = |_: &str| -> Option<String> { Some("var x = 1".to_string()) };
        let mut compiler = Compiler::new();
        let mut heap = Heap::new();
        let store = GlobalStore::new();
        let mut env = CompileEnv {
            heap: &mut heap,
            store: &store,
            repl_mode: false,
            read_file: Some(&read),
        };
        let err = compiler
            .compile(&mut env, "var f = function() { import \"m\" return 1 }")
            .unwrap_err();
        assert!(err.message.contains("global scope"));
    }

    #[test]
    fn canonicalise_collapses_dots() {
        assert_eq!(canonicalise_path("a/./b/../c.ape"), "a/c.ape");
        assert_eq!(canonicalise_path("/x/../y.ape"), "/y.ape");
        assert_eq!(canonicalise_path("plain.ape"), "plain.ape");
    }
}
