//! Lexical symbol resolution.
//!
//! One `SymbolTable` per function scope, chained through `outer`; each
//! table holds a stack of block scopes, one per `{ ... }`. Slot indices are
//! assigned at definition time from the enclosing blocks' offsets, and the
//! per-function `max_num_definitions` watermark sizes the call frame.
//!
//! Resolving a name across a function boundary materialises a *free*
//! symbol in the inner table and records the original in `free_symbols`;
//! the compiler emits loads for those when it wraps the function constant,
//! which is how closures capture their environment. `this` promotes the
//! same way.

use crate::global_store::GlobalStore;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Top-level binding of a compiled file, addressed by u16 index.
    ModuleGlobal,
    /// Host-installed global (builtins, embedder constants).
    ApeGlobal,
    Local,
    /// Captured variable of an enclosing function.
    Free,
    /// The enclosing named function itself.
    FunctionSelf,
    /// The map under construction in a map literal.
    This,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub index: usize,
    pub assignable: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, index: usize, assignable: bool) -> Self {
        Symbol {
            name: name.into(),
            kind,
            index,
            assignable,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BlockScope {
    store: HashMap<String, Symbol>,
    offset: usize,
    num_definitions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    block_scopes: Vec<BlockScope>,
    pub free_symbols: Vec<Symbol>,
    module_global_symbols: Vec<Symbol>,
    module_global_offset: usize,
    pub max_num_definitions: usize,
}

impl SymbolTable {
    pub fn new(module_global_offset: usize) -> Self {
        let mut table = SymbolTable {
            module_global_offset,
            ..SymbolTable::default()
        };
        table.push_block_scope();
        table
    }

    /// Wrap `self` as the outer table of a fresh function scope.
    pub fn push_function_scope(table: &mut SymbolTable) {
        let outer = std::mem::take(table);
        *table = SymbolTable::new(0);
        table.outer = Some(Box::new(outer));
    }

    /// Drop the innermost function scope, restoring its outer table.
    /// Returns false at the outermost table.
    pub fn pop_function_scope(table: &mut SymbolTable) -> bool {
        match table.outer.take() {
            Some(outer) => {
                *table = *outer;
                true
            }
            None => false,
        }
    }

    pub fn is_module_global_scope(&self) -> bool {
        self.outer.is_none()
    }

    pub fn is_top_block_scope(&self) -> bool {
        self.block_scopes.len() == 1
    }

    pub fn is_top_global_scope(&self) -> bool {
        self.is_module_global_scope() && self.is_top_block_scope()
    }

    pub fn push_block_scope(&mut self) {
        let offset = match self.block_scopes.last() {
            Some(prev) => prev.offset + prev.num_definitions,
            None => self.module_global_offset,
        };
        self.block_scopes.push(BlockScope {
            store: HashMap::new(),
            offset,
            num_definitions: 0,
        });
    }

    pub fn pop_block_scope(&mut self) {
        self.block_scopes.pop();
    }

    /// Offset just past the definitions of the top block scope; used when
    /// chaining file scopes so module-global indices keep growing.
    pub fn next_module_global_offset(&self) -> usize {
        match self.block_scopes.last() {
            Some(top) => top.offset + top.num_definitions,
            None => 0,
        }
    }

    fn set_symbol(&mut self, symbol: Symbol) {
        let top = self.block_scopes.last_mut().expect("block scope");
        top.store.insert(symbol.name.clone(), symbol);
    }

    fn next_symbol_index(&self) -> usize {
        let top = self.block_scopes.last().expect("block scope");
        top.offset + top.num_definitions
    }

    fn count_num_definitions(&self) -> usize {
        self.block_scopes.iter().map(|s| s.num_definitions).sum()
    }

    /// Define a name in the top block scope. Fails for names that shadow a
    /// host global, module-qualified names and `this`.
    pub fn define(
        &mut self,
        store: &GlobalStore,
        name: &str,
        assignable: bool,
    ) -> Option<Symbol> {
        if store.symbol(name).is_some() {
            return None;
        }
        if name.contains("::") {
            return None;
        }
        if name == "this" {
            return None;
        }
        let kind = if self.outer.is_none() {
            SymbolKind::ModuleGlobal
        } else {
            SymbolKind::Local
        };
        let index = self.next_symbol_index();
        let symbol = Symbol::new(name, kind, index, assignable);
        if kind == SymbolKind::ModuleGlobal && self.block_scopes.len() == 1 {
            self.module_global_symbols.push(symbol.clone());
        }
        self.set_symbol(symbol.clone());
        self.block_scopes.last_mut().expect("block scope").num_definitions += 1;
        let definitions = self.count_num_definitions();
        if definitions > self.max_num_definitions {
            self.max_num_definitions = definitions;
        }
        Some(symbol)
    }

    /// Capture a symbol of an enclosing function as a free variable of
    /// this one.
    fn define_free(&mut self, original: &Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol::new(
            original.name.clone(),
            SymbolKind::Free,
            self.free_symbols.len() - 1,
            original.assignable,
        );
        self.set_symbol(symbol.clone());
        symbol
    }

    /// Bind the function's own name inside its body.
    pub fn define_function_name(&mut self, name: &str, assignable: bool) -> Option<Symbol> {
        if name.contains("::") {
            return None;
        }
        let symbol = Symbol::new(name, SymbolKind::FunctionSelf, 0, assignable);
        self.set_symbol(symbol.clone());
        Some(symbol)
    }

    pub fn define_this(&mut self) -> Symbol {
        let symbol = Symbol::new("this", SymbolKind::This, 0, false);
        self.set_symbol(symbol.clone());
        symbol
    }

    /// Resolve inner to outer. Crossing a function boundary turns locals
    /// and `this` into free symbols of the inner function; module globals
    /// and host globals pass through unchanged.
    pub fn resolve(&mut self, store: &GlobalStore, name: &str) -> Option<Symbol> {
        if let Some(symbol) = store.symbol(name) {
            return Some(symbol.clone());
        }
        let mut found = None;
        for scope in self.block_scopes.iter().rev() {
            if let Some(symbol) = scope.store.get(name) {
                found = Some(symbol.clone());
                break;
            }
        }
        if let Some(symbol) = found {
            if symbol.kind == SymbolKind::This {
                return Some(self.define_free(&symbol));
            }
            return Some(symbol);
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(store, name)?;
        if symbol.kind == SymbolKind::ModuleGlobal || symbol.kind == SymbolKind::ApeGlobal {
            return Some(symbol);
        }
        Some(self.define_free(&symbol))
    }

    /// Is the name bound in the top block scope (or as a host global)?
    pub fn is_defined(&self, store: &GlobalStore, name: &str) -> bool {
        if store.symbol(name).is_some() {
            return true;
        }
        self.block_scopes
            .last()
            .map(|top| top.store.contains_key(name))
            .unwrap_or(false)
    }

    pub fn module_global_symbols(&self) -> &[Symbol] {
        &self.module_global_symbols
    }

    /// Re-bind an imported module's exported symbol in this table.
    pub fn add_module_symbol(&mut self, symbol: &Symbol) {
        debug_assert_eq!(symbol.kind, SymbolKind::ModuleGlobal);
        if self
            .block_scopes
            .last()
            .map(|top| top.store.contains_key(&symbol.name))
            .unwrap_or(false)
        {
            return;
        }
        self.set_symbol(symbol.clone());
    }

    /// Take the captured free symbols (used once per compiled function).
    pub fn take_free_symbols(&mut self) -> Vec<Symbol> {
        std::mem::take(&mut self.free_symbols)
    }

    pub fn top_block_num_definitions(&self) -> usize {
        self.block_scopes
            .last()
            .map(|s| s.num_definitions)
            .unwrap_or(0)
    }

    /// Reserve `n` extra slots in the top block scope; used after popping
    /// an imported file's scope so later module globals skip its slots.
    pub fn bump_definitions(&mut self, n: usize) {
        if let Some(top) = self.block_scopes.last_mut() {
            top.num_definitions += n;
        }
    }
}
