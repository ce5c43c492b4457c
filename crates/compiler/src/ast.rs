//! Abstract syntax tree.
//!
//! Nodes are plain data and `Clone`: the parser deep-copies destination
//! expressions when desugaring compound assignment and `++`/`--`.

use ape_core::Pos;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Plus,
    Minus,
    Bang,
    Asterisk,
    Slash,
    Modulus,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    NotEq,
    LogicalAnd,
    LogicalOr,
    BitAnd,
    BitOr,
    BitXor,
    Lshift,
    Rshift,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Bang => "!",
            Operator::Asterisk => "*",
            Operator::Slash => "/",
            Operator::Modulus => "%",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::LogicalAnd => "&&",
            Operator::LogicalOr => "||",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::Lshift => "<<",
            Operator::Rshift => ">>",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FnLiteral {
    /// Filled in when the literal is bound by a define or the
    /// `function name() {}` statement form.
    pub name: Option<String>,
    pub params: Vec<Ident>,
    pub body: CodeBlock,
}

#[derive(Debug, Clone)]
pub struct IfCase {
    pub test: Expr,
    pub consequence: CodeBlock,
}

#[derive(Debug, Clone)]
pub enum Expression {
    Ident(Ident),
    NumberLiteral(f64),
    BoolLiteral(bool),
    StringLiteral(String),
    NullLiteral,
    ArrayLiteral(Vec<Expr>),
    MapLiteral {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    Prefix {
        op: Operator,
        right: Box<Expr>,
    },
    Infix {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    FnLiteral(FnLiteral),
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Assign {
        dest: Box<Expr>,
        source: Box<Expr>,
        /// Postfix `++`/`--` leave the pre-assignment value on the stack.
        is_postfix: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: Expression,
    pub pos: Pos,
}

impl Expr {
    pub fn new(kind: Expression, pos: Pos) -> Self {
        Expr { kind, pos }
    }
}

#[derive(Debug, Clone)]
pub enum Statement {
    Expression(Expr),
    Define {
        name: Ident,
        value: Expr,
        assignable: bool,
    },
    If {
        cases: Vec<IfCase>,
        alternative: Option<CodeBlock>,
    },
    Return(Option<Expr>),
    While {
        test: Expr,
        body: CodeBlock,
    },
    Break,
    Continue,
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: CodeBlock,
    },
    Foreach {
        iterator: Ident,
        source: Expr,
        body: CodeBlock,
    },
    Block(CodeBlock),
    Import {
        path: String,
    },
    Recover {
        error_ident: Ident,
        body: CodeBlock,
    },
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: Statement,
    pub pos: Pos,
}

impl Stmt {
    pub fn new(kind: Statement, pos: Pos) -> Self {
        Stmt { kind, pos }
    }
}
