//! Pratt parser.
//!
//! Expression parsing dispatches on the current token twice: once for the
//! null denotation (prefix position) and once for the left denotation
//! (infix position), climbing the precedence ladder. Statements dispatch on
//! the leading keyword; anything else parses as an expression statement.
//!
//! Several surface forms are desugared here rather than compiled:
//! template strings become `"..." + to_str(expr) + "..."` chains, `x++`
//! becomes `x = x + 1` with a postfix flag, compound assignment clones its
//! destination, and `a.b` becomes `a["b"]`.

use crate::ast::{
    CodeBlock, Expr, Expression, FnLiteral, Ident, IfCase, Operator, Statement, Stmt,
};
use crate::lexer::Lexer;
use crate::token::{Token, TokenType};
use ape_core::{Pos, ScriptError, SourceFile};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    Ternary,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equals,
    LessGreater,
    Shift,
    Sum,
    Product,
    Prefix,
    Postfix,
    IncDec,
}

/// Parses just a null denotation, with no infix continuation; used for the
/// tail of a template string.
const PRECEDENCE_HIGHEST: Precedence = Precedence::IncDec;

fn precedence_of(t: TokenType) -> Precedence {
    use TokenType::*;
    match t {
        Assign | PlusAssign | MinusAssign | AsteriskAssign | SlashAssign | PercentAssign
        | BitAndAssign | BitOrAssign | BitXorAssign | LshiftAssign | RshiftAssign => {
            Precedence::Assign
        }
        Question => Precedence::Ternary,
        Or => Precedence::LogicalOr,
        And => Precedence::LogicalAnd,
        BitOr => Precedence::BitOr,
        BitXor => Precedence::BitXor,
        BitAnd => Precedence::BitAnd,
        Eq | NotEq => Precedence::Equals,
        Lt | Lte | Gt | Gte => Precedence::LessGreater,
        Lshift | Rshift => Precedence::Shift,
        Plus | Minus => Precedence::Sum,
        Slash | Asterisk | Percent => Precedence::Product,
        Lparen | Lbracket | Dot => Precedence::Postfix,
        PlusPlus | MinusMinus => Precedence::IncDec,
        _ => Precedence::Lowest,
    }
}

fn token_to_operator(t: TokenType) -> Operator {
    use TokenType::*;
    match t {
        Plus | PlusAssign | PlusPlus => Operator::Plus,
        Minus | MinusAssign | MinusMinus => Operator::Minus,
        Bang => Operator::Bang,
        Asterisk | AsteriskAssign => Operator::Asterisk,
        Slash | SlashAssign => Operator::Slash,
        Percent | PercentAssign => Operator::Modulus,
        Lt => Operator::Lt,
        Lte => Operator::Lte,
        Gt => Operator::Gt,
        Gte => Operator::Gte,
        Eq => Operator::Eq,
        NotEq => Operator::NotEq,
        And => Operator::LogicalAnd,
        Or => Operator::LogicalOr,
        BitAnd | BitAndAssign => Operator::BitAnd,
        BitOr | BitOrAssign => Operator::BitOr,
        BitXor | BitXorAssign => Operator::BitXor,
        Lshift | LshiftAssign => Operator::Lshift,
        Rshift | RshiftAssign => Operator::Rshift,
        _ => unreachable!("token {:?} is not an operator", t),
    }
}

pub struct Parser {
    lexer: Lexer,
    repl_mode: bool,
    depth: usize,
}

impl Parser {
    /// Parse a whole source unit. The first failure abandons the parse;
    /// partial statements are dropped.
    pub fn parse_all(
        source: &str,
        file: Option<Rc<SourceFile>>,
        repl_mode: bool,
    ) -> Result<Vec<Stmt>, ScriptError> {
        let mut parser = Parser {
            lexer: Lexer::new(source, file),
            repl_mode,
            depth: 0,
        };
        let mut statements = Vec::new();
        while !parser.lexer.cur_token_is(TokenType::Eof) {
            if parser.lexer.cur_token_is(TokenType::Semicolon) {
                parser.lexer.next_token();
                continue;
            }
            statements.push(parser.parse_statement()?);
        }
        Ok(statements)
    }

    fn cur(&self) -> &Token {
        self.lexer.cur_token()
    }

    fn cur_pos(&self) -> Pos {
        self.cur().pos.clone()
    }

    fn err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::parsing(self.cur_pos(), message)
    }

    fn expect_current(&self, t: TokenType) -> Result<(), ScriptError> {
        if self.cur().token_type != t {
            return Err(self.err(format!(
                "Expected \"{}\", got \"{}\"",
                t.name(),
                self.cur().token_type.name()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        let pos = self.cur_pos();
        let kind = match self.cur().token_type {
            TokenType::Var | TokenType::Const => self.parse_define_statement()?,
            TokenType::If => self.parse_if_statement()?,
            TokenType::Return => self.parse_return_statement()?,
            TokenType::While => self.parse_while_statement()?,
            TokenType::Break => {
                self.lexer.next_token();
                Statement::Break
            }
            TokenType::Continue => {
                self.lexer.next_token();
                Statement::Continue
            }
            TokenType::For => self.parse_for_statement()?,
            TokenType::Function => {
                if self.lexer.peek_token_is(TokenType::Ident) {
                    self.parse_function_statement()?
                } else {
                    self.parse_expression_statement()?
                }
            }
            TokenType::Lbrace => {
                if self.repl_mode && self.depth == 0 {
                    self.parse_expression_statement()?
                } else {
                    Statement::Block(self.parse_code_block()?)
                }
            }
            TokenType::Import => self.parse_import_statement()?,
            TokenType::Recover => self.parse_recover_statement()?,
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt::new(kind, pos))
    }

    fn parse_define_statement(&mut self) -> Result<Statement, ScriptError> {
        let assignable = self.lexer.cur_token_is(TokenType::Var);
        self.lexer.next_token();
        self.expect_current(TokenType::Ident)?;
        let name = Ident {
            name: self.cur().literal.clone(),
            pos: self.cur_pos(),
        };
        self.lexer.next_token();
        self.expect_current(TokenType::Assign)?;
        self.lexer.next_token();
        let mut value = self.parse_expression(Precedence::Lowest)?;
        if let Expression::FnLiteral(fn_lit) = &mut value.kind {
            fn_lit.name = Some(name.name.clone());
        }
        Ok(Statement::Define {
            name,
            value,
            assignable,
        })
    }

    fn parse_if_statement(&mut self) -> Result<Statement, ScriptError> {
        let mut cases = Vec::new();
        let mut alternative = None;
        self.lexer.next_token();
        self.expect_current(TokenType::Lparen)?;
        self.lexer.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect_current(TokenType::Rparen)?;
        self.lexer.next_token();
        let consequence = self.parse_code_block()?;
        cases.push(IfCase { test, consequence });
        while self.lexer.cur_token_is(TokenType::Else) {
            self.lexer.next_token();
            if self.lexer.cur_token_is(TokenType::If) {
                self.lexer.next_token();
                self.expect_current(TokenType::Lparen)?;
                self.lexer.next_token();
                let test = self.parse_expression(Precedence::Lowest)?;
                self.expect_current(TokenType::Rparen)?;
                self.lexer.next_token();
                let consequence = self.parse_code_block()?;
                cases.push(IfCase { test, consequence });
            } else {
                alternative = Some(self.parse_code_block()?);
            }
        }
        Ok(Statement::If { cases, alternative })
    }

    fn parse_return_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        let value = if !self.lexer.cur_token_is(TokenType::Semicolon)
            && !self.lexer.cur_token_is(TokenType::Rbrace)
            && !self.lexer.cur_token_is(TokenType::Eof)
        {
            Some(self.parse_expression(Precedence::Lowest)?)
        } else {
            None
        };
        Ok(Statement::Return(value))
    }

    fn parse_expression_statement(&mut self) -> Result<Statement, ScriptError> {
        let expr = self.parse_expression(Precedence::Lowest)?;
        if !self.repl_mode || self.depth > 0 {
            if !matches!(expr.kind, Expression::Assign { .. } | Expression::Call { .. }) {
                return Err(ScriptError::parsing(
                    expr.pos.clone(),
                    "Only assignments and function calls can be expression statements",
                ));
            }
        }
        Ok(Statement::Expression(expr))
    }

    fn parse_while_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        self.expect_current(TokenType::Lparen)?;
        self.lexer.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect_current(TokenType::Rparen)?;
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Ok(Statement::While { test, body })
    }

    fn parse_for_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        self.expect_current(TokenType::Lparen)?;
        self.lexer.next_token();
        if self.lexer.cur_token_is(TokenType::Ident) && self.lexer.peek_token_is(TokenType::In) {
            self.parse_foreach()
        } else {
            self.parse_classic_for()
        }
    }

    fn parse_foreach(&mut self) -> Result<Statement, ScriptError> {
        let iterator = Ident {
            name: self.cur().literal.clone(),
            pos: self.cur_pos(),
        };
        self.lexer.next_token();
        self.expect_current(TokenType::In)?;
        self.lexer.next_token();
        let source = self.parse_expression(Precedence::Lowest)?;
        self.expect_current(TokenType::Rparen)?;
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Ok(Statement::Foreach {
            iterator,
            source,
            body,
        })
    }

    fn parse_classic_for(&mut self) -> Result<Statement, ScriptError> {
        let mut init = None;
        if !self.lexer.cur_token_is(TokenType::Semicolon) {
            let stmt = self.parse_statement()?;
            if !matches!(stmt.kind, Statement::Define { .. } | Statement::Expression(_)) {
                return Err(ScriptError::parsing(
                    stmt.pos.clone(),
                    "for loop's init clause should be a define statement or an expression",
                ));
            }
            self.expect_current(TokenType::Semicolon)?;
            init = Some(Box::new(stmt));
        }
        self.lexer.next_token();
        let mut test = None;
        if !self.lexer.cur_token_is(TokenType::Semicolon) {
            test = Some(self.parse_expression(Precedence::Lowest)?);
            self.expect_current(TokenType::Semicolon)?;
        }
        self.lexer.next_token();
        let mut update = None;
        if !self.lexer.cur_token_is(TokenType::Rparen) {
            update = Some(self.parse_expression(Precedence::Lowest)?);
            self.expect_current(TokenType::Rparen)?;
        }
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Ok(Statement::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_function_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        self.expect_current(TokenType::Ident)?;
        let name = Ident {
            name: self.cur().literal.clone(),
            pos: self.cur_pos(),
        };
        self.lexer.next_token();
        let pos = self.cur_pos();
        let mut fn_lit = self.parse_function_literal()?;
        fn_lit.name = Some(name.name.clone());
        Ok(Statement::Define {
            name,
            value: Expr::new(Expression::FnLiteral(fn_lit), pos),
            assignable: false,
        })
    }

    fn parse_import_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        self.expect_current(TokenType::String)?;
        let path = process_string(&self.cur().literal);
        self.lexer.next_token();
        Ok(Statement::Import { path })
    }

    fn parse_recover_statement(&mut self) -> Result<Statement, ScriptError> {
        self.lexer.next_token();
        self.expect_current(TokenType::Lparen)?;
        self.lexer.next_token();
        self.expect_current(TokenType::Ident)?;
        let error_ident = Ident {
            name: self.cur().literal.clone(),
            pos: self.cur_pos(),
        };
        self.lexer.next_token();
        self.expect_current(TokenType::Rparen)?;
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Ok(Statement::Recover { error_ident, body })
    }

    fn parse_code_block(&mut self) -> Result<CodeBlock, ScriptError> {
        self.expect_current(TokenType::Lbrace)?;
        self.lexer.next_token();
        self.depth += 1;
        let mut statements = Vec::new();
        loop {
            if self.lexer.cur_token_is(TokenType::Rbrace) {
                break;
            }
            if self.lexer.cur_token_is(TokenType::Eof) {
                self.depth -= 1;
                return Err(self.err("Unexpected EOF"));
            }
            if self.lexer.cur_token_is(TokenType::Semicolon) {
                self.lexer.next_token();
                continue;
            }
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(e) => {
                    self.depth -= 1;
                    return Err(e);
                }
            }
        }
        self.lexer.next_token();
        self.depth -= 1;
        Ok(CodeBlock { statements })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self, prec: Precedence) -> Result<Expr, ScriptError> {
        if self.lexer.cur_token_is(TokenType::Invalid) {
            return Err(self.err("Illegal token"));
        }
        let pos = self.cur_pos();
        let mut left = self.parse_prefix()?;
        left.pos = pos;
        while !self.lexer.cur_token_is(TokenType::Semicolon)
            && prec < precedence_of(self.cur().token_type)
        {
            let pos = self.cur_pos();
            let mut new_left = match self.parse_infix(left) {
                Ok(e) => e,
                Err(e) => return Err(e),
            };
            new_left.pos = pos;
            left = new_left;
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        match self.cur().token_type {
            TokenType::Ident => {
                let ident = Ident {
                    name: self.cur().literal.clone(),
                    pos: pos.clone(),
                };
                self.lexer.next_token();
                Ok(Expr::new(Expression::Ident(ident), pos))
            }
            TokenType::Number => self.parse_number_literal(),
            TokenType::True | TokenType::False => {
                let value = self.lexer.cur_token_is(TokenType::True);
                self.lexer.next_token();
                Ok(Expr::new(Expression::BoolLiteral(value), pos))
            }
            TokenType::Null => {
                self.lexer.next_token();
                Ok(Expr::new(Expression::NullLiteral, pos))
            }
            TokenType::String => {
                let value = process_string(&self.cur().literal);
                self.lexer.next_token();
                Ok(Expr::new(Expression::StringLiteral(value), pos))
            }
            TokenType::TemplateString => self.parse_template_string_literal(),
            TokenType::Bang | TokenType::Minus => {
                let op = token_to_operator(self.cur().token_type);
                self.lexer.next_token();
                let right = self.parse_expression(Precedence::Prefix)?;
                Ok(Expr::new(
                    Expression::Prefix {
                        op,
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenType::Lparen => {
                self.lexer.next_token();
                let expr = self.parse_expression(Precedence::Lowest)?;
                self.expect_current(TokenType::Rparen)?;
                self.lexer.next_token();
                Ok(expr)
            }
            TokenType::Function => {
                let fn_lit = self.parse_function_literal()?;
                Ok(Expr::new(Expression::FnLiteral(fn_lit), pos))
            }
            TokenType::Lbracket => {
                let items =
                    self.parse_expression_list(TokenType::Lbracket, TokenType::Rbracket, true)?;
                Ok(Expr::new(Expression::ArrayLiteral(items), pos))
            }
            TokenType::Lbrace => self.parse_map_literal(),
            TokenType::PlusPlus | TokenType::MinusMinus => self.parse_incdec_prefix(),
            _ => Err(self.err(format!(
                "No prefix parse function for \"{}\" found",
                self.cur().token_type.name()
            ))),
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Result<Expr, ScriptError> {
        match self.cur().token_type {
            TokenType::Plus
            | TokenType::Minus
            | TokenType::Slash
            | TokenType::Asterisk
            | TokenType::Percent
            | TokenType::Eq
            | TokenType::NotEq
            | TokenType::Lt
            | TokenType::Lte
            | TokenType::Gt
            | TokenType::Gte
            | TokenType::BitAnd
            | TokenType::BitOr
            | TokenType::BitXor
            | TokenType::Lshift
            | TokenType::Rshift => {
                let op = token_to_operator(self.cur().token_type);
                let prec = precedence_of(self.cur().token_type);
                let pos = self.cur_pos();
                self.lexer.next_token();
                let right = self.parse_expression(prec)?;
                Ok(Expr::new(
                    Expression::Infix {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenType::And | TokenType::Or => {
                let op = token_to_operator(self.cur().token_type);
                let prec = precedence_of(self.cur().token_type);
                let pos = self.cur_pos();
                self.lexer.next_token();
                let right = self.parse_expression(prec)?;
                Ok(Expr::new(
                    Expression::Logical {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenType::Question => self.parse_ternary(left),
            TokenType::Lparen => {
                let pos = left.pos.clone();
                let args =
                    self.parse_expression_list(TokenType::Lparen, TokenType::Rparen, false)?;
                Ok(Expr::new(
                    Expression::Call {
                        function: Box::new(left),
                        args,
                    },
                    pos,
                ))
            }
            TokenType::Lbracket => {
                let pos = self.cur_pos();
                self.lexer.next_token();
                let index = self.parse_expression(Precedence::Lowest)?;
                self.expect_current(TokenType::Rbracket)?;
                self.lexer.next_token();
                Ok(Expr::new(
                    Expression::Index {
                        left: Box::new(left),
                        index: Box::new(index),
                    },
                    pos,
                ))
            }
            TokenType::Dot => self.parse_dot(left),
            TokenType::Assign
            | TokenType::PlusAssign
            | TokenType::MinusAssign
            | TokenType::AsteriskAssign
            | TokenType::SlashAssign
            | TokenType::PercentAssign
            | TokenType::BitAndAssign
            | TokenType::BitOrAssign
            | TokenType::BitXorAssign
            | TokenType::LshiftAssign
            | TokenType::RshiftAssign => self.parse_assign(left),
            TokenType::PlusPlus | TokenType::MinusMinus => self.parse_incdec_postfix(left),
            _ => Ok(left),
        }
    }

    fn parse_number_literal(&mut self) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        let literal = self.cur().literal.clone();
        let value = if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).ok().map(|v| v as f64)
        } else {
            literal.parse::<f64>().ok()
        };
        let value = value.ok_or_else(|| {
            self.err(format!("Parsing number literal \"{}\" failed", literal))
        })?;
        self.lexer.next_token();
        Ok(Expr::new(Expression::NumberLiteral(value), pos))
    }

    /// `"a{b}c"` parses as `"a" + to_str(b) + "c"`. The lexer hands over a
    /// `TemplateString` token for each chunk before a `{`; after the
    /// interpolated expression closes we put the lexer back into string
    /// mode and parse the remainder (a plain string, or another template
    /// continuing the chain).
    fn parse_template_string_literal(&mut self) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        let chunk = process_string(&self.cur().literal);
        self.lexer.next_token();
        self.expect_current(TokenType::Lbrace)?;
        self.lexer.next_token();

        let left_string = Expr::new(Expression::StringLiteral(chunk), pos.clone());
        let expr_pos = self.cur_pos();
        let template_expr = self.parse_expression(Precedence::Lowest)?;
        let to_str_call = wrap_in_call("to_str", template_expr, expr_pos.clone());
        let left_add = Expr::new(
            Expression::Infix {
                op: Operator::Plus,
                left: Box::new(left_string),
                right: Box::new(to_str_call),
            },
            expr_pos.clone(),
        );

        self.expect_current(TokenType::Rbrace)?;
        self.lexer.continue_template_string();
        let right = self.parse_expression(PRECEDENCE_HIGHEST)?;
        Ok(Expr::new(
            Expression::Infix {
                op: Operator::Plus,
                left: Box::new(left_add),
                right: Box::new(right),
            },
            expr_pos,
        ))
    }

    fn parse_function_literal(&mut self) -> Result<FnLiteral, ScriptError> {
        self.depth += 1;
        let result = (|| {
            if self.lexer.cur_token_is(TokenType::Function) {
                self.lexer.next_token();
            }
            let params = self.parse_function_parameters()?;
            let body = self.parse_code_block()?;
            Ok(FnLiteral {
                name: None,
                params,
                body,
            })
        })();
        self.depth -= 1;
        result
    }

    fn parse_function_parameters(&mut self) -> Result<Vec<Ident>, ScriptError> {
        self.expect_current(TokenType::Lparen)?;
        self.lexer.next_token();
        let mut params = Vec::new();
        if self.lexer.cur_token_is(TokenType::Rparen) {
            self.lexer.next_token();
            return Ok(params);
        }
        loop {
            self.expect_current(TokenType::Ident)?;
            params.push(Ident {
                name: self.cur().literal.clone(),
                pos: self.cur_pos(),
            });
            self.lexer.next_token();
            if !self.lexer.cur_token_is(TokenType::Comma) {
                break;
            }
            self.lexer.next_token();
        }
        self.expect_current(TokenType::Rparen)?;
        self.lexer.next_token();
        Ok(params)
    }

    fn parse_expression_list(
        &mut self,
        start: TokenType,
        end: TokenType,
        trailing_comma_allowed: bool,
    ) -> Result<Vec<Expr>, ScriptError> {
        self.expect_current(start)?;
        self.lexer.next_token();
        let mut items = Vec::new();
        if self.lexer.cur_token_is(end) {
            self.lexer.next_token();
            return Ok(items);
        }
        items.push(self.parse_expression(Precedence::Lowest)?);
        while self.lexer.cur_token_is(TokenType::Comma) {
            self.lexer.next_token();
            if trailing_comma_allowed && self.lexer.cur_token_is(end) {
                break;
            }
            items.push(self.parse_expression(Precedence::Lowest)?);
        }
        self.expect_current(end)?;
        self.lexer.next_token();
        Ok(items)
    }

    fn parse_map_literal(&mut self) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        self.lexer.next_token();
        while !self.lexer.cur_token_is(TokenType::Rbrace) {
            let key = if self.lexer.cur_token_is(TokenType::Ident) {
                let key = Expr::new(
                    Expression::StringLiteral(self.cur().literal.clone()),
                    self.cur_pos(),
                );
                self.lexer.next_token();
                key
            } else {
                let key = self.parse_expression(Precedence::Lowest)?;
                match key.kind {
                    Expression::StringLiteral(_)
                    | Expression::NumberLiteral(_)
                    | Expression::BoolLiteral(_) => key,
                    _ => {
                        return Err(ScriptError::parsing(
                            key.pos.clone(),
                            "Invalid map literal key type",
                        ))
                    }
                }
            };
            keys.push(key);
            self.expect_current(TokenType::Colon)?;
            self.lexer.next_token();
            values.push(self.parse_expression(Precedence::Lowest)?);
            if self.lexer.cur_token_is(TokenType::Rbrace) {
                break;
            }
            self.expect_current(TokenType::Comma)?;
            self.lexer.next_token();
        }
        self.lexer.next_token();
        Ok(Expr::new(Expression::MapLiteral { keys, values }, pos))
    }

    fn parse_ternary(&mut self, test: Expr) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        self.lexer.next_token();
        let if_true = self.parse_expression(Precedence::Lowest)?;
        self.expect_current(TokenType::Colon)?;
        self.lexer.next_token();
        let if_false = self.parse_expression(Precedence::Lowest)?;
        Ok(Expr::new(
            Expression::Ternary {
                test: Box::new(test),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            },
            pos,
        ))
    }

    fn parse_assign(&mut self, dest: Expr) -> Result<Expr, ScriptError> {
        let assign_type = self.cur().token_type;
        let pos = self.cur_pos();
        self.lexer.next_token();
        let source = self.parse_expression(Precedence::Lowest)?;
        let source = match assign_type {
            TokenType::Assign => source,
            // `x op= y` rewrites to `x = x op y`, sharing a deep copy of
            // the destination
            _ => {
                let op = token_to_operator(assign_type);
                let source_pos = source.pos.clone();
                Expr::new(
                    Expression::Infix {
                        op,
                        left: Box::new(dest.clone()),
                        right: Box::new(source),
                    },
                    source_pos,
                )
            }
        };
        Ok(Expr::new(
            Expression::Assign {
                dest: Box::new(dest),
                source: Box::new(source),
                is_postfix: false,
            },
            pos,
        ))
    }

    fn parse_incdec_prefix(&mut self) -> Result<Expr, ScriptError> {
        let op = token_to_operator(self.cur().token_type);
        let pos = self.cur_pos();
        self.lexer.next_token();
        let dest = self.parse_expression(Precedence::Prefix)?;
        let one = Expr::new(Expression::NumberLiteral(1.0), pos.clone());
        let operation = Expr::new(
            Expression::Infix {
                op,
                left: Box::new(dest.clone()),
                right: Box::new(one),
            },
            pos.clone(),
        );
        Ok(Expr::new(
            Expression::Assign {
                dest: Box::new(dest),
                source: Box::new(operation),
                is_postfix: false,
            },
            pos,
        ))
    }

    fn parse_incdec_postfix(&mut self, left: Expr) -> Result<Expr, ScriptError> {
        let op = token_to_operator(self.cur().token_type);
        let pos = self.cur_pos();
        self.lexer.next_token();
        let one = Expr::new(Expression::NumberLiteral(1.0), pos.clone());
        let operation = Expr::new(
            Expression::Infix {
                op,
                left: Box::new(left.clone()),
                right: Box::new(one),
            },
            pos.clone(),
        );
        Ok(Expr::new(
            Expression::Assign {
                dest: Box::new(left),
                source: Box::new(operation),
                is_postfix: true,
            },
            pos,
        ))
    }

    /// `a.b` sugar for `a["b"]`.
    fn parse_dot(&mut self, left: Expr) -> Result<Expr, ScriptError> {
        let pos = self.cur_pos();
        self.lexer.next_token();
        self.expect_current(TokenType::Ident)?;
        let index = Expr::new(
            Expression::StringLiteral(self.cur().literal.clone()),
            self.cur_pos(),
        );
        self.lexer.next_token();
        Ok(Expr::new(
            Expression::Index {
                left: Box::new(left),
                index: Box::new(index),
            },
            pos,
        ))
    }
}

fn escape_char(c: u8) -> u8 {
    match c {
        b'b' => 0x08,
        b'f' => 0x0c,
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'0' => 0,
        // '"', '\\', '/', '{' and anything else stand for themselves
        _ => c,
    }
}

/// Decode the escape sequences of a raw string lexeme.
fn process_string(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            out.push(escape_char(bytes[i + 1]));
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn wrap_in_call(function_name: &str, arg: Expr, pos: Pos) -> Expr {
    let function = Expr::new(
        Expression::Ident(Ident {
            name: function_name.to_string(),
            pos: pos.clone(),
        }),
        pos.clone(),
    );
    Expr::new(
        Expression::Call {
            function: Box::new(function),
            args: vec![arg],
        },
        pos,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        Parser::parse_all(source, None, true).unwrap()
    }

    fn parse_err(source: &str) -> ScriptError {
        Parser::parse_all(source, None, false).unwrap_err()
    }

    fn only_expr(source: &str) -> Expr {
        let mut stmts = parse(source);
        assert_eq!(stmts.len(), 1);
        match stmts.remove(0).kind {
            Statement::Expression(e) => e,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn template_string_desugars_to_to_str_chain() {
        // "a{b}c" == ("a" + to_str(b)) + "c"
        let expr = only_expr(r#""a{b}c""#);
        let Expression::Infix { op, left, right } = expr.kind else {
            panic!("expected infix");
        };
        assert_eq!(op, Operator::Plus);
        assert!(matches!(right.kind, Expression::StringLiteral(ref s) if s == "c"));
        let Expression::Infix { op, left, right } = left.kind else {
            panic!("expected inner infix");
        };
        assert_eq!(op, Operator::Plus);
        assert!(matches!(left.kind, Expression::StringLiteral(ref s) if s == "a"));
        let Expression::Call { function, args } = right.kind else {
            panic!("expected to_str call");
        };
        assert!(matches!(function.kind, Expression::Ident(ref i) if i.name == "to_str"));
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0].kind, Expression::Ident(ref i) if i.name == "b"));
    }

    #[test]
    fn template_string_with_two_interpolations_chains() {
        let expr = only_expr(r#""a{b}c{d}e""#);
        // outermost is a +; the exact grouping is exercised at runtime
        assert!(matches!(
            expr.kind,
            Expression::Infix {
                op: Operator::Plus,
                ..
            }
        ));
    }

    #[test]
    fn postfix_increment_sets_the_postfix_flag() {
        let expr = only_expr("x++");
        let Expression::Assign {
            dest,
            source,
            is_postfix,
        } = expr.kind
        else {
            panic!("expected assign");
        };
        assert!(is_postfix);
        assert!(matches!(dest.kind, Expression::Ident(ref i) if i.name == "x"));
        assert!(matches!(source.kind, Expression::Infix { op: Operator::Plus, .. }));
    }

    #[test]
    fn prefix_increment_is_not_postfix() {
        let expr = only_expr("++x");
        assert!(matches!(
            expr.kind,
            Expression::Assign {
                is_postfix: false,
                ..
            }
        ));
    }

    #[test]
    fn compound_assignment_rewrites_to_infix() {
        let expr = only_expr("x += 2");
        let Expression::Assign { dest, source, .. } = expr.kind else {
            panic!("expected assign");
        };
        assert!(matches!(dest.kind, Expression::Ident(ref i) if i.name == "x"));
        let Expression::Infix { op, left, .. } = source.kind else {
            panic!("expected infix source");
        };
        assert_eq!(op, Operator::Plus);
        assert!(matches!(left.kind, Expression::Ident(ref i) if i.name == "x"));
    }

    #[test]
    fn dot_is_index_sugar() {
        let expr = only_expr("a.b");
        let Expression::Index { left, index } = expr.kind else {
            panic!("expected index");
        };
        assert!(matches!(left.kind, Expression::Ident(ref i) if i.name == "a"));
        assert!(matches!(index.kind, Expression::StringLiteral(ref s) if s == "b"));
    }

    #[test]
    fn precedence_ladder() {
        let expr = only_expr("1 + 2 * 3");
        let Expression::Infix { op, right, .. } = expr.kind else {
            panic!("expected infix");
        };
        assert_eq!(op, Operator::Plus);
        assert!(matches!(right.kind, Expression::Infix { op: Operator::Asterisk, .. }));

        let expr = only_expr("a || b && c");
        assert!(matches!(expr.kind, Expression::Logical { op: Operator::LogicalOr, .. }));

        let expr = only_expr("1 < 2 == true");
        assert!(matches!(expr.kind, Expression::Infix { op: Operator::Eq, .. }));
    }

    #[test]
    fn function_statement_names_the_literal() {
        let stmts = parse("function add(a, b) { return a + b }");
        let Statement::Define {
            ref name,
            ref value,
            assignable,
        } = stmts[0].kind
        else {
            panic!("expected define");
        };
        assert_eq!(name.name, "add");
        assert!(!assignable);
        let Expression::FnLiteral(ref f) = value.kind else {
            panic!("expected fn literal");
        };
        assert_eq!(f.name.as_deref(), Some("add"));
        assert_eq!(f.params.len(), 2);
    }

    #[test]
    fn bare_expressions_are_rejected_outside_repl_mode() {
        let err = parse_err("1 + 2");
        assert!(err.message.contains("expression statements"));
        // but assignments and calls are fine
        assert!(Parser::parse_all("var x = 1; x = 2; print(x)", None, false).is_ok());
    }

    #[test]
    fn leading_brace_is_a_map_in_repl_mode_and_a_block_otherwise() {
        let stmts = parse("{ a: 1 }");
        assert!(matches!(
            stmts[0].kind,
            Statement::Expression(Expr {
                kind: Expression::MapLiteral { .. },
                ..
            })
        ));
        let stmts = Parser::parse_all("{ var a = 1 }", None, false).unwrap();
        assert!(matches!(stmts[0].kind, Statement::Block(_)));
    }

    #[test]
    fn map_literal_rejects_invalid_key_types() {
        let err = parse_err("var m = { [1]: 2 }");
        assert!(err.message.contains("Invalid map literal key type"));
    }

    #[test]
    fn else_if_chains_accumulate_cases() {
        let stmts = parse("if (a) { b() } else if (c) { d() } else { e() }");
        let Statement::If {
            ref cases,
            ref alternative,
        } = stmts[0].kind
        else {
            panic!("expected if");
        };
        assert_eq!(cases.len(), 2);
        assert!(alternative.is_some());
    }

    #[test]
    fn string_escapes_are_decoded() {
        let expr = only_expr(r#""a\nb\t\"c\"\0""#);
        assert!(
            matches!(expr.kind, Expression::StringLiteral(ref s) if s == "a\nb\t\"c\"\0")
        );
    }

    #[test]
    fn parse_errors_carry_positions() {
        let err = parse_err("var = 1");
        assert_eq!(err.kind, ape_core::ErrorKind::Parsing);
        assert!(err.pos.is_valid());
    }

    #[test]
    fn recover_statement_parses() {
        let stmts = parse("var f = function() { recover (e) { return e } return crash() }");
        assert!(matches!(stmts[0].kind, Statement::Define { .. }));
    }
}
