//! Pre-compile constant folding.
//!
//! Folds infix and prefix expressions whose operands are literals: numeric
//! arithmetic/comparison/bitwise over number-or-bool literals, string
//! concatenation, unary minus and boolean negation. Runs bottom-up; the
//! compiler applies it to every expression before emission, so a folded
//! operator never reaches the bytecode.

use crate::ast::{Expr, Expression, Operator};

/// Returns the folded replacement, or `None` when the expression cannot be
/// reduced.
pub fn optimise(expr: &Expr) -> Option<Expr> {
    match &expr.kind {
        Expression::Infix { .. } => optimise_infix(expr),
        Expression::Prefix { .. } => optimise_prefix(expr),
        _ => None,
    }
}

fn numeric_literal(expr: &Expr) -> Option<f64> {
    match expr.kind {
        Expression::NumberLiteral(n) => Some(n),
        Expression::BoolLiteral(b) => Some(if b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn optimise_infix(expr: &Expr) -> Option<Expr> {
    let Expression::Infix { op, left, right } = &expr.kind else {
        return None;
    };
    let left_folded = optimise(left);
    let right_folded = optimise(right);
    let left = left_folded.as_ref().unwrap_or(left);
    let right = right_folded.as_ref().unwrap_or(right);

    let kind = match (numeric_literal(left), numeric_literal(right)) {
        (Some(l), Some(r)) => {
            let li = l as i64;
            let ri = r as i64;
            match op {
                Operator::Plus => Some(Expression::NumberLiteral(l + r)),
                Operator::Minus => Some(Expression::NumberLiteral(l - r)),
                Operator::Asterisk => Some(Expression::NumberLiteral(l * r)),
                Operator::Slash => Some(Expression::NumberLiteral(l / r)),
                Operator::Modulus => Some(Expression::NumberLiteral(l % r)),
                Operator::Lt => Some(Expression::BoolLiteral(l < r)),
                Operator::Lte => Some(Expression::BoolLiteral(l <= r)),
                Operator::Gt => Some(Expression::BoolLiteral(l > r)),
                Operator::Gte => Some(Expression::BoolLiteral(l >= r)),
                Operator::Eq => Some(Expression::BoolLiteral(l == r)),
                Operator::NotEq => Some(Expression::BoolLiteral(l != r)),
                Operator::BitAnd => Some(Expression::NumberLiteral((li & ri) as f64)),
                Operator::BitOr => Some(Expression::NumberLiteral((li | ri) as f64)),
                Operator::BitXor => Some(Expression::NumberLiteral((li ^ ri) as f64)),
                Operator::Lshift => {
                    Some(Expression::NumberLiteral(li.wrapping_shl(ri as u32) as f64))
                }
                Operator::Rshift => {
                    Some(Expression::NumberLiteral(li.wrapping_shr(ri as u32) as f64))
                }
                _ => None,
            }
        }
        _ => match (&left.kind, &right.kind) {
            (Expression::StringLiteral(l), Expression::StringLiteral(r))
                if *op == Operator::Plus =>
            {
                Some(Expression::StringLiteral(format!("{}{}", l, r)))
            }
            _ => None,
        },
    };

    // when this node cannot fold, child folds are dropped here; the
    // compiler re-optimises each subexpression as it descends
    kind.map(|kind| Expr::new(kind, expr.pos.clone()))
}

fn optimise_prefix(expr: &Expr) -> Option<Expr> {
    let Expression::Prefix { op, right } = &expr.kind else {
        return None;
    };
    let right_folded = optimise(right);
    let right = right_folded.as_ref().unwrap_or(right);
    let kind = match (op, &right.kind) {
        (Operator::Minus, Expression::NumberLiteral(n)) => Some(Expression::NumberLiteral(-n)),
        (Operator::Bang, Expression::BoolLiteral(b)) => Some(Expression::BoolLiteral(!b)),
        _ => None,
    };
    kind.map(|kind| Expr::new(kind, expr.pos.clone()))
}
