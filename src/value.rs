//! Runtime values and the operator semantics shared by the interpreter and
//! the constant folder.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::ast::{BinaryOp, FunctionDecl, Literal, UnaryOp};
use crate::environment::{Closure, ScopeId};
use crate::error::{RuntimeError, RuntimeErrorKind};

pub type EvalResult = Result<Value, RuntimeError>;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Function(Rc<UserFunction>),
    /// A caught runtime error, bound by `CATCH $e`.
    Error(Rc<RuntimeError>),
}

/// Where a function finds its free variables.
#[derive(Clone, Debug)]
pub enum FunctionEnv {
    /// The defining scope is still on the chain.
    Live(ScopeId),
    /// The defining scope exited while the function was reachable.
    Closed(Rc<Closure>),
}

/// A user-defined function value. Copies of a `Value::Function` share one
/// `UserFunction`, so converting its environment updates every copy.
pub struct UserFunction {
    pub decl: Rc<FunctionDecl>,
    free_vars: Vec<String>,
    env: RefCell<FunctionEnv>,
}

impl UserFunction {
    pub fn new(decl: Rc<FunctionDecl>, env: FunctionEnv) -> Rc<Self> {
        let free_vars = decl.free_variables();
        Rc::new(Self {
            decl,
            free_vars,
            env: RefCell::new(env),
        })
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn arity(&self) -> usize {
        self.decl.params.len()
    }

    pub fn free_vars(&self) -> &[String] {
        &self.free_vars
    }

    pub fn env(&self) -> FunctionEnv {
        self.env.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.env.borrow(), FunctionEnv::Closed(_))
    }

    pub(crate) fn close_over(&self, closure: Closure) {
        *self.env.borrow_mut() = FunctionEnv::Closed(Rc::new(closure));
    }
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFunction")
            .field("name", &self.decl.name)
            .field("params", &self.decl.params)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Function(func) => write!(f, "Function({})", func.name()),
            Value::Error(e) => write!(f, "Error({})", e.kind.name()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Error(e) => write!(f, "{}", e.kind),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::string(s.as_str()),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
            Value::Function(_) => "Function",
            Value::Error(_) => "Error",
        }
    }

    /// Truthiness used by every condition and by `!`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Function(_) | Value::Error(_) => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Back to a literal, for values the optimizer may embed in the tree.
    pub fn to_literal(&self) -> Option<Literal> {
        match self {
            Value::Null => Some(Literal::Null),
            Value::Bool(b) => Some(Literal::Bool(*b)),
            Value::Int(i) => Some(Literal::Int(*i)),
            Value::Float(f) if f.is_finite() => Some(Literal::Float(*f)),
            Value::Str(s) => Some(Literal::Str(s.to_string())),
            _ => None,
        }
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.as_f64() == b.as_f64()
        }
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Error(x), Value::Error(y)) => x == y,
        _ => false,
    }
}

fn mismatch(op: BinaryOp, l: &Value, r: &Value) -> RuntimeErrorKind {
    RuntimeErrorKind::TypeMismatch(format!(
        "cannot apply `{}` to {} and {}",
        op,
        l.type_name(),
        r.type_name()
    ))
}

fn overflow() -> RuntimeErrorKind {
    RuntimeErrorKind::TypeMismatch("integer overflow".into())
}

/// Applies a non-short-circuit binary operator. `&&`/`||` are handled by
/// the caller since their right operand may not be evaluated.
pub fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeErrorKind> {
    use BinaryOp::*;
    match op {
        Add => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::string(format!("{}{}", l, r))),
            _ => float_op(op, l, r, |a, b| a + b),
        },
        Sub => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int).ok_or_else(overflow),
            _ => float_op(op, l, r, |a, b| a - b),
        },
        Mul => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int).ok_or_else(overflow),
            _ => float_op(op, l, r, |a, b| a * b),
        },
        Div => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeErrorKind::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => {
                let rem = a.checked_rem(*b).ok_or_else(overflow)?;
                if rem == 0 {
                    a.checked_div(*b).map(Value::Int).ok_or_else(overflow)
                } else {
                    Ok(Value::Float(*a as f64 / *b as f64))
                }
            }
            _ => {
                if r.as_f64() == Some(0.0) {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                float_op(op, l, r, |a, b| a / b)
            }
        },
        Rem => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeErrorKind::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => a.checked_rem(*b).map(Value::Int).ok_or_else(overflow),
            _ => {
                if r.as_f64() == Some(0.0) {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                float_op(op, l, r, |a, b| a % b)
            }
        },
        Eq => Ok(Value::Bool(values_equal(l, r))),
        Ne => Ok(Value::Bool(!values_equal(l, r))),
        Lt | Le | Gt | Ge => compare(op, l, r),
        And | Or => Err(RuntimeErrorKind::UnknownOperator(format!(
            "`{}` needs short-circuit evaluation",
            op
        ))),
    }
}

fn float_op(
    op: BinaryOp,
    l: &Value,
    r: &Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, RuntimeErrorKind> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
        _ => match (l, r) {
            (Value::Str(_), Value::Str(_)) => Err(RuntimeErrorKind::UnknownOperator(format!(
                "`{}` is not defined for strings",
                op
            ))),
            _ => Err(mismatch(op, l, r)),
        },
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeErrorKind> {
    let ord = match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(mismatch(op, l, r)),
        },
    };
    // NaN compares false on every ordering
    let Some(ord) = ord else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Lt => ord.is_lt(),
        BinaryOp::Le => ord.is_le(),
        BinaryOp::Gt => ord.is_gt(),
        BinaryOp::Ge => ord.is_ge(),
        _ => return Err(RuntimeErrorKind::UnknownOperator(op.to_string())),
    };
    Ok(Value::Bool(result))
}

pub fn apply_unary(op: UnaryOp, v: &Value) -> Result<Value, RuntimeErrorKind> {
    match (op, v) {
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(RuntimeErrorKind::TypeMismatch(format!(
            "cannot negate {}",
            other.type_name()
        ))),
        (UnaryOp::Not, other) => Ok(Value::Bool(!other.is_truthy())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_division_stays_exact() {
        assert_eq!(apply_binary(BinaryOp::Div, &Value::Int(6), &Value::Int(3)), Ok(Value::Int(2)));
        assert_eq!(
            apply_binary(BinaryOp::Div, &Value::Int(5), &Value::Int(2)),
            Ok(Value::Float(2.5))
        );
    }

    #[test]
    fn division_by_zero() {
        for r in [Value::Int(0), Value::Float(0.0)] {
            assert_eq!(
                apply_binary(BinaryOp::Div, &Value::Int(5), &r),
                Err(RuntimeErrorKind::DivisionByZero)
            );
            assert_eq!(
                apply_binary(BinaryOp::Rem, &Value::Int(5), &r),
                Err(RuntimeErrorKind::DivisionByZero)
            );
        }
    }

    #[test]
    fn string_concat_uses_display() {
        let v = apply_binary(BinaryOp::Add, &Value::string("hp: "), &Value::Int(7)).unwrap();
        assert_eq!(v.as_str(), Some("hp: 7"));
    }

    #[test]
    fn string_minus_is_unknown_operator() {
        let err = apply_binary(BinaryOp::Sub, &Value::string("a"), &Value::string("b")).unwrap_err();
        assert!(matches!(err, RuntimeErrorKind::UnknownOperator(_)));
    }

    #[test]
    fn mixed_types_mismatch() {
        let err = apply_binary(BinaryOp::Mul, &Value::Bool(true), &Value::Int(2)).unwrap_err();
        assert!(matches!(err, RuntimeErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn overflow_is_reported() {
        let err = apply_binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1)).unwrap_err();
        assert_eq!(err, RuntimeErrorKind::TypeMismatch("integer overflow".into()));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(f64::NAN).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::Int(-1).is_truthy());
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::string("2"));
    }
}
