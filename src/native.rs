//! Host functions: registry, arity signatures and the built-in prelude.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::value::Value;

/// Failure reported by a host function.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NativeError {
    /// Recoverable; scripts can catch it with `TRY`.
    #[error("{0}")]
    Failed(String),
    /// The host wants the script stopped. Still catchable, reported as `Halted`.
    #[error("{0}")]
    Halt(String),
}

pub type NativeResult = Result<Value, NativeError>;

type NativeFnType = Rc<dyn Fn(&[Value]) -> NativeResult>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Range(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::Range(lo, hi) => (lo..=hi).contains(&n),
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{}", k),
            Arity::Range(lo, hi) => write!(f, "{} to {}", lo, hi),
            Arity::AtLeast(k) => write!(f, "at least {}", k),
        }
    }
}

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub arity: Arity,
    func: NativeFnType,
}

impl NativeFunction {
    pub fn call(&self, args: &[Value]) -> NativeResult {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Name → host function. Lookups try the exact name first, then its
/// uppercase form, so `say` reaches a registered `SAY`.
#[derive(Clone, Debug, Default)]
pub struct NativeRegistry {
    fns: HashMap<String, NativeFunction>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the value helpers every script can use.
    pub fn with_prelude() -> Self {
        let mut reg = Self::new();
        register_prelude(&mut reg);
        reg
    }

    /// Adds or replaces `name`. The interpreter checks `arity` before
    /// calling, so `f` only ever sees an accepted argument count.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        f: impl Fn(&[Value]) -> NativeResult + 'static,
    ) {
        let name = name.into();
        self.fns.insert(
            name.clone(),
            NativeFunction {
                name,
                arity,
                func: Rc::new(f),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.fns
            .get(name)
            .or_else(|| self.fns.get(&name.to_ascii_uppercase()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn signature(&self, name: &str) -> Option<Arity> {
        self.get(name).map(|f| f.arity)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

fn number(name: &str, v: &Value) -> Result<f64, NativeError> {
    v.as_f64().ok_or_else(|| {
        NativeError::Failed(format!("{} expects a number, got {}", name, v.type_name()))
    })
}

fn register_prelude(reg: &mut NativeRegistry) {
    reg.register("LEN", Arity::Exact(1), |args| match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(NativeError::Failed(format!(
            "LEN expects a string, got {}",
            other.type_name()
        ))),
    });
    reg.register("STR", Arity::Exact(1), |args| {
        Ok(Value::string(args[0].to_string()))
    });
    reg.register("NUM", Arity::Exact(1), |args| match &args[0] {
        Value::Int(_) | Value::Float(_) => Ok(args[0].clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Str(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Ok(Value::Int(i))
            } else {
                s.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| NativeError::Failed(format!("`{}` is not a number", s)))
            }
        }
        other => Err(NativeError::Failed(format!(
            "cannot convert {} to a number",
            other.type_name()
        ))),
    });
    reg.register("TYPE", Arity::Exact(1), |args| {
        Ok(Value::string(args[0].type_name()))
    });
    reg.register("ABS", Arity::Exact(1), |args| match &args[0] {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| NativeError::Failed("integer overflow".into())),
        v => Ok(Value::Float(number("ABS", v)?.abs())),
    });
    reg.register("MIN", Arity::AtLeast(1), |args| pick(args, "MIN", |a, b| a < b));
    reg.register("MAX", Arity::AtLeast(1), |args| pick(args, "MAX", |a, b| a > b));
    reg.register("FLOOR", Arity::Exact(1), |args| round_with(&args[0], "FLOOR", f64::floor));
    reg.register("ROUND", Arity::Exact(1), |args| round_with(&args[0], "ROUND", f64::round));
    reg.register("ERROR_KIND", Arity::Exact(1), |args| match &args[0] {
        Value::Error(e) => Ok(Value::string(e.kind.name())),
        other => Err(NativeError::Failed(format!(
            "ERROR_KIND expects an error, got {}",
            other.type_name()
        ))),
    });
    reg.register("ERROR_MESSAGE", Arity::Exact(1), |args| match &args[0] {
        Value::Error(e) => Ok(Value::string(e.kind.to_string())),
        other => Err(NativeError::Failed(format!(
            "ERROR_MESSAGE expects an error, got {}",
            other.type_name()
        ))),
    });
    reg.register("FAIL", Arity::Exact(1), |args| {
        Err(NativeError::Failed(args[0].to_string()))
    });
    reg.register("HALT", Arity::Range(0, 1), |args| {
        let reason = args.first().map(Value::to_string).unwrap_or_default();
        Err(NativeError::Halt(reason))
    });
}

fn pick(args: &[Value], name: &str, better: fn(f64, f64) -> bool) -> NativeResult {
    let mut best = &args[0];
    let mut best_n = number(name, best)?;
    for v in &args[1..] {
        let n = number(name, v)?;
        if better(n, best_n) {
            best = v;
            best_n = n;
        }
    }
    Ok(best.clone())
}

fn round_with(v: &Value, name: &str, f: fn(f64) -> f64) -> NativeResult {
    match v {
        Value::Int(_) => Ok(v.clone()),
        _ => {
            let r = f(number(name, v)?);
            if r.is_finite() && r.abs() < i64::MAX as f64 {
                Ok(Value::Int(r as i64))
            } else {
                Ok(Value::Float(r))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_accepts() {
        assert!(Arity::Exact(3).accepts(3));
        assert!(!Arity::Exact(3).accepts(2));
        assert!(Arity::Range(0, 1).accepts(0));
        assert!(!Arity::Range(0, 1).accepts(2));
        assert!(Arity::AtLeast(1).accepts(5));
    }

    #[test]
    fn lookup_falls_back_to_uppercase() {
        let reg = NativeRegistry::with_prelude();
        assert!(reg.contains("len"));
        assert_eq!(reg.signature("MAX"), Some(Arity::AtLeast(1)));
        assert!(!reg.contains("nope"));
    }

    #[test]
    fn prelude_helpers() {
        let reg = NativeRegistry::with_prelude();
        let call = |name: &str, args: &[Value]| reg.get(name).unwrap().call(args);
        assert_eq!(call("LEN", &[Value::string("héllo")]), Ok(Value::Int(5)));
        assert_eq!(call("NUM", &[Value::string(" 2.5 ")]), Ok(Value::Float(2.5)));
        assert_eq!(call("MAX", &[Value::Int(1), Value::Float(3.5), Value::Int(2)]), Ok(Value::Float(3.5)));
        assert_eq!(call("FLOOR", &[Value::Float(2.7)]), Ok(Value::Int(2)));
        assert_eq!(call("TYPE", &[Value::Null]), Ok(Value::string("Null")));
        assert!(matches!(call("HALT", &[]), Err(NativeError::Halt(_))));
    }

    #[test]
    fn empty_registry_has_nothing() {
        assert!(NativeRegistry::new().is_empty());
    }
}
