//! Scope arena, binding lookup and closure conversion.
//!
//! Scopes live in a generational arena and point at their parent by id.
//! When a scope exits, every function declared in it that is still
//! reachable from elsewhere gets a snapshot of its free variables, so the
//! scope itself can be dropped at once.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::DeclarationError;
use crate::value::{FunctionEnv, UserFunction, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
    Module,
}

/// Handle into the arena. A handle whose scope has exited never resolves
/// again, even after its slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

#[derive(Clone, Debug)]
pub struct Binding {
    pub name: String,
    pub value: Value,
    pub mutable: bool,
    pub reads: u64,
    pub writes: u64,
}

/// Free-variable values copied out of an exited scope.
#[derive(Clone, Debug)]
pub struct Closure {
    bindings: Vec<(String, Captured)>,
    /// Top-level scope whose bindings the function keeps reading live.
    home: ScopeId,
}

#[derive(Clone, Debug)]
enum Captured {
    Value(Value),
    /// The function refers to itself. Stored as a marker so the snapshot
    /// does not keep its own function alive.
    SelfRef,
}

impl Closure {
    fn find(&self, name: &str) -> Option<usize> {
        self.bindings.iter().position(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Captured environment of the closed function a `Function` scope runs.
#[derive(Clone, Debug)]
struct ClosureFrame {
    env: Rc<Closure>,
    function: Rc<UserFunction>,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    parent: Option<ScopeId>,
    bindings: Vec<Binding>,
    index: HashMap<String, usize>,
    frame: Option<ClosureFrame>,
    functions: Vec<Weak<UserFunction>>,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            bindings: Vec::new(),
            index: HashMap::new(),
            frame: None,
            functions: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.index.get(name).map(|&i| &self.bindings[i])
    }
}

/// Where a name resolved to.
#[derive(Clone, Copy, Debug)]
enum Location {
    Slot(ScopeId, usize),
    Captured(ScopeId, usize),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("undefined variable `{0}`")]
    Undefined(String),
    #[error("cannot assign to immutable binding `{0}`")]
    Immutable(String),
    #[error("scope handle is no longer live")]
    Stale,
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    scope: Option<Scope>,
}

#[derive(Debug)]
pub struct ScopeManager {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stack: Vec<ScopeId>,
    global: ScopeId,
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeManager {
    pub fn new() -> Self {
        let mut mgr = Self {
            slots: Vec::new(),
            free: Vec::new(),
            stack: Vec::new(),
            global: ScopeId {
                index: 0,
                generation: 0,
            },
        };
        let global = mgr.create(ScopeKind::Global, None);
        mgr.global = global;
        mgr.stack.push(global);
        mgr
    }

    pub fn global(&self) -> ScopeId {
        self.global
    }

    pub fn current(&self) -> ScopeId {
        self.stack.last().copied().unwrap_or(self.global)
    }

    /// Number of active scopes, global included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Scopes allocated in the arena, active or not.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.scope.is_some()).count()
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.scope.as_ref()
    }

    fn get_mut(&mut self, id: ScopeId) -> Option<&mut Scope> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.scope.as_mut()
    }

    pub fn is_live(&self, id: ScopeId) -> bool {
        self.get(id).is_some()
    }

    /// Allocates a scope without entering it.
    pub fn create(&mut self, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        let scope = Scope::new(kind, parent);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.scope = Some(scope);
            return ScopeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            scope: Some(scope),
        });
        ScopeId {
            index,
            generation: 0,
        }
    }

    pub fn enter(&mut self, id: ScopeId) -> Result<(), ScopeError> {
        if !self.is_live(id) {
            return Err(ScopeError::Stale);
        }
        self.stack.push(id);
        Ok(())
    }

    /// Creates a child of the current scope and enters it.
    pub fn push(&mut self, kind: ScopeKind) -> ScopeId {
        let parent = self.current();
        let id = self.create(kind, Some(parent));
        self.stack.push(id);
        id
    }

    /// Enters a fresh `Function` scope for a call to `func`.
    pub fn push_call(&mut self, func: &Rc<UserFunction>) -> Result<ScopeId, ScopeError> {
        match func.env() {
            FunctionEnv::Live(defining) => {
                if !self.is_live(defining) {
                    return Err(ScopeError::Stale);
                }
                let id = self.create(ScopeKind::Function, Some(defining));
                self.stack.push(id);
                Ok(id)
            }
            FunctionEnv::Closed(env) => {
                // the run that made the closure may be over
                let parent = if self.is_live(env.home) {
                    env.home
                } else {
                    self.global
                };
                let id = self.create(ScopeKind::Function, Some(parent));
                if let Some(scope) = self.get_mut(id) {
                    scope.frame = Some(ClosureFrame {
                        env,
                        function: func.clone(),
                    });
                }
                self.stack.push(id);
                Ok(id)
            }
        }
    }

    /// Leaves the current scope, closing over escaping functions and
    /// freeing its slot. The global scope is never exited.
    pub fn exit(&mut self) -> Option<Scope> {
        if self.stack.len() <= 1 {
            return None;
        }
        let id = self.stack.pop()?;
        self.close_escaping(id);
        let slot = self.slots.get_mut(id.index as usize)?;
        let scope = slot.scope.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        scope
    }

    /// Pops scopes until `depth` remain. Used to unwind after an error.
    pub fn unwind_to(&mut self, depth: usize) {
        while self.stack.len() > depth.max(1) {
            self.exit();
        }
    }

    pub fn define(
        &mut self,
        name: &str,
        value: Value,
        mutable: bool,
    ) -> Result<(), DeclarationError> {
        let id = self.current();
        self.define_in(id, name, value, mutable)
    }

    pub fn define_in(
        &mut self,
        id: ScopeId,
        name: &str,
        value: Value,
        mutable: bool,
    ) -> Result<(), DeclarationError> {
        let Some(scope) = self.get_mut(id) else {
            return Err(DeclarationError::DuplicateVariable(name.to_string()));
        };
        if scope.index.contains_key(name) {
            return Err(DeclarationError::DuplicateVariable(name.to_string()));
        }
        scope.index.insert(name.to_string(), scope.bindings.len());
        scope.bindings.push(Binding {
            name: name.to_string(),
            value,
            mutable,
            reads: 0,
            writes: 0,
        });
        Ok(())
    }

    /// Records a function declared in the current scope so `exit` can
    /// tell whether it escaped.
    pub fn track_function(&mut self, func: &Rc<UserFunction>) {
        let id = self.current();
        if let Some(scope) = self.get_mut(id) {
            scope.functions.push(Rc::downgrade(func));
        }
    }

    fn lookup_from(&self, start: ScopeId, name: &str) -> Option<Location> {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let scope = self.get(id)?;
            if let Some(&i) = scope.index.get(name) {
                return Some(Location::Slot(id, i));
            }
            if let Some(frame) = &scope.frame {
                if let Some(i) = frame.env.find(name) {
                    return Some(Location::Captured(id, i));
                }
            }
            cur = scope.parent;
        }
        None
    }

    fn value_at(&self, loc: Location) -> Option<Value> {
        match loc {
            Location::Slot(id, i) => self.get(id).map(|s| s.bindings[i].value.clone()),
            Location::Captured(id, i) => {
                let frame = self.get(id)?.frame.as_ref()?;
                Some(match &frame.env.bindings[i].1 {
                    Captured::Value(v) => v.clone(),
                    Captured::SelfRef => Value::Function(frame.function.clone()),
                })
            }
        }
    }

    /// Reads `name` from the innermost scope that has it.
    pub fn resolve(&mut self, name: &str) -> Option<Value> {
        let loc = self.lookup_from(self.current(), name)?;
        if let Location::Slot(id, i) = loc {
            if let Some(scope) = self.get_mut(id) {
                scope.bindings[i].reads += 1;
            }
        }
        self.value_at(loc)
    }

    /// Reads `name` without touching usage counters.
    pub fn peek(&self, name: &str) -> Option<Value> {
        self.lookup_from(self.current(), name)
            .and_then(|loc| self.value_at(loc))
    }

    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        match self.lookup_from(self.current(), name) {
            None => Err(ScopeError::Undefined(name.to_string())),
            Some(Location::Captured(..)) => Err(ScopeError::Immutable(name.to_string())),
            Some(Location::Slot(id, i)) => {
                let scope = self.get_mut(id).ok_or(ScopeError::Stale)?;
                let binding = &mut scope.bindings[i];
                if !binding.mutable {
                    return Err(ScopeError::Immutable(name.to_string()));
                }
                binding.value = value;
                binding.writes += 1;
                Ok(())
            }
        }
    }

    /// Replaces a global binding regardless of mutability. Hosts use this
    /// to refresh read-only state between runs.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        let global = self.global;
        let scope = self.get_mut(global).ok_or(ScopeError::Stale)?;
        let &i = scope
            .index
            .get(name)
            .ok_or_else(|| ScopeError::Undefined(name.to_string()))?;
        scope.bindings[i].value = value;
        scope.bindings[i].writes += 1;
        Ok(())
    }

    fn close_escaping(&mut self, id: ScopeId) {
        let Some(scope) = self.get(id) else {
            return;
        };
        let declared: Vec<Rc<UserFunction>> = scope
            .functions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|f| matches!(f.env(), FunctionEnv::Live(s) if s == id))
            .collect();
        if declared.is_empty() {
            return;
        }

        // `declared` holds one strong ref per function; anything beyond
        // that and the scope's own bindings lives outside this scope.
        let mut escaping: Vec<usize> = declared
            .iter()
            .enumerate()
            .filter(|&(_, f)| {
                let held_here = scope
                    .bindings
                    .iter()
                    .filter(|b| matches!(&b.value, Value::Function(g) if Rc::ptr_eq(f, g)))
                    .count();
                Rc::strong_count(f) > 1 + held_here
            })
            .map(|(i, _)| i)
            .collect();

        let mut snapshots: Vec<(usize, Closure)> = Vec::new();
        let mut next = 0;
        while next < escaping.len() {
            let i = escaping[next];
            next += 1;
            let closure = self.snapshot(&declared[i], id);
            // a captured sibling escapes along with this one
            for (_, captured) in &closure.bindings {
                if let Captured::Value(Value::Function(g)) = captured {
                    if let Some(j) = declared.iter().position(|f| Rc::ptr_eq(f, g)) {
                        if !escaping.contains(&j) {
                            escaping.push(j);
                        }
                    }
                }
            }
            snapshots.push((i, closure));
        }

        for (i, closure) in snapshots {
            declared[i].close_over(closure);
        }
    }

    fn is_top_level(&self, id: ScopeId) -> bool {
        self.get(id)
            .is_some_and(|s| matches!(s.kind, ScopeKind::Global | ScopeKind::Module))
    }

    /// Nearest top-level scope strictly above `from`.
    fn home_of(&self, from: ScopeId) -> ScopeId {
        let mut cur = self.get(from).and_then(Scope::parent);
        while let Some(id) = cur {
            if self.is_top_level(id) {
                return id;
            }
            cur = self.get(id).and_then(Scope::parent);
        }
        self.global
    }

    fn snapshot(&self, func: &Rc<UserFunction>, from: ScopeId) -> Closure {
        let mut bindings = Vec::new();
        for name in func.free_vars() {
            let Some(loc) = self.lookup_from(from, name) else {
                continue;
            };
            // top-level bindings that outlive `from` stay live and are read
            // through the chain at call time
            if let Location::Slot(owner, _) = loc {
                if owner != from && self.is_top_level(owner) {
                    continue;
                }
            }
            let Some(value) = self.value_at(loc) else {
                continue;
            };
            let captured = match &value {
                Value::Function(g) if Rc::ptr_eq(g, func) => Captured::SelfRef,
                _ => Captured::Value(value),
            };
            bindings.push((name.clone(), captured));
        }
        Closure {
            bindings,
            home: self.home_of(from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, ExprKind, FunctionDecl, Span, Stmt, StmtKind};

    fn returns_var(name: &str, var: &str) -> Rc<FunctionDecl> {
        Rc::new(FunctionDecl {
            name: name.into(),
            params: vec![],
            body: vec![Stmt::new(
                StmtKind::Return(Some(Expr::new(
                    ExprKind::Identifier(var.into()),
                    Span::default(),
                ))),
                Span::default(),
            )],
            span: Span::default(),
        })
    }

    #[test]
    fn define_and_resolve_through_chain() {
        let mut mgr = ScopeManager::new();
        mgr.define("$a", Value::Int(1), true).unwrap();
        mgr.push(ScopeKind::Block);
        mgr.define("$b", Value::Int(2), true).unwrap();
        assert_eq!(mgr.resolve("$a"), Some(Value::Int(1)));
        assert_eq!(mgr.resolve("$b"), Some(Value::Int(2)));
        mgr.exit();
        assert_eq!(mgr.resolve("$b"), None);
    }

    #[test]
    fn shadowing_in_inner_scope() {
        let mut mgr = ScopeManager::new();
        mgr.define("$x", Value::Int(1), true).unwrap();
        mgr.push(ScopeKind::Block);
        mgr.define("$x", Value::Int(2), true).unwrap();
        assert_eq!(mgr.resolve("$x"), Some(Value::Int(2)));
        mgr.exit();
        assert_eq!(mgr.resolve("$x"), Some(Value::Int(1)));
    }

    #[test]
    fn duplicate_in_same_scope_is_rejected() {
        let mut mgr = ScopeManager::new();
        mgr.define("$x", Value::Int(1), true).unwrap();
        let err = mgr.define("$x", Value::Int(2), true).unwrap_err();
        assert_eq!(err, DeclarationError::DuplicateVariable("$x".into()));
        let wrapped: ScopeError = err.clone().into();
        assert_eq!(wrapped, ScopeError::Declaration(err));
    }

    #[test]
    fn assign_respects_mutability_and_counts_writes() {
        let mut mgr = ScopeManager::new();
        mgr.define("$c", Value::Int(1), false).unwrap();
        mgr.define("$m", Value::Int(1), true).unwrap();
        assert_eq!(
            mgr.assign("$c", Value::Int(2)),
            Err(ScopeError::Immutable("$c".into()))
        );
        mgr.assign("$m", Value::Int(5)).unwrap();
        mgr.resolve("$m");
        let global = mgr.get(mgr.global()).unwrap();
        let b = global.binding("$m").unwrap();
        assert_eq!((b.reads, b.writes), (1, 1));
        assert_eq!(
            mgr.assign("$nope", Value::Null),
            Err(ScopeError::Undefined("$nope".into()))
        );
    }

    #[test]
    fn stale_handles_never_resolve() {
        let mut mgr = ScopeManager::new();
        let id = mgr.push(ScopeKind::Block);
        mgr.exit();
        assert!(!mgr.is_live(id));
        // slot is reused with a new generation
        let reused = mgr.push(ScopeKind::Block);
        assert!(mgr.is_live(reused));
        assert!(!mgr.is_live(id));
        assert_eq!(mgr.enter(id), Err(ScopeError::Stale));
    }

    #[test]
    fn global_is_never_exited() {
        let mut mgr = ScopeManager::new();
        assert!(mgr.exit().is_none());
        assert_eq!(mgr.depth(), 1);
    }

    #[test]
    fn escaping_function_is_closed_over() {
        let mut mgr = ScopeManager::new();
        let outer = mgr.push(ScopeKind::Function);
        mgr.define("$count", Value::Int(7), true).unwrap();
        let f = UserFunction::new(returns_var("get", "$count"), FunctionEnv::Live(outer));
        mgr.define("get", Value::Function(f.clone()), false).unwrap();
        mgr.track_function(&f);
        // `f` held here plays the role of the returned value
        mgr.exit();
        assert!(f.is_closed());
        assert!(!mgr.is_live(outer));

        mgr.push_call(&f).unwrap();
        assert_eq!(mgr.resolve("$count"), Some(Value::Int(7)));
        assert_eq!(
            mgr.assign("$count", Value::Int(1)),
            Err(ScopeError::Immutable("$count".into()))
        );
        mgr.exit();
    }

    #[test]
    fn non_escaping_function_is_dropped_with_scope() {
        let mut mgr = ScopeManager::new();
        let outer = mgr.push(ScopeKind::Block);
        let f = UserFunction::new(returns_var("get", "$x"), FunctionEnv::Live(outer));
        let weak = Rc::downgrade(&f);
        mgr.define("get", Value::Function(f), false).unwrap();
        mgr.track_function(&weak.upgrade().unwrap());
        mgr.exit();
        assert!(weak.upgrade().is_none());
        assert_eq!(mgr.live_count(), 1);
    }

    #[test]
    fn globals_are_not_snapshotted() {
        let mut mgr = ScopeManager::new();
        mgr.define("$g", Value::Int(1), true).unwrap();
        let outer = mgr.push(ScopeKind::Function);
        let f = UserFunction::new(returns_var("get", "$g"), FunctionEnv::Live(outer));
        mgr.track_function(&f);
        mgr.exit();
        assert!(f.is_closed());
        mgr.assign("$g", Value::Int(2)).unwrap();
        mgr.push_call(&f).unwrap();
        assert_eq!(mgr.resolve("$g"), Some(Value::Int(2)));
        mgr.exit();
    }
}
