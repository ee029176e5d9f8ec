use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::bridge::HostType;
use super::evaluator::{EvalError, EvalResult};
use super::governor::Governor;
use super::value::Value;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

fn check_identifier(name: &str) -> EvalResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(EvalError::InvalidOperation(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

/// A name-resolution frame.
///
/// Bindings, types and packages live in sharded maps so a scope can be read
/// and written from several tasks at once. Child scopes hold their parent by
/// `Arc`; closures keep their defining scope alive the same way. Every child
/// occupies one slot of the governor's live-scope ceiling until dropped.
#[derive(Debug)]
pub struct Scope {
    vars: DashMap<String, Value>,
    types: DashMap<String, HostType>,
    packages: DashMap<String, Arc<Scope>>,
    parent: Option<Arc<Scope>>,
    governor: Arc<Governor>,
    counted: bool,
}

impl Scope {
    pub fn new_root(governor: Arc<Governor>) -> Arc<Self> {
        Arc::new(Self {
            vars: DashMap::new(),
            types: DashMap::new(),
            packages: DashMap::new(),
            parent: None,
            governor,
            counted: false,
        })
    }

    pub fn new() -> Arc<Self> {
        Self::new_root(Arc::new(Governor::default()))
    }

    /// Fails with the fatal `ScopeLimit` error once the ceiling is reached.
    pub fn new_child(self: &Arc<Self>) -> EvalResult<Arc<Self>> {
        self.governor.acquire()?;
        Ok(Arc::new(Self {
            vars: DashMap::new(),
            types: DashMap::new(),
            packages: DashMap::new(),
            parent: Some(self.clone()),
            governor: self.governor.clone(),
            counted: true,
        }))
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    /// Create or overwrite a binding in this scope only.
    pub fn define(&self, name: &str, value: Value) -> EvalResult<()> {
        check_identifier(name)?;
        self.vars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> EvalResult<Value> {
        self.lookup(name).ok_or_else(|| EvalError::UndefinedSymbol {
            name: name.to_string(),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.vars.get(name) {
                return Some(value.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    /// Mutate the nearest existing binding.
    pub fn set(&self, name: &str, value: Value) -> EvalResult<()> {
        let mut scope = self;
        loop {
            if let Some(mut slot) = scope.vars.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            match scope.parent.as_deref() {
                Some(parent) => scope = parent,
                None => {
                    return Err(EvalError::UndefinedSymbol {
                        name: name.to_string(),
                    })
                }
            }
        }
    }

    /// Plain assignment: mutate the nearest binding, or define here when none exists.
    pub fn assign(&self, name: &str, value: Value) -> EvalResult<()> {
        match self.set(name, value.clone()) {
            Err(EvalError::UndefinedSymbol { .. }) => self.define(name, value),
            other => other,
        }
    }

    pub fn contains_local(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn delete(&self, name: &str) -> bool {
        self.vars.remove(name).is_some()
    }

    pub fn define_type(&self, name: &str, ty: HostType) -> EvalResult<()> {
        check_identifier(name)?;
        self.types.insert(name.to_string(), ty);
        Ok(())
    }

    pub fn get_type(&self, name: &str) -> Option<HostType> {
        let mut scope = self;
        loop {
            if let Some(ty) = scope.types.get(name) {
                return Some(ty.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    pub fn define_package(&self, name: &str, package: Arc<Scope>) -> EvalResult<()> {
        check_identifier(name)?;
        self.packages.insert(name.to_string(), package);
        Ok(())
    }

    pub fn get_package(&self, name: &str) -> Option<Arc<Scope>> {
        let mut scope = self;
        loop {
            if let Some(package) = scope.packages.get(name) {
                return Some(package.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    /// Sorted names bound directly in this scope.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vars.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop every binding, type and package held directly by this scope.
    /// Breaks closure cycles that run through the scope's own bindings.
    pub fn clear(&self) {
        self.vars.clear();
        self.types.clear();
        for entry in self.packages.iter() {
            entry.value().clear();
        }
        self.packages.clear();
    }

    /// Detached copy of this scope's own bindings, with containers deep-copied.
    /// The copy shares the parent chain and uses `governor` for its children.
    pub fn deep_copy(&self, governor: Arc<Governor>) -> Arc<Scope> {
        let copy = Scope {
            vars: DashMap::new(),
            types: DashMap::new(),
            packages: DashMap::new(),
            parent: self.parent.clone(),
            governor: governor.clone(),
            counted: false,
        };
        for entry in self.vars.iter() {
            copy.vars.insert(entry.key().clone(), entry.value().deep_copy());
        }
        for entry in self.types.iter() {
            copy.types.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.packages.iter() {
            copy.packages
                .insert(entry.key().clone(), entry.value().deep_copy(governor.clone()));
        }
        debug!(bindings = copy.vars.len(), "scope deep-copied");
        Arc::new(copy)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.counted {
            self.governor.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_walks_parent_chain() {
        let root = Scope::new();
        root.define("a", Value::Int(1)).unwrap();
        let child = root.new_child().unwrap();
        assert_eq!(child.get("a").unwrap(), Value::Int(1));
        assert!(matches!(
            child.get("missing"),
            Err(EvalError::UndefinedSymbol { name }) if name == "missing"
        ));
    }

    #[test]
    fn test_set_mutates_nearest_binding() {
        let root = Scope::new();
        root.define("a", Value::Int(1)).unwrap();
        let child = root.new_child().unwrap();
        child.set("a", Value::Int(2)).unwrap();
        assert_eq!(root.get("a").unwrap(), Value::Int(2));
        assert!(child.set("b", Value::Nil).is_err());
    }

    #[test]
    fn test_define_shadows_without_touching_parent() {
        let root = Scope::new();
        root.define("a", Value::Int(1)).unwrap();
        let child = root.new_child().unwrap();
        child.define("a", Value::Int(2)).unwrap();
        assert_eq!(child.get("a").unwrap(), Value::Int(2));
        assert_eq!(root.get("a").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_assign_defines_locally_when_absent() {
        let root = Scope::new();
        let child = root.new_child().unwrap();
        child.assign("x", Value::Int(5)).unwrap();
        assert!(child.contains_local("x"));
        assert!(root.lookup("x").is_none());
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let root = Scope::new();
        for name in ["", "1a", "a-b", "a b"] {
            assert!(root.define(name, Value::Nil).is_err(), "{:?}", name);
        }
        root.define("_ok9", Value::Nil).unwrap();
    }

    #[test]
    fn test_children_count_against_ceiling() {
        let governor = Arc::new(Governor::new(2));
        let root = Scope::new_root(governor.clone());
        let a = root.new_child().unwrap();
        let b = a.new_child().unwrap();
        assert!(matches!(b.new_child(), Err(EvalError::ScopeLimit { limit: 2 })));
        drop(b);
        assert_eq!(governor.live(), 1);
        a.new_child().unwrap();
    }

    #[test]
    fn test_types_and_packages_resolve_through_chain() {
        let root = Scope::new();
        root.define_type("Celsius", HostType::float()).unwrap();
        let pkg = Scope::new();
        pkg.define("pi", Value::Float(2.5)).unwrap();
        root.define_package("math", pkg).unwrap();

        let child = root.new_child().unwrap();
        assert_eq!(child.get_type("Celsius"), Some(HostType::float()));
        assert_eq!(
            child.get_package("math").unwrap().get("pi").unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn test_deep_copy_is_detached() {
        let root = Scope::new();
        root.define("list", Value::list(vec![Value::Int(1)])).unwrap();
        let copy = root.deep_copy(root.governor().clone());
        copy.set("list", Value::Nil).unwrap();
        assert_eq!(root.get("list").unwrap(), Value::list(vec![Value::Int(1)]));
        assert_eq!(copy.names(), vec!["list".to_string()]);
    }
}
