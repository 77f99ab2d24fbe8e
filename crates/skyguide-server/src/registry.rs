use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{HandlerError, RegistryError};

pub type HandlerResult = Result<Value, HandlerError>;

/// An RPC method implementation. Receives the request's `params` untouched.
pub type Handler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Method name to handler table. Built once before the server starts and
/// read-only afterwards.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, Handler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, rejecting a name that is already taken.
    pub fn try_register<F>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        if self.methods.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let _ = self.methods.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Register a handler.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. The method table is static
    /// configuration, so a duplicate is a startup bug.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        if let Err(e) = self.try_register(name, handler) {
            panic!("{e}");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_invoke() {
        let mut reg = MethodRegistry::new();
        reg.register("echo", |params| Ok(params.clone()));
        let handler = reg.get("echo").unwrap();
        assert_eq!(handler(&json!([1, 2])).unwrap(), json!([1, 2]));
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut reg = MethodRegistry::new();
        reg.try_register("a", |_| Ok(json!(0))).unwrap();
        let err = reg.try_register("a", |_| Ok(json!(1))).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "a"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    #[should_panic(expected = "method registered twice: a")]
    fn duplicate_register_panics() {
        let mut reg = MethodRegistry::new();
        reg.register("a", |_| Ok(json!(0)));
        reg.register("a", |_| Ok(json!(0)));
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = MethodRegistry::new();
        reg.register("stop_capture", |_| Ok(json!(0)));
        reg.register("guide", |_| Ok(json!(0)));
        reg.register("dither", |_| Ok(json!(0)));
        assert_eq!(reg.names(), vec!["dither", "guide", "stop_capture"]);
        assert!(reg.contains("guide"));
        assert!(!reg.is_empty());
    }
}
