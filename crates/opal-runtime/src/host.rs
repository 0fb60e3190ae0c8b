//! Host Functions
//!
//! Host closures are the boundary to ordinarily generated code: step
//! bodies call them by `HostFuncId`, and the environment links closures
//! against a module's host table by name before a driver starts.

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;
use opal_compiler::ir::HostFuncId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A host closure; `Err` is a thrown user fault
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, Value> + Send + Sync>;

/// Named host closures to link a module against
#[derive(Clone, Default)]
pub struct HostEnv {
    funcs: FxHashMap<String, HostFn>,
}

impl HostEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host closure under a name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    ) {
        self.funcs.insert(name.into(), Arc::new(f));
    }

    /// Resolve every name in a module's host table
    ///
    /// A missing name is a hard wiring failure: drivers refuse to start
    /// rather than fault at the first call.
    pub fn link(&self, table: &[String]) -> RuntimeResult<LinkedHost> {
        let mut funcs = Vec::with_capacity(table.len());
        for name in table {
            let f = self
                .funcs
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::MissingHostFunction { name: name.clone() })?;
            funcs.push(f);
        }
        Ok(LinkedHost { funcs })
    }
}

/// Host closures resolved against one module's table
#[derive(Clone, Default)]
pub struct LinkedHost {
    funcs: Vec<HostFn>,
}

impl std::fmt::Debug for LinkedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedHost")
            .field("funcs", &self.funcs.len())
            .finish()
    }
}

impl LinkedHost {
    /// Invoke a host function; `Err` is a thrown user fault
    pub fn call(&self, id: HostFuncId, args: &[Value]) -> Result<Value, Value> {
        match self.funcs.get(id.as_u32() as usize) {
            Some(f) => f(args),
            None => Err(Value::str(format!("unlinked host function {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_missing_name_fails() {
        let env = HostEnv::new();
        let err = env.link(&["log".to_string()]).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingHostFunction { name } if name == "log"));
    }

    #[test]
    fn test_linked_call_dispatches_by_id() {
        let mut env = HostEnv::new();
        env.register("double", |args| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
        });
        let linked = env.link(&["double".to_string()]).unwrap();
        let out = linked.call(HostFuncId(0), &[Value::Int(21)]).unwrap();
        assert_eq!(out, Value::Int(42));
    }
}
