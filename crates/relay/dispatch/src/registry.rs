//! Name-keyed backend lookup.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use relay_types::{BackendKind, BackendRef, DispatchError};

use crate::backend::Backend;

/// Resolves backend references to callable backends.
pub trait BackendLookup: Send + Sync {
    fn lookup(&self, target: &BackendRef) -> Option<Backend>;

    /// Registered names of one kind, sorted.
    fn known_names(&self, kind: BackendKind) -> Vec<String>;

    /// Resolve `target` or produce an error listing what is known.
    fn resolve(&self, target: &BackendRef) -> Result<Backend, DispatchError> {
        match self.lookup(target) {
            Some(backend) => Ok(backend),
            None => Err(DispatchError::UnknownBackend {
                kind: target.kind,
                name: target.name.clone(),
                known: self.known_names(target.kind),
            }),
        }
    }
}

/// In-memory backend table.
///
/// A registration whose variant does not match the reference's kind is
/// rejected, so `tool:x` can never resolve to a code unit.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<BackendRef, Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, backend: Backend) -> Option<Backend> {
        let target = BackendRef::new(backend.kind(), name);
        self.backends.write().insert(target, backend)
    }

    pub fn with(self, name: impl Into<String>, backend: Backend) -> Self {
        self.register(name, backend);
        self
    }

    pub fn unregister(&self, target: &BackendRef) -> Option<Backend> {
        self.backends.write().remove(target)
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

impl BackendLookup for BackendRegistry {
    fn lookup(&self, target: &BackendRef) -> Option<Backend> {
        self.backends.read().get(target).cloned()
    }

    fn known_names(&self, kind: BackendKind) -> Vec<String> {
        // BTreeMap order sorts by kind, then name.
        self.backends
            .read()
            .keys()
            .filter(|t| t.kind == kind)
            .map(|t| t.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{tool_fn, CodeUnit};
    use serde_json::json;

    #[test]
    fn test_unknown_backend_lists_sorted_names() {
        let registry = BackendRegistry::new()
            .with("weather", tool_fn(|_| Ok(json!("sunny"))))
            .with("calendar", tool_fn(|_| Ok(json!([]))))
            .with("stats", Backend::Code(CodeUnit::python("result = 1")));

        let err = registry.resolve(&BackendRef::tool("wether")).unwrap_err();
        assert_eq!(
            err,
            DispatchError::UnknownBackend {
                kind: BackendKind::Tool,
                name: "wether".into(),
                known: vec!["calendar".into(), "weather".into()],
            }
        );
    }

    #[test]
    fn test_kind_is_part_of_the_key() {
        let registry =
            BackendRegistry::new().with("stats", Backend::Code(CodeUnit::python("result = 1")));
        assert!(registry.lookup(&BackendRef::code("stats")).is_some());
        assert!(registry.lookup(&BackendRef::tool("stats")).is_none());
        assert_eq!(registry.len(), 1);
    }
}
