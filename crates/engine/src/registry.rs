//! Worker type registry: maps a type tag to its script.

use tidepool_core::PoolError;

use crate::transport::script::ScriptSpec;

/// Worker type names the runtime knows by convention. A pool only serves
/// the subset it was actually given scripts for.
pub const BUILTIN_WORKER_TYPES: &[&str] = &["calc", "image", "stream", "canvas"];

/// Per-pool mapping from worker-type tag to script spec.
///
/// Entries supplied at pool construction are the pool's built-ins;
/// `register_custom` adds more at runtime. Names never collide.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    builtin: Vec<(String, ScriptSpec)>,
    custom: Vec<(String, ScriptSpec)>,
}

impl WorkerRegistry {
    /// Registry seeded with the pool's built-in scripts.
    pub fn new(builtin: impl IntoIterator<Item = (String, ScriptSpec)>) -> Self {
        Self {
            builtin: builtin.into_iter().collect(),
            custom: Vec::new(),
        }
    }

    /// Script spec for a worker type.
    pub fn get(&self, worker_type: &str) -> Result<&ScriptSpec, PoolError> {
        self.builtin
            .iter()
            .chain(self.custom.iter())
            .find(|(name, _)| name == worker_type)
            .map(|(_, spec)| spec)
            .ok_or_else(|| PoolError::UnknownWorkerType(worker_type.to_string()))
    }

    /// True when the name resolves to any registered type.
    pub fn contains(&self, worker_type: &str) -> bool {
        self.get(worker_type).is_ok()
    }

    /// Adds a custom worker type; any collision with a built-in or custom
    /// name is an error.
    pub fn register_custom(
        &mut self,
        name: impl Into<String>,
        spec: ScriptSpec,
    ) -> Result<(), PoolError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PoolError::DuplicateWorkerType(name));
        }
        self.custom.push((name, spec));
        Ok(())
    }

    /// Names registered at construction.
    pub fn list_builtin(&self) -> Vec<&str> {
        self.builtin.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Names registered at runtime.
    pub fn list_custom(&self) -> Vec<&str> {
        self.custom.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::env::ScriptLocator;
    use crate::transport::script::WorkerScript;

    fn spec(name: &str) -> ScriptSpec {
        ScriptSpec::new(
            ScriptLocator::Url(format!("https://workers.test/{name}.worker.js")),
            || WorkerScript::spawned(|_io| async {}),
        )
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = WorkerRegistry::new([("calc".to_string(), spec("calc"))]);
        assert!(registry.get("calc").is_ok());
        assert!(matches!(
            registry.get("weather"),
            Err(PoolError::UnknownWorkerType(t)) if t == "weather"
        ));
    }

    #[test]
    fn custom_names_cannot_shadow_builtins() {
        let mut registry = WorkerRegistry::new([("calc".to_string(), spec("calc"))]);
        assert!(matches!(
            registry.register_custom("calc", spec("calc")),
            Err(PoolError::DuplicateWorkerType(_))
        ));

        registry
            .register_custom("custom:fractal", spec("fractal"))
            .unwrap();
        assert!(matches!(
            registry.register_custom("custom:fractal", spec("fractal")),
            Err(PoolError::DuplicateWorkerType(_))
        ));

        assert_eq!(registry.list_builtin(), vec!["calc"]);
        assert_eq!(registry.list_custom(), vec!["custom:fractal"]);
    }
}
