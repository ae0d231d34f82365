//! Lazy model registry.
//!
//! Runners come up on first request for their id. The registry map is
//! guarded by one mutex held across the load, which serializes
//! concurrent first-loads: exactly one caller builds the runner, every
//! other caller blocks and then observes the same `Arc`. A failed load
//! inserts nothing, so the next request for that id retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::info;

use eig_backend::{AcceleratorBackend, Runner};
use eig_core::config::ModelConfig;

use crate::error::ManagerError;

/// Registry of configured models and their lazily-loaded runners.
///
/// Owned by the gateway for the process lifetime; runners are handed
/// out as `Arc`s whose identity is stable until shutdown.
pub struct ModelManager {
    backend: Arc<dyn AcceleratorBackend>,
    configs: HashMap<String, ModelConfig>,
    runners: Mutex<HashMap<String, Arc<Runner>>>,
}

impl ModelManager {
    pub fn new(backend: Arc<dyn AcceleratorBackend>, models: &[ModelConfig]) -> Self {
        let configs = models
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        Self {
            backend,
            configs,
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the runner for `id`, loading it on first use.
    pub fn get_or_load(&self, id: &str) -> Result<Arc<Runner>, ManagerError> {
        let mut runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runner) = runners.get(id) {
            return Ok(runner.clone());
        }

        let config = self
            .configs
            .get(id)
            .ok_or_else(|| ManagerError::UnknownModel(id.to_string()))?;

        let started = Instant::now();
        let runner = Runner::load(
            self.backend.clone(),
            id,
            &config.engine,
            config.concurrency,
        )
        .map_err(|source| ManagerError::Load {
            id: id.to_string(),
            source,
        })?;
        let runner = Arc::new(runner);
        runners.insert(id.to_string(), runner.clone());
        info!(
            model = id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "runner ready"
        );
        Ok(runner)
    }

    /// Number of runners currently loaded.
    pub fn loaded(&self) -> usize {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use eig_backend::{StubBackend, StubEngineSpec};
    use eig_core::types::{BindingDesc, DType, Direction};

    use super::*;

    fn classifier_spec() -> StubEngineSpec {
        StubEngineSpec {
            bindings: vec![
                BindingDesc {
                    name: "data".into(),
                    direction: Direction::Input,
                    dtype: DType::Fp32,
                    shape: vec![1, 3, 4, 4],
                },
                BindingDesc {
                    name: "prob".into(),
                    direction: Direction::Output,
                    dtype: DType::Fp32,
                    shape: vec![1, 10],
                },
            ],
        }
    }

    fn write_engine(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&classifier_spec().to_bytes()).unwrap();
        path
    }

    fn model(id: &str, engine: std::path::PathBuf, concurrency: usize) -> ModelConfig {
        ModelConfig {
            id: id.into(),
            engine,
            concurrency,
        }
    }

    #[test]
    fn unknown_model_is_status_2() {
        let backend = Arc::new(StubBackend::new());
        let manager = ModelManager::new(backend, &[]);
        let err = manager.get_or_load("nope").unwrap_err();
        assert!(matches!(err, ManagerError::UnknownModel(_)));
        assert_eq!(err.status_code(), 2);
    }

    #[test]
    fn concurrent_lookups_load_once_and_share_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_engine(dir.path(), "m.eng");
        let backend = Arc::new(StubBackend::new());
        let manager = Arc::new(ModelManager::new(
            backend.clone(),
            &[model("m", engine, 1)],
        ));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.get_or_load("m").unwrap())
            })
            .collect();
        let runners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(backend.engine_loads(), 1);
        for runner in &runners[1..] {
            assert!(Arc::ptr_eq(&runners[0], runner));
        }
        assert_eq!(manager.loaded(), 1);
    }

    #[test]
    fn failed_load_is_retried_on_the_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("late.eng");
        let backend = Arc::new(StubBackend::new());
        let manager = ModelManager::new(backend, &[model("late", missing.clone(), 1)]);

        let err = manager.get_or_load("late").unwrap_err();
        assert!(matches!(err, ManagerError::Load { .. }));
        assert_eq!(err.status_code(), 4);
        assert_eq!(manager.loaded(), 0);

        // The artifact shows up; the same id now loads.
        std::fs::write(&missing, classifier_spec().to_bytes()).unwrap();
        assert!(manager.get_or_load("late").is_ok());
        assert_eq!(manager.loaded(), 1);
    }
}
