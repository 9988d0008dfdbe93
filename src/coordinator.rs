//! Coordinator facade: owns the atom store, partition coordinator, and job
//! orchestrator, and is the entry point for running batches.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atom::JobId;
use crate::error::{CoordinatorError, GroundworkResult};
use crate::job::Job;
use crate::orchestrator::{BatchReport, DEFAULT_RETENTION, JobOrchestrator};
use crate::partition::PartitionCoordinator;
use crate::sensitivity::{DEFAULT_PRESSURE_STEP, SensitivityGraph};
use crate::solver::Solver;
use crate::store::AtomStore;
use crate::store::archive::ResultArchive;

/// Configuration for a [`Coordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory holding the atom database and result archive. `None` for
    /// memory-only mode.
    pub data_dir: Option<PathBuf>,
    /// Results kept per job (default: 5).
    pub retention: usize,
    /// Perturbation used for sensitivity pressure (default: 0.1).
    pub pressure_step: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention: DEFAULT_RETENTION,
            pressure_step: DEFAULT_PRESSURE_STEP,
        }
    }
}

impl CoordinatorConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> GroundworkResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| CoordinatorError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> GroundworkResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CoordinatorError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| CoordinatorError::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CoordinatorError> {
        if self.retention == 0 {
            return Err(CoordinatorError::InvalidConfig {
                message: "retention must be > 0".into(),
            });
        }
        if !(self.pressure_step > 0.0 && self.pressure_step <= 1.0) {
            return Err(CoordinatorError::InvalidConfig {
                message: format!("pressure_step must be in (0, 1], got {}", self.pressure_step),
            });
        }
        Ok(())
    }
}

/// Owns every subsystem needed to run jobs against one atom store.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: AtomStore,
    partitions: PartitionCoordinator,
    orchestrator: JobOrchestrator,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> GroundworkResult<Self> {
        config.validate()?;
        tracing::info!(
            data_dir = ?config.data_dir,
            retention = config.retention,
            pressure_step = config.pressure_step,
            "initializing coordinator"
        );

        let orchestrator =
            JobOrchestrator::new(config.retention).with_pressure_step(config.pressure_step);
        let (store, orchestrator) = if let Some(ref dir) = config.data_dir {
            std::fs::create_dir_all(dir).map_err(|_| CoordinatorError::DataDir {
                path: dir.display().to_string(),
            })?;
            let store = AtomStore::open(dir)?;
            let archive = ResultArchive::open(dir)?;
            (store, orchestrator.with_archive(archive))
        } else {
            (AtomStore::memory_only()?, orchestrator)
        };

        Ok(Self {
            config,
            store,
            partitions: PartitionCoordinator::new(),
            orchestrator,
        })
    }

    /// Memory-only coordinator with default settings.
    pub fn memory_only() -> GroundworkResult<Self> {
        Self::new(CoordinatorConfig::default())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &AtomStore {
        &self.store
    }

    pub fn partitions(&self) -> &PartitionCoordinator {
        &self.partitions
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn job(&self, name: &JobId) -> Option<&Job> {
        self.orchestrator.job(name)
    }

    /// Register a job with both the orchestrator and the partition
    /// coordinator.
    pub fn register(&mut self, job: Job) -> GroundworkResult<()> {
        let id = job.id().clone();
        self.orchestrator.register(job)?;
        self.partitions.register(&id);
        Ok(())
    }

    /// Remove a job from every registry and drop its reverse-index entry.
    /// Its rows stay in the store.
    pub fn unregister(&mut self, name: &JobId) -> GroundworkResult<Option<Job>> {
        self.partitions.unregister(name)?;
        let job = self.orchestrator.unregister(name);
        let forgotten = self.store.forget_job(name);
        tracing::debug!(job = %name, atoms = forgotten.len(), "job unregistered");
        Ok(job)
    }

    pub fn run_batch(&mut self, names: &[JobId], solver: &dyn Solver) -> GroundworkResult<BatchReport> {
        Ok(self
            .orchestrator
            .run_batch(names, &self.store, &mut self.partitions, solver)?)
    }

    pub fn explain(&self, name: &JobId) -> GroundworkResult<SensitivityGraph> {
        Ok(self.orchestrator.explain(name)?)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("partitions", &self.partitions)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
