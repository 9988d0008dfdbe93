//! Batch execution of jobs.
//!
//! A batch is prepared by the [`PartitionCoordinator`] on the calling
//! thread, then every job runs its solver on its own scoped thread. Once all
//! workers have joined, every job is cleaned up, whether it succeeded,
//! failed, or panicked. Results are kept in memory (last `retention` per
//! job) and optionally archived.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::atom::{AtomTemplate, JobId};
use crate::error::{JobError, JobFailure};
use crate::job::{Job, JobResult};
use crate::partition::PartitionCoordinator;
use crate::sensitivity::{DEFAULT_PRESSURE_STEP, SensitivityGraph};
use crate::solver::{RuleGrounding, ScopedAtoms, Solver};
use crate::store::archive::ResultArchive;
use crate::store::{AtomStore, PartitionScope};

/// Results kept per job when no retention is configured.
pub const DEFAULT_RETENTION: usize = 5;

/// One finished run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job: JobId,
    /// Run number, increasing per job.
    pub seq: u64,
    /// Final atom values, ordered by atom.
    pub values: Vec<(AtomTemplate, f64)>,
    pub groundings: Vec<RuleGrounding>,
}

impl RunRecord {
    pub fn value(&self, atom: &AtomTemplate) -> Option<f64> {
        self.values
            .binary_search_by(|(a, _)| a.cmp(atom))
            .ok()
            .map(|i| self.values[i].1)
    }

    pub fn values_map(&self) -> BTreeMap<AtomTemplate, f64> {
        self.values.iter().cloned().collect()
    }
}

/// Outcome of one job in a batch.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(RunRecord),
    Failed { job: JobId, failure: JobFailure },
}

impl JobOutcome {
    pub fn job(&self) -> &JobId {
        match self {
            JobOutcome::Completed(r) => &r.job,
            JobOutcome::Failed { job, .. } => job,
        }
    }
}

/// Per-job outcomes of a batch, in submission order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
}

impl BatchReport {
    pub fn completed(&self) -> impl Iterator<Item = &RunRecord> {
        self.outcomes.iter().filter_map(|o| match o {
            JobOutcome::Completed(r) => Some(r),
            JobOutcome::Failed { .. } => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&JobId, &JobFailure)> {
        self.outcomes.iter().filter_map(|o| match o {
            JobOutcome::Failed { job, failure } => Some((job, failure)),
            JobOutcome::Completed(_) => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, job: &JobId) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.job() == job)
    }
}

/// Solver output reduced to what a record needs.
type RunOutput = (BTreeMap<AtomTemplate, f64>, Vec<RuleGrounding>);

/// Job registry, batch runner, and result history.
pub struct JobOrchestrator {
    jobs: BTreeMap<JobId, Job>,
    history: HashMap<JobId, VecDeque<RunRecord>>,
    retention: usize,
    pressure_step: f64,
    archive: Option<ResultArchive>,
}

impl Default for JobOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl JobOrchestrator {
    pub fn new(retention: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            history: HashMap::new(),
            retention: retention.max(1),
            pressure_step: DEFAULT_PRESSURE_STEP,
            archive: None,
        }
    }

    /// Persist every finished run into `archive`.
    pub fn with_archive(mut self, archive: ResultArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_pressure_step(mut self, step: f64) -> Self {
        self.pressure_step = step;
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn register(&mut self, job: Job) -> JobResult<()> {
        if self.jobs.contains_key(job.id()) {
            return Err(JobError::DuplicateJob {
                job: job.id().to_string(),
            });
        }
        tracing::debug!(job = %job.id(), "job registered");
        self.jobs.insert(job.id().clone(), job);
        Ok(())
    }

    /// Remove a job and its in-memory history. Archived results are kept.
    pub fn unregister(&mut self, name: &JobId) -> Option<Job> {
        self.history.remove(name);
        self.jobs.remove(name)
    }

    pub fn job(&self, name: &JobId) -> Option<&Job> {
        self.jobs.get(name)
    }

    pub fn job_mut(&mut self, name: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Retained runs of a job, oldest first.
    pub fn history(&self, name: &JobId) -> Vec<&RunRecord> {
        self.history
            .get(name)
            .map(|h| h.iter().collect())
            .unwrap_or_default()
    }

    /// Most recent run of a job, from memory or the archive.
    pub fn latest(&self, name: &JobId) -> JobResult<Option<RunRecord>> {
        if let Some(record) = self.history.get(name).and_then(|h| h.back()) {
            return Ok(Some(record.clone()));
        }
        match &self.archive {
            Some(archive) => Ok(archive
                .load::<RunRecord>(name)?
                .pop()
                .map(|(_, record)| record)),
            None => Ok(None),
        }
    }

    /// Run a batch of registered jobs.
    ///
    /// Fails as a whole only when the batch cannot be prepared (unknown job
    /// or write conflict). Individual job failures are reported in the
    /// [`BatchReport`].
    pub fn run_batch(
        &mut self,
        names: &[JobId],
        store: &AtomStore,
        partitions: &mut PartitionCoordinator,
        solver: &dyn Solver,
    ) -> JobResult<BatchReport> {
        let mut seen = BTreeSet::new();
        let mut jobs: Vec<&Job> = Vec::with_capacity(names.len());
        for name in names {
            let job = self.jobs.get(name).ok_or_else(|| JobError::UnknownJob {
                job: name.to_string(),
            })?;
            if seen.insert(name) {
                jobs.push(job);
            }
        }

        for job in &jobs {
            partitions.register(job.id());
        }
        partitions.prepare(&jobs, store)?;

        let scopes: Result<Vec<PartitionScope>, _> =
            jobs.iter().map(|j| partitions.scope(j.id())).collect();
        let scopes = match scopes.and_then(|s| partitions.mark_running().map(|()| s)) {
            Ok(scopes) => scopes,
            Err(e) => {
                cleanup_all(&jobs, store, partitions);
                return Err(e.into());
            }
        };

        tracing::info!(jobs = jobs.len(), "batch running");
        let results: Vec<Result<RunOutput, JobFailure>> = thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .zip(scopes)
                .map(|(&job, scope)| s.spawn(move || run_job(store, job, scope, solver)))
                .collect();
            handles
                .into_iter()
                .zip(&jobs)
                .map(|(handle, job)| {
                    handle.join().unwrap_or_else(|payload| {
                        let failure = JobFailure::Panicked {
                            job: job.id().to_string(),
                            message: panic_message(payload.as_ref()),
                        };
                        tracing::error!(job = %job.id(), error = %failure, "worker panicked");
                        Err(failure)
                    })
                })
                .collect()
        });

        cleanup_all(&jobs, store, partitions);

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id().clone()).collect();
        let mut report = BatchReport::default();
        for (job, result) in ids.into_iter().zip(results) {
            let outcome = match result {
                Ok((values, groundings)) => JobOutcome::Completed(self.retain(job, values, groundings)),
                Err(failure) => {
                    tracing::warn!(job = %job, error = %failure, "job failed");
                    JobOutcome::Failed { job, failure }
                }
            };
            report.outcomes.push(outcome);
        }
        tracing::info!(
            completed = report.completed().count(),
            failed = report.failed().count(),
            "batch finished"
        );
        Ok(report)
    }

    /// Sensitivity graph of a job's most recent run.
    pub fn explain(&self, name: &JobId) -> JobResult<SensitivityGraph> {
        let record = self.latest(name)?.ok_or_else(|| JobError::NoResult {
            job: name.to_string(),
        })?;
        Ok(SensitivityGraph::build_with_step(
            &record.values_map(),
            &record.groundings,
            self.pressure_step,
        )?)
    }

    fn next_seq(&self, job: &JobId) -> u64 {
        if let Some(last) = self.history.get(job).and_then(|h| h.back()) {
            return last.seq + 1;
        }
        self.archive
            .as_ref()
            .and_then(|a| match a.latest_seq(job) {
                Ok(seq) => seq,
                Err(e) => {
                    tracing::warn!(job = %job, error = %e, "could not read archived sequence");
                    None
                }
            })
            .map_or(1, |seq| seq + 1)
    }

    fn retain(
        &mut self,
        job: JobId,
        values: BTreeMap<AtomTemplate, f64>,
        groundings: Vec<RuleGrounding>,
    ) -> RunRecord {
        let record = RunRecord {
            seq: self.next_seq(&job),
            job: job.clone(),
            values: values.into_iter().collect(),
            groundings,
        };

        if let Some(archive) = &self.archive {
            let archived = archive
                .append(&job, record.seq, &record)
                .and_then(|()| archive.prune(&job, self.retention));
            if let Err(e) = archived {
                tracing::warn!(job = %job, seq = record.seq, error = %e, "failed to archive result");
            }
        }

        let history = self.history.entry(job).or_default();
        history.push_back(record.clone());
        while history.len() > self.retention {
            history.pop_front();
        }
        record
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("jobs", &self.jobs.len())
            .field("retention", &self.retention)
            .field("archived", &self.archive.is_some())
            .finish()
    }
}

/// Worker body: solve, write converged targets back, read final values.
///
/// The record holds what the store holds for the job's own atoms, the
/// clamped solver value for atoms only the solver knows, and the visible
/// value of any other atom a grounding mentions.
fn run_job(
    store: &AtomStore,
    job: &Job,
    scope: PartitionScope,
    solver: &dyn Solver,
) -> Result<RunOutput, JobFailure> {
    let atoms = ScopedAtoms::new(store, job, scope);
    let output = solver.solve(job, &atoms)?;

    if let Some((atom, &value)) = output.values.iter().find(|(_, v)| !v.is_finite()) {
        return Err(JobFailure::InvalidValue {
            job: job.id().to_string(),
            atom: atom.to_string(),
            value,
        });
    }

    let targets = job.reserve_atoms_for_writing();
    for (atom, &value) in &output.values {
        if targets.contains(atom) {
            atoms.set_value(atom, value)?;
        }
    }

    let mut values = job
        .extract_values(store, atoms.scope())
        .map_err(|e| JobFailure::Extract {
            job: job.id().to_string(),
            message: e.to_string(),
        })?;
    for (atom, value) in output.values {
        values.entry(atom).or_insert(value.clamp(0.0, 1.0));
    }
    for rule in &output.groundings {
        for (atom, _) in rule.grounding.terms() {
            if !values.contains_key(atom) {
                let value = atoms.value(atom)?;
                values.insert(atom.clone(), value);
            }
        }
    }
    tracing::debug!(job = %job.id(), atoms = values.len(), groundings = output.groundings.len(), "job converged");
    Ok((values, output.groundings))
}

fn cleanup_all(jobs: &[&Job], store: &AtomStore, partitions: &mut PartitionCoordinator) {
    for job in jobs {
        if let Err(e) = partitions.cleanup(job, store) {
            tracing::error!(job = %job.id(), error = %e, "cleanup failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
