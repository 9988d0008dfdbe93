//! Partition planning for a batch of concurrently running jobs.
//!
//! Every row of the atom store lives in exactly one partition. Between
//! batches everything sits in [`PartitionId::SHARED`]. Before a batch runs,
//! each job's write set is moved into a partition of its own, and read sets
//! are moved into partitions shared by exactly the jobs that read them.
//! After the batch, cleanup moves everything back.
//!
//! ```text
//! Idle → ConflictCheck → WriteReassign → ReadReassign → Ready → Running → CleaningUp → Idle
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::atom::{AtomTemplate, JobId, PartitionId};
use crate::error::PartitionError;
use crate::job::Job;
use crate::store::{AtomStore, PartitionScope, SourcePartitions};

/// Result type for partition operations.
pub type PartitionResult<T> = std::result::Result<T, PartitionError>;

/// Where the coordinator is in the batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    ConflictCheck,
    WriteReassign,
    ReadReassign,
    Ready,
    Running,
    CleaningUp,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Idle => "idle",
            BatchState::ConflictCheck => "conflict-check",
            BatchState::WriteReassign => "write-reassign",
            BatchState::ReadReassign => "read-reassign",
            BatchState::Ready => "ready",
            BatchState::Running => "running",
            BatchState::CleaningUp => "cleaning-up",
        };
        f.write_str(name)
    }
}

/// A template claimed for writing by more than one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConflict {
    pub atom: AtomTemplate,
    pub jobs: Vec<JobId>,
}

impl From<WriteConflict> for PartitionError {
    fn from(c: WriteConflict) -> Self {
        PartitionError::Conflict {
            atom: c.atom.to_string(),
            jobs: c
                .jobs
                .iter()
                .map(JobId::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// First write/write conflict among the given write sets, if any.
///
/// Identical templates are grouped; templates with wildcards are also
/// checked pairwise for overlap against other jobs' templates.
pub fn find_conflict(write_sets: &[(JobId, BTreeSet<AtomTemplate>)]) -> Option<WriteConflict> {
    let mut claims: BTreeMap<&AtomTemplate, BTreeSet<&JobId>> = BTreeMap::new();
    for (job, set) in write_sets {
        for atom in set {
            claims.entry(atom).or_default().insert(job);
        }
    }
    if let Some((atom, jobs)) = claims.iter().find(|(_, jobs)| jobs.len() > 1) {
        return Some(WriteConflict {
            atom: (*atom).clone(),
            jobs: jobs.iter().map(|j| (*j).clone()).collect(),
        });
    }

    for (job, set) in write_sets {
        for wild in set.iter().filter(|a| !a.is_ground()) {
            for (other, other_set) in write_sets {
                if other == job {
                    continue;
                }
                if other_set.iter().any(|a| wild.overlaps(a)) {
                    return Some(WriteConflict {
                        atom: wild.clone(),
                        jobs: vec![job.clone(), other.clone()],
                    });
                }
            }
        }
    }
    None
}

/// Assigns partitions to jobs and migrates rows between them.
pub struct PartitionCoordinator {
    state: BatchState,
    write: HashMap<JobId, PartitionId>,
    reads: HashMap<JobId, BTreeSet<PartitionId>>,
    /// Partition → jobs that write or read it.
    members: BTreeMap<PartitionId, BTreeSet<JobId>>,
    /// Jobs of the batch currently prepared or running.
    batch: BTreeSet<JobId>,
}

impl Default for PartitionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionCoordinator {
    pub fn new() -> Self {
        Self {
            state: BatchState::Idle,
            write: HashMap::new(),
            reads: HashMap::new(),
            members: BTreeMap::new(),
            batch: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Start tracking a job: it writes and reads the shared partition.
    pub fn register(&mut self, job: &JobId) {
        if self.write.contains_key(job) {
            return;
        }
        self.write.insert(job.clone(), PartitionId::SHARED);
        self.reads
            .insert(job.clone(), BTreeSet::from([PartitionId::SHARED]));
        self.members
            .entry(PartitionId::SHARED)
            .or_default()
            .insert(job.clone());
    }

    /// Stop tracking a job. Refused while the job is part of a batch.
    pub fn unregister(&mut self, job: &JobId) -> PartitionResult<()> {
        if self.batch.contains(job) {
            return Err(invalid("unregister a batch job", self.state));
        }
        self.write.remove(job);
        self.reads.remove(job);
        self.reindex();
        Ok(())
    }

    pub fn is_registered(&self, job: &JobId) -> bool {
        self.write.contains_key(job)
    }

    pub fn write_partition(&self, job: &JobId) -> Option<PartitionId> {
        self.write.get(job).copied()
    }

    pub fn read_partitions(&self, job: &JobId) -> Option<&BTreeSet<PartitionId>> {
        self.reads.get(job)
    }

    /// Jobs currently writing or reading a partition.
    pub fn jobs_in(&self, partition: PartitionId) -> BTreeSet<JobId> {
        self.members.get(&partition).cloned().unwrap_or_default()
    }

    /// The partitions a job's solver may touch.
    pub fn scope(&self, job: &JobId) -> PartitionResult<PartitionScope> {
        let write = self.write_partition(job).ok_or_else(|| unknown(job))?;
        let reads = self.reads.get(job).ok_or_else(|| unknown(job))?;
        Ok(PartitionScope::new(write, reads.iter().copied()))
    }

    /// Plan and apply partitions for a batch.
    ///
    /// Write conflicts are reported before any row moves. New partition ids
    /// skip any id that already holds rows. Store failures during migration
    /// are logged and count as zero rows moved.
    pub fn prepare(&mut self, jobs: &[&Job], store: &AtomStore) -> PartitionResult<()> {
        if self.state != BatchState::Idle {
            return Err(invalid("prepare", self.state));
        }
        for job in jobs {
            if !self.is_registered(job.id()) {
                return Err(unknown(job.id()));
            }
        }

        self.state = BatchState::ConflictCheck;
        let write_sets: Vec<(JobId, BTreeSet<AtomTemplate>)> = jobs
            .iter()
            .map(|j| (j.id().clone(), j.reserve_atoms_for_writing()))
            .collect();
        if let Some(conflict) = find_conflict(&write_sets) {
            self.state = BatchState::Idle;
            let err = PartitionError::from(conflict);
            tracing::error!(error = %err, "batch refused");
            return Err(err);
        }

        let occupied = self.occupied(store);

        self.state = BatchState::WriteReassign;
        for (job, set) in &write_sets {
            let target = self.allocate(&occupied);
            let source = self.write[job];
            let moved: usize = set
                .iter()
                .map(|atom| migrate(store, &SourcePartitions::One(source), target, atom))
                .sum();
            self.write.insert(job.clone(), target);
            self.members.entry(target).or_default().insert(job.clone());
            tracing::debug!(job = %job, partition = %target, moved, "assigned write partition");
        }

        self.state = BatchState::ReadReassign;
        let written: BTreeMap<&AtomTemplate, &JobId> = write_sets
            .iter()
            .flat_map(|(job, set)| set.iter().map(move |a| (a, job)))
            .collect();
        let mut readers: BTreeMap<AtomTemplate, BTreeSet<JobId>> = BTreeMap::new();
        for job in jobs {
            for atom in job.declare_atoms_for_reading() {
                if let Some(writer) = written.get(&atom) {
                    if *writer != job.id() {
                        tracing::warn!(
                            job = %job.id(),
                            writer = %writer,
                            %atom,
                            "read atom is written by another job, leaving it in the writer's partition"
                        );
                    }
                    continue;
                }
                readers.entry(atom).or_default().insert(job.id().clone());
            }
        }
        let mut groups: BTreeMap<BTreeSet<JobId>, Vec<AtomTemplate>> = BTreeMap::new();
        for (atom, group) in readers {
            groups.entry(group).or_default().push(atom);
        }

        let prior: HashMap<JobId, BTreeSet<PartitionId>> = write_sets
            .iter()
            .map(|(job, _)| (job.clone(), self.reads[job].clone()))
            .collect();
        let mut fresh: HashMap<JobId, BTreeSet<PartitionId>> = HashMap::new();

        for (group, atoms) in groups {
            let target = self.allocate(&occupied);
            self.members.insert(target, group.clone());

            let mut sources: Vec<PartitionId> = Vec::new();
            for job in &group {
                for &p in &prior[job] {
                    if !sources.contains(&p) {
                        sources.push(p);
                    }
                }
            }

            let mut moved = 0;
            for atom in &atoms {
                for &source in &sources {
                    let n = migrate(store, &SourcePartitions::One(source), target, atom);
                    if n > 0 {
                        moved += n;
                        break;
                    }
                }
            }
            for job in &group {
                fresh.entry(job.clone()).or_default().insert(target);
            }
            tracing::debug!(
                partition = %target,
                readers = group.len(),
                atoms = atoms.len(),
                moved,
                "assigned shared read partition"
            );
        }

        for (job, _) in &write_sets {
            let mut reads = BTreeSet::from([PartitionId::SHARED]);
            reads.extend(fresh.remove(job).unwrap_or_default());
            self.reads.insert(job.clone(), reads);
        }
        self.reindex();

        self.batch = write_sets.into_iter().map(|(job, _)| job).collect();
        self.state = BatchState::Ready;
        tracing::info!(jobs = self.batch.len(), partitions = self.members.len(), "batch prepared");
        Ok(())
    }

    pub fn mark_running(&mut self) -> PartitionResult<()> {
        if self.state != BatchState::Ready {
            return Err(invalid("run", self.state));
        }
        self.state = BatchState::Running;
        Ok(())
    }

    /// Move a job's rows back to the shared partition and reset its
    /// assignment. Calling it again for the same job is a no-op.
    ///
    /// Once every job of the batch has been cleaned up the coordinator
    /// returns to [`BatchState::Idle`].
    pub fn cleanup(&mut self, job: &Job, store: &AtomStore) -> PartitionResult<()> {
        match self.state {
            BatchState::Ready | BatchState::Running | BatchState::CleaningUp => {}
            BatchState::Idle if self.batch.is_empty() => return Ok(()),
            other => return Err(invalid("clean up", other)),
        }
        let id = job.id();
        let write = self.write_partition(id).ok_or_else(|| unknown(id))?;
        self.state = BatchState::CleaningUp;

        let mut moved = 0;
        if !write.is_shared() {
            for atom in job.reserve_atoms_for_writing() {
                moved += migrate(store, &SourcePartitions::One(write), PartitionId::SHARED, &atom);
            }
        }
        let private: BTreeSet<PartitionId> = self
            .reads
            .get(id)
            .map(|r| r.iter().copied().filter(|p| !p.is_shared()).collect())
            .unwrap_or_default();
        if !private.is_empty() {
            let source = SourcePartitions::AnyOf(private);
            for atom in job.declare_atoms_for_reading() {
                moved += migrate(store, &source, PartitionId::SHARED, &atom);
            }
        }

        self.write.insert(id.clone(), PartitionId::SHARED);
        self.reads
            .insert(id.clone(), BTreeSet::from([PartitionId::SHARED]));
        self.reindex();
        self.batch.remove(id);
        tracing::debug!(job = %id, moved, "job partitions released");

        if self.batch.is_empty() {
            self.state = BatchState::Idle;
            tracing::info!("batch cleaned up");
        }
        Ok(())
    }

    /// Smallest non-shared id that no job references and no row occupies.
    fn allocate(&self, occupied: &BTreeSet<PartitionId>) -> PartitionId {
        (2..=u32::MAX)
            .filter_map(PartitionId::new)
            .find(|p| !self.members.contains_key(p) && !occupied.contains(p))
            .unwrap_or(PartitionId::SHARED)
    }

    /// Partitions holding rows, warning about those no job owns. Such rows
    /// are left by an interrupted batch or a manual move and stay invisible
    /// until moved back to the shared partition.
    fn occupied(&self, store: &AtomStore) -> BTreeSet<PartitionId> {
        let occupied = match store.occupied_partitions() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "could not list occupied partitions");
                return BTreeSet::new();
            }
        };
        for p in occupied.iter().filter(|p| !p.is_shared() && !self.members.contains_key(p)) {
            tracing::warn!(partition = %p, "partition holds rows owned by no job, skipping it");
        }
        occupied
    }

    /// Rebuild partition membership from the job maps, releasing
    /// partitions no job references.
    fn reindex(&mut self) {
        let mut members: BTreeMap<PartitionId, BTreeSet<JobId>> = BTreeMap::new();
        for (job, &p) in &self.write {
            members.entry(p).or_default().insert(job.clone());
        }
        for (job, reads) in &self.reads {
            for &p in reads {
                members.entry(p).or_default().insert(job.clone());
            }
        }
        self.members = members;
    }
}

impl fmt::Debug for PartitionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionCoordinator")
            .field("state", &self.state)
            .field("jobs", &self.write.len())
            .field("partitions", &self.members.len())
            .finish()
    }
}

fn migrate(
    store: &AtomStore,
    source: &SourcePartitions,
    target: PartitionId,
    atom: &AtomTemplate,
) -> usize {
    store
        .move_to_partition(source, target, atom)
        .unwrap_or_else(|e| {
            tracing::warn!(%atom, %target, error = %e, "migration had no effect");
            0
        })
}

fn unknown(job: &JobId) -> PartitionError {
    PartitionError::UnknownJob {
        job: job.to_string(),
    }
}

fn invalid(operation: &str, state: BatchState) -> PartitionError {
    PartitionError::InvalidState {
        operation: operation.to_string(),
        state: state.to_string(),
    }
}
