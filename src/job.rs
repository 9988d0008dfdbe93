//! Jobs: one inference problem over the shared atom store.
//!
//! A [`Job`] declares the predicates it uses, which of them are closed
//! (fixed evidence the solver never writes), the atoms it will infer
//! (targets, its write set) and the atoms it only reads (observations, its
//! read set). The reasoning itself is delegated to a [`crate::solver::Solver`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::atom::{AtomTemplate, JobId};
use crate::error::JobError;
use crate::store::{AtomStore, PartitionScope, StoreResult};

/// Result type for job operations.
pub type JobResult<T> = std::result::Result<T, JobError>;

/// A named rule definition, handed to the solver unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    pub name: String,
    pub text: String,
}

/// An inference problem and its declared atom sets.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    predicates: BTreeMap<String, usize>,
    closed: BTreeSet<String>,
    targets: BTreeSet<AtomTemplate>,
    observations: BTreeSet<AtomTemplate>,
    rules: Vec<RuleSource>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(name),
            predicates: BTreeMap::new(),
            closed: BTreeSet::new(),
            targets: BTreeSet::new(),
            observations: BTreeSet::new(),
            rules: Vec::new(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Declare a predicate in the store and record whether it is closed
    /// for this job.
    pub fn declare_predicate(
        &mut self,
        store: &AtomStore,
        name: &str,
        arity: usize,
        closed: bool,
    ) -> JobResult<()> {
        store.declare_predicate(name, arity)?;
        self.predicates.insert(name.to_string(), arity);
        if closed {
            self.closed.insert(name.to_string());
        } else {
            self.closed.remove(name);
        }
        Ok(())
    }

    /// Add a fixed-value atom this job reads.
    ///
    /// Returns `false` when the store dropped a blacklisted atom.
    pub fn add_observation(
        &mut self,
        store: &AtomStore,
        atom: AtomTemplate,
        value: f64,
    ) -> JobResult<bool> {
        if !store.add_atom(&self.id, &atom, value)? {
            return Ok(false);
        }
        if !self.targets.contains(&atom) {
            self.observations.insert(atom);
        }
        Ok(true)
    }

    /// Add an atom whose value this job infers, starting at `initial`.
    pub fn add_target(&mut self, store: &AtomStore, atom: AtomTemplate, initial: f64) -> JobResult<bool> {
        if self.is_closed(&atom.predicate) {
            return Err(JobError::ClosedTarget {
                atom: atom.to_string(),
            });
        }
        if !store.add_atom(&self.id, &atom, initial)? {
            return Ok(false);
        }
        self.observations.remove(&atom);
        self.targets.insert(atom);
        Ok(true)
    }

    pub fn add_rule(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.rules.push(RuleSource {
            name: name.into(),
            text: text.into(),
        });
    }

    pub fn rules(&self) -> &[RuleSource] {
        &self.rules
    }

    pub fn predicates(&self) -> &BTreeMap<String, usize> {
        &self.predicates
    }

    pub fn closed_predicates(&self) -> &BTreeSet<String> {
        &self.closed
    }

    pub fn is_closed(&self, predicate: &str) -> bool {
        self.closed.contains(predicate)
    }

    /// The write set: atoms this job will mutate during inference.
    pub fn reserve_atoms_for_writing(&self) -> BTreeSet<AtomTemplate> {
        self.targets.clone()
    }

    /// The read set: atoms this job needs but never writes.
    pub fn declare_atoms_for_reading(&self) -> BTreeSet<AtomTemplate> {
        self.observations.clone()
    }

    /// Current values of every declared atom visible in `scope` that the
    /// store still holds for this job.
    pub fn extract_values(
        &self,
        store: &AtomStore,
        scope: &PartitionScope,
    ) -> StoreResult<BTreeMap<AtomTemplate, f64>> {
        let persisted = store.atoms_of(&self.id);
        let visible = scope.visible();
        let mut values = BTreeMap::new();
        for atom in self.targets.iter().chain(&self.observations) {
            if !persisted.contains(atom) {
                continue;
            }
            match store.value_of(atom, &visible)? {
                Some(v) => {
                    values.insert(atom.clone(), v);
                }
                None => tracing::debug!(job = %self.id, %atom, "atom not visible in job scope"),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::PartitionId;

    fn setup() -> (AtomStore, Job) {
        let store = AtomStore::memory_only().unwrap();
        let mut job = Job::new("smokers");
        job.declare_predicate(&store, "Friends", 2, true).unwrap();
        job.declare_predicate(&store, "Smokes", 1, false).unwrap();
        (store, job)
    }

    #[test]
    fn targets_and_observations_are_separate() {
        let (store, mut job) = setup();
        job.add_observation(&store, AtomTemplate::ground("Friends", ["a", "b"]), 1.0)
            .unwrap();
        job.add_target(&store, AtomTemplate::ground("Smokes", ["b"]), 0.5)
            .unwrap();

        assert_eq!(job.reserve_atoms_for_writing().len(), 1);
        assert_eq!(job.declare_atoms_for_reading().len(), 1);
        assert_eq!(store.atoms_of(job.id()).len(), 2);
    }

    #[test]
    fn closed_predicates_cannot_be_targets() {
        let (store, mut job) = setup();
        let err = job
            .add_target(&store, AtomTemplate::ground("Friends", ["a", "b"]), 0.5)
            .unwrap_err();
        assert!(matches!(err, JobError::ClosedTarget { .. }));
        assert!(store.atoms_of(job.id()).is_empty());
    }

    #[test]
    fn promoting_an_observation_to_target() {
        let (store, mut job) = setup();
        let atom = AtomTemplate::ground("Smokes", ["a"]);
        job.add_observation(&store, atom.clone(), 1.0).unwrap();
        job.add_target(&store, atom.clone(), 0.5).unwrap();
        assert!(job.declare_atoms_for_reading().is_empty());
        assert!(job.reserve_atoms_for_writing().contains(&atom));

        job.add_observation(&store, atom.clone(), 0.2).unwrap();
        assert!(job.declare_atoms_for_reading().is_empty());
    }

    #[test]
    fn extract_values_reads_visible_atoms() {
        let (store, mut job) = setup();
        job.add_observation(&store, AtomTemplate::ground("Friends", ["a", "b"]), 1.0)
            .unwrap();
        job.add_target(&store, AtomTemplate::ground("Smokes", ["b"]), 0.25)
            .unwrap();

        let scope = PartitionScope::new(PartitionId::SHARED, [PartitionId::SHARED]);
        let values = job.extract_values(&store, &scope).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[&AtomTemplate::ground("Smokes", ["b"])], 0.25);

        let elsewhere = PartitionScope::new(PartitionId::new(9).unwrap(), []);
        assert!(job.extract_values(&store, &elsewhere).unwrap().is_empty());
    }
}
