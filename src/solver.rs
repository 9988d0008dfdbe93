//! The solver boundary.
//!
//! Grounding and optimisation are external: a [`Solver`] receives a [`Job`]
//! and a [`ScopedAtoms`] view restricted to the job's partitions, and
//! returns converged values plus the rule instantiations it used.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::atom::{AtomTemplate, GroundAtom, JobId, PartitionId};
use crate::error::MissingAtomError;
use crate::job::Job;
use crate::sensitivity::Grounding;
use crate::store::{AtomStore, PartitionScope};

/// One rule instantiation, tagged with the rule it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGrounding {
    pub rule: String,
    pub grounding: Grounding,
}

impl RuleGrounding {
    pub fn new(rule: impl Into<String>, grounding: Grounding) -> Self {
        Self {
            rule: rule.into(),
            grounding,
        }
    }
}

/// What a solver returns for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverOutput {
    /// Converged values of the job's open atoms.
    pub values: BTreeMap<AtomTemplate, f64>,
    /// Rule instantiations, in deterministic rule order.
    pub groundings: Vec<RuleGrounding>,
}

/// External grounding/optimisation engine.
pub trait Solver: Send + Sync {
    fn solve(&self, job: &Job, atoms: &ScopedAtoms<'_>) -> Result<SolverOutput, MissingAtomError>;
}

/// Atom access restricted to one job's write partition, read partitions,
/// and closed predicates.
pub struct ScopedAtoms<'a> {
    store: &'a AtomStore,
    job: &'a Job,
    scope: PartitionScope,
}

impl<'a> ScopedAtoms<'a> {
    pub fn new(store: &'a AtomStore, job: &'a Job, scope: PartitionScope) -> Self {
        Self { store, job, scope }
    }

    pub fn job(&self) -> &JobId {
        self.job.id()
    }

    pub fn scope(&self) -> &PartitionScope {
        &self.scope
    }

    pub fn is_closed(&self, predicate: &str) -> bool {
        self.job.is_closed(predicate)
    }

    fn missing(&self, atom: &AtomTemplate) -> MissingAtomError {
        MissingAtomError {
            job: self.job.id().to_string(),
            atom: atom.to_string(),
        }
    }

    /// Value of a ground atom visible to the job.
    pub fn value(&self, atom: &AtomTemplate) -> Result<f64, MissingAtomError> {
        match self.store.value_of(atom, &self.scope.visible()) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(self.missing(atom)),
            Err(e) => {
                tracing::warn!(job = %self.job.id(), %atom, error = %e, "atom lookup failed");
                Err(self.missing(atom))
            }
        }
    }

    /// Write a value into the job's write partition.
    ///
    /// Values are clamped to `[0, 1]`. Returns `Ok(false)` for atoms of
    /// closed predicates, which are never written.
    pub fn set_value(&self, atom: &AtomTemplate, value: f64) -> Result<bool, MissingAtomError> {
        if self.is_closed(&atom.predicate) {
            tracing::debug!(job = %self.job.id(), %atom, "refusing to write closed atom");
            return Ok(false);
        }
        let write_only = PartitionScope::new(self.scope.write, []);
        match self
            .store
            .set_atoms_to_value(value.clamp(0.0, 1.0), atom, Some(&write_only))
        {
            Ok(0) => Err(self.missing(atom)),
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(job = %self.job.id(), %atom, error = %e, "atom write failed");
                Err(self.missing(atom))
            }
        }
    }

    /// Every visible row matching `template`. Store failures are logged and
    /// yield no rows.
    pub fn atoms_where(&self, template: &AtomTemplate) -> Vec<GroundAtom> {
        self.store
            .get_all_where(template, &self.scope.visible())
            .unwrap_or_else(|e| {
                tracing::warn!(job = %self.job.id(), %template, error = %e, "atom query failed");
                Vec::new()
            })
    }

    /// The job's targets with their current values in the write partition.
    pub fn open_atoms(&self) -> Vec<(AtomTemplate, f64)> {
        self.values_in(self.job.reserve_atoms_for_writing(), &[self.scope.write])
    }

    /// The job's observations with their current values.
    pub fn observed_atoms(&self) -> Vec<(AtomTemplate, f64)> {
        let reads: Vec<_> = self.scope.reads.iter().copied().collect();
        self.values_in(self.job.declare_atoms_for_reading(), &reads)
    }

    fn values_in(
        &self,
        atoms: impl IntoIterator<Item = AtomTemplate>,
        partitions: &[PartitionId],
    ) -> Vec<(AtomTemplate, f64)> {
        atoms
            .into_iter()
            .filter_map(|atom| match self.store.value_of(&atom, partitions) {
                Ok(Some(v)) => Some((atom, v)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(job = %self.job.id(), %atom, error = %e, "atom lookup failed");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SourcePartitions;

    #[test]
    fn scoped_reads_and_writes() {
        let store = AtomStore::memory_only().unwrap();
        let mut job = Job::new("j");
        job.declare_predicate(&store, "Evidence", 1, true).unwrap();
        job.declare_predicate(&store, "Guess", 1, false).unwrap();
        let evidence = AtomTemplate::ground("Evidence", ["a"]);
        let guess = AtomTemplate::ground("Guess", ["a"]);
        job.add_observation(&store, evidence.clone(), 1.0).unwrap();
        job.add_target(&store, guess.clone(), 0.5).unwrap();

        let write = PartitionId::new(2).unwrap();
        store
            .move_to_partition(&SourcePartitions::One(PartitionId::SHARED), write, &guess)
            .unwrap();

        let atoms = ScopedAtoms::new(&store, &job, PartitionScope::new(write, [PartitionId::SHARED]));
        assert_eq!(atoms.value(&evidence).unwrap(), 1.0);
        assert!(atoms.set_value(&guess, 1.2).unwrap());
        assert_eq!(atoms.value(&guess).unwrap(), 1.0);
        assert!(!atoms.set_value(&evidence, 0.0).unwrap());
        assert_eq!(atoms.open_atoms(), vec![(guess.clone(), 1.0)]);
        assert_eq!(atoms.observed_atoms(), vec![(evidence.clone(), 1.0)]);

        let missing = AtomTemplate::ground("Guess", ["zzz"]);
        let err = atoms.value(&missing).unwrap_err();
        assert_eq!(err.job, "j");
        assert!(atoms.set_value(&missing, 0.5).is_err());
    }
}
