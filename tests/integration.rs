//! End-to-end integration tests for groundwork.
//!
//! These tests drive a batch of jobs through the coordinator with a small
//! in-test solver, then check partition restoration, stored values, and the
//! sensitivity graph built from the results.

use std::collections::BTreeSet;

use groundwork::atom::{Arg, AtomTemplate, JobId, PartitionId};
use groundwork::coordinator::Coordinator;
use groundwork::error::{GroundworkError, JobError, MissingAtomError, PartitionError};
use groundwork::job::Job;
use groundwork::orchestrator::JobOutcome;
use groundwork::partition::BatchState;
use groundwork::sensitivity::export::SensitivityReport;
use groundwork::sensitivity::{Grounding, Polarity};
use groundwork::solver::{RuleGrounding, ScopedAtoms, Solver, SolverOutput};

/// One step of `Friends(a, b) & Smokes(a) -> Smokes(b)`: each target
/// `Smokes(b)` takes the strongest Łukasiewicz conjunction over its friends.
struct SmokersSolver;

impl Solver for SmokersSolver {
    fn solve(&self, _job: &Job, atoms: &ScopedAtoms<'_>) -> Result<SolverOutput, MissingAtomError> {
        let mut output = SolverOutput::default();
        for (target, _) in atoms.open_atoms() {
            let who = target.args[0].clone();
            let pattern = AtomTemplate::new("Friends", vec![Arg::Any, who]);
            let mut best: f64 = 0.0;
            for row in atoms.atoms_where(&pattern) {
                let friend = AtomTemplate::new("Smokes", vec![row.atom.args[0].clone()]);
                let smokes = atoms.value(&friend)?;
                best = best.max((row.value + smokes - 1.0).max(0.0));
                output.groundings.push(RuleGrounding::new(
                    "Spread",
                    Grounding::Logical {
                        body: vec![row.atom.clone(), friend],
                        head: vec![target.clone()],
                    },
                ));
            }
            output.values.insert(target, best);
        }
        Ok(output)
    }
}

fn smokers_job(coord: &Coordinator, name: &str, target: &str, friends: &[(&str, f64)]) -> Job {
    let store = coord.store();
    let mut job = Job::new(name);
    job.declare_predicate(store, "Friends", 2, true).unwrap();
    job.declare_predicate(store, "Smokes", 1, false).unwrap();
    job.add_target(store, AtomTemplate::ground("Smokes", [target]), 0.0)
        .unwrap();
    for (friend, strength) in friends {
        job.add_observation(
            store,
            AtomTemplate::ground("Friends", [*friend, target]),
            *strength,
        )
        .unwrap();
        job.add_observation(store, AtomTemplate::ground("Smokes", [*friend]), 1.0)
            .unwrap();
    }
    job
}

#[test]
fn batch_of_jobs_end_to_end() {
    let mut coord = Coordinator::memory_only().unwrap();
    let bob = smokers_job(&coord, "bob", "bob", &[("ann", 0.9), ("cat", 0.4)]);
    let dan = smokers_job(&coord, "dan", "dan", &[("ann", 0.7)]);
    coord.register(bob).unwrap();
    coord.register(dan).unwrap();

    let names = [JobId::from("bob"), JobId::from("dan")];
    let report = coord.run_batch(&names, &SmokersSolver).unwrap();
    assert!(report.is_success());

    let JobOutcome::Completed(bob) = report.outcome(&names[0]).unwrap() else {
        panic!("bob failed");
    };
    let smokes_bob = AtomTemplate::ground("Smokes", ["bob"]);
    assert!((bob.value(&smokes_bob).unwrap() - 0.9).abs() < 1e-9);
    assert_eq!(bob.groundings.len(), 2);

    // Everything is back in the shared partition with the converged value.
    assert_eq!(coord.partitions().state(), BatchState::Idle);
    let store = coord.store();
    for row in store.get_all("Smokes", &[]).unwrap() {
        assert_eq!(row.partition, PartitionId::SHARED, "{} left behind", row.atom);
    }
    let stored = store.value_of(&smokes_bob, &[PartitionId::SHARED]).unwrap().unwrap();
    assert!((stored - 0.9).abs() < 1e-9);

    // Smokes(ann) was read by both jobs.
    let smokes_ann = AtomTemplate::ground("Smokes", ["ann"]);
    let readers: BTreeSet<JobId> = store.jobs_of(&smokes_ann).into_iter().collect();
    assert_eq!(readers, BTreeSet::from(names.clone()));
}

#[test]
fn explain_latest_run() {
    let mut coord = Coordinator::memory_only().unwrap();
    coord
        .register(smokers_job(&coord, "bob", "bob", &[("ann", 0.9), ("cat", 0.4)]))
        .unwrap();
    let name = JobId::from("bob");
    coord.run_batch(std::slice::from_ref(&name), &SmokersSolver).unwrap();

    let graph = coord.explain(&name).unwrap();
    assert_eq!(graph.grounding_count(), 2);
    let names: Vec<_> = graph.grounding_names().map(str::to_string).collect();
    assert_eq!(names, vec!["Spread[1]", "Spread[2]"]);

    // Smokes(bob) = 0.9 satisfies both groundings, up to rounding.
    assert!(graph.most_violated(1e-9).is_empty());
    let head = graph
        .link(&AtomTemplate::ground("Smokes", ["bob"]), "Spread[1]")
        .unwrap();
    assert_eq!(head.polarity, Polarity::Negative);
    assert!(!head.pressure);

    let (report, skipped) = SensitivityReport::parse(&graph.to_text());
    assert!(skipped.is_empty());
    assert_eq!(report.links.len(), graph.link_count());
    assert_eq!(report.satisfaction.len(), 2);
}

#[test]
fn conflicting_targets_leave_store_untouched() {
    let mut coord = Coordinator::memory_only().unwrap();
    coord
        .register(smokers_job(&coord, "a", "bob", &[("ann", 1.0)]))
        .unwrap();
    coord
        .register(smokers_job(&coord, "b", "bob", &[("cat", 1.0)]))
        .unwrap();

    let before = coord.store().get_all("Smokes", &[]).unwrap();
    let err = coord
        .run_batch(&[JobId::from("a"), JobId::from("b")], &SmokersSolver)
        .unwrap_err();
    assert!(matches!(
        err,
        GroundworkError::Job(JobError::Partition(PartitionError::Conflict { .. }))
    ));
    assert_eq!(coord.store().get_all("Smokes", &[]).unwrap(), before);
    assert_eq!(coord.partitions().state(), BatchState::Idle);
}

#[test]
fn missing_atom_fails_only_its_job() {
    let mut coord = Coordinator::memory_only().unwrap();
    let mut broken = smokers_job(&coord, "broken", "eve", &[("ann", 1.0)]);
    // A friendship whose friend's Smokes atom was never added.
    broken
        .add_observation(coord.store(), AtomTemplate::ground("Friends", ["ghost", "eve"]), 1.0)
        .unwrap();
    coord.register(broken).unwrap();
    coord
        .register(smokers_job(&coord, "fine", "bob", &[("cat", 0.6)]))
        .unwrap();

    let report = coord
        .run_batch(&[JobId::from("broken"), JobId::from("fine")], &SmokersSolver)
        .unwrap();
    let failed: Vec<_> = report.failed().map(|(job, _)| job.as_str().to_string()).collect();
    assert_eq!(failed, vec!["broken"]);
    assert_eq!(report.completed().count(), 1);

    let eve = AtomTemplate::ground("Smokes", ["eve"]);
    assert_eq!(coord.store().partition_of(&eve).unwrap(), Some(PartitionId::SHARED));
}

#[test]
fn wildcard_delete_updates_reverse_index() {
    let coord = Coordinator::memory_only().unwrap();
    let store = coord.store();
    let job = JobId::from("j");
    store.declare_predicate("P", 2).unwrap();
    for (a, b) in [("x", "1"), ("x", "2"), ("y", "1")] {
        store.add_atom(&job, &AtomTemplate::ground("P", [a, b]), 0.5).unwrap();
    }

    let template = AtomTemplate::new("P", vec![Arg::exact("x"), Arg::Any]);
    assert_eq!(store.delete_atoms(std::slice::from_ref(&template)).unwrap(), 2);
    assert_eq!(
        store.atoms_of(&job),
        BTreeSet::from([AtomTemplate::ground("P", ["y", "1"])])
    );
    assert_eq!(store.get_all("P", &[]).unwrap().len(), 1);
}
