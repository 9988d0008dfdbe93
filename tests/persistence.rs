//! Persistence and recovery tests for groundwork.
//!
//! These tests verify that predicates, atoms, the blacklist, and archived
//! job results survive a coordinator restart (close + reopen cycle).

use groundwork::atom::{Arg, AtomTemplate, JobId, PartitionId};
use groundwork::coordinator::{Coordinator, CoordinatorConfig};
use groundwork::error::MissingAtomError;
use groundwork::job::Job;
use groundwork::sensitivity::Grounding;
use groundwork::solver::{RuleGrounding, ScopedAtoms, Solver, SolverOutput};
use groundwork::store::archive::ResultArchive;

fn persistent_coordinator(dir: &std::path::Path) -> Coordinator {
    Coordinator::new(CoordinatorConfig {
        data_dir: Some(dir.to_path_buf()),
        retention: 2,
        ..Default::default()
    })
    .unwrap()
}

/// Reports `A(x) & B(x) -> C(x)` with fixed values.
struct FixedSolver;

impl Solver for FixedSolver {
    fn solve(&self, _job: &Job, atoms: &ScopedAtoms<'_>) -> Result<SolverOutput, MissingAtomError> {
        let a = AtomTemplate::ground("A", ["x"]);
        let b = AtomTemplate::ground("B", ["x"]);
        let c = AtomTemplate::ground("C", ["x"]);
        atoms.value(&a)?;
        atoms.value(&b)?;
        let mut output = SolverOutput::default();
        output.values.insert(c.clone(), 0.3);
        output.groundings.push(RuleGrounding::new(
            "Implies",
            Grounding::Logical {
                body: vec![a, b],
                head: vec![c],
            },
        ));
        Ok(output)
    }
}

#[test]
fn atoms_and_predicates_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let job = JobId::from("j");

    // First session: declare and add.
    {
        let coord = persistent_coordinator(dir.path());
        let store = coord.store();
        store.declare_predicate("Friends", 2).unwrap();
        store
            .add_atom(&job, &AtomTemplate::ground("Friends", ["ann", "bob"]), 0.8)
            .unwrap();
    }

    // Second session: reopen and verify.
    {
        let coord = persistent_coordinator(dir.path());
        let store = coord.store();
        assert_eq!(store.arity("Friends"), Some(2));
        let rows = store.get_all("Friends", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 0.8);
        assert_eq!(rows[0].partition, PartitionId::SHARED);
    }
}

#[test]
fn blacklist_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let job = JobId::from("j");
    let banned = AtomTemplate::new("Smokes", vec![Arg::Any]);

    {
        let coord = persistent_coordinator(dir.path());
        let store = coord.store();
        store.declare_predicate("Smokes", 1).unwrap();
        store
            .add_atom(&job, &AtomTemplate::ground("Smokes", ["ann"]), 1.0)
            .unwrap();
        assert_eq!(store.delete_atom_permanently(&banned).unwrap(), 1);
    }

    {
        let coord = persistent_coordinator(dir.path());
        let store = coord.store();
        let bob = AtomTemplate::ground("Smokes", ["bob"]);
        assert!(store.is_blacklisted(&bob));
        assert!(!store.add_atom(&job, &bob, 1.0).unwrap());
        assert!(store.get_all("Smokes", &[]).unwrap().is_empty());
    }
}

#[test]
fn archived_results_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let name = JobId::from("implies");

    {
        let mut coord = persistent_coordinator(dir.path());
        let store = coord.store();
        let mut job = Job::new("implies");
        for p in ["A", "B"] {
            job.declare_predicate(store, p, 1, true).unwrap();
        }
        job.declare_predicate(store, "C", 1, false).unwrap();
        job.add_observation(store, AtomTemplate::ground("A", ["x"]), 0.9)
            .unwrap();
        job.add_observation(store, AtomTemplate::ground("B", ["x"]), 0.8)
            .unwrap();
        job.add_target(store, AtomTemplate::ground("C", ["x"]), 0.5)
            .unwrap();
        coord.register(job).unwrap();
        for _ in 0..3 {
            let report = coord.run_batch(std::slice::from_ref(&name), &FixedSolver).unwrap();
            assert!(report.is_success());
        }
    }

    // A fresh coordinator has no in-memory history but explains from the archive.
    {
        let coord = persistent_coordinator(dir.path());
        let graph = coord.explain(&name).unwrap();
        let distance = graph.satisfaction("Implies[1]").unwrap();
        assert!((distance - 0.4).abs() < 1e-9);

        let c = graph
            .link(&AtomTemplate::ground("C", ["x"]), "Implies[1]")
            .unwrap();
        assert_eq!(c.polarity.to_string(), "-");
        assert!(c.pressure);

        let stored = coord
            .store()
            .value_of(&AtomTemplate::ground("C", ["x"]), &[PartitionId::SHARED])
            .unwrap();
        assert_eq!(stored, Some(0.3));
    }

    // Retention pruned the archive down to the newest two runs.
    let archive = ResultArchive::open(dir.path()).unwrap();
    let runs: Vec<(u64, serde_json::Value)> = archive.load(&name).unwrap();
    assert_eq!(runs.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(), vec![2, 3]);
}
