// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # groundwork
//!
//! Multi-job coordination for probabilistic inference over a shared,
//! partitioned atom store.
//!
//! ## Architecture
//!
//! - **Atoms** (`atom`): predicates over constant or wildcard arguments, partition ids
//! - **Atom store** (`store`): one SQLite table per predicate, reverse index, blacklist,
//!   and a redb archive of finished results
//! - **Partitions** (`partition`): conflict-free write/read partition plans per batch
//! - **Jobs** (`job`, `solver`): declared atom sets and the external solver boundary
//! - **Orchestration** (`orchestrator`): one worker thread per job, guaranteed cleanup
//! - **Sensitivity** (`sensitivity`): atom/grounding graph with satisfaction distances
//!
//! ## Library usage
//!
//! ```no_run
//! use groundwork::atom::AtomTemplate;
//! use groundwork::coordinator::Coordinator;
//! use groundwork::job::Job;
//!
//! let mut coord = Coordinator::memory_only().unwrap();
//! let mut job = Job::new("smokers");
//! job.declare_predicate(coord.store(), "Friends", 2, true).unwrap();
//! job.declare_predicate(coord.store(), "Smokes", 1, false).unwrap();
//! job.add_observation(coord.store(), AtomTemplate::ground("Friends", ["ann", "bob"]), 1.0)
//!     .unwrap();
//! job.add_target(coord.store(), AtomTemplate::ground("Smokes", ["bob"]), 0.5)
//!     .unwrap();
//! coord.register(job).unwrap();
//! ```

pub mod atom;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod partition;
pub mod sensitivity;
pub mod solver;
pub mod store;
