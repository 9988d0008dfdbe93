//! Rich diagnostic error types for groundwork.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum GroundworkError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sensitivity(#[from] SensitivityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Coordinator(#[from] CoordinatorError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("SQL error while {context}: {source}")]
    #[diagnostic(
        code(groundwork::store::sql),
        help(
            "The relational store rejected a statement. The operation had no effect \
             and can be retried. If it keeps failing, check that the database file \
             is writable and not locked by another process."
        )
    )]
    Sql {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("predicate \"{predicate}\" was never declared")]
    #[diagnostic(
        code(groundwork::store::undeclared_predicate),
        help("Call `declare_predicate(name, arity)` before adding or querying its atoms.")
    )]
    UndeclaredPredicate { predicate: String },

    #[error("invalid predicate name \"{name}\"")]
    #[diagnostic(
        code(groundwork::store::invalid_predicate),
        help(
            "Predicate names must start with a letter or underscore and contain only \
             ASCII letters, digits, and underscores."
        )
    )]
    InvalidPredicate { name: String },

    #[error("arity mismatch for {predicate}: declared {expected}, got {actual}")]
    #[diagnostic(
        code(groundwork::store::arity_mismatch),
        help("Every atom and template must supply exactly one argument per declared column.")
    )]
    ArityMismatch {
        predicate: String,
        expected: usize,
        actual: usize,
    },

    #[error("atom {atom} contains a wildcard where a ground atom is required")]
    #[diagnostic(
        code(groundwork::store::not_ground),
        help("Only wildcard-free atoms can be inserted or read as a single value.")
    )]
    NotGround { atom: String },

    #[error("value {value} is outside [0, 1]")]
    #[diagnostic(
        code(groundwork::store::invalid_value),
        help("Atom values are truth degrees and must lie in the unit interval.")
    )]
    InvalidValue { value: f64 },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(groundwork::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(groundwork::store::redb),
        help(
            "The result archive encountered a transaction error. \
             This may indicate corruption; try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(groundwork::store::serde),
        help(
            "Failed to serialize or deserialize stored data. \
             This usually means the stored format changed between versions."
        )
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Partition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PartitionError {
    #[error("write conflict on {atom}: claimed by jobs {jobs}")]
    #[diagnostic(
        code(groundwork::partition::conflict),
        help(
            "Two jobs in the same batch declared overlapping target atoms. Nothing was \
             migrated. Resubmit the jobs in separate batches or remove the shared target."
        )
    )]
    Conflict { atom: String, jobs: String },

    #[error("job \"{job}\" is not registered with the partition coordinator")]
    #[diagnostic(
        code(groundwork::partition::unknown_job),
        help("Register the job before including it in a batch.")
    )]
    UnknownJob { job: String },

    #[error("cannot {operation} while the coordinator is in state {state}")]
    #[diagnostic(
        code(groundwork::partition::invalid_state),
        help("Finish cleaning up the running batch before preparing another one.")
    )]
    InvalidState { operation: String, state: String },
}

// ---------------------------------------------------------------------------
// Job errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error("job \"{job}\" is not registered")]
    #[diagnostic(
        code(groundwork::job::unknown),
        help("Register the job with the orchestrator before running or explaining it.")
    )]
    UnknownJob { job: String },

    #[error("job \"{job}\" is already registered")]
    #[diagnostic(
        code(groundwork::job::duplicate),
        help("Job names must be unique within one coordinator.")
    )]
    DuplicateJob { job: String },

    #[error("cannot make {atom} a target: its predicate is closed")]
    #[diagnostic(
        code(groundwork::job::closed_target),
        help("Closed predicates are fixed evidence. Add the atom as an observation instead.")
    )]
    ClosedTarget { atom: String },

    #[error("job \"{job}\" has no recorded result")]
    #[diagnostic(
        code(groundwork::job::no_result),
        help("Run the job in a batch first, or load archived results.")
    )]
    NoResult { job: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sensitivity(#[from] SensitivityError),
}

/// The solver needed an atom that was never persisted or declared.
///
/// Scoped to a single job: the batch continues with the other jobs.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("atom {atom} is not visible to job \"{job}\"")]
#[diagnostic(
    code(groundwork::job::missing_atom),
    help(
        "Add the atom as an observation or target of the job before running it, \
         and make sure its predicate is declared."
    )
)]
pub struct MissingAtomError {
    pub job: String,
    pub atom: String,
}

/// Why one job of a batch produced no result.
///
/// Reported per job; the rest of the batch is unaffected.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum JobFailure {
    #[error(transparent)]
    #[diagnostic(transparent)]
    MissingAtom(#[from] MissingAtomError),

    #[error("solver for job \"{job}\" panicked: {message}")]
    #[diagnostic(
        code(groundwork::job::panicked),
        help("The job's partitions were still cleaned up. Inspect the solver for the panic cause.")
    )]
    Panicked { job: String, message: String },

    #[error("solver for job \"{job}\" returned {value} for atom {atom}")]
    #[diagnostic(
        code(groundwork::job::invalid_value),
        help("Solver values must be finite. Finite values are clamped to [0, 1].")
    )]
    InvalidValue { job: String, atom: String, value: f64 },

    #[error("could not read results of job \"{job}\": {message}")]
    #[diagnostic(
        code(groundwork::job::extract),
        help("The atom store failed while reading back converged values. Check the store logs.")
    )]
    Extract { job: String, message: String },
}

// ---------------------------------------------------------------------------
// Sensitivity graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SensitivityError {
    #[error("no value for atom {atom} used by grounding {grounding}")]
    #[diagnostic(
        code(groundwork::sensitivity::unknown_value),
        help("The value map must cover every atom that appears in a grounding.")
    )]
    UnknownValue { atom: String, grounding: String },

    #[error("grounding {grounding} has {atoms} atoms but {coefficients} coefficients")]
    #[diagnostic(
        code(groundwork::sensitivity::shape),
        help("Arithmetic groundings need exactly one coefficient per atom.")
    )]
    Shape {
        grounding: String,
        atoms: usize,
        coefficients: usize,
    },

    #[error("grounding has {expected} terms but {found} values were supplied")]
    #[diagnostic(
        code(groundwork::sensitivity::value_count),
        help("Pass exactly one value per term, in the order returned by Grounding::terms.")
    )]
    ValueCount { expected: usize, found: usize },

    #[error("malformed record on line {line}: {message}")]
    #[diagnostic(
        code(groundwork::sensitivity::format),
        help("The record was skipped. Check the exported file for hand edits or truncation.")
    )]
    Format { line: usize, message: String },
}

// ---------------------------------------------------------------------------
// Coordinator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CoordinatorError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(groundwork::coordinator::invalid_config),
        help("Check the CoordinatorConfig fields. {message}")
    )]
    InvalidConfig { message: String },

    #[error("cannot read configuration file {path}: {message}")]
    #[diagnostic(
        code(groundwork::coordinator::config_file),
        help("The file must be valid TOML with the keys described in CoordinatorConfig.")
    )]
    ConfigFile { path: String, message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(groundwork::coordinator::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },
}

/// Convenience alias for functions returning groundwork results.
pub type GroundworkResult<T> = std::result::Result<T, GroundworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_top_level() {
        let err = StoreError::UndeclaredPredicate {
            predicate: "Friends".into(),
        };
        let top: GroundworkError = err.into();
        assert!(matches!(
            top,
            GroundworkError::Store(StoreError::UndeclaredPredicate { .. })
        ));
    }

    #[test]
    fn job_error_wraps_partition_error() {
        let err: JobError = PartitionError::UnknownJob { job: "j".into() }.into();
        assert!(matches!(err, JobError::Partition(PartitionError::UnknownJob { .. })));
    }

    #[test]
    fn conflict_message_names_atom_and_jobs() {
        let err = PartitionError::Conflict {
            atom: "Smokes(bob)".into(),
            jobs: "a, b".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Smokes(bob)"));
        assert!(msg.contains("a, b"));
    }
}
