//! Template-addressed storage of ground atoms.
//!
//! [`AtomStore`] keeps one SQLite table per declared predicate, with a
//! `partition` column tagging the logical partition each row lives in. On
//! top of the relational rows it maintains:
//!
//! - a predicate catalog (name → arity), persisted in `_predicates`
//! - a permanent-deletion blacklist, persisted in `_blacklist`
//! - an in-memory reverse index (job → atoms it added), kept exact by every
//!   delete path
//!
//! [`archive::ResultArchive`] stores finished job results in redb.
//!
//! SQL failures are logged at this boundary and returned as
//! [`StoreError::Sql`]; an operation that failed had no effect.

pub mod archive;
pub(crate) mod sql;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use dashmap::DashMap;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::atom::{Arg, AtomTemplate, GroundAtom, JobId, PartitionId};
use crate::error::StoreError;

use self::sql::{Clause, PARTITION};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// File name of the atom database inside a data directory.
pub const DB_FILE: &str = "atoms.sqlite";

/// Which partitions a migration reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePartitions {
    /// Exactly one source partition.
    One(PartitionId),
    /// Any of a set of partitions (`partition IN (...)`).
    AnyOf(BTreeSet<PartitionId>),
}

impl SourcePartitions {
    fn ids(&self) -> Vec<PartitionId> {
        match self {
            SourcePartitions::One(p) => vec![*p],
            SourcePartitions::AnyOf(set) => set.iter().copied().collect(),
        }
    }
}

/// The partitions a job may see: one write partition plus its read partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScope {
    pub write: PartitionId,
    pub reads: BTreeSet<PartitionId>,
}

impl PartitionScope {
    pub fn new(write: PartitionId, reads: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            write,
            reads: reads.into_iter().collect(),
        }
    }

    /// Every visible partition, write partition first.
    pub fn visible(&self) -> Vec<PartitionId> {
        let mut ids = vec![self.write];
        ids.extend(self.reads.iter().copied().filter(|p| *p != self.write));
        ids
    }
}

fn sql_error(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> StoreError {
    let context = context.into();
    move |source| {
        tracing::error!(context = %context, error = %source, "store operation failed");
        StoreError::Sql { context, source }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Read every row matching `clause` from a predicate table.
fn select_atoms(
    conn: &Connection,
    predicate: &str,
    arity: usize,
    clause: &Clause,
) -> rusqlite::Result<Vec<GroundAtom>> {
    let columns = if arity == 0 {
        String::new()
    } else {
        format!(", {}", sql::arg_columns(arity, None))
    };
    let order = if arity == 0 {
        String::new()
    } else {
        format!(" ORDER BY {}", sql::arg_columns(arity, None))
    };
    let query = format!(
        "SELECT {PARTITION}, value{columns} FROM {} WHERE {}{order}",
        sql::table(predicate),
        clause.sql
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params_from_iter(clause.params.iter()), |row| {
        let partition: PartitionId = row.get(0)?;
        let value: f64 = row.get(1)?;
        let args = (0..arity)
            .map(|i| row.get::<_, String>(i + 2).map(Arg::Exact))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GroundAtom {
            atom: AtomTemplate::new(predicate, args),
            value,
            partition,
        })
    })?;
    rows.collect()
}

/// Select the rows matching `clause`, then delete them. Run inside a
/// transaction so the returned list is exactly what was removed.
fn delete_matching(
    conn: &Connection,
    predicate: &str,
    arity: usize,
    clause: &Clause,
) -> rusqlite::Result<Vec<AtomTemplate>> {
    let doomed = select_atoms(conn, predicate, arity, clause)?;
    let statement = format!("DELETE FROM {} WHERE {}", sql::table(predicate), clause.sql);
    conn.execute(&statement, params_from_iter(clause.params.iter()))?;
    Ok(doomed.into_iter().map(|row| row.atom).collect())
}

/// Relational store of ground atoms, addressed by [`AtomTemplate`].
pub struct AtomStore {
    conn: Mutex<Connection>,
    /// Predicate name → arity.
    predicates: RwLock<HashMap<String, usize>>,
    /// Templates whose atoms may never be re-added.
    blacklist: RwLock<BTreeSet<AtomTemplate>>,
    /// Reverse index: job → atoms it added that are still persisted.
    index: DashMap<JobId, BTreeSet<AtomTemplate>>,
}

impl std::fmt::Debug for AtomStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let predicates = self.predicates.read().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("AtomStore")
            .field("predicates", &predicates)
            .field("indexed_jobs", &self.index.len())
            .finish()
    }
}

impl AtomStore {
    /// Open or create the atom database in `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let path = data_dir.join(DB_FILE);
        let conn = Connection::open(&path)
            .map_err(sql_error(format!("opening {}", path.display())))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )
        .map_err(sql_error("configuring pragmas"))?;
        Self::from_connection(conn)
    }

    /// Create a store that lives only in memory.
    pub fn memory_only() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_error("opening in-memory store"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS _predicates (
                name TEXT PRIMARY KEY,
                arity INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _blacklist (
                predicate TEXT NOT NULL,
                args TEXT NOT NULL,
                PRIMARY KEY (predicate, args)
            );
            ",
        )
        .map_err(sql_error("creating catalog tables"))?;

        let predicates = {
            let mut stmt = conn
                .prepare("SELECT name, arity FROM _predicates")
                .map_err(sql_error("loading predicate catalog"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql_error("loading predicate catalog"))?;
            let mut map = HashMap::new();
            for row in rows {
                let (name, arity) = row.map_err(sql_error("loading predicate catalog"))?;
                match usize::try_from(arity) {
                    Ok(arity) => {
                        map.insert(name, arity);
                    }
                    Err(_) => tracing::warn!(predicate = %name, arity, "skipping catalog entry with bad arity"),
                }
            }
            map
        };

        let blacklist = {
            let mut stmt = conn
                .prepare("SELECT predicate, args FROM _blacklist")
                .map_err(sql_error("loading blacklist"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(sql_error("loading blacklist"))?;
            let mut set = BTreeSet::new();
            for row in rows {
                let (predicate, args) = row.map_err(sql_error("loading blacklist"))?;
                match serde_json::from_str::<Vec<Arg>>(&args) {
                    Ok(args) => {
                        set.insert(AtomTemplate::new(predicate, args));
                    }
                    Err(e) => {
                        tracing::warn!(%predicate, %args, error = %e, "skipping malformed blacklist entry")
                    }
                }
            }
            set
        };

        tracing::debug!(
            predicates = predicates.len(),
            blacklisted = blacklist.len(),
            "atom store opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            predicates: RwLock::new(predicates),
            blacklist: RwLock::new(blacklist),
            index: DashMap::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    /// Register a predicate's schema. Re-registration is logged, not fatal;
    /// the first declared arity wins.
    pub fn declare_predicate(&self, name: &str, arity: usize) -> StoreResult<()> {
        if !is_identifier(name) {
            return Err(StoreError::InvalidPredicate {
                name: name.to_string(),
            });
        }

        if let Some(existing) = self.arity(name) {
            if existing == arity {
                tracing::debug!(predicate = name, arity, "predicate already declared");
            } else {
                tracing::warn!(
                    predicate = name,
                    declared = existing,
                    requested = arity,
                    "predicate re-declared with a different arity, keeping the original"
                );
            }
            return Ok(());
        }

        {
            let mut conn = self.conn();
            let tx = conn
                .transaction()
                .map_err(sql_error(format!("declaring {name}")))?;
            tx.execute(&sql::create_table(name, arity), [])
                .map_err(sql_error(format!("creating table for {name}")))?;
            tx.execute(
                "INSERT OR IGNORE INTO _predicates (name, arity) VALUES (?1, ?2)",
                params![name, arity as i64],
            )
            .map_err(sql_error(format!("cataloguing {name}")))?;
            tx.commit().map_err(sql_error(format!("declaring {name}")))?;
        }

        self.predicates
            .write()
            .expect("predicate catalog lock poisoned")
            .insert(name.to_string(), arity);
        tracing::debug!(predicate = name, arity, "declared predicate");
        Ok(())
    }

    /// Declared arity of a predicate, if any.
    pub fn arity(&self, predicate: &str) -> Option<usize> {
        self.predicates
            .read()
            .expect("predicate catalog lock poisoned")
            .get(predicate)
            .copied()
    }

    /// All declared predicates with their arity, sorted by name.
    pub fn predicates(&self) -> Vec<(String, usize)> {
        let mut all: Vec<_> = self
            .predicates
            .read()
            .expect("predicate catalog lock poisoned")
            .iter()
            .map(|(name, arity)| (name.clone(), *arity))
            .collect();
        all.sort();
        all
    }

    fn declared_arity(&self, predicate: &str) -> StoreResult<usize> {
        self.arity(predicate).ok_or_else(|| {
            tracing::error!(predicate, "use of undeclared predicate");
            StoreError::UndeclaredPredicate {
                predicate: predicate.to_string(),
            }
        })
    }

    fn check_shape(&self, template: &AtomTemplate) -> StoreResult<usize> {
        let arity = self.declared_arity(&template.predicate)?;
        if template.arity() != arity {
            return Err(StoreError::ArityMismatch {
                predicate: template.predicate.clone(),
                expected: arity,
                actual: template.arity(),
            });
        }
        Ok(arity)
    }

    fn require_ground(atom: &AtomTemplate) -> StoreResult<()> {
        if atom.is_ground() {
            Ok(())
        } else {
            Err(StoreError::NotGround {
                atom: atom.to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Insert `atom` with `value` into the shared partition, or update the
    /// value of the existing row in place, and record it under `job`.
    ///
    /// Returns `Ok(false)` when the atom is blacklisted and was dropped.
    pub fn add_atom(&self, job: &JobId, atom: &AtomTemplate, value: f64) -> StoreResult<bool> {
        if !(0.0..=1.0).contains(&value) {
            return Err(StoreError::InvalidValue { value });
        }
        Self::require_ground(atom)?;
        let arity = self.check_shape(atom)?;

        if self.is_blacklisted(atom) {
            tracing::debug!(%atom, job = %job, "ignoring permanently deleted atom");
            return Ok(false);
        }

        let table = sql::table(&atom.predicate);
        let clause = sql::template_clause(atom);
        {
            let conn = self.conn();
            let update = format!("UPDATE {table} SET value = ? WHERE {}", clause.sql);
            let mut update_params = vec![Value::Real(value)];
            update_params.extend(clause.params.iter().cloned());
            let updated = conn
                .execute(&update, params_from_iter(update_params.iter()))
                .map_err(sql_error(format!("updating {atom}")))?;

            if updated == 0 {
                let columns = if arity == 0 {
                    String::new()
                } else {
                    format!(", {}", sql::arg_columns(arity, None))
                };
                let placeholders = vec!["?"; arity + 2].join(", ");
                let insert =
                    format!("INSERT INTO {table} ({PARTITION}, value{columns}) VALUES ({placeholders})");
                let mut insert_params = vec![
                    Value::Integer(i64::from(PartitionId::SHARED.get())),
                    Value::Real(value),
                ];
                insert_params.extend(clause.params);
                conn.execute(&insert, params_from_iter(insert_params.iter()))
                    .map_err(sql_error(format!("inserting {atom}")))?;
            }
        }

        self.index.entry(job.clone()).or_default().insert(atom.clone());
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether any row matches the template.
    pub fn contains(&self, template: &AtomTemplate) -> StoreResult<bool> {
        self.check_shape(template)?;
        let clause = sql::template_clause(template);
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {})",
            sql::table(&template.predicate),
            clause.sql
        );
        self.conn()
            .query_row(&query, params_from_iter(clause.params.iter()), |row| row.get(0))
            .map_err(sql_error(format!("checking {template}")))
    }

    /// Every row of a predicate within `partitions` (empty = all partitions).
    pub fn get_all(&self, predicate: &str, partitions: &[PartitionId]) -> StoreResult<Vec<GroundAtom>> {
        let arity = self.declared_arity(predicate)?;
        self.get_all_where(&AtomTemplate::new(predicate, vec![Arg::Any; arity]), partitions)
    }

    /// Every row matching the template within `partitions` (empty = all).
    pub fn get_all_where(
        &self,
        template: &AtomTemplate,
        partitions: &[PartitionId],
    ) -> StoreResult<Vec<GroundAtom>> {
        let arity = self.check_shape(template)?;
        let mut clause = sql::template_clause(template);
        if let Some(p) = sql::partition_clause(partitions) {
            clause = clause.and(p);
        }
        select_atoms(&self.conn(), &template.predicate, arity, &clause)
            .map_err(sql_error(format!("querying {template}")))
    }

    /// Value of a ground atom if it is stored in one of `partitions`
    /// (empty = any partition).
    pub fn value_of(&self, atom: &AtomTemplate, partitions: &[PartitionId]) -> StoreResult<Option<f64>> {
        Self::require_ground(atom)?;
        self.check_shape(atom)?;
        let mut clause = sql::template_clause(atom);
        if let Some(p) = sql::partition_clause(partitions) {
            clause = clause.and(p);
        }
        let query = format!(
            "SELECT value FROM {} WHERE {}",
            sql::table(&atom.predicate),
            clause.sql
        );
        self.conn()
            .query_row(&query, params_from_iter(clause.params.iter()), |row| row.get(0))
            .optional()
            .map_err(sql_error(format!("reading {atom}")))
    }

    /// Partition currently holding a ground atom.
    pub fn partition_of(&self, atom: &AtomTemplate) -> StoreResult<Option<PartitionId>> {
        Self::require_ground(atom)?;
        self.check_shape(atom)?;
        let clause = sql::template_clause(atom);
        let query = format!(
            "SELECT {PARTITION} FROM {} WHERE {}",
            sql::table(&atom.predicate),
            clause.sql
        );
        self.conn()
            .query_row(&query, params_from_iter(clause.params.iter()), |row| row.get(0))
            .optional()
            .map_err(sql_error(format!("locating {atom}")))
    }

    /// Every partition id that currently holds at least one row.
    pub fn occupied_partitions(&self) -> StoreResult<BTreeSet<PartitionId>> {
        let predicates = self.predicates();
        let conn = self.conn();
        let mut occupied = BTreeSet::new();
        for (predicate, _) in predicates {
            let query = format!("SELECT DISTINCT {PARTITION} FROM {}", sql::table(&predicate));
            let context = format!("listing partitions of {predicate}");
            let mut stmt = conn.prepare(&query).map_err(sql_error(context.clone()))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, PartitionId>(0))
                .map_err(sql_error(context.clone()))?;
            for id in ids {
                occupied.insert(id.map_err(sql_error(context.clone()))?);
            }
        }
        Ok(occupied)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    fn delete_where(
        &self,
        predicate: &str,
        arity: usize,
        clause: &Clause,
        context: &str,
    ) -> StoreResult<Vec<AtomTemplate>> {
        let removed = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(sql_error(context))?;
            let removed =
                delete_matching(&tx, predicate, arity, clause).map_err(sql_error(context))?;
            tx.commit().map_err(sql_error(context))?;
            removed
        };
        self.forget_atoms(&removed);
        Ok(removed)
    }

    /// Delete every row matching any of the templates. Templates may mix
    /// predicates; each predicate is handled by [`Self::delete_batch`].
    pub fn delete_atoms(&self, templates: &[AtomTemplate]) -> StoreResult<usize> {
        let mut by_predicate: BTreeMap<&str, Vec<Vec<Arg>>> = BTreeMap::new();
        for t in templates {
            by_predicate
                .entry(t.predicate.as_str())
                .or_default()
                .push(t.args.clone());
        }
        let mut total = 0;
        for (predicate, rows) in by_predicate {
            total += self.delete_batch(predicate, &rows)?;
        }
        Ok(total)
    }

    /// Delete every row of `predicate` matching one of the OR'd argument
    /// patterns, in chunks that respect the statement parameter limit.
    pub fn delete_batch(&self, predicate: &str, patterns: &[Vec<Arg>]) -> StoreResult<usize> {
        let arity = self.declared_arity(predicate)?;
        if let Some(bad) = patterns.iter().find(|p| p.len() != arity) {
            return Err(StoreError::ArityMismatch {
                predicate: predicate.to_string(),
                expected: arity,
                actual: bad.len(),
            });
        }

        let per_chunk = (sql::MAX_PARAMS / arity.max(1)).max(1);
        let mut total = 0;
        for chunk in patterns.chunks(per_chunk) {
            let templates: Vec<AtomTemplate> = chunk
                .iter()
                .map(|args| AtomTemplate::new(predicate, args.clone()))
                .collect();
            let clause = sql::any_template_clause(&templates);
            total += self
                .delete_where(predicate, arity, &clause, "deleting atom batch")?
                .len();
        }
        tracing::debug!(predicate, patterns = patterns.len(), deleted = total, "deleted atoms");
        Ok(total)
    }

    /// Delete the Cartesian product of per-column candidate lists:
    /// `arg_1 IN (...) AND arg_2 IN (...) ...`. An empty list anywhere
    /// selects nothing.
    pub fn delete_product(&self, predicate: &str, candidates: &[Vec<String>]) -> StoreResult<usize> {
        let arity = self.declared_arity(predicate)?;
        if candidates.len() != arity {
            return Err(StoreError::ArityMismatch {
                predicate: predicate.to_string(),
                expected: arity,
                actual: candidates.len(),
            });
        }
        if candidates.iter().any(Vec::is_empty) {
            tracing::debug!(predicate, "empty candidate column, nothing to delete");
            return Ok(0);
        }

        let clause = candidates
            .iter()
            .enumerate()
            .fold(Clause::all(), |acc, (i, values)| {
                acc.and(sql::in_clause(
                    &sql::arg_column(i),
                    values.iter().cloned().map(Value::Text).collect(),
                ))
            });
        let removed = self.delete_where(predicate, arity, &clause, "deleting atom product")?;
        tracing::debug!(predicate, deleted = removed.len(), "deleted product");
        Ok(removed.len())
    }

    /// Delete rows of `predicate` whose value is below `threshold`.
    ///
    /// With an auxiliary predicate, first deletes the auxiliary rows whose
    /// leading arguments pair them with a primary row below the threshold.
    /// The affected rows are read inside the same transaction, so the
    /// reverse index loses exactly the deleted atoms.
    pub fn delete_batch_below_threshold(
        &self,
        predicate: &str,
        threshold: f64,
        auxiliary: Option<&str>,
    ) -> StoreResult<usize> {
        let arity = self.declared_arity(predicate)?;
        let auxiliary = match auxiliary {
            Some(aux) if aux == predicate => {
                tracing::warn!(predicate, "auxiliary predicate equals primary, ignoring it");
                None
            }
            Some(aux) => {
                let aux_arity = self.declared_arity(aux)?;
                if aux_arity < arity {
                    return Err(StoreError::ArityMismatch {
                        predicate: aux.to_string(),
                        expected: arity,
                        actual: aux_arity,
                    });
                }
                Some((aux, aux_arity))
            }
            None => None,
        };

        let context = format!("deleting {predicate} below {threshold}");
        let removed = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(sql_error(context.as_str()))?;
            let mut removed = Vec::new();
            if let Some((aux, aux_arity)) = auxiliary {
                let paired = sql::paired_below_clause(predicate, aux, arity, threshold);
                removed.extend(
                    delete_matching(&tx, aux, aux_arity, &paired)
                        .map_err(sql_error(context.as_str()))?,
                );
            }
            let below = Clause {
                sql: "value < ?".to_string(),
                params: vec![Value::Real(threshold)],
            };
            removed.extend(
                delete_matching(&tx, predicate, arity, &below).map_err(sql_error(context.as_str()))?,
            );
            tx.commit().map_err(sql_error(context.as_str()))?;
            removed
        };

        self.forget_atoms(&removed);
        tracing::debug!(predicate, threshold, ?auxiliary, deleted = removed.len(), "threshold delete");
        Ok(removed.len())
    }

    /// Delete matching rows and blacklist the template so later
    /// [`Self::add_atom`] calls for covered atoms are ignored.
    pub fn delete_atom_permanently(&self, template: &AtomTemplate) -> StoreResult<usize> {
        self.check_shape(template)?;
        let deleted = self.delete_atoms(std::slice::from_ref(template))?;
        let args = serde_json::to_string(&template.args).map_err(|e| StoreError::Serialization {
            message: format!("failed to encode blacklist entry: {e}"),
        })?;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO _blacklist (predicate, args) VALUES (?1, ?2)",
                params![template.predicate, args],
            )
            .map_err(sql_error(format!("blacklisting {template}")))?;
        self.blacklist
            .write()
            .expect("blacklist lock poisoned")
            .insert(template.clone());
        tracing::info!(%template, deleted, "deleted atoms permanently");
        Ok(deleted)
    }

    /// Whether some blacklist entry covers the atom.
    pub fn is_blacklisted(&self, atom: &AtomTemplate) -> bool {
        let blacklist = self.blacklist.read().expect("blacklist lock poisoned");
        blacklist.contains(atom) || blacklist.iter().any(|t| t.matches(atom))
    }

    // -----------------------------------------------------------------------
    // Partition migration and bulk updates
    // -----------------------------------------------------------------------

    /// Move all rows matching `template` from `source` into `target`.
    ///
    /// Returns the number of rows moved. Zero is a valid outcome: the atom
    /// may already live in `target` or may not exist yet.
    pub fn move_to_partition(
        &self,
        source: &SourcePartitions,
        target: PartitionId,
        template: &AtomTemplate,
    ) -> StoreResult<usize> {
        self.check_shape(template)?;
        let Some(from) = sql::partition_clause(&source.ids()) else {
            return Ok(0);
        };
        let clause = sql::template_clause(template).and(from);
        let statement = format!(
            "UPDATE {} SET {PARTITION} = ? WHERE {}",
            sql::table(&template.predicate),
            clause.sql
        );
        let mut values = vec![Value::Integer(i64::from(target.get()))];
        values.extend(clause.params);
        let moved = self
            .conn()
            .execute(&statement, params_from_iter(values.iter()))
            .map_err(sql_error(format!("moving {template} to {target}")))?;
        if moved == 0 {
            tracing::debug!(%template, ?source, %target, "nothing to move");
        } else {
            tracing::trace!(%template, ?source, %target, moved, "moved atoms");
        }
        Ok(moved)
    }

    /// Set the value of every matching row, optionally only within a scope.
    pub fn set_atoms_to_value(
        &self,
        value: f64,
        template: &AtomTemplate,
        scope: Option<&PartitionScope>,
    ) -> StoreResult<usize> {
        if !(0.0..=1.0).contains(&value) {
            return Err(StoreError::InvalidValue { value });
        }
        self.check_shape(template)?;
        let mut clause = sql::template_clause(template);
        if let Some(p) = scope.and_then(|s| sql::partition_clause(&s.visible())) {
            clause = clause.and(p);
        }
        let statement = format!(
            "UPDATE {} SET value = ? WHERE {}",
            sql::table(&template.predicate),
            clause.sql
        );
        let mut values = vec![Value::Real(value)];
        values.extend(clause.params);
        self.conn()
            .execute(&statement, params_from_iter(values.iter()))
            .map_err(sql_error(format!("setting {template} to {value}")))
    }

    // -----------------------------------------------------------------------
    // Reverse index
    // -----------------------------------------------------------------------

    /// Atoms added by `job` that are still persisted.
    pub fn atoms_of(&self, job: &JobId) -> BTreeSet<AtomTemplate> {
        self.index
            .get(job)
            .map(|set| set.value().clone())
            .unwrap_or_default()
    }

    /// Jobs that added `atom`.
    pub fn jobs_of(&self, atom: &AtomTemplate) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .index
            .iter()
            .filter(|entry| entry.value().contains(atom))
            .map(|entry| entry.key().clone())
            .collect();
        jobs.sort();
        jobs
    }

    /// Drop a job's reverse-index entry without touching its rows.
    pub fn forget_job(&self, job: &JobId) -> BTreeSet<AtomTemplate> {
        self.index.remove(job).map(|(_, set)| set).unwrap_or_default()
    }

    fn forget_atoms(&self, removed: &[AtomTemplate]) {
        if removed.is_empty() {
            return;
        }
        let removed: HashSet<&AtomTemplate> = removed.iter().collect();
        for mut entry in self.index.iter_mut() {
            entry.value_mut().retain(|atom| !removed.contains(atom));
        }
    }
}
