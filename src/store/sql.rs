//! SQL fragment construction for template-addressed queries.
//!
//! Every per-predicate table has the layout
//! `(partition INTEGER, value REAL, arg_1 TEXT, ..., arg_k TEXT)`.
//! Wildcard argument positions produce no condition at all, so they match
//! any stored value. Constants are always bound as parameters, never
//! spliced into the statement text.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};

use crate::atom::{Arg, AtomTemplate, PartitionId};

/// Conservative bound on parameters per statement.
pub(crate) const MAX_PARAMS: usize = 900;

/// Quoted partition column. `PARTITION` is an SQLite keyword.
pub(crate) const PARTITION: &str = "\"partition\"";

impl ToSql for PartitionId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.get())))
    }
}

impl FromSql for PartitionId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        u32::try_from(raw)
            .ok()
            .and_then(PartitionId::new)
            .ok_or(FromSqlError::OutOfRange(raw))
    }
}

/// Quoted table name for a predicate.
pub(crate) fn table(predicate: &str) -> String {
    format!("\"atoms_{predicate}\"")
}

/// Column name of the 0-based argument position `i`.
pub(crate) fn arg_column(i: usize) -> String {
    format!("arg_{}", i + 1)
}

/// Comma-separated argument columns, optionally qualified by a table alias.
pub(crate) fn arg_columns(arity: usize, qualifier: Option<&str>) -> String {
    (0..arity)
        .map(|i| match qualifier {
            Some(q) => format!("{q}.{}", arg_column(i)),
            None => arg_column(i),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn create_table(predicate: &str, arity: usize) -> String {
    let mut columns = vec![
        format!("{PARTITION} INTEGER NOT NULL"),
        "value REAL NOT NULL".to_string(),
    ];
    columns.extend((0..arity).map(|i| format!("{} TEXT NOT NULL", arg_column(i))));
    if arity > 0 {
        columns.push(format!("UNIQUE ({})", arg_columns(arity, None)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table(predicate),
        columns.join(", ")
    )
}

/// A boolean SQL expression with its positional parameters, in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Clause {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Clause {
    /// The always-true clause.
    pub fn all() -> Self {
        Self {
            sql: "1".to_string(),
            params: Vec::new(),
        }
    }

    /// Conjunction of two clauses.
    pub fn and(mut self, other: Clause) -> Self {
        self.sql = format!("({}) AND ({})", self.sql, other.sql);
        self.params.extend(other.params);
        self
    }
}

/// `arg_i = ?` for every exact position of the template.
pub(crate) fn template_clause(template: &AtomTemplate) -> Clause {
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for (i, arg) in template.args.iter().enumerate() {
        if let Arg::Exact(v) = arg {
            parts.push(format!("{} = ?", arg_column(i)));
            params.push(Value::Text(v.clone()));
        }
    }
    if parts.is_empty() {
        return Clause::all();
    }
    Clause {
        sql: parts.join(" AND "),
        params,
    }
}

/// Disjunction of template clauses. An empty slice matches nothing.
pub(crate) fn any_template_clause(templates: &[AtomTemplate]) -> Clause {
    if templates.is_empty() {
        return Clause {
            sql: "0".to_string(),
            params: Vec::new(),
        };
    }
    let mut sql = Vec::with_capacity(templates.len());
    let mut params = Vec::new();
    for t in templates {
        let c = template_clause(t);
        sql.push(format!("({})", c.sql));
        params.extend(c.params);
    }
    Clause {
        sql: sql.join(" OR "),
        params,
    }
}

/// `column IN (?, ?, ...)`. An empty list matches nothing.
pub(crate) fn in_clause(column: &str, values: Vec<Value>) -> Clause {
    if values.is_empty() {
        return Clause {
            sql: "0".to_string(),
            params: Vec::new(),
        };
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    Clause {
        sql: format!("{column} IN ({placeholders})"),
        params: values,
    }
}

/// Restrict to the given partitions; `None` when every partition is allowed.
pub(crate) fn partition_clause(partitions: &[PartitionId]) -> Option<Clause> {
    if partitions.is_empty() {
        return None;
    }
    let values = partitions
        .iter()
        .map(|p| Value::Integer(i64::from(p.get())))
        .collect();
    Some(in_clause(PARTITION, values))
}

/// Correlated condition pairing an auxiliary row with a primary row below
/// `threshold` on the primary's leading `arity` arguments.
pub(crate) fn paired_below_clause(
    primary: &str,
    auxiliary: &str,
    arity: usize,
    threshold: f64,
) -> Clause {
    let mut conditions = vec!["p.value < ?".to_string()];
    conditions.extend((0..arity).map(|i| {
        let col = arg_column(i);
        format!("p.{col} = {}.{col}", table(auxiliary))
    }));
    Clause {
        sql: format!(
            "EXISTS (SELECT 1 FROM {} AS p WHERE {})",
            table(primary),
            conditions.join(" AND ")
        ),
        params: vec![Value::Real(threshold)],
    }
}
