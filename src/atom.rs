//! Core data model: atom templates, ground atom rows, partition and job ids.
//!
//! An [`AtomTemplate`] addresses one or more stored atoms. Each argument is
//! either an exact constant or the [`Arg::Any`] wildcard, so a template with
//! no wildcards names exactly one physical row and a template with wildcards
//! names every row that agrees on the exact positions.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Text token used for [`Arg::Any`] in the display form of a template.
pub const WILDCARD_TOKEN: &str = "?";

/// Identifier of a logical partition of the atom store.
///
/// Partition ids are opaque: they can be compared and printed but not
/// combined arithmetically. New ids are handed out by the partition
/// coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PartitionId(NonZeroU32);

impl PartitionId {
    /// The standing partition every atom is inserted into and returned to.
    pub const SHARED: PartitionId = PartitionId(NonZeroU32::MIN);

    /// Create a `PartitionId` from a raw value. Returns `None` for zero.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(PartitionId)
    }

    /// Get the raw value, as stored in the `partition` column.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Whether this is the shared partition.
    pub fn is_shared(self) -> bool {
        self == Self::SHARED
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identity of a job (an inference problem).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One argument position of an atom template.
///
/// `Exact` sorts before `Any`, so a ground template precedes the wildcard
/// templates that cover it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Arg {
    /// A concrete constant.
    Exact(String),
    /// Matches any value in this position.
    Any,
}

impl Arg {
    pub fn exact(value: impl Into<String>) -> Self {
        Arg::Exact(value.into())
    }

    /// The constant, or `None` for a wildcard.
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            Arg::Exact(v) => Some(v),
            Arg::Any => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Arg::Any)
    }

    /// Whether two argument positions can denote the same constant.
    fn overlaps(&self, other: &Arg) -> bool {
        match (self, other) {
            (Arg::Exact(a), Arg::Exact(b)) => a == b,
            _ => true,
        }
    }
}

impl From<Option<String>> for Arg {
    fn from(value: Option<String>) -> Self {
        value.map_or(Arg::Any, Arg::Exact)
    }
}

impl From<Arg> for Option<String> {
    fn from(arg: Arg) -> Self {
        match arg {
            Arg::Exact(v) => Some(v),
            Arg::Any => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Exact(s.to_string())
    }
}

/// Constants that would not read back as themselves unquoted.
fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value == WILDCARD_TOKEN
        || value.trim() != value
        || value.contains([',', '(', ')', '"', '\\', '\t', '\n'])
}

/// Exact arguments print bare unless they collide with the wildcard token or
/// the delimiters, in which case they are double-quoted with backslash escapes.
impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Exact(v) if needs_quoting(v) => {
                f.write_str("\"")?;
                for c in v.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\t' => f.write_str("\\t")?,
                        '\n' => f.write_str("\\n")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Arg::Exact(v) => f.write_str(v),
            Arg::Any => f.write_str(WILDCARD_TOKEN),
        }
    }
}

/// A predicate applied to an ordered argument list, possibly with wildcards.
///
/// Ordering is lexicographic by predicate, then argument-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomTemplate {
    pub predicate: String,
    pub args: Vec<Arg>,
}

impl AtomTemplate {
    pub fn new(predicate: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            predicate: predicate.into(),
            args,
        }
    }

    /// Build a wildcard-free template from constant arguments.
    pub fn ground<I, S>(predicate: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            predicate,
            args.into_iter().map(|a| Arg::Exact(a.into())).collect(),
        )
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// True when no argument is a wildcard.
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(|a| !a.is_any())
    }

    /// Whether this template covers `atom`: same predicate and arity, and
    /// every exact position agrees.
    pub fn matches(&self, atom: &AtomTemplate) -> bool {
        self.predicate == atom.predicate
            && self.args.len() == atom.args.len()
            && self.args.iter().zip(&atom.args).all(|(pat, arg)| match pat {
                Arg::Any => true,
                Arg::Exact(v) => arg.as_exact() == Some(v.as_str()),
            })
    }

    /// Whether some ground atom is covered by both templates.
    pub fn overlaps(&self, other: &AtomTemplate) -> bool {
        self.predicate == other.predicate
            && self.args.len() == other.args.len()
            && self.args.iter().zip(&other.args).all(|(a, b)| a.overlaps(b))
    }

    /// The constant arguments, or `None` if any position is a wildcard.
    pub fn constants(&self) -> Option<Vec<&str>> {
        self.args.iter().map(Arg::as_exact).collect()
    }
}

impl fmt::Display for AtomTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Error returned when parsing the `Pred(a, b)` text form fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAtomError {
    pub input: String,
}

impl fmt::Display for ParseAtomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed atom \"{}\": expected Pred(arg, ...)", self.input)
    }
}

impl std::error::Error for ParseAtomError {}

impl FromStr for AtomTemplate {
    type Err = ParseAtomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAtomError {
            input: s.to_string(),
        };
        let trimmed = s.trim();
        let open = trimmed.find('(').ok_or_else(err)?;
        let inner = trimmed[open + 1..].strip_suffix(')').ok_or_else(err)?;
        let predicate = trimmed[..open].trim();
        if predicate.is_empty() {
            return Err(err());
        }
        let args = parse_args(inner).ok_or_else(err)?;
        Ok(AtomTemplate::new(predicate, args))
    }
}

/// Split the text between the parentheses into arguments, honouring quoted
/// constants. `None` on an empty bare argument, a bad escape, or an
/// unterminated quote.
fn parse_args(inner: &str) -> Option<Vec<Arg>> {
    let mut args = Vec::new();
    if inner.trim().is_empty() {
        return Some(args);
    }
    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next_if_eq(&'"').is_some() {
            let mut value = String::new();
            loop {
                match chars.next()? {
                    '"' => break,
                    '\\' => value.push(match chars.next()? {
                        't' => '\t',
                        'n' => '\n',
                        c @ ('"' | '\\') => c,
                        _ => return None,
                    }),
                    c => value.push(c),
                }
            }
            args.push(Arg::Exact(value));
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
        } else {
            let mut token = String::new();
            while let Some(c) = chars.next_if(|&c| c != ',') {
                token.push(c);
            }
            match token.trim() {
                "" => return None,
                WILDCARD_TOKEN => args.push(Arg::Any),
                v => args.push(Arg::Exact(v.to_string())),
            }
        }
        match chars.next() {
            None => return Some(args),
            Some(',') => {}
            Some(_) => return None,
        }
    }
}

/// A persisted row: a ground atom, its value in `[0, 1]`, and the partition
/// it currently lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundAtom {
    pub atom: AtomTemplate,
    pub value: f64,
    pub partition: PartitionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_partition_is_one() {
        assert_eq!(PartitionId::SHARED.get(), 1);
        assert!(PartitionId::SHARED.is_shared());
        assert!(PartitionId::new(0).is_none());
        assert!(!PartitionId::new(2).unwrap().is_shared());
    }

    #[test]
    fn ordering_is_predicate_then_args() {
        let a = AtomTemplate::ground("A", ["x", "y"]);
        let b = AtomTemplate::ground("A", ["x", "z"]);
        let c = AtomTemplate::ground("B", ["a", "a"]);
        let wild = AtomTemplate::new("A", vec![Arg::exact("x"), Arg::Any]);
        assert!(a < b);
        assert!(b < c);
        assert!(b < wild, "exact arguments sort before wildcards");
    }

    #[test]
    fn wildcard_matching() {
        let pattern = AtomTemplate::new("P", vec![Arg::exact("x"), Arg::Any]);
        assert!(pattern.matches(&AtomTemplate::ground("P", ["x", "1"])));
        assert!(pattern.matches(&AtomTemplate::ground("P", ["x", "2"])));
        assert!(!pattern.matches(&AtomTemplate::ground("P", ["y", "1"])));
        assert!(!pattern.matches(&AtomTemplate::ground("Q", ["x", "1"])));
        assert!(!pattern.matches(&AtomTemplate::ground("P", ["x"])));
        assert!(!pattern.is_ground());
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = AtomTemplate::new("P", vec![Arg::exact("x"), Arg::Any]);
        let b = AtomTemplate::new("P", vec![Arg::Any, Arg::exact("y")]);
        let c = AtomTemplate::new("P", vec![Arg::exact("z"), Arg::Any]);
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn display_and_parse() {
        let t = AtomTemplate::new("Friends", vec![Arg::exact("alice"), Arg::Any]);
        assert_eq!(t.to_string(), "Friends(alice, ?)");
        assert_eq!("Friends(alice, ?)".parse::<AtomTemplate>().unwrap(), t);
        assert_eq!(
            "Rain()".parse::<AtomTemplate>().unwrap(),
            AtomTemplate::new("Rain", vec![])
        );
        assert!("Friends alice".parse::<AtomTemplate>().is_err());
        assert!("(a)".parse::<AtomTemplate>().is_err());
    }

    #[test]
    fn awkward_constants_survive_text_form() {
        let cases = [
            AtomTemplate::new("P", vec![Arg::exact("?"), Arg::Any]),
            AtomTemplate::ground("P", ["a, b"]),
            AtomTemplate::ground("P", ["f(x)", "tab\there"]),
            AtomTemplate::ground("P", ["say \"hi\"", "back\\slash"]),
            AtomTemplate::ground("P", ["", " padded "]),
        ];
        for t in cases {
            let text = t.to_string();
            assert!(!text.contains('\t'), "{text}");
            assert_eq!(text.parse::<AtomTemplate>().unwrap(), t, "{text}");
        }
        assert_eq!(Arg::exact("?").to_string(), "\"?\"");
        assert_eq!(
            AtomTemplate::ground("P", ["a, b"]).to_string(),
            "P(\"a, b\")"
        );
        assert_eq!(AtomTemplate::ground("P", ["plain"]).to_string(), "P(plain)");
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!("P(a, )".parse::<AtomTemplate>().is_err());
        assert!("P(\"open)".parse::<AtomTemplate>().is_err());
        assert!("P(\"a\" b)".parse::<AtomTemplate>().is_err());
        assert!("P(\"bad\\q\")".parse::<AtomTemplate>().is_err());
    }

    #[test]
    fn arg_serializes_wildcard_as_null() {
        let t = AtomTemplate::new("P", vec![Arg::exact("x"), Arg::Any]);
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"predicate":"P","args":["x",null]}"#);
        let back: AtomTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
