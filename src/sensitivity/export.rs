//! Plain-text export of a sensitivity graph, and its parser.
//!
//! ```text
//! # links
//! A(x)	+~	R[1]
//! C(x)	-~	R[1]
//! # satisfaction
//! R[1]	0.4
//! ```

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::atom::AtomTemplate;
use crate::error::SensitivityError;

use super::{Polarity, SensitivityGraph};

const LINKS_HEADER: &str = "# links";
const SATISFACTION_HEADER: &str = "# satisfaction";

/// One `atom polarity~ grounding` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLink {
    pub atom: AtomTemplate,
    pub polarity: Polarity,
    pub grounding: String,
}

/// Flattened view of a sensitivity graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    pub links: Vec<ReportLink>,
    pub satisfaction: Vec<(String, f64)>,
}

#[derive(Clone, Copy)]
enum Section {
    None,
    Links,
    Satisfaction,
}

impl SensitivityReport {
    pub fn from_graph(graph: &SensitivityGraph) -> Self {
        let links = graph
            .links()
            .into_iter()
            .map(|l| ReportLink {
                atom: l.atom,
                polarity: l.polarity,
                grounding: l.grounding,
            })
            .collect();
        let satisfaction = graph
            .grounding_names()
            .filter_map(|name| graph.satisfaction(name).map(|d| (name.to_string(), d)))
            .collect();
        Self {
            links,
            satisfaction,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{LINKS_HEADER}");
        for l in &self.links {
            let _ = writeln!(out, "{}\t{}~\t{}", l.atom, l.polarity, l.grounding);
        }
        let _ = writeln!(out, "{SATISFACTION_HEADER}");
        for (name, distance) in &self.satisfaction {
            let _ = writeln!(out, "{name}\t{distance}");
        }
        out
    }

    /// Parse an exported report.
    ///
    /// Malformed lines are logged, skipped, and returned alongside the
    /// records that did parse.
    pub fn parse(text: &str) -> (Self, Vec<SensitivityError>) {
        let mut report = Self::default();
        let mut skipped = Vec::new();
        let mut section = Section::None;

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match line.trim() {
                LINKS_HEADER => {
                    section = Section::Links;
                    continue;
                }
                SATISFACTION_HEADER => {
                    section = Section::Satisfaction;
                    continue;
                }
                _ => {}
            }
            let parsed = match section {
                Section::Links => parse_link(line).map(|l| report.links.push(l)),
                Section::Satisfaction => {
                    parse_satisfaction(line).map(|s| report.satisfaction.push(s))
                }
                Section::None => Err("record outside of any section".to_string()),
            };
            if let Err(message) = parsed {
                let err = SensitivityError::Format {
                    line: n + 1,
                    message,
                };
                tracing::warn!(error = %err, "skipping sensitivity record");
                skipped.push(err);
            }
        }
        (report, skipped)
    }
}

impl SensitivityGraph {
    /// Render the graph in the plain-text export format.
    pub fn to_text(&self) -> String {
        SensitivityReport::from_graph(self).render()
    }
}

fn parse_link(line: &str) -> Result<ReportLink, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [atom, polarity, grounding] = fields.as_slice() else {
        return Err(format!("expected 3 tab-separated fields, found {}", fields.len()));
    };
    let atom = atom.parse::<AtomTemplate>().map_err(|e| e.to_string())?;
    let polarity = polarity
        .strip_suffix('~')
        .ok_or_else(|| format!("polarity \"{polarity}\" lacks the ~ marker"))?
        .parse::<Polarity>()?;
    if grounding.is_empty() {
        return Err("empty grounding name".to_string());
    }
    Ok(ReportLink {
        atom,
        polarity,
        grounding: grounding.to_string(),
    })
}

fn parse_satisfaction(line: &str) -> Result<(String, f64), String> {
    let (name, distance) = line
        .split_once('\t')
        .ok_or_else(|| "expected <grounding>\\t<distance>".to_string())?;
    if name.is_empty() {
        return Err("empty grounding name".to_string());
    }
    let distance = distance
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad distance \"{distance}\": {e}"))?;
    Ok((name.to_string(), distance))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sensitivity::Grounding;
    use crate::solver::RuleGrounding;

    fn atom(p: &str) -> AtomTemplate {
        AtomTemplate::ground(p, ["x"])
    }

    #[test]
    fn export_lists_links_then_satisfaction() {
        let values = BTreeMap::from([(atom("A"), 1.0), (atom("C"), 0.5)]);
        let groundings = vec![RuleGrounding::new(
            "R",
            Grounding::Logical {
                body: vec![atom("A")],
                head: vec![atom("C")],
            },
        )];
        let graph = SensitivityGraph::build(&values, &groundings).unwrap();
        let text = graph.to_text();
        assert_eq!(
            text,
            "# links\nA(x)\t+~\tR[1]\nC(x)\t-~\tR[1]\n# satisfaction\nR[1]\t0.5\n"
        );

        let (report, skipped) = SensitivityReport::parse(&text);
        assert!(skipped.is_empty());
        assert_eq!(report, SensitivityReport::from_graph(&graph));
    }

    #[test]
    fn quoted_constants_read_back_from_export() {
        let question = AtomTemplate::ground("Asked", ["?"]);
        let pair = AtomTemplate::ground("Named", ["Smith, J"]);
        let report = SensitivityReport {
            links: vec![
                ReportLink {
                    atom: question,
                    polarity: Polarity::Positive,
                    grounding: "R[1]".into(),
                },
                ReportLink {
                    atom: pair,
                    polarity: Polarity::Negative,
                    grounding: "R[1]".into(),
                },
            ],
            satisfaction: vec![("R[1]".into(), 0.25)],
        };
        let (parsed, skipped) = SensitivityReport::parse(&report.render());
        assert!(skipped.is_empty());
        assert_eq!(parsed, report);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "stray\n# links\nA(x)\t+~\tR[1]\nA(x)\t*~\tR[1]\nnot an atom\n\
                    # satisfaction\nR[1]\tabc\nR[1]\t0.25\n";
        let (report, skipped) = SensitivityReport::parse(text);
        assert_eq!(report.links.len(), 1);
        assert_eq!(report.satisfaction, vec![("R[1]".to_string(), 0.25)]);
        let lines: Vec<usize> = skipped
            .iter()
            .map(|e| match e {
                SensitivityError::Format { line, .. } => *line,
                _ => 0,
            })
            .collect();
        assert_eq!(lines, vec![1, 4, 5, 7]);
    }
}
