//! Sensitivity graph: which atoms each rule grounding depends on, and how.
//!
//! Built once from a job's converged values and the groundings its solver
//! used. Atom nodes link to grounding nodes; each link records the atom's
//! polarity in that grounding, the direction it would have to move to help,
//! and whether a small move in that direction actually would (pressure).
//! Groundings carry their distance to satisfaction.

pub mod export;
pub mod grounding;

use std::collections::{BTreeMap, HashMap};

use petgraph::Direction as EdgeDirection;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::atom::AtomTemplate;
use crate::error::SensitivityError;
use crate::solver::RuleGrounding;

pub use grounding::{Comparator, Direction, Evaluation, Grounding, Polarity};

/// Result type for sensitivity graph operations.
pub type SensitivityResult<T> = std::result::Result<T, SensitivityError>;

/// Perturbation used to test pressure when none is configured.
pub const DEFAULT_PRESSURE_STEP: f64 = 0.1;

/// Node payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Atom {
        atom: AtomTemplate,
        value: f64,
    },
    Grounding {
        name: String,
        rule: String,
        /// Position in build order.
        position: usize,
        distance: f64,
        equality: bool,
    },
}

/// Edge payload: atom → grounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub polarity: Polarity,
    pub direction: Direction,
    pub coefficient: f64,
    pub pressure: bool,
    /// Index of the atom among the grounding's terms.
    term: usize,
}

/// A link resolved to its endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub atom: AtomTemplate,
    pub grounding: String,
    pub polarity: Polarity,
    pub direction: Direction,
    pub coefficient: f64,
    pub pressure: bool,
}

/// Bipartite atom/grounding graph for one job's run.
pub struct SensitivityGraph {
    graph: DiGraph<Node, Link>,
    atoms: HashMap<AtomTemplate, NodeIndex>,
    groundings: HashMap<String, NodeIndex>,
    /// Grounding nodes in build order.
    order: Vec<NodeIndex>,
}

impl SensitivityGraph {
    /// Build with the default pressure step.
    pub fn build(
        values: &BTreeMap<AtomTemplate, f64>,
        groundings: &[RuleGrounding],
    ) -> SensitivityResult<Self> {
        Self::build_with_step(values, groundings, DEFAULT_PRESSURE_STEP)
    }

    /// Build the graph, naming groundings `Rule[k]` with `k` counting from 1
    /// per rule in input order.
    ///
    /// Groundings are evaluated in parallel; insertion is sequential so node
    /// and link order is deterministic.
    pub fn build_with_step(
        values: &BTreeMap<AtomTemplate, f64>,
        groundings: &[RuleGrounding],
        step: f64,
    ) -> SensitivityResult<Self> {
        let mut counters: HashMap<&str, usize> = HashMap::new();
        let named: Vec<(String, &RuleGrounding)> = groundings
            .iter()
            .map(|g| {
                let k = counters.entry(g.rule.as_str()).or_insert(0);
                *k += 1;
                (format!("{}[{}]", g.rule, k), g)
            })
            .collect();

        let evaluations: Vec<Evaluation> = named
            .par_iter()
            .map(|(name, g)| evaluate(name, &g.grounding, values, step))
            .collect::<SensitivityResult<_>>()?;

        let mut graph = DiGraph::new();
        let mut atoms = HashMap::new();
        let mut by_name = HashMap::new();
        let mut order = Vec::with_capacity(named.len());

        for (position, ((name, g), eval)) in named.into_iter().zip(evaluations).enumerate() {
            let gi = graph.add_node(Node::Grounding {
                name: name.clone(),
                rule: g.rule.clone(),
                position,
                distance: eval.distance,
                equality: eval.equality,
            });
            by_name.insert(name, gi);
            order.push(gi);

            for (term, t) in eval.terms.into_iter().enumerate() {
                let ai = *atoms.entry(t.atom.clone()).or_insert_with(|| {
                    let value = values.get(&t.atom).copied().unwrap_or_default();
                    graph.add_node(Node::Atom {
                        atom: t.atom.clone(),
                        value,
                    })
                });
                graph.add_edge(
                    ai,
                    gi,
                    Link {
                        polarity: t.polarity,
                        direction: t.direction,
                        coefficient: t.coefficient,
                        pressure: t.pressure,
                        term,
                    },
                );
            }
        }

        tracing::debug!(
            atoms = atoms.len(),
            groundings = order.len(),
            links = graph.edge_count(),
            "built sensitivity graph"
        );

        Ok(Self {
            graph,
            atoms,
            groundings: by_name,
            order,
        })
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn grounding_count(&self) -> usize {
        self.order.len()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Grounding names in build order.
    pub fn grounding_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().filter_map(|&i| match &self.graph[i] {
            Node::Grounding { name, .. } => Some(name.as_str()),
            Node::Atom { .. } => None,
        })
    }

    /// Converged value of an atom in the graph.
    pub fn value(&self, atom: &AtomTemplate) -> Option<f64> {
        let &i = self.atoms.get(atom)?;
        match &self.graph[i] {
            Node::Atom { value, .. } => Some(*value),
            Node::Grounding { .. } => None,
        }
    }

    /// Every grounding the atom participates in, in build order.
    pub fn outgoing_links(&self, atom: &AtomTemplate) -> Vec<LinkRecord> {
        match self.atoms.get(atom) {
            Some(&i) => self.links_at(i, EdgeDirection::Outgoing),
            None => Vec::new(),
        }
    }

    /// Every atom the grounding depends on, in term order.
    pub fn incoming_links(&self, grounding: &str) -> Vec<LinkRecord> {
        match self.groundings.get(grounding) {
            Some(&i) => self.links_at(i, EdgeDirection::Incoming),
            None => Vec::new(),
        }
    }

    /// All links, grouped by grounding in build order.
    pub fn links(&self) -> Vec<LinkRecord> {
        self.order
            .iter()
            .flat_map(|&i| self.links_at(i, EdgeDirection::Incoming))
            .collect()
    }

    /// The first link between an atom and a grounding.
    pub fn link(&self, atom: &AtomTemplate, grounding: &str) -> Option<LinkRecord> {
        self.incoming_links(grounding)
            .into_iter()
            .find(|l| &l.atom == atom)
    }

    /// Distance to satisfaction of a grounding.
    pub fn satisfaction(&self, grounding: &str) -> Option<f64> {
        let &i = self.groundings.get(grounding)?;
        match &self.graph[i] {
            Node::Grounding { distance, .. } => Some(*distance),
            Node::Atom { .. } => None,
        }
    }

    /// Whether a grounding is an arithmetic equality.
    pub fn is_equality(&self, grounding: &str) -> bool {
        self.groundings
            .get(grounding)
            .is_some_and(|&i| matches!(self.graph[i], Node::Grounding { equality: true, .. }))
    }

    /// Groundings with distance strictly above `threshold`, worst first.
    /// Ties are broken by name.
    pub fn most_violated(&self, threshold: f64) -> Vec<(String, f64)> {
        let mut violated: Vec<(String, f64)> = self
            .order
            .iter()
            .filter_map(|&i| match &self.graph[i] {
                Node::Grounding { name, distance, .. } if *distance > threshold => {
                    Some((name.clone(), *distance))
                }
                _ => None,
            })
            .collect();
        violated.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        violated
    }

    fn links_at(&self, node: NodeIndex, dir: EdgeDirection) -> Vec<LinkRecord> {
        let mut edges: Vec<_> = self.graph.edges_directed(node, dir).collect();
        edges.sort_by_key(|e| (self.position(e.target()), e.weight().term));
        edges
            .into_iter()
            .filter_map(|e| {
                let atom = match &self.graph[e.source()] {
                    Node::Atom { atom, .. } => atom.clone(),
                    Node::Grounding { .. } => return None,
                };
                let grounding = match &self.graph[e.target()] {
                    Node::Grounding { name, .. } => name.clone(),
                    Node::Atom { .. } => return None,
                };
                let link = e.weight();
                Some(LinkRecord {
                    atom,
                    grounding,
                    polarity: link.polarity,
                    direction: link.direction,
                    coefficient: link.coefficient,
                    pressure: link.pressure,
                })
            })
            .collect()
    }

    fn position(&self, node: NodeIndex) -> usize {
        match self.graph[node] {
            Node::Grounding { position, .. } => position,
            Node::Atom { .. } => usize::MAX,
        }
    }
}

impl std::fmt::Debug for SensitivityGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitivityGraph")
            .field("atoms", &self.atom_count())
            .field("groundings", &self.grounding_count())
            .field("links", &self.link_count())
            .finish()
    }
}

fn evaluate(
    name: &str,
    grounding: &Grounding,
    values: &BTreeMap<AtomTemplate, f64>,
    step: f64,
) -> SensitivityResult<Evaluation> {
    if let Grounding::Arithmetic {
        atoms,
        coefficients,
        ..
    } = grounding
    {
        if atoms.len() != coefficients.len() {
            return Err(SensitivityError::Shape {
                grounding: name.to_string(),
                atoms: atoms.len(),
                coefficients: coefficients.len(),
            });
        }
    }
    let current = grounding
        .terms()
        .into_iter()
        .map(|(atom, _)| {
            values
                .get(atom)
                .copied()
                .ok_or_else(|| SensitivityError::UnknownValue {
                    atom: atom.to_string(),
                    grounding: name.to_string(),
                })
        })
        .collect::<SensitivityResult<Vec<f64>>>()?;
    grounding.evaluate(&current, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(p: &str) -> AtomTemplate {
        AtomTemplate::ground(p, ["x"])
    }

    fn implication_graph() -> SensitivityGraph {
        let values = BTreeMap::from([(atom("A"), 0.9), (atom("B"), 0.8), (atom("C"), 0.3)]);
        let groundings = vec![RuleGrounding::new(
            "R",
            Grounding::Logical {
                body: vec![atom("A"), atom("B")],
                head: vec![atom("C")],
            },
        )];
        SensitivityGraph::build(&values, &groundings).unwrap()
    }

    #[test]
    fn implication_links_and_distance() {
        let g = implication_graph();
        assert_eq!(g.atom_count(), 3);
        assert_eq!(g.grounding_count(), 1);
        assert_eq!(g.link_count(), 3);

        let d = g.satisfaction("R[1]").unwrap();
        assert!((d - 0.4).abs() < 1e-9);

        let c = g.link(&atom("C"), "R[1]").unwrap();
        assert_eq!(c.polarity, Polarity::Negative);
        assert!(c.pressure);
        assert!(!g.is_equality("R[1]"));

        let incoming: Vec<_> = g.incoming_links("R[1]").into_iter().map(|l| l.atom).collect();
        assert_eq!(incoming, vec![atom("A"), atom("B"), atom("C")]);
    }

    #[test]
    fn groundings_are_numbered_per_rule() {
        let values = BTreeMap::from([(atom("A"), 0.2), (atom("B"), 0.9)]);
        let logical = Grounding::Logical {
            body: vec![atom("A")],
            head: vec![atom("B")],
        };
        let groundings = vec![
            RuleGrounding::new("R", logical.clone()),
            RuleGrounding::new("S", logical.clone()),
            RuleGrounding::new("R", logical),
        ];
        let g = SensitivityGraph::build(&values, &groundings).unwrap();
        let names: Vec<_> = g.grounding_names().collect();
        assert_eq!(names, vec!["R[1]", "S[1]", "R[2]"]);

        let out: Vec<_> = g
            .outgoing_links(&atom("A"))
            .into_iter()
            .map(|l| l.grounding)
            .collect();
        assert_eq!(out, vec!["R[1]", "S[1]", "R[2]"]);
    }

    #[test]
    fn equality_groundings_are_flagged() {
        let values = BTreeMap::from([(atom("A"), 0.7), (atom("B"), 0.4)]);
        let groundings = vec![RuleGrounding::new(
            "Eq",
            Grounding::Arithmetic {
                atoms: vec![atom("A"), atom("B")],
                coefficients: vec![1.0, -1.0],
                comparator: Comparator::Equal,
                constant: 0.0,
            },
        )];
        let g = SensitivityGraph::build(&values, &groundings).unwrap();
        assert!(g.is_equality("Eq[1]"));
        assert!(g.links().iter().all(|l| l.polarity == Polarity::Equality));
    }

    #[test]
    fn most_violated_is_sorted_and_strict() {
        let values = BTreeMap::from([(atom("A"), 1.0), (atom("B"), 0.5), (atom("C"), 0.0)]);
        let groundings = vec![
            RuleGrounding::new(
                "Half",
                Grounding::Logical {
                    body: vec![atom("A")],
                    head: vec![atom("B")],
                },
            ),
            RuleGrounding::new(
                "Full",
                Grounding::Logical {
                    body: vec![atom("A")],
                    head: vec![atom("C")],
                },
            ),
            RuleGrounding::new(
                "Also",
                Grounding::Logical {
                    body: vec![atom("A")],
                    head: vec![atom("B")],
                },
            ),
        ];
        let g = SensitivityGraph::build(&values, &groundings).unwrap();
        let worst = g.most_violated(0.0);
        let names: Vec<_> = worst.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Full[1]", "Also[1]", "Half[1]"]);
        assert!(g.most_violated(0.5).iter().all(|(_, d)| *d > 0.5));
        assert_eq!(g.most_violated(1.0).len(), 0);
    }

    #[test]
    fn missing_values_are_rejected() {
        let groundings = vec![RuleGrounding::new(
            "R",
            Grounding::Logical {
                body: vec![atom("A")],
                head: vec![],
            },
        )];
        let err = SensitivityGraph::build(&BTreeMap::new(), &groundings).unwrap_err();
        assert!(matches!(err, SensitivityError::UnknownValue { .. }));
    }

    #[test]
    fn mismatched_coefficients_are_rejected() {
        let values = BTreeMap::from([(atom("A"), 0.5)]);
        let groundings = vec![RuleGrounding::new(
            "Bad",
            Grounding::Arithmetic {
                atoms: vec![atom("A")],
                coefficients: vec![1.0, 2.0],
                comparator: Comparator::LessEq,
                constant: 1.0,
            },
        )];
        let err = SensitivityGraph::build(&values, &groundings).unwrap_err();
        assert!(matches!(err, SensitivityError::Shape { atoms: 1, coefficients: 2, .. }));
    }

    #[test]
    fn unknown_names_yield_nothing() {
        let g = implication_graph();
        assert!(g.outgoing_links(&atom("Z")).is_empty());
        assert!(g.incoming_links("Nope[1]").is_empty());
        assert_eq!(g.satisfaction("Nope[1]"), None);
        assert!(!g.is_equality("Nope[1]"));
    }
}
