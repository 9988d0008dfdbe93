//! Rule instantiations and their satisfaction arithmetic.
//!
//! A logical grounding is a clause in negated-DNF form: body atoms carry
//! coefficient `+1` (they appear negated), head atoms carry `-1`. Its
//! distance to satisfaction is the Łukasiewicz gap between body and head.
//! An arithmetic grounding is a weighted linear constraint
//! `Σ cᵢ·|vᵢ| {≤, ≥, =} constant`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::atom::AtomTemplate;
use crate::error::SensitivityError;

/// Improvements at or below this are treated as no change.
const EPSILON: f64 = 1e-12;

/// Comparison operator of an arithmetic rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    LessEq,
    GreaterEq,
    Equal,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::LessEq => "<=",
            Comparator::GreaterEq => ">=",
            Comparator::Equal => "=",
        })
    }
}

/// One concrete instantiation of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grounding {
    /// `body₁ ∧ ... ∧ bodyₙ → head₁ ∨ ... ∨ headₘ`
    Logical {
        body: Vec<AtomTemplate>,
        head: Vec<AtomTemplate>,
    },
    /// `Σ coefficientᵢ·atomᵢ comparator constant`
    Arithmetic {
        atoms: Vec<AtomTemplate>,
        coefficients: Vec<f64>,
        comparator: Comparator,
        constant: f64,
    },
}

impl Grounding {
    /// `(atom, coefficient)` pairs in order: body then head for logical
    /// groundings, declaration order for arithmetic ones.
    pub fn terms(&self) -> Vec<(&AtomTemplate, f64)> {
        match self {
            Grounding::Logical { body, head } => body
                .iter()
                .map(|a| (a, 1.0))
                .chain(head.iter().map(|a| (a, -1.0)))
                .collect(),
            Grounding::Arithmetic {
                atoms,
                coefficients,
                ..
            } => atoms.iter().zip(coefficients.iter().copied()).collect(),
        }
    }

    /// Whether this is an arithmetic grounding with an `=` comparator.
    pub fn is_equality(&self) -> bool {
        matches!(
            self,
            Grounding::Arithmetic {
                comparator: Comparator::Equal,
                ..
            }
        )
    }

    /// Distance to satisfaction given one value per term: 0 when satisfied,
    /// positive when violated.
    pub fn distance(&self, coefficients: &[f64], values: &[f64]) -> f64 {
        match self {
            Grounding::Logical { .. } => {
                let (body, head) = logical_scores(coefficients, values);
                (body - head).max(0.0)
            }
            Grounding::Arithmetic {
                comparator,
                constant,
                ..
            } => {
                let lhs = weighted_sum(coefficients, values);
                let violation = match comparator {
                    Comparator::LessEq => lhs - constant,
                    Comparator::GreaterEq => constant - lhs,
                    Comparator::Equal => (lhs - constant).abs(),
                };
                violation.max(0.0)
            }
        }
    }
}

/// `(bodyScore, headScore)` of a logical clause.
///
/// bodyScore = max(0, 1 − Σ_{c>0} max(0, 1 − v)), headScore = min(1, Σ_{c<0} v).
pub fn logical_scores(coefficients: &[f64], values: &[f64]) -> (f64, f64) {
    let mut body_deficit = 0.0;
    let mut head = 0.0;
    for (&c, &v) in coefficients.iter().zip(values) {
        if c > 0.0 {
            body_deficit += (1.0 - v).max(0.0);
        } else if c < 0.0 {
            head += v;
        }
    }
    ((1.0 - body_deficit).max(0.0), head.min(1.0))
}

/// `Σ cᵢ·|vᵢ|`.
pub fn weighted_sum(coefficients: &[f64], values: &[f64]) -> f64 {
    coefficients
        .iter()
        .zip(values)
        .map(|(c, v)| c * v.abs())
        .sum()
}

/// Sign shown on a link.
///
/// For logical groundings it is the sign of the atom's clause coefficient
/// (`+` for body atoms, `-` for head atoms). For inequality groundings it
/// is `+` when lowering the atom reduces the violation and `-` when raising
/// it does. Equality groundings always show `=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Positive,
    Negative,
    Equality,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Polarity::Positive => "+",
            Polarity::Negative => "-",
            Polarity::Equality => "=",
        })
    }
}

impl FromStr for Polarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Polarity::Positive),
            "-" => Ok(Polarity::Negative),
            "=" => Ok(Polarity::Equality),
            other => Err(format!("unknown polarity \"{other}\"")),
        }
    }
}

/// Direction in which an atom would have to move to bring its grounding
/// closer to satisfaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Raise,
    Lower,
    /// Moving the atom cannot help (zero coefficient, or an equality that
    /// already holds).
    Hold,
}

/// Per-atom outcome of evaluating a grounding.
#[derive(Debug, Clone, PartialEq)]
pub struct TermEvaluation {
    pub atom: AtomTemplate,
    pub coefficient: f64,
    pub polarity: Polarity,
    pub direction: Direction,
    pub pressure: bool,
}

/// Outcome of evaluating one grounding at a value assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub distance: f64,
    pub equality: bool,
    pub terms: Vec<TermEvaluation>,
}

impl Grounding {
    /// Evaluate distance, polarity, direction, and pressure for every term.
    ///
    /// `values` holds one value per term, aligned with [`Self::terms`].
    /// Pressure means that moving the atom by `step` in its preferred
    /// direction strictly reduces the distance.
    pub fn evaluate(&self, values: &[f64], step: f64) -> Result<Evaluation, SensitivityError> {
        let terms = self.terms();
        if values.len() != terms.len() {
            return Err(SensitivityError::ValueCount {
                expected: terms.len(),
                found: values.len(),
            });
        }
        let coefficients: Vec<f64> = terms.iter().map(|(_, c)| *c).collect();
        let distance = self.distance(&coefficients, values);
        let equality = self.is_equality();

        let lhs_gap = match self {
            Grounding::Arithmetic { constant, .. } => weighted_sum(&coefficients, values) - constant,
            Grounding::Logical { .. } => 0.0,
        };

        let mut scratch = values.to_vec();
        let evaluated = terms
            .iter()
            .enumerate()
            .map(|(i, (atom, c))| {
                let c = *c;
                let (polarity, direction) = match self {
                    Grounding::Logical { .. } => {
                        if c > 0.0 {
                            (Polarity::Positive, Direction::Lower)
                        } else {
                            (Polarity::Negative, Direction::Raise)
                        }
                    }
                    Grounding::Arithmetic { comparator, .. } => {
                        arithmetic_direction(*comparator, c, lhs_gap)
                    }
                };

                let pressure = match direction {
                    Direction::Hold => false,
                    Direction::Raise | Direction::Lower => {
                        let original = scratch[i];
                        let moved = match direction {
                            Direction::Raise => (original + step).clamp(0.0, 1.0),
                            _ => (original - step).clamp(0.0, 1.0),
                        };
                        scratch[i] = moved;
                        let improved = distance - self.distance(&coefficients, &scratch);
                        scratch[i] = original;
                        improved > EPSILON
                    }
                };

                TermEvaluation {
                    atom: (*atom).clone(),
                    coefficient: c,
                    polarity,
                    direction,
                    pressure,
                }
            })
            .collect();

        Ok(Evaluation {
            distance,
            equality,
            terms: evaluated,
        })
    }
}

fn arithmetic_direction(comparator: Comparator, c: f64, lhs_gap: f64) -> (Polarity, Direction) {
    if c == 0.0 {
        let polarity = if comparator == Comparator::Equal {
            Polarity::Equality
        } else {
            Polarity::Positive
        };
        return (polarity, Direction::Hold);
    }
    match comparator {
        Comparator::LessEq if c > 0.0 => (Polarity::Positive, Direction::Lower),
        Comparator::LessEq => (Polarity::Negative, Direction::Raise),
        Comparator::GreaterEq if c > 0.0 => (Polarity::Negative, Direction::Raise),
        Comparator::GreaterEq => (Polarity::Positive, Direction::Lower),
        Comparator::Equal => {
            let direction = if lhs_gap * c > 0.0 {
                Direction::Lower
            } else if lhs_gap * c < 0.0 {
                Direction::Raise
            } else {
                Direction::Hold
            };
            (Polarity::Equality, direction)
        }
    }
}
