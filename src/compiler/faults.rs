use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Chance that a scanned line receives a mutation.
const MUTATION_PROBABILITY: f64 = 0.3;

/// Difficulty of a faulted variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// One fault per five lines.
    Easy,
    /// One fault per four lines.
    Medium,
    /// One fault per three lines.
    Hard,
}

/// Malformed `errors` request value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid errors spec '{0}', expected '<0|1>,<none|easy|medium|hard>'")]
pub struct ErrorsSpecError(pub String);

impl Tier {
    /// Number of faults to apply to a body of `lines` lines.
    pub fn target(self, lines: usize) -> usize {
        let per = match self {
            Tier::Easy => 5,
            Tier::Medium => 4,
            Tier::Hard => 3,
        };
        lines.div_ceil(per)
    }

    /// Parse a `"<0|1>,<none|easy|medium|hard>"` request value.
    ///
    /// `Ok(None)` means no faulted variant was requested.
    pub fn parse_errors_spec(spec: &str) -> Result<Option<Tier>, ErrorsSpecError> {
        let invalid = || ErrorsSpecError(spec.to_string());
        let (enabled, tier) = spec.trim().split_once(',').ok_or_else(invalid)?;
        let enabled = match enabled.trim() {
            "0" => false,
            "1" => true,
            _ => return Err(invalid()),
        };
        let tier = match tier.trim().to_ascii_lowercase().as_str() {
            "none" => None,
            other => Some(other.parse::<Tier>().map_err(|_| invalid())?),
        };
        Ok(if enabled { tier } else { None })
    }
}

impl FromStr for Tier {
    type Err = ErrorsSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Tier::Easy),
            "medium" => Ok(Tier::Medium),
            "hard" => Ok(Tier::Hard),
            _ => Err(ErrorsSpecError(s.to_string())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Easy => "easy",
            Tier::Medium => "medium",
            Tier::Hard => "hard",
        })
    }
}

/// Corruption operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Swap a line with the one two positions ahead (behind near the end).
    Transpose,
    /// Drop one to three trailing characters.
    Truncate,
    /// Remove the line.
    Delete,
    /// Flip the next `TRUE`/`FALSE` literal after the line.
    FlipBoolean,
    /// Remove one `AND` term from the next `IF`.
    StripCondition,
    /// Point one actuator's tags at another actuator.
    SwapActuator,
}

impl FaultKind {
    /// Every operator.
    pub const ALL: [FaultKind; 6] = [
        FaultKind::Transpose,
        FaultKind::Truncate,
        FaultKind::Delete,
        FaultKind::FlipBoolean,
        FaultKind::StripCondition,
        FaultKind::SwapActuator,
    ];
}

/// A mutation that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFault {
    /// Operator.
    pub kind: FaultKind,
    /// Line index the operator changed, at the time it was applied.
    pub line: usize,
}

/// Corrupted body plus the mutations that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultedProgram {
    /// Corrupted lines.
    pub lines: Vec<String>,
    /// Applied mutations in order.
    pub faults: Vec<AppliedFault>,
}

impl FaultedProgram {
    /// Corrupted body as text.
    pub fn code(&self) -> String {
        let mut code = self.lines.join("\n");
        code.push('\n');
        code
    }
}

/// Produces deliberately broken variants of rendered programs.
///
/// The random source is injected so runs can be reproduced from a seed.
#[derive(Debug, Clone)]
pub struct FaultInjector<R> {
    rng: R,
}

impl FaultInjector<StdRng> {
    /// Injector with a reproducible seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// Injector seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> FaultInjector<R> {
    /// Wrap a random source.
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Apply `tier.target(body.len())` mutations to a copy of `body`.
    ///
    /// Lines are scanned repeatedly; each line is mutated with probability
    /// 0.3 by a randomly chosen operator. Operators that find nothing to
    /// change do not count.
    pub fn inject(&mut self, body: &[String], tier: Tier, labels: &[char]) -> FaultedProgram {
        let target = tier.target(body.len());
        let mut lines = body.to_vec();
        let mut faults = Vec::with_capacity(target);

        while faults.len() < target && !lines.is_empty() {
            let mut index = 0;
            while index < lines.len() && faults.len() < target {
                if self.rng.gen_bool(MUTATION_PROBABILITY) {
                    let kind = FaultKind::ALL[self.rng.gen_range(0..FaultKind::ALL.len())];
                    if let Some(line) = self.apply(kind, &mut lines, index, labels) {
                        faults.push(AppliedFault { kind, line });
                    }
                }
                index += 1;
            }
        }

        FaultedProgram { lines, faults }
    }

    fn apply(
        &mut self,
        kind: FaultKind,
        lines: &mut Vec<String>,
        index: usize,
        labels: &[char],
    ) -> Option<usize> {
        match kind {
            FaultKind::Transpose => transpose(lines, index),
            FaultKind::Truncate => {
                let count = self.rng.gen_range(1..=3);
                truncate(lines, index, count)
            }
            FaultKind::Delete => {
                lines.remove(index);
                Some(index)
            }
            FaultKind::FlipBoolean => flip_boolean(lines, index),
            FaultKind::StripCondition => strip_condition(lines, index),
            FaultKind::SwapActuator => self.swap_actuator(lines, index, labels),
        }
    }

    fn swap_actuator(&mut self, lines: &mut [String], index: usize, labels: &[char]) -> Option<usize> {
        if labels.len() < 2 || lines.is_empty() {
            return None;
        }
        let order = (index..lines.len()).chain(0..index.min(lines.len()));
        for position in order {
            let Some(&from) = labels
                .iter()
                .find(|label| lines[position].contains(&format!("_{}_", label)))
            else {
                continue;
            };
            let others: Vec<char> = labels.iter().copied().filter(|l| *l != from).collect();
            let to = *others.choose(&mut self.rng)?;
            lines[position] =
                lines[position].replace(&format!("_{}_", from), &format!("_{}_", to));
            return Some(position);
        }
        None
    }
}

fn transpose(lines: &mut [String], index: usize) -> Option<usize> {
    let other = if index + 2 < lines.len() {
        index + 2
    } else if index >= 2 {
        index - 2
    } else {
        return None;
    };
    if lines[index] == lines[other] {
        return None;
    }
    lines.swap(index, other);
    Some(index)
}

fn truncate(lines: &mut [String], index: usize, count: usize) -> Option<usize> {
    let line = &mut lines[index];
    let chars = line.chars().count();
    if chars == 0 {
        return None;
    }
    let keep = chars.saturating_sub(count);
    *line = line.chars().take(keep).collect();
    Some(index)
}

fn flip_boolean(lines: &mut [String], index: usize) -> Option<usize> {
    for position in index + 1..lines.len() {
        let line = &lines[position];
        let flipped = match (line.find("TRUE"), line.find("FALSE")) {
            (Some(t), Some(f)) if f < t => line.replacen("FALSE", "TRUE", 1),
            (Some(_), _) => line.replacen("TRUE", "FALSE", 1),
            (None, Some(_)) => line.replacen("FALSE", "TRUE", 1),
            (None, None) => continue,
        };
        lines[position] = flipped;
        return Some(position);
    }
    None
}

fn strip_condition(lines: &mut [String], index: usize) -> Option<usize> {
    for position in index..lines.len() {
        let line = &lines[position];
        if !line.trim_start().starts_with("IF ") {
            continue;
        }
        let Some(and_at) = line.rfind(" AND ") else {
            continue;
        };
        let rest = &line[and_at + 5..];
        let term_end = rest.find(" THEN").map_or(line.len(), |i| and_at + 5 + i);
        let stripped = format!("{}{}", &line[..and_at], &line[term_end..]);
        lines[position] = stripped;
        return Some(position);
    }
    None
}
