use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Direction an actuator is commanded to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `+`
    Extend,
    /// `-`
    Retract,
}

impl Direction {
    /// Notation symbol for this direction.
    pub fn symbol(self) -> char {
        match self {
            Direction::Extend => '+',
            Direction::Retract => '-',
        }
    }
}

/// Command to extend or retract one labeled actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actuation {
    /// Single upper-case actuator label.
    pub label: char,
    /// Commanded direction.
    pub direction: Direction,
}

/// Timed delay, either literal or offset from the `T_VARIABLE` runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerDelay {
    /// `2S`, `0.5S`
    Fixed(Duration),
    /// `TS` (no offset) or `T+2S`
    RuntimeRelative {
        /// Literal seconds added to the runtime value.
        offset: Option<Duration>,
    },
}

impl TimerDelay {
    /// Whether the delay reads `T_VARIABLE` at execution time.
    pub fn uses_runtime_var(&self) -> bool {
        matches!(self, TimerDelay::RuntimeRelative { .. })
    }

    /// Resolve the delay against a runtime timer value expressed in seconds.
    /// `None` when the offset pushes the delay past `Duration::MAX`.
    pub fn resolve(&self, t_variable: i64) -> Option<Duration> {
        match self {
            TimerDelay::Fixed(duration) => Some(*duration),
            TimerDelay::RuntimeRelative { offset } => {
                let base = Duration::from_secs(t_variable.max(0) as u64);
                base.checked_add(offset.unwrap_or_default())
            }
        }
    }
}

/// Pressure threshold such as `4.2BAR`. Accepted by validation only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThreshold {
    /// Threshold in bar.
    pub bars: f64,
}

/// A single parsed element of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Token {
    /// Actuator movement.
    Actuation(Actuation),
    /// Delay.
    Timer(TimerDelay),
    /// Pressure threshold.
    Pressure(PressureThreshold),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Actuation(act) => write!(f, "{}{}", act.label, act.direction.symbol()),
            Token::Timer(TimerDelay::Fixed(d)) => write!(f, "{}S", format_seconds(*d)),
            Token::Timer(TimerDelay::RuntimeRelative { offset: None }) => f.write_str("TS"),
            Token::Timer(TimerDelay::RuntimeRelative { offset: Some(d) }) => {
                write!(f, "T+{}S", format_seconds(*d))
            }
            Token::Pressure(p) => write!(f, "{}BAR", p.bars),
        }
    }
}

/// Render a duration as decimal seconds without trailing zeros.
pub(crate) fn format_seconds(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if nanos == 0 {
        return secs.to_string();
    }
    let fraction = format!("{:09}", nanos);
    format!("{}.{}", secs, fraction.trim_end_matches('0'))
}

/// One executable position in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Step {
    /// A bare token.
    Single(Token),
    /// Tokens issued together and awaited jointly.
    Group(Vec<Token>),
}

impl Step {
    /// Tokens making up the step.
    pub fn tokens(&self) -> &[Token] {
        match self {
            Step::Single(token) => std::slice::from_ref(token),
            Step::Group(tokens) => tokens,
        }
    }

    /// Actuations issued by this step.
    pub fn actuations(&self) -> impl Iterator<Item = &Actuation> {
        self.tokens().iter().filter_map(|token| match token {
            Token::Actuation(act) => Some(act),
            _ => None,
        })
    }

    /// Timers started by this step.
    pub fn timers(&self) -> impl Iterator<Item = &TimerDelay> {
        self.tokens().iter().filter_map(|token| match token {
            Token::Timer(timer) => Some(timer),
            _ => None,
        })
    }
}

/// How many times a repeat region runs in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatBound {
    /// `^3`
    Fixed(u32),
    /// `^N` (k = 0) or `^N+2`
    RelativeToRuntimeVar(u32),
    /// No count; loops until stopped.
    Unbounded,
}

impl RepeatBound {
    /// Total passes for the region, or `None` when unbounded.
    ///
    /// At least one pass always runs because the region body is reached
    /// before its bound is consulted.
    pub fn passes(&self, n_variable: i64) -> Option<u64> {
        match self {
            RepeatBound::Fixed(n) => Some(u64::from(*n).max(1)),
            RepeatBound::RelativeToRuntimeVar(k) => {
                let total = n_variable.saturating_add(i64::from(*k));
                Some(total.max(1) as u64)
            }
            RepeatBound::Unbounded => None,
        }
    }

    /// Whether the bound reads `N_VARIABLE` at execution time.
    pub fn uses_runtime_var(&self) -> bool {
        matches!(self, RepeatBound::RelativeToRuntimeVar(_))
    }

    /// Whether the region needs a counter.
    pub fn is_counted(&self) -> bool {
        !matches!(self, RepeatBound::Unbounded)
    }
}

/// A replayed range of steps, by flattened step index (inclusive on both ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRegion {
    /// First step of the region.
    pub start: usize,
    /// Last step of the region. Always greater than `start`.
    pub end: usize,
    /// Repeat bound.
    pub bound: RepeatBound,
    /// 0 for top-level regions, 1 inside an enclosing region.
    pub depth: usize,
}

/// Recursive structure of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Node {
    /// A step.
    Step(Step),
    /// A bracketed repeat region.
    Repeat {
        /// Repeat bound.
        bound: RepeatBound,
        /// Enclosed nodes.
        body: Vec<Node>,
    },
}

/// A parsed, structurally valid sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    source: String,
    nodes: Vec<Node>,
    steps: Vec<Step>,
    regions: Vec<RepeatRegion>,
    wrap: bool,
}

impl Sequence {
    pub(crate) fn from_nodes(source: impl Into<String>, nodes: Vec<Node>, wrap: bool) -> Self {
        let mut steps = Vec::new();
        let mut regions = Vec::new();
        flatten(&nodes, 0, &mut steps, &mut regions);
        // Outer regions first when two start on the same step.
        regions.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        Self {
            source: source.into(),
            nodes,
            steps,
            regions,
            wrap,
        }
    }

    /// Normalised source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Recursive tree (the wrap, when present, is not represented as a node).
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Flattened steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Repeat regions ordered by start, outer before inner.
    pub fn regions(&self) -> &[RepeatRegion] {
        &self.regions
    }

    /// Whether the whole sequence loops back to its start.
    pub fn is_wrapped(&self) -> bool {
        self.wrap
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the sequence has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Indices of regions that start at `step`, outer first.
    pub fn regions_starting_at(&self, step: usize) -> Vec<usize> {
        (0..self.regions.len())
            .filter(|&i| self.regions[i].start == step)
            .collect()
    }

    /// Indices of regions that end at `step`, innermost first.
    pub fn regions_ending_at(&self, step: usize) -> Vec<usize> {
        let mut ending: Vec<usize> = (0..self.regions.len())
            .filter(|&i| self.regions[i].end == step)
            .collect();
        ending.sort_by(|&a, &b| self.regions[b].start.cmp(&self.regions[a].start));
        ending
    }

    /// All tokens in step order.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.steps.iter().flat_map(|step| step.tokens().iter())
    }

    /// Distinct actuator labels in order of first appearance.
    pub fn actuator_labels(&self) -> Vec<char> {
        let mut labels = Vec::new();
        for step in &self.steps {
            for act in step.actuations() {
                if !labels.contains(&act.label) {
                    labels.push(act.label);
                }
            }
        }
        labels
    }

    /// The first step that moves any actuator.
    pub fn first_actuation_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .find(|step| step.actuations().next().is_some())
    }

    /// Label of the first actuator retracted by the opening step, if any.
    /// Actuators rest retracted, so such a sequence cannot start.
    pub fn opening_retraction(&self) -> Option<char> {
        self.first_actuation_step()?
            .actuations()
            .find(|act| act.direction == Direction::Retract)
            .map(|act| act.label)
    }

    /// Whether any timer or repeat bound reads a runtime variable.
    pub fn uses_runtime_vars(&self) -> bool {
        self.tokens().any(|token| match token {
            Token::Timer(timer) => timer.uses_runtime_var(),
            _ => false,
        }) || self.regions.iter().any(|region| region.bound.uses_runtime_var())
    }

    /// First pressure token, if any.
    pub fn first_pressure(&self) -> Option<&Token> {
        self.tokens()
            .find(|token| matches!(token, Token::Pressure(_)))
    }
}

fn flatten(nodes: &[Node], depth: usize, steps: &mut Vec<Step>, regions: &mut Vec<RepeatRegion>) {
    for node in nodes {
        match node {
            Node::Step(step) => steps.push(step.clone()),
            Node::Repeat { bound, body } => {
                let start = steps.len();
                flatten(body, depth + 1, steps, regions);
                if steps.len() > start {
                    regions.push(RepeatRegion {
                        start,
                        end: steps.len() - 1,
                        bound: *bound,
                        depth,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(label: char, direction: Direction) -> Node {
        Node::Step(Step::Single(Token::Actuation(Actuation { label, direction })))
    }

    #[test]
    fn flattening_records_nested_regions_outer_first() {
        let inner = Node::Repeat {
            bound: RepeatBound::Fixed(2),
            body: vec![act('B', Direction::Extend), act('B', Direction::Retract)],
        };
        let outer = Node::Repeat {
            bound: RepeatBound::Unbounded,
            body: vec![act('A', Direction::Extend), inner, act('A', Direction::Retract)],
        };
        let seq = Sequence::from_nodes("", vec![outer], false);

        assert_eq!(seq.len(), 4);
        assert_eq!(seq.regions().len(), 2);
        assert_eq!(seq.regions()[0].bound, RepeatBound::Unbounded);
        assert_eq!((seq.regions()[0].start, seq.regions()[0].end), (0, 3));
        assert_eq!((seq.regions()[1].start, seq.regions()[1].end), (1, 2));
        assert_eq!(seq.regions()[1].depth, 1);
    }

    #[test]
    fn regions_ending_on_same_step_are_innermost_first() {
        let inner = Node::Repeat {
            bound: RepeatBound::Fixed(2),
            body: vec![act('B', Direction::Extend), act('B', Direction::Retract)],
        };
        let outer = Node::Repeat {
            bound: RepeatBound::Fixed(3),
            body: vec![act('A', Direction::Extend), inner],
        };
        let seq = Sequence::from_nodes("", vec![outer], false);
        let ending = seq.regions_ending_at(2);
        assert_eq!(ending.len(), 2);
        assert_eq!(seq.regions()[ending[0]].start, 1);
        assert_eq!(seq.regions()[ending[1]].start, 0);
    }

    #[test]
    fn relative_bound_counts_at_least_one_pass() {
        assert_eq!(RepeatBound::RelativeToRuntimeVar(2).passes(3), Some(5));
        assert_eq!(RepeatBound::RelativeToRuntimeVar(0).passes(0), Some(1));
        assert_eq!(RepeatBound::Fixed(4).passes(9), Some(4));
        assert_eq!(RepeatBound::Unbounded.passes(1), None);
    }

    #[test]
    fn timer_tokens_display_canonically() {
        let fixed = Token::Timer(TimerDelay::Fixed(Duration::from_millis(1500)));
        let relative = Token::Timer(TimerDelay::RuntimeRelative {
            offset: Some(Duration::from_secs(2)),
        });
        assert_eq!(fixed.to_string(), "1.5S");
        assert_eq!(relative.to_string(), "T+2S");
        assert_eq!(
            TimerDelay::RuntimeRelative { offset: Some(Duration::from_millis(500)) }.resolve(2),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn oversized_runtime_offset_does_not_resolve() {
        let huge = TimerDelay::RuntimeRelative {
            offset: Some(Duration::from_secs(u64::MAX)),
        };
        assert_eq!(huge.resolve(3), None);
        assert_eq!(huge.resolve(0), Some(Duration::from_secs(u64::MAX)));
    }
}
