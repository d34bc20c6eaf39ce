use tracing::debug;

use super::ast::{Node, RepeatBound, Sequence, Step, Token};
use super::grammar::{parse_bound, parse_token};
use super::lexer::{Bracket, Fragment, lex, normalize};
use super::{Diagnostics, ParseResult};

const EMPTY_SEQUENCE: &str = "Sequence is empty";
const EMPTY_STEP: &str = "Missing action, timer or pressure value between commas";
const ROUND_COUNT: &str = "Number of opening and closing round brackets does not match";
const SQUARE_COUNT: &str = "Number of opening and closing square brackets does not match";
const ROUND_ORDER: &str = "Round bracket group must open before it closes and hold at least two elements";
const SQUARE_ORDER: &str = "Repeat region must open before it closes and hold at least two elements";
const ROUND_OVERLAP: &str = "Round bracket groups must not overlap or nest";
const SQUARE_OVERLAP: &str = "Repeat regions must not overlap or nest more than one level";
const CROSSING: &str = "Round and square brackets cross each other";
const REGION_IN_GROUP: &str = "Repeat region cannot start inside a round bracket group";
const SHORT_REGION: &str = "Repeat region must span at least two steps";

/// Parse a raw sequence into its shared structural form.
///
/// All grammar and structural problems are collected before failing, so the
/// returned [`Diagnostics`] is the complete validation result.
pub fn parse_sequence(source: &str) -> ParseResult<Sequence> {
    let normalized = normalize(source);
    let mut diagnostics = Diagnostics::default();
    if normalized.is_empty() {
        diagnostics.push(EMPTY_SEQUENCE);
        return Err(diagnostics);
    }

    let fragments = lex(&normalized);
    check_tokens(&fragments, &mut diagnostics);
    check_brackets(&fragments, &mut diagnostics);
    if !diagnostics.is_empty() {
        debug!(sequence = %normalized, problems = diagnostics.len(), "sequence rejected");
        return Err(diagnostics);
    }

    let (nodes, wrap) = TreeBuilder::new(&fragments).build(&mut diagnostics);
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }
    Ok(Sequence::from_nodes(normalized, nodes, wrap))
}

fn check_tokens(fragments: &[Fragment], diagnostics: &mut Diagnostics) {
    for fragment in fragments {
        if fragment.core.is_empty() {
            diagnostics.push_structural(EMPTY_STEP, [fragment]);
        } else if parse_token(&fragment.core).is_none() {
            diagnostics.push(fragment.text.clone());
        }

        let bad_spec = fragment
            .closes
            .iter()
            .any(|close| close.spec.is_some() && parse_bound(close.spec.as_deref()).is_none());
        if bad_spec || !fragment.trailing.is_empty() {
            diagnostics.push(fragment.text.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Open(Bracket, usize),
    Close(Bracket, usize),
}

fn events(fragments: &[Fragment]) -> Vec<Event> {
    let mut events = Vec::new();
    for fragment in fragments {
        events.extend(fragment.opens.iter().map(|kind| Event::Open(*kind, fragment.index)));
        events.extend(
            fragment
                .closes
                .iter()
                .map(|close| Event::Close(close.kind, fragment.index)),
        );
    }
    events
}

fn check_brackets(fragments: &[Fragment], diagnostics: &mut Diagnostics) {
    let events = events(fragments);
    let balanced_round = check_kind(fragments, &events, Bracket::Paren, diagnostics);
    let balanced_square = check_kind(fragments, &events, Bracket::Square, diagnostics);
    if balanced_round && balanced_square {
        check_crossing(fragments, &events, diagnostics);
    }
}

/// Count, order and overlap checks for one bracket kind. Returns whether the
/// counts balance.
fn check_kind(
    fragments: &[Fragment],
    events: &[Event],
    kind: Bracket,
    diagnostics: &mut Diagnostics,
) -> bool {
    let (count_msg, order_msg, overlap_msg) = match kind {
        Bracket::Paren => (ROUND_COUNT, ROUND_ORDER, ROUND_OVERLAP),
        Bracket::Square => (SQUARE_COUNT, SQUARE_ORDER, SQUARE_OVERLAP),
    };

    let mut kind_events: Vec<Event> = events
        .iter()
        .copied()
        .filter(|event| matches!(event, Event::Open(k, _) | Event::Close(k, _) if *k == kind))
        .collect();

    let opens = kind_events.iter().filter(|e| matches!(e, Event::Open(..))).count();
    let closes = kind_events.len() - opens;
    if opens != closes {
        let unmatched = unmatched_fragments(&kind_events);
        diagnostics.push_structural(count_msg, unmatched.iter().map(|&i| &fragments[i]));
        return false;
    }

    if kind == Bracket::Square && encloses_nested_region(fragments, &kind_events) {
        kind_events.remove(0);
        kind_events.pop();
    }

    let open_at: Vec<usize> = kind_events
        .iter()
        .filter_map(|e| match e {
            Event::Open(_, i) => Some(*i),
            _ => None,
        })
        .collect();
    let close_at: Vec<usize> = kind_events
        .iter()
        .filter_map(|e| match e {
            Event::Close(_, i) => Some(*i),
            _ => None,
        })
        .collect();

    for (pair, (&open, &close)) in open_at.iter().zip(close_at.iter()).enumerate() {
        if open >= close {
            diagnostics.push_structural(order_msg, [&fragments[open], &fragments[close]]);
        }
        if let Some(&next_open) = open_at.get(pair + 1) {
            if close >= next_open {
                diagnostics.push_structural(overlap_msg, [&fragments[next_open], &fragments[close]]);
            }
        }
    }
    true
}

/// Fragments holding brackets a depth scan cannot pair.
fn unmatched_fragments(events: &[Event]) -> Vec<usize> {
    let mut open_stack = Vec::new();
    let mut unmatched = Vec::new();
    for event in events {
        match *event {
            Event::Open(_, i) => open_stack.push(i),
            Event::Close(_, i) => {
                if open_stack.pop().is_none() {
                    unmatched.push(i);
                }
            }
        }
    }
    unmatched.extend(open_stack);
    unmatched.sort_unstable();
    unmatched.dedup();
    unmatched
}

/// The first fragment opens `[`, the last closes `]` with no count, the two
/// pair with each other, and the next square bracket inside them is another
/// opening one.
fn encloses_nested_region(fragments: &[Fragment], square_events: &[Event]) -> bool {
    let (Some(first), Some(last)) = (fragments.first(), fragments.last()) else {
        return false;
    };
    if square_events.len() < 4 || fragments.len() < 2 {
        return false;
    }
    let opens_outer = first.opens.first() == Some(&Bracket::Square);
    let closes_outer = last
        .closes
        .last()
        .is_some_and(|close| close.kind == Bracket::Square && close.spec.is_none());
    let first_event_outer = square_events.first() == Some(&Event::Open(Bracket::Square, 0));
    let last_event_outer =
        square_events.last() == Some(&Event::Close(Bracket::Square, last.index));
    opens_outer
        && closes_outer
        && first_event_outer
        && last_event_outer
        && matches!(square_events.get(1), Some(Event::Open(..)))
        && outer_pair_spans(square_events)
}

/// Whether the first event's bracket stays open until the last event.
fn outer_pair_spans(events: &[Event]) -> bool {
    let mut depth = 0usize;
    for (position, event) in events.iter().enumerate() {
        match event {
            Event::Open(..) => depth += 1,
            Event::Close(..) => depth = depth.saturating_sub(1),
        }
        if depth == 0 && position + 1 < events.len() {
            return false;
        }
    }
    true
}

fn check_crossing(fragments: &[Fragment], events: &[Event], diagnostics: &mut Diagnostics) {
    let mut stack: Vec<(Bracket, usize)> = Vec::new();
    for event in events {
        match *event {
            Event::Open(kind, i) => {
                if kind == Bracket::Square && stack.iter().any(|(k, _)| *k == Bracket::Paren) {
                    diagnostics.push_structural(REGION_IN_GROUP, [&fragments[i]]);
                }
                stack.push((kind, i));
            }
            Event::Close(kind, i) => match stack.pop() {
                Some((open_kind, open)) if open_kind != kind => {
                    diagnostics.push_structural(CROSSING, [&fragments[open], &fragments[i]]);
                }
                _ => {}
            },
        }
    }
}

enum FrameKind {
    Root,
    Group,
    Region,
}

struct Frame {
    kind: FrameKind,
    nodes: Vec<Node>,
    tokens: Vec<Token>,
    opened_at: usize,
}

impl Frame {
    fn new(kind: FrameKind, opened_at: usize) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            tokens: Vec::new(),
            opened_at,
        }
    }
}

struct TreeBuilder<'a> {
    fragments: &'a [Fragment],
    stack: Vec<Frame>,
}

impl<'a> TreeBuilder<'a> {
    fn new(fragments: &'a [Fragment]) -> Self {
        Self {
            fragments,
            stack: vec![Frame::new(FrameKind::Root, 0)],
        }
    }

    fn build(mut self, diagnostics: &mut Diagnostics) -> (Vec<Node>, bool) {
        for fragment in self.fragments {
            for open in &fragment.opens {
                let kind = match open {
                    Bracket::Paren => FrameKind::Group,
                    Bracket::Square => FrameKind::Region,
                };
                self.stack.push(Frame::new(kind, fragment.index));
            }

            if let Some(token) = parse_token(&fragment.core) {
                if let Some(top) = self.stack.last_mut() {
                    match top.kind {
                        FrameKind::Group => top.tokens.push(token),
                        FrameKind::Root | FrameKind::Region => {
                            top.nodes.push(Node::Step(Step::Single(token)))
                        }
                    }
                }
            }

            for close in &fragment.closes {
                let Some(frame) = self.stack.pop() else {
                    diagnostics.push_structural(CROSSING, [fragment]);
                    continue;
                };
                let node = match (frame.kind, close.kind) {
                    (FrameKind::Group, Bracket::Paren) => Node::Step(Step::Group(frame.tokens)),
                    (FrameKind::Region, Bracket::Square) => {
                        let bound = parse_bound(close.spec.as_deref()).unwrap_or(RepeatBound::Unbounded);
                        if count_steps(&frame.nodes) < 2 {
                            diagnostics.push_structural(
                                SHORT_REGION,
                                [&self.fragments[frame.opened_at], fragment],
                            );
                        }
                        Node::Repeat {
                            bound,
                            body: frame.nodes,
                        }
                    }
                    _ => {
                        diagnostics.push_structural(CROSSING, [fragment]);
                        continue;
                    }
                };
                match self.stack.last_mut() {
                    Some(parent) => parent.nodes.push(node),
                    None => diagnostics.push_structural(CROSSING, [fragment]),
                }
            }
        }

        let root = match self.stack.pop() {
            Some(frame) if self.stack.is_empty() => frame.nodes,
            _ => {
                diagnostics.push(CROSSING);
                return (Vec::new(), false);
            }
        };
        unwrap_whole_sequence(root)
    }
}

fn count_steps(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            Node::Step(_) => 1,
            Node::Repeat { body, .. } => count_steps(body),
        })
        .sum()
}

/// A single unbounded region spanning everything with no inner region is the
/// whole-sequence wrap. With an inner region it stays an ordinary region.
fn unwrap_whole_sequence(mut root: Vec<Node>) -> (Vec<Node>, bool) {
    let is_wrap = match root.as_slice() {
        [Node::Repeat { bound: RepeatBound::Unbounded, body }] => {
            !body.iter().any(|node| matches!(node, Node::Repeat { .. }))
        }
        _ => false,
    };
    if !is_wrap {
        return (root, false);
    }
    match root.pop() {
        Some(Node::Repeat { body, .. }) => (body, true),
        Some(other) => (vec![other], false),
        None => (Vec::new(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::ast::{Direction, RepeatBound};

    #[test]
    fn parses_groups_and_regions() {
        let seq = parse_sequence("A+,B+,(A-,B-),[C+,C-]^3").expect("parse");
        assert_eq!(seq.len(), 5);
        assert!(matches!(&seq.steps()[2], Step::Group(tokens) if tokens.len() == 2));
        assert_eq!(seq.regions().len(), 1);
        let region = seq.regions()[0];
        assert_eq!((region.start, region.end), (3, 4));
        assert_eq!(region.bound, RepeatBound::Fixed(3));
        assert!(!seq.is_wrapped());
    }

    #[test]
    fn whole_sequence_wrap_without_inner_region() {
        let seq = parse_sequence("[A+,B+,A-,B-]").expect("parse");
        assert!(seq.is_wrapped());
        assert!(seq.regions().is_empty());
        assert_eq!(seq.len(), 4);
    }

    #[test]
    fn outer_brackets_with_inner_region_are_plain_nesting() {
        let seq = parse_sequence("[A+,B+,C+,D+,[(A-,B-),A+,(A-,B+)]^3,D-,B-]").expect("parse");
        assert!(!seq.is_wrapped());
        assert_eq!(seq.regions().len(), 2);
        assert_eq!(seq.regions()[0].bound, RepeatBound::Unbounded);
        assert_eq!((seq.regions()[0].start, seq.regions()[0].end), (0, 8));
        assert_eq!((seq.regions()[1].start, seq.regions()[1].end), (4, 6));
    }

    #[test]
    fn counted_whole_span_is_a_region_not_a_wrap() {
        let seq = parse_sequence("[A+,B+,A-,B-]^2").expect("parse");
        assert!(!seq.is_wrapped());
        assert_eq!(seq.regions()[0].bound, RepeatBound::Fixed(2));
    }

    #[test]
    fn separate_regions_at_both_ends_are_not_a_wrap() {
        let seq = parse_sequence("[A+,B-,3S]^2,2S,[A-,B+,4S]").expect("parse");
        assert!(!seq.is_wrapped());
        assert_eq!(seq.regions().len(), 2);
        assert_eq!(seq.regions()[1].bound, RepeatBound::Unbounded);
    }

    #[test]
    fn rejects_deeper_nesting() {
        let err = parse_sequence("A+,[B+,[C+,C-]^2,B-]^3,A-").unwrap_err();
        assert!(err.messages().iter().any(|m| m == SQUARE_OVERLAP));
    }

    #[test]
    fn closed_leading_region_is_not_an_outer_wrap() {
        let err = parse_sequence("[A+,[B+,B-]^2],C+,[D+,D-]").unwrap_err();
        assert!(err.messages().iter().any(|m| m == SQUARE_OVERLAP));
        assert!(!err.messages().iter().any(|m| m == SQUARE_ORDER));
    }

    #[test]
    fn rejects_single_step_region() {
        let err = parse_sequence("A+,[(B+,C+)]^2,A-").unwrap_err();
        assert!(err.messages().iter().any(|m| m == SHORT_REGION));
    }

    #[test]
    fn rejects_region_inside_group() {
        let err = parse_sequence("A+,([B+,C+]^2,D+),A-").unwrap_err();
        assert!(err.messages().iter().any(|m| m == REGION_IN_GROUP));
    }

    #[test]
    fn rejects_crossing_brackets() {
        let err = parse_sequence("A+,[B+,(C+,B-]^2,C-)").unwrap_err();
        assert!(err.messages().iter().any(|m| m == CROSSING));
    }

    #[test]
    fn actuation_direction_is_recorded() {
        let seq = parse_sequence("a+,a-").expect("parse");
        let directions: Vec<Direction> = seq
            .steps()
            .iter()
            .flat_map(|s| s.actuations().map(|a| a.direction))
            .collect();
        assert_eq!(directions, vec![Direction::Extend, Direction::Retract]);
    }
}
