use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::ast::{Sequence, Token};

/// Identity of a component a sequence drives or reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum ComponentId {
    /// Cylinder with extend/retract coils and end-position sensors.
    Actuator(char),
    /// On-delay timer, numbered per timer token.
    Timer(u32),
    /// Repeat counter, numbered per counted region.
    Counter(u32),
    /// Pressure switch, numbered per pressure token.
    Pressure(u32),
}

impl ComponentId {
    /// Kind of the component.
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentId::Actuator(_) => ComponentKind::Actuator,
            ComponentId::Timer(_) => ComponentKind::Timer,
            ComponentId::Counter(_) => ComponentKind::Counter,
            ComponentId::Pressure(_) => ComponentKind::Pressure,
        }
    }

    /// Label used in tag names and project configuration keys.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::Actuator(label) => write!(f, "{}", label),
            ComponentId::Timer(index) => write!(f, "Timer_{}", index),
            ComponentId::Counter(index) => write!(f, "Counter_{}", index),
            ComponentId::Pressure(index) => write!(f, "Pressure_{}", index),
        }
    }
}

/// Component category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Cylinder.
    Actuator,
    /// Timer.
    Timer,
    /// Counter.
    Counter,
    /// Pressure switch.
    Pressure,
}

/// A component together with where it was first needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Component identity.
    pub id: ComponentId,
    /// Component category.
    pub kind: ComponentKind,
    /// Step index of first use.
    pub first_step: usize,
}

/// Stable numbering of timers, counters and pressure switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Numbering {
    timers: HashMap<(usize, usize), u32>,
    pressures: HashMap<(usize, usize), u32>,
    counters: HashMap<usize, u32>,
}

impl Numbering {
    /// Number every timer and pressure token by position and every counted
    /// region by its order in [`Sequence::regions`].
    pub fn of(sequence: &Sequence) -> Self {
        let mut numbering = Numbering::default();
        let mut next_timer = 0;
        let mut next_pressure = 0;
        for (step_index, step) in sequence.steps().iter().enumerate() {
            for (token_index, token) in step.tokens().iter().enumerate() {
                match token {
                    Token::Timer(_) => {
                        next_timer += 1;
                        numbering.timers.insert((step_index, token_index), next_timer);
                    }
                    Token::Pressure(_) => {
                        next_pressure += 1;
                        numbering
                            .pressures
                            .insert((step_index, token_index), next_pressure);
                    }
                    Token::Actuation(_) => {}
                }
            }
        }
        let mut next_counter = 0;
        for (region_index, region) in sequence.regions().iter().enumerate() {
            if region.bound.is_counted() {
                next_counter += 1;
                numbering.counters.insert(region_index, next_counter);
            }
        }
        numbering
    }

    /// Timer number of the token at `(step, token)`.
    pub fn timer(&self, step: usize, token: usize) -> Option<u32> {
        self.timers.get(&(step, token)).copied()
    }

    /// Pressure switch number of the token at `(step, token)`.
    pub fn pressure(&self, step: usize, token: usize) -> Option<u32> {
        self.pressures.get(&(step, token)).copied()
    }

    /// Counter number of the region at `region` in [`Sequence::regions`].
    pub fn counter(&self, region: usize) -> Option<u32> {
        self.counters.get(&region).copied()
    }
}

/// Components a sequence needs, in discovery order.
pub fn inventory(sequence: &Sequence) -> Vec<Component> {
    let numbering = Numbering::of(sequence);
    let mut components: Vec<Component> = Vec::new();
    let mut push = |id: ComponentId, first_step: usize| {
        if !components.iter().any(|c| c.id == id) {
            components.push(Component {
                id,
                kind: id.kind(),
                first_step,
            });
        }
    };

    for (step_index, step) in sequence.steps().iter().enumerate() {
        for region_index in sequence.regions_starting_at(step_index) {
            if let Some(counter) = numbering.counter(region_index) {
                push(ComponentId::Counter(counter), step_index);
            }
        }
        for (token_index, token) in step.tokens().iter().enumerate() {
            let id = match token {
                Token::Actuation(act) => Some(ComponentId::Actuator(act.label)),
                Token::Timer(_) => numbering.timer(step_index, token_index).map(ComponentId::Timer),
                Token::Pressure(_) => numbering
                    .pressure(step_index, token_index)
                    .map(ComponentId::Pressure),
            };
            if let Some(id) = id {
                push(id, step_index);
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::parse_sequence;

    #[test]
    fn inventory_lists_components_in_discovery_order() {
        let seq = parse_sequence("A+,2S,[(B+,TS),B-]^2,4.2BAR,A-").expect("parse");
        let ids: Vec<ComponentId> = inventory(&seq).into_iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec![
                ComponentId::Actuator('A'),
                ComponentId::Timer(1),
                ComponentId::Counter(1),
                ComponentId::Actuator('B'),
                ComponentId::Timer(2),
                ComponentId::Pressure(1),
            ]
        );
    }

    #[test]
    fn unbounded_regions_get_no_counter() {
        let seq = parse_sequence("[A+,A-],[B+,B-]^3").expect("parse");
        let numbering = Numbering::of(&seq);
        assert_eq!(numbering.counter(0), None);
        assert_eq!(numbering.counter(1), Some(1));
    }

    #[test]
    fn labels_follow_tag_naming() {
        assert_eq!(ComponentId::Actuator('C').label(), "C");
        assert_eq!(ComponentId::Timer(2).label(), "Timer_2");
        assert_eq!(ComponentId::Counter(1).label(), "Counter_1");
    }
}
