use std::collections::HashMap;
use tracing::debug;

use super::ir::{BoundExpr, Case, CompiledProgram, Condition, Instruction, NextCase, Preset};
use super::tag_table::TagTable;
use super::{CompileError, CompileResult};
use crate::sequence::{
    Direction, Numbering, RepeatBound, Sequence, Step, TimerDelay, Token, inventory,
};
use crate::tags::{
    ActuatorTags, N_VARIABLE, ProjectConfig, T_VARIABLE, TagKind, TagResolver, TimerTags,
};

/// Compile a parsed sequence into a case-numbered program.
pub fn compile(sequence: &Sequence, config: Option<&ProjectConfig>) -> CompileResult<CompiledProgram> {
    if let Some(token) = sequence.first_pressure() {
        return Err(CompileError::UnsupportedToken {
            token: token.to_string(),
        });
    }
    check_start(sequence)?;

    if let Some(config) = config {
        let missing = config.missing(&inventory(sequence));
        if !missing.is_empty() {
            return Err(CompileError::ConfigurationIncomplete {
                missing: missing.iter().map(|id| id.label()).collect(),
            });
        }
    }

    let program = Builder::new(sequence, TagResolver::new(config)).build()?;
    debug!(
        sequence = %sequence.source(),
        cases = program.cases.len(),
        tags = program.tag_table.len(),
        "compiled sequence"
    );
    Ok(program)
}

/// Actuators start retracted, so the first actuation may not be a retraction.
fn check_start(sequence: &Sequence) -> CompileResult<()> {
    match sequence.opening_retraction() {
        Some(label) => Err(CompileError::UnsupportedStart { label }),
        None => Ok(()),
    }
}

/// A wrapped program re-enters case 10 from setup, so the first step also
/// waits for the final step's completion signals.
fn wait_for_wrap(cases: &mut [Case]) {
    let Some(last) = cases.last().and_then(|case| case.guard.clone()) else {
        return;
    };
    let Some(first) = cases.first_mut() else {
        return;
    };
    let guard = first.guard.get_or_insert_with(Condition::default);
    for term in last.terms {
        guard.and(term);
    }
}

fn case_number(step: usize) -> u32 {
    (step as u32 + 1) * 10
}

struct Builder<'a> {
    sequence: &'a Sequence,
    resolver: TagResolver<'a>,
    numbering: Numbering,
    table: TagTable,
    setup: Vec<Instruction>,
    components: Vec<Instruction>,
    actuators: HashMap<char, ActuatorTags>,
    counters: HashMap<usize, String>,
}

impl<'a> Builder<'a> {
    fn new(sequence: &'a Sequence, resolver: TagResolver<'a>) -> Self {
        Self {
            sequence,
            resolver,
            numbering: Numbering::of(sequence),
            table: TagTable::new(),
            setup: Vec::new(),
            components: Vec::new(),
            actuators: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    fn build(mut self) -> CompileResult<CompiledProgram> {
        let sequence = self.sequence;
        let mut cases = Vec::with_capacity(sequence.len() + 1);
        for (index, step) in sequence.steps().iter().enumerate() {
            for region in sequence.regions_starting_at(index) {
                self.enter_region(region)?;
            }
            let mut case = self.step_case(index, step)?;
            case.next = self.next_case(index);
            cases.push(case);
        }

        if sequence.is_wrapped() {
            wait_for_wrap(&mut cases);
        }
        let mut setup_case = Case::new(0);
        setup_case.body = self.setup.clone();
        setup_case.next = NextCase::Jump(10);
        cases.insert(0, setup_case);

        if sequence.uses_runtime_vars() {
            self.table.push(T_VARIABLE, TagKind::Int);
            self.table.push(N_VARIABLE, TagKind::Int);
        }

        Ok(CompiledProgram {
            setup: self.setup,
            cases,
            components: self.components,
            tag_table: self.table.into_entries(),
            configured: self.resolver.is_configured(),
        })
    }

    fn enter_region(&mut self, region: usize) -> CompileResult<()> {
        let Some(index) = self.numbering.counter(region) else {
            return Ok(());
        };
        let tag = self.resolver.counter(index)?;
        self.table.push(&tag, TagKind::Int);
        self.setup.push(Instruction::SetInt {
            tag: tag.clone(),
            value: 0,
        });
        self.counters.insert(region, tag);
        Ok(())
    }

    fn step_case(&mut self, index: usize, step: &Step) -> CompileResult<Case> {
        let mut case = Case::new(case_number(index));
        let mut done = Condition::default();
        for (position, token) in step.tokens().iter().enumerate() {
            match token {
                Token::Actuation(act) => {
                    let tags = self.actuator(act.label)?;
                    for (tag, value) in tags.command(act.direction) {
                        case.body.push(Instruction::SetBool { tag, value });
                    }
                    done.and(tags.sensor(act.direction));
                }
                Token::Timer(delay) => {
                    let Some(number) = self.numbering.timer(index, position) else {
                        continue;
                    };
                    let tags = self.timer(number, delay)?;
                    case.body.push(Instruction::SetBool {
                        tag: tags.power.clone(),
                        value: true,
                    });
                    case.on_exit.push(Instruction::SetBool {
                        tag: tags.power.clone(),
                        value: false,
                    });
                    done.and(tags.done);
                }
                Token::Pressure(_) => {
                    return Err(CompileError::UnsupportedToken {
                        token: token.to_string(),
                    });
                }
            }
        }
        if !done.is_empty() {
            case.guard = Some(done);
        }
        Ok(case)
    }

    /// Tags of an actuator; the first sighting allocates them and drives the
    /// actuator to rest in setup.
    fn actuator(&mut self, label: char) -> CompileResult<ActuatorTags> {
        if let Some(tags) = self.actuators.get(&label) {
            return Ok(tags.clone());
        }
        let tags = self.resolver.actuator(label)?;
        self.table.extend(&tags.bindings(label));
        for (tag, value) in tags.command(Direction::Retract) {
            self.setup.push(Instruction::SetBool { tag, value });
        }
        self.actuators.insert(label, tags.clone());
        Ok(tags)
    }

    fn timer(&mut self, number: u32, delay: &TimerDelay) -> CompileResult<TimerTags> {
        let tags = self.resolver.timer(number)?;
        self.table.extend(&tags.bindings());
        self.setup.push(Instruction::SetBool {
            tag: tags.power.clone(),
            value: false,
        });
        let preset = match delay {
            TimerDelay::Fixed(duration) => Preset::Fixed(*duration),
            TimerDelay::RuntimeRelative { offset } => Preset::Runtime {
                variable: T_VARIABLE.to_string(),
                offset: *offset,
            },
        };
        self.components.push(Instruction::Timer {
            instance: format!("{}_Instance", tags.label),
            power: tags.power.clone(),
            done: tags.done.clone(),
            elapsed: tags.elapsed.clone(),
            preset,
        });
        Ok(tags)
    }

    /// Transition after step `index`: regions ending here are evaluated
    /// innermost first, each falling through to the next enclosing one.
    fn next_case(&self, index: usize) -> NextCase {
        let last = index + 1 == self.sequence.len();
        let mut next = if last && self.sequence.is_wrapped() {
            NextCase::Jump(0)
        } else {
            NextCase::Jump(case_number(index + 1))
        };

        let regions = self.sequence.regions();
        for region_index in self.sequence.regions_ending_at(index).into_iter().rev() {
            let region = regions[region_index];
            let start = case_number(region.start);
            let bound = match region.bound {
                RepeatBound::Unbounded => {
                    next = NextCase::Loop { start };
                    continue;
                }
                RepeatBound::Fixed(n) => BoundExpr::Literal(n),
                RepeatBound::RelativeToRuntimeVar(k) => BoundExpr::Runtime {
                    variable: N_VARIABLE.to_string(),
                    offset: k,
                },
            };
            let Some(counter) = self.counters.get(&region_index) else {
                continue;
            };
            next = NextCase::Repeat {
                counter: counter.clone(),
                bound,
                start,
                otherwise: Box::new(next),
            };
        }
        next
    }
}
