use std::time::Duration;

use super::ir::{BoundExpr, Case, CompiledProgram, Condition, Instruction, NextCase, Preset};
use super::tag_table::to_xml;

const INDENT: &str = "    ";
const TAG_TABLE_NAME: &str = "Sequence";

struct Emitter {
    lines: Vec<String>,
    depth: usize,
}

impl Emitter {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            depth: 0,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.lines
            .push(format!("{}{}", INDENT.repeat(self.depth), text.as_ref()));
    }

    fn indent(&mut self) {
        self.depth += 1;
    }

    fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn instructions(&mut self, instructions: &[Instruction]) {
        for instruction in instructions {
            self.line(instruction.render());
        }
    }

    fn next_case(&mut self, next: &NextCase) {
        match next {
            NextCase::Jump(target) => self.line(format!("#NEXT := {};", target)),
            NextCase::Loop { start } => self.line(format!("#NEXT := {};", start)),
            NextCase::Repeat {
                counter,
                bound,
                start,
                otherwise,
            } => {
                self.line(format!("{} := {} + 1;", counter, counter));
                self.line(format!("IF {} < {} THEN", counter, bound.render()));
                self.indent();
                self.line(format!("#NEXT := {};", start));
                self.dedent();
                self.line("ELSE");
                self.indent();
                self.line(format!("{} := 0;", counter));
                self.next_case(otherwise);
                self.dedent();
                self.line("END_IF;");
            }
        }
    }

    fn case(&mut self, case: &Case) {
        self.line(format!("{}:", case.number));
        self.indent();
        self.instructions(&case.body);
        match &case.guard {
            Some(guard) => {
                self.line(format!("IF {} THEN", guard.render()));
                self.indent();
                self.instructions(&case.on_exit);
                self.next_case(&case.next);
                self.dedent();
                self.line("END_IF;");
            }
            None => {
                self.instructions(&case.on_exit);
                self.next_case(&case.next);
            }
        }
        self.dedent();
    }
}

impl Condition {
    /// `A AND B AND C`
    pub fn render(&self) -> String {
        self.terms.join(" AND ")
    }
}

impl BoundExpr {
    /// Literal count or `N_VARIABLE + k`.
    pub fn render(&self) -> String {
        match self {
            BoundExpr::Literal(n) => n.to_string(),
            BoundExpr::Runtime { variable, offset: 0 } => variable.clone(),
            BoundExpr::Runtime { variable, offset } => format!("{} + {}", variable, offset),
        }
    }
}

impl Preset {
    /// IEC time literal, or a runtime conversion when the preset reads a variable.
    pub fn render(&self) -> String {
        match self {
            Preset::Fixed(duration) => format!("T#{}MS", duration.as_millis()),
            Preset::Runtime { variable, offset } => {
                let offset_ms = offset.map(|d: Duration| d.as_millis()).unwrap_or(0);
                if offset_ms == 0 {
                    format!("DINT_TO_TIME({} * 1000)", variable)
                } else {
                    format!("DINT_TO_TIME({} * 1000 + {})", variable, offset_ms)
                }
            }
        }
    }
}

impl Instruction {
    /// One statement of structured text.
    pub fn render(&self) -> String {
        match self {
            Instruction::SetBool { tag, value } => {
                format!("{} := {};", tag, if *value { "TRUE" } else { "FALSE" })
            }
            Instruction::SetInt { tag, value } => format!("{} := {};", tag, value),
            Instruction::Timer {
                instance,
                power,
                done,
                elapsed,
                preset,
            } => format!(
                "{}(IN := {}, PT := {}, Q => {}, ET => {});",
                instance,
                power,
                preset.render(),
                done,
                elapsed
            ),
        }
    }
}

impl CompiledProgram {
    /// Rendered program lines: the case block followed by the component block.
    pub fn body_lines(&self) -> Vec<String> {
        let mut emitter = Emitter::new();
        emitter.line("CASE #NEXT OF");
        emitter.indent();
        for case in &self.cases {
            emitter.case(case);
        }
        emitter.dedent();
        emitter.line("END_CASE;");
        if !self.components.is_empty() {
            emitter.line("");
            emitter.instructions(&self.components);
        }
        emitter.lines
    }

    /// Rendered program text.
    pub fn code(&self) -> String {
        let mut code = self.body_lines().join("\n");
        code.push('\n');
        code
    }

    /// Tag table as XML.
    pub fn tag_table_xml(&self) -> String {
        to_xml(TAG_TABLE_NAME, &self.tag_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;

    #[test]
    fn renders_case_block() {
        let program = compile_source("A+,A-", None).expect("compile");
        let expected = [
            "CASE #NEXT OF",
            "    0:",
            "        Cylinder_A_Extend := FALSE;",
            "        Cylinder_A_Retract := TRUE;",
            "        #NEXT := 10;",
            "    10:",
            "        Cylinder_A_Retract := FALSE;",
            "        Cylinder_A_Extend := TRUE;",
            "        IF Sensor_A_Extended THEN",
            "            #NEXT := 20;",
            "        END_IF;",
            "    20:",
            "        Cylinder_A_Extend := FALSE;",
            "        Cylinder_A_Retract := TRUE;",
            "        IF Sensor_A_Retracted THEN",
            "            #NEXT := 30;",
            "        END_IF;",
            "END_CASE;",
        ];
        assert_eq!(program.body_lines(), expected);
    }

    #[test]
    fn renders_counter_branch() {
        let program = compile_source("A+,[B+,B-]^N+2,A-", None).expect("compile");
        let code = program.code();
        assert!(code.contains("Counter_1 := Counter_1 + 1;"));
        assert!(code.contains("IF Counter_1 < N_VARIABLE + 2 THEN"));
        assert!(code.contains("#NEXT := 20;"));
        assert!(code.contains("Counter_1 := 0;"));
    }

    #[test]
    fn renders_timer_calls() {
        let program = compile_source("A+,1.5S,TS,A-", None).expect("compile");
        let code = program.code();
        assert!(code.contains(
            "Timer_1_Instance(IN := Timer_1_Power, PT := T#1500MS, Q => Timer_1_Done, ET => Timer_1_Elapsed);"
        ));
        assert!(code.contains("PT := DINT_TO_TIME(T_VARIABLE * 1000)"));
    }
}
