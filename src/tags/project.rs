use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::sequence::{Component, ComponentId, ComponentKind};

/// How an actuator's coils are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActuatorKind {
    /// Double-acting cylinder, one coil per direction.
    DoubleActing,
    /// Single-acting cylinder with separate extend and retract signals.
    SingleActingDoubleTag,
    /// Single-acting cylinder; dropping the extend coil retracts it.
    SingleActingSingleTag,
}

/// Physical tags of one actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Actuator label as used in sequences (`A`).
    pub label: String,
    /// Coil wiring.
    pub kind: ActuatorKind,
    /// Extend coil.
    pub extension_tag: String,
    /// Retract coil, required unless `kind` is single-tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retraction_tag: Option<String>,
    /// Extended end-position sensor.
    pub extended_sensor_tag: String,
    /// Retracted end-position sensor.
    pub retracted_sensor_tag: String,
}

/// Physical tags of one timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer label (`Timer_1`).
    pub label: String,
    /// Enable input.
    pub power_tag: String,
    /// Done output.
    pub completed_tag: String,
    /// Elapsed-time output.
    pub elapsed_time_tag: String,
}

/// Physical tag of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Counter label (`Counter_1`).
    pub label: String,
    /// Counter variable.
    pub counter_var: String,
}

/// One configured component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentConfig {
    /// Actuator binding.
    Actuator(ActuatorConfig),
    /// Timer binding.
    Timer(TimerConfig),
    /// Counter binding.
    Counter(CounterConfig),
}

impl ComponentConfig {
    /// Label of the configured component.
    pub fn label(&self) -> &str {
        match self {
            ComponentConfig::Actuator(a) => &a.label,
            ComponentConfig::Timer(t) => &t.label,
            ComponentConfig::Counter(c) => &c.label,
        }
    }
}

/// Per-project tag bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name.
    #[serde(default)]
    pub name: String,
    /// Configured components.
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

impl ProjectConfig {
    /// Read a configuration document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read project config: {:?}", path))?;
        serde_json::from_slice(&data).context("Failed to deserialize project config")
    }

    /// Actuator bound to `label`.
    pub fn actuator(&self, label: &str) -> Option<&ActuatorConfig> {
        self.components.iter().find_map(|c| match c {
            ComponentConfig::Actuator(a) if a.label == label => Some(a),
            _ => None,
        })
    }

    /// Timer bound to `label`.
    pub fn timer(&self, label: &str) -> Option<&TimerConfig> {
        self.components.iter().find_map(|c| match c {
            ComponentConfig::Timer(t) if t.label == label => Some(t),
            _ => None,
        })
    }

    /// Counter bound to `label`.
    pub fn counter(&self, label: &str) -> Option<&CounterConfig> {
        self.components.iter().find_map(|component| match component {
            ComponentConfig::Counter(c) if c.label == label => Some(c),
            _ => None,
        })
    }

    /// Whether every tag `id` needs is configured.
    pub fn binds(&self, id: &ComponentId) -> bool {
        let label = id.label();
        match id {
            ComponentId::Actuator(_) => self.actuator(&label).is_some_and(|a| {
                a.kind == ActuatorKind::SingleActingSingleTag || a.retraction_tag.is_some()
            }),
            ComponentId::Timer(_) => self.timer(&label).is_some(),
            ComponentId::Counter(_) => self.counter(&label).is_some(),
            ComponentId::Pressure(_) => false,
        }
    }

    /// Required components without a binding. Pressure switches cannot be
    /// configured and are not reported.
    pub fn missing(&self, required: &[Component]) -> Vec<ComponentId> {
        required
            .iter()
            .filter(|c| c.kind != ComponentKind::Pressure && !self.binds(&c.id))
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{inventory, parse_sequence};

    const DOCUMENT: &str = r#"{
        "name": "press",
        "components": [
            {"type": "actuator", "label": "A", "kind": "doubleActing",
             "extension_tag": "Q_A1", "retraction_tag": "Q_A0",
             "extended_sensor_tag": "I_A1", "retracted_sensor_tag": "I_A0"},
            {"type": "timer", "label": "Timer_1", "power_tag": "T1_IN",
             "completed_tag": "T1_Q", "elapsed_time_tag": "T1_ET"}
        ]
    }"#;

    #[test]
    fn deserializes_tagged_components() {
        let config: ProjectConfig = serde_json::from_str(DOCUMENT).expect("document");
        assert_eq!(config.components.len(), 2);
        assert_eq!(config.actuator("A").map(|a| a.kind), Some(ActuatorKind::DoubleActing));
        assert_eq!(
            config.timer("Timer_1").map(|t| t.completed_tag.as_str()),
            Some("T1_Q")
        );
    }

    #[test]
    fn reports_unbound_components() {
        let config: ProjectConfig = serde_json::from_str(DOCUMENT).expect("document");
        let seq = parse_sequence("A+,1S,[B+,B-]^2,A-").expect("parse");
        let missing = config.missing(&inventory(&seq));
        assert_eq!(missing, vec![ComponentId::Counter(1), ComponentId::Actuator('B')]);
    }

    #[test]
    fn double_acting_without_retract_coil_is_unbound() {
        let mut config: ProjectConfig = serde_json::from_str(DOCUMENT).expect("document");
        if let Some(ComponentConfig::Actuator(a)) = config.components.first_mut() {
            a.retraction_tag = None;
        }
        assert!(!config.binds(&ComponentId::Actuator('A')));
    }
}
