//! Tag resolution.
//!
//! Maps a logical role (an actuator coil or sensor, a timer's power/done/
//! elapsed signals, a counter value) to the physical signal name used in
//! generated programs and over the field protocol. Names come from a project
//! configuration when one is supplied, otherwise from the deterministic
//! auto-naming scheme. The live interpreter always auto-names.

/// Project configuration documents binding components to physical tags.
pub mod project;

pub use project::{
    ActuatorConfig, ActuatorKind, ComponentConfig, CounterConfig, ProjectConfig, TimerConfig,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequence::{ComponentId, Direction};

/// Runtime timer offset variable, in seconds.
pub const T_VARIABLE: &str = "T_VARIABLE";
/// Runtime repeat-count offset variable.
pub const N_VARIABLE: &str = "N_VARIABLE";

/// Convenience result alias for tag resolution.
pub type TagResult<T> = std::result::Result<T, TagError>;

/// Tag resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// The project configuration has no binding for a required component.
    #[error("configuration incomplete: no binding for {role:?} of {component}")]
    MissingBinding {
        /// Component that is not configured.
        component: ComponentId,
        /// Role that could not be resolved.
        role: TagRole,
    },

    /// The role does not apply to the component.
    #[error("{role:?} does not apply to {component}")]
    NoBinding {
        /// Component asked about.
        component: ComponentId,
        /// Role asked for.
        role: TagRole,
    },
}

/// Logical signal roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagRole {
    /// Coil driving an actuator out.
    ActuatorExtend,
    /// Coil driving an actuator back.
    ActuatorRetract,
    /// End-position sensor, extended.
    SensorExtended,
    /// End-position sensor, retracted.
    SensorRetracted,
    /// Timer enable.
    TimerPower,
    /// Timer elapsed flag.
    TimerDone,
    /// Timer elapsed time.
    TimerElapsed,
    /// Counter value.
    CounterValue,
}

impl TagRole {
    /// Data type of the signal.
    pub fn kind(self) -> TagKind {
        match self {
            TagRole::TimerElapsed => TagKind::Time,
            TagRole::CounterValue => TagKind::Int,
            _ => TagKind::Bool,
        }
    }

    fn applies_to(self, component: &ComponentId) -> bool {
        match self {
            TagRole::ActuatorExtend
            | TagRole::ActuatorRetract
            | TagRole::SensorExtended
            | TagRole::SensorRetracted => matches!(component, ComponentId::Actuator(_)),
            TagRole::TimerPower | TagRole::TimerDone | TagRole::TimerElapsed => {
                matches!(component, ComponentId::Timer(_))
            }
            TagRole::CounterValue => matches!(component, ComponentId::Counter(_)),
        }
    }
}

/// Signal data types used in tag tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagKind {
    /// Single bit.
    Bool,
    /// 16-bit integer.
    Int,
    /// IEC time.
    Time,
}

impl TagKind {
    /// Name used in tag-table XML.
    pub fn as_str(self) -> &'static str {
        match self {
            TagKind::Bool => "Bool",
            TagKind::Int => "Int",
            TagKind::Time => "Time",
        }
    }
}

/// A resolved role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagBinding {
    /// Logical role.
    pub role: TagRole,
    /// Owning component label (`A`, `Timer_1`, `Counter_2`).
    pub owner: String,
    /// Signal name.
    pub physical: String,
}

/// Deterministic name for a role, e.g. `Cylinder_A_Extend` or `Timer_1_Done`.
pub fn auto_name(role: TagRole, owner: &ComponentId) -> String {
    let label = owner.label();
    match role {
        TagRole::ActuatorExtend => format!("Cylinder_{}_Extend", label),
        TagRole::ActuatorRetract => format!("Cylinder_{}_Retract", label),
        TagRole::SensorExtended => format!("Sensor_{}_Extended", label),
        TagRole::SensorRetracted => format!("Sensor_{}_Retracted", label),
        TagRole::TimerPower => format!("{}_Power", label),
        TagRole::TimerDone => format!("{}_Done", label),
        TagRole::TimerElapsed => format!("{}_Elapsed", label),
        TagRole::CounterValue => label,
    }
}

/// Coil and sensor names of one actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorTags {
    /// Extend coil.
    pub extend: String,
    /// Retract coil; absent for single-acting single-tag actuators.
    pub retract: Option<String>,
    /// Extended end-position sensor.
    pub extended: String,
    /// Retracted end-position sensor.
    pub retracted: String,
}

impl ActuatorTags {
    /// Auto-named tags for `label`.
    pub fn auto(label: char) -> Self {
        let id = ComponentId::Actuator(label);
        Self {
            extend: auto_name(TagRole::ActuatorExtend, &id),
            retract: Some(auto_name(TagRole::ActuatorRetract, &id)),
            extended: auto_name(TagRole::SensorExtended, &id),
            retracted: auto_name(TagRole::SensorRetracted, &id),
        }
    }

    /// Coil assignments that command `direction`, releasing the opposite coil first.
    pub fn command(&self, direction: Direction) -> Vec<(String, bool)> {
        match (direction, &self.retract) {
            (Direction::Extend, Some(retract)) => {
                vec![(retract.clone(), false), (self.extend.clone(), true)]
            }
            (Direction::Retract, Some(retract)) => {
                vec![(self.extend.clone(), false), (retract.clone(), true)]
            }
            (Direction::Extend, None) => vec![(self.extend.clone(), true)],
            (Direction::Retract, None) => vec![(self.extend.clone(), false)],
        }
    }

    /// Sensor proving arrival in `direction`.
    pub fn sensor(&self, direction: Direction) -> &str {
        match direction {
            Direction::Extend => &self.extended,
            Direction::Retract => &self.retracted,
        }
    }

    /// All signals, in tag-table order.
    pub fn bindings(&self, label: char) -> Vec<TagBinding> {
        let owner = label.to_string();
        let mut roles = vec![(TagRole::ActuatorExtend, self.extend.clone())];
        if let Some(retract) = &self.retract {
            roles.push((TagRole::ActuatorRetract, retract.clone()));
        }
        roles.push((TagRole::SensorExtended, self.extended.clone()));
        roles.push((TagRole::SensorRetracted, self.retracted.clone()));
        roles
            .into_iter()
            .map(|(role, physical)| TagBinding {
                role,
                owner: owner.clone(),
                physical,
            })
            .collect()
    }
}

/// Power, done and elapsed signal names of one timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerTags {
    /// Timer label (`Timer_1`), also used for the function-block instance.
    pub label: String,
    /// Enable input.
    pub power: String,
    /// Done output.
    pub done: String,
    /// Elapsed-time output.
    pub elapsed: String,
}

impl TimerTags {
    /// All signals, in tag-table order.
    pub fn bindings(&self) -> Vec<TagBinding> {
        [
            (TagRole::TimerPower, &self.power),
            (TagRole::TimerDone, &self.done),
            (TagRole::TimerElapsed, &self.elapsed),
        ]
        .into_iter()
        .map(|(role, physical)| TagBinding {
            role,
            owner: self.label.clone(),
            physical: physical.clone(),
        })
        .collect()
    }
}

/// Resolves roles against an optional project configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagResolver<'a> {
    config: Option<&'a ProjectConfig>,
}

impl<'a> TagResolver<'a> {
    /// Resolver that always auto-names.
    pub fn auto() -> Self {
        Self { config: None }
    }

    /// Resolver backed by `config` when present.
    pub fn new(config: Option<&'a ProjectConfig>) -> Self {
        Self { config }
    }

    /// Whether a project configuration is in use.
    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Resolve one role of one component.
    pub fn resolve(&self, role: TagRole, owner: &ComponentId) -> TagResult<String> {
        if !role.applies_to(owner) {
            return Err(TagError::NoBinding {
                component: *owner,
                role,
            });
        }
        let Some(config) = self.config else {
            return Ok(auto_name(role, owner));
        };
        let missing = || TagError::MissingBinding {
            component: *owner,
            role,
        };
        let label = owner.label();
        let physical = match role {
            TagRole::ActuatorExtend => config.actuator(&label).map(|a| a.extension_tag.clone()),
            TagRole::ActuatorRetract => {
                let actuator = config.actuator(&label).ok_or_else(missing)?;
                if actuator.kind == ActuatorKind::SingleActingSingleTag {
                    return Err(TagError::NoBinding {
                        component: *owner,
                        role,
                    });
                }
                actuator.retraction_tag.clone()
            }
            TagRole::SensorExtended => config
                .actuator(&label)
                .map(|a| a.extended_sensor_tag.clone()),
            TagRole::SensorRetracted => config
                .actuator(&label)
                .map(|a| a.retracted_sensor_tag.clone()),
            TagRole::TimerPower => config.timer(&label).map(|t| t.power_tag.clone()),
            TagRole::TimerDone => config.timer(&label).map(|t| t.completed_tag.clone()),
            TagRole::TimerElapsed => config.timer(&label).map(|t| t.elapsed_time_tag.clone()),
            TagRole::CounterValue => config.counter(&label).map(|c| c.counter_var.clone()),
        };
        physical.filter(|name| !name.is_empty()).ok_or_else(missing)
    }

    /// All tags of an actuator.
    pub fn actuator(&self, label: char) -> TagResult<ActuatorTags> {
        let id = ComponentId::Actuator(label);
        let retract = match self.resolve(TagRole::ActuatorRetract, &id) {
            Ok(name) => Some(name),
            Err(TagError::NoBinding { .. }) => None,
            Err(err) => return Err(err),
        };
        Ok(ActuatorTags {
            extend: self.resolve(TagRole::ActuatorExtend, &id)?,
            retract,
            extended: self.resolve(TagRole::SensorExtended, &id)?,
            retracted: self.resolve(TagRole::SensorRetracted, &id)?,
        })
    }

    /// All tags of timer number `index`.
    pub fn timer(&self, index: u32) -> TagResult<TimerTags> {
        let id = ComponentId::Timer(index);
        Ok(TimerTags {
            label: id.label(),
            power: self.resolve(TagRole::TimerPower, &id)?,
            done: self.resolve(TagRole::TimerDone, &id)?,
            elapsed: self.resolve(TagRole::TimerElapsed, &id)?,
        })
    }

    /// Value tag of counter number `index`.
    pub fn counter(&self, index: u32) -> TagResult<String> {
        self.resolve(TagRole::CounterValue, &ComponentId::Counter(index))
    }
}
