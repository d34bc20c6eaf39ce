//! In-process simulated controller
//!
//! Models each actuator as a pair of coils driving a pair of end-position
//! sensors. A commanded move clears both sensors and sets the destination
//! sensor once the travel time has elapsed; a zero travel time moves
//! instantly. Every combined write is logged so tests can count them.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::error::{ProtocolError, ProtocolResult};
use super::protocol::{FieldClient, FieldConnector, FieldSession, TagValue, TagWrite};
use crate::sequence::Direction;
use crate::tags::{ActuatorTags, N_VARIABLE, T_VARIABLE};

#[derive(Debug)]
struct Cylinder {
    tags: ActuatorTags,
    commanded: Direction,
    arrives_at: Option<Instant>,
    jammed: bool,
}

impl Cylinder {
    fn commanded_by(&self, tags: &HashMap<String, TagValue>) -> Option<Direction> {
        let coil = |name: &str| tags.get(name).and_then(TagValue::as_bool).unwrap_or(false);
        let extend = coil(&self.tags.extend);
        match &self.tags.retract {
            Some(retract) => match (extend, coil(retract)) {
                (true, false) => Some(Direction::Extend),
                (false, true) => Some(Direction::Retract),
                _ => None,
            },
            None if extend => Some(Direction::Extend),
            None => Some(Direction::Retract),
        }
    }
}

#[derive(Debug, Default)]
struct PlcState {
    tags: HashMap<String, TagValue>,
    cylinders: Vec<Cylinder>,
    writes: Vec<Vec<TagWrite>>,
    fail_writes_after: Option<usize>,
    fail_reads: bool,
    open_sessions: usize,
}

impl PlcState {
    fn set_sensors(&mut self, index: usize, direction: Option<Direction>) {
        let tags = &self.cylinders[index].tags;
        let (extended, retracted) = (tags.extended.clone(), tags.retracted.clone());
        self.tags.insert(
            extended,
            TagValue::Bool(direction == Some(Direction::Extend)),
        );
        self.tags.insert(
            retracted,
            TagValue::Bool(direction == Some(Direction::Retract)),
        );
    }

    fn settle(&mut self, now: Instant) {
        for index in 0..self.cylinders.len() {
            let cylinder = &mut self.cylinders[index];
            match cylinder.arrives_at {
                Some(at) if at <= now => {
                    cylinder.arrives_at = None;
                    let direction = cylinder.commanded;
                    self.set_sensors(index, Some(direction));
                }
                _ => {}
            }
        }
    }

    fn command(&mut self, travel: Duration, now: Instant) {
        for index in 0..self.cylinders.len() {
            let cylinder = &mut self.cylinders[index];
            if cylinder.jammed {
                continue;
            }
            let Some(direction) = cylinder.commanded_by(&self.tags) else {
                continue;
            };
            if direction == cylinder.commanded {
                continue;
            }
            cylinder.commanded = direction;
            cylinder.arrives_at = Some(now + travel);
            self.set_sensors(index, None);
        }
        self.settle(now);
    }
}

/// Simulated controller. Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    state: Arc<Mutex<PlcState>>,
    travel: Duration,
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl SimulatedPlc {
    /// Controller whose actuators take `travel` to reach either end.
    pub fn new(travel: Duration) -> Self {
        let mut state = PlcState::default();
        state.tags.insert(T_VARIABLE.to_string(), TagValue::Int16(0));
        state.tags.insert(N_VARIABLE.to_string(), TagValue::Int16(0));
        Self {
            state: Arc::new(Mutex::new(state)),
            travel,
        }
    }

    /// Add auto-named actuators, all at rest in the retracted position.
    pub fn with_actuators(self, labels: impl IntoIterator<Item = char>) -> Self {
        for label in labels {
            self.add_actuator(ActuatorTags::auto(label));
        }
        self
    }

    /// Add an actuator with explicit tags, at rest in the retracted position.
    pub fn add_actuator(&self, tags: ActuatorTags) {
        let mut state = self.state.lock();
        state.tags.insert(tags.extend.clone(), TagValue::Bool(false));
        if let Some(retract) = &tags.retract {
            state.tags.insert(retract.clone(), TagValue::Bool(true));
        }
        state.cylinders.push(Cylinder {
            tags,
            commanded: Direction::Retract,
            arrives_at: None,
            jammed: false,
        });
        let index = state.cylinders.len() - 1;
        state.set_sensors(index, Some(Direction::Retract));
    }

    /// Freeze an actuator in place; later commands never move it.
    pub fn jam(&self, extend_tag: &str) {
        let mut state = self.state.lock();
        for cylinder in state.cylinders.iter_mut() {
            if cylinder.tags.extend == extend_tag {
                cylinder.jammed = true;
            }
        }
    }

    /// Fail every write after the first `count` succeed.
    pub fn fail_writes_after(&self, count: usize) {
        self.state.lock().fail_writes_after = Some(count);
    }

    /// Fail every read.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Current value of a tag.
    pub fn tag(&self, name: &str) -> Option<TagValue> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.tags.get(name).copied()
    }

    /// Overwrite a tag directly.
    pub fn set_tag(&self, name: &str, value: TagValue) {
        self.state.lock().tags.insert(name.to_string(), value);
    }

    /// Combined writes received so far, in order.
    pub fn writes(&self) -> Vec<Vec<TagWrite>> {
        self.state.lock().writes.clone()
    }

    /// Number of combined writes received.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Sessions not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }
}

/// Connector that resolves endpoints to simulated controllers.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    plcs: RwLock<HashMap<String, SimulatedPlc>>,
}

impl SimulatedConnector {
    /// Connector with no controllers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `plc` at `endpoint`.
    pub fn insert(&self, endpoint: impl Into<String>, plc: SimulatedPlc) {
        self.plcs.write().insert(endpoint.into(), plc);
    }
}

#[async_trait]
impl FieldConnector for SimulatedConnector {
    async fn connect(&self, endpoint: &str) -> ProtocolResult<Box<dyn FieldClient>> {
        let plc = self
            .plcs
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ProtocolError::Connect {
                endpoint: endpoint.to_string(),
                detail: "no controller at endpoint".to_string(),
            })?;
        Ok(Box::new(SimulatedClient { plc }))
    }
}

struct SimulatedClient {
    plc: SimulatedPlc,
}

#[async_trait]
impl FieldClient for SimulatedClient {
    async fn create_session(&mut self) -> ProtocolResult<Box<dyn FieldSession>> {
        self.plc.state.lock().open_sessions += 1;
        Ok(Box::new(SimulatedSession {
            plc: self.plc.clone(),
            open: true,
        }))
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        Ok(())
    }
}

struct SimulatedSession {
    plc: SimulatedPlc,
    open: bool,
}

impl SimulatedSession {
    fn ensure_open(&self) -> ProtocolResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(ProtocolError::Session("session closed".to_string()))
        }
    }
}

#[async_trait]
impl FieldSession for SimulatedSession {
    async fn write_tags(&mut self, writes: &[TagWrite]) -> ProtocolResult<()> {
        self.ensure_open()?;
        let mut state = self.plc.state.lock();
        if let Some(limit) = state.fail_writes_after {
            if state.writes.len() >= limit {
                return Err(ProtocolError::Write("simulated write failure".to_string()));
            }
        }
        for write in writes {
            trace!(tag = %write.name, value = %write.value, "simulated write");
            state.tags.insert(write.name.clone(), write.value);
        }
        state.writes.push(writes.to_vec());
        state.command(self.plc.travel, Instant::now());
        Ok(())
    }

    async fn read_tag(&mut self, name: &str) -> ProtocolResult<TagValue> {
        self.ensure_open()?;
        let mut state = self.plc.state.lock();
        if state.fail_reads {
            return Err(ProtocolError::Read {
                tag: name.to_string(),
                detail: "simulated read failure".to_string(),
            });
        }
        state.settle(Instant::now());
        state
            .tags
            .get(name)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownTag(name.to_string()))
    }

    async fn close_session(&mut self) -> ProtocolResult<()> {
        if self.open {
            self.open = false;
            let mut state = self.plc.state.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(plc: &SimulatedPlc) -> Box<dyn FieldSession> {
        let connector = SimulatedConnector::new();
        connector.insert("opc.tcp://sim:4840", plc.clone());
        let mut client = connector.connect("opc.tcp://sim:4840").await.unwrap();
        client.create_session().await.unwrap()
    }

    #[tokio::test]
    async fn instant_actuator_follows_coils() {
        let plc = SimulatedPlc::default().with_actuators(['A']);
        let mut session = session(&plc).await;
        assert!(session.read_bool("Sensor_A_Retracted").await.unwrap());
        session
            .write_tags(&[
                TagWrite::bool("Cylinder_A_Retract", false),
                TagWrite::bool("Cylinder_A_Extend", true),
            ])
            .await
            .unwrap();
        assert!(session.read_bool("Sensor_A_Extended").await.unwrap());
        assert!(!session.read_bool("Sensor_A_Retracted").await.unwrap());
        assert_eq!(plc.write_count(), 1);
    }

    #[tokio::test]
    async fn travel_time_delays_arrival() {
        let plc = SimulatedPlc::new(Duration::from_millis(40)).with_actuators(['A']);
        let mut session = session(&plc).await;
        session
            .write_tags(&[
                TagWrite::bool("Cylinder_A_Retract", false),
                TagWrite::bool("Cylinder_A_Extend", true),
            ])
            .await
            .unwrap();
        assert!(!session.read_bool("Sensor_A_Extended").await.unwrap());
        assert!(!session.read_bool("Sensor_A_Retracted").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(session.read_bool("Sensor_A_Extended").await.unwrap());
    }

    #[tokio::test]
    async fn jammed_actuator_never_moves() {
        let plc = SimulatedPlc::default().with_actuators(['A']);
        plc.jam("Cylinder_A_Extend");
        let mut session = session(&plc).await;
        session
            .write_tags(&[
                TagWrite::bool("Cylinder_A_Retract", false),
                TagWrite::bool("Cylinder_A_Extend", true),
            ])
            .await
            .unwrap();
        assert!(!session.read_bool("Sensor_A_Extended").await.unwrap());
        assert!(session.read_bool("Sensor_A_Retracted").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let plc = SimulatedPlc::default();
        plc.fail_writes_after(0);
        let mut session = session(&plc).await;
        assert!(matches!(
            session.write_tags(&[TagWrite::int16(T_VARIABLE, 1)]).await,
            Err(ProtocolError::Write(_))
        ));
        assert!(matches!(
            session.read_tag("missing").await,
            Err(ProtocolError::UnknownTag(_))
        ));
        assert!(matches!(
            session.read_bool(T_VARIABLE).await,
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn sessions_are_counted() {
        let plc = SimulatedPlc::default();
        let mut session = session(&plc).await;
        assert_eq!(plc.open_sessions(), 1);
        session.close_session().await.unwrap();
        assert_eq!(plc.open_sessions(), 0);
        assert!(session.read_tag(T_VARIABLE).await.is_err());
    }

    #[tokio::test]
    async fn unknown_endpoint_fails_to_connect() {
        let connector = SimulatedConnector::new();
        assert!(matches!(
            connector.connect("opc.tcp://nowhere:4840").await,
            Err(ProtocolError::Connect { .. })
        ));
    }
}
