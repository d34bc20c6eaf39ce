//! Sequence interpreter
//!
//! Executes a parsed sequence against a live controller session instead of
//! emitting a program. The walk is index-driven so repeat regions and the
//! whole-sequence wrap can rewind it. Before each step the interpreter polls
//! the previous step's end-position sensors; every poll and every sleep is a
//! cancellation point bound to the device's stop flag.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::RuntimeConfig;
use super::error::{Result, RuntimeError};
use super::protocol::{FieldConnector, FieldSession, TagWrite, endpoint};
use super::registry::{DeviceLease, DeviceRegistry};
use crate::sequence::{
    Actuation, Direction, RepeatBound, Sequence, Step, Token, parse_sequence,
};
use crate::tags::{ActuatorTags, N_VARIABLE, T_VARIABLE};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every step executed and the final step confirmed.
    Completed,
    /// A stop request ended the run early.
    Stopped,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Device the run executed on.
    pub device: String,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Combined actuation writes issued, excluding seeding and initialisation.
    pub actuation_writes: u64,
    /// Complete passes through the whole sequence.
    pub passes: u64,
    /// Seeded `T_VARIABLE`.
    pub t_variable: i16,
    /// Seeded `N_VARIABLE`.
    pub n_variable: i16,
}

/// A run executing in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    device: String,
    handle: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Device the run executes on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the run has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<RunReport> {
        self.handle.await?
    }
}

/// Executes sequences on registered devices.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<DeviceRegistry>,
    connector: Arc<dyn FieldConnector>,
    config: Arc<RuntimeConfig>,
}

impl Engine {
    /// Create an engine over a registry and a transport.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connector: Arc<dyn FieldConnector>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            config: Arc::new(config),
        }
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Parse and acquire. Nothing touches the device if this fails.
    fn prepare(&self, source: &str, device: &str) -> Result<(Sequence, DeviceLease)> {
        let sequence = parse_sequence(source)?;
        if let Some(token) = sequence.first_pressure() {
            return Err(RuntimeError::Unsupported(format!(
                "pressure sensors are not supported yet: {}",
                token
            )));
        }
        if let Some(label) = sequence.opening_retraction() {
            return Err(RuntimeError::Unsupported(format!(
                "sequence cannot start by retracting actuator {}",
                label
            )));
        }
        let lease = self.registry.acquire(device)?;
        Ok((sequence, lease))
    }

    /// Execute `source` on `device` and wait for it to end.
    pub async fn run(&self, source: &str, device: &str) -> Result<RunReport> {
        let (sequence, lease) = self.prepare(source, device)?;
        self.execute(sequence, lease).await
    }

    /// Start `source` on `device` in the background.
    ///
    /// Busy and unknown devices are rejected before anything is spawned.
    pub fn start(&self, source: &str, device: &str) -> Result<RunHandle> {
        let (sequence, lease) = self.prepare(source, device)?;
        let run_id = lease.run_id();
        let device = lease.id().to_string();
        let engine = self.clone();
        let task_device = device.clone();
        let handle = tokio::spawn(async move {
            let result = engine.execute(sequence, lease).await;
            if let Err(err) = &result {
                error!(device = %task_device, run_id = %run_id, error = %err, "run failed");
            }
            result
        });
        Ok(RunHandle {
            run_id,
            device,
            handle,
        })
    }

    async fn execute(&self, sequence: Sequence, lease: DeviceLease) -> Result<RunReport> {
        let endpoint = endpoint(lease.address(), self.config.endpoint_port);
        info!(
            device = %lease.id(),
            run_id = %lease.run_id(),
            endpoint = %endpoint,
            sequence = %sequence.source(),
            "starting run"
        );

        let mut client = self.connector.connect(&endpoint).await?;
        let mut session = match client.create_session().await {
            Ok(session) => session,
            Err(err) => {
                if let Err(close) = client.disconnect().await {
                    warn!(device = %lease.id(), error = %close, "disconnect failed");
                }
                return Err(err.into());
            }
        };

        let result = Execution::new(&sequence, &lease, &mut session, &self.config)
            .run()
            .await;

        if let Err(err) = session.close_session().await {
            warn!(device = %lease.id(), error = %err, "closing session failed");
        }
        if let Err(err) = client.disconnect().await {
            warn!(device = %lease.id(), error = %err, "disconnect failed");
        }

        if let Ok(report) = &result {
            info!(
                device = %lease.id(),
                run_id = %lease.run_id(),
                outcome = ?report.outcome,
                writes = report.actuation_writes,
                "run finished"
            );
        }
        result
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Execution<'a> {
    sequence: &'a Sequence,
    lease: &'a DeviceLease,
    session: &'a mut Box<dyn FieldSession>,
    config: &'a RuntimeConfig,
    actuators: HashMap<char, ActuatorTags>,
    /// Resolved pass count per region, fixed on first arrival at its end.
    bounds: Vec<Option<Option<u64>>>,
    /// Passes finished per region in the current round.
    completed: Vec<u64>,
    actuation_writes: u64,
    passes: u64,
}

impl<'a> Execution<'a> {
    fn new(
        sequence: &'a Sequence,
        lease: &'a DeviceLease,
        session: &'a mut Box<dyn FieldSession>,
        config: &'a RuntimeConfig,
    ) -> Self {
        let regions = sequence.regions().len();
        Self {
            sequence,
            lease,
            session,
            config,
            actuators: HashMap::new(),
            bounds: vec![None; regions],
            completed: vec![0; regions],
            actuation_writes: 0,
            passes: 0,
        }
    }

    async fn run(mut self) -> Result<RunReport> {
        let (t_variable, n_variable) = self.seed().await?;
        let outcome = self.walk().await?;
        Ok(RunReport {
            run_id: self.lease.run_id(),
            device: self.lease.id().to_string(),
            outcome,
            actuation_writes: self.actuation_writes,
            passes: self.passes,
            t_variable,
            n_variable,
        })
    }

    /// Stand-in values for the variables a device-side program would read.
    async fn seed(&mut self) -> Result<(i16, i16)> {
        let max = self.config.runtime_var_max.max(1);
        let (t, n) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..=max), rng.gen_range(1..=max))
        };
        self.session
            .write_tags(&[TagWrite::int16(T_VARIABLE, t), TagWrite::int16(N_VARIABLE, n)])
            .await?;
        debug!(device = %self.lease.id(), t, n, "seeded runtime variables");
        Ok((t, n))
    }

    fn tags(&mut self, label: char) -> &ActuatorTags {
        self.actuators
            .entry(label)
            .or_insert_with(|| ActuatorTags::auto(label))
    }

    fn command(&mut self, actuation: &Actuation) -> Vec<TagWrite> {
        self.tags(actuation.label)
            .command(actuation.direction)
            .into_iter()
            .map(|(tag, value)| TagWrite::bool(tag, value))
            .collect()
    }

    /// Drive every actuator to rest, then let the device settle.
    async fn initialise(&mut self) -> Result<Flow> {
        let mut writes = Vec::new();
        for label in self.sequence.actuator_labels() {
            writes.extend(self.command(&Actuation {
                label,
                direction: Direction::Retract,
            }));
        }
        if !writes.is_empty() {
            self.session.write_tags(&writes).await?;
        }
        Ok(pause(self.lease, self.config.settle()).await)
    }

    async fn walk(&mut self) -> Result<RunOutcome> {
        if let Flow::Stop = self.initialise().await? {
            return Ok(RunOutcome::Stopped);
        }

        let sequence = self.sequence;
        let steps = sequence.steps();
        let mut pending: Vec<Actuation> = Vec::new();
        let mut index = 0;
        while index < steps.len() {
            let step = &steps[index];
            if let Flow::Stop = self.await_sensors(&pending).await? {
                return Ok(RunOutcome::Stopped);
            }
            if let Flow::Stop = self.execute_step(index, step).await? {
                return Ok(RunOutcome::Stopped);
            }
            pending = step.actuations().copied().collect();

            match self.advance(index).await? {
                Some(next) if next <= index => {
                    // Rewinds against an instant device never suspend otherwise.
                    tokio::task::yield_now().await;
                    index = next;
                }
                Some(next) => index = next,
                None => break,
            }
        }

        if let Flow::Stop = self.await_sensors(&pending).await? {
            return Ok(RunOutcome::Stopped);
        }
        self.passes += 1;
        Ok(RunOutcome::Completed)
    }

    /// Issue a step's actuations as one combined write, then run its timers.
    /// Timers in a group run alongside the group's actuations.
    async fn execute_step(&mut self, index: usize, step: &Step) -> Result<Flow> {
        let mut writes = Vec::new();
        let mut delay = Duration::ZERO;
        for token in step.tokens() {
            match token {
                Token::Actuation(actuation) => writes.extend(self.command(actuation)),
                Token::Timer(timer) => {
                    let t = if timer.uses_runtime_var() {
                        self.session.read_int(T_VARIABLE).await?
                    } else {
                        0
                    };
                    let resolved = timer.resolve(i64::from(t)).ok_or_else(|| {
                        RuntimeError::Unsupported(format!(
                            "timer {} with T_VARIABLE={} exceeds the longest delay",
                            token, t
                        ))
                    })?;
                    delay = delay.max(resolved);
                }
                Token::Pressure(_) => {
                    return Err(RuntimeError::Unsupported(format!(
                        "pressure sensors are not supported yet: {}",
                        token
                    )));
                }
            }
        }

        if !writes.is_empty() {
            debug!(device = %self.lease.id(), step = index, writes = writes.len(), "issuing actuation");
            self.session.write_tags(&writes).await?;
            self.actuation_writes += 1;
        }
        if delay.is_zero() {
            return Ok(Flow::Continue);
        }
        debug!(device = %self.lease.id(), step = index, delay_ms = delay.as_millis() as u64, "timer");
        Ok(pause(self.lease, delay).await)
    }

    /// Poll until every actuation in `pending` reports arrival.
    async fn await_sensors(&mut self, pending: &[Actuation]) -> Result<Flow> {
        let started = Instant::now();
        loop {
            if self.lease.stop_requested() {
                return Ok(Flow::Stop);
            }

            let mut waiting = None;
            for actuation in pending {
                let tag = self.tags(actuation.label).sensor(actuation.direction).to_string();
                if !self.session.read_bool(&tag).await? {
                    waiting = Some(tag);
                    break;
                }
            }
            let Some(tag) = waiting else {
                return Ok(Flow::Continue);
            };

            if let Some(limit) = self.config.sensor_timeout() {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(RuntimeError::SensorTimeout {
                        tag,
                        waited_ms: waited.as_millis() as u64,
                    });
                }
            }
            if let Flow::Stop = pause(self.lease, self.config.poll_interval()).await {
                return Ok(Flow::Stop);
            }
        }
    }

    /// Index of the step after `index`, following region rewinds innermost
    /// first, then the wrap. `None` ends the walk.
    async fn advance(&mut self, index: usize) -> Result<Option<usize>> {
        let sequence = self.sequence;
        let regions = sequence.regions();
        for region_index in sequence.regions_ending_at(index) {
            let region = regions[region_index];
            let Some(total) = self.bound(region_index, region.bound).await? else {
                return Ok(Some(region.start));
            };
            self.completed[region_index] += 1;
            if self.completed[region_index] < total {
                debug!(
                    device = %self.lease.id(),
                    start = region.start,
                    pass = self.completed[region_index] + 1,
                    total,
                    "repeating region"
                );
                return Ok(Some(region.start));
            }
            self.completed[region_index] = 0;
        }

        if index + 1 < sequence.len() {
            return Ok(Some(index + 1));
        }
        if sequence.is_wrapped() {
            self.passes += 1;
            return Ok(Some(0));
        }
        Ok(None)
    }

    async fn bound(&mut self, region: usize, bound: RepeatBound) -> Result<Option<u64>> {
        if let Some(resolved) = self.bounds[region] {
            return Ok(resolved);
        }
        let n = if bound.uses_runtime_var() {
            i64::from(self.session.read_int(N_VARIABLE).await?)
        } else {
            0
        };
        let resolved = bound.passes(n);
        self.bounds[region] = Some(resolved);
        Ok(resolved)
    }
}

/// Sleep unless a stop arrives first. Borrows only the lease so the run
/// future stays `Send`.
async fn pause(lease: &DeviceLease, duration: Duration) -> Flow {
    if lease.stop_requested() {
        return Flow::Stop;
    }
    if duration.is_zero() {
        return Flow::Continue;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Flow::Continue,
        _ = lease.stopped() => Flow::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::ProtocolError;
    use crate::runtime::protocol::TagValue;
    use crate::runtime::simulator::{SimulatedConnector, SimulatedPlc};

    const DEVICE: &str = "192.168.0.42";

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            poll_interval_ms: 1,
            settle_ms: 0,
            ..RuntimeConfig::default()
        }
    }

    fn engine(config: RuntimeConfig, plc: &SimulatedPlc) -> Engine {
        let connector = SimulatedConnector::new();
        connector.insert(endpoint(DEVICE, config.endpoint_port), plc.clone());
        let registry = Arc::new(DeviceRegistry::from_devices(&config.devices));
        Engine::new(registry, Arc::new(connector), config)
    }

    fn plc() -> SimulatedPlc {
        SimulatedPlc::default().with_actuators(['A', 'B', 'C'])
    }

    #[tokio::test]
    async fn two_steps_issue_two_combined_writes() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let report = engine.run("A+,A-", DEVICE).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.actuation_writes, 2);
        assert_eq!(report.passes, 1);
        // seed, initialise, A+, A-
        assert_eq!(plc.write_count(), 4);
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.open_sessions(), 0);
    }

    #[tokio::test]
    async fn seed_and_initialise_come_first() {
        let plc = plc();
        let engine = engine(config(), &plc);
        engine.run("A+,B+,A-,B-", DEVICE).await.unwrap();
        let writes = plc.writes();
        let seeded: Vec<&str> = writes[0].iter().map(|w| w.name.as_str()).collect();
        assert_eq!(seeded, vec![T_VARIABLE, N_VARIABLE]);
        assert_eq!(
            writes[1],
            vec![
                TagWrite::bool("Cylinder_A_Extend", false),
                TagWrite::bool("Cylinder_A_Retract", true),
                TagWrite::bool("Cylinder_B_Extend", false),
                TagWrite::bool("Cylinder_B_Retract", true),
            ]
        );
    }

    #[tokio::test]
    async fn groups_write_once() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let report = engine.run("(A+,B+),(A-,B-)", DEVICE).await.unwrap();
        assert_eq!(report.actuation_writes, 2);
        assert_eq!(plc.writes()[2].len(), 4);
    }

    #[tokio::test]
    async fn counted_region_repeats() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let report = engine.run("A+,[B+,B-]^2,A-", DEVICE).await.unwrap();
        assert_eq!(report.actuation_writes, 6);
    }

    #[tokio::test]
    async fn runtime_bound_reads_n_variable() {
        let plc = plc();
        let engine = engine(
            RuntimeConfig {
                runtime_var_max: 1,
                ..config()
            },
            &plc,
        );
        let report = engine.run("[A+,A-]^N+1", DEVICE).await.unwrap();
        assert_eq!(report.n_variable, 1);
        assert_eq!(report.actuation_writes, 4);
    }

    #[tokio::test]
    async fn timers_wait() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let started = std::time::Instant::now();
        let report = engine.run("A+,0.1S,A-", DEVICE).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(report.actuation_writes, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_ends_a_stalled_run() {
        let plc = plc();
        plc.jam("Cylinder_A_Extend");
        let engine = engine(config(), &plc);
        let handle = engine.start("A+,A-", DEVICE).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        engine.registry().request_stop(DEVICE).unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.actuation_writes, 1);
        assert!(engine.registry().get(DEVICE).unwrap().available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrapped_sequence_loops_until_stopped() {
        let plc = SimulatedPlc::new(Duration::from_millis(2)).with_actuators(['A']);
        let engine = engine(config(), &plc);
        let handle = engine.start("[A+,A-]", DEVICE).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.registry().request_stop(DEVICE).unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert!(report.passes >= 1);
        assert!(report.actuation_writes >= 2);
    }

    #[tokio::test]
    async fn sensor_timeout_fails_and_releases() {
        let plc = plc();
        plc.jam("Cylinder_A_Extend");
        let engine = engine(
            RuntimeConfig {
                sensor_timeout_ms: Some(20),
                ..config()
            },
            &plc,
        );
        let err = engine.run("A+,A-", DEVICE).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SensorTimeout { ref tag, .. } if tag == "Sensor_A_Extended"));
        assert!(engine.registry().get(DEVICE).unwrap().available);
    }

    #[tokio::test]
    async fn protocol_failure_releases_device() {
        let plc = plc();
        plc.fail_writes_after(2);
        let engine = engine(config(), &plc);
        let err = engine.run("A+,A-", DEVICE).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.open_sessions(), 0);
    }

    #[tokio::test]
    async fn busy_device_is_rejected_without_a_session() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let _lease = engine.registry().acquire(DEVICE).unwrap();
        assert!(matches!(
            engine.run("A+,A-", DEVICE).await,
            Err(RuntimeError::DeviceBusy(_))
        ));
        assert!(matches!(
            engine.start("A+,A-", DEVICE),
            Err(RuntimeError::DeviceBusy(_))
        ));
        assert_eq!(plc.write_count(), 0);
    }

    #[tokio::test]
    async fn rejects_before_acquiring() {
        let plc = plc();
        let engine = engine(config(), &plc);
        assert!(matches!(
            engine.run("A+,(B+,4.2BAR)", DEVICE).await,
            Err(RuntimeError::Unsupported(_))
        ));
        assert!(matches!(
            engine.run("A+A-", DEVICE).await,
            Err(RuntimeError::Sequence(_))
        ));
        assert!(matches!(
            engine.run("A+,A-", "10.0.0.9").await,
            Err(RuntimeError::UnknownDevice(_))
        ));
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.write_count(), 0);
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn run_future_is_send() {
        let plc = plc();
        let engine = engine(config(), &plc);
        assert_send(engine.run("A+,0.1S,A-", DEVICE));
    }

    #[tokio::test]
    async fn oversized_timer_fails_the_run() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let err = engine
            .run("A+,T+18446744073709551615S,A-", DEVICE)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported(ref msg) if msg.contains("T_VARIABLE")));
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.open_sessions(), 0);
    }

    #[tokio::test]
    async fn opening_retraction_is_refused() {
        let plc = plc();
        let engine = engine(config(), &plc);
        let err = engine.run("(A+,B-),A-,B+", DEVICE).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported(ref msg) if msg.contains('B')));
        assert!(err.is_rejection());
        assert!(matches!(
            engine.start("1S,A-,A+", DEVICE),
            Err(RuntimeError::Unsupported(_))
        ));
        assert_eq!(plc.write_count(), 0);
        assert_eq!(plc.open_sessions(), 0);
        assert!(engine.registry().get(DEVICE).unwrap().available);
    }

    #[tokio::test]
    async fn read_failure_releases_device() {
        let plc = plc();
        plc.fail_reads(true);
        let engine = engine(config(), &plc);
        let err = engine.run("A+,A-", DEVICE).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Protocol(ProtocolError::Read { ref tag, .. }) if tag == "Sensor_A_Extended"
        ));
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.open_sessions(), 0);

        plc.fail_reads(false);
        let report = engine.run("A+,A-", DEVICE).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(plc.tag("Cylinder_A_Retract"), Some(TagValue::Bool(true)));
        assert_eq!(plc.tag("Sensor_A_Retracted"), Some(TagValue::Bool(true)));
    }

    #[tokio::test]
    async fn mistyped_sensor_fails_the_run() {
        let plc = plc();
        plc.jam("Cylinder_A_Extend");
        plc.set_tag("Sensor_A_Extended", TagValue::Int16(1));
        let engine = engine(config(), &plc);
        let err = engine.run("A+,A-", DEVICE).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Protocol(ProtocolError::TypeMismatch { ref tag, .. }) if tag == "Sensor_A_Extended"
        ));
        assert!(engine.registry().get(DEVICE).unwrap().available);
        assert_eq!(plc.open_sessions(), 0);
    }
}
