//! Engine and registry behaviour through the public runtime API.

use std::sync::Arc;
use std::time::Duration;

use seqctl::runtime::{
    DeviceConfig, DeviceRegistry, Engine, RunOutcome, RuntimeConfig, RuntimeError,
    SimulatedConnector, SimulatedPlc, endpoint,
};

const PRESS: &str = "192.168.0.42";
const LATHE: &str = "192.168.0.43";

fn config() -> RuntimeConfig {
    RuntimeConfig {
        devices: vec![
            DeviceConfig {
                name: "PLC_5".into(),
                address: PRESS.into(),
            },
            DeviceConfig {
                name: "PLC_6".into(),
                address: LATHE.into(),
            },
        ],
        poll_interval_ms: 1,
        settle_ms: 0,
        ..RuntimeConfig::default()
    }
}

fn engine_with(plcs: &[(&str, &SimulatedPlc)]) -> Engine {
    let config = config();
    let connector = SimulatedConnector::new();
    for (address, plc) in plcs {
        connector.insert(endpoint(address, config.endpoint_port), (*plc).clone());
    }
    let registry = Arc::new(DeviceRegistry::from_devices(&config.devices));
    Engine::new(registry, Arc::new(connector), config)
}

#[test]
fn only_one_thread_wins_a_device() {
    let registry = Arc::new(DeviceRegistry::from_devices(&config().devices));
    let threads: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.try_acquire(PRESS))
        })
        .collect();
    let wins = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
    assert!(!registry.get(PRESS).unwrap().available);
    assert!(registry.get(LATHE).unwrap().available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_a_single_run() {
    let plc = SimulatedPlc::default().with_actuators(['A']);
    plc.jam("Cylinder_A_Extend");
    let engine = engine_with(&[(PRESS, &plc)]);

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start("A+,A-", PRESS) })
        })
        .collect();

    let mut handles = Vec::new();
    let mut busy = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(RuntimeError::DeviceBusy(device)) => {
                assert_eq!(device, PRESS);
                busy += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(busy, 7);

    engine.registry().request_stop(PRESS).unwrap();
    let report = handles.pop().unwrap().wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert!(engine.registry().get(PRESS).unwrap().available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn devices_run_independently() {
    let press = SimulatedPlc::new(Duration::from_millis(2)).with_actuators(['A', 'B']);
    let lathe = SimulatedPlc::new(Duration::from_millis(2)).with_actuators(['A', 'B']);
    let engine = engine_with(&[(PRESS, &press), (LATHE, &lathe)]);

    let first = engine.start("A+,B+,[A-,A+]^3,(A-,B-)", PRESS).unwrap();
    let second = engine.start("B+,B-", LATHE).unwrap();
    assert_ne!(first.run_id(), second.run_id());

    let (first, second) = tokio::join!(first.wait(), second.wait());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.device, PRESS);
    assert_eq!(first.actuation_writes, 9);
    assert_eq!(second.device, LATHE);
    assert_eq!(second.actuation_writes, 2);

    for record in engine.registry().list_devices() {
        assert!(record.available);
        assert!(record.last_started.is_some());
    }
}

#[tokio::test]
async fn finished_device_can_run_again() {
    let plc = SimulatedPlc::default().with_actuators(['A']);
    let engine = engine_with(&[(PRESS, &plc)]);
    let first = engine.run("A+,A-", PRESS).await.unwrap();
    let second = engine.run("A+,0.05S,A-", PRESS).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.outcome, RunOutcome::Completed);
    // seed, initialise and two actuations per run
    assert_eq!(plc.write_count(), 8);
}

#[tokio::test]
async fn unknown_device_is_rejected() {
    let engine = engine_with(&[]);
    let err = engine.run("A+,A-", "10.0.0.1").await.unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownDevice(ref address) if address == "10.0.0.1"));
    assert!(err.is_rejection());
}

#[tokio::test]
async fn invalid_sequence_never_touches_the_device() {
    let plc = SimulatedPlc::default().with_actuators(['A']);
    let engine = engine_with(&[(PRESS, &plc)]);
    let err = engine.run("A+,A-)", PRESS).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Sequence(_)));
    assert_eq!(plc.write_count(), 0);
    assert_eq!(plc.open_sessions(), 0);
    assert!(engine.registry().get(PRESS).unwrap().available);
}

#[tokio::test]
async fn stop_on_idle_device_is_harmless() {
    let plc = SimulatedPlc::default().with_actuators(['A']);
    let engine = engine_with(&[(PRESS, &plc)]);
    engine.registry().request_stop(PRESS).unwrap();
    assert!(!engine.registry().is_stop_requested(PRESS));
    let report = engine.run("A+,A-", PRESS).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}
