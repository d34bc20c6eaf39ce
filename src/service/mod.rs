//! NDJSON request service.
//!
//! Translates newline-delimited JSON commands into calls on the validator,
//! compiler, fault injector and runtime engine. This is the dispatcher an HTTP
//! front end calls into; `seqctl-cli serve` exposes it over stdio. Requests on
//! one connection are processed in order. Sequence and device problems are
//! reported inside `result` as `{status, msg}` documents; only malformed
//! requests produce an `error` envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::PROTOCOL_VERSION;
use crate::compiler::{CompileError, FaultInjector, Tier, compile};
use crate::runtime::{Engine, ProjectStore, RuntimeError};
use crate::sequence::{ComponentId, inventory, parse_sequence, validate};
use crate::tags::ProjectConfig;

const RUN_STARTED: &str = "PLC execution started!";
const DEVICE_BUSY: &str = "Chosen PLC is currently busy!";
const DEVICE_NOT_FOUND: &str = "PLC not found!";
const STOP_SENT: &str = "PLC stop signal sent!";

/// Errors that reject a request outright.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request line was not valid JSON
    #[error("{0}")]
    Parse(String),
    /// Parameters missing or malformed
    #[error("{0}")]
    InvalidParams(String),
    /// Unknown command
    #[error("Command '{0}' is not supported")]
    Unsupported(String),
    /// Handshake missing or mismatched
    #[error("{0}")]
    Protocol(String),
    /// Storage or runtime failure
    #[error("{0}")]
    Runtime(String),
}

impl ServiceError {
    fn invalid_param(name: &str) -> Self {
        ServiceError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Runtime(format!("{:#}", err))
    }
}

/// Service entry point: wraps an [`Engine`] and optional project store.
pub struct Service {
    engine: Engine,
    projects: Option<ProjectStore>,
    fault_seed: Option<u64>,
}

impl Service {
    /// Create a new service around the provided engine.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            projects: None,
            fault_seed: None,
        }
    }

    /// Resolve `project_id` parameters against `store`.
    pub fn with_projects(mut self, store: ProjectStore) -> Self {
        self.projects = Some(store);
        self
    }

    /// Seed fault injection so generated variants are reproducible.
    pub fn with_fault_seed(mut self, seed: u64) -> Self {
        self.fault_seed = Some(seed);
        self
    }

    /// Engine backing `run` and `stop`.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Process a single connection by consuming requests from the reader and
    /// writing responses.
    pub async fn handle<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Session::new(self, writer).run(reader).await
    }
}

struct Session<'a, W> {
    service: &'a Service,
    writer: W,
    handshake_completed: bool,
}

impl<'a, W: AsyncWrite + Unpin> Session<'a, W> {
    fn new(service: &'a Service, writer: W) -> Self {
        Self {
            service,
            writer,
            handshake_completed: false,
        }
    }

    async fn run<R: AsyncBufRead + Unpin>(&mut self, reader: R) -> io::Result<()> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(request) => self.handle_request(request),
                Err(err) => {
                    ResponseEnvelope::from_error(Value::Null, ServiceError::Parse(err.to_string()))
                }
            };
            self.write_response(response).await?;
        }
        Ok(())
    }

    async fn write_response(&mut self, envelope: ResponseEnvelope) -> io::Result<()> {
        let mut data = serde_json::to_vec(&envelope)?;
        data.push(b'\n');
        self.writer.write_all(&data).await?;
        self.writer.flush().await
    }

    fn handle_request(&mut self, request: RequestEnvelope) -> ResponseEnvelope {
        debug!(command = %request.command, "request");
        match self.dispatch(&request.command, &request.params) {
            Ok(value) => ResponseEnvelope::success(request.id, value),
            Err(err) => {
                warn!(command = %request.command, error = %err, "request rejected");
                ResponseEnvelope::from_error(request.id, err)
            }
        }
    }

    fn dispatch(&mut self, command: &str, params: &Value) -> Result<Value, ServiceError> {
        if command == "handshake" {
            return self.cmd_handshake(params);
        }
        self.ensure_handshake()?;
        match command {
            "validate" => cmd_validate(params),
            "generate" => self.cmd_generate(params),
            "components" => self.cmd_components(params),
            "run" => self.cmd_run(params),
            "stop" => self.cmd_stop(params),
            "list_devices" => Ok(json!({
                "devices": self.service.engine.registry().list_devices(),
            })),
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn cmd_handshake(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let client = str_param(params, "client")?;
        let requested = str_param(params, "protocol_version")?;
        if requested != PROTOCOL_VERSION {
            return Err(ServiceError::Protocol(format!(
                "unsupported protocol version: expected {}, got {}",
                PROTOCOL_VERSION, requested
            )));
        }

        self.handshake_completed = true;
        Ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "runtime": {
                "version": crate::VERSION,
                "client": client,
                "features": ["validate", "generate", "components", "run", "stop", "list_devices"],
            }
        }))
    }

    fn ensure_handshake(&self) -> Result<(), ServiceError> {
        if self.handshake_completed {
            Ok(())
        } else {
            Err(ServiceError::Protocol(
                "handshake required before issuing commands".into(),
            ))
        }
    }

    fn project(&self, params: &Value) -> Result<Option<ProjectConfig>, ServiceError> {
        let Some(id) = params.get("project_id").and_then(Value::as_str) else {
            return Ok(None);
        };
        match &self.service.projects {
            Some(store) => Ok(store.load(id)?),
            None => Ok(None),
        }
    }

    fn cmd_generate(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let source = str_param(params, "sequence")?;
        let errors_spec = params
            .get("errors_spec")
            .and_then(Value::as_str)
            .unwrap_or("0,none");
        let tier = Tier::parse_errors_spec(errors_spec)
            .map_err(|err| ServiceError::InvalidParams(err.to_string()))?;
        let config = self.project(params)?;

        let sequence = match parse_sequence(source) {
            Ok(sequence) => sequence,
            Err(diagnostics) => return Ok(error_list(diagnostics.messages())),
        };
        let program = match compile(&sequence, config.as_ref()) {
            Ok(program) => program,
            Err(err) => return Ok(compile_failure(&err)),
        };

        let mut msg = json!({ "code": program.code() });
        if let Some(tier) = tier {
            let mut injector = match self.service.fault_seed {
                Some(seed) => FaultInjector::seeded(seed),
                None => FaultInjector::from_entropy(),
            };
            let faulted = injector.inject(&program.body_lines(), tier, &sequence.actuator_labels());
            debug!(tier = %tier, faults = faulted.faults.len(), "generated faulted variant");
            msg["incorrect"] = Value::String(faulted.code());
        }
        if config.is_none() {
            msg["tags"] = Value::String(program.tag_table_xml());
        }
        Ok(json!({ "status": "OK", "msg": msg }))
    }

    fn cmd_components(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let source = str_param(params, "sequence")?;
        let config = self.project(params)?;
        let sequence = match parse_sequence(source) {
            Ok(sequence) => sequence,
            Err(diagnostics) => return Ok(error_list(diagnostics.messages())),
        };

        let required = inventory(&sequence);
        let missing: Vec<ComponentId> = config
            .as_ref()
            .map(|config| config.missing(&required))
            .unwrap_or_else(|| required.iter().map(|c| c.id).collect());
        let (unassigned, assigned): (Vec<_>, Vec<_>) = required
            .iter()
            .partition(|component| missing.contains(&component.id));

        Ok(json!({
            "status": "OK",
            "components": required,
            "assigned": assigned.iter().map(|c| c.id.label()).collect::<Vec<_>>(),
            "unassigned": unassigned.iter().map(|c| c.id.label()).collect::<Vec<_>>(),
        }))
    }

    fn cmd_run(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let source = str_param(params, "sequence")?;
        let device = str_param(params, "device_address")?;
        match self.service.engine.start(source, device) {
            Ok(handle) => {
                info!(device, run_id = %handle.run_id(), "run accepted");
                Ok(json!({
                    "status": "OK",
                    "msg": RUN_STARTED,
                    "run_id": handle.run_id(),
                }))
            }
            Err(err) => Ok(run_failure(&err)),
        }
    }

    fn cmd_stop(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let device = str_param(params, "device_address")?;
        match self.service.engine.registry().request_stop(device) {
            Ok(()) => Ok(json!({ "status": "OK", "msg": STOP_SENT })),
            Err(err) => Ok(run_failure(&err)),
        }
    }
}

fn cmd_validate(params: &Value) -> Result<Value, ServiceError> {
    let source = str_param(params, "sequence")?;
    let errors = validate(source);
    Ok(json!({ "valid": errors.is_empty(), "errors": errors }))
}

fn str_param<'v>(params: &'v Value, name: &str) -> Result<&'v str, ServiceError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_param(name))
}

fn error_list(messages: &[String]) -> Value {
    json!({ "status": "Error", "msg": messages })
}

fn compile_failure(err: &CompileError) -> Value {
    match err {
        CompileError::Invalid(diagnostics) => error_list(diagnostics.messages()),
        err if err.is_retraction() => json!({
            "status": "Error",
            "msg": err.to_string(),
            "retraction": true,
        }),
        err => json!({ "status": "Error", "msg": err.to_string() }),
    }
}

fn run_failure(err: &RuntimeError) -> Value {
    match err {
        RuntimeError::Sequence(diagnostics) => error_list(diagnostics.messages()),
        RuntimeError::DeviceBusy(_) => json!({ "status": "Error", "msg": DEVICE_BUSY }),
        RuntimeError::UnknownDevice(_) => json!({ "status": "Error", "msg": DEVICE_NOT_FOUND }),
        err => json!({ "status": "Error", "msg": err.to_string() }),
    }
}

#[derive(Deserialize)]
struct RequestEnvelope {
    id: Value,
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, error: ServiceError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
}

impl From<ServiceError> for ErrorEnvelope {
    fn from(error: ServiceError) -> Self {
        let code = match &error {
            ServiceError::Parse(_) => "parse_error",
            ServiceError::InvalidParams(_) => "invalid_params",
            ServiceError::Unsupported(_) => "unsupported_command",
            ServiceError::Protocol(_) => "protocol_error",
            ServiceError::Runtime(_) => "runtime_error",
        };
        ErrorEnvelope {
            code: code.into(),
            message: error.to_string(),
        }
    }
}
