//! Field-protocol abstraction
//!
//! The runtime talks to controllers through these traits: a connector opens a
//! client for an endpoint, the client opens sessions, and a session reads and
//! writes named tags. Any OPC- or Modbus-style transport can sit behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{ProtocolError, ProtocolResult};

/// Value held by a controller tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum TagValue {
    /// Boolean coil or sensor.
    Bool(bool),
    /// 16-bit integer variable.
    Int16(i16),
}

impl TagValue {
    /// Protocol type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            TagValue::Bool(_) => "Boolean",
            TagValue::Int16(_) => "Int16",
        }
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(value) => Some(*value),
            TagValue::Int16(_) => None,
        }
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i16> {
        match self {
            TagValue::Int16(value) => Some(*value),
            TagValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(value) => write!(f, "{}", value),
            TagValue::Int16(value) => write!(f, "{}", value),
        }
    }
}

/// One entry of a combined write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWrite {
    /// Physical tag name.
    pub name: String,
    /// Value to store.
    pub value: TagValue,
}

impl TagWrite {
    /// Boolean write.
    pub fn bool(name: impl Into<String>, value: bool) -> Self {
        Self {
            name: name.into(),
            value: TagValue::Bool(value),
        }
    }

    /// Integer write.
    pub fn int16(name: impl Into<String>, value: i16) -> Self {
        Self {
            name: name.into(),
            value: TagValue::Int16(value),
        }
    }
}

/// Endpoint URL for a controller address.
pub fn endpoint(address: &str, port: u16) -> String {
    format!("opc.tcp://{}:{}", address, port)
}

/// Opens clients for endpoints.
#[async_trait]
pub trait FieldConnector: Send + Sync {
    /// Connect to `endpoint`.
    async fn connect(&self, endpoint: &str) -> ProtocolResult<Box<dyn FieldClient>>;
}

/// Connected controller.
#[async_trait]
pub trait FieldClient: Send {
    /// Open a read/write session.
    async fn create_session(&mut self) -> ProtocolResult<Box<dyn FieldSession>>;

    /// Drop the connection.
    async fn disconnect(&mut self) -> ProtocolResult<()>;
}

/// Read/write session on a controller.
#[async_trait]
pub trait FieldSession: Send {
    /// Apply all writes as one request.
    async fn write_tags(&mut self, writes: &[TagWrite]) -> ProtocolResult<()>;

    /// Read one tag.
    async fn read_tag(&mut self, name: &str) -> ProtocolResult<TagValue>;

    /// End the session.
    async fn close_session(&mut self) -> ProtocolResult<()>;

    /// Read a boolean tag.
    async fn read_bool(&mut self, name: &str) -> ProtocolResult<bool> {
        self.read_tag(name)
            .await?
            .as_bool()
            .ok_or_else(|| ProtocolError::TypeMismatch {
                tag: name.to_string(),
                expected: "Boolean",
            })
    }

    /// Read an integer tag.
    async fn read_int(&mut self, name: &str) -> ProtocolResult<i16> {
        self.read_tag(name)
            .await?
            .as_int()
            .ok_or_else(|| ProtocolError::TypeMismatch {
                tag: name.to_string(),
                expected: "Int16",
            })
    }
}
