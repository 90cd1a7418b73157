//! Wire frames exchanged with the relay
//!
//! Every frame is a JSON text message. Outbound requests are
//! `control_command` frames addressed to one terminal; inbound frames are
//! either `control_response` frames (possibly tagged with the correlation id
//! of the request they answer) or unsolicited push frames such as periodic
//! state reports. The relay sometimes wraps an inbound frame in a
//! `{ "message": ... }` envelope, in which case the inner value may itself be
//! a JSON-encoded string.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ControlError, Result};
use crate::types::{CorrelationId, DeviceTarget};

/// Frame type of every outbound request
pub const CONTROL_COMMAND: &str = "control_command";

/// Frame type of every correlated or uncorrelated response
pub const CONTROL_RESPONSE: &str = "control_response";

/// Wire name of the correlation identifier
pub const CORRELATION_FIELD: &str = "frontend_request_id";

// ----------------------------------------------------------------------------
// Outbound Frames
// ----------------------------------------------------------------------------

/// A command addressed to one terminal through the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sn")]
    pub device_serial: String,
    #[serde(rename = "ip")]
    pub device_address: String,
    #[serde(rename = "port")]
    pub device_port: u16,
    pub module: String,
    pub payload: Value,
    #[serde(
        rename = "frontend_request_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
}

impl ControlCommand {
    /// Build a command for `target`
    pub fn new(
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            kind: CONTROL_COMMAND.to_string(),
            device_serial: target.serial.clone(),
            device_address: target.address.clone(),
            device_port: target.port,
            module: module.into(),
            payload,
            correlation_id,
        }
    }

    /// Encode as a text frame
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ----------------------------------------------------------------------------
// Inbound Frames
// ----------------------------------------------------------------------------

/// A parsed inbound frame before routing
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Value of the `type` field
    pub kind: String,
    /// Correlation identifier echoed by the relay, if any
    pub correlation_id: Option<CorrelationId>,
    /// The unwrapped frame object
    pub body: Value,
}

impl InboundFrame {
    /// Parse a raw text frame, unwrapping the relay envelope if present
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Route an already decoded JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        let object = unwrap_envelope(value)?;

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::invalid_frame("frame has no type field"))?
            .to_string();

        let correlation_id = match object.get(CORRELATION_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => {
                Some(CorrelationId::from_string(id.clone()))
            }
            _ => None,
        };

        Ok(Self {
            kind,
            correlation_id,
            body: Value::Object(object),
        })
    }

    /// Whether this frame answers a control command
    pub fn is_response(&self) -> bool {
        self.kind == CONTROL_RESPONSE
    }
}

fn unwrap_envelope(value: Value) -> Result<Map<String, Value>> {
    let Value::Object(mut object) = value else {
        return Err(ControlError::invalid_frame("frame is not a JSON object"));
    };

    if object.contains_key("type") {
        return Ok(object);
    }

    match object.remove("message") {
        Some(Value::Object(inner)) => Ok(inner),
        Some(Value::String(encoded)) => match serde_json::from_str(&encoded)? {
            Value::Object(inner) => Ok(inner),
            _ => Err(ControlError::invalid_frame(
                "envelope message is not a JSON object",
            )),
        },
        _ => Err(ControlError::invalid_frame("frame has no type field")),
    }
}

// ----------------------------------------------------------------------------
// Control Responses
// ----------------------------------------------------------------------------

/// Result of a control command as reported by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(
        rename = "frontend_request_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ControlResponse {
    /// Decode the response carried by an inbound frame
    pub fn from_frame(frame: &InboundFrame) -> Result<Self> {
        Ok(Self::deserialize(&frame.body)?)
    }

    /// Build a successful response (used by relays and tests)
    pub fn ok(module: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: None,
            module: module.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build a failed response (used by relays and tests)
    pub fn failed(module: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            module: module.into(),
            success: false,
            data: None,
            error: Some(Value::String(error.into())),
        }
    }

    /// Attach the correlation identifier being answered
    pub fn answering(mut self, correlation_id: &CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id.clone());
        self
    }

    /// Encode as an inbound text frame
    pub fn to_frame(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(object) = &mut value {
            object.insert(
                "type".to_string(),
                Value::String(CONTROL_RESPONSE.to_string()),
            );
        }
        Ok(value.to_string())
    }

    /// Progress percentage reported by the relay, if any
    pub fn progress(&self) -> Option<u8> {
        let raw = self.data.as_ref()?.get("progress")?;
        let value = match raw {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(value.round().min(100.0) as u8)
    }

    /// Terminal-level result code inside `data.result` (`0` = success)
    pub fn result_code(&self) -> Option<i64> {
        match self.data.as_ref()?.get("result")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether both the relay and the terminal report success
    pub fn is_terminal_success(&self) -> bool {
        self.success && self.result_code().map_or(true, |code| code == 0)
    }

    /// Human readable failure description
    pub fn error_message(&self) -> String {
        let from_data = self
            .data
            .as_ref()
            .and_then(|data| data.get("error"))
            .map(describe);
        match (&self.error, from_data) {
            (Some(error), _) => describe(error),
            (None, Some(error)) => error,
            (None, None) => match self.result_code() {
                Some(code) if code != 0 => format!("terminal returned result {}", code),
                _ => "no error description".to_string(),
            },
        }
    }

    /// Convert into the response data, turning any reported failure into
    /// [`ControlError::RemoteFailure`]
    pub fn into_result(self) -> Result<Value> {
        if self.is_terminal_success() {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(ControlError::RemoteFailure {
                reason: self.error_message(),
                module: self.module,
            })
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Push Frames
// ----------------------------------------------------------------------------

/// An inbound frame not claimed by any pending request
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    /// Value of the `type` field
    pub kind: String,
    /// Serial of the terminal the frame concerns, if any
    pub device_serial: Option<String>,
    /// The unwrapped frame object
    pub body: Value,
}

impl PushFrame {
    /// Payload under `data`, if present
    pub fn data(&self) -> Option<&Value> {
        self.body.get("data")
    }
}

impl From<InboundFrame> for PushFrame {
    fn from(frame: InboundFrame) -> Self {
        let device_serial = frame
            .body
            .get("sn")
            .and_then(Value::as_str)
            .or_else(|| {
                frame
                    .body
                    .get("data")
                    .and_then(|data| data.get("sn"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);

        Self {
            kind: frame.kind,
            device_serial,
            body: frame.body,
        }
    }
}

// ----------------------------------------------------------------------------
// Chunked Transfer Payloads
// ----------------------------------------------------------------------------

/// Payload of `upload_file_init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInitPayload {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub total_size: u64,
    pub total_chunks: u32,
}

/// Payload of `upload_file_chunk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkPayload {
    pub file_id: String,
    pub chunk_index: u32,
    /// Base64 (standard alphabet) encoded chunk bytes
    pub chunk_data: String,
}

/// Payload of `upload_file_complete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCompletePayload {
    pub file_id: String,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
