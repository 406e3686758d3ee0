//! Request and response envelopes.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors produced while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope is missing a string id")]
    MissingId,

    #[error("envelope carries both result and error")]
    Ambiguous,

    #[error("envelope carries neither result nor error")]
    Empty,

    #[error("error field must be a string")]
    ErrorNotString,
}

/// Request sent from the supervisor to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

/// Request accepted on the supervisor's control socket.
///
/// Same shape as [`Request`] plus the external identity the call is made for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: String,
    pub identity: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

/// Either the result of a request or the application error it produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(String),
}

/// Response sent back for a single request.
///
/// On the wire exactly one of `result` or `error` is present; a `null`
/// result is still a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub outcome: Outcome,
}

impl Response {
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Convert into a plain `Result`, consuming the envelope.
    pub fn into_result(self) -> Result<Value, String> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(message) => Err(message),
        }
    }

    /// Parse a single line (without its trailing newline) as a response.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for Response {
    type Error = FrameError;

    fn try_from(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut map) = value else {
            return Err(FrameError::NotAnObject);
        };

        let id = match map.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Err(FrameError::MissingId),
        };

        let outcome = match (map.remove("result"), map.remove("error")) {
            (Some(_), Some(_)) => return Err(FrameError::Ambiguous),
            (Some(result), None) => Outcome::Result(result),
            (None, Some(Value::String(message))) => Outcome::Error(message),
            (None, Some(_)) => return Err(FrameError::ErrorNotString),
            (None, None) => return Err(FrameError::Empty),
        };

        Ok(Self { id, outcome })
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Outcome::Result(value) => map.serialize_entry("result", value)?,
            Outcome::Error(message) => map.serialize_entry("error", message)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Response::try_from(value).map_err(de::Error::custom)
    }
}
