//! QMP message model
//!
//! Every line on the wire is a JSON object. Which kind of object it is depends on
//! its marker key: `QMP` for the greeting, `event` for events, `return`/`error`
//! for responses and `execute` for commands.

use crate::error::{QmpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command that must succeed before the monitor accepts anything else
pub const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Greeting,
    Event,
    Response,
    Command,
    Unknown,
}

/// One decoded line
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap a JSON value, which must be an object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        if self.0.contains_key("QMP") {
            MessageKind::Greeting
        } else if self.0.contains_key("event") {
            MessageKind::Event
        } else if self.0.contains_key("return") || self.0.contains_key("error") {
            MessageKind::Response
        } else if self.0.contains_key("execute") {
            MessageKind::Command
        } else {
            MessageKind::Unknown
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_event(self) -> Result<Event> {
        self.decode("event")
    }

    pub fn into_greeting(self) -> Result<Greeting> {
        self.decode("greeting")
    }

    pub fn into_command(self) -> Result<Command> {
        self.decode("command")
    }

    pub fn into_response(mut self) -> Result<Response> {
        if let Some(value) = self.0.remove("return") {
            return Ok(Response::Return(value));
        }
        match self.0.remove("error") {
            Some(error) => {
                let body: ErrorBody = serde_json::from_value(error.clone()).map_err(|e| {
                    QmpError::MalformedMessage {
                        line: error.to_string(),
                        reason: format!("invalid error body: {e}"),
                    }
                })?;
                Ok(Response::Error(body))
            }
            None => Err(QmpError::ProtocolViolation(format!(
                "expected a response, got {}",
                Value::Object(self.0)
            ))),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(self, what: &str) -> Result<T> {
        let value = Value::Object(self.0);
        serde_json::from_value(value.clone()).map_err(|e| QmpError::MalformedMessage {
            line: value.to_string(),
            reason: format!("invalid {what}: {e}"),
        })
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Object(message.0)
    }
}

/// Command sent from client to monitor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Command {
    pub execute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            execute: name.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Create the capabilities negotiation command
    pub fn capabilities() -> Self {
        Command::new(CAPABILITIES_COMMAND)
    }
}

/// Body of an `error` response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// Reply to exactly one command
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum Response {
    #[serde(rename = "return")]
    Return(Value),
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl Response {
    /// Create a success response
    pub fn ok(value: Value) -> Self {
        Response::Return(value)
    }

    /// Create an error response
    pub fn error(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Response::Error(ErrorBody {
            class: class.into(),
            desc: desc.into(),
        })
    }

    /// Convert a peer reported error into [`QmpError::Command`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Return(value) => Ok(value),
            Response::Error(ErrorBody { class, desc }) => Err(QmpError::Command { class, desc }),
        }
    }
}

/// Event timestamp as sent by the monitor
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = jiff::Timestamp::now();
        Timestamp {
            seconds: now.as_second(),
            microseconds: i64::from(now.subsec_microsecond()),
        }
    }

    /// None when the monitor could not read its clock
    pub fn to_jiff(&self) -> Option<jiff::Timestamp> {
        let nanos = i32::try_from(self.microseconds.checked_mul(1000)?).ok()?;
        jiff::Timestamp::new(self.seconds, nanos).ok()
    }
}

/// Asynchronous notification from the monitor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(name: impl Into<String>, data: Option<Value>) -> Self {
        Event {
            name: name.into(),
            data,
            timestamp: Some(Timestamp::now()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub qemu: QemuVersion,
    #[serde(default)]
    pub package: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct GreetingBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionInfo>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// First message the monitor sends after a connection is established
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

impl Greeting {
    /// Create a greeting announcing the given version
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Greeting {
            qmp: GreetingBody {
                version: Some(VersionInfo {
                    qemu: QemuVersion {
                        major,
                        minor,
                        micro,
                    },
                    package: String::new(),
                }),
                capabilities: Vec::new(),
            },
        }
    }

    pub fn version(&self) -> Option<QemuVersion> {
        self.qmp.version.as_ref().map(|v| v.qemu)
    }
}
