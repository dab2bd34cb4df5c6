//! Greeting and capabilities negotiation
//!
//! The state machine is I/O free: sessions feed it the outcome of each read so the
//! sync and async sessions share the same rules.

use crate::error::{QmpError, Result};
use crate::protocol::{Event, Greeting, MessageKind, Response};
use crate::transport::Frame;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connected,
    Negotiating,
    Ready,
    /// Negotiation failed; the session can only be closed
    Failed,
}

#[derive(Debug)]
pub(crate) struct Handshake {
    state: HandshakeState,
    greeting: Option<Greeting>,
}

impl Handshake {
    pub fn new(connected: bool) -> Self {
        Self {
            state: if connected {
                HandshakeState::Connected
            } else {
                HandshakeState::Disconnected
            },
            greeting: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Check that negotiation may start; it runs at most once per session
    pub fn begin(&self) -> Result<()> {
        match self.state {
            HandshakeState::Connected => Ok(()),
            HandshakeState::Disconnected => Err(QmpError::Handshake(
                "connection is not established".to_string(),
            )),
            HandshakeState::Negotiating | HandshakeState::Ready => Err(
                QmpError::ProtocolViolation("capabilities already negotiated".to_string()),
            ),
            HandshakeState::Failed => Err(QmpError::Handshake(
                "a previous negotiation failed".to_string(),
            )),
        }
    }

    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }

    /// Consume the first line read after connecting
    pub fn on_greeting(&mut self, read: Result<Frame>) -> Result<()> {
        let result = Self::parse_greeting(read);
        match result {
            Ok(greeting) => {
                self.greeting = Some(greeting);
                self.state = HandshakeState::Negotiating;
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Consume a line read while waiting for the `qmp_capabilities` reply.
    ///
    /// Returns an event that arrived before the reply, or `None` once the session is ready.
    pub fn on_reply(&mut self, read: Result<Frame>) -> Result<Option<Event>> {
        let result = Self::parse_reply(read);
        match &result {
            Ok(None) => self.state = HandshakeState::Ready,
            Ok(Some(_)) => {}
            Err(_) => self.fail(),
        }
        result
    }

    fn parse_greeting(read: Result<Frame>) -> Result<Greeting> {
        let message = match read {
            Ok(Frame::Message(message)) => message,
            Ok(Frame::Closed) => {
                return Err(QmpError::Handshake(
                    "connection closed before the greeting".to_string(),
                ));
            }
            Ok(Frame::NotReady) => {
                return Err(QmpError::Handshake("no greeting available".to_string()));
            }
            Err(QmpError::MalformedMessage { line, reason }) => {
                return Err(QmpError::Handshake(format!(
                    "malformed greeting {line:?}: {reason}"
                )));
            }
            Err(QmpError::Timeout) => {
                return Err(QmpError::Handshake(
                    "timed out waiting for the greeting".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        if message.kind() != MessageKind::Greeting {
            return Err(QmpError::Handshake(format!(
                "expected a greeting, got {}",
                Value::from(message)
            )));
        }
        message
            .into_greeting()
            .map_err(|e| QmpError::Handshake(e.to_string()))
    }

    fn parse_reply(read: Result<Frame>) -> Result<Option<Event>> {
        let message = match read {
            Ok(Frame::Message(message)) => message,
            Ok(Frame::Closed) => {
                return Err(QmpError::Capabilities(
                    "connection closed during negotiation".to_string(),
                ));
            }
            Ok(Frame::NotReady) => {
                return Err(QmpError::Capabilities("no reply available".to_string()));
            }
            Err(QmpError::MalformedMessage { line, reason }) => {
                return Err(QmpError::Capabilities(format!(
                    "malformed reply {line:?}: {reason}"
                )));
            }
            Err(QmpError::Timeout) => {
                return Err(QmpError::Capabilities(
                    "timed out waiting for the reply".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        match message.kind() {
            MessageKind::Event => message
                .into_event()
                .map(Some)
                .map_err(|e| QmpError::Capabilities(e.to_string())),
            MessageKind::Response => match message.into_response() {
                Ok(Response::Return(_)) => Ok(None),
                Ok(Response::Error(body)) => Err(QmpError::Capabilities(format!(
                    "{}: {}",
                    body.class, body.desc
                ))),
                Err(e) => Err(QmpError::Capabilities(e.to_string())),
            },
            _ => Err(QmpError::Capabilities(format!(
                "unexpected reply {}",
                Value::from(message)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use serde_json::json;

    fn frame(value: Value) -> Result<Frame> {
        Ok(Frame::Message(Message::from_value(value).unwrap()))
    }

    fn greeted() -> Handshake {
        let mut handshake = Handshake::new(true);
        handshake
            .on_greeting(frame(json!({"QMP": {"capabilities": []}})))
            .unwrap();
        handshake
    }

    #[test]
    fn test_happy_path() {
        let mut handshake = Handshake::new(true);
        assert_eq!(handshake.state(), HandshakeState::Connected);
        handshake.begin().unwrap();

        handshake
            .on_greeting(frame(json!({
                "QMP": {"version": {"qemu": {"major": 9, "minor": 0, "micro": 0}}, "capabilities": ["oob"]}
            })))
            .unwrap();
        assert_eq!(handshake.state(), HandshakeState::Negotiating);
        assert_eq!(handshake.greeting().unwrap().version().unwrap().major, 9);

        assert!(handshake.on_reply(frame(json!({"return": {}}))).unwrap().is_none());
        assert!(handshake.is_ready());
        assert!(handshake.begin().is_err());
    }

    #[test]
    fn test_missing_greeting_marker() {
        let mut handshake = Handshake::new(true);
        let err = handshake
            .on_greeting(frame(json!({"return": {}})))
            .unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(matches!(handshake.begin(), Err(QmpError::Handshake(_))));
    }

    #[test]
    fn test_malformed_greeting() {
        let mut handshake = Handshake::new(true);
        let err = handshake
            .on_greeting(Err(QmpError::malformed(b"QMP?", "expected value")))
            .unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
    }

    #[test]
    fn test_closed_before_greeting() {
        let mut handshake = Handshake::new(true);
        let err = handshake.on_greeting(Ok(Frame::Closed)).unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
    }

    #[test]
    fn test_rejected_capabilities() {
        let mut handshake = greeted();
        let err = handshake
            .on_reply(frame(json!({"error": {"class": "CommandNotFound", "desc": "no"}})))
            .unwrap_err();
        assert!(matches!(err, QmpError::Capabilities(_)));
        assert!(!handshake.is_ready());
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_event_before_reply() {
        let mut handshake = greeted();
        let event = handshake
            .on_reply(frame(json!({"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 0}})))
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "RESUME");
        assert_eq!(handshake.state(), HandshakeState::Negotiating);

        handshake.on_reply(frame(json!({"return": {}}))).unwrap();
        assert!(handshake.is_ready());
    }

    #[test]
    fn test_unexpected_reply() {
        let mut handshake = greeted();
        let err = handshake
            .on_reply(frame(json!({"QMP": {}})))
            .unwrap_err();
        assert!(matches!(err, QmpError::Capabilities(_)));
    }

    #[test]
    fn test_timeout_during_negotiation_is_fatal() {
        let mut handshake = Handshake::new(true);
        let err = handshake.on_greeting(Err(QmpError::Timeout)).unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
        assert!(err.is_fatal());
        assert_eq!(handshake.state(), HandshakeState::Failed);

        let mut handshake = greeted();
        let err = handshake.on_reply(Err(QmpError::Timeout)).unwrap_err();
        assert!(matches!(err, QmpError::Capabilities(_)));
        assert!(err.is_fatal());
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_disconnected_cannot_begin() {
        let handshake = Handshake::new(false);
        assert_eq!(handshake.state(), HandshakeState::Disconnected);
        assert!(handshake.begin().is_err());
    }
}
