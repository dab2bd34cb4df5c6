//! Async QMP session using tokio
//!
//! Same rules as [`super::Session`]: one negotiation, one outstanding command,
//! events buffered in arrival order. Waiting for an event can be bounded by a
//! timeout, and dropping an `execute` future mid-flight leaves the session
//! refusing further commands until the late response has been drained.

use super::events::EventQueue;
use super::handshake::{Handshake, HandshakeState};
use super::{Incoming, classify, hmp_command, hmp_output, unexpected};
use crate::endpoint::{self, Endpoint};
use crate::error::{QmpError, Result};
use crate::protocol::{Command, Event, Greeting, Response};
use crate::transport::{AsyncConnection, Frame};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

pub struct AsyncSession {
    conn: AsyncConnection,
    events: EventQueue,
    handshake: Handshake,
    in_flight: bool,
    peer_closed: bool,
}

impl AsyncSession {
    /// Resolve, connect and negotiate capabilities in one call
    pub async fn connect(address: &str) -> Result<Self> {
        let endpoint = endpoint::resolve(address)?;
        let mut session = Self::open(endpoint).await?;
        session.negotiate().await?;
        Ok(session)
    }

    /// Connect without negotiating
    pub async fn open(endpoint: Endpoint) -> Result<Self> {
        let conn = AsyncConnection::connect(endpoint).await?;
        Ok(Self {
            conn,
            events: EventQueue::new(),
            handshake: Handshake::new(true),
            in_flight: false,
            peer_closed: false,
        })
    }

    pub async fn negotiate(&mut self) -> Result<()> {
        self.handshake.begin()?;

        let read = self.conn.read_line().await;
        self.handshake.on_greeting(read)?;

        if let Err(e) = self.conn.write_message(&Command::capabilities()).await {
            self.handshake.fail();
            return Err(e);
        }

        loop {
            let read = self.conn.read_line().await;
            match self.handshake.on_reply(read)? {
                Some(event) => self.events.push(event),
                None => break,
            }
        }

        info!("Capabilities negotiated with {}", self.conn.endpoint());
        Ok(())
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_negotiated(&self) -> bool {
        self.handshake.is_ready()
    }

    pub fn greeting(&self) -> Option<&Greeting> {
        self.handshake.greeting()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    pub fn is_local(&self) -> bool {
        self.conn.is_local()
    }

    pub fn is_command_pending(&self) -> bool {
        self.in_flight
    }

    pub async fn command(&mut self, command: &Command) -> Result<Response> {
        self.ensure_open()?;
        if !self.handshake.is_ready() {
            return Err(QmpError::NotNegotiated);
        }
        if self.in_flight {
            return Err(QmpError::CommandPending);
        }
        if self.peer_closed {
            return Err(QmpError::ConnectionClosed);
        }

        // Flag first so a cancelled write is still treated as outstanding
        self.in_flight = true;
        self.conn.write_message(command).await?;

        loop {
            match self.read_frame().await? {
                Frame::Message(message) => match classify(message)? {
                    Incoming::Event(event) => self.events.push(event),
                    Incoming::Response(response) => {
                        self.in_flight = false;
                        return Ok(response);
                    }
                    Incoming::Other(message) => {
                        return Err(unexpected("while awaiting a response", message));
                    }
                },
                Frame::Closed => return Err(QmpError::ConnectionClosed),
                Frame::NotReady => continue,
            }
        }
    }

    pub async fn execute(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut command = Command::new(name);
        command.arguments = arguments;
        self.command(&command).await?.into_result()
    }

    pub async fn human_monitor_command(&mut self, command_line: &str) -> Result<String> {
        hmp_output(self.command(&hmp_command(command_line)).await?.into_result()?)
    }

    /// Queue every event that has already arrived, without waiting
    pub async fn drain_pending(&mut self) -> Result<()> {
        self.ensure_open()?;
        while !self.peer_closed {
            let frame = self.conn.try_read_line().await?;
            match frame {
                Frame::NotReady => break,
                Frame::Closed => self.peer_closed = true,
                Frame::Message(message) => match classify(message)? {
                    Incoming::Event(event) => self.events.push(event),
                    Incoming::Response(response) => {
                        warn!("Discarding response with no command outstanding: {response:?}");
                        self.in_flight = false;
                    }
                    Incoming::Other(message) => {
                        let message = Value::from(message);
                        warn!("Discarding unexpected message: {message}");
                    }
                },
            }
        }
        Ok(())
    }

    /// Take the oldest event that has already arrived
    pub async fn try_event(&mut self) -> Result<Option<Event>> {
        self.ensure_open()?;
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }

        self.drain_pending().await?;
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if self.peer_closed => Err(QmpError::ConnectionClosed),
            None => Ok(None),
        }
    }

    /// Take the oldest event, waiting for one to arrive.
    ///
    /// With a timeout, expiry yields [`QmpError::Timeout`] and the session stays usable.
    pub async fn next_event(&mut self, timeout: Option<Duration>) -> Result<Event> {
        self.ensure_open()?;
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_event())
                .await
                .map_err(|_| QmpError::Timeout)?,
            None => self.read_event().await,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.snapshot()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub async fn close(&mut self) {
        self.conn.close().await;
        self.events.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.conn.is_closed() {
            Err(QmpError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let frame = self.conn.read_line().await?;
        if matches!(frame, Frame::Closed) {
            self.peer_closed = true;
        }
        Ok(frame)
    }

    async fn read_event(&mut self) -> Result<Event> {
        if self.peer_closed {
            return Err(QmpError::ConnectionClosed);
        }

        loop {
            match self.read_frame().await? {
                Frame::Message(message) => match classify(message)? {
                    Incoming::Event(event) => return Ok(event),
                    Incoming::Response(response) if self.in_flight => {
                        warn!("Discarding late response to an abandoned command: {response:?}");
                        self.in_flight = false;
                    }
                    Incoming::Response(response) => {
                        return Err(QmpError::ProtocolViolation(format!(
                            "response {response:?} received while waiting for an event"
                        )));
                    }
                    Incoming::Other(message) => {
                        return Err(unexpected("while waiting for an event", message));
                    }
                },
                Frame::Closed => return Err(QmpError::ConnectionClosed),
                Frame::NotReady => continue,
            }
        }
    }
}
