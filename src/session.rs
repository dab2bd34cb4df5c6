//! QMP session
//!
//! A [`Session`] owns one connection, negotiates capabilities once, and then
//! separates the byte stream into command responses and buffered events.
//!
//! Only one command may be outstanding at a time. Responses are matched to
//! commands by arrival order; any event read while a response is awaited is
//! queued for later consumption.

mod async_session;
mod events;
mod handshake;

pub use async_session::AsyncSession;
pub use events::EventQueue;
pub use handshake::HandshakeState;

use crate::endpoint::{self, Endpoint};
use crate::error::{QmpError, Result};
use crate::protocol::{Command, Event, Greeting, Message, MessageKind, Response};
use crate::transport::{Connection, Frame, Role};
use handshake::Handshake;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tunables for library callers
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Upper bound for any single blocking read; `None` waits forever
    pub read_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// A decoded line, sorted by the path that consumes it
enum Incoming {
    Event(Event),
    Response(Response),
    Other(Message),
}

fn classify(message: Message) -> Result<Incoming> {
    match message.kind() {
        MessageKind::Event => message.into_event().map(Incoming::Event),
        MessageKind::Response => message.into_response().map(Incoming::Response),
        _ => Ok(Incoming::Other(message)),
    }
}

fn unexpected(context: &str, message: Message) -> QmpError {
    QmpError::ProtocolViolation(format!("unexpected message {context}: {}", Value::from(message)))
}

fn hmp_output(value: Value) -> Result<String> {
    match value {
        Value::String(output) => Ok(output),
        other => Err(QmpError::ProtocolViolation(format!(
            "human-monitor-command returned {other}"
        ))),
    }
}

fn hmp_command(command_line: &str) -> Command {
    Command::new("human-monitor-command").with_arguments(json!({ "command-line": command_line }))
}

/// Blocking QMP session
pub struct Session {
    conn: Connection,
    events: EventQueue,
    handshake: Handshake,
    in_flight: bool,
    peer_closed: bool,
}

impl Session {
    /// Resolve, connect and negotiate capabilities in one call
    pub fn connect(address: &str) -> Result<Self> {
        Self::connect_with(address, &SessionOptions::default())
    }

    pub fn connect_with(address: &str, options: &SessionOptions) -> Result<Self> {
        let endpoint = endpoint::resolve(address)?;
        let mut session = Self::open_with(endpoint, options)?;
        session.negotiate()?;
        Ok(session)
    }

    /// Connect without negotiating; call [`Session::negotiate`] before any command
    pub fn open(endpoint: Endpoint) -> Result<Self> {
        Self::open_with(endpoint, &SessionOptions::default())
    }

    pub fn open_with(endpoint: Endpoint, options: &SessionOptions) -> Result<Self> {
        let mut conn = Connection::new(endpoint, Role::Client);
        conn.set_read_timeout(options.read_timeout)?;
        conn.connect()?;
        Ok(Self::from_connection(conn))
    }

    /// Listen on the endpoint and wait for the monitor to connect to us.
    ///
    /// Capabilities still have to be negotiated afterwards.
    pub fn accept(endpoint: Endpoint) -> Result<Self> {
        let mut conn = Connection::new(endpoint, Role::Server);
        conn.listen_and_accept()?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap a connection opened by the caller
    pub fn from_connection(conn: Connection) -> Self {
        let connected = conn.is_connected();
        Self {
            conn,
            events: EventQueue::new(),
            handshake: Handshake::new(connected),
            in_flight: false,
            peer_closed: false,
        }
    }

    /// Read the greeting and negotiate capabilities
    pub fn negotiate(&mut self) -> Result<()> {
        self.handshake.begin()?;
        self.conn.set_blocking(true)?;

        let read = self.conn.read_line();
        self.handshake.on_greeting(read)?;

        if let Err(e) = self.conn.write_message(&Command::capabilities()) {
            self.handshake.fail();
            return Err(e);
        }

        loop {
            let read = self.conn.read_line();
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

    /// True for Unix sockets, which could carry file descriptors
    pub fn is_local(&self) -> bool {
        self.conn.is_local()
    }

    /// True while a command was sent but its response never arrived
    pub fn is_command_pending(&self) -> bool {
        self.in_flight
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_read_timeout(timeout)
    }

    /// Send a command and return the raw response, error responses included
    pub fn command(&mut self, command: &Command) -> Result<Response> {
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

        self.conn.set_blocking(true)?;
        self.conn.write_message(command)?;
        self.in_flight = true;

        loop {
            match self.read_frame()? {
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

    /// Execute a command and return its `return` payload
    pub fn execute(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut command = Command::new(name);
        command.arguments = arguments;
        self.command(&command)?.into_result()
    }

    /// Run a human monitor command line and return its text output
    pub fn human_monitor_command(&mut self, command_line: &str) -> Result<String> {
        hmp_output(self.command(&hmp_command(command_line))?.into_result()?)
    }

    /// Move every event that has already arrived into the queue, without blocking
    pub fn drain_pending(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.peer_closed {
            return Ok(());
        }

        self.conn.set_blocking(false)?;
        let result = self.drain_available();
        self.conn.set_blocking(true)?;
        result
    }

    /// Take the oldest event.
    ///
    /// Without `wait`, only events that already arrived are considered and `None`
    /// means there are none. With `wait`, block until one arrives.
    pub fn pop_event(&mut self, wait: bool) -> Result<Option<Event>> {
        self.ensure_open()?;
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }

        if !wait {
            self.drain_pending()?;
            return match self.events.pop_front() {
                Some(event) => Ok(Some(event)),
                None if self.peer_closed => Err(QmpError::ConnectionClosed),
                None => Ok(None),
            };
        }

        self.read_event(None).map(Some)
    }

    /// Take the oldest event, waiting at most `timeout` for one to arrive
    pub fn wait_event(&mut self, timeout: Duration) -> Result<Event> {
        self.next_event(Some(timeout))
    }

    /// Take the oldest event, waiting for one to arrive.
    ///
    /// With a timeout, expiry yields [`QmpError::Timeout`] and the session stays usable.
    pub fn next_event(&mut self, timeout: Option<Duration>) -> Result<Event> {
        self.ensure_open()?;
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        self.read_event(timeout.map(|t| Instant::now() + t))
    }

    /// Take the oldest event called `name`, waiting for it if necessary.
    ///
    /// Other events read while waiting stay queued in arrival order.
    pub fn event_wait(&mut self, name: &str, timeout: Option<Duration>) -> Result<Event> {
        self.ensure_open()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        self.drain_pending()?;
        if let Some(event) = self.events.take_named(name) {
            return Ok(event);
        }

        loop {
            let event = self.read_event(deadline)?;
            if event.name == name {
                return Ok(event);
            }
            self.events.push(event);
        }
    }

    /// Snapshot of queued events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.events.snapshot()
    }

    /// Drain pending events, optionally wait for one, and return the queue snapshot
    pub fn get_events(&mut self, wait: bool) -> Result<Vec<Event>> {
        self.drain_pending()?;
        if wait && self.events.is_empty() {
            let event = self.read_event(None)?;
            self.events.push(event);
        }
        Ok(self.events.snapshot())
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn close(&mut self) {
        self.conn.close();
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

    fn read_frame(&mut self) -> Result<Frame> {
        let frame = self.conn.read_line()?;
        if matches!(frame, Frame::Closed) {
            self.peer_closed = true;
        }
        Ok(frame)
    }

    fn drain_available(&mut self) -> Result<()> {
        loop {
            match self.read_frame()? {
                Frame::NotReady | Frame::Closed => return Ok(()),
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
    }

    /// Block until one event arrives, optionally bounded by a deadline
    fn read_event(&mut self, deadline: Option<Instant>) -> Result<Event> {
        if self.peer_closed {
            return Err(QmpError::ConnectionClosed);
        }
        self.conn.set_blocking(true)?;

        let original = self.conn.read_timeout();
        let result = self.read_event_until(deadline);
        if deadline.is_some() {
            let restored = self.conn.set_read_timeout(original);
            let event = result?;
            restored?;
            return Ok(event);
        }
        result
    }

    fn read_event_until(&mut self, deadline: Option<Instant>) -> Result<Event> {
        loop {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(QmpError::Timeout);
                }
                self.conn.set_read_timeout(Some(remaining))?;
            }

            match self.read_frame()? {
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
