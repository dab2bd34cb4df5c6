//! Scripted QMP monitor for integration tests.
//!
//! The mock runs on a plain thread using the server role of `Connection` and
//! plays a fixed script against whatever client connects.

#![allow(dead_code)]

use qmpctl::{Command, Connection, Endpoint, Frame, Role};
use serde_json::{Value, json};
use std::thread::JoinHandle;
use std::time::Duration;

pub enum Step {
    /// Write one JSON message
    Send(Value),
    /// Write bytes exactly as given
    SendRaw(Vec<u8>),
    /// Read one command and check its name
    Expect(&'static str),
    /// Read one command and check name and arguments
    ExpectCommand(Command),
    Sleep(Duration),
    /// Shut the connection down immediately
    Close,
}

pub fn greeting() -> Value {
    json!({
        "QMP": {
            "version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": "v8.2.0"},
            "capabilities": ["oob"]
        }
    })
}

pub fn event(name: &str, data: Value) -> Value {
    json!({
        "event": name,
        "data": data,
        "timestamp": {"seconds": 1700000000, "microseconds": 123456}
    })
}

/// Greeting plus a successful capabilities exchange
pub fn handshake() -> Vec<Step> {
    vec![
        Step::Send(greeting()),
        Step::Expect("qmp_capabilities"),
        Step::Send(json!({"return": {}})),
    ]
}

pub fn script(parts: impl IntoIterator<Item = Vec<Step>>) -> Vec<Step> {
    parts.into_iter().flatten().collect()
}

pub struct MockMonitor {
    pub endpoint: Endpoint,
    handle: Option<JoinHandle<()>>,
    _dir: Option<tempfile::TempDir>,
}

impl MockMonitor {
    /// Serve the script on a Unix socket in a fresh temp dir
    pub fn unix(steps: Vec<Step>) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let endpoint = Endpoint::unix(dir.path().join("qmp.sock"));
        let mut conn = Connection::new(endpoint.clone(), Role::Server);
        conn.listen().expect("Failed to listen");

        Self {
            endpoint,
            handle: Some(std::thread::spawn(move || play(conn, steps))),
            _dir: Some(dir),
        }
    }

    /// Serve the script on an ephemeral TCP port
    pub fn tcp(steps: Vec<Step>) -> Self {
        let mut conn = Connection::new(Endpoint::tcp("127.0.0.1", 0), Role::Server);
        conn.listen().expect("Failed to listen");
        let endpoint = conn.local_endpoint().expect("Failed to read bound address");

        Self {
            endpoint,
            handle: Some(std::thread::spawn(move || play(conn, steps))),
            _dir: None,
        }
    }

    pub fn address(&self) -> String {
        self.endpoint.to_string()
    }

    /// Wait for the script to finish, re-raising any assertion failure from the mock
    pub fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("Mock monitor panicked");
        }
    }
}

fn play(mut conn: Connection, steps: Vec<Step>) {
    conn.accept().expect("Failed to accept client");

    for step in steps {
        match step {
            Step::Send(value) => conn.write_message(&value).expect("Failed to send"),
            Step::SendRaw(bytes) => conn.write_raw(&bytes).expect("Failed to send"),
            Step::Expect(name) => {
                let command = read_command(&mut conn);
                assert_eq!(command.execute, name, "Unexpected command");
            }
            Step::ExpectCommand(expected) => {
                let command = read_command(&mut conn);
                assert_eq!(command, expected, "Unexpected command");
            }
            Step::Sleep(duration) => std::thread::sleep(duration),
            Step::Close => {
                conn.close();
                return;
            }
        }
    }

    // Hold the connection open until the client goes away
    while let Ok(Frame::Message(_)) = conn.read_line() {}
}

fn read_command(conn: &mut Connection) -> Command {
    match conn.read_line().expect("Failed to read command") {
        Frame::Message(message) => message.into_command().expect("Not a command"),
        other => panic!("Expected a command, got {other:?}"),
    }
}
