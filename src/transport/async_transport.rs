//! Async transport implementation using tokio
//!
//! Client role only. Partial lines are kept in a buffer owned by the connection,
//! which makes `read_line` safe to cancel with `tokio::time::timeout` or `select!`.

use crate::endpoint::Endpoint;
use crate::error::{QmpError, Result};
use crate::transport::Frame;
use crate::transport::codec;
use serde::Serialize;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Async client end of a QMP channel
pub struct AsyncConnection {
    endpoint: Endpoint,
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    partial: Vec<u8>,
    closed: bool,
}

impl AsyncConnection {
    /// Connect to the monitor at the given endpoint
    pub async fn connect(endpoint: Endpoint) -> Result<Self> {
        let (reader, writer): (BoxedReader, BoxedWriter) = match &endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|source| QmpError::Connect {
                        target: endpoint.to_string(),
                        source,
                    })?;
                let (r, w) = stream.into_split();
                (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
            }
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|source| QmpError::Connect {
                        target: endpoint.to_string(),
                        source,
                    })?;
                let (r, w) = stream.into_split();
                (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
            }
        };

        debug!("Connected to {}", endpoint);
        Ok(Self {
            endpoint,
            reader: BufReader::new(reader),
            writer,
            partial: Vec::new(),
            closed: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_local(&self) -> bool {
        self.endpoint.is_local()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for the next complete line. Never returns [`Frame::NotReady`].
    pub async fn read_line(&mut self) -> Result<Frame> {
        if self.closed {
            return Err(QmpError::ConnectionClosed);
        }

        loop {
            let n = self.reader.read_until(b'\n', &mut self.partial).await?;
            if n > 0 && !self.partial.ends_with(b"\n") {
                continue;
            }

            let line = std::mem::take(&mut self.partial);
            if n == 0 && line.trim_ascii().is_empty() {
                return Ok(Frame::Closed);
            }
            if let Some(message) = codec::decode_message(&line)? {
                debug!("<- {}", String::from_utf8_lossy(line.trim_ascii()));
                return Ok(Frame::Message(message));
            }
        }
    }

    /// Return a line only if one is already available
    pub async fn try_read_line(&mut self) -> Result<Frame> {
        match tokio::time::timeout(Duration::ZERO, self.read_line()).await {
            Ok(frame) => frame,
            Err(_) => Ok(Frame::NotReady),
        }
    }

    pub async fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        if self.closed {
            return Err(QmpError::ConnectionClosed);
        }

        let encoded = codec::encode_message(message)?;
        debug!("-> {}", String::from_utf8_lossy(encoded.trim_ascii_end()));

        let result = async {
            self.writer.write_all(&encoded).await?;
            self.writer.flush().await
        }
        .await;

        result.map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                QmpError::Connect {
                    target: self.endpoint.to_string(),
                    source: e,
                }
            }
            _ => QmpError::Io(e),
        })
    }

    /// Shut the connection down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.partial.clear();
        // The peer may already be gone
        let _ = self.writer.shutdown().await;
        debug!("Closed connection to {}", self.endpoint);
    }
}
