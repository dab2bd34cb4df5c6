//! Transport layer for QMP socket communication
//!
//! This module provides line framed access to a TCP or Unix stream socket, with
//! separate implementations for sync (std) and async (tokio) I/O.
//!
//! The transport layer is organized into:
//! - `codec`: NDJSON encoding/decoding for messages
//! - `sync_transport`: Std-based connection in client or server role
//! - `async_transport`: Tokio-based client connection

mod async_transport;
mod codec;
mod sync_transport;

pub use async_transport::AsyncConnection;
pub use codec::{decode_message, encode_message};
pub use sync_transport::{Connection, Frame, Role};
