//! Client and server ends of a QEMU Machine Protocol (QMP) control channel.
//!
//! ```no_run
//! use qmpctl::Session;
//!
//! # fn demo() -> qmpctl::Result<()> {
//! let mut session = Session::connect("/run/user/1000/qmp.sock")?;
//! let status = session.execute("query-status", None)?;
//! println!("{status}");
//!
//! while let Some(event) = session.pop_event(false)? {
//!     println!("{}", event.name);
//! }
//! session.close();
//! # Ok(()) }
//! ```

pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use endpoint::{Endpoint, resolve};
pub use error::{QmpError, Result};
pub use protocol::{Command, Event, Greeting, Message, MessageKind, Response};
pub use session::{AsyncSession, EventQueue, HandshakeState, Session, SessionOptions};
pub use transport::{Connection, Frame, Role};
