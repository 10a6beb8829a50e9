#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! runpilot: client-side session engine for remotely executed browser
//! automation sessions.
//!
//! The server owns execution; this crate keeps a local replica of one session
//! consistent across a websocket channel and a REST polling fallback,
//! serializes user commands against it, and drives the run-till-end and
//! undo/replay sub-protocols.
//!
//! ## Architecture
//!
//! ```text
//! protocol.rs       wire envelopes: ClientCommand, ServerEvent, Step, SessionStatus
//! connection.rs     pure ConnectionState transition function (reconnect, fallback)
//! session_cell.rs   single-writer active session id with generation counter
//! transport.rs      dual-mode transport driver (tokio-tungstenite + polling)
//! merger.rs         SessionReplica: watermark-based idempotent merge
//! timeline.rs       user-facing TimelineEntry projection
//! gate.rs           command gate and FIFO queue, failure decision state
//! run_till_end.rs   run-till-end pause/skip/continue/cancel controller
//! undo.rs           undo/replay three-way outcome, single-step delete
//! session.rs        SessionController: lifecycle, reset, event dispatch
//! client.rs         REST collaborator (SessionApi trait + reqwest impl)
//! config.rs         TOML + env-var configuration
//! error.rs          error taxonomy
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod merger;
pub mod protocol;
pub mod run_till_end;
pub mod session;
pub mod session_cell;
pub mod timeline;
pub mod transport;
pub mod undo;

#[cfg(test)]
mod testing;

pub use client::{HttpSessionApi, SessionApi};
pub use config::Config;
pub use connection::{ConnectionMode, ConnectionState};
pub use error::{ClientError, CommandError, ConfigError, TransportError};
pub use gate::{GateState, UserCommand};
pub use session::SessionController;
pub use transport::{SessionTransport, Transport};
