//! Production runner with async I/O.
//!
//! This crate wraps the deterministic node state machine with real I/O:
//!
//! - Wire transport (TCP with a bounded connection pool, or in-memory for
//!   tests) delivering the four request kinds
//! - Timers via tokio tasks
//! - Application gateway calls off the controller task
//! - Prometheus metrics and tracing setup
//!
//! # Architecture
//!
//! A single controller task owns the state machine and receives events
//! over a bounded mpsc channel, serialising every mutation of the
//! hashgraph and store (single-writer). Worker tasks handle inbound
//! requests, outbound exchanges, the application submit channel and
//! timers; a broadcast shutdown signal unwinds them at their next await
//! point. In-flight sync exchanges are simply abandoned: insertion is
//! all-or-nothing per event, so partial state never survives.
//!
//! ```text
//! transport ──┐                          ┌── SendSyncRequest ──► peer
//! timers ─────┼──► NodeEvent ──► NodeStateMachine ──► Action ──┤
//! gateway ────┘        (controller task, single writer)        └── CommitBlock ──► app
//! ```

mod build;
mod codec;
mod config;
mod keys;
mod metrics;
mod runner;
mod telemetry;
mod timers;
pub mod transport;

pub use build::{build_state_machine, BuildError};
pub use codec::{CodecError, WIRE_VERSION};
pub use config::RunnerConfig;
pub use keys::{load_key, save_key, KEY_FILE};
pub use metrics::Metrics;
pub use runner::{NodeHandle, NodeRunner};
pub use telemetry::{init_telemetry, serve_metrics, TelemetryError};
pub use timers::TimerManager;
pub use transport::{InboundRequest, InmemNetwork, TcpTransport, Transport, TransportError};
