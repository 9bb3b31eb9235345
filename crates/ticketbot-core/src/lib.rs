//! ticketbot-core library.
//!
//! Completion detection and exactly-once notification over flat snapshot
//! files. [`pipeline::Pipeline::tick`] runs one pass; everything else is a
//! stage or a collaborator boundary.
//!
//! # Conventions
//!
//! - **Errors**: one `thiserror` enum per concern, each mapping to an
//!   [`error::ErrorCode`].
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`) with
//!   structured fields.

pub mod chat;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod intake;
pub mod lock;
pub mod log_writer;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod workspace;

pub use error::ErrorCode;
pub use pipeline::{Pipeline, PipelineError, TickReport};
