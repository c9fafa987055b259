//! Sandboxed execution of untrusted code in resource-bounded containers.
//!
//! Callers submit an [`ExecutionRequest`] naming a language and either a
//! project directory or an inline source file. The orchestrator resolves the
//! runtime image, clamps the requested limits, starts an isolated container
//! and returns an execution id immediately. Status, logs and the final
//! response are then read through the same [`Orchestrator`].
//!
//! # Architecture Overview
//!
//! - **Runtime catalog**: language/version to image resolution
//! - **Resource limiter**: request limits clamped to configured maxima
//! - **Container lifecycle**: create/start/inspect/stop/remove with
//!   per-call timeouts, bounded retries and idempotent teardown
//! - **Execution tracker**: the one shared registry, locked per record
//! - **Log collector**: append-only output buffer with resumable streams
//! - **Reaper**: deadline enforcement, exit detection and cleanup
//! - **Configuration**: YAML with defaults and environment overrides

pub mod catalog;
pub mod config;
pub mod core_types;
pub mod errors;
pub mod executors;
pub mod limits;
pub mod logs;
pub mod orchestrator;
pub mod reaper;
pub mod tracker;

pub use catalog::RuntimeCatalog;
pub use config::*;
pub use core_types::*;
pub use errors::{OrchestratorError, RuntimeCallError};
pub use executors::{ContainerRuntime, DockerRuntime};
pub use logs::LogStream;
pub use orchestrator::Orchestrator;
