//! Logging setup for the audit engine.
//!
//! All crates log through `tracing`; binaries call one of the init
//! functions once at startup. Verbosity follows `RUST_LOG` and defaults to
//! `info`.
//!
//! [`SpanCapture`] keeps closed spans in memory, keyed by the `run_id`
//! field of the `audit_run` span, which is how tests inspect a workflow
//! run's trace.

mod capture;
mod init;

pub use capture::{CapturedSpan, SpanCapture, SpanCaptureLayer};
pub use init::{init_telemetry, init_with_capture, init_with_json};
