//! Readiness signals inferred from dev-server output.
//!
//! A dev server is considered up once a line of its output names a listening
//! port. This module provides:
//!
//! - `PortPatterns` - an ordered list of port matchers with a small documented
//!   default set; invalid patterns are skipped
//! - error-signal detection used to enrich failure messages
//! - `OutputTail` - a bounded buffer of recent output for diagnostics
//! - credential redaction for anything that is logged or surfaced
//!
//! Matching log text is heuristic. The default patterns are versioned data
//! and are tested against a corpus of real framework log lines.

mod parser;
mod types;

pub use parser::{
    DEFAULT_PORT_PATTERNS, PORT_PATTERNS_VERSION, PortPatterns, error_lines, has_error_signal,
    match_port, redact_credentials, strip_ansi,
};
pub use types::{OutputTail, PortMatch};
