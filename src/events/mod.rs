//! Filesystem-backed event scheduling.
//!
//! Each file in `<workspace>/events/` describes one event; the filename is
//! the event's identity. Three firing modes: immediate, one-shot at a
//! timestamp, periodic by cron expression in an IANA timezone.

pub mod scheduler;
pub mod spec;

pub use scheduler::EventScheduler;
pub use spec::{EventKind, EventSpec};
