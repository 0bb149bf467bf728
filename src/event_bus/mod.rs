//! Structured lifecycle events and their delivery to pluggable sinks.
//!
//! The scheduler emits [`Event`] values on a channel owned by the
//! [`EventBus`]; a background listener fans each event out to every
//! registered [`EventSink`]. Sinks are injected at configuration time, so
//! observers (console logs, in-memory test captures, streaming channels)
//! never couple to the scheduler loop.

mod bus;
mod event;
mod sink;

pub use bus::EventBus;
pub use event::Event;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
