//! Core data types for the DLP monitor
//!
//! This module defines the fundamental data structures shared by the tag
//! store, the classifier and the event log.

pub mod event;
pub mod label;
pub mod tagged;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use event::{Event, EventType, NewEvent, UNKNOWN_ACTOR};
pub use label::Label;
pub use tagged::{ContentHash, TaggedFile};
