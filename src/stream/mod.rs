//! Realtime event-source modules.
//!
//! - `client`: reconnecting SSE transport with pause/resume delivery.
//! - `event`: delivered event model and accepted-type allowlists.
//! - `wire`: incremental `text/event-stream` decoder.

/// Reconnecting SSE client and subscription handles.
pub mod client;
/// Event payload model and accepted types.
pub mod event;
/// Wire-format decoder.
pub mod wire;
