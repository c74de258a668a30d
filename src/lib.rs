//! Resilient Server-Sent-Events client with token authentication.
//!
//! The crate is organized by concern:
//! - `auth`: login-state predicate and stream-token endpoint client.
//! - `queue`: FIFO serialization of connection operations.
//! - `stream`: reconnecting SSE client, event model, and wire decoder.

/// Login-state and stream-token collaborators.
pub mod auth;
/// Connection operation serialization.
pub mod queue;
/// Realtime event-source client and supporting types.
pub mod stream;
