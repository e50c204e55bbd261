//! Coordinator server mode.
//!
//! Clients and worker daemons connect over one WebSocket endpoint. The
//! registry tracks who is connected, the router forwards tool calls to
//! workers, and the coordinator runs chat turns for each client session.

pub mod auth;
pub mod coordinator;
pub mod registry;
pub mod router;

pub use coordinator::Coordinator;
