//! HTTP and `WebSocket` surface of the Realm server.
//!
//! The binary in `main.rs` wires the stores, the scheduler and the
//! messaging hub together; this library holds the request-facing parts so
//! they can be exercised without a listener.
//!
//! - [`router`] -- route table
//! - [`handlers`] -- health endpoint
//! - [`ws`] -- `WebSocket` endpoint and client frame protocol
//! - [`state`] -- shared handler state
//! - [`error`] -- [`ServerError`](error::ServerError)

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
