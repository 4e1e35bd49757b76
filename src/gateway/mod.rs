//! HTTP gateway.
//!
//! Exposes the relay over SSE and WebSocket, plus the session and result
//! endpoints:
//!
//! ```text
//! POST /api/interview/stream            one turn, events as SSE
//! GET  /api/interview/ws                repeated turns over one socket
//! POST /api/sessions                    new session id
//! GET  /api/sessions/{id}/transcript
//! GET  /api/sessions/{id}/result
//! POST /api/sessions/{id}/complete      mark the first pass complete
//! POST /api/sessions/{id}/evaluate      run extraction outside a turn
//! GET  /api/health
//! ```

mod server;
pub mod types;

pub use server::{GatewayState, router, start_server};
