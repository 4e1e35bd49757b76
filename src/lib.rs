//! Interview relay.
//!
//! Conducts a structured interview through a hosted conversational assistant,
//! streams its replies to the client in real time, and incrementally extracts
//! a fixed-schema profile of the interviewee.
//!
//! # Architecture
//!
//! ```text
//! client ──▶ gateway (SSE / WebSocket) ──▶ relay ──stream──▶ hosted assistant
//!                                            │
//!                                  function call mid-turn
//!                                            ▼
//!                                    extraction engine ──▶ results store
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod extraction;
pub mod gateway;
pub mod llm;
pub mod profile;
pub mod relay;
pub mod store;
