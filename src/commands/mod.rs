//! # Commands Module
//!
//! ## `relay`
//! Runs the relay server:
//! - Rate limits new connections by IP and by code
//! - Reads the `code:role[:retry]` handshake
//! - Pairs a sender and a receiver that share a code into a room
//! - Pipes bytes between them until either side goes away
//! - Keeps retryable rooms open for a reconnect

pub mod relay;
