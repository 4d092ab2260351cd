//! Connection Handling Module
//!
//! Dials the target for each accepted stream and hands the pair to the relay engine.

pub mod handler;

pub use handler::ConnectionHandler;
