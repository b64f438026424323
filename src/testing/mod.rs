//! Testing utilities and mock implementations
//!
//! Mocks for the transport, ping, dispatcher and plugin seams so the broker
//! can be tested without a management server or real plugins.

pub mod mocks;

pub use mocks::*;
