//! Wire protocol types for the management message system
//!
//! Messages travelling between the broker and the server are JSON objects
//! with a `type` field and type-specific contents. The exchange envelope
//! wraps a batch of them together with the sequencing and accepted-types
//! bookkeeping both ends need to stay in sync.

pub mod messages;

pub use messages::*;
