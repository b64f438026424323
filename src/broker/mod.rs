//! Broker coordinator and the plugin-facing handle
//!
//! [`BrokerServer`] ties the store, exchanger, client registry and event
//! bus together. Plugins receive a [`BrokerHandle`] instead of the server
//! itself.

pub mod dispatch;
pub mod handle;
pub mod server;

pub use dispatch::{ClientDispatcher, CLIENT_NAME};
pub use handle::BrokerHandle;
pub use server::BrokerServer;
