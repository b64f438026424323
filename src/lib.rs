//! mgmt-broker
//!
//! The client-side broker of a device management system. Local plugins
//! hand it messages; it queues them durably and exchanges them with the
//! remote management server in periodic HTTP round trips, delivering the
//! server's messages back to the plugins.
//!
//! # Overview
//!
//! - [`store`]: durable, ordered queue of outgoing messages plus broker state
//! - [`exchange`]: the scheduler and cycle driver for server round trips
//! - [`transport`]: HTTP exchange and ping clients behind traits
//! - [`registry`]: plugin contracts and the named connector registry
//! - [`events`]: the in-process event bus
//! - [`broker`]: the coordinator tying it all together
//! - [`plugins`]: built-in plugins
//!
//! # Quick Start
//!
//! ```rust
//! use mgmt_broker::protocol::message_from_value;
//! use mgmt_broker::store::MessageStore;
//! use serde_json::json;
//!
//! let store = MessageStore::temporary().unwrap();
//! store.set_accepted_types(["test"]).unwrap();
//! let session = store.get_session_id().unwrap();
//!
//! let id = store
//!     .add(message_from_value(json!({"type": "test"})), Some(&session))
//!     .unwrap();
//! assert!(store.is_pending(id).unwrap());
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod observability;
pub mod plugins;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod system;
pub mod testing;
pub mod transport;

pub use broker::{BrokerHandle, BrokerServer};
pub use config::{BrokerConfig, ConfigError};
pub use error::{BrokerError, BrokerResult};
pub use events::EventBus;
pub use exchange::Exchanger;
pub use protocol::Message;
pub use registry::{BrokerClient, ClientError, Connector, ConnectorFactory};
pub use store::{MessageId, MessageStore};
