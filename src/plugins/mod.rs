//! Plugins shipped with the broker

pub mod computer_info;

pub use computer_info::{ComputerInfo, ComputerInfoError};

use crate::registry::ConnectorFactory;
use std::collections::HashMap;

/// Connector factories for every built-in plugin, keyed by name
pub fn default_connectors() -> HashMap<String, ConnectorFactory> {
    HashMap::from([(
        computer_info::NAME.to_string(),
        computer_info::connector_factory(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connectors() {
        let connectors = default_connectors();
        assert!(connectors.contains_key("computer-info"));
        assert_eq!(connectors.len(), 1);
    }
}
