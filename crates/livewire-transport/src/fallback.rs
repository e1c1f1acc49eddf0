//! Fallback connector.
//!
//! Tries several connectors in order of preference and returns the first
//! session that opens.

use crate::traits::{Connector, Principal, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// A connector that tries multiple connectors in order of preference.
pub struct FallbackConnector {
    connectors: Vec<Arc<dyn Connector>>,
}

impl FallbackConnector {
    /// Create a new fallback connector.
    ///
    /// Connectors are tried in order (first = highest priority).
    #[must_use]
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        Self { connectors }
    }

    /// Add a connector to the end of the chain.
    pub fn add_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// Get the list of connector names in priority order.
    #[must_use]
    pub fn connector_names(&self) -> Vec<&'static str> {
        self.connectors.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Connector for FallbackConnector {
    async fn connect(&self, principal: &Principal) -> Result<Arc<dyn Transport>, TransportError> {
        let mut last_error = None;

        for connector in self.connectors.iter().filter(|c| c.is_healthy()) {
            match connector.connect(principal).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    warn!(connector = connector.name(), error = %e, "Connector failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Other("No healthy connectors available".into())))
    }

    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_healthy(&self) -> bool {
        self.connectors.iter().any(|c| c.is_healthy())
    }
}
