//! Transport selection.
//!
//! Maps the transport kind advertised in a peer document to the local
//! adapter for that kind.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use tmcp_transport::{TransportAdapter, TransportKind};

use crate::errors::BridgeError;

#[derive(Default, Clone)]
pub struct TransportRegistry {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) {
        let kind = adapter.kind();
        debug!(%kind, "transport adapter registered");
        self.adapters.insert(kind, adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn adapter_for(&self, kind: TransportKind) -> Result<Arc<dyn TransportAdapter>, BridgeError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(BridgeError::UnsupportedTransportKind(kind))
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmcp_transport::MemoryNetwork;

    #[test]
    fn test_selects_by_kind() {
        let net = MemoryNetwork::new();
        let registry = TransportRegistry::new()
            .with(Arc::new(net.adapter(TransportKind::PushStream)))
            .with(Arc::new(net.adapter(TransportKind::BidirectionalSocket)));

        for kind in TransportKind::all() {
            assert_eq!(registry.adapter_for(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_missing_kind_unsupported() {
        let net = MemoryNetwork::new();
        let registry =
            TransportRegistry::new().with(Arc::new(net.adapter(TransportKind::PushStream)));

        assert!(!registry.supports(TransportKind::BidirectionalSocket));
        assert!(matches!(
            registry.adapter_for(TransportKind::BidirectionalSocket),
            Err(BridgeError::UnsupportedTransportKind(TransportKind::BidirectionalSocket))
        ));
    }
}
