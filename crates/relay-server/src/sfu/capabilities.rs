use super::SessionRegistry;
use crate::error::Result;
use relay_protocol::RtpCapabilities;
use std::sync::Arc;

/// Hands the router's codec set to clients
#[derive(Clone)]
pub struct CapabilityNegotiator {
    registry: Arc<SessionRegistry>,
}

impl CapabilityNegotiator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Router capabilities, verbatim. Fails with `NotReady` before the router exists.
    pub fn router_capabilities(&self) -> Result<RtpCapabilities> {
        let router = self.registry.router()?;
        Ok(router.rtp_capabilities().clone())
    }
}
