use crate::config::WebRtcConfig;
use crate::engine::{Router, WebRtcTransport, WebRtcTransportOptions};
use crate::error::{bounded, Result};
use relay_protocol::{DtlsParameters, TransportOptions};
use std::sync::Arc;
use std::time::Duration;

/// What happened to the incoming bitrate cap of a fresh transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitrateCapOutcome {
    NotConfigured,
    Applied(u32),
    /// The engine refused the cap; the transport is usable without it
    DegradedBitrateCap { requested: u32, reason: String },
}

pub struct CreatedTransport {
    pub transport: Arc<dyn WebRtcTransport>,
    pub params: TransportOptions,
    pub bitrate_cap: BitrateCapOutcome,
}

/// Creates and connects WebRTC transports with the configured listen settings
pub struct TransportManager {
    options: WebRtcTransportOptions,
    max_incoming_bitrate: Option<u32>,
    timeout: Duration,
}

impl TransportManager {
    pub fn new(config: &WebRtcConfig, timeout: Duration) -> Self {
        Self {
            options: config.transport_options(),
            max_incoming_bitrate: config.incoming_bitrate_cap(),
            timeout,
        }
    }

    pub async fn create_transport(&self, router: &dyn Router) -> Result<CreatedTransport> {
        let transport = bounded(
            "createWebRtcTransport",
            self.timeout,
            router.create_webrtc_transport(&self.options),
        )
        .await?;

        let bitrate_cap = match self.max_incoming_bitrate {
            None => BitrateCapOutcome::NotConfigured,
            Some(bitrate) => {
                match bounded(
                    "setMaxIncomingBitrate",
                    self.timeout,
                    transport.set_max_incoming_bitrate(bitrate),
                )
                .await
                {
                    Ok(()) => BitrateCapOutcome::Applied(bitrate),
                    Err(e) => {
                        tracing::warn!(
                            "Transport {} running without incoming bitrate cap {}: {}",
                            transport.id(),
                            bitrate,
                            e
                        );
                        BitrateCapOutcome::DegradedBitrateCap {
                            requested: bitrate,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        let params = transport.options();
        tracing::debug!("Created transport {} ({:?})", params.id, bitrate_cap);

        Ok(CreatedTransport {
            transport,
            params,
            bitrate_cap,
        })
    }

    pub async fn connect_transport(
        &self,
        transport: &dyn WebRtcTransport,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        bounded("connect", self.timeout, transport.connect(dtls_parameters)).await?;
        tracing::debug!("Transport {} connected", transport.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::local::LocalEngine;
    use crate::engine::{EngineError, TransportConnectState, Worker};
    use crate::error::SignalError;
    use relay_protocol::{DtlsFingerprint, DtlsRole};

    async fn router() -> Arc<dyn Router> {
        let config = Config::default();
        let worker = LocalEngine::new().spawn_worker(&config.worker.settings()).unwrap();
        worker.create_router(&config.router.media_codecs).await.unwrap()
    }

    fn manager(max_incoming_bitrate: u32) -> TransportManager {
        let webrtc = WebRtcConfig {
            max_incoming_bitrate,
            ..WebRtcConfig::default()
        };
        TransportManager::new(&webrtc, Duration::from_secs(5))
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "12:34:56".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_create_applies_cap() {
        let router = router().await;
        let created = manager(1_500_000).create_transport(router.as_ref()).await.unwrap();

        assert_eq!(created.bitrate_cap, BitrateCapOutcome::Applied(1_500_000));
        assert_eq!(created.params.id, created.transport.id());
        assert_eq!(created.params.ice_candidates[0].ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_rejected_cap_is_degraded_not_fatal() {
        let router = router().await;
        let created = manager(1000).create_transport(router.as_ref()).await.unwrap();

        assert!(matches!(
            created.bitrate_cap,
            BitrateCapOutcome::DegradedBitrateCap { requested: 1000, .. }
        ));
        assert!(!created.transport.is_closed());
    }

    #[tokio::test]
    async fn test_zero_cap_is_not_configured() {
        let router = router().await;
        let created = manager(0).create_transport(router.as_ref()).await.unwrap();
        assert_eq!(created.bitrate_cap, BitrateCapOutcome::NotConfigured);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let router = router().await;
        let manager = manager(0);
        let created = manager.create_transport(router.as_ref()).await.unwrap();

        tokio_test::assert_ok!(
            manager
                .connect_transport(created.transport.as_ref(), dtls())
                .await
        );
        assert_eq!(
            created.transport.connect_state().await,
            TransportConnectState::Connected
        );

        let err = manager
            .connect_transport(created.transport.as_ref(), dtls())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Delegate(EngineError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_closed_transport_fails() {
        let router = router().await;
        let manager = manager(0);
        let created = manager.create_transport(router.as_ref()).await.unwrap();
        created.transport.close().await;

        let err = manager
            .connect_transport(created.transport.as_ref(), dtls())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Delegate(EngineError::TransportNotFound(_))
        ));
    }
}
