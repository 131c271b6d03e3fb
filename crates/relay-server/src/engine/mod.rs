//! Media engine capability interface
//!
//! The SFU engine owns ICE/DTLS/SRTP and RTP forwarding. The signaling side only
//! talks to it through the traits below; [`local::LocalEngine`] is the in-process
//! implementation used by the server binary and the tests.

pub mod capabilities;
pub mod local;

use async_trait::async_trait;
use relay_protocol::{
    ConsumerId, ConsumerType, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportId, TransportOptions, WorkerId,
};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport not found")]
    TransportNotFound(TransportId),

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    #[error("Invalid transport options: {0}")]
    InvalidTransportOptions(String),

    #[error("Producer not found")]
    ProducerNotFound(ProducerId),

    #[error("RTP capabilities do not match the producer")]
    Incompatible(ProducerId),

    #[error("No free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Invalid bitrate: {0}")]
    InvalidBitrate(u32),

    #[error("{0} closed")]
    Closed(&'static str),

    #[error("Media worker died")]
    WorkerDied(WorkerId),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Worker startup settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Network settings for a WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    /// Public address put into ICE candidates instead of `listen_ip`
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectState {
    New,
    Connecting,
    Connected,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn Worker>, EngineError>;
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Flips to `true` once the worker died unexpectedly
    fn died(&self) -> watch::Receiver<bool>;

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError>;
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> &RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError>;

    /// Whether `rtp_capabilities` can receive the given producer
    async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Connection parameters handed to the client
    fn options(&self) -> TransportOptions;

    fn is_closed(&self) -> bool;

    async fn connect_state(&self) -> TransportConnectState;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Closes the transport together with every producer and consumer on it
    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn paused(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Closes the producer and every consumer fed by it
    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn consumer_type(&self) -> ConsumerType;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Starts delivery. Resuming a consumer that is already flowing is a no-op.
    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}
