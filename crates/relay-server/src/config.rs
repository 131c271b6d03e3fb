//! Process configuration
//!
//! Defaults overlaid with `RELAY_*` environment variables, nested keys joined
//! with `__` (for example `RELAY_WEBRTC__ANNOUNCED_IP=198.51.100.4`).

use crate::engine::{WebRtcTransportOptions, WorkerSettings};
use relay_protocol::{CodecParameters, MediaKind, RtpCodecCapability};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Default tracing level for this crate when `RUST_LOG` is unset
    pub log_level: String,
    pub num_workers: usize,
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub webrtc: WebRtcConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Incoming bitrate cap in bps, 0 disables it
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub engine_timeout_ms: u64,
    pub broadcast_timeout_ms: u64,
    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
    pub worker_death_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            bind_address: "0.0.0.0:4000".to_string(),
            log_level: "info".to_string(),
            num_workers,
            worker: WorkerConfig::default(),
            router: RouterConfig::default(),
            webrtc: WebRtcConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            log_level: "warn".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut vp8_parameters = CodecParameters::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), 1000.into());

        Self {
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    preferred_payload_type: None,
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: CodecParameters::new(),
                    rtcp_feedback: vec![],
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    preferred_payload_type: None,
                    clock_rate: 90000,
                    channels: None,
                    parameters: vp8_parameters,
                    rtcp_feedback: vec![],
                },
            ],
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            engine_timeout_ms: 10_000,
            broadcast_timeout_ms: 1_000,
            outbound_queue: 64,
            worker_death_grace_ms: 2_000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Keys absent from the environment fall back to `Config::default()`
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("worker.log_tags")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_workers == 0 {
            anyhow::bail!("num_workers must be at least 1");
        }
        if self.worker.rtc_min_port > self.worker.rtc_max_port {
            anyhow::bail!(
                "worker port range {}-{} is empty",
                self.worker.rtc_min_port,
                self.worker.rtc_max_port
            );
        }
        if self.router.media_codecs.is_empty() {
            anyhow::bail!("at least one media codec must be configured");
        }
        if !self.webrtc.enable_udp && !self.webrtc.enable_tcp {
            anyhow::bail!("UDP and TCP cannot both be disabled");
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.log_level.clone(),
            log_tags: self.log_tags.clone(),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }
}

impl WebRtcConfig {
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }

    pub fn incoming_bitrate_cap(&self) -> Option<u32> {
        (self.max_incoming_bitrate > 0).then_some(self.max_incoming_bitrate)
    }
}

impl SignalingConfig {
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn worker_death_grace(&self) -> Duration {
        Duration::from_millis(self.worker_death_grace_ms)
    }
}
