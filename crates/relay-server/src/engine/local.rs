//! In-process media engine
//!
//! Keeps the complete transport/producer/consumer bookkeeping of an SFU worker
//! (port allocation, ICE credentials, DTLS fingerprints, codec negotiation,
//! pause state and close cascades) without touching media packets.

use super::capabilities::{
    build_router_capabilities, consumer_rtp_parameters, find_router_codec, is_rtx, shares_codec,
};
use super::{
    Consumer, EngineError, MediaEngine, Producer, Router, TransportConnectState, WebRtcTransport,
    WebRtcTransportOptions, Worker, WorkerSettings,
};
use async_trait::async_trait;
use rand::Rng;
use relay_protocol::{
    ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceCandidateTcpType, IceCandidateType, IceParameters, MediaKind, ProducerId, RouterId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId, TransportOptions,
    TransportProtocol, WorkerId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex, RwLock};
use webrtc::peer_connection::certificate::RTCCertificate;

/// Lowest incoming bitrate cap a transport accepts (bps)
pub const MIN_INCOMING_BITRATE: u32 = 10_000;

const UDP_PRIORITY: u32 = 1_076_302_079;
const TCP_PRIORITY: u32 = 1_076_276_479;

type ProducerMap = Arc<RwLock<HashMap<ProducerId, Arc<LocalProducer>>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEngine;

impl LocalEngine {
    pub fn new() -> Self {
        Self
    }

    /// Starts a worker and returns its concrete handle
    pub fn spawn_worker(&self, settings: &WorkerSettings) -> Result<Arc<LocalWorker>, EngineError> {
        LocalWorker::start(settings).map(Arc::new)
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn Worker>, EngineError> {
        let worker: Arc<dyn Worker> = self.spawn_worker(settings)?;
        Ok(worker)
    }
}

/// Port range shared by every transport of a worker
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    async fn allocate(&self) -> Result<u16, EngineError> {
        let mut in_use = self.in_use.lock().await;
        let span = u32::from(self.max - self.min) + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let port = self.min + ((start + offset) % span) as u16;
            if in_use.insert(port) {
                return Ok(port);
            }
        }

        Err(EngineError::PortsExhausted {
            min: self.min,
            max: self.max,
        })
    }

    async fn release(&self, port: u16) {
        self.in_use.lock().await.remove(&port);
    }
}

pub struct LocalWorker {
    id: WorkerId,
    died_tx: watch::Sender<bool>,
    fingerprints: Vec<DtlsFingerprint>,
    ports: Arc<PortAllocator>,
}

impl LocalWorker {
    fn start(settings: &WorkerSettings) -> Result<Self, EngineError> {
        if settings.rtc_min_port == 0 || settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::InvalidTransportOptions(format!(
                "invalid port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let dtls_certificate =
            webrtc::dtls::crypto::Certificate::generate_self_signed(vec!["sfu-relay".to_owned()])
                .map_err(|e| EngineError::Certificate(e.to_string()))?;
        let certificate = RTCCertificate::from_existing(
            dtls_certificate,
            SystemTime::now() + Duration::from_secs(30 * 24 * 60 * 60),
        );
        let fingerprints = certificate
            .get_fingerprints()
            .into_iter()
            .map(|fp| DtlsFingerprint {
                algorithm: fp.algorithm,
                value: fp.value,
            })
            .collect();

        let (died_tx, _) = watch::channel(false);
        let id = WorkerId::new();

        tracing::info!(
            "Started media worker {} (log level {}, tags [{}], ports {}-{})",
            id,
            settings.log_level,
            settings.log_tags.join(","),
            settings.rtc_min_port,
            settings.rtc_max_port
        );

        Ok(Self {
            id,
            died_tx,
            fingerprints,
            ports: Arc::new(PortAllocator::new(settings.rtc_min_port, settings.rtc_max_port)),
        })
    }

    /// Simulates an unexpected worker crash
    pub fn terminate(&self) {
        tracing::error!("Media worker {} terminated", self.id);
        self.died_tx.send_replace(true);
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn died(&self) -> watch::Receiver<bool> {
        self.died_tx.subscribe()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        if *self.died_tx.borrow() {
            return Err(EngineError::WorkerDied(self.id));
        }

        let rtp_capabilities = build_router_capabilities(media_codecs)?;
        let router = LocalRouter {
            id: RouterId::new(),
            worker_id: self.id,
            died: self.died_tx.subscribe(),
            rtp_capabilities: Arc::new(rtp_capabilities),
            fingerprints: self.fingerprints.clone(),
            ports: self.ports.clone(),
            producers: Arc::new(RwLock::new(HashMap::new())),
        };

        tracing::info!("Created router {} on worker {}", router.id, self.id);

        Ok(Arc::new(router))
    }
}

pub struct LocalRouter {
    id: RouterId,
    worker_id: WorkerId,
    died: watch::Receiver<bool>,
    rtp_capabilities: Arc<RtpCapabilities>,
    fingerprints: Vec<DtlsFingerprint>,
    ports: Arc<PortAllocator>,
    producers: ProducerMap,
}

impl LocalRouter {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if *self.died.borrow() {
            Err(EngineError::WorkerDied(self.worker_id))
        } else {
            Ok(())
        }
    }

    fn ice_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<IceCandidate> {
        let address = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (UDP_PRIORITY, TCP_PRIORITY)
        } else {
            (TCP_PRIORITY, UDP_PRIORITY)
        };

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                ip: address.clone(),
                address: address.clone(),
                protocol: TransportProtocol::Udp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                ip: address.clone(),
                address,
                protocol: TransportProtocol::Tcp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: Some(IceCandidateTcpType::Passive),
            });
        }
        candidates
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError> {
        self.ensure_alive()?;

        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidTransportOptions(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        let port = self.ports.allocate().await?;
        let id = TransportId::new();
        let transport_options = TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: webrtc::ice::rand::generate_ufrag(),
                password: webrtc::ice::rand::generate_pwd(),
                ice_lite: true,
            },
            ice_candidates: Self::ice_candidates(options, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: self.fingerprints.clone(),
            },
        };

        tracing::debug!(
            "Created transport {} on port {} (initial outgoing bitrate {})",
            id,
            port,
            options.initial_available_outgoing_bitrate
        );

        Ok(Arc::new(LocalTransport {
            options: transport_options,
            port,
            ports: self.ports.clone(),
            worker_id: self.worker_id,
            died: self.died.clone(),
            router_capabilities: self.rtp_capabilities.clone(),
            router_producers: self.producers.clone(),
            connect_state: Mutex::new(TransportConnectState::New),
            closed: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }))
    }

    async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = self.producers.read().await;
        match producers.get(&producer_id) {
            Some(producer) => shares_codec(rtp_capabilities, producer.kind, &producer.rtp_parameters),
            None => {
                tracing::debug!("can_consume: unknown producer {}", producer_id);
                false
            }
        }
    }
}

pub struct LocalTransport {
    options: TransportOptions,
    port: u16,
    ports: Arc<PortAllocator>,
    worker_id: WorkerId,
    died: watch::Receiver<bool>,
    router_capabilities: Arc<RtpCapabilities>,
    router_producers: ProducerMap,
    connect_state: Mutex<TransportConnectState>,
    closed: AtomicBool,
    max_incoming_bitrate: AtomicU32,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalTransport {
    fn ensure_usable(&self) -> Result<(), EngineError> {
        if *self.died.borrow() {
            return Err(EngineError::WorkerDied(self.worker_id));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportNotFound(self.options.id));
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), EngineError> {
        if *self.connect_state.lock().await != TransportConnectState::Connected {
            return Err(EngineError::NotConnected);
        }
        Ok(())
    }
}

fn validate_dtls(dtls_parameters: &DtlsParameters) -> Result<(), EngineError> {
    if dtls_parameters.fingerprints.is_empty() {
        return Err(EngineError::InvalidDtlsParameters(
            "no fingerprints given".to_string(),
        ));
    }
    for fingerprint in &dtls_parameters.fingerprints {
        if fingerprint.algorithm.is_empty() || fingerprint.value.is_empty() {
            return Err(EngineError::InvalidDtlsParameters(
                "empty fingerprint".to_string(),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl WebRtcTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.options.id
    }

    fn options(&self) -> TransportOptions {
        self.options.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect_state(&self) -> TransportConnectState {
        *self.connect_state.lock().await
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        self.ensure_usable()?;
        if bitrate != 0 && bitrate < MIN_INCOMING_BITRATE {
            return Err(EngineError::InvalidBitrate(bitrate));
        }
        self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_usable()?;

        let mut state = self.connect_state.lock().await;
        if *state != TransportConnectState::New {
            return Err(EngineError::AlreadyConnected);
        }

        *state = TransportConnectState::Connecting;
        if let Err(e) = validate_dtls(&dtls_parameters) {
            *state = TransportConnectState::New;
            return Err(e);
        }
        *state = TransportConnectState::Connected;

        tracing::debug!(
            "Transport {} connected (remote DTLS role {:?})",
            self.options.id,
            dtls_parameters.role
        );
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        self.ensure_usable()?;
        self.ensure_connected().await?;

        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidRtpParameters("no codecs".to_string()));
        }
        for codec in rtp_parameters.codecs.iter().filter(|c| !is_rtx(&c.mime_type)) {
            if codec.kind() != Some(kind) {
                return Err(EngineError::InvalidRtpParameters(format!(
                    "{} codec in a {} producer",
                    codec.mime_type, kind
                )));
            }
            if find_router_codec(&self.router_capabilities, codec).is_none() {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            router_producers: self.router_producers.clone(),
            consumers: Mutex::new(Vec::new()),
        });

        self.router_producers
            .write()
            .await
            .insert(producer.id, producer.clone());
        self.producers.lock().await.push(producer.clone());

        tracing::debug!("Producer {} ({}) created on transport {}", producer.id, kind, self.options.id);

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        self.ensure_usable()?;
        self.ensure_connected().await?;

        let producer = self
            .router_producers
            .read()
            .await
            .get(&producer_id)
            .cloned()
            .ok_or(EngineError::ProducerNotFound(producer_id))?;

        let ssrc = rand::thread_rng().gen_range(100_000_000..=999_999_999);
        let rtp_parameters = consumer_rtp_parameters(
            &self.router_capabilities,
            producer.kind,
            &producer.rtp_parameters,
            &rtp_capabilities,
            ssrc,
        )
        .ok_or(EngineError::Incompatible(producer_id))?;

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            producer_paused: AtomicBool::new(producer.paused()),
            closed: AtomicBool::new(false),
        });

        producer.attach(&consumer).await?;
        let mut consumers = self.consumers.lock().await;
        consumers.retain(|c| !c.is_closed());
        consumers.push(consumer.clone());
        drop(consumers);

        tracing::debug!(
            "Consumer {} of producer {} created on transport {} (paused: {})",
            consumer.id,
            producer_id,
            self.options.id,
            paused
        );

        Ok(consumer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers = std::mem::take(&mut *self.producers.lock().await);
        for producer in producers {
            producer.close().await;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            consumer.close().await;
        }

        self.ports.release(self.port).await;
        tracing::debug!("Transport {} closed", self.options.id);
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    router_producers: ProducerMap,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
}

impl LocalProducer {
    /// Links a consumer so it closes with this producer.
    ///
    /// `closed` is read under the consumer lock; `close` flips it before taking
    /// that lock, so a consumer is either refused here or picked up by `close`.
    async fn attach(&self, consumer: &Arc<LocalConsumer>) -> Result<(), EngineError> {
        let mut consumers = self.consumers.lock().await;
        if self.is_closed() {
            return Err(EngineError::ProducerNotFound(self.id));
        }
        consumers.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        consumers.push(Arc::downgrade(consumer));
        Ok(())
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.router_producers.write().await.remove(&self.id);

        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close().await;
        }

        tracing::debug!("Producer {} closed", self.id);
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn consumer_type(&self) -> ConsumerType {
        ConsumerType::Simple
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("Consumer"));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
