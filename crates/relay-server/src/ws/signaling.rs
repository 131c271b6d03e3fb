//! Per-connection signaling state machine
//!
//! A connection walks two independent paths:
//!
//! * producer: `Init -> RouterCapsKnown -> SendTransportCreated -> SendTransportConnected -> Producing`
//! * consumer: `Init -> RecvTransportCreated -> RecvTransportConnected -> Consuming`
//!
//! A message that arrives out of order is rejected before the engine is touched.

use crate::error::{bounded, Result, SignalError};
use crate::sfu::{CapabilityNegotiator, ReleasedConnection, SessionRegistry, TransportManager};
use crate::state::AppState;
use crate::ws::connections::ConnectionManager;
use relay_protocol::{
    ClientMessage, ConnectTransportRequest, ConnectionId, ConsumeRequest, ConsumerDescriptor,
    DecodeError, MediaKind, ProduceRequest, ProducerAnnouncement, ProducerClosedNotice,
    ResumeRequest, ServerMessage,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Init,
    RouterCapsKnown,
    SendTransportCreated,
    SendTransportConnected,
    Producing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Init,
    RecvTransportCreated,
    RecvTransportConnected,
    Consuming,
}

pub struct SignalingSession {
    connection_id: ConnectionId,
    producer_state: ProducerState,
    consumer_state: ConsumerState,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    transports: Arc<TransportManager>,
    negotiator: CapabilityNegotiator,
    timeout: Duration,
}

impl SignalingSession {
    pub fn new(connection_id: ConnectionId, state: &AppState) -> Self {
        Self {
            connection_id,
            producer_state: ProducerState::Init,
            consumer_state: ConsumerState::Init,
            registry: state.registry.clone(),
            connections: state.connections.clone(),
            transports: state.transports.clone(),
            negotiator: state.negotiator.clone(),
            timeout: state.config.signaling.engine_timeout(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn producer_state(&self) -> ProducerState {
        self.producer_state
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer_state
    }

    /// Handles one raw text frame.
    ///
    /// Returns the reply for the originator, or `None` when the frame is dropped.
    pub async fn handle_frame(&mut self, text: &str) -> Option<ServerMessage> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(DecodeError::InvalidPayload { kind, source }) => {
                // Decoder detail stays in the log
                tracing::warn!(
                    "Rejected {} frame from {}: {}",
                    kind,
                    self.connection_id,
                    source
                );
                let err = SignalError::ProtocolViolation(format!("invalid {} payload", kind));
                return Some(ServerMessage::error(err.client_message()));
            }
            Err(e) => {
                tracing::warn!("Dropped frame from {}: {}", self.connection_id, e);
                return None;
            }
        };

        let event = message.event_name();
        tracing::debug!("{} from {}", event, self.connection_id);

        match self.handle(message).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                if e.is_expected() {
                    tracing::debug!("{} from {} rejected: {}", event, self.connection_id, e);
                } else {
                    tracing::error!("{} from {} failed: {}", event, self.connection_id, e);
                }
                Some(ServerMessage::error(e.client_message()))
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Result<ServerMessage> {
        match message {
            ClientMessage::GetRouterRtpCapabilities => self.router_capabilities(),
            ClientMessage::GetProducerRtpCapabilities => self.create_producer_transport().await,
            ClientMessage::ConnectProducerTransport(request) => {
                self.connect_producer_transport(request).await
            }
            ClientMessage::Produce(request) => self.produce(request).await,
            ClientMessage::CreateConsumerTransport => self.create_consumer_transport().await,
            ClientMessage::ConnectConsumerTransport(request) => {
                self.connect_consumer_transport(request).await
            }
            ClientMessage::Consume(request) => self.consume(request).await,
            ClientMessage::Resume(request) => self.resume(request).await,
        }
    }

    fn router_capabilities(&mut self) -> Result<ServerMessage> {
        let capabilities = self.negotiator.router_capabilities()?;
        if self.producer_state == ProducerState::Init {
            self.producer_state = ProducerState::RouterCapsKnown;
        }
        Ok(ServerMessage::RouterCapabilities(capabilities))
    }

    async fn create_producer_transport(&mut self) -> Result<ServerMessage> {
        if self.producer_state == ProducerState::Init {
            return Err(SignalError::ProtocolViolation(
                "router capabilities must be requested first".to_string(),
            ));
        }

        let router = self.registry.router()?;
        let created = self.transports.create_transport(router.as_ref()).await?;
        if let Some(previous) = self
            .registry
            .replace_send_transport(self.connection_id, created.transport.clone())
            .await
        {
            self.retire(previous).await;
        }

        self.producer_state = ProducerState::SendTransportCreated;
        Ok(ServerMessage::CreateProducerTransport(created.params))
    }

    async fn connect_producer_transport(
        &mut self,
        request: ConnectTransportRequest,
    ) -> Result<ServerMessage> {
        match self.producer_state {
            ProducerState::Init | ProducerState::RouterCapsKnown => {
                return Err(SignalError::ProtocolViolation(
                    "producer transport not created".to_string(),
                ));
            }
            ProducerState::SendTransportConnected | ProducerState::Producing => {
                return Err(SignalError::ProtocolViolation(
                    "producer transport already connected".to_string(),
                ));
            }
            ProducerState::SendTransportCreated => {}
        }

        let transport = self
            .registry
            .send_transport(self.connection_id)
            .await
            .ok_or_else(|| SignalError::NotFound("Producer transport not found".to_string()))?;
        self.transports
            .connect_transport(transport.as_ref(), request.dtls_parameters)
            .await?;

        self.producer_state = ProducerState::SendTransportConnected;
        Ok(ServerMessage::ProducerConnected(
            "producer transport connected".to_string(),
        ))
    }

    async fn produce(&mut self, request: ProduceRequest) -> Result<ServerMessage> {
        if !matches!(
            self.producer_state,
            ProducerState::SendTransportConnected | ProducerState::Producing
        ) {
            return Err(SignalError::ProtocolViolation(
                "producer transport not connected".to_string(),
            ));
        }

        let transport = self
            .registry
            .send_transport(self.connection_id)
            .await
            .ok_or_else(|| SignalError::NotFound("Producer transport not found".to_string()))?;
        let producer = bounded(
            "produce",
            self.timeout,
            transport.produce(request.kind, request.rtp_parameters),
        )
        .await?;

        self.registry
            .record_producer(self.connection_id, transport.id(), producer.clone())
            .await;
        self.producer_state = ProducerState::Producing;

        let announcement = ServerMessage::NewProducer(ProducerAnnouncement {
            id: producer.id(),
            kind: producer.kind(),
        });
        self.connections
            .broadcast(&announcement, Some(self.connection_id))
            .await;

        tracing::info!(
            "Connection {} produces {} ({})",
            self.connection_id,
            producer.kind(),
            producer.id()
        );
        Ok(ServerMessage::Produced(producer.id()))
    }

    async fn create_consumer_transport(&mut self) -> Result<ServerMessage> {
        let router = self.registry.router()?;
        let created = self.transports.create_transport(router.as_ref()).await?;
        if let Some(previous) = self
            .registry
            .replace_recv_transport(self.connection_id, created.transport.clone())
            .await
        {
            previous.close().await;
        }

        self.consumer_state = ConsumerState::RecvTransportCreated;
        Ok(ServerMessage::CreateConsumerTransport(created.params))
    }

    async fn connect_consumer_transport(
        &mut self,
        request: ConnectTransportRequest,
    ) -> Result<ServerMessage> {
        match self.consumer_state {
            ConsumerState::Init => {
                return Err(SignalError::ProtocolViolation(
                    "consumer transport not created".to_string(),
                ));
            }
            ConsumerState::RecvTransportConnected | ConsumerState::Consuming => {
                return Err(SignalError::ProtocolViolation(
                    "consumer transport already connected".to_string(),
                ));
            }
            ConsumerState::RecvTransportCreated => {}
        }

        let transport = self
            .registry
            .recv_transport(self.connection_id)
            .await
            .ok_or_else(|| SignalError::NotFound("Consumer transport not found".to_string()))?;
        self.transports
            .connect_transport(transport.as_ref(), request.dtls_parameters)
            .await?;

        self.consumer_state = ConsumerState::RecvTransportConnected;
        Ok(ServerMessage::ConsumerConnected(
            "consumer transport connected".to_string(),
        ))
    }

    async fn consume(&mut self, request: ConsumeRequest) -> Result<ServerMessage> {
        if !matches!(
            self.consumer_state,
            ConsumerState::RecvTransportConnected | ConsumerState::Consuming
        ) {
            return Err(SignalError::ProtocolViolation(
                "consumer transport not connected".to_string(),
            ));
        }

        let producer = self.registry.lookup_producer(request.producer_id).await?;
        let rtp_capabilities = request
            .rtp_capabilities
            .ok_or_else(|| SignalError::ProtocolViolation("Missing rtpCapabilities".to_string()))?;

        let compatible = tokio::time::timeout(
            self.timeout,
            self.registry.can_consume(producer.id(), &rtp_capabilities),
        )
        .await
        .map_err(|_| SignalError::Timeout("canConsume"))??;
        if !compatible {
            return Err(SignalError::CapabilityMismatch(format!(
                "no common codec for the {} producer",
                producer.kind()
            )));
        }

        let transport = self
            .registry
            .recv_transport(self.connection_id)
            .await
            .ok_or_else(|| SignalError::NotFound("Consumer transport not found".to_string()))?;

        // Video waits for an explicit resume so the client can attach its track first
        let paused = producer.kind() == MediaKind::Video;
        let consumer = bounded(
            "consume",
            self.timeout,
            transport.consume(producer.id(), rtp_capabilities, paused),
        )
        .await?;
        self.registry
            .add_consumer(self.connection_id, consumer.clone())
            .await;
        self.consumer_state = ConsumerState::Consuming;

        tracing::info!(
            "Connection {} consumes producer {} as {}",
            self.connection_id,
            producer.id(),
            consumer.id()
        );

        Ok(ServerMessage::Subscribed(ConsumerDescriptor {
            producer_id: producer.id(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        }))
    }

    async fn resume(&mut self, request: ResumeRequest) -> Result<ServerMessage> {
        if self.consumer_state != ConsumerState::Consuming {
            return Err(SignalError::ProtocolViolation("no consumer to resume".to_string()));
        }

        let consumer = self
            .registry
            .consumer(self.connection_id, request.consumer_id)
            .await
            .ok_or_else(|| SignalError::NotFound("Consumer not found".to_string()))?;
        bounded("resume", self.timeout, consumer.resume()).await?;

        Ok(ServerMessage::Resumed("consumer transport resumed".to_string()))
    }

    /// Releases everything the connection owns. Call after the connection left
    /// the broadcast set.
    pub async fn close(&mut self) {
        let released = self.registry.release_connection(self.connection_id).await;
        self.retire(released).await;
        self.producer_state = ProducerState::Init;
        self.consumer_state = ConsumerState::Init;
    }

    /// Closes released resources and tells everyone else their producers are gone
    async fn retire(&self, released: ReleasedConnection) {
        released.close().await;
        self.registry.prune_consumers().await;

        for producer in &released.producers {
            let notice = ServerMessage::ProducerClosed(ProducerClosedNotice { id: producer.id() });
            self.connections
                .broadcast(&notice, Some(self.connection_id))
                .await;
        }
    }
}
