//! Session Registry
//!
//! Single source of truth for the router, live producers (keyed by id) and the
//! transports and consumers each connection owns.

use crate::engine::{Consumer, Producer, Router, WebRtcTransport};
use crate::error::{Result, SignalError};
use relay_protocol::{ConnectionId, ConsumerId, ProducerId, RtpCapabilities, TransportId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

struct ProducerEntry {
    producer: Arc<dyn Producer>,
    owner: ConnectionId,
    transport_id: TransportId,
    /// Creation order, used to pick the most recent producer
    seq: u64,
}

/// Resources owned by one connection
#[derive(Default)]
struct ConnectionResources {
    send_transport: Option<Arc<dyn WebRtcTransport>>,
    recv_transport: Option<Arc<dyn WebRtcTransport>>,
    consumers: Vec<Arc<dyn Consumer>>,
}

/// Everything taken away from a connection when it goes away
pub struct ReleasedConnection {
    pub transports: Vec<Arc<dyn WebRtcTransport>>,
    pub producers: Vec<Arc<dyn Producer>>,
}

pub struct SessionRegistry {
    router: OnceCell<Arc<dyn Router>>,
    producers: RwLock<HashMap<ProducerId, ProducerEntry>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionResources>>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            router: OnceCell::new(),
            producers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Installs the process-wide router. Returns false if one was already set.
    pub fn install_router(&self, router: Arc<dyn Router>) -> bool {
        let id = router.id();
        let installed = self.router.set(router).is_ok();
        if installed {
            tracing::info!("Router {} installed", id);
        } else {
            tracing::warn!("Router already installed, ignoring {}", id);
        }
        installed
    }

    pub fn router(&self) -> Result<Arc<dyn Router>> {
        self.router.get().cloned().ok_or(SignalError::NotReady)
    }

    /// Registers a producer created on `transport_id` by `owner`
    pub async fn record_producer(
        &self,
        owner: ConnectionId,
        transport_id: TransportId,
        producer: Arc<dyn Producer>,
    ) {
        let id = producer.id();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.producers.write().await.insert(
            id,
            ProducerEntry {
                producer,
                owner,
                transport_id,
                seq,
            },
        );

        tracing::info!("Producer {} recorded for connection {}", id, owner);
    }

    /// Looks up a producer by id, or the most recently created one
    pub async fn lookup_producer(&self, id: Option<ProducerId>) -> Result<Arc<dyn Producer>> {
        let producers = self.producers.read().await;
        let entry = match id {
            Some(id) => producers.get(&id),
            None => producers.values().max_by_key(|entry| entry.seq),
        };

        entry
            .filter(|entry| !entry.producer.is_closed())
            .map(|entry| entry.producer.clone())
            .ok_or_else(|| SignalError::NotFound("Producer not available".to_string()))
    }

    /// Compatibility check, delegated to the router.
    ///
    /// `false` is an ordinary negotiation outcome, not an error.
    pub async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool> {
        let router = self.router()?;
        Ok(router.can_consume(producer_id, rtp_capabilities).await)
    }

    pub async fn producer_count(&self) -> usize {
        self.producers.read().await.len()
    }

    /// Sets the connection's send transport, returning the one it replaces
    /// together with the producers that lived on it (already unregistered).
    pub async fn replace_send_transport(
        &self,
        connection_id: ConnectionId,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Option<ReleasedConnection> {
        let previous = self
            .connections
            .write()
            .await
            .entry(connection_id)
            .or_default()
            .send_transport
            .replace(transport)?;

        let producers = self.remove_producers(|entry| entry.transport_id == previous.id()).await;
        Some(ReleasedConnection {
            transports: vec![previous],
            producers,
        })
    }

    /// Sets the connection's receive transport, returning the one it replaces
    pub async fn replace_recv_transport(
        &self,
        connection_id: ConnectionId,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let mut connections = self.connections.write().await;
        let resources = connections.entry(connection_id).or_default();
        let previous = resources.recv_transport.replace(transport)?;
        resources.consumers.clear();
        Some(previous)
    }

    pub async fn send_transport(&self, connection_id: ConnectionId) -> Option<Arc<dyn WebRtcTransport>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .and_then(|resources| resources.send_transport.clone())
    }

    pub async fn recv_transport(&self, connection_id: ConnectionId) -> Option<Arc<dyn WebRtcTransport>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .and_then(|resources| resources.recv_transport.clone())
    }

    pub async fn add_consumer(&self, connection_id: ConnectionId, consumer: Arc<dyn Consumer>) {
        let mut connections = self.connections.write().await;
        let consumers = &mut connections.entry(connection_id).or_default().consumers;
        consumers.retain(|c| !c.is_closed());
        consumers.push(consumer);
    }

    /// Forgets consumers whose producer went away, on every connection
    pub async fn prune_consumers(&self) {
        for resources in self.connections.write().await.values_mut() {
            resources.consumers.retain(|c| !c.is_closed());
        }
    }

    /// A consumer of this connection by id, or its most recent live one
    pub async fn consumer(
        &self,
        connection_id: ConnectionId,
        id: Option<ConsumerId>,
    ) -> Option<Arc<dyn Consumer>> {
        let connections = self.connections.read().await;
        let consumers = &connections.get(&connection_id)?.consumers;
        match id {
            Some(id) => consumers.iter().find(|c| c.id() == id).cloned(),
            None => consumers.iter().rev().find(|c| !c.is_closed()).cloned(),
        }
    }

    /// Drops every trace of a connection.
    ///
    /// The caller closes the returned transports; producers are already
    /// unregistered so no `consume` can pick them up any more.
    pub async fn release_connection(&self, connection_id: ConnectionId) -> ReleasedConnection {
        let resources = self
            .connections
            .write()
            .await
            .remove(&connection_id)
            .unwrap_or_default();

        let producers = self.remove_producers(|entry| entry.owner == connection_id).await;
        let transports = resources
            .send_transport
            .into_iter()
            .chain(resources.recv_transport)
            .collect();

        ReleasedConnection {
            transports,
            producers,
        }
    }

    async fn remove_producers<F>(&self, predicate: F) -> Vec<Arc<dyn Producer>>
    where
        F: Fn(&ProducerEntry) -> bool,
    {
        let mut producers = self.producers.write().await;
        let ids: Vec<ProducerId> = producers
            .iter()
            .filter(|(_, entry)| predicate(*entry))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| producers.remove(&id))
            .map(|entry| entry.producer)
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleasedConnection {
    /// Closes the transports through the engine (cascading to producers and consumers)
    pub async fn close(&self) {
        for producer in &self.producers {
            producer.close().await;
        }
        for transport in &self.transports {
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::local::LocalEngine;
    use crate::engine::Worker;
    use relay_protocol::{
        CodecParameters, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtcpParameters,
        RtpCodecParameters, RtpParameters,
    };

    async fn registry() -> SessionRegistry {
        let config = Config::default();
        let worker = LocalEngine::new().spawn_worker(&config.worker.settings()).unwrap();
        let router = worker.create_router(&config.router.media_codecs).await.unwrap();
        let registry = SessionRegistry::new();
        registry.install_router(router);
        registry
    }

    async fn connected_transport(registry: &SessionRegistry) -> Arc<dyn WebRtcTransport> {
        let options = Config::default().webrtc.transport_options();
        let transport = registry
            .router()
            .unwrap()
            .create_webrtc_transport(&options)
            .await
            .unwrap();
        transport
            .connect(DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "00:11".to_string(),
                }],
            })
            .await
            .unwrap();
        transport
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![],
            rtcp: RtcpParameters::default(),
        }
    }

    #[tokio::test]
    async fn test_router_only_installed_once() {
        let registry = registry().await;
        let config = Config::default();
        let worker = LocalEngine::new().spawn_worker(&config.worker.settings()).unwrap();
        let other = worker.create_router(&config.router.media_codecs).await.unwrap();

        let first = registry.router().unwrap().id();
        assert!(!registry.install_router(other));
        assert_eq!(registry.router().unwrap().id(), first);
    }

    #[tokio::test]
    async fn test_lookup_picks_latest_producer() {
        let registry = registry().await;
        let owner = ConnectionId::new();
        let transport = connected_transport(&registry).await;

        assert!(matches!(
            registry.lookup_producer(None).await,
            Err(SignalError::NotFound(_))
        ));

        let first = transport.produce(MediaKind::Video, vp8()).await.unwrap();
        registry.record_producer(owner, transport.id(), first.clone()).await;
        let second = transport.produce(MediaKind::Video, vp8()).await.unwrap();
        registry.record_producer(owner, transport.id(), second.clone()).await;

        assert_eq!(registry.producer_count().await, 2);
        assert_eq!(registry.lookup_producer(None).await.unwrap().id(), second.id());
        assert_eq!(
            registry.lookup_producer(Some(first.id())).await.unwrap().id(),
            first.id()
        );
        assert!(registry.lookup_producer(Some(ProducerId::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_release_connection_unregisters_producers() {
        let registry = registry().await;
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();

        let send = connected_transport(&registry).await;
        registry.replace_send_transport(alice, send.clone()).await;
        let producer = send.produce(MediaKind::Video, vp8()).await.unwrap();
        registry.record_producer(alice, send.id(), producer.clone()).await;

        let recv = connected_transport(&registry).await;
        registry.replace_recv_transport(bob, recv.clone()).await;
        let consumer = recv
            .consume(producer.id(), registry.router().unwrap().rtp_capabilities().clone(), true)
            .await
            .unwrap();
        registry.add_consumer(bob, consumer.clone()).await;

        let released = registry.release_connection(alice).await;
        assert_eq!(released.transports.len(), 1);
        assert_eq!(released.producers.len(), 1);
        released.close().await;

        assert!(send.is_closed());
        assert!(consumer.is_closed());
        assert!(registry.send_transport(alice).await.is_none());
        assert!(registry.lookup_producer(Some(producer.id())).await.is_err());
        assert!(!registry
            .can_consume(producer.id(), registry.router().unwrap().rtp_capabilities())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_replacing_send_transport_returns_its_producers() {
        let registry = registry().await;
        let owner = ConnectionId::new();

        let first = connected_transport(&registry).await;
        assert!(registry.replace_send_transport(owner, first.clone()).await.is_none());
        let producer = first.produce(MediaKind::Video, vp8()).await.unwrap();
        registry.record_producer(owner, first.id(), producer.clone()).await;

        let second = connected_transport(&registry).await;
        let released = registry
            .replace_send_transport(owner, second.clone())
            .await
            .unwrap();

        assert_eq!(released.transports[0].id(), first.id());
        assert_eq!(released.producers[0].id(), producer.id());
        assert_eq!(registry.send_transport(owner).await.unwrap().id(), second.id());
        assert_eq!(registry.producer_count().await, 0);
    }

    #[tokio::test]
    async fn test_consumer_lookup() {
        let registry = registry().await;
        let owner = ConnectionId::new();
        assert!(registry.consumer(owner, None).await.is_none());

        let send = connected_transport(&registry).await;
        let producer = send.produce(MediaKind::Video, vp8()).await.unwrap();
        let recv = connected_transport(&registry).await;
        registry.replace_recv_transport(owner, recv.clone()).await;

        let caps = registry.router().unwrap().rtp_capabilities().clone();
        let first = recv.consume(producer.id(), caps.clone(), true).await.unwrap();
        let second = recv.consume(producer.id(), caps, true).await.unwrap();
        registry.add_consumer(owner, first.clone()).await;
        registry.add_consumer(owner, second.clone()).await;

        assert_eq!(registry.consumer(owner, None).await.unwrap().id(), second.id());
        assert_eq!(
            registry.consumer(owner, Some(first.id())).await.unwrap().id(),
            first.id()
        );
        assert!(registry.consumer(owner, Some(ConsumerId::new())).await.is_none());

        second.close().await;
        assert_eq!(registry.consumer(owner, None).await.unwrap().id(), first.id());

        registry.prune_consumers().await;
        assert!(registry.consumer(owner, Some(second.id())).await.is_none());
        assert_eq!(registry.consumer(owner, None).await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_not_ready_without_router() {
        let registry = SessionRegistry::new();
        assert!(matches!(registry.router(), Err(SignalError::NotReady)));
        assert!(matches!(
            registry.can_consume(ProducerId::new(), &RtpCapabilities::default()).await,
            Err(SignalError::NotReady)
        ));
    }
}
