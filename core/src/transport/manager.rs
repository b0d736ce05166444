//! Transport Manager: owns every direct connection of this node
//!
//! Each connection is driven by exactly one task that owns its link, its
//! outbound queue and its link events. The shared map only holds handles and
//! state, so callers never block on a slow peer.

use super::abstraction::{LinkKind, PeerConnection, Role, TransportError, TransportEvent, TransportState};
use super::link::{LinkEvent, LinkFactory, LinkOptions, PeerLink, SessionDescription};
use crate::config::backoff_duration;
use crate::identity::PeerId;
use crate::signaling::{Signal, SignalEnvelope, SignalingChannel, SignalingEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Outbound messages buffered per peer before sends start failing
const SEND_QUEUE_DEPTH: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Links that never open are abandoned after this long
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Manual pairing waits on a human carrying payloads between devices
const MANUAL_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(600);

struct ConnectionEntry {
    generation: u64,
    role: Role,
    kind: LinkKind,
    state: TransportState,
    link: Option<Arc<dyn PeerLink>>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    /// Remote candidates that arrived before the link existed
    pending_candidates: Vec<Value>,
}

struct ManagerInner {
    local: PeerId,
    factory: Arc<dyn LinkFactory>,
    options: LinkOptions,
    connections: RwLock<HashMap<PeerId, ConnectionEntry>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    signaling: RwLock<Option<Arc<dyn SignalingChannel>>>,
    /// Flipped once by `shutdown`; stops signaling supervision
    closing: watch::Sender<bool>,
}

/// Handle to the direct transport. Cloning shares the same connections.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn new(local: PeerId, factory: Arc<dyn LinkFactory>, options: LinkOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                local,
                factory,
                options,
                connections: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events,
                signaling: RwLock::new(None),
                closing,
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    /// Connected/disconnected/data notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, peer_id: &PeerId) -> TransportState {
        self.inner
            .connections
            .read()
            .get(peer_id)
            .map(|e| e.state)
            .unwrap_or(TransportState::Idle)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .read()
            .iter()
            .filter(|(_, e)| e.state == TransportState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|e| e.state == TransportState::Connected)
            .count()
    }

    pub fn snapshot(&self) -> Vec<PeerConnection> {
        self.inner
            .connections
            .read()
            .iter()
            .map(|(id, e)| PeerConnection {
                peer_id: id.clone(),
                state: e.state,
                role: e.role,
                kind: e.kind,
            })
            .collect()
    }

    /// Register with the signaling channel and react to its events until it closes
    pub async fn attach_signaling(
        &self,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<JoinHandle<()>, TransportError> {
        let events = channel.register(&self.inner.local).await?;
        *self.inner.signaling.write() = Some(channel);

        let manager = self.clone();
        Ok(tokio::spawn(async move {
            manager.pump_signaling(events).await;
            manager.inner.signaling.write().take();
        }))
    }

    /// Keep this node registered with `channel`: a failed registration or a
    /// lost connection is retried with exponential backoff until `shutdown`.
    /// Existing direct links are left alone while signaling is down.
    pub fn supervise_signaling(
        &self,
        channel: Arc<dyn SignalingChannel>,
        reconnect_base: Duration,
        reconnect_max: Duration,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let mut closing = self.inner.closing.subscribe();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if *closing.borrow() {
                    break;
                }
                match channel.register(&manager.inner.local).await {
                    Ok(events) => {
                        attempt = 0;
                        *manager.inner.signaling.write() = Some(channel.clone());
                        tokio::select! {
                            _ = manager.pump_signaling(events) => {}
                            _ = closing.changed() => break,
                        }
                        manager.inner.signaling.write().take();
                    }
                    Err(e) => warn!("Signaling registration failed: {}", e),
                }

                let delay = backoff_duration(reconnect_base, reconnect_max, attempt);
                attempt = attempt.saturating_add(1);
                debug!("Retrying signaling in {:?}", delay);
                tokio::select! {
                    _ = closing.changed() => break,
                    _ = sleep(delay) => {}
                }
            }
            debug!("Signaling supervisor for {} stopped", manager.inner.local.short());
        })
    }

    /// React to signaling events until the connection is lost
    async fn pump_signaling(&self, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::PeerJoined(peer_id) => {
                    if let Err(e) = self.connect_to(&peer_id).await {
                        warn!("Failed to initiate connection to {}: {}", peer_id.short(), e);
                    }
                }
                SignalingEvent::PeerLeft(peer_id) => {
                    self.remove_peer(&peer_id).await;
                }
                SignalingEvent::Signal(signal) => self.handle_signal(signal).await,
                SignalingEvent::Disconnected => {
                    warn!("Signaling connection lost");
                    break;
                }
            }
        }
    }

    fn signaling(&self) -> Result<Arc<dyn SignalingChannel>, TransportError> {
        self.inner
            .signaling
            .read()
            .clone()
            .ok_or(TransportError::NoSignaling)
    }

    /// Become initiator towards `peer_id`. Returns false when a connection
    /// object already exists, so a peer is never initiated twice.
    pub async fn connect_to(&self, peer_id: &PeerId) -> Result<bool, TransportError> {
        if peer_id == &self.inner.local {
            return Ok(false);
        }
        let signaling = self.signaling()?;
        let Some(generation) = self.reserve(peer_id, Role::Initiator, LinkKind::Signaled) else {
            debug!("Connection to {} already exists", peer_id.short());
            return Ok(false);
        };
        info!("Initiating connection to {}", peer_id.short());

        let result = async {
            let link = self.open_link(peer_id, generation, &self.inner.options).await?;
            let offer = link.create_offer().await?;
            signaling
                .send(SignalEnvelope::offer(
                    self.inner.local.clone(),
                    peer_id.clone(),
                    offer.sdp,
                ))
                .await?;
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(e) = result {
            self.teardown(peer_id, generation).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Feed one validated signal into the per-peer state machines
    pub async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Offer { from, sdp } => self.handle_offer(from, sdp).await,
            Signal::Answer { from, sdp } => {
                let link = self
                    .inner
                    .connections
                    .read()
                    .get(&from)
                    .filter(|e| e.role == Role::Initiator && e.state == TransportState::Negotiating)
                    .and_then(|e| e.link.clone());
                let Some(link) = link else {
                    debug!("Unexpected answer from {}", from.short());
                    return;
                };
                if let Err(e) = link.accept_answer(SessionDescription::answer(sdp)).await {
                    warn!("Answer from {} rejected: {}", from.short(), e);
                    self.remove_peer(&from).await;
                }
            }
            Signal::Candidate { from, candidate } => {
                let link = {
                    let mut connections = self.inner.connections.write();
                    match connections.get_mut(&from) {
                        Some(entry) => match &entry.link {
                            Some(link) => Some(link.clone()),
                            None => {
                                entry.pending_candidates.push(candidate.clone());
                                None
                            }
                        },
                        None => {
                            debug!("Candidate from unknown peer {}", from.short());
                            None
                        }
                    }
                };
                if let Some(link) = link {
                    if let Err(e) = link.add_candidate(candidate).await {
                        debug!("Candidate from {} rejected: {}", from.short(), e);
                    }
                }
            }
        }
    }

    async fn handle_offer(&self, from: PeerId, sdp: String) {
        let existing = self
            .inner
            .connections
            .read()
            .get(&from)
            .map(|e| (e.role, e.state, e.generation));
        match existing {
            // Both sides initiated at once; the lower id keeps the initiator role
            Some((Role::Initiator, TransportState::Negotiating, generation))
                if self.inner.local > from =>
            {
                debug!("Offer collision with {}, answering instead", from.short());
                self.teardown(&from, generation).await;
            }
            Some(_) => {
                debug!("Ignoring offer from {}, connection exists", from.short());
                return;
            }
            None => {}
        }

        let signaling = match self.signaling() {
            Ok(signaling) => signaling,
            Err(e) => {
                warn!("Cannot answer {}: {}", from.short(), e);
                return;
            }
        };
        let Some(generation) = self.reserve(&from, Role::Responder, LinkKind::Signaled) else {
            return;
        };
        info!("Answering connection from {}", from.short());

        let result = async {
            let link = self.open_link(&from, generation, &self.inner.options).await?;
            let answer = link.accept_offer(SessionDescription::offer(sdp)).await?;
            signaling
                .send(SignalEnvelope::answer(
                    self.inner.local.clone(),
                    from.clone(),
                    answer.sdp,
                ))
                .await?;
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(e) = result {
            warn!("Negotiation with {} failed: {}", from.short(), e);
            self.teardown(&from, generation).await;
        }
    }

    /// Create a connection negotiated out of band (manual pairing).
    /// The caller drives offer/answer on the returned link.
    pub async fn open_manual(&self, peer_id: &PeerId, role: Role) -> Result<Arc<dyn PeerLink>, TransportError> {
        let generation = self
            .reserve(peer_id, role, LinkKind::Manual)
            .ok_or_else(|| TransportError::AlreadyConnected(peer_id.clone()))?;
        match self
            .open_link(peer_id, generation, &LinkOptions::air_gapped())
            .await
        {
            Ok(link) => Ok(link),
            Err(e) => {
                self.teardown(peer_id, generation).await;
                Err(e)
            }
        }
    }

    /// Queue `data` for a connected peer
    pub fn send(&self, peer_id: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let connections = self.inner.connections.read();
        let queue = connections
            .get(peer_id)
            .filter(|e| e.state == TransportState::Connected)
            .and_then(|e| e.outbound.as_ref())
            .ok_or_else(|| TransportError::ChannelNotReady(peer_id.clone()))?;
        queue.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(peer_id.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ChannelNotReady(peer_id.clone()),
        })
    }

    /// Best-effort send to every connected peer; returns how many accepted it
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let connections = self.inner.connections.read();
        let mut sent = 0;
        for (peer_id, entry) in connections.iter() {
            if entry.state != TransportState::Connected {
                continue;
            }
            match entry.outbound.as_ref().map(|q| q.try_send(data.to_vec())) {
                Some(Ok(())) => sent += 1,
                Some(Err(e)) => debug!("Broadcast to {} skipped: {}", peer_id.short(), e),
                None => {}
            }
        }
        sent
    }

    /// Tear down the connection to `peer_id`, if any. Pending sends are dropped.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let entry = self.inner.connections.write().remove(peer_id);
        match entry {
            Some(entry) => {
                self.finish(peer_id, entry).await;
                true
            }
            None => false,
        }
    }

    /// Close every connection and leave the signaling server
    pub async fn shutdown(&self) {
        self.inner.closing.send_replace(true);
        let entries: Vec<(PeerId, ConnectionEntry)> =
            self.inner.connections.write().drain().collect();
        for (peer_id, entry) in entries {
            self.finish(&peer_id, entry).await;
        }
        let signaling = self.inner.signaling.write().take();
        if let Some(signaling) = signaling {
            signaling.close().await;
        }
    }

    fn reserve(&self, peer_id: &PeerId, role: Role, kind: LinkKind) -> Option<u64> {
        let mut connections = self.inner.connections.write();
        if connections.contains_key(peer_id) {
            return None;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        connections.insert(
            peer_id.clone(),
            ConnectionEntry {
                generation,
                role,
                kind,
                state: TransportState::Negotiating,
                link: None,
                outbound: None,
                pending_candidates: Vec::new(),
            },
        );
        Some(generation)
    }

    async fn open_link(
        &self,
        peer_id: &PeerId,
        generation: u64,
        options: &LinkOptions,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link = self
            .inner
            .factory
            .create_link(&self.inner.local, peer_id, options, link_tx)
            .await?;
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        let pending = {
            let mut connections = self.inner.connections.write();
            match connections.get_mut(peer_id) {
                Some(entry) if entry.generation == generation => {
                    entry.link = Some(link.clone());
                    entry.outbound = Some(out_tx);
                    Some((entry.kind, std::mem::take(&mut entry.pending_candidates)))
                }
                _ => None,
            }
        };
        let Some((kind, pending)) = pending else {
            link.close().await;
            return Err(TransportError::NegotiationFailed(
                "connection removed during setup".into(),
            ));
        };

        let negotiation_timeout = match kind {
            LinkKind::Signaled => NEGOTIATION_TIMEOUT,
            LinkKind::Manual => MANUAL_NEGOTIATION_TIMEOUT,
        };
        self.spawn_connection_task(
            peer_id.clone(),
            generation,
            link.clone(),
            link_rx,
            out_rx,
            negotiation_timeout,
        );
        for candidate in pending {
            if let Err(e) = link.add_candidate(candidate).await {
                debug!("Buffered candidate for {} rejected: {}", peer_id.short(), e);
            }
        }
        Ok(link)
    }

    fn spawn_connection_task(
        &self,
        peer_id: PeerId,
        generation: u64,
        link: Arc<dyn PeerLink>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        negotiation_timeout: Duration,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(negotiation_timeout);
            tokio::pin!(deadline);
            let mut open = false;
            loop {
                tokio::select! {
                    _ = &mut deadline, if !open => {
                        warn!("Negotiation with {} timed out", peer_id.short());
                        break;
                    }
                    event = link_events.recv() => match event {
                        Some(LinkEvent::LocalCandidate(candidate)) => {
                            manager.forward_candidate(&peer_id, candidate).await;
                        }
                        Some(LinkEvent::Open) => {
                            open = true;
                            manager.mark_connected(&peer_id, generation);
                        }
                        Some(LinkEvent::Message(data)) => {
                            let _ = manager.inner.events.send(TransportEvent::DataReceived {
                                peer_id: peer_id.clone(),
                                data,
                            });
                        }
                        Some(LinkEvent::Closed) | None => break,
                    },
                    data = outbound.recv() => match data {
                        Some(data) => {
                            if let Err(e) = link.send(&data).await {
                                warn!("Send to {} failed: {}", peer_id.short(), e);
                                break;
                            }
                        }
                        // Entry was removed
                        None => break,
                    },
                }
            }
            manager.teardown(&peer_id, generation).await;
        });
    }

    async fn forward_candidate(&self, peer_id: &PeerId, candidate: Value) {
        let signaled = self
            .inner
            .connections
            .read()
            .get(peer_id)
            .map(|e| e.kind == LinkKind::Signaled)
            .unwrap_or(false);
        if !signaled {
            return;
        }
        match self.signaling() {
            Ok(signaling) => {
                let envelope =
                    SignalEnvelope::candidate(self.inner.local.clone(), peer_id.clone(), candidate);
                if let Err(e) = signaling.send(envelope).await {
                    debug!("Candidate for {} not sent: {}", peer_id.short(), e);
                }
            }
            Err(e) => debug!("Candidate for {} not sent: {}", peer_id.short(), e),
        }
    }

    fn mark_connected(&self, peer_id: &PeerId, generation: u64) {
        let transitioned = {
            let mut connections = self.inner.connections.write();
            match connections.get_mut(peer_id) {
                Some(entry)
                    if entry.generation == generation
                        && entry.state == TransportState::Negotiating =>
                {
                    entry.state = TransportState::Connected;
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            info!("Direct connection to {} established", peer_id.short());
            let _ = self.inner.events.send(TransportEvent::Connected {
                peer_id: peer_id.clone(),
            });
        }
    }

    /// Remove the entry if it is still the same connection, then finish it
    async fn teardown(&self, peer_id: &PeerId, generation: u64) {
        let entry = {
            let mut connections = self.inner.connections.write();
            match connections.get(peer_id) {
                Some(entry) if entry.generation == generation => connections.remove(peer_id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            self.finish(peer_id, entry).await;
        }
    }

    async fn finish(&self, peer_id: &PeerId, entry: ConnectionEntry) {
        if let Some(link) = entry.link {
            link.close().await;
        }
        info!("Connection to {} closed ({})", peer_id.short(), entry.state);
        let _ = self.inner.events.send(TransportEvent::Disconnected {
            peer_id: peer_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemorySignalingHub;
    use crate::transport::loopback::LoopbackNetwork;
    use tokio::time::timeout;

    fn manager(id: &str, network: &LoopbackNetwork) -> TransportManager {
        TransportManager::new(
            PeerId::new(id),
            Arc::new(network.clone()),
            LinkOptions::with_stun(Vec::new()),
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    async fn connected_pair() -> (TransportManager, TransportManager, Arc<MemorySignalingHub>) {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let a = manager("a", &network);
        let b = manager("b", &network);
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.attach_signaling(Arc::new(hub.channel())).await.unwrap();
        b.attach_signaling(Arc::new(hub.channel())).await.unwrap();

        assert_eq!(
            next_event(&mut a_events).await,
            TransportEvent::Connected { peer_id: "b".into() }
        );
        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::Connected { peer_id: "a".into() }
        );
        (a, b, hub)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let network = LoopbackNetwork::new();
        let a = manager("a", &network);
        assert_eq!(
            a.send(&"b".into(), b"hi".to_vec()),
            Err(TransportError::ChannelNotReady("b".into()))
        );
        assert_eq!(a.broadcast(b"hi"), 0);
        assert_eq!(a.state(&"b".into()), TransportState::Idle);
    }

    #[tokio::test]
    async fn test_connect_requires_signaling() {
        let network = LoopbackNetwork::new();
        let a = manager("a", &network);
        assert_eq!(a.connect_to(&"b".into()).await, Err(TransportError::NoSignaling));
        assert_eq!(a.connect_to(&"a".into()).await, Ok(false));
    }

    #[tokio::test]
    async fn test_peer_joined_establishes_connection() {
        let (a, b, _hub) = connected_pair().await;

        // The node already registered initiates towards the newcomer
        let a_view = a.snapshot();
        assert_eq!(a_view.len(), 1);
        assert_eq!(a_view[0].role, Role::Initiator);
        assert_eq!(b.snapshot()[0].role, Role::Responder);
        assert_eq!(a.connected_peers(), vec![PeerId::new("b")]);
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let (a, b, _hub) = connected_pair().await;
        let mut b_events = b.subscribe();

        a.send(&"b".into(), b"direct".to_vec()).unwrap();
        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::DataReceived {
                peer_id: "a".into(),
                data: b"direct".to_vec()
            }
        );

        assert_eq!(a.broadcast(b"all"), 1);
        assert!(matches!(
            next_event(&mut b_events).await,
            TransportEvent::DataReceived { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_initiation_ignored() {
        let (a, _b, _hub) = connected_pair().await;
        assert_eq!(a.connect_to(&"b".into()).await, Ok(false));
        assert_eq!(a.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_peer_notifies_both_sides_once() {
        let (a, b, _hub) = connected_pair().await;
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        assert!(a.remove_peer(&"b".into()).await);
        assert!(!a.remove_peer(&"b".into()).await);

        assert_eq!(
            next_event(&mut a_events).await,
            TransportEvent::Disconnected { peer_id: "b".into() }
        );
        assert_eq!(
            next_event(&mut b_events).await,
            TransportEvent::Disconnected { peer_id: "a".into() }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_events.try_recv().is_err());
        assert!(b_events.try_recv().is_err());

        assert_eq!(a.state(&"b".into()), TransportState::Idle);
        assert_eq!(
            b.send(&"a".into(), b"x".to_vec()),
            Err(TransportError::ChannelNotReady("a".into()))
        );
    }

    #[tokio::test]
    async fn test_peer_left_tears_down() {
        let (a, b, hub) = connected_pair().await;
        let mut a_events = a.subscribe();

        hub.disconnect(b.local_peer());
        assert_eq!(
            next_event(&mut a_events).await,
            TransportEvent::Disconnected { peer_id: "b".into() }
        );
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_stays_isolated() {
        let network = LoopbackNetwork::new();
        network.block(&"b".into());
        let hub = MemorySignalingHub::new();
        let a = manager("a", &network);
        let b = manager("b", &network);

        a.attach_signaling(Arc::new(hub.channel())).await.unwrap();
        b.attach_signaling(Arc::new(hub.channel())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 0);
        assert_eq!(a.broadcast(b"nobody"), 0);
    }

    #[tokio::test]
    async fn test_offer_collision_resolves_to_one_connection() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let a = manager("a", &network);
        let b = manager("b", &network);
        a.attach_signaling(Arc::new(hub.channel())).await.unwrap();
        b.attach_signaling(Arc::new(hub.channel())).await.unwrap();

        // b also tries to initiate; its offer must not create a second link
        let _ = b.connect_to(&"a".into()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        a.send(&"b".into(), b"still works".to_vec()).unwrap();
    }

    #[tokio::test]
    async fn test_manual_link_is_tracked() {
        let network = LoopbackNetwork::new();
        let a = manager("a", &network);
        let b = manager("b", &network);
        let mut a_events = a.subscribe();

        let host = a.open_manual(&"manual-1".into(), Role::Initiator).await.unwrap();
        let guest = b.open_manual(&"manual-2".into(), Role::Responder).await.unwrap();
        assert!(a.open_manual(&"manual-1".into(), Role::Initiator).await.is_err());

        let answer = guest.accept_offer(host.create_offer().await.unwrap()).await.unwrap();
        host.accept_answer(answer).await.unwrap();

        assert_eq!(
            next_event(&mut a_events).await,
            TransportEvent::Connected { peer_id: "manual-1".into() }
        );
        assert_eq!(a.snapshot()[0].kind, LinkKind::Manual);
        assert_eq!(a.broadcast(b"hello"), 1);
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_supervised_signaling_reregisters_after_loss() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let a = manager("a", &network);
        let b = manager("b", &network);
        let task = a.supervise_signaling(
            Arc::new(hub.channel()),
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        assert!(wait_for(|| hub.peer_count() == 1).await);

        hub.disconnect(&"a".into());
        assert_eq!(hub.peer_count(), 0);
        assert!(wait_for(|| hub.peer_count() == 1).await);

        // Back on the hub means newcomers are still reached
        let mut a_events = a.subscribe();
        b.attach_signaling(Arc::new(hub.channel())).await.unwrap();
        assert_eq!(
            next_event(&mut a_events).await,
            TransportEvent::Connected { peer_id: "b".into() }
        );

        a.shutdown().await;
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(wait_for(|| hub.peer_count() == 1).await);
        b.shutdown().await;
    }
}
