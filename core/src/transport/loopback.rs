//! Loopback link backend: in-process links for tests and single-host meshes
//!
//! Offers and answers carry an opaque token that the shared network resolves
//! to the other side's link. Blocking a peer makes every negotiation that
//! involves it fail, which stands in for NAT traversal failure.

use super::abstraction::TransportError;
use super::link::{LinkEvent, LinkFactory, LinkOptions, PeerLink, SdpKind, SessionDescription};
use crate::identity::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const OFFER_PREFIX: &str = "loopback-offer ";
const ANSWER_PREFIX: &str = "loopback-answer ";

#[derive(Default)]
struct NetworkState {
    offers: Mutex<HashMap<String, Arc<LoopbackLink>>>,
    answers: Mutex<HashMap<String, Arc<LoopbackLink>>>,
    blocked: Mutex<HashSet<PeerId>>,
}

/// Shared medium for loopback links. Clones share the same medium.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future negotiation involving `peer_id` fail
    pub fn block(&self, peer_id: &PeerId) {
        self.state.blocked.lock().insert(peer_id.clone());
    }

    fn is_blocked(&self, peer_id: &PeerId) -> bool {
        self.state.blocked.lock().contains(peer_id)
    }

    /// Offer and answer tokens not yet claimed by the other side
    #[cfg(test)]
    fn pending_tokens(&self) -> usize {
        self.state.offers.lock().len() + self.state.answers.lock().len()
    }

    fn forget_token(&self, token: &str) {
        self.state.offers.lock().remove(token);
        self.state.answers.lock().remove(token);
    }
}

#[async_trait]
impl LinkFactory for LoopbackNetwork {
    async fn create_link(
        &self,
        local: &PeerId,
        remote: &PeerId,
        options: &LinkOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let network = self.clone();
        let local = local.clone();
        let remote = remote.clone();
        let trickle = options.trickle;
        let link = Arc::new_cyclic(|me| LoopbackLink {
            me: me.clone(),
            local,
            remote,
            network,
            events,
            trickle,
            peer: Mutex::new(None),
            token: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok(link)
    }
}

/// One end of a loopback connection
pub struct LoopbackLink {
    me: Weak<LoopbackLink>,
    local: PeerId,
    remote: PeerId,
    network: LoopbackNetwork,
    events: mpsc::UnboundedSender<LinkEvent>,
    trickle: bool,
    peer: Mutex<Option<Weak<LoopbackLink>>>,
    token: Mutex<Option<String>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackLink {
    fn this(&self) -> Result<Arc<LoopbackLink>, TransportError> {
        self.me
            .upgrade()
            .ok_or_else(|| TransportError::Link("link dropped".into()))
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Link("link closed".into()));
        }
        Ok(())
    }

    fn check_reachable(&self, other: &LoopbackLink) -> Result<(), TransportError> {
        if self.network.is_blocked(&self.local) || self.network.is_blocked(&other.local) {
            return Err(TransportError::NegotiationFailed(format!(
                "no route between {} and {}",
                self.local, other.local
            )));
        }
        Ok(())
    }

    fn gather(&self, token: &str) {
        if self.trickle {
            let _ = self.events.send(LinkEvent::LocalCandidate(json!({
                "candidate": format!("candidate:loopback {}", token),
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            })));
        }
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(LinkEvent::Open);
        }
    }

    fn remote_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Loopback link {} -> {} closed by remote", self.local, self.remote);
            let _ = self.events.send(LinkEvent::Closed);
        }
    }

    fn token_of<'a>(description: &'a SessionDescription, prefix: &str) -> Result<&'a str, TransportError> {
        description
            .sdp
            .strip_prefix(prefix)
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| TransportError::InvalidDescription("not a loopback description".into()))
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_live()?;
        let token = uuid::Uuid::new_v4().to_string();
        self.network
            .state
            .offers
            .lock()
            .insert(token.clone(), self.this()?);
        if let Some(previous) = self.token.lock().replace(token.clone()) {
            self.network.forget_token(&previous);
        }
        self.gather(&token);
        Ok(SessionDescription::offer(format!("{}{} {}", OFFER_PREFIX, token, self.local)))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        self.ensure_live()?;
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::InvalidDescription("expected an offer".into()));
        }
        let offer_token = Self::token_of(&offer, OFFER_PREFIX)?;
        let offerer = self
            .network
            .state
            .offers
            .lock()
            .remove(offer_token)
            .ok_or_else(|| TransportError::NegotiationFailed("offer expired or unknown".into()))?;
        self.check_reachable(&offerer)?;

        *self.peer.lock() = Some(Arc::downgrade(&offerer));
        let token = uuid::Uuid::new_v4().to_string();
        self.network
            .state
            .answers
            .lock()
            .insert(token.clone(), self.this()?);
        if let Some(previous) = self.token.lock().replace(token.clone()) {
            self.network.forget_token(&previous);
        }
        self.gather(&token);
        Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, token)))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        self.ensure_live()?;
        if answer.kind != SdpKind::Answer {
            return Err(TransportError::InvalidDescription("expected an answer".into()));
        }
        let token = Self::token_of(&answer, ANSWER_PREFIX)?;
        let answerer = self
            .network
            .state
            .answers
            .lock()
            .remove(token)
            .ok_or_else(|| TransportError::NegotiationFailed("answer expired or unknown".into()))?;
        self.check_reachable(&answerer)?;

        *self.peer.lock() = Some(Arc::downgrade(&answerer));
        self.mark_open();
        answerer.mark_open();
        Ok(())
    }

    async fn add_candidate(&self, _candidate: Value) -> Result<(), TransportError> {
        self.ensure_live()
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_live()?;
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Link("data channel not open".into()));
        }
        let peer = self
            .peer
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Link("remote end gone".into()))?;
        if peer.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Link("remote end closed".into()));
        }
        peer.events
            .send(LinkEvent::Message(data.to_vec()))
            .map_err(|_| TransportError::Link("remote end gone".into()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.token.lock().take() {
            self.network.forget_token(&token);
        }
        let _ = self.events.send(LinkEvent::Closed);
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.remote_closed();
        }
    }
}
