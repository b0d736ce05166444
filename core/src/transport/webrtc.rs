//! WebRTC link backend (feature `webrtc`)
//!
//! One peer connection with a single data channel per remote peer. With
//! trickle enabled candidates are forwarded as they are gathered; without it
//! the description is only returned once gathering completes, so it embeds
//! every candidate (manual pairing).

use super::abstraction::TransportError;
use super::link::{LinkEvent, LinkFactory, LinkOptions, PeerLink, SdpKind, SessionDescription};
use crate::identity::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const DATA_CHANNEL_LABEL: &str = "eter-mesh";
const GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

fn link_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Link(e.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcLinkFactory;

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create_link(
        &self,
        _local: &PeerId,
        remote: &PeerId,
        options: &LinkOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let link = WebRtcLink::new(remote.clone(), options, events).await?;
        Ok(Arc::new(link))
    }
}

pub struct WebRtcLink {
    remote: PeerId,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    trickle: bool,
    closed: Arc<AtomicBool>,
}

impl WebRtcLink {
    async fn new(
        remote: PeerId,
        options: &LinkOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(link_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(link_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: options
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(link_error)?);

        let link = Self {
            remote,
            pc,
            data_channel: Arc::new(Mutex::new(None)),
            events,
            trickle: options.trickle,
            closed: Arc::new(AtomicBool::new(false)),
        };
        link.install_handlers();
        Ok(link)
    }

    fn install_handlers(&self) {
        if self.trickle {
            let events = self.events.clone();
            self.pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let events = events.clone();
                    Box::pin(async move {
                        let Some(candidate) = candidate else { return };
                        match candidate.to_json() {
                            Ok(init) => match serde_json::to_value(&init) {
                                Ok(value) => {
                                    let _ = events.send(LinkEvent::LocalCandidate(value));
                                }
                                Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                            },
                            Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                        }
                    })
                }));
        }

        let events = self.events.clone();
        let closed = self.closed.clone();
        let remote = self.remote.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let closed = closed.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    debug!("Peer {} connection state: {:?}", remote.short(), state);
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Closed
                    ) && !closed.swap(true, Ordering::SeqCst)
                    {
                        let _ = events.send(LinkEvent::Closed);
                    }
                })
            }));

        let holder = self.data_channel.clone();
        let events = self.events.clone();
        let closed = self.closed.clone();
        let remote = self.remote.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let holder = holder.clone();
                let events = events.clone();
                let closed = closed.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    info!("Peer {} opened data channel '{}'", remote.short(), dc.label());
                    Self::wire_data_channel(&dc, events, closed);
                    *holder.lock().await = Some(dc);
                })
            }));
    }

    fn wire_data_channel(
        dc: &Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<LinkEvent>,
        closed: Arc<AtomicBool>,
    ) {
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::Open);
            })
        }));

        let message_events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = message_events.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::Message(msg.data.to_vec()));
            })
        }));

        dc.on_close(Box::new(move || {
            let events = events.clone();
            let closed = closed.clone();
            Box::pin(async move {
                if !closed.swap(true, Ordering::SeqCst) {
                    let _ = events.send(LinkEvent::Closed);
                }
            })
        }));
    }

    /// Set the local description and return it, after gathering when not trickling
    async fn finish_local(&self, description: RTCSessionDescription) -> Result<String, TransportError> {
        let mut gathering = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(link_error)?;
        if !self.trickle {
            let _ = tokio::time::timeout(GATHERING_TIMEOUT, gathering.recv()).await;
        }
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::NegotiationFailed("no local description".into()))?;
        Ok(local.sdp)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(link_error)?;
        Self::wire_data_channel(&dc, self.events.clone(), self.closed.clone());
        *self.data_channel.lock().await = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(link_error)?;
        let sdp = self.finish_local(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::InvalidDescription("expected an offer".into()));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;

        let answer = self.pc.create_answer(None).await.map_err(link_error)?;
        let sdp = self.finish_local(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        if answer.kind != SdpKind::Answer {
            return Err(TransportError::InvalidDescription("expected an answer".into()));
        }
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if candidate_str.is_empty() {
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(str::to_string),
        };
        self.pc.add_ice_candidate(init).await.map_err(link_error)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let guard = self.data_channel.lock().await;
        let dc = guard
            .as_ref()
            .ok_or_else(|| TransportError::Link("data channel not open".into()))?;
        dc.send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(link_error)
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("Data channel close: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(LinkEvent::Closed);
        }
    }
}
