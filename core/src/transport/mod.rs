//! Direct transport
//!
//! Peer-to-peer links negotiated through signaling (or a manual payload
//! exchange) and owned by the [`TransportManager`].

pub mod abstraction;
pub mod link;
pub mod loopback;
pub mod manager;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use abstraction::{LinkKind, PeerConnection, Role, TransportError, TransportEvent, TransportState};
pub use link::{LinkEvent, LinkFactory, LinkOptions, PeerLink, SdpKind, SessionDescription};
pub use loopback::LoopbackNetwork;
pub use manager::TransportManager;
#[cfg(feature = "webrtc")]
pub use webrtc::WebRtcLinkFactory;
