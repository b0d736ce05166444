// ÉTER mesh core: peers find each other, talk directly when they can,
// and fall back to the relay graph when they can't.
//
// One `MeshNode` owns one instance of every component. Nothing here is a
// process-wide singleton, so several nodes can live in one process.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod pairing;
pub mod presence;
pub mod relay;
pub mod signaling;
pub mod transport;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use channel::{ChannelError, ChannelHub, PublicChannel, PublicMessage};
pub use config::{ConfigError, DeliveryPolicy, MeshConfig};
pub use crypto::CryptoError;
pub use identity::{IdentityKeys, IdentityStore, IdentityStoreError, PeerId};
pub use pairing::{ManualPairing, PairingError, PairingRole};
pub use presence::{PeerRecord, PeerRegistry, PresenceAggregator};
pub use relay::{RelayBridge, RelayEndpoint, RelayError, RelayHealth};
pub use signaling::{SignalingChannel, SignalingError, WsSignalingClient};
pub use transport::{LinkFactory, TransportError, TransportManager};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Node already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    IdentityStore(#[from] IdentityStoreError),
}

// ============================================================================
// STATUS
// ============================================================================

/// Coarse capability state shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// A relay passed its self-test, or a direct peer is connected
    Online,
    /// Relay connected but not (yet) verified
    Searching,
    /// No relay and no direct peer
    Offline,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Searching => write!(f, "searching"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

impl NetworkStatus {
    pub fn from_parts(health: &RelayHealth, direct_peers: usize) -> Self {
        if direct_peers > 0 || (health.is_online() && health.last_self_test == Some(true)) {
            NetworkStatus::Online
        } else if health.is_online() {
            NetworkStatus::Searching
        } else {
            NetworkStatus::Offline
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Default)]
pub struct MeshNodeBuilder {
    config: MeshConfig,
    identity: Option<IdentityKeys>,
    relay_endpoints: Option<Vec<Arc<dyn RelayEndpoint>>>,
    link_factory: Option<Arc<dyn LinkFactory>>,
    signaling: Option<Arc<dyn SignalingChannel>>,
    alias: Option<String>,
}

impl MeshNodeBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Authenticated node; without one the node runs under an `anon-` id
    pub fn identity(mut self, keys: IdentityKeys) -> Self {
        self.identity = Some(keys);
        self
    }

    /// Use these relay endpoints instead of WebSocket clients for `config.relays`
    pub fn relay_endpoints(mut self, endpoints: Vec<Arc<dyn RelayEndpoint>>) -> Self {
        self.relay_endpoints = Some(endpoints);
        self
    }

    pub fn link_factory(mut self, factory: Arc<dyn LinkFactory>) -> Self {
        self.link_factory = Some(factory);
        self
    }

    /// Use this signaling channel instead of a client for `config.signaling_url`
    pub fn signaling(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(channel);
        self
    }

    /// Display name on public channels
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn build(self) -> Result<MeshNode, MeshError> {
        self.config.validate()?;

        let identity = self.identity.map(Arc::new);
        let local = identity
            .as_ref()
            .map(|keys| keys.peer_id())
            .unwrap_or_else(PeerId::anonymous);
        let alias = self
            .alias
            .unwrap_or_else(|| local.short().to_string());

        let bridge = match self.relay_endpoints {
            Some(endpoints) => RelayBridge::new(
                local.clone(),
                endpoints,
                relay::RelayBridgeConfig::from(&self.config),
            ),
            None => RelayBridge::from_config(local.clone(), &self.config),
        };

        let factory = self.link_factory.unwrap_or_else(default_link_factory);
        let transport = TransportManager::new(
            local.clone(),
            factory,
            transport::LinkOptions::with_stun(self.config.stun_servers.clone()),
        );

        let signaling = self.signaling.or_else(|| {
            self.config
                .signaling_url
                .as_ref()
                .map(|url| Arc::new(WsSignalingClient::new(url.clone())) as Arc<dyn SignalingChannel>)
        });

        let registry = Arc::new(PeerRegistry::new(
            local.clone(),
            self.config.staleness_window(),
        ));
        let channels = ChannelHub::new(
            bridge.clone(),
            transport.clone(),
            identity.clone(),
            alias,
            self.config.delivery_policy,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(MeshNode {
            config: self.config,
            local,
            identity,
            bridge,
            transport,
            registry,
            channels,
            signaling,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "webrtc")]
fn default_link_factory() -> Arc<dyn LinkFactory> {
    Arc::new(transport::WebRtcLinkFactory)
}

#[cfg(not(feature = "webrtc"))]
fn default_link_factory() -> Arc<dyn LinkFactory> {
    tracing::debug!("Built without webrtc; direct links only reach in-process peers");
    Arc::new(transport::LoopbackNetwork::new())
}

// ============================================================================
// NODE
// ============================================================================

/// One participant in the mesh
pub struct MeshNode {
    config: MeshConfig,
    local: PeerId,
    identity: Option<Arc<IdentityKeys>>,
    bridge: RelayBridge,
    transport: TransportManager,
    registry: Arc<PeerRegistry>,
    channels: ChannelHub,
    signaling: Option<Arc<dyn SignalingChannel>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MeshNode {
    pub fn builder(config: MeshConfig) -> MeshNodeBuilder {
        MeshNodeBuilder::new(config)
    }

    /// Join the mesh. Unreachable relays or signaling degrade the node
    /// instead of failing the call.
    pub async fn start(&self) -> Result<NetworkStatus, MeshError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::AlreadyStarted);
        }
        tracing::info!("Mesh node {} starting", self.local.short());

        match self.bridge.connect().await {
            Ok(connected) => tracing::info!("Connected to {} relay(s)", connected),
            Err(RelayError::NoRelaysConfigured) => {
                tracing::info!("No relays configured, direct links only")
            }
            Err(e) => tracing::warn!("Relays unavailable, retrying in background: {}", e),
        }

        let mut tasks = Vec::new();
        if let Some(signaling) = &self.signaling {
            tasks.push(self.transport.supervise_signaling(
                signaling.clone(),
                self.config.reconnect_base(),
                self.config.reconnect_max(),
            ));
        }

        tasks.push(
            PresenceAggregator::new(
                self.registry.clone(),
                self.bridge.clone(),
                self.transport.clone(),
                self.config.heartbeat_interval(),
            )
            .spawn(self.shutdown.subscribe()),
        );

        if self.bridge.connected_count() > 0 {
            let bridge = self.bridge.clone();
            tasks.push(tokio::spawn(async move {
                bridge.self_test().await;
            }));
        }
        self.tasks.lock().extend(tasks);

        Ok(self.status())
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus::from_parts(&self.bridge.health(), self.transport.connection_count())
    }

    /// Live peers right now, never counting ourselves
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    pub fn live_peers(&self) -> Vec<PeerRecord> {
        self.registry.live_peers()
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn identity(&self) -> Option<&IdentityKeys> {
        self.identity.as_deref()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn relay(&self) -> &RelayBridge {
        &self.bridge
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    pub fn health(&self) -> RelayHealth {
        self.bridge.health()
    }

    /// Run the relay round-trip check now
    pub async fn self_test(&self) -> bool {
        self.bridge.self_test().await
    }

    pub async fn pair_host(&self) -> Result<ManualPairing, MeshError> {
        Ok(ManualPairing::host(&self.transport).await?)
    }

    pub async fn pair_guest(&self) -> Result<ManualPairing, MeshError> {
        Ok(ManualPairing::guest(&self.transport).await?)
    }

    /// Leave the mesh: stop background tasks, close links and relays
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.transport.shutdown().await;
        self.bridge.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("Mesh node {} stopped", self.local.short());
    }
}
