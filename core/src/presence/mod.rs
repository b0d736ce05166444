//! Presence: live peer set fed by relay pulses and direct links
//!
//! The aggregator is the only writer of the registry. It emits our own pulse
//! every heartbeat and runs one registry tick per heartbeat.

pub mod registry;

pub use registry::{PeerRecord, PeerRegistry, DIRECT_STATUS};

use crate::relay::RelayBridge;
use crate::transport::{TransportEvent, TransportManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct PresenceAggregator {
    registry: Arc<PeerRegistry>,
    bridge: RelayBridge,
    transport: TransportManager,
    heartbeat: Duration,
}

impl PresenceAggregator {
    pub fn new(
        registry: Arc<PeerRegistry>,
        bridge: RelayBridge,
        transport: TransportManager,
        heartbeat: Duration,
    ) -> Self {
        Self {
            registry,
            bridge,
            transport,
            heartbeat,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let local = self.bridge.local_peer().clone();
            let mut pulses = self.bridge.subscribe_presence().await;
            let mut transport_events = self.transport.subscribe();
            let mut ticker = tokio::time::interval(self.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut pulses_open = true;
            let mut transport_open = true;
            let mut emitting: Option<JoinHandle<()>> = None;
            info!("Presence aggregator started for {}", local.short());

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // A slow relay must not stack up pulses
                        if emitting.as_ref().map_or(true, |h| h.is_finished()) {
                            let bridge = self.bridge.clone();
                            let local = local.clone();
                            emitting = Some(tokio::spawn(async move {
                                if let Err(e) = bridge.emit_presence(&local).await {
                                    debug!("Presence pulse not written: {}", e);
                                }
                            }));
                        }
                        self.registry
                            .tick(&self.transport.connected_peers(), crate::now_millis());
                    }
                    pulse = pulses.recv(), if pulses_open => match pulse {
                        Some((peer_id, pulse)) => {
                            self.registry.observe_pulse(&peer_id, &pulse, crate::now_millis());
                        }
                        None => pulses_open = false,
                    },
                    event = transport_events.recv(), if transport_open => match event {
                        Ok(TransportEvent::Connected { peer_id }) => {
                            self.registry.refresh_direct(&peer_id, crate::now_millis());
                        }
                        Ok(TransportEvent::Disconnected { peer_id }) => {
                            self.registry.remove_direct(&peer_id);
                        }
                        Ok(TransportEvent::DataReceived { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Presence aggregator skipped {} transport events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => transport_open = false,
                    },
                }
            }

            if let Some(handle) = emitting {
                handle.abort();
            }
            info!("Presence aggregator stopped");
        })
    }
}
