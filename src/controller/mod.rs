//! Master controller
//!
//! [`MasterController`] is the context object built once per process. It
//! owns the registry, the store, the observer lists, the state machine and
//! the protocol engine, and hands out read-only snapshots plus the gated
//! command methods.

mod runner;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{Config, PeerId, Result};
use crate::network::{
    establish, BatchSummary, InboundPacket, PeerRegistry, PeerSnapshot, Provisioner, RegistryStats,
    SharedRegistry, Transport,
};
use crate::protocol::{
    CommandType, ControllerState, EngineStats, EventHub, ProtocolEngine, StateChange, StateInfo,
    StateMachine,
};
use crate::storage::{BatchStore, StoredRecord, TimeRange};
use crate::util::{format_unix, unix_now};

/// Aggregate controller statistics
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    #[serde(flatten)]
    pub peers: RegistryStats,
    pub state: ControllerState,
    pub local_id: Option<PeerId>,
    pub engine: EngineStats,
}

#[derive(Serialize)]
struct Snapshot {
    exported_at: String,
    stats: ControllerStats,
    peers: Vec<PeerSnapshot>,
}

/// Mesh master controller
pub struct MasterController {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    provisioner: Option<Arc<dyn Provisioner>>,
    registry: SharedRegistry,
    store: Arc<dyn BatchStore>,
    events: Arc<EventHub>,
    state: Arc<StateMachine>,
    engine: Arc<ProtocolEngine>,
    cancel: CancellationToken,
    handlers_installed: AtomicBool,
    reconnect_exhausted: AtomicBool,
    shut_down: AtomicBool,
}

impl MasterController {
    /// Builds a controller around a transport and a store
    pub fn new(config: Config, transport: Arc<dyn Transport>, store: Arc<dyn BatchStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = PeerRegistry::new(config.peers.max_peers, config.peers.history_capacity).shared();
        let events = Arc::new(EventHub::new(config.events.max_handlers));
        let state = Arc::new(StateMachine::new(config.events.max_handlers));
        let engine = Arc::new(ProtocolEngine::new(
            config.clone(),
            transport.clone(),
            registry.clone(),
            store.clone(),
            events.clone(),
            state.clone(),
        ));

        Ok(MasterController {
            config,
            transport,
            provisioner: None,
            registry,
            store,
            events,
            state,
            engine,
            cancel: CancellationToken::new(),
            handlers_installed: AtomicBool::new(false),
            reconnect_exhausted: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Sets the provisioner used when the device key does not match
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Observer lists for batches, status, telemetry and peer-offline events
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Registers a controller state observer
    pub fn on_state_change<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.state.on_change(handler)
    }

    pub fn state(&self) -> ControllerState {
        self.state.current()
    }

    pub fn state_info(&self) -> StateInfo {
        self.state.info()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Connects and verifies the device
    ///
    /// Installs the transport callbacks on first use. Ends in `Ready` or
    /// `Error`. Calling it again from `Error` starts over from `Disconnected`.
    pub async fn initialize(&self) -> Result<()> {
        self.install_handlers();
        self.reconnect_exhausted.store(false, Ordering::SeqCst);
        if self.state.transition_from(ControllerState::Error, ControllerState::Disconnected)? {
            info!("Retrying initialization after an earlier failure");
        }
        self.connect_once().await
    }

    fn install_handlers(&self) {
        if self.handlers_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        // The transport holds these callbacks, so they must not keep the engine alive
        let engine: Weak<ProtocolEngine> = Arc::downgrade(&self.engine);
        self.transport.on_receive(Arc::new(move |packet: InboundPacket| {
            if let Some(engine) = engine.upgrade() {
                engine.handle_packet(packet);
            }
        }));

        let state: Weak<StateMachine> = Arc::downgrade(&self.state);
        self.transport.on_connection_change(Arc::new(move |connected: bool| {
            if connected {
                return;
            }
            if let Some(state) = state.upgrade() {
                match state.transition_from(ControllerState::Ready, ControllerState::Disconnected) {
                    Ok(true) => warn!("Device link lost"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Link loss transition rejected"),
                }
            }
        }));
    }

    async fn connect_once(&self) -> Result<()> {
        let provisioner = self.provisioner.as_deref();
        let local = establish(&self.transport, provisioner, &self.config, &self.state).await?;
        self.engine.set_local_id(Some(local.clone()));
        info!(node = %local, "Controller ready");
        Ok(())
    }

    /// Stops the control loop and closes the transport
    ///
    /// Safe to call more than once and from any task.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down controller");
        self.cancel.cancel();
        self.transport.disconnect();
        if let Err(e) = self.state.transition(ControllerState::Disconnected) {
            warn!(error = %e, "Shutdown transition rejected");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn send_command(&self, destination: &PeerId, command: CommandType, params: Vec<Bytes>) -> Result<()> {
        self.engine.send_command(destination, command, params)
    }

    pub fn broadcast_command(&self, command: CommandType, params: Vec<Bytes>) -> Result<()> {
        self.engine.broadcast_command(command, params)
    }

    pub fn request_status(&self, destination: &PeerId) -> Result<()> {
        self.engine.request_status(destination)
    }

    pub fn request_data(&self, destination: &PeerId) -> Result<()> {
        self.engine.request_data(destination)
    }

    pub fn send_heartbeat(&self, destination: Option<&PeerId>) -> Result<()> {
        self.engine.send_heartbeat(destination)
    }

    pub fn send_position(&self, latitude: Option<f64>, longitude: Option<f64>, altitude: Option<i32>) -> Result<()> {
        self.engine.send_position(latitude, longitude, altitude)
    }

    /// All known peers ordered by id
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.lock().list()
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerSnapshot> {
        self.registry.lock().get(id)
    }

    pub fn online_peers(&self) -> Vec<PeerSnapshot> {
        self.registry.lock().online()
    }

    /// Most recent batches of a peer, newest first
    pub fn peer_batches(&self, id: &PeerId, limit: usize) -> Option<Vec<BatchSummary>> {
        let batches = self.registry.lock().batches(id, limit)?;
        Some(batches.iter().map(BatchSummary::from).collect())
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            peers: self.registry.lock().stats(),
            state: self.state.current(),
            local_id: self.engine.local_id(),
            engine: self.engine.stats(),
        }
    }

    /// Stored records of one peer, or all peers, in time order
    pub fn query_records(&self, peer: Option<&PeerId>, range: TimeRange) -> Result<Vec<StoredRecord>> {
        self.store.records_in_range(peer, range)
    }

    /// Writes stats and peer snapshots as pretty JSON
    pub fn export_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = Snapshot {
            exported_at: format_unix(unix_now()),
            stats: self.stats(),
            peers: self.peers(),
        };
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &snapshot).map_err(std::io::Error::from)?;
        info!(path = %path.as_ref().display(), peers = snapshot.peers.len(), "Exported controller snapshot");
        Ok(())
    }
}

impl Drop for MasterController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
