//! Endpoints: session registry and master reconnection

use crate::session::Session;
use crate::wire::PacketKind;
use muster_metrics::TrafficMetrics;
use muster_primitives::{ObjectId, ProcessAddr, ProcessType};
use muster_runtime::{
    EndpointHook, Runtime, SessionKey, Shutdownable, ShutdownFuture, ShutdownGate,
};
use muster_value::Doc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

const MASTER_RECONNECT_BASE: Duration = Duration::from_millis(500);
const MASTER_RECONNECT_CAP: Duration = Duration::from_millis(4000);

/// Creates outbound sessions for an endpoint; implemented by the WebSocket
/// transport and by test mocks.
pub trait SessionConnector: Send + Sync {
    /// Dial `url`, returning the session once created (it connects in the
    /// background)
    fn connect(&self, endpoint: &Arc<Endpoint>, url: &str) -> Option<Arc<Session>>;
}

struct EndpointState {
    sessions: Vec<Arc<Session>>,
    master_url: String,
    master_session: Weak<Session>,
    reconnect_delay: Duration,
    reconnect_scheduled: bool,
}

/// The transport endpoint: owns every session of the process and keeps the
/// outbound "master" connection alive with exponential backoff.
pub struct Endpoint {
    runtime: Arc<Runtime>,
    state: Mutex<EndpointState>,
    connector: Mutex<Option<Arc<dyn SessionConnector>>>,
    metrics: Arc<TrafficMetrics>,
    shutdown_gate: ShutdownGate,
    self_weak: Weak<Endpoint>,
}

impl Endpoint {
    /// Create an endpoint and install it as the runtime's transport hook
    pub fn new(runtime: Arc<Runtime>) -> Arc<Endpoint> {
        let endpoint = Arc::new_cyclic(|self_weak: &Weak<Endpoint>| Endpoint {
            runtime: runtime.clone(),
            state: Mutex::new(EndpointState {
                sessions: Vec::new(),
                master_url: String::new(),
                master_session: Weak::new(),
                reconnect_delay: Duration::ZERO,
                reconnect_scheduled: false,
            }),
            connector: Mutex::new(None),
            metrics: Arc::new(TrafficMetrics::new()),
            shutdown_gate: ShutdownGate::new(),
            self_weak: self_weak.clone(),
        });
        runtime.set_endpoint_hook(Arc::downgrade(&endpoint) as Weak<dyn EndpointHook>);
        endpoint
    }

    /// The owning runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The endpoint's traffic metrics, shared with its sessions
    pub fn metrics(&self) -> &Arc<TrafficMetrics> {
        &self.metrics
    }

    /// Install the outbound connector
    pub fn set_connector(&self, connector: Arc<dyn SessionConnector>) {
        *self.connector.lock() = Some(connector);
    }

    /// Register a session
    pub fn add_session(&self, session: Arc<Session>) {
        debug_assert!(!self.shutdown_gate.is_started());
        let mut state = self.state.lock();
        state.sessions.push(session);
        self.metrics.set_live_sessions(state.sessions.len());
    }

    /// Every registered session
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().sessions.clone()
    }

    /// The session with the given key
    pub fn find_session(&self, key: SessionKey) -> Option<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|session| session.key() == key)
            .cloned()
    }

    /// Set the master URL and start connecting to it
    pub fn set_master_url(&self, url: impl Into<String>) {
        self.state.lock().master_url = url.into();
        self.try_connect_master();
    }

    /// The current master session, if connected
    pub fn master_session(&self) -> Option<Arc<Session>> {
        self.state.lock().master_session.upgrade()
    }

    /// Dial a peer URL through the installed connector
    pub fn make_session(&self, url: &str) -> Option<Arc<Session>> {
        let Some(endpoint) = self.self_weak.upgrade() else {
            return None;
        };
        let connector = self.connector.lock().clone()?;
        connector.connect(&endpoint, url)
    }

    /// Drop a session from the registry and retry the master connection
    pub(crate) fn on_session_closed(&self, key: SessionKey) {
        {
            let mut state = self.state.lock();
            state.sessions.retain(|session| session.key() != key);
            if let Some(master) = state.master_session.upgrade() {
                if master.key() == key {
                    state.master_session = Weak::new();
                }
            }
            self.metrics.set_live_sessions(state.sessions.len());
        }
        self.try_connect_master();
    }

    /// Schedule a master connection attempt with exponential backoff.
    fn try_connect_master(&self) {
        if self.shutdown_gate.is_started() {
            return;
        }
        let delay = {
            let mut state = self.state.lock();
            if state.master_url.is_empty()
                || state.master_session.upgrade().is_some()
                || state.reconnect_scheduled
            {
                return;
            }
            state.reconnect_scheduled = true;
            state.reconnect_delay
        };

        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(endpoint) = weak.upgrade() else {
                return;
            };
            if endpoint.shutdown_gate.is_started() {
                return;
            }
            let url = {
                let mut state = endpoint.state.lock();
                state.reconnect_scheduled = false;
                state.reconnect_delay = MASTER_RECONNECT_CAP
                    .min(MASTER_RECONNECT_BASE + 2 * state.reconnect_delay);
                state.master_url.clone()
            };
            match endpoint.make_session(&url) {
                Some(session) => {
                    debug!(url, "master session dialing");
                    endpoint.state.lock().master_session = Arc::downgrade(&session);
                }
                None => {
                    warn!(url, "master connection failed");
                    endpoint.try_connect_master();
                }
            }
        });
    }

    /// Relay a federation-process-added announcement arriving on `origin`.
    ///
    /// Only cross-type links relay: a daemon-facing session forwards to
    /// non-daemon peers and vice versa, preventing mesh explosion.
    pub(crate) fn relay_federation_process_added(
        &self,
        federation_id: ObjectId,
        process_id: ObjectId,
        process_type: ProcessType,
        host: &str,
        port: &str,
        origin: SessionKey,
    ) {
        self.broadcast_added(
            federation_id,
            process_id,
            process_type,
            &ProcessAddr {
                host: host.to_owned(),
                port: port.to_owned(),
            },
            Some(origin),
        );
    }

    fn broadcast_added(
        &self,
        federation_id: ObjectId,
        process_id: ObjectId,
        process_type: ProcessType,
        addr: &ProcessAddr,
        origin: Option<SessionKey>,
    ) {
        let packet = Doc::new()
            .field("m", PacketKind::FederationProcessAdded as i32)
            .field("x", federation_id.to_hex())
            .field("id", process_id.to_hex())
            .field("type", process_type.as_i32())
            .field("host", addr.host.clone())
            .field("port", addr.port.clone())
            .build();

        let origin_is_daemon = origin
            .and_then(|key| self.find_session(key))
            .map(|session| session.process_type() == ProcessType::Daemon);

        for session in self.sessions() {
            if session.process_type() == ProcessType::None {
                continue;
            }
            if session.process_id() == process_id {
                continue;
            }
            if let Some(origin) = origin {
                if session.key() == origin {
                    continue;
                }
                let target_is_daemon = session.process_type() == ProcessType::Daemon;
                if origin_is_daemon == Some(target_is_daemon) {
                    continue;
                }
            }
            session.post_packet(packet.clone());
        }
    }
}

impl EndpointHook for Endpoint {
    fn broadcast_federation_process_added(
        &self,
        federation_id: ObjectId,
        process_id: ObjectId,
        process_type: ProcessType,
        addr: &ProcessAddr,
        origin: Option<SessionKey>,
    ) {
        self.broadcast_added(federation_id, process_id, process_type, addr, origin);
    }

    fn broadcast_federation_process_removed(&self, federation_id: ObjectId, process_id: ObjectId) {
        let packet = Doc::new()
            .field("m", PacketKind::FederationProcessRemoved as i32)
            .field("x", federation_id.to_hex())
            .field("id", process_id.to_hex())
            .build();
        for session in self.sessions() {
            if session.process_type() != ProcessType::None {
                session.post_packet(packet.clone());
            }
        }
    }

    fn connect_daemon(&self, process_id: ObjectId, addr: &ProcessAddr) {
        if addr.host.is_empty() {
            return warn!(%process_id, "cannot dial daemon without address");
        }
        let url = format!("ws://{}:{}", addr.host, addr.port);
        self.make_session(&url);
    }

    fn request_host_match(&self, lobby_id: ObjectId, match_id: ObjectId) {
        if let Some(master) = self.master_session() {
            master.send_host_request(lobby_id, match_id);
        }
    }

    fn join_session_to_federation(&self, session: SessionKey, federation_id: ObjectId) {
        if let Some(session) = self.find_session(session) {
            if session.session_federate(federation_id).is_none() {
                session.join_federation(federation_id);
            }
        }
    }

    fn leave_session_federation(&self, session: SessionKey, federation_id: ObjectId) {
        if let Some(session) = self.find_session(session) {
            if let Some(federate) = session.session_federate(federation_id) {
                if !federate.is_shutdown_started() {
                    session.leave_federation(federation_id);
                }
            }
        }
    }
}

impl Shutdownable for Endpoint {
    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            if !self.shutdown_gate.begin() {
                self.shutdown_gate.wait().await;
                return;
            }
            self.runtime.clear_endpoint_hook();
            let sessions: Vec<Arc<Session>> = {
                let mut state = self.state.lock();
                std::mem::take(&mut state.sessions)
            };
            for session in sessions {
                session.shutdown().await;
            }
            self.shutdown_gate.finish();
        })
    }
}
