//! The session protocol
//!
//! One `Session` is one duplex connection to a peer process. All protocol
//! handling is serialized onto the session's task; the transport delivers
//! raw frames into [`Session::handle_frame`] and ships frames handed to
//! [`SessionTransport::send`].

use crate::endpoint::Endpoint;
use crate::latency::{LatencyHeader, LatencyTracker};
use crate::session_federate::SessionFederate;
use crate::wire::{MessageKind, PacketKind};
use bytes::Bytes;
use muster_metrics::TrafficMetrics;
use muster_ownership::{
    is_valid_state_after_operation, is_valid_state_before_operation, OwnershipOperation,
};
use muster_primitives::{ObjectChange, ObjectId, ProcessAuth, ProcessType};
use muster_runtime::{
    ObjectRef, Runtime, RuntimeObserver, SessionKey, Shutdownable, ShutdownFuture, ShutdownGate,
    DESTRUCTOR,
};
use muster_value::{decode_value, encode_value, reason, Doc, Reason, Value};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Heartbeat emitted after this much send silence
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Heartbeat timer granularity
pub(crate) const HEARTBEAT_TICK: Duration = Duration::from_millis(100);
/// A player session with this much receive silence is shut down
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(6);
/// How long a left federation is remembered to absorb stale messages
pub(crate) const FEDERATION_FORGET_TIMEOUT: Duration = Duration::from_secs(15);

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

/// The transport half of a session: ships encoded frames to the peer.
pub trait SessionTransport: Send + Sync {
    /// Queue one frame for delivery
    fn send(&self, frame: Bytes);
    /// Tear the connection down
    fn close(&self);
}

enum SessionTask {
    Receive(Bytes),
    Send(Value),
    QueueOrSend(Value),
    Heartbeat,
    Run(Box<dyn FnOnce(&Arc<Session>) + Send>),
    Stop,
}

struct SessionState {
    process_id: ObjectId,
    process_type: ProcessType,
    subject_id: String,
    handshake_sent: bool,
    connected: bool,
    outgoing_queue: Vec<Value>,
    federates: HashMap<ObjectId, Option<Arc<SessionFederate>>>,
    service_requests: HashMap<i32, oneshot::Sender<Result<Value, Reason>>>,
    last_service_request_id: i32,
    latency: LatencyTracker,
    send_timestamp: Instant,
    receive_timestamp: Instant,
}

/// A framed duplex connection to one peer process.
pub struct Session {
    runtime: Arc<Runtime>,
    endpoint: Weak<Endpoint>,
    key: SessionKey,
    tasks: mpsc::UnboundedSender<SessionTask>,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<dyn SessionTransport>>>,
    metrics: Arc<TrafficMetrics>,
    shutdown_gate: ShutdownGate,
    self_weak: Weak<Session>,
}

impl Session {
    /// Create a session and start its task; the transport is attached
    /// separately with [`Session::set_transport`].
    pub fn new(
        runtime: Arc<Runtime>,
        endpoint: Weak<Endpoint>,
        metrics: Arc<TrafficMetrics>,
    ) -> Arc<Session> {
        let (tasks, task_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let session = Arc::new_cyclic(|self_weak: &Weak<Session>| Session {
            runtime,
            endpoint,
            key: SessionKey(NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed)),
            tasks,
            state: Mutex::new(SessionState {
                process_id: ObjectId::ZERO,
                process_type: ProcessType::None,
                subject_id: String::new(),
                handshake_sent: false,
                connected: false,
                outgoing_queue: Vec::new(),
                federates: HashMap::new(),
                service_requests: HashMap::new(),
                last_service_request_id: 0,
                latency: LatencyTracker::new(),
                send_timestamp: now,
                receive_timestamp: now,
            }),
            transport: Mutex::new(None),
            metrics,
            shutdown_gate: ShutdownGate::new(),
            self_weak: self_weak.clone(),
        });
        tokio::spawn(Self::run(Arc::downgrade(&session), task_rx));
        tokio::spawn(Self::heartbeat_loop(Arc::downgrade(&session)));
        session.runtime.add_observer(session.clone());
        session
    }

    async fn run(weak: Weak<Session>, mut tasks: mpsc::UnboundedReceiver<SessionTask>) {
        while let Some(task) = tasks.recv().await {
            let Some(session) = weak.upgrade() else {
                break;
            };
            match task {
                SessionTask::Receive(frame) => session.receive_packet(&frame),
                SessionTask::Send(packet) => session.send_packet(&packet),
                SessionTask::QueueOrSend(packet) => {
                    let connected = session.state.lock().connected;
                    if connected {
                        session.send_packet(&packet);
                    } else {
                        session.state.lock().outgoing_queue.push(packet);
                    }
                }
                SessionTask::Heartbeat => session.heartbeat_tick(),
                SessionTask::Run(f) => f(&session),
                SessionTask::Stop => break,
            }
        }
    }

    async fn heartbeat_loop(weak: Weak<Session>) {
        let mut interval = tokio::time::interval(HEARTBEAT_TICK);
        loop {
            interval.tick().await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.shutdown_gate.is_started() {
                return;
            }
            if session.tasks.send(SessionTask::Heartbeat).is_err() {
                return;
            }
        }
    }

    /// This session's key
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// The owning runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The peer's process id, zero before the handshake
    pub fn process_id(&self) -> ObjectId {
        self.state.lock().process_id
    }

    /// The peer's process type, `None` before the handshake
    pub fn process_type(&self) -> ProcessType {
        self.state.lock().process_type
    }

    /// The peer's authenticated subject id
    pub fn subject_id(&self) -> String {
        self.state.lock().subject_id.clone()
    }

    /// The smoothed one-way latency to the peer, in seconds
    pub fn latency(&self) -> f64 {
        self.state.lock().latency.latency()
    }

    /// Attach the transport
    pub fn set_transport(&self, transport: Arc<dyn SessionTransport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Feed one received frame into the session's task
    pub fn handle_frame(&self, frame: Bytes) {
        let _ = self.tasks.send(SessionTask::Receive(frame));
    }

    /// Queue a packet; sent immediately once the session is connected
    pub fn post_packet(&self, packet: Value) {
        let _ = self.tasks.send(SessionTask::QueueOrSend(packet));
    }

    fn post_send(&self, packet: Value) {
        let _ = self.tasks.send(SessionTask::Send(packet));
    }

    pub(crate) fn post_run(&self, f: impl FnOnce(&Arc<Session>) + Send + 'static) {
        let _ = self.tasks.send(SessionTask::Run(Box::new(f)));
    }

    /// The live session federate for a federation, if any
    pub fn session_federate(&self, federation_id: ObjectId) -> Option<Arc<SessionFederate>> {
        self.state
            .lock()
            .federates
            .get(&federation_id)
            .and_then(|entry| entry.clone())
    }

    /// Whether the federation is known, even as a tombstone
    pub fn is_known_federation(&self, federation_id: ObjectId) -> bool {
        self.state.lock().federates.contains_key(&federation_id)
    }

    fn find_live_federate(&self, federation_id: ObjectId) -> Option<Arc<SessionFederate>> {
        self.session_federate(federation_id)
            .filter(|federate| !federate.is_shutdown_started())
    }

    // ------------------------------------------------------------------
    // outgoing

    fn send_packet(&self, payload: &Value) {
        let header = self.state.lock().latency.generate_header();
        let envelope = Doc::new()
            .field("i", header.generated_id as i32)
            .field("r", header.received_id as i32)
            .field("t", header.idle_time as i32)
            .field("p", payload.clone())
            .build();
        let frame = encode_value(&envelope);
        self.metrics.record_packet_out();
        if let Some(transport) = self.transport.lock().clone() {
            transport.send(frame);
        }
        self.state.lock().send_timestamp = Instant::now();
    }

    /// Send the identification packet; daemons include their address
    pub fn send_handshake(&self) {
        self.post_run(|session| session.send_handshake_now());
    }

    fn send_handshake_now(&self) {
        {
            let mut state = self.state.lock();
            if state.handshake_sent {
                return;
            }
            state.handshake_sent = true;
        }
        let mut packet = Doc::new()
            .field("m", PacketKind::Handshake as i32)
            .field("pt", self.runtime.process_type().as_i32())
            .field("id", self.runtime.process_id().to_hex());
        if self.runtime.process_type() == ProcessType::Daemon {
            let addr = self.runtime.process_addr();
            packet = packet.field("host", addr.host).field("port", addr.port);
        }
        self.send_packet(&packet.build());
    }

    fn send_authenticate(&self, auth: &ProcessAuth) {
        let packet = Doc::new()
            .field("m", PacketKind::Authenticate as i32)
            .field("a", auth.access_token.clone())
            .field("s", auth.subject_id.clone())
            .field("n", auth.nickname.clone())
            .field("i", auth.image_url.clone())
            .build();
        self.send_packet(&packet);
    }

    /// Ask the peer to host a lobby/match pair
    pub fn send_host_request(&self, lobby_id: ObjectId, match_id: ObjectId) {
        let packet = Doc::new()
            .field("m", PacketKind::FederationHostingRequest as i32)
            .field("x", lobby_id.to_hex())
            .field("i", match_id.to_hex())
            .build();
        self.post_send(packet);
    }

    /// Allocate a service request id and its response channel
    pub fn generate_service_request(&self) -> (i32, oneshot::Receiver<Result<Value, Reason>>) {
        let mut state = self.state.lock();
        state.last_service_request_id += 1;
        let request_id = state.last_service_request_id;
        let (tx, rx) = oneshot::channel();
        state.service_requests.insert(request_id, tx);
        (request_id, rx)
    }

    // ------------------------------------------------------------------
    // heartbeats

    fn heartbeat_tick(&self) {
        let (connected, process_type, send_elapsed, receive_elapsed) = {
            let state = self.state.lock();
            (
                state.connected,
                state.process_type,
                state.send_timestamp.elapsed(),
                state.receive_timestamp.elapsed(),
            )
        };
        if !connected {
            return;
        }
        if process_type == ProcessType::Player && receive_elapsed > SHUTDOWN_TIMEOUT {
            debug!(session = self.key.0, "peer silent, shutting session down");
            if let Some(session) = self.self_weak.upgrade() {
                tokio::spawn(async move { session.shutdown().await });
            }
            return;
        }
        if send_elapsed >= HEARTBEAT_INTERVAL {
            self.send_packet(&Doc::new().field("m", PacketKind::Heartbeat as i32).build());
        }
    }

    // ------------------------------------------------------------------
    // incoming

    fn receive_packet(self: &Arc<Self>, frame: &Bytes) {
        self.metrics.record_packet_in();

        let flush = {
            let mut state = self.state.lock();
            state.receive_timestamp = Instant::now();
            if !state.connected {
                state.connected = true;
                true
            } else {
                false
            }
        };
        if flush {
            let queued: Vec<Value> = std::mem::take(&mut self.state.lock().outgoing_queue);
            for packet in queued {
                self.send_packet(&packet);
            }
        }

        let envelope = match decode_value(frame.clone()) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return;
            }
        };

        if envelope.get("t").has_value() {
            let header = LatencyHeader {
                generated_id: envelope.get("i").as_i32().unwrap_or(0) as u16,
                received_id: envelope.get("r").as_i32().unwrap_or(0) as u16,
                idle_time: envelope.get("t").as_i32().unwrap_or(0) as u16,
            };
            let mut state = self.state.lock();
            state.latency.receive_header(header);
            self.metrics.observe_latency(state.latency.latency());
        }

        let payload = envelope.get("p");
        let Some(kind) = payload
            .get("m")
            .as_i32()
            .and_then(|m| PacketKind::try_from(m).ok())
        else {
            warn!("dropping packet with unknown type");
            return;
        };

        match kind {
            PacketKind::Heartbeat => {}
            PacketKind::Handshake => self.on_handshake(payload),
            PacketKind::Authenticate => self.on_authenticate(payload),
            PacketKind::Messages => {
                for message in payload.get("mm").items() {
                    self.dispatch_message(message);
                }
            }
            PacketKind::FederationProcessAdded => self.on_federation_process_added(payload),
            PacketKind::FederationProcessRemoved => self.on_federation_process_removed(payload),
            PacketKind::FederationHostingRequest => self.on_federation_hosting_request(payload),
        }
    }

    fn on_handshake(self: &Arc<Self>, payload: &Value) {
        let Some(process_id) = payload
            .get("id")
            .as_str()
            .and_then(|hex| ObjectId::from_hex(hex).ok())
        else {
            return warn!("handshake: missing process id");
        };
        let Some(process_type) = payload
            .get("pt")
            .as_i32()
            .and_then(|pt| ProcessType::try_from(pt).ok())
        else {
            return warn!("handshake: missing process type");
        };

        if process_type == ProcessType::Headup
            && self.runtime.process_type_of(process_id) != ProcessType::Headup
        {
            return warn!("handshake: headup process must be pre-registered");
        }
        if !self.runtime.register_process(process_id, process_type, Some(self.key)) {
            return;
        }

        {
            let mut state = self.state.lock();
            state.process_id = process_id;
            state.process_type = process_type;
        }
        debug!(peer = %process_id, %process_type, "handshake accepted");

        if process_type == ProcessType::Daemon {
            if let Some(host) = payload.get("host").as_str() {
                let port = payload.get("port").as_str().unwrap_or("");
                self.runtime.register_process_addr(process_id, host, port);
            }
        }

        self.send_handshake_now();
        if process_type != ProcessType::None {
            self.send_authenticate(&self.runtime.process_auth());
        }

        // announce every local federation membership to the new peer
        let addr = self.runtime.process_addr();
        for federation_id in self.runtime.federation_ids() {
            if federation_id.is_zero() {
                continue;
            }
            self.send_packet(
                &Doc::new()
                    .field("m", PacketKind::FederationProcessAdded as i32)
                    .field("x", federation_id.to_hex())
                    .field("id", self.runtime.process_id().to_hex())
                    .field("type", self.runtime.process_type().as_i32())
                    .field("host", addr.host.clone())
                    .field("port", addr.port.clone())
                    .build(),
            );
        }

        if process_type == ProcessType::Headup && self.session_federate(ObjectId::ZERO).is_none() {
            self.join_federation(ObjectId::ZERO);
        }

        // rejoin the federations the peer is already known to be part of
        for federation_id in self.runtime.process_federations(process_id) {
            if let Some(federation) = self.runtime.acquire_federation(federation_id, true) {
                if self.session_federate(federation_id).is_none() {
                    self.join_federation(federation_id);
                }
                self.runtime.release_federation(&federation);
            }
        }
    }

    fn on_authenticate(&self, payload: &Value) {
        let (process_id, process_type) = {
            let state = self.state.lock();
            (state.process_id, state.process_type)
        };
        if process_type == ProcessType::None {
            return;
        }
        let auth = ProcessAuth {
            access_token: payload.get("a").as_str().unwrap_or("").to_owned(),
            subject_id: payload.get("s").as_str().unwrap_or("").to_owned(),
            nickname: payload.get("n").as_str().unwrap_or("").to_owned(),
            image_url: payload.get("i").as_str().unwrap_or("").to_owned(),
        };
        self.state.lock().subject_id = auth.subject_id.clone();
        self.runtime.register_process_auth(process_id, auth.clone());
        if process_type == ProcessType::Headup {
            self.runtime
                .register_process_auth(self.runtime.process_id(), auth);
        }
    }

    fn dispatch_message(self: &Arc<Self>, message: &Value) {
        let Some(kind) = message
            .get("m")
            .as_i32()
            .and_then(|m| MessageKind::try_from(m).ok())
        else {
            return;
        };
        self.metrics.record_message_in();
        match kind {
            MessageKind::None => {}
            MessageKind::ObjectChanges => self.on_object_changes(message),
            MessageKind::EventDispatch => self.on_event_dispatch(message),
            MessageKind::ServiceRequest => self.on_service_request(message),
            MessageKind::ServiceFulfill => self.on_service_response(message, true),
            MessageKind::ServiceReject => self.on_service_response(message, false),
            MessageKind::RoutingRequestDownstream => self.on_routing_message(
                message,
                kind,
                OwnershipOperation::NegotiatedOwnershipDivestiture,
            ),
            MessageKind::RoutingEnableDownstream => self.on_routing_message(
                message,
                kind,
                OwnershipOperation::ForcedOwnershipDivestiture,
            ),
            MessageKind::RoutingRequestUpstream => {
                self.on_routing_message(message, kind, OwnershipOperation::OwnershipAcquisition)
            }
            MessageKind::RoutingEnableUpstream => self.on_routing_message(
                message,
                kind,
                OwnershipOperation::ForcedOwnershipAcquisition,
            ),
            MessageKind::RoutingUpstreamDenied => {
                self.on_routing_message(message, kind, OwnershipOperation::OwnershipReleaseFailure)
            }
            MessageKind::RoutingDisable => {
                self.on_routing_message(message, kind, OwnershipOperation::None)
            }
        }
    }

    fn federation_id_of(&self, message: &Value) -> Option<ObjectId> {
        message
            .get("x")
            .as_str()
            .and_then(|hex| ObjectId::from_hex(hex).ok())
    }

    fn on_object_changes(self: &Arc<Self>, message: &Value) {
        let Some(federation_id) = self.federation_id_of(message) else {
            return warn!("object changes: missing federation id");
        };
        let Some(federate) = self.find_live_federate(federation_id) else {
            if !self.is_known_federation(federation_id) {
                debug!(%federation_id, "object changes: federation/federate not found");
            }
            return;
        };
        let Some(class_name) = message.get("c").as_str() else {
            return warn!("object changes: missing object class");
        };
        let Some(object_id) = message.get("i").as_object_id() else {
            return warn!("object changes: missing object id");
        };
        let change = message
            .get("t")
            .as_i32()
            .and_then(|t| ObjectChange::try_from(t).ok())
            .unwrap_or(ObjectChange::None);

        if change == ObjectChange::Delete {
            let Some(object) = federate.federate().get_object(object_id) else {
                return;
            };
            if !object.can_delete() {
                if !federate.federate().ownership_policy(DESTRUCTOR) {
                    return warn!(class = class_name, %object_id, "spurious object delete blocked");
                }
                if object.pending_operation_is_none(DESTRUCTOR) {
                    let _ = object.modify_object_ownership_state(
                        OwnershipOperation::ForcedOwnershipAcquisition,
                    );
                }
            }
            if object.can_delete() {
                let _ = object.delete();
            } else {
                warn!(%object_id, "delete failed: destructor not acquirable");
            }
            return;
        }

        let object = match federate.federate().get_object(object_id) {
            Some(object) => object,
            None => {
                match federate.federate().get_object_class(class_name).create(object_id) {
                    Ok(object) => object,
                    Err(error) => {
                        return warn!(%error, "object changes: create failed");
                    }
                }
            }
        };

        let latency = self.latency();
        for (name, entry) in message.get("p").fields() {
            let process_id = entry.get("p").as_object_id().unwrap_or(ObjectId::ZERO);
            let writable = object.can_set(name)
                || self.try_auto_correct_routing(&federate, federation_id, &object, name, process_id);
            if writable {
                let delay = entry.get("t").as_f64().unwrap_or(0.0) - latency;
                let _ = object.set_from_remote(
                    name,
                    entry.get("v").clone(),
                    delay,
                    self.key,
                    process_id,
                );
            }
        }
    }

    /// When a remote write is not locally writable, either cut a routing
    /// loop, defer to the higher-precedence side, or take the property over.
    fn try_auto_correct_routing(
        &self,
        federate: &Arc<SessionFederate>,
        federation_id: ObjectId,
        object: &ObjectRef,
        property: &str,
        process_id: ObjectId,
    ) -> bool {
        let (source_session, known_process) = object.remote_source(property);
        if source_session != Some(self.key) && process_id == known_process {
            // the same producer already reaches us through another session
            federate.post_message(
                Doc::new()
                    .field("m", MessageKind::RoutingDisable as i32)
                    .field("x", federation_id.to_hex())
                    .field("i", object.object_id())
                    .field("p", property)
                    .build(),
            );
            return false;
        }

        let spurious = !federate.federate().ownership_policy(property);
        let (peer_type, peer_id) = {
            let state = self.state.lock();
            (state.process_type, state.process_id)
        };
        if spurious
            || has_precedence_less_than(
                peer_type,
                peer_id,
                self.runtime.process_type(),
                self.runtime.process_id(),
            )
        {
            if spurious {
                warn!(property, "spurious object update blocked");
            }
            federate.post_message(
                Doc::new()
                    .field("m", MessageKind::RoutingEnableUpstream as i32)
                    .field("x", federation_id.to_hex())
                    .field("i", object.object_id())
                    .field("p", property)
                    .build(),
            );
            return false;
        }

        if object.pending_operation_is_none(property) {
            let _ = object
                .modify_ownership_state(property, OwnershipOperation::ForcedOwnershipAcquisition);
            return true;
        }
        warn!(property, "routing auto-correction raced a pending operation");
        false
    }

    fn on_event_dispatch(self: &Arc<Self>, message: &Value) {
        let Some(event) = message.get("e").as_str() else {
            return warn!("event dispatch: missing event");
        };
        let Some(federation_id) = self.federation_id_of(message) else {
            return warn!("event dispatch: missing federation id");
        };
        let Some(federate) = self.find_live_federate(federation_id) else {
            if !self.is_known_federation(federation_id) {
                debug!(%federation_id, "event dispatch: federation/federate not found");
            }
            return;
        };
        let delay = message.get("d").as_f64().unwrap_or(0.0);
        let latency = message.get("t").as_f64().unwrap_or(0.0) + self.latency();
        federate
            .federate()
            .dispatch_event(event, message.get("v").clone(), delay, latency);
    }

    fn on_service_request(self: &Arc<Self>, message: &Value) {
        let request_id = message.get("r").as_i32().unwrap_or(0);
        if request_id == 0 {
            self.post_send(make_reject_packet(request_id, 400, "missing requestId"));
            return warn!("service request: missing requestId");
        }
        let Some(service) = message.get("s").as_str().map(str::to_owned) else {
            self.post_send(make_reject_packet(request_id, 400, "missing serviceName"));
            return warn!("service request: missing serviceName");
        };
        let Some(federation_id) = self.federation_id_of(message) else {
            self.post_send(make_reject_packet(request_id, 400, "missing federationId"));
            return warn!("service request: missing federationId");
        };
        let Some(federate) = self.find_live_federate(federation_id) else {
            self.post_send(make_reject_packet(request_id, 404, "federation/federate not found"));
            return;
        };

        // daemon peers are trusted to act on behalf of any subject
        let subject_id = {
            let state = self.state.lock();
            if state.process_type == ProcessType::Daemon {
                message
                    .get("i")
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| state.subject_id.clone())
            } else {
                state.subject_id.clone()
            }
        };

        let params = message.get("v").clone();
        let session = self.self_weak.clone();
        tokio::spawn(async move {
            let result = federate
                .federate()
                .request_service(&service, params, subject_id)
                .await;
            let response = match result {
                Ok(value) => Doc::new()
                    .field("m", MessageKind::ServiceFulfill as i32)
                    .field("r", request_id)
                    .field("v", value)
                    .build(),
                Err(rejection) => Doc::new()
                    .field("m", MessageKind::ServiceReject as i32)
                    .field("r", request_id)
                    .field("v", rejection.into_value())
                    .build(),
            };
            if session.upgrade().is_some() {
                federate.post_message(response);
            }
        });
    }

    fn on_service_response(&self, message: &Value, fulfilled: bool) {
        let request_id = message.get("r").as_i32().unwrap_or(0);
        let Some(sender) = self.state.lock().service_requests.remove(&request_id) else {
            return warn!(request_id, "service response: requestId not found");
        };
        let value = message.get("v").clone();
        let _ = sender.send(if fulfilled {
            Ok(value)
        } else {
            Err(Reason::from(value))
        });
    }

    fn on_routing_message(
        self: &Arc<Self>,
        message: &Value,
        kind: MessageKind,
        operation: OwnershipOperation,
    ) {
        let Some(federation_id) = self.federation_id_of(message) else {
            return warn!("routing: missing federation id");
        };
        let Some(federate) = self.find_live_federate(federation_id) else {
            if !self.is_known_federation(federation_id) {
                debug!(%federation_id, "routing: federate not found");
            }
            return;
        };
        let Some(object_id) = message.get("i").as_object_id() else {
            return warn!("routing: missing object id");
        };
        let Some(object) = federate.federate().get_object(object_id) else {
            return debug!(%object_id, "routing: object not found");
        };
        let Some(property) = message.get("p").as_str() else {
            return warn!("routing: missing property name");
        };

        if operation == OwnershipOperation::ForcedOwnershipAcquisition {
            let exclusive_owner = federate
                .federate()
                .federation()
                .and_then(|federation| federation.exclusive_owner());
            if let Some(owner) = exclusive_owner {
                if owner != federate.federate().key() {
                    // the peer may not force ownership out of the lock holder
                    federate.notify_ownership_unavailable(&object, property);
                    return;
                }
            }
        }

        if kind == MessageKind::RoutingEnableDownstream {
            object.set_routing(property, true);
        } else if kind == MessageKind::RoutingDisable {
            object.set_routing(property, false);
            debug!(property, "routing disabled on session");
        }

        if operation != OwnershipOperation::None {
            let state = object.ownership_state(property);
            if is_valid_state_before_operation(state, operation) {
                let _ = object.modify_ownership_state(property, operation);
            } else if is_valid_state_after_operation(state, operation) {
                // redundant: the state already reflects the operation
            } else {
                debug!(
                    property,
                    %operation,
                    %state,
                    "routing operation invalid for state"
                );
            }
        }
    }

    fn on_federation_process_added(self: &Arc<Self>, payload: &Value) {
        let Some(process_id) = payload
            .get("id")
            .as_str()
            .and_then(|hex| ObjectId::from_hex(hex).ok())
        else {
            return warn!("federation process added: missing process id");
        };
        let process_type = payload
            .get("type")
            .as_i32()
            .and_then(|t| ProcessType::try_from(t).ok())
            .unwrap_or(ProcessType::None);
        if !self.runtime.register_process(process_id, process_type, None) {
            return warn!(%process_id, "federation process added: could not register process");
        }
        let Some(federation_id) = self.federation_id_of(payload) else {
            return warn!("federation process added: missing federation id");
        };
        if federation_id.is_zero() && !self.process_type().is_local() {
            return warn!("federation process added: local federation id not allowed");
        }

        let host = payload.get("host").as_str().unwrap_or("");
        let port = payload.get("port").as_str().unwrap_or("");
        if !host.is_empty() {
            self.runtime.register_process_addr(process_id, host, port);
        }

        let registered_type = self.runtime.process_type_of(process_id);
        if matches!(registered_type, ProcessType::Player | ProcessType::Daemon) {
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.relay_federation_process_added(
                    federation_id,
                    process_id,
                    registered_type,
                    host,
                    port,
                    self.key,
                );
            }
        }

        self.runtime.federation_process_added(federation_id, process_id);
    }

    fn on_federation_process_removed(&self, payload: &Value) {
        let Some(federation_id) = self.federation_id_of(payload) else {
            return warn!("federation process removed: missing federation id");
        };
        if federation_id.is_zero() && self.process_type() != ProcessType::Headup {
            return warn!("federation process removed: invalid federation id");
        }
        let Some(process_id) = payload
            .get("id")
            .as_str()
            .and_then(|hex| ObjectId::from_hex(hex).ok())
        else {
            return warn!("federation process removed: missing process id");
        };
        if self.runtime.process_type_of(process_id) == ProcessType::None {
            return warn!(%process_id, "federation process removed: invalid process");
        }
        self.runtime.federation_process_removed(federation_id, process_id);
    }

    fn on_federation_hosting_request(&self, payload: &Value) {
        let Some(lobby_id) = self.federation_id_of(payload) else {
            return warn!("hosting request: missing lobby id");
        };
        if lobby_id.is_zero() {
            return warn!("hosting request: invalid lobby id");
        }
        let Some(match_id) = payload
            .get("i")
            .as_str()
            .and_then(|hex| ObjectId::from_hex(hex).ok())
        else {
            return warn!("hosting request: missing match id");
        };
        if match_id.is_zero() {
            return warn!("hosting request: invalid match id");
        }
        let (process_type, subject_id) = {
            let state = self.state.lock();
            (state.process_type, state.subject_id.clone())
        };
        if process_type == ProcessType::None {
            return warn!("hosting request: no process");
        }
        if subject_id.is_empty() {
            return warn!("hosting request: no subject");
        }
        self.runtime.process_host_match(lobby_id, match_id, &subject_id);
    }

    // ------------------------------------------------------------------
    // federation membership

    /// Create a session federate for a federation and announce membership
    pub fn join_federation(self: &Arc<Self>, federation_id: ObjectId) {
        let process_type = self.process_type();
        debug_assert!(process_type != ProcessType::None);
        if self.shutdown_gate.is_started() {
            return;
        }
        if self.session_federate(federation_id).is_some() {
            return;
        }

        let federate = SessionFederate::new(self, federation_id, process_type);

        {
            let mut state = self.state.lock();
            if let Some(Some(_)) = state.federates.get(&federation_id) {
                let stale = federate;
                tokio::spawn(async move { stale.shutdown().await });
                return;
            }
            state.federates.insert(federation_id, Some(federate.clone()));
        }

        let addr = self.runtime.process_addr();
        self.post_packet(
            Doc::new()
                .field("m", PacketKind::FederationProcessAdded as i32)
                .field("x", federation_id.to_hex())
                .field("id", self.runtime.process_id().to_hex())
                .field("type", self.runtime.process_type().as_i32())
                .field("host", addr.host)
                .field("port", addr.port)
                .build(),
        );

        federate.startup();
    }

    /// Tear down the session federate for a federation
    pub fn leave_federation(&self, federation_id: ObjectId) {
        let Some(federate) = self.session_federate(federation_id) else {
            if !self.is_known_federation(federation_id) {
                warn!(%federation_id, "leave_federation: federate not found");
            }
            return;
        };
        tokio::spawn(async move { federate.shutdown().await });
    }

    /// Tombstone a federate that finished its shutdown, forgetting it later
    pub(crate) fn remove_federation(&self, federation_id: ObjectId, federate: &Arc<SessionFederate>) {
        let mut state = self.state.lock();
        let matches = state
            .federates
            .get(&federation_id)
            .and_then(|entry| entry.as_ref())
            .map(|existing| Arc::ptr_eq(existing, federate))
            .unwrap_or(false);
        if matches {
            state.federates.insert(federation_id, None);
            let weak = self.self_weak.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FEDERATION_FORGET_TIMEOUT).await;
                if let Some(session) = weak.upgrade() {
                    let mut state = session.state.lock();
                    if let Some(None) = state.federates.get(&federation_id) {
                        state.federates.remove(&federation_id);
                    }
                }
            });
        }
    }

    /// Whether names with the do-not-distribute prefix are filtered for this
    /// peer; local process types see everything
    pub(crate) fn do_not_distribute_prefix(&self) -> Option<char> {
        if self.process_type().is_local() {
            None
        } else {
            Some('_')
        }
    }
}

impl RuntimeObserver for Session {
    fn on_process_authenticated(&self, process_id: ObjectId, auth: &ProcessAuth) {
        if process_id == self.runtime.process_id() && !auth.access_token.is_empty() {
            let auth = auth.clone();
            self.post_run(move |session| session.send_authenticate(&auth));
        }
    }
}

impl Shutdownable for Session {
    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            if !self.shutdown_gate.begin() {
                self.shutdown_gate.wait().await;
                return;
            }
            debug!(session = self.key.0, "session shutdown");

            if let Some(session) = self.self_weak.upgrade() {
                self.runtime
                    .remove_observer(&(session as Arc<dyn RuntimeObserver>));
            }

            let federates: Vec<Arc<SessionFederate>> = {
                let state = self.state.lock();
                state.federates.values().filter_map(|f| f.clone()).collect()
            };
            for federate in federates {
                federate.federate().clear_object_callback();
                federate.federate().clear_event_callback();
                federate.federate().clear_service_callback();
                federate.shutdown().await;
            }

            if let Some(transport) = self.transport.lock().take() {
                transport.close();
            }

            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.on_session_closed(self.key);
            }

            let (process_id, process_type) = {
                let state = self.state.lock();
                (state.process_id, state.process_type)
            };
            if process_type != ProcessType::None {
                if self.runtime.is_process_active(process_id) {
                    self.runtime.unregister_process_session(process_id);
                } else {
                    self.runtime.unregister_process(process_id);
                }
            }

            let _ = self.tasks.send(SessionTask::Stop);
            self.shutdown_gate.finish();
        })
    }
}

/// Build a `Messages` packet carrying a single service rejection
fn make_reject_packet(request_id: i32, status: i32, message: &str) -> Value {
    Doc::new()
        .field("m", PacketKind::Messages as i32)
        .field(
            "mm",
            muster_value::Arr::new()
                .item(
                    Doc::new()
                        .field("m", MessageKind::ServiceReject as i32)
                        .field("r", request_id)
                        .field("v", reason(status, message))
                        .build(),
                )
                .build(),
        )
        .build()
}

fn precedence_factor(process_type: ProcessType) -> u64 {
    match process_type {
        ProcessType::Daemon => 2,
        ProcessType::Player => 1,
        _ => 0,
    }
}

fn id_hash(process_id: ObjectId) -> u64 {
    let mut hasher = DefaultHasher::new();
    process_id.hash(&mut hasher);
    hasher.finish()
}

/// Ordering used to break write conflicts: daemons over players over the
/// rest, ties broken by a process-id hash.
fn has_precedence_less_than(
    type1: ProcessType,
    id1: ObjectId,
    type2: ProcessType,
    id2: ObjectId,
) -> bool {
    let f1 = precedence_factor(type1);
    let f2 = precedence_factor(type2);
    if f1 == f2 {
        id_hash(id1) < id_hash(id2)
    } else {
        f1 < f2
    }
}
