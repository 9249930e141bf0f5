//! The process-wide runtime registry

use crate::federation::Federation;
use crate::object::SessionKey;
use crate::shutdown::{Shutdownable, ShutdownFuture, ShutdownGate};
use dashmap::DashMap;
use muster_primitives::{FederationType, ObjectId, ProcessAddr, ProcessAuth, ProcessType};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Receives process lifecycle notifications.
///
/// Observers are the extension point for supervision layers; callbacks run
/// on spawned tasks, never inside runtime locks.
pub trait RuntimeObserver: Send + Sync {
    /// A process joined a federation known to this runtime
    fn on_process_added(
        &self,
        _federation_id: ObjectId,
        _process_id: ObjectId,
        _process_type: ProcessType,
    ) {
    }

    /// A process left a federation known to this runtime
    fn on_process_removed(&self, _federation_id: ObjectId, _process_id: ObjectId) {}

    /// A process presented authentication credentials
    fn on_process_authenticated(&self, _process_id: ObjectId, _auth: &ProcessAuth) {}
}

/// Supplies application supervisors for federations hosted by this process.
pub trait SupervisionPolicy: Send + Sync {
    /// Build a supervisor for a freshly hosted federation, or `None`
    fn make_supervisor(
        &self,
        runtime: &Arc<Runtime>,
        federation_type: FederationType,
        federation_id: ObjectId,
    ) -> Option<Arc<dyn Shutdownable>>;
}

/// Transport-side operations the runtime needs without depending on the
/// session layer.
pub trait EndpointHook: Send + Sync {
    /// Announce a federation membership to connected peers
    fn broadcast_federation_process_added(
        &self,
        federation_id: ObjectId,
        process_id: ObjectId,
        process_type: ProcessType,
        addr: &ProcessAddr,
        origin: Option<SessionKey>,
    );

    /// Announce a membership removal to connected peers
    fn broadcast_federation_process_removed(&self, federation_id: ObjectId, process_id: ObjectId);

    /// Dial an outbound connection to a daemon peer
    fn connect_daemon(&self, process_id: ObjectId, addr: &ProcessAddr);

    /// Forward a hosting request to the master session
    fn request_host_match(&self, lobby_id: ObjectId, match_id: ObjectId);

    /// Ensure the session has a federate in the federation
    fn join_session_to_federation(&self, session: SessionKey, federation_id: ObjectId);

    /// Tear down the session's federate in the federation
    fn leave_session_federation(&self, session: SessionKey, federation_id: ObjectId);
}

/// One entry of an observer's initial membership listing
#[derive(Debug, Clone, Copy)]
pub struct ProcessInfo {
    /// The federation
    pub federation_id: ObjectId,
    /// The member process
    pub process_id: ObjectId,
    /// Its type
    pub process_type: ProcessType,
}

struct ProcessEntry {
    process_type: ProcessType,
    session: Option<SessionKey>,
    addr: ProcessAddr,
    auth: ProcessAuth,
}

struct RuntimeState {
    federations: Vec<Arc<Federation>>,
    memberships: BTreeSet<(ObjectId, ObjectId)>,
    observers: Vec<Arc<dyn RuntimeObserver>>,
}

/// The process singleton: registry of processes, federations and observers.
pub struct Runtime {
    process_type: ProcessType,
    process_id: ObjectId,
    processes: DashMap<ObjectId, ProcessEntry>,
    state: Mutex<RuntimeState>,
    endpoint: Mutex<Option<Weak<dyn EndpointHook>>>,
    supervision: Mutex<Option<Arc<dyn SupervisionPolicy>>>,
    shutdown_gate: ShutdownGate,
    self_weak: Weak<Runtime>,
}

impl Runtime {
    /// Create a runtime for a process of the given type
    pub fn new(process_type: ProcessType) -> Arc<Runtime> {
        let process_id = ObjectId::create();
        let runtime = Arc::new_cyclic(|self_weak: &Weak<Runtime>| Runtime {
            process_type,
            process_id,
            processes: DashMap::new(),
            state: Mutex::new(RuntimeState {
                federations: Vec::new(),
                memberships: BTreeSet::new(),
                observers: Vec::new(),
            }),
            endpoint: Mutex::new(None),
            supervision: Mutex::new(None),
            shutdown_gate: ShutdownGate::new(),
            self_weak: self_weak.clone(),
        });
        runtime.processes.insert(
            process_id,
            ProcessEntry {
                process_type,
                session: None,
                addr: ProcessAddr::default(),
                auth: ProcessAuth::default(),
            },
        );
        debug!(%process_id, %process_type, "runtime started");
        runtime
    }

    /// This process's id
    pub fn process_id(&self) -> ObjectId {
        self.process_id
    }

    /// This process's type
    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// The type a process registered with, `None` when unknown
    pub fn process_type_of(&self, process_id: ObjectId) -> ProcessType {
        self.processes
            .get(&process_id)
            .map(|entry| entry.process_type)
            .unwrap_or(ProcessType::None)
    }

    /// A process's registered credentials
    pub fn process_auth_of(&self, process_id: ObjectId) -> ProcessAuth {
        self.processes
            .get(&process_id)
            .map(|entry| entry.auth.clone())
            .unwrap_or_default()
    }

    /// This process's credentials
    pub fn process_auth(&self) -> ProcessAuth {
        self.process_auth_of(self.process_id)
    }

    /// This process's announced address
    pub fn process_addr(&self) -> ProcessAddr {
        self.processes
            .get(&self.process_id)
            .map(|entry| entry.addr.clone())
            .unwrap_or_default()
    }

    /// This process's authenticated subject id
    pub fn subject_id(&self) -> String {
        self.process_auth().subject_id
    }

    /// The session a process is connected through
    pub fn process_session(&self, process_id: ObjectId) -> Option<SessionKey> {
        self.processes.get(&process_id).and_then(|entry| entry.session)
    }

    /// A process is active while it is this process, has a live session, or
    /// retains a federation membership
    pub fn is_process_active(&self, process_id: ObjectId) -> bool {
        if process_id == self.process_id {
            return true;
        }
        if self
            .processes
            .get(&process_id)
            .map(|entry| entry.session.is_some())
            .unwrap_or(false)
        {
            return true;
        }
        let state = self.state.lock();
        state.memberships.iter().any(|(_, pid)| *pid == process_id)
    }

    /// Install the transport hook
    pub fn set_endpoint_hook(&self, hook: Weak<dyn EndpointHook>) {
        *self.endpoint.lock() = Some(hook);
    }

    /// Remove the transport hook
    pub fn clear_endpoint_hook(&self) {
        *self.endpoint.lock() = None;
    }

    fn endpoint_hook(&self) -> Option<Arc<dyn EndpointHook>> {
        self.endpoint.lock().as_ref().and_then(|weak| weak.upgrade())
    }

    /// Install the supervision policy
    pub fn set_supervision_policy(&self, policy: Arc<dyn SupervisionPolicy>) {
        *self.supervision.lock() = Some(policy);
    }

    // ------------------------------------------------------------------
    // observers

    /// Register an observer, returning the currently known memberships
    pub fn add_observer(&self, observer: Arc<dyn RuntimeObserver>) -> Vec<ProcessInfo> {
        let mut state = self.state.lock();
        state.observers.push(observer);
        state
            .memberships
            .iter()
            .filter_map(|(federation_id, process_id)| {
                self.processes.get(process_id).map(|entry| ProcessInfo {
                    federation_id: *federation_id,
                    process_id: *process_id,
                    process_type: entry.process_type,
                })
            })
            .collect()
    }

    /// Remove a previously registered observer
    pub fn remove_observer(&self, observer: &Arc<dyn RuntimeObserver>) {
        let mut state = self.state.lock();
        state
            .observers
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    fn observers(&self) -> Vec<Arc<dyn RuntimeObserver>> {
        self.state.lock().observers.clone()
    }

    // ------------------------------------------------------------------
    // process registry

    /// Register a process or merge into its existing entry.
    ///
    /// A type or session conflicting with the existing registration is
    /// rejected.
    pub fn register_process(
        &self,
        process_id: ObjectId,
        process_type: ProcessType,
        session: Option<SessionKey>,
    ) -> bool {
        match self.processes.entry(process_id) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if process_type == ProcessType::None {
                    error!(%process_id, "register_process: missing type");
                    return false;
                }
                vacant.insert(ProcessEntry {
                    process_type,
                    session,
                    addr: ProcessAddr::default(),
                    auth: ProcessAuth::default(),
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if process_type != ProcessType::None {
                    if process_type != entry.process_type {
                        error!(%process_id, "register_process: mismatching type");
                        return false;
                    }
                    entry.process_type = process_type;
                }
                if let Some(session) = session {
                    if entry.session.is_some() && entry.session != Some(session) {
                        error!(%process_id, "register_process: mismatching session");
                        return false;
                    }
                    entry.session = Some(session);
                }
                true
            }
        }
    }

    /// Record a process's credentials and notify observers
    pub fn register_process_auth(&self, process_id: ObjectId, auth: ProcessAuth) {
        {
            let Some(mut entry) = self.processes.get_mut(&process_id) else {
                error!(%process_id, "register_process_auth: unknown process");
                return;
            };
            entry.auth = auth.clone();
        }
        for observer in self.observers() {
            let auth = auth.clone();
            let runtime = self.self_weak.clone();
            tokio::spawn(async move {
                if runtime.upgrade().is_some() {
                    observer.on_process_authenticated(process_id, &auth);
                }
            });
        }
    }

    /// Record a process's announced address
    pub fn register_process_addr(&self, process_id: ObjectId, host: &str, port: &str) {
        let Some(mut entry) = self.processes.get_mut(&process_id) else {
            error!(%process_id, "register_process_addr: unknown process");
            return;
        };
        entry.addr = ProcessAddr {
            host: host.to_owned(),
            port: port.to_owned(),
        };
    }

    /// Forget a process's session, keeping its registration
    pub fn unregister_process_session(&self, process_id: ObjectId) {
        if let Some(mut entry) = self.processes.get_mut(&process_id) {
            entry.session = None;
        }
    }

    /// Remove a process entirely
    pub fn unregister_process(&self, process_id: ObjectId) {
        self.processes.remove(&process_id);
    }

    // ------------------------------------------------------------------
    // federation membership

    /// Record that a process joined a federation; triggers observers,
    /// outbound daemon dialing, and session federate creation
    pub fn federation_process_added(&self, federation_id: ObjectId, process_id: ObjectId) {
        let Some(process) = self
            .processes
            .get(&process_id)
            .map(|entry| (entry.process_type, entry.addr.clone(), entry.session))
        else {
            return;
        };
        let (process_type, addr, session) = process;

        let federation_known = {
            let mut state = self.state.lock();
            if !state.memberships.insert((federation_id, process_id)) {
                return; // already added
            }
            state
                .federations
                .iter()
                .any(|federation| federation.federation_id() == federation_id)
        };

        if federation_known {
            for observer in self.observers() {
                let runtime = self.self_weak.clone();
                tokio::spawn(async move {
                    if runtime.upgrade().is_some() {
                        observer.on_process_added(federation_id, process_id, process_type);
                    }
                });
            }

            if process_id != self.process_id
                && process_type == ProcessType::Daemon
                && session.is_none()
            {
                if let Some(hook) = self.endpoint_hook() {
                    hook.connect_daemon(process_id, &addr);
                }
            }

            self.join_sessions_to_federation(federation_id);
        }
    }

    /// Record that a process left a federation
    pub fn federation_process_removed(&self, federation_id: ObjectId, process_id: ObjectId) {
        let federation_known = {
            let mut state = self.state.lock();
            if !state.memberships.remove(&(federation_id, process_id)) {
                return; // already removed
            }
            state
                .federations
                .iter()
                .any(|federation| federation.federation_id() == federation_id)
        };

        if let Some(session) = self.process_session(process_id) {
            if let Some(hook) = self.endpoint_hook() {
                hook.leave_session_federation(session, federation_id);
            }
        }

        if federation_known {
            for observer in self.observers() {
                let runtime = self.self_weak.clone();
                tokio::spawn(async move {
                    if runtime.upgrade().is_some() {
                        observer.on_process_removed(federation_id, process_id);
                    }
                });
            }
        }

        if !self.is_process_active(process_id) {
            self.unregister_process(process_id);
        }
    }

    /// Create session federates for every connected member of a federation
    pub fn join_sessions_to_federation(&self, federation_id: ObjectId) {
        let sessions: Vec<SessionKey> = {
            let state = self.state.lock();
            state
                .memberships
                .iter()
                .filter(|(fid, _)| *fid == federation_id)
                .filter_map(|(_, pid)| self.processes.get(pid).and_then(|entry| entry.session))
                .collect()
        };
        if let Some(hook) = self.endpoint_hook() {
            for session in sessions {
                hook.join_session_to_federation(session, federation_id);
            }
        }
    }

    /// The federations a process is a member of
    pub fn process_federations(&self, process_id: ObjectId) -> Vec<ObjectId> {
        let state = self.state.lock();
        state
            .memberships
            .iter()
            .filter(|(_, pid)| *pid == process_id)
            .map(|(fid, _)| *fid)
            .collect()
    }

    /// The type of a federation known to this runtime
    pub fn federation_type(&self, federation_id: ObjectId) -> FederationType {
        self.find_federation(federation_id)
            .map(|federation| federation.federation_type())
            .unwrap_or(FederationType::None)
    }

    /// The ids of every federation this process is currently a member of
    pub fn federation_ids(&self) -> Vec<ObjectId> {
        let state = self.state.lock();
        state
            .federations
            .iter()
            .map(|federation| federation.federation_id())
            .collect()
    }

    /// An existing federation, without acquiring it
    pub fn find_federation(&self, federation_id: ObjectId) -> Option<Arc<Federation>> {
        let state = self.state.lock();
        state
            .federations
            .iter()
            .find(|federation| federation.federation_id() == federation_id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // hosting

    /// Ask the master daemon to host a lobby/match pair
    pub fn request_host_match(&self, lobby_id: ObjectId, match_id: ObjectId) {
        if let Some(hook) = self.endpoint_hook() {
            hook.request_host_match(lobby_id, match_id);
        }
    }

    /// Host a lobby/match pair requested by `subject_id`
    pub fn process_host_match(&self, lobby_id: ObjectId, match_id: ObjectId, subject_id: &str) {
        if self.authorize_create_battle_federation(subject_id) {
            self.host_federation(FederationType::Lobby, lobby_id);
            self.host_federation(FederationType::Battle, match_id);
        }
    }

    fn authorize_create_battle_federation(&self, subject_id: &str) -> bool {
        self.process_type == ProcessType::Player || !subject_id.is_empty()
    }

    /// Host a federation locally, consulting the supervision policy
    pub fn host_federation(&self, federation_type: FederationType, federation_id: ObjectId) {
        let Some(runtime) = self.self_weak.upgrade() else {
            return;
        };
        let Some(federation) = self.initiate_federation(federation_id, federation_type) else {
            return;
        };
        let policy = self.supervision.lock().clone();
        if let Some(policy) = policy {
            if !federation.has_supervisor() {
                if let Some(supervisor) =
                    policy.make_supervisor(&runtime, federation_type, federation_id)
                {
                    federation.set_supervisor(supervisor);
                }
            }
        }
    }

    /// Acquire a federation and stamp its type, announcing local membership
    pub fn initiate_federation(
        &self,
        federation_id: ObjectId,
        federation_type: FederationType,
    ) -> Option<Arc<Federation>> {
        let federation = self.acquire_federation(federation_id, true)?;
        if federation.federation_type() == FederationType::None {
            federation.set_federation_type(federation_type);
            debug!(%federation_id, %federation_type, "federation initiated");
            self.federation_process_added(federation_id, self.process_id);
        }
        Some(federation)
    }

    /// Acquire a reference to a federation, creating it on demand.
    ///
    /// Creation is broadcast to connected peers and joins the relevant
    /// sessions.
    pub fn acquire_federation(
        &self,
        federation_id: ObjectId,
        create_if_not_exists: bool,
    ) -> Option<Arc<Federation>> {
        use std::sync::atomic::Ordering;

        let (federation, created) = {
            let mut state = self.state.lock();
            if let Some(existing) = state
                .federations
                .iter()
                .find(|federation| federation.federation_id() == federation_id)
            {
                existing.acquire_count.fetch_add(1, Ordering::SeqCst);
                (Some(existing.clone()), false)
            } else if create_if_not_exists {
                let federation = Arc::new(Federation::new(federation_id));
                federation.acquire_count.fetch_add(1, Ordering::SeqCst);
                state.federations.push(federation.clone());
                (Some(federation), true)
            } else {
                (None, false)
            }
        };

        if created {
            if !federation_id.is_zero() {
                if let Some(hook) = self.endpoint_hook() {
                    hook.broadcast_federation_process_added(
                        federation_id,
                        self.process_id,
                        self.process_type,
                        &self.process_addr(),
                        None,
                    );
                }
            }
            self.join_sessions_to_federation(federation_id);
        }

        federation
    }

    /// Release a federation reference, destroying it on zero.
    pub fn release_federation(&self, federation: &Arc<Federation>) {
        use std::sync::atomic::Ordering;

        let federation_id = federation.federation_id();
        let deleted = {
            let mut state = self.state.lock();
            if federation.acquire_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                state
                    .federations
                    .retain(|existing| !Arc::ptr_eq(existing, federation));
                true
            } else {
                false
            }
        };

        if deleted {
            debug!(%federation_id, "federation destroyed");
            if !federation_id.is_zero() {
                if let Some(hook) = self.endpoint_hook() {
                    hook.broadcast_federation_process_removed(federation_id, self.process_id);
                }
                self.federation_process_removed(federation_id, self.process_id);
            }
        }
    }
}

impl Shutdownable for Runtime {
    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            if !self.shutdown_gate.begin() {
                self.shutdown_gate.wait().await;
                return;
            }
            let supervisors: Vec<Arc<dyn Shutdownable>> = {
                let state = self.state.lock();
                state
                    .federations
                    .iter()
                    .filter_map(|federation| federation.take_supervisor())
                    .collect()
            };
            for supervisor in supervisors {
                supervisor.shutdown().await;
            }
            self.shutdown_gate.finish();
        })
    }
}
