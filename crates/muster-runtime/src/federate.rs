//! Federates and the synchronization pass

use crate::error::{RuntimeError, RuntimeResult};
use crate::event_class::EventClass;
use crate::federation::{policy_eligibility, Federation, FederationState, OwnershipPolicy, RosterEntry};
use crate::object::{
    MasterInstance, MasterProperty, ObjectInstance, ObjectRef, Property, SessionKey, DESTRUCTOR,
};
use crate::object_class::ObjectClass;
use crate::runtime::Runtime;
use crate::service_class::{ServiceClass, ServiceProvider};
use crate::shutdown::{Shutdownable, ShutdownFuture, ShutdownGate};
use muster_ownership::{
    apply_notification, find_owner, has_publisher, update_ownership_notifications,
    validate_ownership, FederateKey, OwnershipEntry, OwnershipNotification, OwnershipOperation,
    OwnershipState, StateOperation,
};
use muster_primitives::{ObjectId, ProcessType};
use muster_value::{Reason, Value};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Future returned by service providers and callbacks
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Value, Reason>> + Send>>;

/// Callback invoked on object discovery and change
pub type ObjectCallback = Arc<dyn Fn(ObjectRef) + Send + Sync>;
/// Fallback callback invoked for every event without a subscriber match
pub type EventCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Catch-all service handler
pub type ServiceCallback = Arc<dyn Fn(&str, Value, String) -> ServiceFuture + Send + Sync>;
/// Callback invoked with ownership notifications
pub type OwnershipCallback = Arc<dyn Fn(ObjectRef, &str, OwnershipNotification) + Send + Sync>;

static NEXT_FEDERATE_KEY: AtomicU64 = AtomicU64::new(1);

/// Work item serialized onto a federate's strand
pub(crate) enum FederateTask {
    /// Run a synchronization pass
    Synchronize,
    /// Run a closure on the strand
    Run(Box<dyn FnOnce(&Arc<Federate>) + Send>),
    /// Terminate the strand
    Stop,
}

pub(crate) struct FederateState {
    classes: Vec<Arc<ObjectClass>>,
    event_classes: Vec<Arc<EventClass>>,
    service_classes: Vec<Arc<ServiceClass>>,
    instances: Vec<Arc<Mutex<ObjectInstance>>>,
    discovered: Vec<Arc<Mutex<ObjectInstance>>>,
    undiscovered: Vec<i64>,
    last_instance_id: i64,
    object_callback: Option<ObjectCallback>,
    event_callback: Option<EventCallback>,
    service_callback: Option<ServiceCallback>,
    ownership_callback: OwnershipCallback,
    block_listener: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Default)]
struct NotifyBatch {
    ownership: Vec<(Arc<Mutex<ObjectInstance>>, String, OwnershipNotification)>,
}

/// A participant in one federation.
///
/// All state mutation runs on the federate's own task (its strand); the
/// public API may be called from any thread and schedules work there. See
/// the crate docs for the synchronization-pass contract.
pub struct Federate {
    runtime: Arc<Runtime>,
    name: String,
    key: FederateKey,
    session: Option<SessionKey>,
    base_time: Instant,
    current_time_bits: AtomicU64,
    event_delay_bits: AtomicU64,
    event_latency_bits: AtomicU64,
    federation_id: Mutex<ObjectId>,
    federation: Mutex<Option<Arc<Federation>>>,
    state: Mutex<FederateState>,
    tasks: mpsc::UnboundedSender<FederateTask>,
    sync_pending: AtomicBool,
    block_counter: AtomicI32,
    shutdown_gate: ShutdownGate,
    self_weak: Weak<Federate>,
}

impl Federate {
    /// Create an application federate and start its strand
    pub fn new(runtime: Arc<Runtime>, name: &str) -> Arc<Federate> {
        Self::new_internal(runtime, name, None)
    }

    /// Create a session-backed federate and start its strand
    pub fn new_session(runtime: Arc<Runtime>, name: &str, session: SessionKey) -> Arc<Federate> {
        Self::new_internal(runtime, name, Some(session))
    }

    fn new_internal(
        runtime: Arc<Runtime>,
        name: &str,
        session: Option<SessionKey>,
    ) -> Arc<Federate> {
        let (tasks, task_rx) = mpsc::unbounded_channel();
        let federate = Arc::new_cyclic(|self_weak: &Weak<Federate>| Federate {
            runtime,
            name: name.to_owned(),
            key: FederateKey(NEXT_FEDERATE_KEY.fetch_add(1, Ordering::Relaxed)),
            session,
            base_time: Instant::now(),
            current_time_bits: AtomicU64::new(0),
            event_delay_bits: AtomicU64::new(0),
            event_latency_bits: AtomicU64::new(0),
            federation_id: Mutex::new(ObjectId::ZERO),
            federation: Mutex::new(None),
            state: Mutex::new(FederateState {
                classes: Vec::new(),
                event_classes: Vec::new(),
                service_classes: Vec::new(),
                instances: Vec::new(),
                discovered: Vec::new(),
                undiscovered: Vec::new(),
                last_instance_id: 0,
                object_callback: None,
                event_callback: None,
                service_callback: None,
                ownership_callback: Arc::new(Self::default_ownership_callback),
                block_listener: None,
            }),
            tasks,
            sync_pending: AtomicBool::new(false),
            block_counter: AtomicI32::new(0),
            shutdown_gate: ShutdownGate::new(),
            self_weak: self_weak.clone(),
        });
        tokio::spawn(Self::run(Arc::downgrade(&federate), task_rx));
        debug!(federate = name, "federate started");
        federate
    }

    async fn run(weak: Weak<Federate>, mut tasks: mpsc::UnboundedReceiver<FederateTask>) {
        while let Some(task) = tasks.recv().await {
            let Some(federate) = weak.upgrade() else {
                break;
            };
            match task {
                FederateTask::Synchronize => {
                    federate.sync_pending.store(false, Ordering::SeqCst);
                    federate.synchronize();
                }
                FederateTask::Run(f) => f(&federate),
                FederateTask::Stop => break,
            }
        }
    }

    /// Join a federation, creating it on demand
    pub fn startup(self: &Arc<Self>, federation_id: ObjectId) -> RuntimeResult<()> {
        if self.shutdown_gate.is_started() {
            warn!(federate = %self.name, "startup after shutdown");
            return Err(RuntimeError::ShutdownInProgress);
        }
        let federation = self
            .runtime
            .acquire_federation(federation_id, true)
            .ok_or(RuntimeError::NoFederation)?;
        *self.federation_id.lock() = federation_id;
        federation.add_federate(self);
        *self.federation.lock() = Some(federation);
        self.schedule_synchronize();
        Ok(())
    }

    /// The federate's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The federate's ownership-map key
    pub fn key(&self) -> FederateKey {
        self.key
    }

    /// The owning runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The joined federation's id, zero before startup
    pub fn federation_id(&self) -> ObjectId {
        *self.federation_id.lock()
    }

    /// The joined federation
    pub fn federation(&self) -> Option<Arc<Federation>> {
        self.federation.lock().clone()
    }

    /// The session this federate fronts, if any
    pub fn session(&self) -> Option<SessionKey> {
        self.session
    }

    /// Whether shutdown has begun
    pub fn is_shutdown_started(&self) -> bool {
        self.shutdown_gate.is_started()
    }

    /// A principal federate may allocate master instances. Session federates
    /// of non-daemon processes are not principal.
    pub fn is_principal(&self) -> bool {
        self.runtime.process_type() == ProcessType::Daemon || self.session.is_none()
    }

    /// The local process id
    pub fn process_id(&self) -> ObjectId {
        self.runtime.process_id()
    }

    /// Whether the federation's ownership policy lets this federate own
    /// `property`
    pub fn ownership_policy(self: &Arc<Self>, property: &str) -> bool {
        let Some(federation) = self.federation() else {
            return false;
        };
        let policy = federation.state().policy.clone();
        (*policy)(self, property)
    }

    /// The federate's current time, seconds since its base time point
    pub fn current_time(&self) -> f64 {
        f64::from_bits(self.current_time_bits.load(Ordering::Relaxed))
    }

    fn update_current_time(&self) {
        let now = self.base_time.elapsed().as_secs_f64();
        self.current_time_bits.store(now.to_bits(), Ordering::Relaxed);
    }

    /// The dispatch delay of the event being delivered; valid only inside an
    /// event subscriber
    pub fn event_delay(&self) -> f64 {
        f64::from_bits(self.event_delay_bits.load(Ordering::Relaxed))
    }

    /// The accumulated network latency of the event being delivered; valid
    /// only inside an event subscriber
    pub fn event_latency(&self) -> f64 {
        f64::from_bits(self.event_latency_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_event_context(&self, delay: f64, latency: f64) {
        self.event_delay_bits.store(delay.to_bits(), Ordering::Relaxed);
        self.event_latency_bits.store(latency.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn post(&self, task: FederateTask) -> bool {
        self.tasks.send(task).is_ok()
    }

    /// Post a closure onto the federate's strand
    pub fn post_task(&self, task: impl FnOnce(&Arc<Federate>) + Send + 'static) -> bool {
        self.post(FederateTask::Run(Box::new(task)))
    }

    /// Request a synchronization pass; requests collapse while one is queued
    pub fn schedule_synchronize(&self) {
        if self.shutdown_gate.is_started() {
            return;
        }
        if !self.sync_pending.swap(true, Ordering::SeqCst) {
            let _ = self.tasks.send(FederateTask::Synchronize);
        }
    }

    /// Whether a synchronization or event block is active on the strand
    pub fn in_block(&self) -> bool {
        self.block_counter.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn enter_block(&self) {
        self.block_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_block(&self) {
        if self.block_counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let listener = self.state.lock().block_listener.clone();
            if let Some(listener) = listener {
                (*listener)();
            }
        }
    }

    /// Install the hook invoked when the outermost block is left; used by
    /// session federates to flush their message batch
    pub fn set_block_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.state.lock().block_listener = Some(Arc::new(listener));
    }

    // ------------------------------------------------------------------
    // classes and callbacks

    /// The object class with the given name, created on first use
    pub fn get_object_class(self: &Arc<Self>, name: &str) -> Arc<ObjectClass> {
        let mut state = self.state.lock();
        if let Some(class) = state.classes.iter().find(|c| c.name() == name) {
            return class.clone();
        }
        let class = Arc::new(ObjectClass::new(self.self_weak.clone(), name));
        state.classes.push(class.clone());
        class
    }

    /// The event class with the given name, created on first use
    pub fn get_event_class(self: &Arc<Self>, name: &str) -> Arc<EventClass> {
        let mut state = self.state.lock();
        if let Some(class) = state.event_classes.iter().find(|c| c.name() == name) {
            return class.clone();
        }
        let class = Arc::new(EventClass::new(self.self_weak.clone(), name));
        state.event_classes.push(class.clone());
        class
    }

    /// The service class with the given name, created on first use
    pub fn get_service_class(self: &Arc<Self>, name: &str) -> Arc<ServiceClass> {
        let mut state = self.state.lock();
        if let Some(class) = state.service_classes.iter().find(|c| c.name() == name) {
            return class.clone();
        }
        let class = Arc::new(ServiceClass::new(self.self_weak.clone(), name));
        state.service_classes.push(class.clone());
        class
    }

    /// Install the object discovery/change callback
    pub fn set_object_callback(&self, callback: impl Fn(ObjectRef) + Send + Sync + 'static) {
        self.state.lock().object_callback = Some(Arc::new(callback));
    }

    /// Remove the object callback
    pub fn clear_object_callback(&self) {
        self.state.lock().object_callback = None;
    }

    /// Install the event fallback callback
    pub fn set_event_callback(&self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.state.lock().event_callback = Some(Arc::new(callback));
    }

    /// Remove the event fallback callback
    pub fn clear_event_callback(&self) {
        self.state.lock().event_callback = None;
    }

    /// Install the catch-all service callback
    pub fn set_service_callback(
        &self,
        callback: impl Fn(&str, Value, String) -> ServiceFuture + Send + Sync + 'static,
    ) {
        self.state.lock().service_callback = Some(Arc::new(callback));
    }

    /// Remove the catch-all service callback
    pub fn clear_service_callback(&self) {
        self.state.lock().service_callback = None;
    }

    /// Install the ownership notification callback
    pub fn set_ownership_callback(
        &self,
        callback: impl Fn(ObjectRef, &str, OwnershipNotification) + Send + Sync + 'static,
    ) {
        self.state.lock().ownership_callback = Arc::new(callback);
    }

    /// Restore the default ownership callback
    pub fn reset_ownership_callback(&self) {
        self.state.lock().ownership_callback = Arc::new(Self::default_ownership_callback);
    }

    /// The default ownership callback accepts every release request and
    /// volunteers for every assumption request.
    pub fn default_ownership_callback(
        object: ObjectRef,
        property: &str,
        notification: OwnershipNotification,
    ) {
        match notification {
            OwnershipNotification::RequestOwnershipAssumption => {
                if object
                    .ownership_state(property)
                    .intersects(OwnershipState::NOT_TRYING_TO_ACQUIRE)
                {
                    let _ = object.modify_ownership_state(
                        property,
                        OwnershipOperation::OwnershipAcquisitionIfAvailable,
                    );
                }
            }
            OwnershipNotification::RequestOwnershipRelease => {
                if object
                    .ownership_state(property)
                    .intersects(OwnershipState::ASKED_TO_RELEASE)
                {
                    let _ = object.modify_ownership_state(
                        property,
                        OwnershipOperation::OwnershipReleaseSuccess,
                    );
                }
            }
            _ => {}
        }
    }

    pub(crate) fn event_callback(&self) -> Option<EventCallback> {
        self.state.lock().event_callback.clone()
    }

    pub(crate) fn service_callback(&self) -> Option<ServiceCallback> {
        self.state.lock().service_callback.clone()
    }

    pub(crate) fn find_service_provider(&self, name: &str) -> Option<ServiceProvider> {
        let state = self.state.lock();
        state
            .service_classes
            .iter()
            .find(|c| c.name() == name)
            .and_then(|c| c.provider())
    }

    // ------------------------------------------------------------------
    // objects

    /// The object with the given id, if present on this federate
    pub fn get_object(&self, object_id: ObjectId) -> Option<ObjectRef> {
        let state = self.state.lock();
        state
            .instances
            .iter()
            .find(|instance| instance.lock().object_id == object_id)
            .map(|instance| ObjectRef::new(instance.clone(), self.self_weak.clone()))
    }

    pub(crate) fn insert_instance(&self, instance: Arc<Mutex<ObjectInstance>>) {
        self.state.lock().instances.push(instance);
    }

    pub(crate) fn instances(&self) -> Vec<Arc<Mutex<ObjectInstance>>> {
        self.state.lock().instances.clone()
    }

    // ------------------------------------------------------------------
    // events and services

    /// Dispatch an event to every other federate in the federation
    pub fn dispatch_event(&self, event: &str, params: Value, delay: f64, latency: f64) {
        if let Some(federation) = self.federation() {
            federation.dispatch_event(self.key, event, params, delay, latency);
        }
    }

    /// Request a service through the federation
    pub async fn request_service(
        self: &Arc<Self>,
        service: &str,
        params: Value,
        subject_id: String,
    ) -> Result<Value, Reason> {
        let Some(federation) = self.federation() else {
            return Err(Reason::new(404, format!("{} rejected: no federation", service)));
        };
        federation
            .request_service(service, params, subject_id, Some(self.key))
            .await
    }

    // ------------------------------------------------------------------
    // the synchronization pass

    fn synchronize(self: &Arc<Self>) {
        let Some(federation) = self.federation() else {
            return;
        };
        self.enter_block();
        self.update_current_time();

        let mut batch = NotifyBatch::default();
        {
            let mut federation_state = federation.state();
            let mut state = self.state.lock();
            let mut changed =
                self.sync_to_federation(&mut federation_state, &mut state, &mut batch);
            if self.sync_from_federation(&mut federation_state, &mut state, &mut batch) {
                changed = true;
            }
            if changed {
                Federation::schedule_others_locked(&federation_state, self.key);
            }
        }

        self.notify_observers(batch);

        {
            let mut federation_state = federation.state();
            let mut state = self.state.lock();
            self.remove_deleted_by_master(&mut federation_state, &mut state);
        }

        self.leave_block();
    }

    /// Phase 1: push local deletions, instance allocations, value writes and
    /// ownership operations into the federation.
    fn sync_to_federation(
        self: &Arc<Self>,
        federation_state: &mut FederationState,
        state: &mut FederateState,
        batch: &mut NotifyBatch,
    ) -> bool {
        let now = self.current_time();
        let mut changed = false;
        let key = self.key;

        // locally deleted instances leave the federation entirely
        {
            let FederationState {
                masters,
                roster,
                policy,
                ..
            } = federation_state;
            state.instances.retain(|instance_arc| {
                let mut instance = instance_arc.lock();
                if !instance.deleted_by_object {
                    return true;
                }
                if let Some(master_id) = instance.master_id.take() {
                    if let Some(master) = masters.get_mut(&master_id) {
                        unpublish_instance(&mut instance, master, key, roster, policy);
                        master.deleted = true;
                        master.ref_count -= 1;
                    }
                }
                changed = true;
                false
            });
        }

        let is_principal_here = {
            let policy = federation_state.policy.clone();
            (*policy)(self, DESTRUCTOR)
        };

        let instances: Vec<_> = state.instances.clone();
        for instance_arc in &instances {
            let mut instance = instance_arc.lock();

            if instance.master_id.is_none() && !instance.spurious {
                if is_principal_here {
                    federation_state.last_instance_id += 1;
                    let instance_id = federation_state.last_instance_id;
                    let mut master =
                        MasterInstance::new(instance_id, instance.object_id, instance.class.name());
                    master.ref_count = 1;
                    federation_state.masters.insert(instance_id, master);
                    instance.master_id = Some(instance_id);
                    instance.synchronize = true;
                    changed = true;
                } else {
                    instance.spurious = true;
                    warn!(
                        class = instance.class.name(),
                        object = %instance.object_id,
                        "spurious object detected"
                    );
                }
            }

            let Some(master_id) = instance.master_id else {
                continue;
            };
            if !instance.synchronize {
                continue;
            }

            let FederationState {
                masters,
                roster,
                policy,
                ..
            } = federation_state;
            let Some(master) = masters.get_mut(&master_id) else {
                continue;
            };

            let class = instance.class.clone();
            let names: Vec<String> = instance.properties.keys().cloned().collect();
            for name in &names {
                let master_property = master.property_mut(name);
                let property = instance.properties.get_mut(name).expect("property present");
                if !property.has_master {
                    property.has_master = true;
                    changed = true;
                }

                if property.version3 > master_property.version {
                    if property
                        .instance_ownership
                        .state
                        .intersects(OwnershipState::OWNED)
                    {
                        let entry_index = ensure_entry(
                            &mut master_property.ownership_map,
                            key,
                            property.instance_ownership.state,
                        );
                        if master_property.owner.is_none() {
                            master_property.ownership_map[entry_index].state =
                                property.instance_ownership.state;
                            master_property.ownership_map[entry_index].notification =
                                OwnershipNotification::None;
                            refresh_owner(master_property);
                            master_property.assign_from(now, property);
                            changed = true;
                        } else if master_property.owner == Some(key)
                            || property.instance_ownership.operation
                                == OwnershipOperation::ForcedOwnershipAcquisition
                        {
                            master_property.assign_from(now, property);
                            changed = true;
                        } else {
                            // another federate owns: take the master's value
                            // back and flag a forced divestiture against us
                            master_property.ownership_map[entry_index].state =
                                property.instance_ownership.state;
                            master_property.ownership_map[entry_index].notification =
                                OwnershipNotification::ForcedOwnershipDivestitureNotification;
                            refresh_owner(master_property);
                            let published = class.property_published(name);
                            property.assign_from_master(now, master_property, published);
                        }
                    } else {
                        warn!(property = %name, "write without ownership reverted");
                        let published = class.property_published(name);
                        property.assign_from_master(now, master_property, published);
                    }
                }
            }
            instance.synchronize = false;

            let MasterInstance {
                properties: master_properties,
                deleted,
                ..
            } = master;
            for name in &names {
                let property = instance.properties.get_mut(name).expect("property present");
                let Some(master_property) = master_properties.get_mut(name) else {
                    continue;
                };
                if !should_update_ownership(property, master_property) {
                    continue;
                }
                let published = class.property_published(name);
                if update_ownership_for_property(
                    key,
                    now,
                    published,
                    property,
                    master_property,
                    deleted,
                    roster,
                    policy,
                    instance_arc,
                    batch,
                ) {
                    changed = true;
                }
            }
        }

        federation_state.masters.retain(|_, master| master.ref_count > 0);
        changed
    }

    /// Phase 2: discover new master instances and pull value/ownership
    /// changes from the federation.
    fn sync_from_federation(
        self: &Arc<Self>,
        federation_state: &mut FederationState,
        state: &mut FederateState,
        batch: &mut NotifyBatch,
    ) -> bool {
        let now = self.current_time();
        let mut changed = false;
        let key = self.key;

        if federation_state.last_instance_id > state.last_instance_id {
            let watermark = state.last_instance_id;
            for (instance_id, master) in federation_state.masters.range_mut(watermark + 1..) {
                if !master.deleted && !has_instance_with_master(state, *instance_id) {
                    state.undiscovered.push(*instance_id);
                    master.ref_count += 1;
                }
            }
            state.last_instance_id = federation_state.last_instance_id;
        }

        let mut try_discover = true;
        while try_discover {
            try_discover = false;
            let mut index = 0;
            while index < state.undiscovered.len() {
                let master_id = state.undiscovered[index];
                let deleted = federation_state
                    .masters
                    .get(&master_id)
                    .map(|m| m.deleted)
                    .unwrap_or(true);
                if deleted {
                    if let Some(master) = federation_state.masters.get_mut(&master_id) {
                        master.ref_count -= 1;
                    }
                    state.undiscovered.remove(index);
                    continue;
                }
                if !self.is_well_defined(federation_state, state, master_id) {
                    index += 1;
                    continue;
                }
                state.undiscovered.remove(index);

                let (object_id, class_name) = {
                    let master = federation_state.masters.get(&master_id).expect("checked");
                    (master.object_id, master.class_name.clone())
                };

                if let Some(existing) = find_instance_by_object_id(state, object_id) {
                    // a spurious local object adopts the master instance
                    let mut instance = existing.lock();
                    instance.master_id = Some(master_id);
                    let master = federation_state.masters.get_mut(&master_id).expect("checked");
                    let names: Vec<String> = instance.properties.keys().cloned().collect();
                    for name in &names {
                        let master_property = master.property_mut(name);
                        let property =
                            instance.properties.get_mut(name).expect("property present");
                        property.has_master = true;
                        property.version3 = if master_property.version > 0 {
                            master_property.version - 1
                        } else {
                            master_property.version
                        };
                        let owned = property.can_set_value();
                        let ownership_state = if property
                            .instance_ownership
                            .state
                            .intersects(OwnershipState::ABLE_TO_ACQUIRE)
                        {
                            OwnershipState::unowned_not_able_to_acquire()
                        } else {
                            OwnershipState::unowned_able_to_acquire()
                        };
                        property.instance_ownership = StateOperation {
                            state: ownership_state,
                            operation: OwnershipOperation::None,
                        };
                        property.ownership_version = 0;
                        let entry_index =
                            ensure_entry(&mut master_property.ownership_map, key, ownership_state);
                        master_property.ownership_map[entry_index].state = ownership_state;
                        master_property.ownership_map[entry_index].notification = if owned {
                            OwnershipNotification::ForcedOwnershipDivestitureNotification
                        } else {
                            OwnershipNotification::None
                        };
                    }
                } else {
                    let class = self.get_or_create_class(state, &class_name);
                    let mut instance = ObjectInstance::new(class, object_id, self.process_id());
                    instance.master_id = Some(master_id);
                    instance.discovered_not_notified = true;
                    instance.property_mut(DESTRUCTOR);
                    let instance = Arc::new(Mutex::new(instance));
                    state.instances.push(instance.clone());
                    state.discovered.push(instance);
                    try_discover = true;
                }
            }
        }

        let FederationState {
            masters,
            roster,
            policy,
            ..
        } = federation_state;

        let has_object_callback = state.object_callback.is_some();
        let instances: Vec<_> = state.instances.clone();
        for instance_arc in &instances {
            let mut instance = instance_arc.lock();
            let Some(master_id) = instance.master_id else {
                continue;
            };
            let Some(master) = masters.get_mut(&master_id) else {
                continue;
            };
            if master.deleted {
                instance.deleted_by_master = true;
                instance.notify = true;
                continue;
            }

            let class = instance.class.clone();
            let has_callbacks = has_object_callback || class.has_observers();

            let names: Vec<String> = instance.properties.keys().cloned().collect();
            for name in &names {
                let property = instance.properties.get_mut(name).expect("property present");
                if !property.has_master {
                    continue;
                }
                let Some(master_property) = master.properties.get_mut(name) else {
                    continue;
                };
                if master_property.version > property.version3 {
                    let published = class.property_published(name);
                    property.assign_from_master(now, master_property, published);
                    if has_callbacks {
                        property.changed = true;
                        instance.notify = true;
                    }
                }
                master_property.sync_flag = true;
            }

            // adopt master properties the local instance has never seen
            let missing: Vec<String> = master
                .properties
                .values()
                .filter(|mp| !mp.sync_flag)
                .map(|mp| mp.name.clone())
                .collect();
            for name in &missing {
                let property = instance.property_mut(name);
                property.has_master = true;
                let master_property = master.properties.get_mut(name).expect("collected above");
                if master_property.version > property.version3 {
                    let published = class.property_published(name);
                    property.assign_from_master(now, master_property, published);
                    if has_callbacks {
                        property.changed = true;
                        instance.notify = true;
                    }
                }
            }

            for master_property in master.properties.values_mut() {
                master_property.sync_flag = false;
            }

            let MasterInstance {
                properties: master_properties,
                deleted,
                ..
            } = master;
            let names: Vec<String> = instance.properties.keys().cloned().collect();
            for name in &names {
                let property = instance.properties.get_mut(name).expect("property present");
                let Some(master_property) = master_properties.get_mut(name) else {
                    continue;
                };
                if !should_update_ownership(property, master_property) {
                    continue;
                }
                let published = class.property_published(name);
                if update_ownership_for_property(
                    key,
                    now,
                    published,
                    property,
                    master_property,
                    deleted,
                    roster,
                    policy,
                    instance_arc,
                    batch,
                ) {
                    changed = true;
                }
            }
        }

        changed
    }

    fn get_or_create_class(&self, state: &mut FederateState, name: &str) -> Arc<ObjectClass> {
        if let Some(class) = state.classes.iter().find(|c| c.name() == name) {
            return class.clone();
        }
        let class = Arc::new(ObjectClass::new(self.self_weak.clone(), name));
        state.classes.push(class.clone());
        class
    }

    /// An instance is well-defined once every declared required property is
    /// present and every referenced object id is already discovered (or is
    /// the instance itself). Forward-only reference cycles therefore never
    /// discover; see the design notes.
    fn is_well_defined(
        &self,
        federation_state: &FederationState,
        state: &mut FederateState,
        master_id: i64,
    ) -> bool {
        let Some(master) = federation_state.masters.get(&master_id) else {
            return false;
        };
        let class = self.get_or_create_class(state, &master.class_name.clone());
        for (name, required) in class.declared_properties() {
            match master.properties.get(&name) {
                Some(master_property) => {
                    if !is_well_defined_value(master, state, &master_property.value, required) {
                        return false;
                    }
                }
                None => {
                    if required {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Phase 4: deliver callbacks outside the locks.
    fn notify_observers(self: &Arc<Self>, batch: NotifyBatch) {
        let (discovered, notified, object_callback, ownership_callback) = {
            let mut state = self.state.lock();
            let discovered = std::mem::take(&mut state.discovered);
            let notified: Vec<_> = state
                .instances
                .iter()
                .filter(|instance| instance.lock().notify)
                .cloned()
                .collect();
            (
                discovered,
                notified,
                state.object_callback.clone(),
                state.ownership_callback.clone(),
            )
        };

        for (instance, property, notification) in batch.ownership {
            (*ownership_callback)(
                ObjectRef::new(instance, self.self_weak.clone()),
                &property,
                notification,
            );
        }

        for instance in &discovered {
            let object = ObjectRef::new(instance.clone(), self.self_weak.clone());
            if let Some(callback) = &object_callback {
                (**callback)(object.clone());
            }
            let class = instance.lock().class.clone();
            for observer in class.observers() {
                (*observer)(object.clone());
            }
        }
        for instance in &discovered {
            let mut guard = instance.lock();
            guard.discovered_and_notified = true;
            guard.discovered_not_notified = false;
        }

        for instance in &notified {
            let object = ObjectRef::new(instance.clone(), self.self_weak.clone());
            if let Some(callback) = &object_callback {
                (**callback)(object.clone());
            }
            let class = instance.lock().class.clone();
            for observer in class.observers() {
                (*observer)(object.clone());
            }
        }
        for instance in &notified {
            let mut guard = instance.lock();
            guard.notify = false;
            for property in guard.properties.values_mut() {
                property.changed = false;
            }
        }
    }

    /// Phase 5: sweep instances the federation deleted.
    fn remove_deleted_by_master(
        &self,
        federation_state: &mut FederationState,
        state: &mut FederateState,
    ) {
        let key = self.key;
        let FederationState {
            masters,
            roster,
            policy,
            ..
        } = federation_state;
        state.instances.retain(|instance_arc| {
            let mut instance = instance_arc.lock();
            if !instance.deleted_by_master {
                return true;
            }
            if let Some(master_id) = instance.master_id.take() {
                if let Some(master) = masters.get_mut(&master_id) {
                    unpublish_instance(&mut instance, master, key, roster, policy);
                    master.ref_count -= 1;
                }
            }
            false
        });
    }

    fn teardown(self: &Arc<Self>) -> Option<Arc<Federate>> {
        let federation = self.federation.lock().take();
        let Some(federation) = federation else {
            let mut state = self.state.lock();
            state.instances.clear();
            state.discovered.clear();
            state.undiscovered.clear();
            return None;
        };
        federation.remove_federate(self.key);

        let mut follow_up = None;
        {
            let mut federation_state = federation.state();
            let mut state = self.state.lock();
            let FederationState {
                masters,
                roster,
                policy,
                ..
            } = &mut *federation_state;

            for instance_arc in state.instances.drain(..) {
                let mut instance = instance_arc.lock();
                if let Some(master_id) = instance.master_id.take() {
                    if let Some(master) = masters.get_mut(&master_id) {
                        unpublish_instance(&mut instance, master, self.key, roster, policy);
                        master.ref_count -= 1;
                    }
                }
            }
            state.discovered.clear();
            for master_id in state.undiscovered.drain(..) {
                if let Some(master) = masters.get_mut(&master_id) {
                    master.ref_count -= 1;
                }
            }
            masters.retain(|_, master| master.ref_count > 0);

            for entry in roster.iter() {
                if let Some(federate) = entry.federate.upgrade() {
                    federate.schedule_synchronize();
                }
            }

            let any_principal = roster
                .iter()
                .filter_map(|entry| entry.federate.upgrade())
                .any(|federate| federate.is_principal());
            if !any_principal {
                follow_up = roster.first().and_then(|entry| entry.federate.upgrade());
            }
        }

        self.runtime.release_federation(&federation);
        follow_up
    }
}

impl Shutdownable for Federate {
    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            if !self.shutdown_gate.begin() {
                self.shutdown_gate.wait().await;
                return;
            }
            debug!(federate = %self.name, "federate shutdown");

            let follow_up = {
                let (tx, rx) = oneshot::channel();
                let posted = self.post(FederateTask::Run(Box::new(move |fed| {
                    let _ = tx.send(fed.teardown());
                })));
                if posted {
                    rx.await.unwrap_or(None)
                } else {
                    self.self_weak.upgrade().and_then(|fed| fed.teardown())
                }
            };

            if let Some(next) = follow_up {
                next.shutdown().await;
            }

            let _ = self.tasks.send(FederateTask::Stop);
            self.shutdown_gate.finish();
        })
    }
}

// ----------------------------------------------------------------------
// helpers shared by both sync phases

fn ensure_entry(
    map: &mut muster_ownership::OwnershipMap,
    key: FederateKey,
    state: OwnershipState,
) -> usize {
    if let Some(index) = map.iter().position(|entry| entry.federate == key) {
        index
    } else {
        map.push(OwnershipEntry::new(key, state));
        map.len() - 1
    }
}

fn refresh_owner(master_property: &mut MasterProperty) {
    master_property.owner = find_owner(&master_property.ownership_map)
        .map(|index| master_property.ownership_map[index].federate);
}

fn should_update_ownership(property: &Property, master_property: &MasterProperty) -> bool {
    property.has_master
        && (property.instance_ownership.operation != OwnershipOperation::None
            || property.ownership_version == 0
            || property.ownership_version != master_property.ownership_version)
}

fn has_instance_with_master(state: &FederateState, master_id: i64) -> bool {
    state
        .instances
        .iter()
        .any(|instance| instance.lock().master_id == Some(master_id))
}

fn find_instance_by_object_id(
    state: &FederateState,
    object_id: ObjectId,
) -> Option<Arc<Mutex<ObjectInstance>>> {
    state
        .instances
        .iter()
        .find(|instance| instance.lock().object_id == object_id)
        .cloned()
}

fn is_well_defined_value(
    master: &MasterInstance,
    state: &FederateState,
    value: &Value,
    required: bool,
) -> bool {
    match value {
        Value::Undefined => !required,
        Value::Null
        | Value::Boolean(_)
        | Value::Int32(_)
        | Value::Double(_)
        | Value::String(_)
        | Value::Binary(_) => true,
        Value::Document(fields) => fields
            .iter()
            .all(|(_, v)| is_well_defined_value(master, state, v, true)),
        Value::Array(items) => items
            .iter()
            .all(|v| is_well_defined_value(master, state, v, true)),
        Value::ObjectId(object_id) => {
            for instance in &state.instances {
                let guard = instance.lock();
                if guard.object_id == *object_id {
                    return guard.discovered_and_notified || guard.discovered_not_notified;
                }
            }
            if *object_id == master.object_id {
                return true;
            }
            // forward references to undiscovered objects stall discovery
            false
        }
    }
}

/// Withdraw every publication this instance holds, as an unpublish visible
/// to the remaining participants. Losing the destructor's last publisher
/// marks the master instance deleted.
fn unpublish_instance(
    instance: &mut ObjectInstance,
    master: &mut MasterInstance,
    key: FederateKey,
    roster: &[RosterEntry],
    policy: &OwnershipPolicy,
) {
    let MasterInstance {
        properties: master_properties,
        deleted,
        ..
    } = master;
    for property in instance.properties.values_mut() {
        property.instance_ownership = StateOperation {
            state: OwnershipState::unowned_not_able_to_acquire(),
            operation: OwnershipOperation::None,
        };
        if !property.has_master {
            continue;
        }
        let Some(master_property) = master_properties.get_mut(&property.name) else {
            continue;
        };
        let map = &mut master_property.ownership_map;
        if let Some(index) = map.iter().position(|entry| entry.federate == key) {
            map[index].notification = OwnershipNotification::None;
            {
                let eligible = policy_eligibility(roster, policy, &property.name);
                update_ownership_notifications(map, index, OwnershipOperation::Unpublish, &eligible);
            }
            map[index].state = property.instance_ownership.state;
            if property.name == DESTRUCTOR && !has_publisher(map) {
                *deleted = true;
            }
            master_property.ownership_version += 1;
            map.remove(index);
            if let Some(error) = validate_ownership(map) {
                error!(property = %property.name, %error, "ownership map invalid after unpublish");
            }
            refresh_owner(master_property);
        }
        property.has_master = false;
    }
}

/// Reconcile one property's federate-side ownership against the master.
#[allow(clippy::too_many_arguments)]
fn update_ownership_for_property(
    key: FederateKey,
    now: f64,
    published: bool,
    property: &mut Property,
    master_property: &mut MasterProperty,
    master_deleted: &mut bool,
    roster: &[RosterEntry],
    policy: &OwnershipPolicy,
    instance_arc: &Arc<Mutex<ObjectInstance>>,
    batch: &mut NotifyBatch,
) -> bool {
    let mut master_changed = false;
    let property_name = property.name.clone();
    let self_index = master_property
        .ownership_map
        .iter()
        .position(|entry| entry.federate == key);

    if let Some(index) = self_index {
        let entry = master_property.ownership_map[index];
        match entry.notification {
            OwnershipNotification::ForcedOwnershipAcquisitionNotification
            | OwnershipNotification::ForcedOwnershipDivestitureNotification => {
                property.instance_ownership = StateOperation {
                    state: entry.state,
                    operation: OwnershipOperation::None,
                };
            }
            _ => match property.instance_ownership.operation {
                OwnershipOperation::None => {}
                OwnershipOperation::ForcedOwnershipAcquisition
                | OwnershipOperation::ForcedOwnershipDivestiture
                | OwnershipOperation::Publish
                | OwnershipOperation::Unpublish => {
                    master_property.ownership_map[index].notification =
                        OwnershipNotification::None;
                }
                _ => {
                    if entry.notification != OwnershipNotification::None {
                        property.instance_ownership = StateOperation {
                            state: entry.state,
                            operation: OwnershipOperation::None,
                        };
                    }
                }
            },
        }

        if property.instance_ownership.operation != OwnershipOperation::None {
            let operation = property.instance_ownership.operation;
            let map = &mut master_property.ownership_map;
            map[index].state = property.instance_ownership.state;
            {
                let eligible = policy_eligibility(roster, policy, &property_name);
                update_ownership_notifications(map, index, operation, &eligible);
            }
            if property_name == DESTRUCTOR && !has_publisher(map) {
                *master_deleted = true;
            }
            if let Some(error) = validate_ownership(map) {
                error!(
                    property = %property_name,
                    %operation,
                    %error,
                    "ownership map invalid after arbitration"
                );
            }
            master_property.ownership_version += 1;
            refresh_owner(master_property);
            property.instance_ownership.operation = OwnershipOperation::None;
            master_changed = true;
        }

        let notification = master_property.ownership_map[index].notification;
        if notification != OwnershipNotification::None {
            apply_notification(&mut property.instance_ownership.state, notification);
            master_property.ownership_map[index].state = property.instance_ownership.state;
            master_property.ownership_map[index].notification = OwnershipNotification::None;
            refresh_owner(master_property);
            batch
                .ownership
                .push((instance_arc.clone(), property_name, notification));
        }
    } else if property
        .instance_ownership
        .state
        .intersects(OwnershipState::OWNED)
        && master_property.owner.is_some()
    {
        // this federate believes it owns a property somebody else holds
        master_property.ownership_map.push(OwnershipEntry {
            federate: key,
            state: property.instance_ownership.state,
            notification: OwnershipNotification::ForcedOwnershipDivestitureNotification,
        });
        refresh_owner(master_property);
        property.assign_from_master(now, master_property, published);
    } else if property.instance_ownership.state != OwnershipState::empty() {
        master_property
            .ownership_map
            .push(OwnershipEntry::new(key, property.instance_ownership.state));
        refresh_owner(master_property);
    } else if master_property.owner.is_some() {
        let state = if published {
            OwnershipState::unowned_able_to_acquire()
        } else {
            OwnershipState::unowned_not_able_to_acquire()
        };
        property.instance_ownership = StateOperation {
            state,
            operation: OwnershipOperation::None,
        };
        master_property
            .ownership_map
            .push(OwnershipEntry::new(key, state));
        refresh_owner(master_property);
    }

    property.ownership_version = master_property.ownership_version;
    master_changed
}
