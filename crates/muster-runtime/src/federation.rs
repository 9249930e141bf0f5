//! Federations: the shared scope of master instances and federates

use crate::federate::{Federate, FederateTask, ServiceFuture};
use crate::object::MasterInstance;
use crate::shutdown::Shutdownable;
use muster_ownership::FederateKey;
use muster_primitives::{FederationType, ObjectId};
use muster_value::{Reason, Value};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::debug;

/// Predicate deciding whether a federate may own a property
pub type OwnershipPolicy = Arc<dyn Fn(&Federate, &str) -> bool + Send + Sync>;

pub(crate) struct RosterEntry {
    pub(crate) key: FederateKey,
    pub(crate) federate: Weak<Federate>,
}

pub(crate) struct FederationState {
    pub(crate) roster: Vec<RosterEntry>,
    pub(crate) masters: BTreeMap<i64, MasterInstance>,
    pub(crate) last_instance_id: i64,
    pub(crate) policy: OwnershipPolicy,
    pub(crate) exclusive_owner: Option<FederateKey>,
    pub(crate) supervisor: Option<Arc<dyn Shutdownable>>,
}

/// Build the ownership-policy filter used during arbitration.
pub(crate) fn policy_eligibility<'a>(
    roster: &'a [RosterEntry],
    policy: &'a OwnershipPolicy,
    property: &'a str,
) -> impl Fn(FederateKey) -> bool + 'a {
    move |key| {
        roster
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.federate.upgrade())
            .map(|federate| (**policy)(&federate, property))
            .unwrap_or(false)
    }
}

/// A shared scope of replicated objects.
///
/// Holds the canonical master instances, the ordered federate roster, the
/// ownership policy, and routes events and service requests between its
/// members. Reference-counted through [`Runtime::acquire_federation`].
pub struct Federation {
    federation_id: ObjectId,
    federation_type: Mutex<FederationType>,
    pub(crate) state: Mutex<FederationState>,
    pub(crate) acquire_count: AtomicI32,
}

impl Federation {
    pub(crate) fn new(federation_id: ObjectId) -> Self {
        Self {
            federation_id,
            federation_type: Mutex::new(FederationType::None),
            state: Mutex::new(FederationState {
                roster: Vec::new(),
                masters: BTreeMap::new(),
                last_instance_id: 0,
                policy: Arc::new(|_, _| true),
                exclusive_owner: None,
                supervisor: None,
            }),
            acquire_count: AtomicI32::new(0),
        }
    }

    /// The federation id
    pub fn federation_id(&self) -> ObjectId {
        self.federation_id
    }

    /// The federation type, informational
    pub fn federation_type(&self) -> FederationType {
        *self.federation_type.lock()
    }

    pub(crate) fn set_federation_type(&self, federation_type: FederationType) {
        *self.federation_type.lock() = federation_type;
    }

    /// Install the ownership policy; `None` restores the allow-all default
    pub fn set_ownership_policy(&self, policy: Option<OwnershipPolicy>) {
        self.state.lock().policy = policy.unwrap_or_else(|| Arc::new(|_, _| true));
    }

    /// Install an application supervisor, torn down with the runtime
    pub fn set_supervisor(&self, supervisor: Arc<dyn Shutdownable>) {
        self.state.lock().supervisor = Some(supervisor);
    }

    pub(crate) fn take_supervisor(&self) -> Option<Arc<dyn Shutdownable>> {
        self.state.lock().supervisor.take()
    }

    pub(crate) fn has_supervisor(&self) -> bool {
        self.state.lock().supervisor.is_some()
    }

    /// The exclusive owner lock, if set
    pub fn exclusive_owner(&self) -> Option<FederateKey> {
        self.state.lock().exclusive_owner
    }

    /// Lock forced ownership acquisition to one federate; `None` clears
    pub fn set_exclusive_owner(&self, federate: Option<&Arc<Federate>>) {
        self.state.lock().exclusive_owner = federate.map(|f| f.key());
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FederationState> {
        self.state.lock()
    }

    pub(crate) fn add_federate(&self, federate: &Arc<Federate>) {
        self.state.lock().roster.push(RosterEntry {
            key: federate.key(),
            federate: Arc::downgrade(federate),
        });
    }

    pub(crate) fn remove_federate(&self, key: FederateKey) {
        self.state.lock().roster.retain(|entry| entry.key != key);
    }

    /// Schedule a synchronization pass on every federate but `exception`.
    pub(crate) fn schedule_others_locked(state: &FederationState, exception: FederateKey) {
        for entry in &state.roster {
            if entry.key != exception {
                if let Some(federate) = entry.federate.upgrade() {
                    federate.schedule_synchronize();
                }
            }
        }
    }

    /// Dispatch an event to every federate but the originator, in roster
    /// order, each on its own strand.
    pub(crate) fn dispatch_event(
        &self,
        originator: FederateKey,
        event: &str,
        params: Value,
        delay: f64,
        latency: f64,
    ) {
        let state = self.state.lock();
        for entry in &state.roster {
            if entry.key == originator {
                continue;
            }
            let Some(federate) = entry.federate.upgrade() else {
                continue;
            };
            let event = event.to_owned();
            let params = params.clone();
            federate.post(FederateTask::Run(Box::new(move |fed| {
                fed.set_event_context(delay, latency);
                fed.enter_block();
                let event_class = fed.get_event_class(&event);
                for subscriber in event_class.subscribers() {
                    (*subscriber)(&params);
                }
                if let Some(callback) = fed.event_callback() {
                    (*callback)(&event, &params);
                }
                fed.leave_block();
                fed.set_event_context(0.0, 0.0);
            })));
        }
    }

    /// Route a service request.
    ///
    /// Federates with a provider for the service are tried in roster order,
    /// skipping the originator and retrying on rejection; with no provider
    /// left the catch-all service callbacks are tried the same way. The last
    /// rejection becomes the returned error.
    pub(crate) async fn request_service(
        &self,
        service: &str,
        params: Value,
        subject_id: String,
        originator: Option<FederateKey>,
    ) -> Result<Value, Reason> {
        let mut providers = Vec::new();
        let mut fallbacks = Vec::new();
        {
            let state = self.state.lock();
            for entry in &state.roster {
                if Some(entry.key) == originator {
                    continue;
                }
                let Some(federate) = entry.federate.upgrade() else {
                    continue;
                };
                if let Some(provider) = federate.find_service_provider(service) {
                    providers.push((federate, provider));
                } else {
                    fallbacks.push(federate);
                }
            }
        }

        let mut rejection = Reason::new(500, format!("unknown service: {}", service));

        for (federate, provider) in providers {
            let params = params.clone();
            let subject_id = subject_id.clone();
            match run_on_strand(&federate, move |_| (*provider)(params, subject_id)).await {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    debug!(service, federate = federate.name(), "service provider rejected");
                    rejection = reason;
                }
            }
        }

        for federate in fallbacks {
            let Some(callback) = federate.service_callback() else {
                continue;
            };
            let service_name = service.to_owned();
            let params = params.clone();
            let subject_id = subject_id.clone();
            match run_on_strand(&federate, move |_| {
                (*callback)(&service_name, params, subject_id)
            })
            .await
            {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    debug!(service, federate = federate.name(), "service callback rejected");
                    rejection = reason;
                }
            }
        }

        Err(rejection)
    }
}

/// Start a service future on the federate's strand and await its result.
async fn run_on_strand(
    federate: &Arc<Federate>,
    make: impl FnOnce(&Arc<Federate>) -> ServiceFuture + Send + 'static,
) -> Result<Value, Reason> {
    let (tx, rx) = oneshot::channel();
    let posted = federate.post(FederateTask::Run(Box::new(move |fed| {
        let future = make(fed);
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
    })));
    if !posted {
        return Err(Reason::new(404, "federate is shutdown"));
    }
    rx.await
        .unwrap_or_else(|_| Err(Reason::new(500, "service aborted")))
}
