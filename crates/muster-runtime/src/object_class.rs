//! Object classes: property requirements, publication and observers

use crate::error::{RuntimeError, RuntimeResult};
use crate::federate::Federate;
use crate::object::{ObjectInstance, ObjectRef, DESTRUCTOR};
use muster_ownership::{OwnershipOperation, OwnershipState};
use muster_primitives::ObjectId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Default, Clone)]
pub(crate) struct PropertyInfo {
    pub(crate) required: bool,
    pub(crate) published: bool,
}

type Observer = Arc<dyn Fn(ObjectRef) + Send + Sync>;

struct ClassState {
    properties: HashMap<String, PropertyInfo>,
    observers: Vec<Observer>,
}

/// A named class of objects on one federate.
///
/// Classes declare which properties are *required* for discovery and which
/// are *published* (making this federate eligible to own them), and carry
/// observers invoked on discovery and change.
pub struct ObjectClass {
    federate: Weak<Federate>,
    name: String,
    state: Mutex<ClassState>,
}

impl ObjectClass {
    pub(crate) fn new(federate: Weak<Federate>, name: impl Into<String>) -> Self {
        Self {
            federate,
            name: name.into(),
            state: Mutex::new(ClassState {
                properties: HashMap::new(),
                observers: Vec::new(),
            }),
        }
    }

    /// The class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare properties that must be defined before an instance of this
    /// class is discovered
    pub fn require(&self, names: &[&str]) {
        let mut state = self.state.lock();
        for name in names {
            state
                .properties
                .entry((*name).to_owned())
                .or_default()
                .required = true;
        }
    }

    /// Declare published properties, retro-publishing existing instances
    pub fn publish(self: &Arc<Self>, names: &[&str]) {
        {
            let mut state = self.state.lock();
            for name in names {
                state
                    .properties
                    .entry((*name).to_owned())
                    .or_default()
                    .published = true;
            }
        }
        if let Some(federate) = self.federate.upgrade() {
            for object in self.objects() {
                for name in names {
                    if object
                        .ownership_state(name)
                        .intersects(OwnershipState::NOT_ABLE_TO_ACQUIRE)
                    {
                        let _ = object.modify_ownership_state(name, OwnershipOperation::Publish);
                    }
                }
            }
            federate.schedule_synchronize();
        }
    }

    /// Register an observer invoked on discovery and property changes
    pub fn observe(&self, observer: impl Fn(ObjectRef) + Send + Sync + 'static) {
        self.state.lock().observers.push(Arc::new(observer));
    }

    pub(crate) fn observers(&self) -> Vec<Observer> {
        self.state.lock().observers.clone()
    }

    pub(crate) fn has_observers(&self) -> bool {
        !self.state.lock().observers.is_empty()
    }

    pub(crate) fn property_info(&self, name: &str) -> PropertyInfo {
        self.state
            .lock()
            .properties
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn property_published(&self, name: &str) -> bool {
        self.property_info(name).published
    }

    /// Every declared property with its required flag
    pub(crate) fn declared_properties(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .properties
            .iter()
            .map(|(name, info)| (name.clone(), info.required))
            .collect()
    }

    /// Create an object with a fresh id, implicitly owning its destructor
    pub fn create_auto(self: &Arc<Self>) -> RuntimeResult<ObjectRef> {
        self.create(ObjectId::create())
    }

    /// Create an object with the given id, implicitly owning its destructor
    pub fn create(self: &Arc<Self>, object_id: ObjectId) -> RuntimeResult<ObjectRef> {
        let federate = self.federate.upgrade().ok_or(RuntimeError::NoFederation)?;
        if federate.is_shutdown_started() {
            return Err(RuntimeError::ShutdownInProgress);
        }
        if federate.get_object(object_id).is_some() {
            return Err(RuntimeError::ObjectExists(object_id));
        }

        let mut instance = ObjectInstance::new(self.clone(), object_id, federate.process_id());
        instance.synchronize = true;
        instance.discovered_and_notified = true;
        instance.property_mut(DESTRUCTOR).instance_ownership.state = OwnershipState::owned();

        let instance = Arc::new(Mutex::new(instance));
        federate.insert_instance(instance.clone());
        federate.schedule_synchronize();
        Ok(ObjectRef::new(instance, self.federate.clone()))
    }

    /// First live object of this class matching the predicate
    pub fn find(&self, predicate: impl Fn(&ObjectRef) -> bool) -> Option<ObjectRef> {
        self.objects().into_iter().find(predicate)
    }

    /// Every live object of this class
    pub fn objects(&self) -> Vec<ObjectRef> {
        let Some(federate) = self.federate.upgrade() else {
            return Vec::new();
        };
        federate
            .instances()
            .into_iter()
            .filter(|instance| {
                let guard = instance.lock();
                guard.class.name() == self.name
                    && !guard.deleted_by_object
                    && !guard.deleted_by_master
            })
            .map(|instance| ObjectRef::new(instance, self.federate.clone()))
            .collect()
    }
}
