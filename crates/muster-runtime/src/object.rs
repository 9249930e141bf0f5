//! Object instances, properties and the federation-shared master copies

use crate::error::{RuntimeError, RuntimeResult};
use crate::federate::Federate;
use crate::object_class::ObjectClass;
use muster_ownership::{
    apply_operation, is_valid_state_before_operation, OwnershipMap, OwnershipOperation,
    OwnershipState, StateOperation,
};
use muster_primitives::ObjectId;
use muster_value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::error;

/// The destructor property name; its ownership doubles as object ownership.
pub const DESTRUCTOR: &str = "~";

/// Opaque key identifying one session within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(pub u64);

/// A property value window: the previous and next timed values around now
#[derive(Debug, Clone)]
pub struct TimedValue {
    /// Time of the earlier value, relative to now (non-positive)
    pub t1: f64,
    /// Time of the later value, relative to now
    pub t2: f64,
    /// The earlier value
    pub v1: Value,
    /// The later value
    pub v2: Value,
}

/// A property change snapshot handed to transport integrations
#[derive(Debug, Clone)]
pub struct PropertySnapshot {
    /// Property name
    pub name: String,
    /// The latest (future slot) value
    pub value: Value,
    /// Effective time of that value relative to the federate's now
    pub time: f64,
    /// Producing process
    pub process_id: ObjectId,
    /// Whether this property changed in the last synchronization pass
    pub changed: bool,
    /// Whether changes on this property propagate to the remote peer
    pub routing: bool,
    /// The property's ownership state on this federate
    pub state: OwnershipState,
}

/// Per-federate property slot with the triple-buffered timed value.
pub(crate) struct Property {
    pub(crate) name: String,

    time1: f64,
    time2: f64,
    time3: f64,
    value1: Value,
    value2: Value,
    pub(crate) value3: Value,
    version1: i32,
    version2: i32,
    pub(crate) version3: i32,

    pub(crate) ownership_version: i32,
    pub(crate) instance_ownership: StateOperation,
    pub(crate) process_id: ObjectId,
    pub(crate) session: Option<SessionKey>,
    pub(crate) routing: bool,
    pub(crate) changed: bool,
    pub(crate) has_master: bool,
}

impl Property {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time1: 0.0,
            time2: 0.0,
            time3: 0.0,
            value1: Value::Undefined,
            value2: Value::Undefined,
            value3: Value::Undefined,
            version1: 0,
            version2: 0,
            version3: 0,
            ownership_version: 0,
            instance_ownership: StateOperation::default(),
            process_id: ObjectId::ZERO,
            session: None,
            routing: true,
            changed: false,
            has_master: false,
        }
    }

    pub(crate) fn time3(&self) -> f64 {
        self.time3
    }

    pub(crate) fn time2(&self) -> f64 {
        self.time2
    }

    pub(crate) fn value_at(&self, now: f64) -> &Value {
        if now < self.time2 {
            &self.value1
        } else if now < self.time3 {
            &self.value2
        } else {
            &self.value3
        }
    }

    pub(crate) fn time_at(&self, now: f64) -> f64 {
        let t = if now < self.time2 {
            self.time1
        } else if now < self.time3 {
            self.time2
        } else {
            self.time3
        };
        t - now
    }

    pub(crate) fn version_at(&self, now: f64) -> i32 {
        if now < self.time2 {
            self.version1
        } else if now < self.time3 {
            self.version2
        } else {
            self.version3
        }
    }

    pub(crate) fn timed_value_at(&self, now: f64) -> TimedValue {
        if now < self.time3 {
            TimedValue {
                t1: self.time1 - now,
                t2: self.time2 - now,
                v1: self.value1.clone(),
                v2: self.value2.clone(),
            }
        } else {
            TimedValue {
                t1: self.time2 - now,
                t2: self.time3 - now,
                v1: self.value2.clone(),
                v2: self.value3.clone(),
            }
        }
    }

    pub(crate) fn has_delayed_change(&self, now: f64) -> bool {
        self.time3 >= now
    }

    pub(crate) fn can_set_value(&self) -> bool {
        !self
            .instance_ownership
            .state
            .intersects(OwnershipState::UNOWNED)
    }

    /// Store a new future-slot value, shifting the triple when now has
    /// passed the present slot. `synchronize` marks a local write that must
    /// propagate (bumping the version); a master assignment passes false.
    pub(crate) fn store(&mut self, now: f64, time: f64, value: Value, synchronize: bool, published: bool) {
        if now >= self.time2 {
            self.time1 = self.time2;
            self.time2 = self.time3;
            std::mem::swap(&mut self.value1, &mut self.value2);
            std::mem::swap(&mut self.value2, &mut self.value3);
            self.version1 = self.version2;
            self.version2 = self.version3;
        }

        self.value3 = value;
        self.time3 = time;

        if self.instance_ownership.state == OwnershipState::empty() {
            self.instance_ownership.state = if synchronize {
                OwnershipState::owned()
            } else if published {
                OwnershipState::unowned_able_to_acquire()
            } else {
                OwnershipState::unowned_not_able_to_acquire()
            };
        }

        if synchronize {
            self.version3 += 1;
        }
    }

    pub(crate) fn assign_from_master(&mut self, now: f64, master: &MasterProperty, published: bool) {
        self.process_id = master.process_id;
        self.session = master.session;
        let time = master.time + now;
        let time = time.max(self.time2);
        self.store(now, time, master.value.clone(), false, published);
        self.version3 = master.version;
    }
}

/// The federation-canonical copy of one property.
pub(crate) struct MasterProperty {
    pub(crate) name: String,
    pub(crate) time: f64,
    pub(crate) value: Value,
    pub(crate) version: i32,
    pub(crate) ownership_map: OwnershipMap,
    pub(crate) ownership_version: i32,
    pub(crate) owner: Option<muster_ownership::FederateKey>,
    pub(crate) process_id: ObjectId,
    pub(crate) session: Option<SessionKey>,
    pub(crate) sync_flag: bool,
}

impl MasterProperty {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time: 0.0,
            value: Value::Undefined,
            version: 0,
            ownership_map: OwnershipMap::new(),
            ownership_version: 0,
            owner: None,
            process_id: ObjectId::ZERO,
            session: None,
            sync_flag: false,
        }
    }

    pub(crate) fn assign_from(&mut self, now: f64, property: &Property) {
        self.process_id = property.process_id;
        self.session = property.session;
        self.value = property.value3.clone();
        self.time = property.time3 - now;
        self.version = property.version3;
    }
}

/// The federation-canonical copy of one object.
pub(crate) struct MasterInstance {
    pub(crate) instance_id: i64,
    pub(crate) object_id: ObjectId,
    pub(crate) class_name: String,
    pub(crate) ref_count: i32,
    pub(crate) deleted: bool,
    pub(crate) properties: HashMap<String, MasterProperty>,
}

impl MasterInstance {
    pub(crate) fn new(instance_id: i64, object_id: ObjectId, class_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            object_id,
            class_name: class_name.into(),
            ref_count: 0,
            deleted: false,
            properties: HashMap::new(),
        }
    }

    pub(crate) fn property_mut(&mut self, name: &str) -> &mut MasterProperty {
        self.properties
            .entry(name.to_owned())
            .or_insert_with(|| MasterProperty::new(name))
    }
}

/// Per-federate view of one object.
pub(crate) struct ObjectInstance {
    pub(crate) object_id: ObjectId,
    pub(crate) process_id: ObjectId,
    pub(crate) class: Arc<ObjectClass>,
    pub(crate) properties: HashMap<String, Property>,
    pub(crate) master_id: Option<i64>,
    pub(crate) spurious: bool,
    pub(crate) deleted_by_object: bool,
    pub(crate) deleted_by_master: bool,
    pub(crate) synchronize: bool,
    pub(crate) notify: bool,
    pub(crate) discovered_not_notified: bool,
    pub(crate) discovered_and_notified: bool,
}

impl ObjectInstance {
    pub(crate) fn new(class: Arc<ObjectClass>, object_id: ObjectId, process_id: ObjectId) -> Self {
        Self {
            object_id,
            process_id,
            class,
            properties: HashMap::new(),
            master_id: None,
            spurious: false,
            deleted_by_object: false,
            deleted_by_master: false,
            synchronize: false,
            notify: false,
            discovered_not_notified: false,
            discovered_and_notified: false,
        }
    }

    pub(crate) fn property_mut(&mut self, name: &str) -> &mut Property {
        if !self.properties.contains_key(name) {
            self.properties.insert(name.to_owned(), Property::new(name));
            self.synchronize = true;
        }
        self.properties.get_mut(name).expect("just inserted")
    }
}

/// Shared handle to an object on one federate.
///
/// Cloning the ref shares the same instance. Property accessors read the
/// slot selected by the federate's current time; writers fail with
/// [`RuntimeError::NotOwned`] unless this federate owns the property.
#[derive(Clone)]
pub struct ObjectRef {
    pub(crate) instance: Arc<Mutex<ObjectInstance>>,
    pub(crate) federate: Weak<Federate>,
}

impl ObjectRef {
    pub(crate) fn new(instance: Arc<Mutex<ObjectInstance>>, federate: Weak<Federate>) -> Self {
        Self { instance, federate }
    }

    fn now(&self) -> f64 {
        self.federate
            .upgrade()
            .map(|f| f.current_time())
            .unwrap_or(0.0)
    }

    /// The object's id
    pub fn object_id(&self) -> ObjectId {
        self.instance.lock().object_id
    }

    /// The object's class name
    pub fn class_name(&self) -> String {
        self.instance.lock().class.name().to_owned()
    }

    /// Read the current value of a property
    pub fn get(&self, name: &str) -> Value {
        let now = self.now();
        let instance = self.instance.lock();
        instance
            .properties
            .get(name)
            .map(|p| p.value_at(now).clone())
            .unwrap_or(Value::Undefined)
    }

    /// Effective time of the current value relative to now
    pub fn time(&self, name: &str) -> f64 {
        let now = self.now();
        let instance = self.instance.lock();
        instance
            .properties
            .get(name)
            .map(|p| p.time_at(now))
            .unwrap_or(0.0)
    }

    /// Version of the current value
    pub fn version(&self, name: &str) -> i32 {
        let now = self.now();
        let instance = self.instance.lock();
        instance
            .properties
            .get(name)
            .map(|p| p.version_at(now))
            .unwrap_or(0)
    }

    /// The value window around now
    pub fn timed_value(&self, name: &str) -> Option<TimedValue> {
        let now = self.now();
        let instance = self.instance.lock();
        instance.properties.get(name).map(|p| p.timed_value_at(now))
    }

    /// Whether a write with effect in the future is pending
    pub fn has_delayed_change(&self, name: &str) -> bool {
        let now = self.now();
        let instance = self.instance.lock();
        instance
            .properties
            .get(name)
            .map(|p| p.has_delayed_change(now))
            .unwrap_or(false)
    }

    /// Whether this federate may write the property
    pub fn can_set(&self, name: &str) -> bool {
        let mut instance = self.instance.lock();
        instance.property_mut(name).can_set_value()
    }

    /// Write a property now
    pub fn set(&self, name: &str, value: impl Into<Value>) -> RuntimeResult<()> {
        self.set_delayed(name, value, 0.0)
    }

    /// Write a property taking effect after `delay` seconds
    pub fn set_delayed(&self, name: &str, value: impl Into<Value>, delay: f64) -> RuntimeResult<()> {
        let value = value.into();
        let federate = self.federate.upgrade().ok_or(RuntimeError::NoFederation)?;
        let now = federate.current_time();
        {
            let mut instance = self.instance.lock();
            let process_id = instance.process_id;
            let class = instance.class.clone();
            let property = instance.property_mut(name);
            if !property.can_set_value() {
                return Err(RuntimeError::NotOwned {
                    class: class.name().to_owned(),
                    property: name.to_owned(),
                });
            }
            let time = now + delay;
            if time < property.time3() {
                return Ok(());
            }
            // idempotent same-scalar writes are dropped
            if !value.is_document() && !value.is_array() && property.value3 == value {
                return Ok(());
            }
            property.process_id = process_id;
            property.session = None;
            let published = class.property_published(name);
            property.store(now, time, value, true, published);
            instance.synchronize = true;
        }
        federate.schedule_synchronize();
        Ok(())
    }

    /// Apply a property write received from a session.
    ///
    /// The effective time is clamped to preserve monotonicity of the value
    /// buffer against earlier remote writes.
    pub fn set_from_remote(
        &self,
        name: &str,
        value: Value,
        delay: f64,
        session: SessionKey,
        process_id: ObjectId,
    ) -> RuntimeResult<()> {
        let federate = self.federate.upgrade().ok_or(RuntimeError::NoFederation)?;
        let now = federate.current_time();
        {
            let mut instance = self.instance.lock();
            let class = instance.class.clone();
            let property = instance.property_mut(name);
            if !property.can_set_value() {
                return Err(RuntimeError::NotOwned {
                    class: class.name().to_owned(),
                    property: name.to_owned(),
                });
            }
            let time = (now + delay).max(property.time2());
            property.process_id = process_id;
            property.session = Some(session);
            let published = class.property_published(name);
            property.store(now, time, value, true, published);
            instance.synchronize = true;
        }
        federate.schedule_synchronize();
        Ok(())
    }

    /// Ownership state of a property on this federate
    pub fn ownership_state(&self, name: &str) -> OwnershipState {
        let mut instance = self.instance.lock();
        instance.property_mut(name).instance_ownership.state
    }

    /// Ownership state of the destructor property
    pub fn object_ownership_state(&self) -> OwnershipState {
        self.ownership_state(DESTRUCTOR)
    }

    /// Whether the property has no ownership operation awaiting arbitration
    pub fn pending_operation_is_none(&self, name: &str) -> bool {
        let mut instance = self.instance.lock();
        instance.property_mut(name).instance_ownership.operation == OwnershipOperation::None
    }

    /// Step the ownership state machine for a property.
    ///
    /// Invalid transitions are logged and rejected, never fatal.
    pub fn modify_ownership_state(
        &self,
        name: &str,
        operation: OwnershipOperation,
    ) -> RuntimeResult<()> {
        let federate = self.federate.upgrade().ok_or(RuntimeError::NoFederation)?;
        {
            let mut instance = self.instance.lock();
            let class_name = instance.class.name().to_owned();
            let object_id = instance.object_id;
            let property = instance.property_mut(name);
            if !is_valid_state_before_operation(property.instance_ownership.state, operation) {
                error!(
                    class = %class_name,
                    object = %object_id,
                    property = name,
                    state = %property.instance_ownership.state,
                    %operation,
                    "modify_ownership_state: invalid state for operation"
                );
                return Err(RuntimeError::InvalidOwnershipState {
                    state: property.instance_ownership.state,
                    operation,
                });
            }
            if !apply_operation(&mut property.instance_ownership, operation) {
                return Err(RuntimeError::InvalidOwnershipState {
                    state: property.instance_ownership.state,
                    operation,
                });
            }
            instance.synchronize = true;
        }
        federate.schedule_synchronize();
        Ok(())
    }

    /// Step the destructor property's ownership state machine
    pub fn modify_object_ownership_state(&self, operation: OwnershipOperation) -> RuntimeResult<()> {
        self.modify_ownership_state(DESTRUCTOR, operation)
    }

    /// Whether this federate may delete the object
    pub fn can_delete(&self) -> bool {
        self.can_set(DESTRUCTOR)
    }

    /// Delete the object.
    ///
    /// Requires destructor ownership; propagates to every federate on the
    /// next synchronization pass.
    pub fn delete(&self) -> RuntimeResult<()> {
        let federate = self.federate.upgrade().ok_or(RuntimeError::NoFederation)?;
        {
            let mut instance = self.instance.lock();
            let class = instance.class.clone();
            if !instance.property_mut(DESTRUCTOR).can_set_value() {
                return Err(RuntimeError::NotOwned {
                    class: class.name().to_owned(),
                    property: DESTRUCTOR.to_owned(),
                });
            }
            if instance.deleted_by_object || instance.deleted_by_master {
                return Ok(());
            }
            instance.deleted_by_object = true;
        }
        federate.schedule_synchronize();
        Ok(())
    }

    /// Whether the object was discovered but its discovery not yet notified
    pub fn just_discovered(&self) -> bool {
        self.instance.lock().discovered_not_notified
    }

    /// Whether the object was deleted by the federation
    pub fn just_destroyed(&self) -> bool {
        self.instance.lock().deleted_by_master
    }

    /// Whether this federate deleted the object locally
    pub fn is_deleted_by_object(&self) -> bool {
        self.instance.lock().deleted_by_object
    }

    /// Names of every property present on the instance
    pub fn property_names(&self) -> Vec<String> {
        self.instance.lock().properties.keys().cloned().collect()
    }

    /// Snapshot the future slot of every property for serialization
    pub fn snapshot_properties(&self) -> Vec<PropertySnapshot> {
        let now = self.now();
        let instance = self.instance.lock();
        instance
            .properties
            .values()
            .map(|p| PropertySnapshot {
                name: p.name.clone(),
                value: p.value3.clone(),
                time: p.time3 - now,
                process_id: p.process_id,
                changed: p.changed,
                routing: p.routing,
                state: p.instance_ownership.state,
            })
            .collect()
    }

    /// The session and process the property's last value arrived from
    pub fn remote_source(&self, name: &str) -> (Option<SessionKey>, ObjectId) {
        let mut instance = self.instance.lock();
        let property = instance.property_mut(name);
        (property.session, property.process_id)
    }

    /// Set the per-session routing flag of a property
    pub fn set_routing(&self, name: &str, routing: bool) {
        let mut instance = self.instance.lock();
        instance.property_mut(name).routing = routing;
    }

    /// The per-session routing flag of a property
    pub fn routing(&self, name: &str) -> bool {
        let mut instance = self.instance.lock();
        instance.property_mut(name).routing
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_store_and_read() {
        let mut p = Property::new("hp");
        p.store(0.0, 0.0, Value::Int32(10), true, true);
        assert_eq!(p.value_at(0.0), &Value::Int32(10));
        assert_eq!(p.version_at(0.0), 1);
    }

    #[test]
    fn test_property_delayed_write() {
        let mut p = Property::new("hp");
        p.store(0.0, 5.0, Value::Int32(10), true, true);
        // before the effective time the present slot is still empty
        assert_eq!(p.value_at(0.0), &Value::Undefined);
        assert!(p.has_delayed_change(0.0));
        assert_eq!(p.value_at(5.0), &Value::Int32(10));
    }

    #[test]
    fn test_property_triple_shift() {
        let mut p = Property::new("hp");
        p.store(0.0, 0.0, Value::Int32(1), true, true);
        p.store(1.0, 1.0, Value::Int32(2), true, true);
        p.store(2.0, 2.0, Value::Int32(3), true, true);
        assert_eq!(p.value_at(0.5), &Value::Int32(1));
        assert_eq!(p.value_at(1.5), &Value::Int32(2));
        assert_eq!(p.value_at(2.5), &Value::Int32(3));
        assert_eq!(p.version_at(2.5), 3);
    }

    #[test]
    fn test_property_versions_strictly_increase() {
        let mut p = Property::new("hp");
        for i in 0..5 {
            p.store(i as f64, i as f64, Value::Int32(i), true, true);
            assert_eq!(p.version_at(i as f64), i + 1);
        }
    }

    #[test]
    fn test_first_synchronized_write_bootstraps_ownership() {
        let mut p = Property::new("hp");
        assert_eq!(p.instance_ownership.state, OwnershipState::empty());
        p.store(0.0, 0.0, Value::Int32(1), true, true);
        assert_eq!(p.instance_ownership.state, OwnershipState::owned());
    }

    #[test]
    fn test_first_master_assignment_bootstraps_subscriber_state() {
        let mut published = Property::new("hp");
        published.store(0.0, 0.0, Value::Int32(1), false, true);
        assert_eq!(
            published.instance_ownership.state,
            OwnershipState::unowned_able_to_acquire()
        );

        let mut subscriber = Property::new("hp");
        subscriber.store(0.0, 0.0, Value::Int32(1), false, false);
        assert_eq!(
            subscriber.instance_ownership.state,
            OwnershipState::unowned_not_able_to_acquire()
        );
    }

    #[test]
    fn test_assign_from_master_takes_version() {
        let mut master = MasterProperty::new("hp");
        master.value = Value::Int32(7);
        master.version = 4;
        master.time = -0.5;

        let mut p = Property::new("hp");
        p.assign_from_master(1.0, &master, true);
        assert_eq!(p.version_at(1.0), 4);
        assert_eq!(p.value_at(1.0), &Value::Int32(7));
    }

    #[test]
    fn test_timed_value_window() {
        let mut p = Property::new("hp");
        p.store(0.0, 0.0, Value::Int32(1), true, true);
        p.store(1.0, 3.0, Value::Int32(2), true, true);
        // ahead of the delayed write the window spans the two older slots
        let early = p.timed_value_at(2.0);
        assert_eq!(early.v2, Value::Int32(1));
        // once effective, the window ends at the delayed value
        let late = p.timed_value_at(3.0);
        assert_eq!(late.v1, Value::Int32(1));
        assert_eq!(late.v2, Value::Int32(2));
        assert_eq!(late.t2, 0.0);
    }
}

