//! Session federates: the per-(session, federation) bridge
//!
//! A session federate is an ordinary federate whose callbacks serialize
//! object changes, events, service traffic and ownership routing into wire
//! messages. Messages produced within one synchronization block are batched
//! and flushed as a single `Messages` packet when the block ends.

use crate::session::Session;
use crate::wire::{MessageKind, PacketKind};
use muster_ownership::{OwnershipNotification, OwnershipState};
use muster_primitives::{FederationType, ObjectChange, ObjectId, ProcessType};
use muster_runtime::{Federate, ObjectRef, Shutdownable};
use muster_value::{Arr, Doc, Reason, Value};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// The per-(session, federation) federate.
pub struct SessionFederate {
    federate: Arc<Federate>,
    session: Weak<Session>,
    federation_id: ObjectId,
    messages: Mutex<Vec<Value>>,
}

impl SessionFederate {
    /// Build the federate and wire its callbacks to the session.
    pub(crate) fn new(
        session: &Arc<Session>,
        federation_id: ObjectId,
        peer_type: ProcessType,
    ) -> Arc<SessionFederate> {
        let runtime = session.runtime().clone();
        let federate = Federate::new_session(runtime.clone(), "Session", session.key());

        if runtime.federation_type(federation_id) == FederationType::Lobby {
            federate.get_object_class("Match").require(&["teams"]);
            federate.get_object_class("Team").require(&["slots"]);
        }

        let this = Arc::new(SessionFederate {
            federate: federate.clone(),
            session: Arc::downgrade(session),
            federation_id,
            messages: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&this);
        federate.set_block_listener({
            let weak = weak.clone();
            move || {
                if let Some(this) = weak.upgrade() {
                    this.flush();
                }
            }
        });

        federate.set_object_callback({
            let weak = weak.clone();
            move |object| {
                if let Some(this) = weak.upgrade() {
                    this.object_callback(object);
                }
            }
        });

        federate.set_event_callback({
            let weak = weak.clone();
            move |event, params| {
                if let Some(this) = weak.upgrade() {
                    this.event_callback(event, params);
                }
            }
        });

        if peer_type != ProcessType::Agent {
            federate.set_service_callback({
                let weak = weak.clone();
                move |service, params, subject_id| {
                    let Some(this) = weak.upgrade() else {
                        return Box::pin(async { Err(Reason::new(404, "session gone")) });
                    };
                    this.service_callback(service, params, subject_id)
                }
            });
        }

        if peer_type != ProcessType::Agent && peer_type != ProcessType::Headup {
            federate.set_ownership_callback({
                let weak = weak.clone();
                move |object, property, notification| {
                    if let Some(this) = weak.upgrade() {
                        this.ownership_callback(object, property, notification);
                    }
                }
            });
        } else {
            federate.set_ownership_callback(|_, _, _| {});
        }

        this
    }

    /// The underlying federate
    pub fn federate(&self) -> &Arc<Federate> {
        &self.federate
    }

    /// The federation this federate mirrors
    pub fn federation_id(&self) -> ObjectId {
        self.federation_id
    }

    /// Whether teardown has begun
    pub fn is_shutdown_started(&self) -> bool {
        self.federate.is_shutdown_started()
    }

    pub(crate) fn startup(&self) {
        let _ = self.federate.startup(self.federation_id);
    }

    /// Enqueue a message from the federate's own strand
    fn enqueue_message(&self, message: Value) {
        self.messages.lock().push(message);
        if !self.federate_in_block() {
            self.flush();
        }
    }

    /// Enqueue a message from any thread, via the federate's strand
    pub fn post_message(self: &Arc<Self>, message: Value) {
        let weak = Arc::downgrade(self);
        self.federate.post_task(move |_| {
            if let Some(this) = weak.upgrade() {
                this.enqueue_message(message);
            }
        });
    }

    fn federate_in_block(&self) -> bool {
        self.federate.in_block()
    }

    /// Flush the batched messages as a single `Messages` packet
    fn flush(&self) {
        let messages: Vec<Value> = std::mem::take(&mut *self.messages.lock());
        if messages.is_empty() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let packet = Doc::new()
            .field("m", PacketKind::Messages as i32)
            .field("mm", Arr::new().items(messages).build())
            .build();
        session.post_packet(packet);
    }

    fn prefix_filtered(&self, name: &str) -> bool {
        let Some(session) = self.session.upgrade() else {
            return true;
        };
        match session.do_not_distribute_prefix() {
            Some(prefix) => name.starts_with(prefix),
            None => false,
        }
    }

    /// Serialize a discovered/updated/deleted object into an
    /// `ObjectChanges` message.
    fn object_callback(&self, object: ObjectRef) {
        if self.prefix_filtered(&object.class_name()) {
            return;
        }

        let change = if object.just_destroyed() {
            ObjectChange::Delete
        } else if object.just_discovered() {
            ObjectChange::Discover
        } else {
            ObjectChange::Update
        };

        let peer_known = self
            .session
            .upgrade()
            .map(|session| session.process_type() != ProcessType::None)
            .unwrap_or(false);

        let mut distribute = change != ObjectChange::Update;
        let mut properties = Doc::new();

        if change == ObjectChange::Delete {
            // deletes carry no property payload
        } else {
            if peer_known
                && object
                    .object_ownership_state()
                    .intersects(OwnershipState::NOT_ABLE_TO_ACQUIRE)
            {
                let _ = object
                    .modify_object_ownership_state(muster_ownership::OwnershipOperation::Publish);
            }
            for snapshot in object.snapshot_properties() {
                let should_distribute = snapshot.changed
                    && snapshot.routing
                    && !self.prefix_filtered(&snapshot.name);
                if !should_distribute {
                    continue;
                }
                if peer_known && snapshot.state.intersects(OwnershipState::NOT_ABLE_TO_ACQUIRE) {
                    let _ = object.modify_ownership_state(
                        &snapshot.name,
                        muster_ownership::OwnershipOperation::Publish,
                    );
                }
                properties = properties.field(
                    snapshot.name.clone(),
                    Doc::new()
                        .field("v", snapshot.value)
                        .field("t", snapshot.time)
                        .field("p", snapshot.process_id)
                        .build(),
                );
                distribute = true;
            }
        }

        if distribute {
            self.enqueue_message(
                Doc::new()
                    .field("m", MessageKind::ObjectChanges as i32)
                    .field("x", self.federation_id.to_hex())
                    .field("i", object.object_id())
                    .field("c", object.class_name())
                    .field("t", change as i32)
                    .field("p", properties.build())
                    .build(),
            );
        }
    }

    fn event_callback(&self, event: &str, params: &Value) {
        if self.prefix_filtered(event) {
            return;
        }
        self.enqueue_message(
            Doc::new()
                .field("m", MessageKind::EventDispatch as i32)
                .field("x", self.federation_id.to_hex())
                .field("e", event)
                .field("v", params.clone())
                .field("d", self.federate.event_delay())
                .field("t", self.federate.event_latency())
                .build(),
        );
    }

    fn service_callback(
        &self,
        service: &str,
        params: Value,
        subject_id: String,
    ) -> muster_runtime::ServiceFuture {
        if self.prefix_filtered(service) {
            return Box::pin(async { Err(Reason::new(404, "not distributed")) });
        }
        let Some(session) = self.session.upgrade() else {
            return Box::pin(async { Err(Reason::new(404, "session gone")) });
        };
        let (request_id, receiver) = session.generate_service_request();
        self.enqueue_message(
            Doc::new()
                .field("m", MessageKind::ServiceRequest as i32)
                .field("x", self.federation_id.to_hex())
                .field("s", service)
                .field("r", request_id)
                .field("v", params)
                .field("i", subject_id)
                .build(),
        );
        Box::pin(async move {
            match receiver.await {
                Ok(result) => result,
                // the session died with the request pending
                Err(_) => std::future::pending().await,
            }
        })
    }

    /// Map an ownership notification onto its routing message.
    fn ownership_callback(
        &self,
        object: ObjectRef,
        property: &str,
        notification: OwnershipNotification,
    ) {
        if self.prefix_filtered(&object.class_name()) || self.prefix_filtered(property) {
            return;
        }
        let kind = match notification {
            OwnershipNotification::RequestOwnershipAssumption => {
                MessageKind::RoutingRequestDownstream
            }
            OwnershipNotification::OwnershipAcquisitionNotification
            | OwnershipNotification::ForcedOwnershipAcquisitionNotification => {
                MessageKind::RoutingEnableDownstream
            }
            OwnershipNotification::RequestOwnershipRelease => MessageKind::RoutingRequestUpstream,
            OwnershipNotification::OwnershipDivestitureNotification
            | OwnershipNotification::ForcedOwnershipDivestitureNotification => {
                MessageKind::RoutingEnableUpstream
            }
            OwnershipNotification::OwnershipUnavailable => MessageKind::RoutingUpstreamDenied,
            _ => return,
        };
        self.enqueue_message(
            Doc::new()
                .field("m", kind as i32)
                .field("x", self.federation_id.to_hex())
                .field("i", object.object_id())
                .field("p", property)
                .build(),
        );
    }

    /// Tell the peer its forced acquisition was denied
    pub(crate) fn notify_ownership_unavailable(self: &Arc<Self>, object: &ObjectRef, property: &str) {
        self.post_message(
            Doc::new()
                .field("m", MessageKind::RoutingUpstreamDenied as i32)
                .field("x", self.federation_id.to_hex())
                .field("i", object.object_id())
                .field("p", property)
                .build(),
        );
    }

    /// Tear the federate down and withdraw the peer's membership
    pub async fn shutdown(self: &Arc<Self>) {
        let federation_id = self.federation_id;
        self.federate.shutdown().await;
        if let Some(session) = self.session.upgrade() {
            session.remove_federation(federation_id, self);
            let peer = session.process_id();
            session
                .runtime()
                .federation_process_removed(federation_id, peer);
        }
        debug!(%federation_id, "session federate shut down");
    }
}
