//! # muster-runtime
//!
//! The federation/federate/object core of the Muster replication runtime.
//!
//! A [`Runtime`] is the process-wide registry of processes and federations.
//! A [`Federation`] is a shared scope of replicated objects; each in-process
//! participant is a [`Federate`] owning a serial task (its "strand"). Objects
//! are created through [`ObjectClass`], carry independently owned properties
//! with triple-buffered timed values, and reconcile against the federation's
//! master instances in the federate's synchronization pass. Events and
//! services ride the same federation membership.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event_class;
mod federate;
mod federation;
mod object;
mod object_class;
mod runtime;
mod service_class;
mod shutdown;

pub use error::{RuntimeError, RuntimeResult};
pub use event_class::EventClass;
pub use federate::{
    EventCallback, Federate, ObjectCallback, OwnershipCallback, ServiceCallback, ServiceFuture,
};
pub use federation::{Federation, OwnershipPolicy};
pub use object::{ObjectRef, PropertySnapshot, SessionKey, TimedValue, DESTRUCTOR};
pub use object_class::ObjectClass;
pub use runtime::{EndpointHook, ProcessInfo, Runtime, RuntimeObserver, SupervisionPolicy};
pub use service_class::ServiceClass;
pub use shutdown::{Shutdownable, ShutdownFuture, ShutdownGate};
