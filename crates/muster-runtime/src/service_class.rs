//! Service classes: definition and requesting

use crate::federate::{Federate, ServiceFuture};
use muster_value::{Reason, Value};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub(crate) type ServiceProvider =
    Arc<dyn Fn(Value, String) -> ServiceFuture + Send + Sync>;

/// A named service on one federate.
///
/// At most one provider per (federate, service); requests route through the
/// federation to the first federate with a provider, falling back to the
/// catch-all service callbacks.
pub struct ServiceClass {
    federate: Weak<Federate>,
    name: String,
    provider: Mutex<Option<ServiceProvider>>,
}

impl ServiceClass {
    pub(crate) fn new(federate: Weak<Federate>, name: impl Into<String>) -> Self {
        Self {
            federate,
            name: name.into(),
            provider: Mutex::new(None),
        }
    }

    /// The service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the provider for this service
    pub fn define(
        &self,
        provider: impl Fn(Value, String) -> ServiceFuture + Send + Sync + 'static,
    ) {
        *self.provider.lock() = Some(Arc::new(provider));
    }

    /// Remove the provider
    pub fn undefine(&self) {
        *self.provider.lock() = None;
    }

    pub(crate) fn provider(&self) -> Option<ServiceProvider> {
        self.provider.lock().clone()
    }

    /// Request the service through the federation
    pub async fn request(&self, params: Value) -> Result<Value, Reason> {
        let Some(federate) = self.federate.upgrade() else {
            return Err(Reason::new(404, format!("{} rejected: no federation", self.name)));
        };
        let subject_id = federate.runtime().subject_id();
        federate.request_service(&self.name, params, subject_id).await
    }
}
