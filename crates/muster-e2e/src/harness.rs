//! Multi-process test harness

use crate::error::{E2eError, E2eResult};
use muster_primitives::ProcessType;
use muster_runtime::{Federate, Runtime};
use muster_session::{mock, Endpoint, Session};
use std::sync::Arc;
use std::time::Duration;

/// How long a settle condition may take before the scenario fails
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(4);

/// One simulated process: a runtime with its endpoint.
pub struct Process {
    /// The process runtime
    pub runtime: Arc<Runtime>,
    /// Its transport endpoint
    pub endpoint: Arc<Endpoint>,
}

impl Process {
    /// Create a process of the given type
    pub fn new(process_type: ProcessType) -> Process {
        let runtime = Runtime::new(process_type);
        let endpoint = Endpoint::new(runtime.clone());
        Process { runtime, endpoint }
    }

    /// Create an application federate on this process
    pub fn federate(&self, name: &str) -> Arc<Federate> {
        Federate::new(self.runtime.clone(), name)
    }
}

/// Connect two processes with an in-memory session pair and wait for the
/// handshake to complete.
pub async fn link(a: &Process, b: &Process) -> E2eResult<(Arc<Session>, Arc<Session>)> {
    let (session_a, session_b) = mock::connect(&a.endpoint, &b.endpoint);
    let expect_a = b.runtime.process_type();
    let expect_b = a.runtime.process_type();
    let sa = session_a.clone();
    let sb = session_b.clone();
    settle("handshake", move || {
        sa.process_type() == expect_a && sb.process_type() == expect_b
    })
    .await?;
    Ok((session_a, session_b))
}

/// Poll until `condition` holds or [`SETTLE_TIMEOUT`] passes.
pub async fn settle(what: &str, condition: impl Fn() -> bool) -> E2eResult<()> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(E2eError::Timeout(what.to_owned()))
}
