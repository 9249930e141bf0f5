//! In-memory session pairs for tests
//!
//! A mock pair links two sessions (usually on different runtimes) through
//! channels, optionally delaying frames to simulate network latency.

use crate::endpoint::Endpoint;
use crate::session::{Session, SessionTransport};
use bytes::Bytes;
use muster_primitives::ProcessType;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct MockTransport {
    frames: mpsc::UnboundedSender<Bytes>,
}

impl SessionTransport for MockTransport {
    fn send(&self, frame: Bytes) {
        let _ = self.frames.send(frame);
    }

    fn close(&self) {}
}

fn link(from: &Arc<Session>, to: &Arc<Session>, delay: Duration) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    from.set_transport(Arc::new(MockTransport { frames: tx }));
    let receiver = Arc::downgrade(to);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(receiver) = receiver.upgrade() else {
                break;
            };
            receiver.handle_frame(frame);
        }
    });
}

/// Link two endpoints with an in-memory session pair.
///
/// Daemon sides open the handshake exchange, mirroring the WebSocket
/// acceptor. Returns `(session on a, session on b)`.
pub fn connect(endpoint_a: &Arc<Endpoint>, endpoint_b: &Arc<Endpoint>) -> (Arc<Session>, Arc<Session>) {
    connect_with_latency(endpoint_a, endpoint_b, Duration::ZERO)
}

/// Like [`connect`], delaying every frame by `delay` in each direction.
pub fn connect_with_latency(
    endpoint_a: &Arc<Endpoint>,
    endpoint_b: &Arc<Endpoint>,
    delay: Duration,
) -> (Arc<Session>, Arc<Session>) {
    let session_a = Session::new(
        endpoint_a.runtime().clone(),
        Arc::downgrade(endpoint_a),
        endpoint_a.metrics().clone(),
    );
    let session_b = Session::new(
        endpoint_b.runtime().clone(),
        Arc::downgrade(endpoint_b),
        endpoint_b.metrics().clone(),
    );
    endpoint_a.add_session(session_a.clone());
    endpoint_b.add_session(session_b.clone());

    link(&session_a, &session_b, delay);
    link(&session_b, &session_a, delay);

    if endpoint_a.runtime().process_type() == ProcessType::Daemon {
        session_a.send_handshake();
    }
    if endpoint_b.runtime().process_type() == ProcessType::Daemon {
        session_b.send_handshake();
    }

    (session_a, session_b)
}
