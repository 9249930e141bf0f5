//! Cross-process integration tests: two runtimes joined by in-memory
//! session pairs (plus one real WebSocket loopback), exercising handshake,
//! replication, routing auto-correction, events, services and teardown.

use muster_ownership::OwnershipState;
use muster_primitives::{ObjectId, ProcessType};
use muster_runtime::{Federate, Runtime, Shutdownable};
use muster_session::{mock, wire::MessageKind, wire::PacketKind, ws, Endpoint, Session};
use muster_value::{encode_value, Arr, Doc, Value};
use std::sync::Arc;
use std::time::Duration;

async fn settle(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

struct World {
    runtime_a: Arc<Runtime>,
    runtime_b: Arc<Runtime>,
    #[allow(dead_code)]
    endpoint_a: Arc<Endpoint>,
    #[allow(dead_code)]
    endpoint_b: Arc<Endpoint>,
    session_a: Arc<Session>,
    session_b: Arc<Session>,
}

/// Two connected daemon runtimes with the handshake completed.
async fn daemon_pair() -> World {
    daemon_pair_with_latency(Duration::ZERO).await
}

async fn daemon_pair_with_latency(delay: Duration) -> World {
    let runtime_a = Runtime::new(ProcessType::Daemon);
    let runtime_b = Runtime::new(ProcessType::Daemon);
    let endpoint_a = Endpoint::new(runtime_a.clone());
    let endpoint_b = Endpoint::new(runtime_b.clone());
    let (session_a, session_b) = mock::connect_with_latency(&endpoint_a, &endpoint_b, delay);

    let a = session_a.clone();
    let b = session_b.clone();
    settle("handshake", move || {
        a.process_type() == ProcessType::Daemon && b.process_type() == ProcessType::Daemon
    })
    .await;

    World {
        runtime_a,
        runtime_b,
        endpoint_a,
        endpoint_b,
        session_a,
        session_b,
    }
}

#[tokio::test]
async fn handshake_exchanges_identity() {
    let world = daemon_pair().await;
    assert_eq!(world.session_a.process_id(), world.runtime_b.process_id());
    assert_eq!(world.session_b.process_id(), world.runtime_a.process_id());
    assert_eq!(
        world.runtime_a.process_type_of(world.runtime_b.process_id()),
        ProcessType::Daemon
    );
}

#[tokio::test]
async fn object_replicates_across_processes() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    let unit_a = fa.get_object_class("Unit");
    let unit_b = fb.get_object_class("Unit");

    let object = unit_a.create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    settle("replication to B", || {
        unit_b
            .objects()
            .first()
            .map(|o| o.get("name").as_str() == Some("alpha"))
            .unwrap_or(false)
    })
    .await;

    // updates keep flowing
    object.set("name", "bravo").unwrap();
    settle("update to B", || {
        unit_b.objects()[0].get("name").as_str() == Some("bravo")
    })
    .await;
}

#[tokio::test]
async fn routing_echo_is_cut() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    let object = fa.get_object_class("Unit").create_auto().unwrap();
    object.set("x", 1).unwrap();

    let unit_b = fb.get_object_class("Unit");
    settle("replication", || {
        unit_b
            .objects()
            .first()
            .map(|o| o.get("x").as_i32() == Some(1))
            .unwrap_or(false)
    })
    .await;

    // B's session federate tried to echo the change back; A answered with
    // a routing disable that must stick on B's side
    let session_b = world.session_b.clone();
    settle("echo cut", move || {
        session_b
            .session_federate(federation_id)
            .and_then(|federate| {
                let object = federate.federate().get_object_class("Unit").objects().pop()?;
                Some(!object.routing("x"))
            })
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn events_cross_the_session() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let received = received.clone();
        fb.get_event_class("Strike").subscribe(move |params| {
            received.lock().push(params.get("target").as_i32().unwrap_or(-1));
        });
    }

    // wait for the session federates to exist on both sides
    let sa = world.session_a.clone();
    let sb = world.session_b.clone();
    settle("session federates", move || {
        sa.session_federate(federation_id).is_some() && sb.session_federate(federation_id).is_some()
    })
    .await;

    for n in 0..3 {
        fa.get_event_class("Strike")
            .dispatch(Doc::new().field("target", n).build(), 0.0);
    }

    settle("events on B", || received.lock().len() == 3).await;
    assert_eq!(*received.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn service_requests_cross_the_session() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    fa.get_service_class("Echo").define(|params, _| {
        Box::pin(async move { Ok(Doc::new().field("echo", params.get("say").clone()).build()) })
    });

    let sa = world.session_a.clone();
    let sb = world.session_b.clone();
    settle("session federates", move || {
        sa.session_federate(federation_id).is_some() && sb.session_federate(federation_id).is_some()
    })
    .await;

    let result = fb
        .request_service("Echo", Doc::new().field("say", "hello").build(), String::new())
        .await
        .unwrap();
    assert_eq!(result.get("echo").as_str(), Some("hello"));
}

#[tokio::test]
async fn deletes_cross_the_session() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    let object = fa.get_object_class("Unit").create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    let unit_b = fb.get_object_class("Unit");
    settle("replication", || !unit_b.objects().is_empty()).await;

    object.delete().unwrap();
    settle("delete on B", || unit_b.objects().is_empty()).await;
}

#[tokio::test]
async fn latency_estimate_converges() {
    let delay = Duration::from_millis(20);
    let world = daemon_pair_with_latency(delay).await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    fa.get_service_class("Ping").define(|_, _| {
        Box::pin(async { Ok(Value::Null) })
    });

    let sb = world.session_b.clone();
    settle("session federates", move || {
        sb.session_federate(federation_id).is_some()
    })
    .await;

    for _ in 0..20 {
        let _ = fb.request_service("Ping", Value::Null, String::new()).await;
    }

    let latency = world.session_b.latency();
    let expected = delay.as_secs_f64();
    assert!(
        (latency - expected).abs() / expected < 0.4,
        "latency {} should approximate the one-way delay {}",
        latency,
        expected
    );
}

fn routing_frame(federation_id: ObjectId, object_id: ObjectId, property: &str, kind: MessageKind) -> bytes::Bytes {
    let envelope = Doc::new()
        .field("i", 1000)
        .field("r", 0)
        .field("t", 0)
        .field(
            "p",
            Doc::new()
                .field("m", PacketKind::Messages as i32)
                .field(
                    "mm",
                    Arr::new()
                        .item(
                            Doc::new()
                                .field("m", kind as i32)
                                .field("x", federation_id.to_hex())
                                .field("i", object_id)
                                .field("p", property)
                                .build(),
                        )
                        .build(),
                )
                .build(),
        )
        .build();
    encode_value(&envelope)
}

#[tokio::test]
async fn exclusive_owner_blocks_forced_acquisition() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    // the object lives on B; its mirror crosses to A
    let object = fb.get_object_class("Unit").create_auto().unwrap();
    object.set("facing", 90).unwrap();

    let session_b = world.session_b.clone();
    settle("session federate on B", {
        let session_b = session_b.clone();
        move || {
            session_b
                .session_federate(federation_id)
                .and_then(|f| f.federate().get_object_class("Unit").objects().pop())
                .map(|o| o.get("facing").as_i32() == Some(90))
                .unwrap_or(false)
        }
    })
    .await;

    let federation = world.runtime_b.find_federation(federation_id).unwrap();
    federation.set_exclusive_owner(Some(&fb));

    let object_id = object.object_id();
    let mirror = session_b
        .session_federate(federation_id)
        .unwrap()
        .federate()
        .get_object(object_id)
        .unwrap();

    // the peer claims the property; the exclusive lock denies it
    session_b.handle_frame(routing_frame(
        federation_id,
        object_id,
        "facing",
        MessageKind::RoutingEnableUpstream,
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!mirror
        .ownership_state("facing")
        .intersects(OwnershipState::OWNED));

    // without the lock the same claim is honored
    federation.set_exclusive_owner(None);
    session_b.handle_frame(routing_frame(
        federation_id,
        object_id,
        "facing",
        MessageKind::RoutingEnableUpstream,
    ));
    settle("forced acquisition honored", || {
        mirror
            .ownership_state("facing")
            .intersects(OwnershipState::OWNED)
    })
    .await;
}

#[tokio::test]
async fn session_shutdown_tears_down_replicas() {
    let world = daemon_pair().await;
    let federation_id = ObjectId::create();

    let fa = Federate::new(world.runtime_a.clone(), "SimA");
    let fb = Federate::new(world.runtime_b.clone(), "SimB");
    fa.startup(federation_id).unwrap();
    fb.startup(federation_id).unwrap();

    let object = fa.get_object_class("Unit").create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    let unit_b = fb.get_object_class("Unit");
    settle("replication", || !unit_b.objects().is_empty()).await;

    // losing the session withdraws the remote publications on B
    world.session_b.shutdown().await;
    settle("replicas gone", || unit_b.objects().is_empty()).await;
}

#[tokio::test]
async fn websocket_loopback_handshake() {
    let runtime_daemon = Runtime::new(ProcessType::Daemon);
    let runtime_player = Runtime::new(ProcessType::Player);
    let endpoint_daemon = Endpoint::new(runtime_daemon.clone());
    let endpoint_player = Endpoint::new(runtime_player.clone());
    endpoint_player.set_connector(Arc::new(ws::WsConnector));

    let port = ws::listen(endpoint_daemon.clone(), 0).await.unwrap();
    let session = endpoint_player
        .make_session(&format!("ws://127.0.0.1:{}", port))
        .unwrap();

    settle("player sees daemon", {
        let session = session.clone();
        move || session.process_type() == ProcessType::Daemon
    })
    .await;
    settle("daemon sees player", || {
        endpoint_daemon
            .sessions()
            .iter()
            .any(|s| s.process_type() == ProcessType::Player)
    })
    .await;
}
