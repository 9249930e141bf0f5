//! The scenario suite
//!
//! Each scenario builds its own process topology, drives the stack through
//! the public federate surface, and settles on the expected outcome.

use crate::error::E2eResult;
use crate::harness::{link, settle, Process};
use muster_ownership::{OwnershipNotification, OwnershipOperation, OwnershipState};
use muster_primitives::{FederationType, ObjectId, ProcessType};
use muster_runtime::Shutdownable;
use muster_value::{Doc, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Federate X creates `Unit` with `name`; federate Y requires it, observes
/// the discovery, acquires ownership through a release handshake, and then
/// writes the property itself.
pub async fn publish_then_acquire() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let fx = daemon.federate("X");
    let fy = daemon.federate("Y");
    fx.startup(federation_id).map_err(setup)?;
    fy.startup(federation_id).map_err(setup)?;

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");
    unit_y.require(&["name"]);
    unit_y.publish(&["name"]);

    let discovered = Arc::new(Mutex::new(false));
    {
        let discovered = discovered.clone();
        unit_y.observe(move |object| {
            if object.just_discovered() {
                *discovered.lock() = true;
            }
        });
    }

    let release_requests = Arc::new(Mutex::new(0usize));
    {
        let release_requests = release_requests.clone();
        fx.set_ownership_callback(move |object, property, notification| {
            if notification == OwnershipNotification::RequestOwnershipRelease {
                *release_requests.lock() += 1;
                let _ = object.modify_ownership_state(
                    property,
                    OwnershipOperation::OwnershipReleaseSuccess,
                );
            }
        });
    }

    let object = unit_x.create_auto().map_err(setup)?;
    object.set("name", "alpha").map_err(setup)?;

    settle("discovery with name", {
        let discovered = discovered.clone();
        move || *discovered.lock()
    })
    .await?;

    let mirror = unit_y.objects().remove(0);
    settle("value arrives", || mirror.get("name").as_str() == Some("alpha")).await?;

    mirror
        .modify_ownership_state("name", OwnershipOperation::OwnershipAcquisition)
        .map_err(setup)?;

    settle("ownership migrates", || {
        mirror
            .ownership_state("name")
            .intersects(OwnershipState::OWNED)
    })
    .await?;
    assert_eq!(*release_requests.lock(), 1);

    mirror.set("name", "bravo").map_err(setup)?;
    settle("new owner writes", || {
        object.get("name").as_str() == Some("bravo")
    })
    .await?;
    Ok(())
}

/// Two daemons exchange an object; the receiving side's echo is cut by the
/// routing auto-correction, leaving no propagation loop.
pub async fn routing_loop_avoidance() -> E2eResult<()> {
    let d1 = Process::new(ProcessType::Daemon);
    let d2 = Process::new(ProcessType::Daemon);
    let (_s1, s2) = link(&d1, &d2).await?;
    let federation_id = ObjectId::create();

    let f1 = d1.federate("Sim1");
    let f2 = d2.federate("Sim2");
    f1.startup(federation_id).map_err(setup)?;
    f2.startup(federation_id).map_err(setup)?;

    let object = f1.get_object_class("A").create_auto().map_err(setup)?;
    object.set("x", 1).map_err(setup)?;

    let unit2 = f2.get_object_class("A");
    settle("replication", || {
        unit2
            .objects()
            .first()
            .map(|o| o.get("x").as_i32() == Some(1))
            .unwrap_or(false)
    })
    .await?;

    // D2's session federate stops routing x back toward D1
    settle("echo cut", move || {
        s2.session_federate(federation_id)
            .and_then(|federate| federate.federate().get_object_class("A").objects().pop())
            .map(|mirror| !mirror.routing("x"))
            .unwrap_or(false)
    })
    .await?;
    Ok(())
}

/// With an exclusive owner installed on the daemon, a forced acquisition
/// claim arriving from a player session is denied and the daemon's
/// simulator keeps both the property and its value.
pub async fn exclusive_owner_denies_forced_acquisition() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let player = Process::new(ProcessType::Player);
    let (_sp, sd) = link(&player, &daemon).await?;
    let federation_id = ObjectId::create();

    let simulator = daemon.federate("Simulator");
    let backend = player.federate("Backend");
    simulator.startup(federation_id).map_err(setup)?;
    backend.startup(federation_id).map_err(setup)?;

    let object = simulator
        .get_object_class("Unit")
        .create_auto()
        .map_err(setup)?;
    object.set("facing", 90).map_err(setup)?;

    let unit_player = backend.get_object_class("Unit");
    settle("replication", || !unit_player.objects().is_empty()).await?;

    // lock the daemon's federation to its simulator federate
    let federation = daemon
        .runtime
        .find_federation(federation_id)
        .expect("federation exists");
    federation.set_exclusive_owner(Some(&simulator));

    // the player grabs the property locally and writes; the resulting
    // upstream claim reaching the daemon is denied by the lock
    let mirror = unit_player.objects().remove(0);
    let _ = mirror.modify_ownership_state("facing", OwnershipOperation::ForcedOwnershipAcquisition);
    mirror.set("facing", 180).map_err(setup)?;

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let holder = sd
        .session_federate(federation_id)
        .and_then(|federate| federate.federate().get_object(object.object_id()));
    if let Some(holder) = holder {
        assert!(
            !holder
                .ownership_state("facing")
                .intersects(OwnershipState::OWNED),
            "session federate must not own the locked property"
        );
    }
    assert!(object.can_set("facing"), "simulator keeps ownership");
    assert_eq!(object.get("facing").as_i32(), Some(90));
    Ok(())
}

/// F1 owns the destructor and shuts down; the loss of the last publisher
/// deletes the object on every other federate.
pub async fn delete_by_publisher_loss() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let f1 = daemon.federate("F1");
    let f2 = daemon.federate("F2");
    f1.startup(federation_id).map_err(setup)?;
    f2.startup(federation_id).map_err(setup)?;

    let destroyed = Arc::new(Mutex::new(false));
    let unit2 = f2.get_object_class("Unit");
    {
        let destroyed = destroyed.clone();
        unit2.observe(move |object| {
            if object.just_destroyed() {
                *destroyed.lock() = true;
            }
        });
    }

    let object = f1.get_object_class("Unit").create_auto().map_err(setup)?;
    object.set("name", "doomed").map_err(setup)?;
    settle("discovery", || !unit2.objects().is_empty()).await?;

    f1.shutdown().await;
    settle("just destroyed observed", {
        let destroyed = destroyed.clone();
        move || *destroyed.lock()
    })
    .await?;
    settle("object swept", || unit2.objects().is_empty()).await?;
    Ok(())
}

/// Events from A arrive at B in dispatch order even with an unrelated
/// federate C dispatching concurrently.
pub async fn event_ordering() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let fa = daemon.federate("A");
    let fb = daemon.federate("B");
    let fc = daemon.federate("C");
    fa.startup(federation_id).map_err(setup)?;
    fb.startup(federation_id).map_err(setup)?;
    fc.startup(federation_id).map_err(setup)?;

    let from_a = Arc::new(Mutex::new(Vec::new()));
    {
        let from_a = from_a.clone();
        fb.get_event_class("FromA").subscribe(move |params| {
            from_a.lock().push(params.get("n").as_i32().unwrap_or(-1));
        });
    }
    fb.get_event_class("Noise").subscribe(|_| {});

    for n in 0..16 {
        fa.get_event_class("FromA")
            .dispatch(Doc::new().field("n", n).build(), 0.0);
        fc.get_event_class("Noise").dispatch(Value::Null, 0.0);
    }

    settle("all ordered events", {
        let from_a = from_a.clone();
        move || from_a.lock().len() == 16
    })
    .await?;
    assert_eq!(*from_a.lock(), (0..16).collect::<Vec<_>>());
    Ok(())
}

/// S1's provider rejects with status 500; the federation retries on S2,
/// which fulfills.
pub async fn service_fallback() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let s1 = daemon.federate("S1");
    let s2 = daemon.federate("S2");
    let client = daemon.federate("Client");
    s1.startup(federation_id).map_err(setup)?;
    s2.startup(federation_id).map_err(setup)?;
    client.startup(federation_id).map_err(setup)?;

    s1.get_service_class("Ping")
        .define(|_, _| Box::pin(async { Err(muster_value::Reason::new(500, "s1 rejects")) }));
    s2.get_service_class("Ping")
        .define(|_, _| Box::pin(async { Ok(Value::from("pong")) }));

    let result = client
        .request_service("Ping", Value::Null, String::new())
        .await
        .expect("fallback fulfills");
    assert_eq!(result.as_str(), Some("pong"));
    Ok(())
}

/// A value written on one player reaches another player through the daemon,
/// relaying across both sessions.
pub async fn player_daemon_player_relay() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let p1 = Process::new(ProcessType::Player);
    let p2 = Process::new(ProcessType::Player);
    link(&p1, &daemon).await?;
    link(&p2, &daemon).await?;

    let federation_id = ObjectId::create();
    daemon
        .runtime
        .initiate_federation(federation_id, FederationType::Battle)
        .expect("daemon hosts the federation");

    let f1 = p1.federate("Player1");
    let f2 = p2.federate("Player2");
    f1.startup(federation_id).map_err(setup)?;
    f2.startup(federation_id).map_err(setup)?;

    let object = f1.get_object_class("Unit").create_auto().map_err(setup)?;
    object.set("name", "runner").map_err(setup)?;

    let unit2 = f2.get_object_class("Unit");
    settle("relay to the second player", || {
        unit2
            .objects()
            .first()
            .map(|o| o.get("name").as_str() == Some("runner"))
            .unwrap_or(false)
    })
    .await?;

    // events relay the same path
    let strikes = Arc::new(Mutex::new(0));
    {
        let strikes = strikes.clone();
        f2.get_event_class("Strike").subscribe(move |_| {
            *strikes.lock() += 1;
        });
    }
    f1.get_event_class("Strike").dispatch(Value::Null, 0.0);
    settle("event relays", {
        let strikes = strikes.clone();
        move || *strikes.lock() == 1
    })
    .await?;
    Ok(())
}

/// Objects whose required properties only reference each other never
/// discover; the stall is deliberate.
pub async fn cyclic_references_stall() -> E2eResult<()> {
    let daemon = Process::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let fx = daemon.federate("X");
    let fy = daemon.federate("Y");
    fx.startup(federation_id).map_err(setup)?;
    fy.startup(federation_id).map_err(setup)?;

    let unit_y = fy.get_object_class("Pair");
    unit_y.require(&["other"]);

    let unit_x = fx.get_object_class("Pair");
    let first = unit_x.create_auto().map_err(setup)?;
    let second = unit_x.create_auto().map_err(setup)?;
    first.set("other", second.object_id()).map_err(setup)?;
    second.set("other", first.object_id()).map_err(setup)?;

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(unit_y.objects().is_empty(), "cycle must stall discovery");
    Ok(())
}

fn setup(error: impl std::fmt::Display) -> crate::error::E2eError {
    crate::error::E2eError::Setup(error.to_string())
}
