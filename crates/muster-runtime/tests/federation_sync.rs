//! Integration tests for the federate synchronization pass: discovery,
//! value propagation, ownership migration, deletion, events and services.

use muster_ownership::{OwnershipNotification, OwnershipOperation, OwnershipState};
use muster_primitives::{ObjectId, ProcessType};
use muster_runtime::{Federate, Runtime, Shutdownable};
use muster_value::{Reason, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Poll until `condition` holds, panicking after two seconds.
async fn settle(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn two_federates(runtime: &Arc<Runtime>) -> (Arc<Federate>, Arc<Federate>) {
    let federation_id = ObjectId::create();
    let a = Federate::new(runtime.clone(), "A");
    let b = Federate::new(runtime.clone(), "B");
    a.startup(federation_id).unwrap();
    b.startup(federation_id).unwrap();
    (a, b)
}

#[tokio::test]
async fn object_discovered_on_other_federate() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_y = fy.get_object_class("Unit");
    unit_y.require(&["name"]);

    let discovered = Arc::new(Mutex::new(Vec::new()));
    {
        let discovered = discovered.clone();
        unit_y.observe(move |object| {
            if object.just_discovered() {
                discovered.lock().push(object.get("name"));
            }
        });
    }

    let unit_x = fx.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    settle("discovery on Y", || !discovered.lock().is_empty()).await;
    assert_eq!(discovered.lock()[0].as_str(), Some("alpha"));
    assert_eq!(unit_y.objects().len(), 1);
}

#[tokio::test]
async fn discovery_waits_for_required_properties() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_y = fy.get_object_class("Unit");
    unit_y.require(&["name", "team"]);

    let unit_x = fx.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(unit_y.objects().is_empty(), "discovered without team");

    object.set("team", 1).unwrap();
    settle("discovery after team", || unit_y.objects().len() == 1).await;
}

#[tokio::test]
async fn value_round_trip_carries_version() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("hp", 100).unwrap();

    settle("discovery", || unit_y.objects().len() == 1).await;
    let mirror = unit_y.objects().remove(0);
    settle("value arrives", || mirror.get("hp").as_i32() == Some(100)).await;

    let version_before = mirror.version("hp");
    object.set("hp", 75).unwrap();
    settle("update arrives", || mirror.get("hp").as_i32() == Some(75)).await;
    assert!(mirror.version("hp") > version_before);
}

#[tokio::test]
async fn ownership_migrates_through_release() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");
    unit_y.publish(&["name"]);

    let notifications = Arc::new(Mutex::new(Vec::new()));
    {
        let notifications = notifications.clone();
        fy.set_ownership_callback(move |_, property, notification| {
            notifications.lock().push((property.to_owned(), notification));
        });
    }

    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    settle("discovery", || unit_y.objects().len() == 1).await;
    let mirror = unit_y.objects().remove(0);
    settle("value arrives", || mirror.get("name").as_str() == Some("alpha")).await;

    // X holds ownership via the default callback; Y acquires, X releases
    mirror
        .modify_ownership_state("name", OwnershipOperation::OwnershipAcquisition)
        .unwrap();

    settle("Y acquires name", || {
        mirror
            .ownership_state("name")
            .intersects(OwnershipState::OWNED)
    })
    .await;
    assert!(notifications
        .lock()
        .iter()
        .any(|(p, n)| p == "name" && *n == OwnershipNotification::OwnershipAcquisitionNotification));

    // the new owner can write and the old owner cannot
    mirror.set("name", "bravo").unwrap();
    settle("X sees bravo", || object.get("name").as_str() == Some("bravo")).await;
    assert!(!object.can_set("name"));
}

#[tokio::test]
async fn delete_propagates_to_other_federates() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");

    let destroyed = Arc::new(Mutex::new(0usize));
    {
        let destroyed = destroyed.clone();
        unit_y.observe(move |object| {
            if object.just_destroyed() {
                *destroyed.lock() += 1;
            }
        });
    }

    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();
    settle("discovery", || unit_y.objects().len() == 1).await;

    object.delete().unwrap();
    settle("destroyed on Y", || *destroyed.lock() == 1).await;
    settle("gone from Y", || unit_y.objects().is_empty()).await;
}

#[tokio::test]
async fn federate_shutdown_withdraws_publications() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();
    let fx = Federate::new(runtime.clone(), "X");
    let fy = Federate::new(runtime.clone(), "Y");
    fx.startup(federation_id).unwrap();
    fy.startup(federation_id).unwrap();

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();
    settle("discovery", || unit_y.objects().len() == 1).await;

    // losing the destructor's last publisher deletes the object everywhere
    fx.shutdown().await;
    settle("object deleted after shutdown", || unit_y.objects().is_empty()).await;
}

#[tokio::test]
async fn events_deliver_in_dispatch_order() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fa, fb) = two_federates(&runtime);

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        fb.get_event_class("Attack").subscribe(move |params| {
            received.lock().push(params.get("n").as_i32().unwrap_or(-1));
        });
    }

    let attack = fa.get_event_class("Attack");
    for n in 0..8 {
        attack.dispatch(muster_value::Doc::new().field("n", n).build(), 0.0);
    }

    settle("all events", || received.lock().len() == 8).await;
    assert_eq!(*received.lock(), (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn event_fallback_callback_runs() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fa, fb) = two_federates(&runtime);

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        fb.set_event_callback(move |name, _| {
            received.lock().push(name.to_owned());
        });
    }

    fa.get_event_class("Ping").dispatch(Value::Null, 0.0);
    settle("fallback", || received.lock().as_slice() == ["Ping"]).await;
}

#[tokio::test]
async fn service_retries_next_provider_on_rejection() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();
    let s1 = Federate::new(runtime.clone(), "S1");
    let s2 = Federate::new(runtime.clone(), "S2");
    let client = Federate::new(runtime.clone(), "C");
    s1.startup(federation_id).unwrap();
    s2.startup(federation_id).unwrap();
    client.startup(federation_id).unwrap();

    s1.get_service_class("Ping").define(|_, _| {
        Box::pin(async { Err(Reason::new(500, "s1 declines")) })
    });
    s2.get_service_class("Ping").define(|_, _| {
        Box::pin(async { Ok(Value::from("pong")) })
    });

    let result = client
        .request_service("Ping", Value::Null, String::new())
        .await
        .unwrap();
    assert_eq!(result.as_str(), Some("pong"));
}

#[tokio::test]
async fn service_falls_back_to_catch_all_callback() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fa, fb) = two_federates(&runtime);

    fb.set_service_callback(|service, _, _| {
        let service = service.to_owned();
        Box::pin(async move { Ok(Value::from(format!("handled {}", service))) })
    });

    let result = fa
        .request_service("Anything", Value::Null, String::new())
        .await
        .unwrap();
    assert_eq!(result.as_str(), Some("handled Anything"));
}

#[tokio::test]
async fn unknown_service_rejects_with_status() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fa, _fb) = two_federates(&runtime);

    let error = fa
        .request_service("Nope", Value::Null, String::new())
        .await
        .unwrap_err();
    assert_eq!(error.status(), 500);
    assert!(error.message().contains("Nope"));
}

#[tokio::test]
async fn write_without_ownership_is_rejected() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_x = fx.get_object_class("Unit");
    let unit_y = fy.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("name", "alpha").unwrap();

    settle("discovery", || unit_y.objects().len() == 1).await;
    let mirror = unit_y.objects().remove(0);
    settle("value", || mirror.get("name").as_str() == Some("alpha")).await;

    assert!(!mirror.can_set("name"));
    assert!(mirror.set("name", "mallory").is_err());
}

#[tokio::test]
async fn cyclic_references_stall_discovery() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_y = fy.get_object_class("Unit");
    unit_y.require(&["buddy"]);

    // two objects that only reference each other never become well-defined
    let unit_x = fx.get_object_class("Unit");
    let first = unit_x.create_auto().unwrap();
    let second = unit_x.create_auto().unwrap();
    first.set("buddy", second.object_id()).unwrap();
    second.set("buddy", first.object_id()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        unit_y.objects().is_empty(),
        "cyclic references must stall discovery"
    );
}

#[tokio::test]
async fn self_reference_discovers() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, fy) = two_federates(&runtime);

    let unit_y = fy.get_object_class("Unit");
    unit_y.require(&["itself"]);

    let unit_x = fx.get_object_class("Unit");
    let object = unit_x.create_auto().unwrap();
    object.set("itself", object.object_id()).unwrap();

    settle("self reference discovers", || unit_y.objects().len() == 1).await;
}

#[tokio::test]
async fn double_shutdown_is_noop() {
    let runtime = Runtime::new(ProcessType::Daemon);
    let (fx, _fy) = two_federates(&runtime);
    fx.shutdown().await;
    fx.shutdown().await;
    assert!(fx.is_shutdown_started());
}
