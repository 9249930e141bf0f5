//! Embedded smoke runner
//!
//! Runs when the node is started without a port: two in-process federates
//! replicate an object, migrate ownership, and exchange an event, reporting
//! the outcome.

use anyhow::{bail, Result};
use muster_ownership::{OwnershipOperation, OwnershipState};
use muster_primitives::{ObjectId, ProcessType};
use muster_runtime::{Federate, Runtime, Shutdownable};
use muster_value::Doc;
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("smoke runner timed out waiting for {}", what)
}

/// Exercise replication, ownership migration and events in-process.
pub async fn run() -> Result<()> {
    tracing::info!("running embedded smoke runner");

    let runtime = Runtime::new(ProcessType::Daemon);
    let federation_id = ObjectId::create();

    let simulator = Federate::new(runtime.clone(), "Simulator");
    let observer = Federate::new(runtime.clone(), "Observer");
    simulator.startup(federation_id)?;
    observer.startup(federation_id)?;

    let unit = simulator.get_object_class("Unit");
    let mirror_class = observer.get_object_class("Unit");
    mirror_class.require(&["name"]);
    mirror_class.publish(&["name"]);

    let object = unit.create_auto()?;
    object.set("name", "alpha")?;
    wait_for("discovery", || !mirror_class.objects().is_empty()).await?;
    tracing::info!("object discovered on the observer federate");

    let mirror = mirror_class.objects().remove(0);
    wait_for("value", || mirror.get("name").as_str() == Some("alpha")).await?;

    mirror.modify_ownership_state("name", OwnershipOperation::OwnershipAcquisition)?;
    wait_for("ownership migration", || {
        mirror
            .ownership_state("name")
            .intersects(OwnershipState::OWNED)
    })
    .await?;
    tracing::info!("ownership migrated to the observer federate");

    let strikes = Arc::new(PlMutex::new(0));
    {
        let strikes = strikes.clone();
        observer.get_event_class("Strike").subscribe(move |_| {
            *strikes.lock() += 1;
        });
    }
    simulator
        .get_event_class("Strike")
        .dispatch(Doc::new().field("target", 1).build(), 0.0);
    wait_for("event delivery", || *strikes.lock() == 1).await?;
    tracing::info!("event delivered");

    simulator.shutdown().await;
    observer.shutdown().await;
    runtime.shutdown().await;

    tracing::info!("smoke runner passed");
    Ok(())
}
