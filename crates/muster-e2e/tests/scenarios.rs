//! Runs the end-to-end scenario suite.

use muster_e2e::scenarios;

#[tokio::test(flavor = "multi_thread")]
async fn publish_then_acquire() {
    scenarios::publish_then_acquire().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_loop_avoidance() {
    scenarios::routing_loop_avoidance().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusive_owner_denies_forced_acquisition() {
    scenarios::exclusive_owner_denies_forced_acquisition()
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_by_publisher_loss() {
    scenarios::delete_by_publisher_loss().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn event_ordering() {
    scenarios::event_ordering().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn service_fallback() {
    scenarios::service_fallback().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn player_daemon_player_relay() {
    scenarios::player_daemon_player_relay().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_references_stall() {
    scenarios::cyclic_references_stall().await.unwrap();
}
