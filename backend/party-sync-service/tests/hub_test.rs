mod common;

use common::{eventually, fake_socket, memory_connector, FakeClient};
use party_sync_service::hub::{ChannelId, CloseFrame, HubConfig, PartyHub};
use redis_utils::MemoryBackbone;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn hub_config() -> HubConfig {
    HubConfig {
        poll_timeout: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(1),
        ..HubConfig::default()
    }
}

fn hub_on(bus: &MemoryBackbone, config: HubConfig) -> Arc<PartyHub> {
    Arc::new(PartyHub::new(config, memory_connector(bus)))
}

fn run(id: &str) -> ChannelId {
    ChannelId::run(id).unwrap()
}

/// Admit synchronously, then serve on a local task.
async fn join(hub: &Arc<PartyHub>, channel: &ChannelId) -> FakeClient {
    let (socket, client) = fake_socket();
    let admission = hub.admit(channel).await.unwrap();
    let hub = hub.clone();
    actix_rt::spawn(async move { hub.serve(admission, socket).await });
    client
}

fn tick(n: u64) -> String {
    json!({"eventType": "system.tick", "payload": {"n": n}}).to_string()
}

fn vote(action_id: &str) -> String {
    json!({
        "eventType": "vote.cast",
        "actionId": action_id,
        "payload": {"optionId": "o1", "tally": 1}
    })
    .to_string()
}

#[actix_rt::test]
async fn test_connection_over_cap_is_closed_going_away() {
    let hub = hub_on(
        &MemoryBackbone::new(),
        HubConfig {
            max_connections_per_channel: 2,
            ..hub_config()
        },
    );
    let channel = run("r1");
    let _a = join(&hub, &channel).await;
    let _b = join(&hub, &channel).await;

    let (socket, mut rejected) = fake_socket();
    hub.handle_connection(&channel, socket).await;

    let close = rejected.expect_close().await;
    assert_eq!(close.code, CloseFrame::GOING_AWAY);
    assert_eq!(close.reason, "Channel at capacity");
    assert_eq!(hub.connection_count(&channel).await, 2);
}

#[actix_rt::test]
async fn test_channel_limit_closes_new_channel() {
    let hub = hub_on(
        &MemoryBackbone::new(),
        HubConfig {
            max_channels: 1,
            ..hub_config()
        },
    );
    let _a = join(&hub, &run("r1")).await;

    let (socket, mut rejected) = fake_socket();
    hub.handle_connection(&run("r2"), socket).await;
    let close = rejected.expect_close().await;
    assert_eq!(close.code, CloseFrame::GOING_AWAY);
    assert_eq!(close.reason, "Channel limit reached");
    assert_eq!(hub.channel_count().await, 1);
}

#[actix_rt::test]
async fn test_invalid_payload_closes_unsupported_data() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let channel = run("r1");
    let mut client = join(&hub, &channel).await;

    client.send_text(json!({"eventType": "vote.cast", "payload": {"optionId": "o1"}}).to_string());
    let close = client.expect_close().await;
    assert_eq!(close.code, CloseFrame::UNSUPPORTED_DATA);
    assert!(close.reason.contains("payload.tally"));

    // nothing was recorded, so the session goes away with the socket
    eventually(|| {
        let hub = hub.clone();
        async move { hub.channel_count().await == 0 }
    })
    .await;
    assert!(hub.session(&channel).await.is_none());
}

#[actix_rt::test]
async fn test_binary_frame_closes_unsupported_data() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let mut client = join(&hub, &run("r1")).await;

    client.send_binary();
    let close = client.expect_close().await;
    assert_eq!(close.code, CloseFrame::UNSUPPORTED_DATA);
}

#[actix_rt::test]
async fn test_socket_error_closes_with_internal_error() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let channel = run("r1");
    let mut client = join(&hub, &channel).await;

    client.fail("frame overflow");
    let close = client.expect_close().await;
    assert_eq!(close.code, CloseFrame::INTERNAL_ERROR);
    assert_eq!(close.reason, "Internal error");

    eventually(|| {
        let hub = hub.clone();
        async move { hub.channel_count().await == 0 }
    })
    .await;
}

#[actix_rt::test]
async fn test_duplicate_vote_reaches_peers_once() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let channel = run("r1");
    let mut alice = join(&hub, &channel).await;
    let mut bob = join(&hub, &channel).await;

    alice.send_text(vote("v-1"));
    alice.send_text(vote("v-1"));
    alice.send_text(tick(1));

    let first = bob.next_json().await;
    assert_eq!(first["actionId"], "v-1");
    let second = bob.next_json().await;
    assert_eq!(second["eventType"], "system.tick");

    // the sender is included in its own fan-out
    assert_eq!(alice.next_json().await["actionId"], "v-1");
    assert_eq!(alice.next_json().await["eventType"], "system.tick");

    let session = hub.session(&channel).await.unwrap();
    assert_eq!(session.history_len().await, 2);
    assert!(session.has_seen_action("v-1").await);
}

#[actix_rt::test]
async fn test_history_is_replayed_after_everyone_left() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let channel = run("r1");

    let mut first = join(&hub, &channel).await;
    for n in 0..3 {
        first.send_text(tick(n));
    }
    for n in 0..3 {
        assert_eq!(first.next_json().await["payload"]["n"], n);
    }
    first.hang_up();
    eventually(|| {
        let hub = hub.clone();
        let channel = channel.clone();
        async move { hub.connection_count(&channel).await == 0 }
    })
    .await;
    assert_eq!(hub.channel_count().await, 1);

    let mut late = join(&hub, &channel).await;
    for n in 0..3 {
        assert_eq!(late.next_json().await["payload"]["n"], n);
    }
    assert!(late.is_idle());
}

#[actix_rt::test]
async fn test_replicas_share_events_without_echo() {
    let bus = MemoryBackbone::new();
    let east = hub_on(&bus, hub_config());
    let west = hub_on(&bus, hub_config());
    assert_ne!(east.node_id(), west.node_id());

    let channel = ChannelId::party("p1").unwrap();
    let mut on_east = join(&east, &channel).await;
    let mut on_west = join(&west, &channel).await;

    on_east.send_text(tick(1));
    on_east.send_text(tick(2));
    assert_eq!(on_west.next_json().await["payload"]["n"], 1);
    assert_eq!(on_west.next_json().await["payload"]["n"], 2);

    // a later remote event proves east's listener already skipped its own echoes
    on_west.send_text(tick(3));
    for n in 1..=3 {
        assert_eq!(on_east.next_json().await["payload"]["n"], n);
    }
    assert!(on_east.is_idle());

    let east_session = east.session(&channel).await.unwrap();
    assert_eq!(east_session.history_len().await, 3);
}

#[actix_rt::test]
async fn test_http_style_publish_reaches_sockets_and_backbone() {
    let bus = MemoryBackbone::new();
    let producer = hub_on(&bus, hub_config());
    let consumer = hub_on(&bus, hub_config());
    let channel = run("c1");
    let mut remote = join(&consumer, &channel).await;

    let message = event_schema::parse_frame(&tick(9)).unwrap();
    let delivered = producer.publish(&channel, message, true).await.unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(remote.next_json().await["payload"]["n"], 9);
}

#[actix_rt::test]
async fn test_shutdown_closes_served_sockets() {
    let hub = hub_on(&MemoryBackbone::new(), hub_config());
    let mut client = join(&hub, &run("r1")).await;

    hub.shutdown().await;
    let close = client.expect_close().await;
    assert_eq!(close.code, CloseFrame::NORMAL);
    assert_eq!(hub.channel_count().await, 0);
}
