mod common;

use common::{eventually, memory_connector, test_config, test_state, TestServer};
use event_schema::Payload;
use party_sync_service::config::Config;
use party_sync_service::hub::{ChannelId, HubConfig, PartyHub};
use party_sync_service::notifier::{BackboneNotifier, HttpNotifier, Notifier, NotifyError};
use redis_utils::MemoryBackbone;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

fn hub_on(bus: &MemoryBackbone) -> Arc<PartyHub> {
    let config = HubConfig {
        poll_timeout: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(1),
        ..HubConfig::default()
    };
    Arc::new(PartyHub::new(config, memory_connector(bus)))
}

#[actix_rt::test]
async fn test_in_process_notifier_maps_and_delivers() {
    let hub = hub_on(&MemoryBackbone::new());
    let channel = ChannelId::run("c1").unwrap();
    let _listener = hub.admit(&channel).await.unwrap();

    let notifier: &dyn Notifier = &*hub;
    let delivered = notifier
        .broadcast(
            "c1",
            "campaign.scene.started",
            payload(json!({"sceneId": "s1", "phase": "start", "sceneType": "Combat"})),
            Some("t-9".into()),
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let history = hub.session(&channel).await.unwrap().history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, "combat.update");
    assert_eq!(history[0].trace_id.as_deref(), Some("t-9"));
}

#[actix_rt::test]
async fn test_in_process_notifier_rejects_invalid_events() {
    let hub = hub_on(&MemoryBackbone::new());

    let err = hub
        .broadcast("party:p1", "party.joined", Payload::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Invalid(_)));

    let err = hub
        .broadcast("lobby:1", "system.tick", Payload::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Channel(_)));
    assert_eq!(hub.channel_count().await, 0);
}

#[actix_rt::test]
async fn test_backbone_notifier_reaches_every_replica() {
    let bus = MemoryBackbone::new();
    let hub = hub_on(&bus);
    let channel = ChannelId::party("p1").unwrap();
    let _member = hub.admit(&channel).await.unwrap();

    let notifier = BackboneNotifier::new(memory_connector(&bus));
    assert_ne!(notifier.node_id(), hub.node_id());
    let delivered = notifier
        .broadcast("party:p1", "party.joined", payload(json!({"partyId": 7})), None)
        .await
        .unwrap();
    assert_eq!(delivered, 0);

    let session = hub.session(&channel).await.unwrap();
    eventually(|| {
        let session = session.clone();
        async move { session.history_len().await == 1 }
    })
    .await;
}

#[actix_rt::test]
async fn test_http_notifier_posts_to_remote_hub() {
    let server = TestServer::start(test_state(test_config())).await;
    let notifier = HttpNotifier::new(server.http_url(), Duration::from_secs(5)).unwrap();

    let delivered = notifier
        .broadcast("party:p1", "party.joined", payload(json!({"partyId": "p1"})), Some("t-1".into()))
        .await
        .unwrap();
    assert_eq!(delivered, 0);

    let session = server
        .state
        .hub
        .session(&ChannelId::party("p1").unwrap())
        .await
        .unwrap();
    let history = session.history().await;
    assert_eq!(history[0].trace_id.as_deref(), Some("t-1"));
    assert_eq!(history[0].channel.as_deref(), Some("party:p1"));

    server.stop().await;
}

#[actix_rt::test]
async fn test_http_notifier_surfaces_rejections() {
    let server = TestServer::start(test_state(Config {
        max_campaigns: 1,
        ..test_config()
    }))
    .await;
    let notifier = HttpNotifier::new(server.http_url(), Duration::from_secs(5)).unwrap();
    let scene = || payload(json!({"sceneId": "s1", "phase": "intro"}));

    notifier
        .broadcast("c1", "campaign.phase.changed", scene(), None)
        .await
        .unwrap();
    let err = notifier
        .broadcast("c2", "campaign.phase.changed", scene(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Rejected { status: 503, .. }));

    server.stop().await;
}
