//! Relay pipeline tests over real UDP sockets.
//!
//! Datagrams → UdpRelay → SessionRegistry → SessionBatcher → Uploader.
//! Most tests capture uploads with `MockUploader`; the end-to-end tests post
//! to a real collector bound on an ephemeral port.

use engine_core::WatchFanout;
use integration_tests::{
    fixtures,
    mocks::{MockUploader, ScriptedStarter, UploadMode},
    setup::{eventually, RelayHarness, TestContext},
};
use relay::{BatchConfig, HttpUploader, StaticSessionStarter, Upstream};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn batch_config(max_count: usize, timeout_ms: u64) -> BatchConfig {
    BatchConfig {
        max_count,
        timeout: Duration::from_millis(timeout_ms),
        retry_backoff: Duration::from_millis(20),
    }
}

async fn mock_relay(batch: BatchConfig, uploader: &MockUploader) -> RelayHarness {
    let endpoint = Url::parse("http://collector.invalid/").unwrap();
    RelayHarness::start(
        batch,
        Arc::new(Upstream::new(Some(endpoint.clone()))),
        Arc::new(StaticSessionStarter::new(endpoint)),
        Arc::new(uploader.clone()),
        None,
    )
    .await
}

#[tokio::test]
async fn test_count_trigger_over_udp() {
    let uploader = MockUploader::new();
    let relay = mock_relay(batch_config(3, 60_000), &uploader).await;

    for (seq, attr) in fixtures::attributes(3).iter().enumerate() {
        relay.send(&fixtures::packet(seq as u64, attr)).await;
    }

    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].session_id, relay.sender_session());
    assert_eq!(batches[0].len(), 3);
    assert_eq!(batches[0].payload[0].key(), Some("k0"));
    assert_eq!(batches[0].payload[2].key(), Some("k2"));

    relay.stop().await;
}

#[tokio::test]
async fn test_timeout_trigger_over_udp() {
    let uploader = MockUploader::new();
    let relay = mock_relay(batch_config(100, 200), &uploader).await;

    for (seq, attr) in fixtures::attributes(2).iter().enumerate() {
        relay.send(&fixtures::packet(seq as u64, attr)).await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(uploader.batches().is_empty());

    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);

    relay.stop().await;
}

#[tokio::test]
async fn test_malformed_datagrams_are_skipped() {
    let uploader = MockUploader::new();
    let relay = mock_relay(batch_config(1, 60_000), &uploader).await;

    relay.send("not a packet").await;
    relay.send("p1 [1, 2, 3]").await;
    relay.send("p2 {broken").await;
    relay
        .send(&fixtures::packet(3, &fixtures::attribute("ctx", "d", "ok", json!(true))))
        .await;

    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(uploader.batches().len(), 1);
    assert_eq!(batches[0].payload[0].key(), Some("ok"));

    relay.stop().await;
}

#[tokio::test]
async fn test_declared_session_wins() {
    let uploader = MockUploader::new();
    let relay = mock_relay(batch_config(2, 60_000), &uploader).await;

    relay
        .send(&fixtures::packet_in_session(1, "explicit", "a", json!(1)))
        .await;
    relay
        .send(&fixtures::packet_in_session(2, "explicit", "b", json!(2)))
        .await;

    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].session_id, "explicit");
    assert!(batches[0].payload.iter().all(|a| a.session_id().is_none()));

    relay.stop().await;
}

#[tokio::test]
async fn test_upstream_unknown_holds_then_delivers() {
    let uploader = MockUploader::new();
    uploader.set_mode(UploadMode::UpstreamUnknown);
    let relay = mock_relay(batch_config(2, 60_000), &uploader).await;

    for (seq, attr) in fixtures::attributes(2).iter().enumerate() {
        relay.send(&fixtures::packet(seq as u64, attr)).await;
    }

    assert!(eventually(Duration::from_secs(2), || async { uploader.attempts() >= 3 }).await);
    assert!(uploader.batches().is_empty());

    uploader.set_mode(UploadMode::Accept);
    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(uploader.batches().len(), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_transport_failure_drops_batch() {
    let uploader = MockUploader::new();
    uploader.set_mode(UploadMode::Fail);
    let relay = mock_relay(batch_config(1, 60_000), &uploader).await;

    relay
        .send(&fixtures::packet(1, &fixtures::attribute("ctx", "d", "lost", json!(1))))
        .await;
    assert!(eventually(Duration::from_secs(2), || async { uploader.attempts() == 1 }).await);

    uploader.set_mode(UploadMode::Accept);
    relay
        .send(&fixtures::packet(2, &fixtures::attribute("ctx", "d", "kept", json!(2))))
        .await;

    let batches = uploader.wait_for_batches(1, Duration::from_secs(2)).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].payload[0].key(), Some("kept"));
    assert_eq!(uploader.attempts(), 2);

    relay.stop().await;
}

#[tokio::test]
async fn test_flush_all_delivers_partial_batches() {
    let uploader = MockUploader::new();
    let relay = mock_relay(batch_config(100, 60_000), &uploader).await;
    let session = relay.sender_session();

    for (seq, attr) in fixtures::attributes(4).iter().enumerate() {
        relay.send(&fixtures::packet(seq as u64, attr)).await;
    }
    let batcher = relay.batcher.clone();
    assert!(
        eventually(Duration::from_secs(2), || async {
            batcher.stats(&session).map(|s| s.pending) == Some(4)
        })
        .await
    );

    tokio::time::timeout(Duration::from_secs(2), relay.batcher.flush_all())
        .await
        .expect("flush_all timed out");

    let batches = uploader.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 4);

    relay.stop().await;
}

#[tokio::test]
async fn test_enqueue_publishes_to_local_fanout() {
    let uploader = MockUploader::new();
    let fanout = WatchFanout::default();
    fanout.subscribe("local");

    let endpoint = Url::parse("http://collector.invalid/").unwrap();
    let relay = RelayHarness::start(
        batch_config(100, 60_000),
        Arc::new(Upstream::new(Some(endpoint.clone()))),
        Arc::new(StaticSessionStarter::new(endpoint)),
        Arc::new(uploader.clone()),
        Some(fanout.clone()),
    )
    .await;

    relay
        .send(&fixtures::packet(1, &fixtures::attribute("ctx", "d", "live", json!(1))))
        .await;

    let items = fanout.poll("local", Duration::from_secs(2)).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].session_id(), Some(relay.sender_session().as_str()));
    assert!(uploader.batches().is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_end_to_end_relay_to_collector() {
    let collector = TestContext::new();
    let addr = collector.serve().await;
    collector.fanout().subscribe("e2e");

    let endpoint = Url::parse(&format!("http://{}/api/v1/attrstream/", addr)).unwrap();
    let upstream = Arc::new(Upstream::new(None));
    let uploader = HttpUploader::new(upstream.clone(), Duration::from_secs(2)).unwrap();
    let relay = RelayHarness::start(
        batch_config(2, 60_000),
        upstream,
        Arc::new(StaticSessionStarter::new(endpoint)),
        Arc::new(uploader),
        None,
    )
    .await;
    let session = relay.sender_session();

    relay
        .send(&fixtures::packet(1, &fixtures::attribute("ctx", "dev-1", "battery", json!(80))))
        .await;
    relay
        .send(&fixtures::packet(2, &fixtures::attribute("ctx", "dev-1", "battery", json!(75))))
        .await;

    let sessions = collector.state.sessions.clone();
    assert!(
        eventually(Duration::from_secs(3), || async {
            sessions.get(&session).await.is_some()
        })
        .await
    );

    let stored = collector.state.sessions.get(&session).await.unwrap();
    assert_eq!(stored.lookup("ctx", "dev-1", "battery"), Some(&json!(75)));
    assert_eq!(stored.upload_count, 1);

    let items = collector.fanout().poll("e2e", Duration::from_secs(1)).await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|a| a.session_id() == Some(session.as_str())));

    let response: Value = reqwest::get(format!(
        "http://{}/api/v1/attrstream/sessions/{}",
        addr, session
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(response["attributes"]["ctx"]["dev-1"]["battery"], 75);

    relay.stop().await;
}

#[tokio::test]
async fn test_pending_handshake_holds_first_batch() {
    let collector = TestContext::new();
    let addr = collector.serve().await;

    let endpoint = Url::parse(&format!("http://{}/", addr)).unwrap();
    let starter = ScriptedStarter::succeeding(endpoint, Duration::from_millis(300));
    let upstream = Arc::new(Upstream::new(None));
    let uploader = HttpUploader::new(upstream.clone(), Duration::from_secs(2)).unwrap();
    let relay = RelayHarness::start(
        batch_config(1, 60_000),
        upstream,
        Arc::new(starter.clone()),
        Arc::new(uploader),
        None,
    )
    .await;
    let session = relay.sender_session();

    relay
        .send(&fixtures::packet(1, &fixtures::attribute("ctx", "d", "early", json!(1))))
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(collector.state.sessions.get(&session).await.is_none());
    assert!(relay.upstream.is_pending(&session));

    let sessions = collector.state.sessions.clone();
    assert!(
        eventually(Duration::from_secs(3), || async {
            sessions.get(&session).await.is_some()
        })
        .await
    );
    assert_eq!(starter.calls(), vec![(session.clone(), None)]);

    relay.stop().await;
}

#[tokio::test]
async fn test_failed_handshake_is_retried_until_delivered() {
    let collector = TestContext::new();
    let addr = collector.serve().await;

    let endpoint = Url::parse(&format!("http://{}/", addr)).unwrap();
    let starter = ScriptedStarter::failing_first(1, endpoint, Duration::ZERO);
    let upstream = Arc::new(Upstream::new(None));
    let uploader = HttpUploader::new(upstream.clone(), Duration::from_secs(2)).unwrap();
    let relay = RelayHarness::start(
        batch_config(1, 60_000),
        upstream,
        Arc::new(starter.clone()),
        Arc::new(uploader),
        None,
    )
    .await;
    let session = relay.sender_session();

    for (seq, attr) in fixtures::attributes(5).iter().enumerate() {
        relay.send(&fixtures::packet(seq as u64, attr)).await;
    }

    let sessions = collector.state.sessions.clone();
    assert!(
        eventually(Duration::from_secs(3), || async {
            sessions.get(&session).await.map(|s| s.upload_count) == Some(5)
        })
        .await
    );

    assert_eq!(starter.calls().len(), 2);
    assert!(starter.calls().iter().all(|(id, _)| *id == session));
    assert!(relay.upstream.endpoint().is_some());

    let stats = relay.batcher.stats(&session).unwrap();
    assert_eq!(stats.staged, 0);
    assert_eq!(stats.pending, 0);

    relay.stop().await;
}
