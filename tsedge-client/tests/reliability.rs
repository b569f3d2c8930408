//! Channel failure, reopen and replay, end to end.

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ---

use chrono::{DateTime, TimeZone, Utc};
use tsedge_client::{
    // ---
    ByteSampler,
    CloseOutcome,
    DownstreamHandler,
    EdgeConnection,
    UpstreamHandler,
    UpstreamHandlerPtr,
};
use tsedge_domain::{
    // ---
    BaseTimeFact,
    ChannelId,
    DataPoint,
    DataPointGroup,
    DownstreamChunk,
    DownstreamMetadata,
    FlushPolicy,
    BOOTSTRAP_ORIGIN,
};
use tsedge_link_sim::{LinkSimConfig, RecordingMeasurements, SimLink, StaticToken};

// ---

use common::{config, gated_harness, harness, temp, wait_for, EventLog, GatedConnector};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Opens {
    ids: parking_lot::Mutex<Vec<ChannelId>>,
}

impl UpstreamHandler for Opens {
    fn on_open(&self, sequence_id: ChannelId) {
        self.ids.lock().push(sequence_id);
    }
}

// ---

#[derive(Default)]
struct Received {
    chunks: AtomicUsize,
    metadata: AtomicUsize,
    last_base: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl DownstreamHandler for Received {
    fn on_chunk(&self, base_time: DateTime<Utc>, _: &[DataPointGroup]) {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        *self.last_base.lock() = Some(base_time);
    }

    fn on_metadata(&self, _: &DownstreamMetadata) {
        self.metadata.fetch_add(1, Ordering::SeqCst);
    }
}

// ---

#[derive(Default)]
struct CountingSampler(AtomicU64);

impl ByteSampler for CountingSampler {
    fn add_bytes(&self, n: u64) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }
}

// ---

fn base_time_fact(name: &str, priority: u8, secs: i64) -> DownstreamMetadata {
    DownstreamMetadata::BaseTime(BaseTimeFact {
        session_id: "m1".into(),
        name: name.into(),
        priority,
        elapsed_time: 0,
        base_time: Utc.timestamp_opt(secs, 0).unwrap(),
    })
}

fn chunk(source: &str, elapsed: i64) -> DownstreamChunk {
    DownstreamChunk {
        sequence_number: 1,
        source_node_id: source.into(),
        groups: vec![DataPointGroup::single(
            temp(),
            DataPoint::new(elapsed, vec![1u8, 2, 3, 4]),
        )],
    }
}

// ---------------------------------------------------------------------------
// Upstream reopen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_upstream_is_reopened_and_rebound() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let opens = Arc::new(Opens::default());
    let up = h
        .conn
        .register_upstream(true, FlushPolicy::Immediately, Some(opens.clone() as UpstreamHandlerPtr));
    let sibling = h.conn.register_upstream(true, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();

    let old_id = up.sequence_id().unwrap();
    let sibling_id = sibling.sequence_id().unwrap();
    let old = h.link.upstream(old_id).unwrap();

    old.close_with_error("stream reset");
    wait_for("rebind", || up.sequence_id().is_some_and(|id| id != old_id)).await;

    let new_id = up.sequence_id().unwrap();
    let new = h.link.upstream(new_id).unwrap();
    assert!(!new.is_closed(), "registration must not point at a closed channel");
    assert_eq!(sibling.sequence_id(), Some(sibling_id), "sibling untouched");
    assert_eq!(h.link.reopen_upstream_calls(), 1);
    assert_eq!(*opens.ids.lock(), vec![old_id, new_id]);

    up.send_data_point_now(temp(), vec![9u8]).unwrap();
    assert_eq!(new.written().len(), 1);
}

// ---

#[tokio::test]
async fn failed_writes_are_replayed_once_after_reopen() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let up = h.conn.register_upstream(true, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();

    let old_id = up.sequence_id().unwrap();
    let old = h.link.upstream(old_id).unwrap();

    old.fail_next_writes(1);
    assert!(up.send_data_point(temp(), 1, vec![1u8]).is_err());

    // The channel dies; the next write lands on the dead channel and is kept too.
    old.close_with_error("stream reset");
    assert!(up.send_data_point(temp(), 2, vec![2u8]).is_err());
    assert_eq!(h.conn.retry_buffer_len(), 2);

    wait_for("rebind", || up.sequence_id().is_some_and(|id| id != old_id)).await;
    assert_eq!(h.conn.retry_buffer_len(), 0);

    let new = h.link.upstream(up.sequence_id().unwrap()).unwrap();
    let replayed: Vec<i64> = new
        .written()
        .iter()
        .flat_map(|g| g.points.iter().map(|p| p.elapsed_time))
        .collect();
    assert_eq!(replayed, vec![1, 2], "no loss, no duplication");

    wait_for("old channel closed", || old.is_closed()).await;
    let (generated, received) = h.conn.counters();
    assert_eq!(generated, 1, "replay is one chunk");
    assert_eq!(generated, received);
}

// ---

#[tokio::test]
async fn reopen_failure_is_not_retried() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let up = h.conn.register_upstream(false, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();

    let old_id = up.sequence_id().unwrap();
    let old = h.link.upstream(old_id).unwrap();
    h.link.fail_next_reopens(1);

    old.close_with_error("stream reset");
    wait_for("reopen failure reported", || !h.events.errors().is_empty()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(h.link.reopen_upstream_calls(), 1);
    assert_eq!(up.sequence_id(), Some(old_id), "left on the failed channel");
    assert!(h.events.errors()[0].contains("reopen"));

    // The next close-with-error tries again.
    old.close_with_error("stream reset again");
    wait_for("rebind", || up.sequence_id().is_some_and(|id| id != old_id)).await;
    assert_eq!(h.link.reopen_upstream_calls(), 2);
}

// ---

#[tokio::test]
async fn reopen_without_registrations_closes_replacement() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let up = h.conn.register_upstream(false, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();

    let old = h.link.upstream(up.sequence_id().unwrap()).unwrap();
    h.conn.unregister_upstream(&up).unwrap();
    assert!(!old.is_closed(), "unregister does not close the channel");

    old.close_with_error("stream reset");
    wait_for("replacement opened", || h.link.upstreams().len() == 2).await;

    let replacement = h.link.upstreams()[1].clone();
    wait_for("replacement closed", || replacement.is_closed()).await;
    wait_for("failure reported", || !h.events.errors().is_empty()).await;
}

// ---

#[tokio::test]
async fn reopen_completing_during_close_is_discarded() {
    // ---
    let link = SimLink::new(LinkSimConfig::perfect());
    let connector = GatedConnector::new(link.clone());
    let gates = connector.gates.clone();
    let meas = RecordingMeasurements::new();
    let conn = Arc::new(EdgeConnection::new(
        config(),
        Arc::new(connector),
        StaticToken::new("token"),
        meas.clone(),
    ));
    let events = Arc::new(EventLog::default());
    conn.set_handler(events.clone());

    let up = conn.register_upstream(true, FlushPolicy::Immediately, None);
    conn.connect().await.unwrap();
    let old_id = up.sequence_id().unwrap();

    // Reopen starts and parks at the gate.
    link.upstream(old_id).unwrap().close_with_error("stream reset");
    gates.reopen_entered.notified().await;

    // Close starts and parks at the connection close.
    let closing = tokio::spawn({
        let conn = conn.clone();
        async move { conn.close().await }
    });
    gates.close_entered.notified().await;

    // Reopen completes while teardown is in progress.
    gates.reopen_release.notify_one();
    wait_for("replacement opened", || link.upstreams().len() == 2).await;
    let replacement = link.upstreams()[1].clone();
    wait_for("replacement closed", || replacement.is_closed()).await;

    gates.close_release.notify_one();
    assert!(matches!(closing.await.unwrap(), CloseOutcome::Closed(_)));

    assert!(up.sequence_id().is_none(), "never bound to the replacement");
    assert!(events.errors().is_empty(), "discard is not a failure");
    assert_eq!(meas.completes(), 1);
}

// ---

#[tokio::test]
async fn reopen_completing_after_close_is_discarded() {
    // ---
    let h = gated_harness(LinkSimConfig::perfect());
    let up = h.conn.register_upstream(false, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();
    let old_id = up.sequence_id().unwrap();

    h.link.upstream(old_id).unwrap().close_with_error("stream reset");
    h.gates.reopen_entered.notified().await;

    // Close finishes, and its guard resets, before the reopen returns.
    h.gates.close_release.notify_one();
    assert!(matches!(h.conn.close().await, CloseOutcome::Closed(_)));

    h.gates.reopen_release.notify_one();
    wait_for("replacement opened", || h.link.upstreams().len() == 2).await;
    let replacement = h.link.upstreams()[1].clone();
    wait_for("replacement closed", || replacement.is_closed()).await;

    assert!(up.sequence_id().is_none());
    assert!(h.events.errors().is_empty(), "discard is not a reopen failure");
}

// ---

#[tokio::test]
async fn errors_during_close_do_not_reopen() {
    // ---
    let link = SimLink::new(LinkSimConfig::perfect());
    let connector = GatedConnector::new(link.clone());
    let gates = connector.gates.clone();
    let conn = Arc::new(EdgeConnection::new(
        config(),
        Arc::new(connector),
        StaticToken::new("token"),
        RecordingMeasurements::new(),
    ));
    let up = conn.register_upstream(false, FlushPolicy::Immediately, None);
    conn.connect().await.unwrap();
    let channel = link.upstream(up.sequence_id().unwrap()).unwrap();

    let closing = tokio::spawn({
        let conn = conn.clone();
        async move { conn.close().await }
    });
    gates.close_entered.notified().await;

    channel.close_with_error("reset during close");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(link.reopen_upstream_calls(), 0);

    gates.close_release.notify_one();
    closing.await.unwrap();
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generated_never_trails_received() {
    // ---
    let h = harness(LinkSimConfig::manual_ack());
    let up = h.conn.register_upstream(true, FlushPolicy::Immediately, None);
    h.conn.connect().await.unwrap();
    let channel = h.link.upstream(up.sequence_id().unwrap()).unwrap();

    for i in 0..4u8 {
        up.send_data_point_now(temp(), vec![i]).unwrap();
        let (generated, received) = h.conn.counters();
        assert!(generated >= received);
    }
    assert_eq!(h.conn.counters(), (4, 0));

    channel.ack_pending(2);
    assert_eq!(h.conn.counters(), (4, 2));

    channel.ack_pending(usize::MAX);
    assert_eq!(h.conn.counters(), (4, 4));
}

// ---

#[tokio::test]
async fn samplers_see_payload_bytes() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let sent = Arc::new(CountingSampler::default());
    let received = Arc::new(CountingSampler::default());
    h.conn.set_upstream_sampler(sent.clone());
    h.conn.set_downstream_sampler(received.clone());

    let up = h.conn.register_upstream(false, FlushPolicy::Immediately, None);
    h.conn
        .register_downstream("node-2", temp(), Arc::new(Received::default()));
    h.conn.connect().await.unwrap();

    up.send_data_points_now(temp(), vec![vec![0u8; 10], vec![0u8; 6]])
        .unwrap();
    h.link.downstreams()[0].deliver_chunk(&chunk("node-2", 0));

    assert_eq!(sent.0.load(Ordering::SeqCst), 16);
    assert_eq!(received.0.load(Ordering::SeqCst), 4);
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_subscriptions_share_one_open() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let a = Arc::new(Received::default());
    let b = Arc::new(Received::default());
    let ha = h.conn.register_downstream("node-2", temp(), a.clone());
    let hb = h.conn.register_downstream("node-2", temp(), b.clone());
    h.conn.connect().await.unwrap();

    assert_eq!(h.link.downstream_requests().len(), 1);
    assert!(ha.channel_id().is_some());
    assert_eq!(ha.channel_id(), hb.channel_id());

    h.link.downstreams()[0].deliver_chunk(&chunk("node-2", 0));
    assert_eq!(a.chunks.load(Ordering::SeqCst), 1);
    assert_eq!(b.chunks.load(Ordering::SeqCst), 1);
}

// ---

#[tokio::test]
async fn late_subscription_joins_open_channel() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let a = Arc::new(Received::default());
    let b = Arc::new(Received::default());
    let ha = h.conn.register_downstream("node-2", temp(), a.clone());
    h.conn.connect().await.unwrap();

    let hb = h.conn.register_downstream("node-2", temp(), b.clone());
    assert_eq!(h.conn.open_downstream().await.unwrap(), 0);
    assert_eq!(h.link.downstream_requests().len(), 1, "no second subscription");
    assert!(hb.channel_id().is_some());
    assert_eq!(ha.channel_id(), hb.channel_id());

    h.link.downstreams()[0].deliver_chunk(&chunk("node-2", 0));
    assert_eq!(a.chunks.load(Ordering::SeqCst), 1);
    assert_eq!(b.chunks.load(Ordering::SeqCst), 1);

    // A new filter still gets its own channel.
    h.conn
        .register_downstream("node-3", temp(), Arc::new(Received::default()));
    assert_eq!(h.conn.open_downstream().await.unwrap(), 1);
    assert_eq!(h.link.downstream_requests().len(), 2);
}

// ---

#[tokio::test]
async fn failed_downstream_rebinds_every_member() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let a = Arc::new(Received::default());
    let ha = h.conn.register_downstream("node-2", temp(), a.clone());
    let hb = h
        .conn
        .register_downstream("node-2", temp(), Arc::new(Received::default()));
    h.conn.connect().await.unwrap();

    let old_id = ha.channel_id().unwrap();
    let old = h.link.downstream(old_id).unwrap();
    old.close_with_error("subscription dropped");

    wait_for("rebind", || ha.channel_id().is_some_and(|id| id != old_id)).await;
    assert_eq!(ha.channel_id(), hb.channel_id());
    assert_eq!(h.link.reopen_downstream_calls(), 1);
    wait_for("old channel closed", || old.is_closed()).await;

    let new = h.link.downstream(ha.channel_id().unwrap()).unwrap();
    new.deliver_chunk(&chunk("node-2", 0));
    assert_eq!(a.chunks.load(Ordering::SeqCst), 1);
}

// ---

#[tokio::test]
async fn base_time_arbitration_over_metadata() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let r = Arc::new(Received::default());
    let handle = h.conn.register_downstream("node-2", temp(), r.clone());
    h.conn.connect().await.unwrap();
    let down = h.link.downstreams()[0].clone();

    down.deliver_metadata(&base_time_fact("edge_rtc", 20, 1_000));
    down.deliver_metadata(&base_time_fact("gps", 10, 2_000));
    down.deliver_metadata(&base_time_fact("manual", 30, 3_000));

    let stored = handle.base_time().unwrap();
    assert_eq!(stored.priority, Some(10));
    assert_eq!(stored.base_time, Some(Utc.timestamp_opt(2_000, 0).unwrap()));
    assert_eq!(r.metadata.load(Ordering::SeqCst), 3);

    down.deliver_metadata(&base_time_fact(BOOTSTRAP_ORIGIN, 99, 4_000));
    assert_eq!(
        handle.base_time().unwrap().base_time,
        Some(Utc.timestamp_opt(4_000, 0).unwrap())
    );

    down.deliver_chunk(&chunk("node-2", 42));
    assert_eq!(*r.last_base.lock(), Some(Utc.timestamp_opt(4_000, 0).unwrap()));
}

// ---

#[tokio::test]
async fn first_chunk_bootstraps_base_time() {
    // ---
    let h = harness(LinkSimConfig::perfect());
    let r = Arc::new(Received::default());
    let handle = h.conn.register_downstream("node-2", temp(), r.clone());
    h.conn.connect().await.unwrap();

    let before = Utc::now();
    h.link.downstreams()[0].deliver_chunk(&chunk("node-2", 2_000_000_000));
    let after = Utc::now();

    let base = r.last_base.lock().unwrap();
    let two_secs = chrono::Duration::seconds(2);
    assert!(base >= before - two_secs && base <= after - two_secs);
    assert_eq!(handle.base_time().unwrap().priority, None);

    // A later fact still wins over the derived value.
    h.link.downstreams()[0].deliver_metadata(&base_time_fact("edge_rtc", 20, 5));
    assert_eq!(handle.base_time().unwrap().priority, Some(20));
}
