//! Reliability walk-through over the in-process link simulator.
//!
//! Registers one persisted upstream and one downstream, connects, sends
//! points, kills the upstream channel mid-run, lets the connection reopen it
//! and replay the failed write, then closes and prints how the measurement
//! session was reconciled.

use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;
use chrono::{DateTime, Utc};

// ---

use tsedge_client::{
    // ---
    CloseOutcome,
    ConnectionConfig,
    ConnectionHandler,
    EdgeConnection,
    RollingThroughput,
    UpstreamHandle,
};
use tsedge_domain::{
    // ---
    BaseTimeFact,
    DataId,
    DataPoint,
    DataPointGroup,
    DownstreamChunk,
    DownstreamMetadata,
    FlushPolicy,
    TsEdgeError,
};
use tsedge_link_sim::{LinkSimConfig, MeasurementCall, RecordingMeasurements, SimConnector, SimLink, StaticToken};

// ---

const SIM_NODE: &str = "sim-node";

pub struct DemoOptions {
    pub points: u32,
    pub manual_ack: bool,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct LogHandler;

impl ConnectionHandler for LogHandler {
    // ---
    fn on_connect(&self) {
        tracing::info!("handler: connected");
    }

    fn on_connect_failed(&self, error: &TsEdgeError) {
        tracing::error!("handler: connect failed: {error}");
    }

    fn on_error(&self, error: &TsEdgeError) {
        tracing::warn!("handler: {error}");
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub async fn run(config: ConnectionConfig, opts: DemoOptions) -> anyhow::Result<()> {
    // ---
    let sim = if opts.manual_ack {
        LinkSimConfig::manual_ack()
    } else {
        LinkSimConfig::perfect()
    };
    let link = SimLink::new(sim);
    let meas = RecordingMeasurements::new();

    let conn = Arc::new(EdgeConnection::new(
        config,
        Arc::new(SimConnector::new(link.clone())),
        StaticToken::with_client_id("demo-token", SIM_NODE),
        meas.clone(),
    ));
    conn.set_handler(Arc::new(LogHandler));

    let sent_rate = Arc::new(RollingThroughput::new(Duration::from_secs(1), 10));
    let recv_rate = Arc::new(RollingThroughput::new(Duration::from_secs(1), 10));
    conn.set_upstream_sampler(sent_rate.clone());
    conn.set_downstream_sampler(recv_rate.clone());

    let temp = DataId::new("temperature", "float64");
    let up = conn.register_upstream(true, FlushPolicy::Immediately, None);
    let down = conn.register_downstream(
        SIM_NODE,
        temp.clone(),
        Arc::new(|base: DateTime<Utc>, groups: &[DataPointGroup]| {
            for g in groups {
                println!("  received {} point(s) of {} (base {base})", g.points.len(), g.data_id);
            }
        }),
    );

    // --- connect

    println!("=== connect ===");
    conn.connect().await.context("connect")?;
    println!("  state:      {:?}", conn.state());
    println!("  session:    {:?}", conn.session_id());
    println!("  upstream:   {:?}", up.sequence_id());
    println!("  downstream: {:?}", down.channel_id());

    // --- send

    println!("=== send {} points ===", opts.points);
    let half = opts.points / 2;
    send(&up, &temp, 0..half)?;

    // --- channel failure

    println!("=== upstream channel failure ===");
    let old_id = up.sequence_id().context("upstream not open")?;
    let old = link.upstream(old_id).context("upstream not in link")?;
    old.fail_next_writes(1);
    if let Err(e) = up.send_data_point_now(temp.clone(), payload(half)) {
        println!("  write failed and was buffered: {e}");
    }
    println!("  retry buffer: {}", conn.retry_buffer_len());
    old.close_with_error("simulated stream reset");

    let reopened = wait_until(|| up.sequence_id().is_some_and(|id| id != old_id)).await;
    anyhow::ensure!(reopened, "upstream was not reopened");
    println!("  reopened {old_id} -> {:?}", up.sequence_id());
    println!("  retry buffer after replay: {}", conn.retry_buffer_len());

    send(&up, &temp, half + 1..opts.points)?;

    // --- downstream

    println!("=== downstream ===");
    let sub = link.downstreams().first().cloned().context("downstream not open")?;
    sub.deliver_metadata(&DownstreamMetadata::BaseTime(BaseTimeFact::edge_rtc(
        conn.session_id().unwrap_or_default(),
        Utc::now(),
    )));
    sub.deliver_chunk(&DownstreamChunk {
        sequence_number: 1,
        source_node_id: SIM_NODE.into(),
        groups: vec![DataPointGroup::single(temp.clone(), DataPoint::new(0, payload(0)))],
    });
    if let Some(stored) = down.base_time() {
        println!("  base time {:?} (priority {:?})", stored.base_time, stored.priority);
    }

    // --- close

    if opts.manual_ack {
        let channel = link
            .upstream(up.sequence_id().context("upstream not open")?)
            .context("upstream not in link")?;
        channel.ack_pending(channel.pending_acks() / 2);
    }

    let (generated, received) = conn.counters();
    println!("=== close (generated {generated}, acked {received}) ===");
    println!(
        "  throughput: sent {} bit/s, received {} bit/s",
        sent_rate.bits_per_second(),
        recv_rate.bits_per_second()
    );

    match conn.close().await {
        CloseOutcome::Closed(outcome) => println!("  reconcile: {outcome:?}"),
        other => anyhow::bail!("unexpected close outcome: {other:?}"),
    }
    for call in meas.calls() {
        println!("  measurement call: {}", describe(&call));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn payload(i: u32) -> Vec<u8> {
    (20.0 + f64::from(i) * 0.5).to_le_bytes().to_vec()
}

fn send(up: &UpstreamHandle, temp: &DataId, range: std::ops::Range<u32>) -> anyhow::Result<()> {
    // ---
    for i in range {
        up.send_data_point_now(temp.clone(), payload(i))
            .with_context(|| format!("send point {i}"))?;
    }
    Ok(())
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    // ---
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn describe(call: &MeasurementCall) -> String {
    // ---
    match call {
        MeasurementCall::UpdateSequence(update) => format!(
            "update sequence {} ({} points, last seq {})",
            update.sequence_id, update.expected_data_points, update.final_sequence_number
        ),
        other => format!("{other:?}"),
    }
}
