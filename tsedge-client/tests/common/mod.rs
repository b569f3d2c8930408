//! Shared fixtures for the integration tests.
//!
//! Every test drives a real [`EdgeConnection`] through `tsedge-link-sim`;
//! nothing touches the network or the filesystem.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

// ---

use tsedge_client::{ConnectionConfig, ConnectionHandler, EdgeConnection};
use tsedge_domain::{
    // ---
    BaseTimeFact,
    ConnectParams,
    Connection,
    ConnectionPtr,
    Connector,
    DataId,
    DownstreamOpenRequest,
    DownstreamPtr,
    Result,
    TsEdgeError,
    UpstreamOpenRequest,
    UpstreamPtr,
};
use tsedge_link_sim::{LinkSimConfig, RecordingMeasurements, SimConnector, SimLink, StaticToken};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    // ---
    pub link: Arc<SimLink>,
    pub meas: Arc<RecordingMeasurements>,
    pub conn: Arc<EdgeConnection>,
    pub events: Arc<EventLog>,
}

// ---

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new("https://edge.test:443")
        .with_name("it")
        .with_node_id("node-1")
        .with_project_id("proj-1")
}

pub fn harness(sim: LinkSimConfig) -> Harness {
    harness_with(sim, config())
}

pub fn harness_with(sim: LinkSimConfig, config: ConnectionConfig) -> Harness {
    // ---
    let link = SimLink::new(sim);
    let meas = RecordingMeasurements::new();
    let conn = Arc::new(EdgeConnection::new(
        config,
        Arc::new(SimConnector::new(link.clone())),
        StaticToken::new("token"),
        meas.clone(),
    ));
    let events = Arc::new(EventLog::default());
    conn.set_handler(events.clone());

    Harness {
        link,
        meas,
        conn,
        events,
    }
}

/// [`Harness`] over a [`GatedConnector`], plus its gates.
pub struct GatedHarness {
    // ---
    pub link: Arc<SimLink>,
    pub meas: Arc<RecordingMeasurements>,
    pub conn: Arc<EdgeConnection>,
    pub events: Arc<EventLog>,
    pub gates: Arc<Gates>,
}

pub fn gated_harness(sim: LinkSimConfig) -> GatedHarness {
    // ---
    let link = SimLink::new(sim);
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

    GatedHarness {
        link,
        meas,
        conn,
        events,
        gates,
    }
}

pub fn temp() -> DataId {
    DataId::new("temp", "float")
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Records connection-level errors as strings.
#[derive(Default)]
pub struct EventLog {
    // ---
    errors: Mutex<Vec<String>>,
}

// ---

impl EventLog {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

// ---

impl ConnectionHandler for EventLog {
    fn on_error(&self, error: &TsEdgeError) {
        self.errors.lock().push(error.to_string());
    }
}

// ---------------------------------------------------------------------------
// wait_for
// ---------------------------------------------------------------------------

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    // ---
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// GatedConnector
// ---------------------------------------------------------------------------

/// Wraps [`SimConnector`] so tests can hold upstream reopens, the connection
/// close and one chosen channel open at a gate.
///
/// Reopens and the close always wait for their release. A channel open waits
/// only when its `hold_*_open` counter says so: `Some(n)` lets `n` opens
/// through and holds the next one.
pub struct GatedConnector {
    // ---
    inner: SimConnector,
    pub gates: Arc<Gates>,
}

// ---

#[derive(Default)]
pub struct Gates {
    // ---
    pub reopen_entered: Notify,
    pub reopen_release: Notify,
    pub close_entered: Notify,
    pub close_release: Notify,
    pub open_entered: Notify,
    pub open_release: Notify,
    pub hold_upstream_open: Mutex<Option<usize>>,
    pub hold_downstream_open: Mutex<Option<usize>>,
}

// ---

impl Gates {
    async fn pass_open(&self, hold: &Mutex<Option<usize>>) {
        // ---
        let held = {
            let mut hold = hold.lock();
            match *hold {
                Some(0) => {
                    *hold = None;
                    true
                }
                Some(n) => {
                    *hold = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if held {
            self.open_entered.notify_one();
            self.open_release.notified().await;
        }
    }
}

// ---

impl GatedConnector {
    pub fn new(link: Arc<SimLink>) -> Self {
        Self {
            inner: SimConnector::new(link),
            gates: Arc::new(Gates::default()),
        }
    }
}

// ---

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, params: ConnectParams) -> Result<ConnectionPtr> {
        // ---
        let inner = self.inner.connect(params).await?;
        Ok(Arc::new(GatedConnection {
            inner,
            gates: self.gates.clone(),
        }))
    }
}

// ---

struct GatedConnection {
    // ---
    inner: ConnectionPtr,
    gates: Arc<Gates>,
}

// ---

#[async_trait]
impl Connection for GatedConnection {
    // ---
    async fn open_upstream(&self, req: UpstreamOpenRequest) -> Result<UpstreamPtr> {
        self.gates.pass_open(&self.gates.hold_upstream_open).await;
        self.inner.open_upstream(req).await
    }

    async fn open_downstream(&self, req: DownstreamOpenRequest) -> Result<DownstreamPtr> {
        self.gates.pass_open(&self.gates.hold_downstream_open).await;
        self.inner.open_downstream(req).await
    }

    async fn reopen_upstream(&self, old: UpstreamPtr) -> Result<UpstreamPtr> {
        // ---
        self.gates.reopen_entered.notify_one();
        self.gates.reopen_release.notified().await;
        self.inner.reopen_upstream(old).await
    }

    async fn reopen_downstream(&self, old: DownstreamPtr) -> Result<DownstreamPtr> {
        self.inner.reopen_downstream(old).await
    }

    async fn send_base_time(
        &self,
        fact: BaseTimeFact,
        persist: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.inner.send_base_time(fact, persist, timeout).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.gates.close_entered.notify_one();
        self.gates.close_release.notified().await;
        self.inner.close().await
    }
}
