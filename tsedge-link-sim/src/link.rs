use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;

// ---

use tsedge_domain::{
    // ---
    BaseTimeFact,
    ChannelId,
    ConnectParams,
    Connection,
    ConnectionEventsPtr,
    ConnectionPtr,
    Connector,
    DownstreamChannel,
    DownstreamFilter,
    DownstreamOpenRequest,
    DownstreamPtr,
    Endpoint,
    Result,
    TsEdgeError,
    UpstreamChannel,
    UpstreamOpenRequest,
    UpstreamPtr,
};

// ---

use super::{LinkSimConfig, SimDownstream, SimUpstream};

// ---------------------------------------------------------------------------
// SimLink
// ---------------------------------------------------------------------------

/// The simulated server side of every connection made through a
/// [`SimConnector`].
///
/// Records each call the client makes and exposes the channels it opened so
/// tests can inject acks, chunks, metadata and failures.
pub struct SimLink {
    // ---
    config: LinkSimConfig,
    state: Mutex<LinkState>,
}

// ---

#[derive(Default)]
struct LinkState {
    // ---
    connect_calls: usize,
    close_calls: usize,
    reopen_upstream_calls: usize,
    reopen_downstream_calls: usize,
    last_endpoint: Option<Endpoint>,
    last_node_id: Option<String>,
    tokens: Vec<String>,
    events: Option<ConnectionEventsPtr>,

    upstreams: Vec<Arc<SimUpstream>>,
    downstreams: Vec<Arc<SimDownstream>>,
    downstream_requests: Vec<Vec<DownstreamFilter>>,
    base_times: Vec<(BaseTimeFact, bool)>,

    fail_upstream_opens: usize,
    fail_downstream_opens: usize,
    fail_reopens: usize,
}

// ---

impl SimLink {
    // ---
    pub fn new(config: LinkSimConfig) -> Arc<Self> {
        // ---
        Arc::new(Self {
            config,
            state: Mutex::new(LinkState::default()),
        })
    }

    // --- fault injection -----------------------------------------------------

    /// Make the next `n` upstream opens fail.
    pub fn fail_next_upstream_opens(&self, n: usize) {
        self.state.lock().fail_upstream_opens = n;
    }

    /// Make the next `n` downstream opens fail.
    pub fn fail_next_downstream_opens(&self, n: usize) {
        self.state.lock().fail_downstream_opens = n;
    }

    /// Make the next `n` reopens (either direction) fail.
    pub fn fail_next_reopens(&self, n: usize) {
        self.state.lock().fail_reopens = n;
    }

    /// Fire connection-level `on_disconnect` then `on_reconnect`.
    pub fn bounce(&self) {
        // ---
        let events = self.state.lock().events.clone();
        if let Some(events) = events {
            events.on_disconnect();
            events.on_reconnect();
        }
    }

    // --- observation ---------------------------------------------------------

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn reopen_upstream_calls(&self) -> usize {
        self.state.lock().reopen_upstream_calls
    }

    pub fn reopen_downstream_calls(&self) -> usize {
        self.state.lock().reopen_downstream_calls
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().last_endpoint.clone()
    }

    pub fn last_node_id(&self) -> Option<String> {
        self.state.lock().last_node_id.clone()
    }

    /// Tokens presented by the client, one per connect.
    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }

    /// Every upstream channel opened or reopened, in open order.
    pub fn upstreams(&self) -> Vec<Arc<SimUpstream>> {
        self.state.lock().upstreams.clone()
    }

    pub fn upstream(&self, id: ChannelId) -> Option<Arc<SimUpstream>> {
        self.state
            .lock()
            .upstreams
            .iter()
            .find(|u| u.id() == id)
            .cloned()
    }

    /// Every downstream channel opened or reopened, in open order.
    pub fn downstreams(&self) -> Vec<Arc<SimDownstream>> {
        self.state.lock().downstreams.clone()
    }

    pub fn downstream(&self, id: ChannelId) -> Option<Arc<SimDownstream>> {
        self.state
            .lock()
            .downstreams
            .iter()
            .find(|d| d.id() == id)
            .cloned()
    }

    /// Filters of each wire-level downstream open request. Reopens excluded.
    pub fn downstream_requests(&self) -> Vec<Vec<DownstreamFilter>> {
        self.state.lock().downstream_requests.clone()
    }

    /// Base-time facts sent, with their persist flag.
    pub fn base_times(&self) -> Vec<(BaseTimeFact, bool)> {
        self.state.lock().base_times.clone()
    }

    // ---

    fn take_failure(counter: &mut usize) -> bool {
        // ---
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// SimConnection
// ---------------------------------------------------------------------------

/// One simulated connection. All connections share their [`SimLink`].
pub struct SimConnection {
    // ---
    link: Arc<SimLink>,
}

// ---

#[async_trait]
impl Connection for SimConnection {
    // ---
    async fn open_upstream(&self, req: UpstreamOpenRequest) -> Result<UpstreamPtr> {
        // ---
        let mut state = self.link.state.lock();
        if SimLink::take_failure(&mut state.fail_upstream_opens) {
            return Err(TsEdgeError::ChannelOpen("injected upstream open failure".into()));
        }

        let up = Arc::new(SimUpstream::new(
            req.session_id,
            req.persist,
            req.flush_policy,
            self.link.config.auto_ack,
            req.events,
        ));
        state.upstreams.push(up.clone());
        Ok(up)
    }

    // ---

    async fn open_downstream(&self, req: DownstreamOpenRequest) -> Result<DownstreamPtr> {
        // ---
        let mut state = self.link.state.lock();
        state.downstream_requests.push(req.filters.clone());
        if SimLink::take_failure(&mut state.fail_downstream_opens) {
            return Err(TsEdgeError::ChannelOpen("injected downstream open failure".into()));
        }

        let down = Arc::new(SimDownstream::new(req.filters, req.events));
        state.downstreams.push(down.clone());
        Ok(down)
    }

    // ---

    async fn reopen_upstream(&self, old: UpstreamPtr) -> Result<UpstreamPtr> {
        // ---
        let mut state = self.link.state.lock();
        state.reopen_upstream_calls += 1;
        if SimLink::take_failure(&mut state.fail_reopens) {
            return Err(TsEdgeError::Reopen {
                channel: old.id(),
                reason: "injected reopen failure".into(),
            });
        }

        let prev = state
            .upstreams
            .iter()
            .find(|u| u.id() == old.id())
            .cloned()
            .ok_or(TsEdgeError::ChannelClosed(old.id()))?;

        let up = Arc::new(prev.successor());
        state.upstreams.push(up.clone());
        Ok(up)
    }

    // ---

    async fn reopen_downstream(&self, old: DownstreamPtr) -> Result<DownstreamPtr> {
        // ---
        let mut state = self.link.state.lock();
        state.reopen_downstream_calls += 1;
        if SimLink::take_failure(&mut state.fail_reopens) {
            return Err(TsEdgeError::Reopen {
                channel: old.id(),
                reason: "injected reopen failure".into(),
            });
        }

        let prev = state
            .downstreams
            .iter()
            .find(|d| d.id() == old.id())
            .cloned()
            .ok_or(TsEdgeError::ChannelClosed(old.id()))?;

        let down = Arc::new(prev.successor());
        state.downstreams.push(down.clone());
        Ok(down)
    }

    // ---

    async fn send_base_time(
        &self,
        fact: BaseTimeFact,
        persist: bool,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        // ---
        if self.link.config.fail_base_time {
            return Err(TsEdgeError::Transport("injected base time failure".into()));
        }
        self.link.state.lock().base_times.push((fact, persist));
        Ok(())
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        self.link.state.lock().close_calls += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimConnector
// ---------------------------------------------------------------------------

/// In-process [`Connector`]. Does not use real sockets.
pub struct SimConnector {
    // ---
    link: Arc<SimLink>,
}

// ---

impl SimConnector {
    // ---
    pub fn new(link: Arc<SimLink>) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Arc<SimLink> {
        &self.link
    }
}

// ---

#[async_trait]
impl Connector for SimConnector {
    // ---
    async fn connect(&self, params: ConnectParams) -> Result<ConnectionPtr> {
        // ---
        {
            let mut state = self.link.state.lock();
            state.connect_calls += 1;
            state.last_endpoint = Some(params.endpoint.clone());
            state.last_node_id = Some(params.node_id.clone());
        }

        if self.link.config.fail_connect {
            tracing::debug!(endpoint = %params.endpoint, "sim: rejecting connect");
            return Err(TsEdgeError::ConnectFailed("server unreachable".into()));
        }

        let token = params.token_source.access_token().await?;

        {
            let mut state = self.link.state.lock();
            state.tokens.push(token);
            state.events = Some(params.events);
        }

        Ok(Arc::new(SimConnection {
            link: self.link.clone(),
        }))
    }
}
