//! Sync session
//!
//! One driver task per connection. It performs the handshake, polls the
//! transient summary, refetches nodes whose sync token moved, and publishes
//! an immutable [`GridSnapshot`] after every successful cycle. Route and
//! rename commands are executed by the same task, so they never overlap a
//! poll.
//!
//! Timers: a single [`tokio::time::Sleep`] is reset for whichever phase is
//! active (handshake retry, steady poll, or the short poll-soon override).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use racerconf::{ConnectionConfig, RacerConfig};

use crate::activity::ActivitySet;
use crate::api::{ApiMode, CrosspointAction, CrosspointBatch, GridApi, RenameEntry, Transient};
use crate::error::Result;
use crate::model::{IoData, IoPath, Node, NodeId, NodeStatus};
use crate::take::CrosspointIssuer;
use crate::topology::{flatten, FlatTable, ProtoFilter};

/// Delay before retrying a failed handshake.
pub const HANDSHAKE_RETRY: Duration = Duration::from_secs(3);

/// Delay of the poll scheduled after a route or rename.
pub const POLL_SOON: Duration = Duration::from_millis(200);

/// Status text used when the session cannot even try to connect.
pub const MISSING_CREDENTIALS: &str = "Host or API token missing";

/// What the session needs from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub connection: ConnectionConfig,
    pub poll_interval: Duration,
    pub proto_filter: ProtoFilter,
}

impl SessionSettings {
    pub fn from_config(config: &RacerConfig) -> Self {
        Self {
            connection: config.link.connection.clone(),
            poll_interval: config.polling.interval(),
            proto_filter: ProtoFilter::new(config.routing.proto_filter_set()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ok,
    /// Connected, but the last poll failed. Polling continues.
    Degraded,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ok => "ok",
            SessionState::Degraded => "degraded",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// Lifecycle signal for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub description: Option<String>,
}

impl SessionStatus {
    fn new(state: SessionState, description: Option<String>) -> Self {
        Self { state, description }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {}", self.state.as_str(), d),
            None => write!(f, "{}", self.state.as_str()),
        }
    }
}

/// Everything the session knows, as of the last successful poll.
#[derive(Debug, Clone, Default)]
pub struct GridSnapshot {
    /// Sorted by (name, id), telemetry attached. Unchanged nodes are
    /// shared with the previous snapshot.
    pub nodes: Vec<Arc<Node>>,
    pub table: Arc<FlatTable>,
    pub activity: Arc<ActivitySet>,
    /// Bumped whenever the flat table is rebuilt.
    pub topology_revision: u64,
    pub mode: Option<ApiMode>,
}

impl GridSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id).map(Arc::as_ref)
    }

    pub fn io(&self, key: &str) -> Option<&IoData> {
        self.table.get(key)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.table
            .get(key)
            .map(|io| self.activity.is_io_active(io))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Crosspoint(CrosspointBatch),
    Rename(RenameEntry),
    PollSoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing scheduled.
    Idle,
    Handshake,
    Poll,
}

/// Result of the fetch half of a poll cycle.
struct CycleUpdate {
    transient: Transient,
    dropped: Vec<NodeId>,
    fetched: Fetched,
}

enum Fetched {
    Nodes(Vec<Node>),
    All(HashMap<NodeId, Node>),
}

/// Driver state. Owned by the spawned task, never shared.
pub struct SyncSession {
    api: Arc<dyn GridApi>,
    settings: SessionSettings,
    mode: ApiMode,
    nodes: HashMap<NodeId, Arc<Node>>,
    table: Arc<FlatTable>,
    activity: Arc<ActivitySet>,
    revision: u64,
    ok_description: Option<String>,
    snapshot_tx: watch::Sender<Arc<GridSnapshot>>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SyncSession {
    /// Start a session driver and return its handle.
    pub fn spawn(settings: SessionSettings, api: Arc<dyn GridApi>) -> SessionHandle {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(GridSnapshot::default()));
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(SessionState::Connecting, None));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = SyncSession {
            api,
            settings,
            mode: ApiMode::default(),
            nodes: HashMap::new(),
            table: Arc::new(FlatTable::default()),
            activity: Arc::new(ActivitySet::default()),
            revision: 0,
            ok_description: None,
            snapshot_tx,
            status_tx,
        };

        let task = tokio::spawn(session.run(command_rx, cancel.clone()));

        SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            status: status_rx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let mut phase = if self.settings.connection.has_credentials() {
            Phase::Handshake
        } else {
            self.set_status(SessionState::Disconnected, Some(MISSING_CREDENTIALS.to_string()));
            Phase::Idle
        };

        let timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = &mut timer, if phase != Phase::Idle => {
                    let next = match phase {
                        Phase::Handshake => {
                            let Some(result) = until_cancelled(&cancel, self.handshake()).await else {
                                break;
                            };
                            match result {
                                Ok(()) => {
                                    phase = Phase::Poll;
                                    Duration::ZERO
                                }
                                Err(e) => {
                                    warn!("handshake failed: {}", e);
                                    self.set_status(SessionState::Disconnected, Some(format!("login failed: {}", e)));
                                    HANDSHAKE_RETRY
                                }
                            }
                        }
                        Phase::Poll => {
                            if until_cancelled(&cancel, self.poll_once()).await.is_none() {
                                break;
                            }
                            self.settings.poll_interval
                        }
                        Phase::Idle => continue,
                    };
                    timer.as_mut().reset(Instant::now() + next);
                }

                Some(command) = commands.recv() => {
                    let poll_soon = match command {
                        Command::PollSoon => true,
                        Command::Crosspoint(batch) => {
                            if until_cancelled(&cancel, self.issue_crosspoint(batch)).await.is_none() {
                                break;
                            }
                            true
                        }
                        Command::Rename(entry) => {
                            if until_cancelled(&cancel, self.rename(entry)).await.is_none() {
                                break;
                            }
                            true
                        }
                    };
                    if poll_soon && phase == Phase::Poll {
                        timer.as_mut().reset(Instant::now() + POLL_SOON);
                    }
                }
            }
        }

        debug!("sync session stopped");
        self.nodes.clear();
        self.snapshot_tx.send_replace(Arc::new(GridSnapshot::default()));
    }

    async fn handshake(&mut self) -> Result<()> {
        self.nodes.clear();
        self.set_status(SessionState::Connecting, None);

        let meta = self.api.meta().await?;
        self.mode = meta.validate()?;

        let description = format!("{}: {}", self.settings.connection.host.trim(), meta.version);
        info!(mode = %self.mode, version = %meta.version, "connected to {}", self.settings.connection.host.trim());
        self.ok_description = Some(description);
        self.set_status(SessionState::Ok, self.ok_description.clone());
        Ok(())
    }

    /// One poll cycle. Failures degrade the status but never stop polling.
    async fn poll_once(&mut self) {
        match self.fetch_cycle().await {
            Ok(update) => {
                self.commit(update);
                self.set_status(SessionState::Ok, self.ok_description.clone());
            }
            Err(e) => {
                error!("failed to process transient data: {}", e);
                self.set_status(SessionState::Degraded, Some(e.to_string()));
            }
        }
    }

    /// Fetch everything a cycle needs without touching session state.
    async fn fetch_cycle(&self) -> Result<CycleUpdate> {
        let transient = self.api.transient().await?;

        let live: HashSet<&str> = transient.node_tokens.iter().map(|(id, _)| id.as_str()).collect();
        let dropped: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();

        let stale: Vec<&NodeId> = transient
            .node_tokens
            .iter()
            .filter(|(id, token)| {
                self.nodes
                    .get(id)
                    .map(|node| node.sync_token != *token)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id)
            .collect();

        let fetched = match self.mode {
            ApiMode::Standard => {
                let mut nodes = Vec::with_capacity(stale.len());
                for id in stale {
                    let node = self.api.node(id).await?;
                    debug!(node_id = %id, name = %node.name, "fetched node");
                    nodes.push(node);
                }
                Fetched::Nodes(nodes)
            }
            ApiMode::Simulator if !stale.is_empty() => Fetched::All(self.api.nodes().await?),
            ApiMode::Simulator => Fetched::Nodes(Vec::new()),
        };

        Ok(CycleUpdate {
            transient,
            dropped,
            fetched,
        })
    }

    fn commit(&mut self, update: CycleUpdate) {
        let CycleUpdate {
            transient,
            dropped,
            fetched,
        } = update;

        let mut dirty = !dropped.is_empty();
        for id in dropped {
            debug!(node_id = %id, "dropping node");
            self.nodes.remove(&id);
        }

        match fetched {
            Fetched::Nodes(nodes) => {
                dirty |= !nodes.is_empty();
                for node in nodes {
                    self.nodes.insert(node.id.clone(), Arc::new(node));
                }
            }
            Fetched::All(nodes) => {
                debug!(count = nodes.len(), "fetched all nodes");
                self.nodes = nodes.into_iter().map(|(id, node)| (id, Arc::new(node))).collect();
                dirty = true;
            }
        }

        let mut statuses: HashMap<NodeId, NodeStatus> = transient
            .node_status
            .into_iter()
            .map(|status| (status.node_id.clone(), status))
            .collect();
        for (id, node) in self.nodes.iter_mut() {
            let status = statuses.remove(id);
            // Only nodes whose telemetry moved get cloned.
            if node.status != status {
                Arc::make_mut(node).status = status;
            }
        }

        self.activity = Arc::new(ActivitySet::from_statuses(
            self.nodes
                .values()
                .filter_map(|n| n.status.as_ref().map(|s| (n.ember_id, s))),
        ));

        if dirty {
            self.table = Arc::new(flatten(
                self.nodes.values().map(Arc::as_ref),
                &self.settings.proto_filter,
            ));
            self.revision += 1;
            info!(ports = self.table.len(), nodes = self.nodes.len(), "topology changed");
        }

        self.publish();
    }

    fn publish(&self) {
        let mut nodes: Vec<Arc<Node>> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        self.snapshot_tx.send_replace(Arc::new(GridSnapshot {
            nodes,
            table: Arc::clone(&self.table),
            activity: Arc::clone(&self.activity),
            topology_revision: self.revision,
            mode: Some(self.mode),
        }));
    }

    async fn issue_crosspoint(&self, batch: CrosspointBatch) {
        if let Err(e) = self.api.crosspoints(&batch).await {
            for point in &batch.points {
                error!(
                    action = ?batch.action,
                    "failed to apply crosspoint {} -> {}: {}",
                    point.input, point.output, e
                );
            }
        }
    }

    async fn rename(&self, entry: RenameEntry) {
        if let Err(e) = self.api.rename(std::slice::from_ref(&entry)).await {
            error!("failed to rename {} to {:?}: {}", entry.path, entry.name, e);
        }
    }

    fn set_status(&self, state: SessionState, description: Option<String>) {
        let status = SessionStatus::new(state, description);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("session status: {}", status);
            *current = status;
            true
        });
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Owner's view of a running session. Dropping it stops the driver.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Arc<GridSnapshot>>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> Arc<GridSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GridSnapshot>> {
        self.snapshot.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Poll shortly instead of waiting for the full interval.
    pub fn poll_soon(&self) {
        self.send(Command::PollSoon);
    }

    pub fn issue(&self, action: CrosspointAction, input: IoPath, output: IoPath) {
        self.send(Command::Crosspoint(CrosspointBatch::single(action, input, output)));
    }

    pub fn rename_path(&self, path: IoPath, name: impl Into<String>) {
        self.send(Command::Rename(RenameEntry {
            path,
            name: name.into(),
        }));
    }

    /// Cancel the driver and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("sync session task ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("sync session is not running, command dropped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl CrosspointIssuer for SessionHandle {
    fn route(&self, src: &IoData, dst: &IoData) {
        debug!(src = %src.key, dst = %dst.key, "route");
        self.issue(CrosspointAction::Create, src.path.clone(), dst.path.clone());
    }

    fn disconnect(&self, dst: &IoData) {
        let Some(input) = dst.source_path.clone() else {
            debug!(dst = %dst.key, "disconnect skipped, nothing routed");
            return;
        };
        debug!(dst = %dst.key, "disconnect");
        self.issue(CrosspointAction::Delete, input, dst.path.clone());
    }

    fn rename(&self, io: &IoData, name: &str) {
        self.rename_path(io.path.clone(), name);
    }
}
