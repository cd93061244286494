//! Bridge orchestrator
//!
//! Ties a configuration, a running [`SyncSession`] and the operator's
//! [`TakeController`] together, and exposes the read side the UI layer
//! consumes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use racerconf::{ConnectionConfig, RacerConfig};

use crate::api::{GridApi, HttpGridApi};
use crate::error::Result;
use crate::model::{IoData, IoKey, Node, NodeStatus, PortDirection};
use crate::session::{GridSnapshot, SessionHandle, SessionSettings, SessionStatus, SyncSession};
use crate::take::{ApplyOutcome, CrosspointIssuer, QueueOutcome, TakeController};
use crate::topology::FlatTable;

pub struct Bridge {
    config: RacerConfig,
    settings: SessionSettings,
    session: SessionHandle,
    take: TakeController,
}

impl Bridge {
    /// Connect to the matrix described by `config`.
    pub fn new(config: RacerConfig) -> Result<Self> {
        let api = HttpGridApi::new(&config.link.connection)?;
        Ok(Self::with_api(config, Arc::new(api)))
    }

    /// Same as [`Bridge::new`] with a caller-supplied API.
    pub fn with_api(config: RacerConfig, api: Arc<dyn GridApi>) -> Self {
        let settings = SessionSettings::from_config(&config);
        let session = SyncSession::spawn(settings.clone(), api);
        let take = TakeController::new(config.routing.take);

        Self {
            config,
            settings,
            session,
            take,
        }
    }

    pub fn config(&self) -> &RacerConfig {
        &self.config
    }

    /// Apply a new configuration. The session restarts only when something
    /// it depends on changed.
    pub fn apply_config(&mut self, config: RacerConfig) -> Result<()> {
        self.apply_config_with(config, |connection| {
            Ok(Arc::new(HttpGridApi::new(connection)?) as Arc<dyn GridApi>)
        })
    }

    /// Same as [`Bridge::apply_config`]; `make_api` builds the client of a
    /// restarted session and is not called otherwise.
    pub fn apply_config_with<F>(&mut self, config: RacerConfig, make_api: F) -> Result<()>
    where
        F: FnOnce(&ConnectionConfig) -> Result<Arc<dyn GridApi>>,
    {
        let settings = SessionSettings::from_config(&config);
        if settings != self.settings {
            let api = make_api(&settings.connection)?;
            self.restart(settings, api);
        } else {
            debug!("session settings unchanged, keeping sync session");
        }
        self.take.set_take(config.routing.take);
        self.config = config;
        Ok(())
    }

    fn restart(&mut self, settings: SessionSettings, api: Arc<dyn GridApi>) {
        info!(host = %settings.connection.host, "restarting sync session");
        // Replacing the handle drops the old one, which cancels its driver.
        self.session = SyncSession::spawn(settings.clone(), api);
        self.settings = settings;
        self.take.clear();
    }

    pub fn snapshot(&self) -> Arc<GridSnapshot> {
        self.session.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GridSnapshot>> {
        self.session.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.session.subscribe_status()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn ports(&self) -> Arc<FlatTable> {
        Arc::clone(&self.snapshot().table)
    }

    pub fn port(&self, key: &str) -> Option<IoData> {
        self.snapshot().io(key).cloned()
    }

    /// `(key, "<desc>: <name>")` for every port of one direction, in table order.
    pub fn port_choices(&self, direction: PortDirection) -> Vec<(IoKey, String)> {
        self.snapshot()
            .table
            .with_direction(direction)
            .map(|io| (io.key.clone(), format!("{}: {}", io.desc, io.name)))
            .collect()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.snapshot().nodes.clone()
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.snapshot().node(node_id).and_then(|n| n.status.clone())
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.snapshot().is_active(key)
    }

    pub fn take(&self) -> &TakeController {
        &self.take
    }

    pub fn set_take(&mut self, take: bool) {
        self.take.set_take(take);
    }

    pub fn select_destination(&mut self, key: &str) {
        self.take.select_destination(IoKey::from(key));
    }

    pub fn queue_route(&mut self, src: &str, dst: &str) -> QueueOutcome {
        let snapshot = self.snapshot();
        let (Some(src), Some(dst)) = (snapshot.io(src), snapshot.io(dst)) else {
            debug!(src, dst, "route request for unknown port");
            return QueueOutcome::Unresolved;
        };
        self.take.queue_route(src, dst, &self.session)
    }

    pub fn queue_disconnect(&mut self, dst: &str) -> QueueOutcome {
        let snapshot = self.snapshot();
        let Some(dst) = snapshot.io(dst) else {
            debug!(dst, "disconnect request for unknown port");
            return QueueOutcome::Unresolved;
        };
        self.take.queue_disconnect(dst, &self.session)
    }

    /// Route `src` to the selected destination.
    pub fn queue_source(&mut self, src: &str) -> QueueOutcome {
        let snapshot = self.snapshot();
        self.take.queue_source(&snapshot.table, src, &self.session)
    }

    pub fn apply(&mut self) -> ApplyOutcome {
        let snapshot = self.snapshot();
        self.take.apply(&snapshot.table, &self.session)
    }

    pub fn clear(&mut self) {
        self.take.clear();
    }

    /// Rename a port. Returns false if the key is unknown.
    pub fn rename_io(&self, key: &str, name: &str) -> bool {
        let snapshot = self.snapshot();
        let Some(io) = snapshot.io(key) else {
            return false;
        };
        self.session.rename(io, name);
        true
    }

    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiMeta, CrosspointBatch, RenameEntry, Transient, PROTOCOL_VERSION};
    use crate::model::NodeId;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A matrix with one node and fixed state.
    #[derive(Default)]
    struct StaticGrid {
        meta_calls: AtomicUsize,
        crosspoints: Mutex<Vec<CrosspointBatch>>,
    }

    fn stage() -> Node {
        serde_json::from_value(json!({
            "id": "n-a",
            "name": "Stage",
            "sync_token": 1,
            "ember_id": 3,
            "ios_by_proto": {
                "SDI": [
                    {"name": "Cam", "en": true, "proto": "SDI", "dir": "IN"},
                    {"name": "Pgm", "en": true, "proto": "SDI", "dir": {"OUT": ["none", "LOW"]}}
                ]
            }
        }))
        .unwrap()
    }

    #[async_trait]
    impl GridApi for StaticGrid {
        async fn meta(&self) -> Result<ApiMeta> {
            self.meta_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiMeta {
                protocol: PROTOCOL_VERSION.to_string(),
                version: "2.4.1".to_string(),
                mode: "standard".to_string(),
            })
        }

        async fn transient(&self) -> Result<Transient> {
            Ok(Transient {
                local_node_id: "n-a".to_string(),
                node_tokens: vec![("n-a".to_string(), 1)],
                ..Default::default()
            })
        }

        async fn node(&self, _id: &str) -> Result<Node> {
            Ok(stage())
        }

        async fn nodes(&self) -> Result<HashMap<NodeId, Node>> {
            Ok(HashMap::from([("n-a".to_string(), stage())]))
        }

        async fn crosspoints(&self, batch: &CrosspointBatch) -> Result<()> {
            self.crosspoints.lock().unwrap().push(batch.clone());
            Ok(())
        }

        async fn rename(&self, _entries: &[RenameEntry]) -> Result<()> {
            Ok(())
        }
    }

    fn config(take: bool) -> RacerConfig {
        let mut config = RacerConfig::default();
        config.link.connection.host = "10.0.0.5".to_string();
        config.link.connection.use_https = false;
        config.link.connection.api_token = "SRK_abcdefghij".to_string();
        config.routing.take = take;
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_choices() {
        let bridge = Bridge::with_api(config(false), Arc::new(StaticGrid::default()));
        settle().await;

        assert_eq!(
            bridge.port_choices(PortDirection::In),
            vec![(IoKey::from("E3_SDI_1"), "Stage/SDI/1: Cam".to_string())]
        );
        assert_eq!(
            bridge.port_choices(PortDirection::Out),
            vec![(IoKey::from("E3_SDI_2"), "Stage/SDI/2: Pgm".to_string())]
        );
        assert_eq!(bridge.nodes().len(), 1);
        assert!(bridge.node_status("n-a").is_none());
        assert!(!bridge.is_active("E3_SDI_1"));

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_through_bridge() {
        let grid = Arc::new(StaticGrid::default());
        let mut bridge = Bridge::with_api(config(true), grid.clone());
        settle().await;

        bridge.select_destination("E3_SDI_2");
        assert_eq!(bridge.queue_source("E3_SDI_1"), QueueOutcome::Pending { compatible: true });
        settle().await;
        assert!(grid.crosspoints.lock().unwrap().is_empty());

        assert_eq!(bridge.apply(), ApplyOutcome::Issued);
        settle().await;
        assert_eq!(grid.crosspoints.lock().unwrap().len(), 1);

        assert_eq!(bridge.queue_route("E3_SDI_1", "E9_SDI_1"), QueueOutcome::Unresolved);

        bridge.shutdown().await;
    }

    fn reuse(grid: &Arc<StaticGrid>) -> impl FnOnce(&ConnectionConfig) -> Result<Arc<dyn GridApi>> {
        let grid = Arc::clone(grid);
        move |_: &ConnectionConfig| Ok(grid as Arc<dyn GridApi>)
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_disabling_take_keeps_session() {
        let grid = Arc::new(StaticGrid::default());
        let mut bridge = Bridge::with_api(config(true), grid.clone());
        settle().await;
        let before = bridge.snapshot();
        assert_eq!(before.topology_revision, 1);

        bridge.queue_route("E3_SDI_1", "E3_SDI_2");
        assert!(bridge.take().has_pending());

        bridge
            .apply_config_with(config(false), |_| panic!("session must not restart"))
            .unwrap();
        assert!(!bridge.take().has_pending());
        assert!(!bridge.take().take_enabled());
        assert!(!bridge.config().routing.take);

        // Same driver: the published snapshot survives.
        assert!(Arc::ptr_eq(&before, &bridge.snapshot()));
        assert_eq!(grid.meta_calls.load(Ordering::SeqCst), 1);

        settle().await;
        assert_eq!(bridge.queue_route("E3_SDI_1", "E3_SDI_2"), QueueOutcome::Issued);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_filter_change_restarts_session() {
        let grid = Arc::new(StaticGrid::default());
        let mut bridge = Bridge::with_api(config(true), grid.clone());
        settle().await;
        assert_eq!(bridge.ports().len(), 2);

        bridge.queue_route("E3_SDI_1", "E3_SDI_2");
        assert!(bridge.take().has_pending());

        let mut filtered = config(true);
        filtered.routing.proto_filter = "SDI".to_string();
        bridge.apply_config_with(filtered, reuse(&grid)).unwrap();
        assert!(!bridge.take().has_pending());
        assert!(bridge.take().take_enabled());

        // Fresh session, not yet polled.
        assert_eq!(bridge.snapshot().topology_revision, 0);

        settle().await;
        assert_eq!(grid.meta_calls.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.snapshot().topology_revision, 1);
        assert!(bridge.ports().is_empty());
        assert_eq!(bridge.nodes().len(), 1);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_interval_change_restarts_session() {
        let grid = Arc::new(StaticGrid::default());
        let mut bridge = Bridge::with_api(config(false), grid.clone());
        settle().await;

        let mut slower = config(false);
        slower.polling.interval_ms = 5_000;
        let mut restarted = false;
        bridge
            .apply_config_with(slower, |_| {
                restarted = true;
                Ok(grid.clone() as Arc<dyn GridApi>)
            })
            .unwrap();
        assert!(restarted);

        settle().await;
        assert_eq!(grid.meta_calls.load(Ordering::SeqCst), 2);

        bridge.shutdown().await;
    }
}
