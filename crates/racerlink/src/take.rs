//! Take workflow
//!
//! Operator intent, kept apart from the sync session. With take mode off a
//! compatible route goes out at once; with take mode on it is staged as a
//! [`PendingRoute`] until `apply` or `clear`.

use tracing::{debug, info, warn};

use crate::compat::can_route;
use crate::model::{IoData, IoKey};
use crate::topology::FlatTable;

/// Issues crosspoint commands. Fire-and-forget: the next poll confirms.
pub trait CrosspointIssuer {
    fn route(&self, src: &IoData, dst: &IoData);

    fn disconnect(&self, dst: &IoData);

    fn rename(&self, io: &IoData, name: &str);
}

/// A staged route. `src` is `None` for a staged disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRoute {
    pub src: Option<IoKey>,
    pub dst: IoKey,
    pub compatible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Sent to the matrix.
    Issued,
    /// Staged for take.
    Pending { compatible: bool },
    /// Take mode off and the route is not legal. Nothing was sent.
    Incompatible,
    /// A key did not resolve in the current table.
    Unresolved,
    /// No destination is selected.
    NoDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing was pending.
    Nothing,
    Issued,
    /// The staged route is not legal. It stays pending until cleared.
    Incompatible,
    /// The staged ports vanished from the table. The route was dropped.
    Unresolved,
}

#[derive(Debug, Clone, Default)]
pub struct TakeController {
    take: bool,
    selected: Option<IoKey>,
    pending: Option<PendingRoute>,
}

impl TakeController {
    pub fn new(take: bool) -> Self {
        Self {
            take,
            ..Default::default()
        }
    }

    pub fn take_enabled(&self) -> bool {
        self.take
    }

    /// Turning take mode off drops whatever was staged.
    pub fn set_take(&mut self, take: bool) {
        self.take = take;
        if !take {
            self.clear();
        }
    }

    pub fn pending(&self) -> Option<&PendingRoute> {
        self.pending.as_ref()
    }

    pub fn selected_destination(&self) -> Option<&IoKey> {
        self.selected.as_ref()
    }

    pub fn select_destination(&mut self, key: IoKey) {
        debug!(dst = %key, "destination selected");
        self.selected = Some(key);
    }

    pub fn queue_route(&mut self, src: &IoData, dst: &IoData, issuer: &dyn CrosspointIssuer) -> QueueOutcome {
        let compatible = can_route(src, dst);

        if self.take {
            self.pending = Some(PendingRoute {
                src: Some(src.key.clone()),
                dst: dst.key.clone(),
                compatible,
            });
            debug!(src = %src.key, dst = %dst.key, compatible, "route staged");
            return QueueOutcome::Pending { compatible };
        }

        if !compatible {
            warn!(src = %src.key, dst = %dst.key, "incompatible route ignored");
            return QueueOutcome::Incompatible;
        }

        issuer.route(src, dst);
        QueueOutcome::Issued
    }

    pub fn queue_disconnect(&mut self, dst: &IoData, issuer: &dyn CrosspointIssuer) -> QueueOutcome {
        if self.take {
            self.pending = Some(PendingRoute {
                src: None,
                dst: dst.key.clone(),
                compatible: true,
            });
            debug!(dst = %dst.key, "disconnect staged");
            return QueueOutcome::Pending { compatible: true };
        }

        issuer.disconnect(dst);
        QueueOutcome::Issued
    }

    /// Route `src` to the selected destination.
    pub fn queue_source(&mut self, table: &FlatTable, src: &str, issuer: &dyn CrosspointIssuer) -> QueueOutcome {
        let Some(dst_key) = self.selected.clone() else {
            return QueueOutcome::NoDestination;
        };
        let (Some(src), Some(dst)) = (table.get(src), table.get(dst_key.as_str())) else {
            return QueueOutcome::Unresolved;
        };
        self.queue_route(src, dst, issuer)
    }

    /// Commit the staged route.
    pub fn apply(&mut self, table: &FlatTable, issuer: &dyn CrosspointIssuer) -> ApplyOutcome {
        let Some(pending) = &self.pending else {
            return ApplyOutcome::Nothing;
        };

        if !pending.compatible {
            warn!(dst = %pending.dst, "staged route is incompatible, clear it first");
            return ApplyOutcome::Incompatible;
        }

        let Some(pending) = self.pending.take() else {
            return ApplyOutcome::Nothing;
        };

        let Some(dst) = table.get(pending.dst.as_str()) else {
            warn!(dst = %pending.dst, "staged destination no longer exists");
            return ApplyOutcome::Unresolved;
        };

        match &pending.src {
            Some(src_key) => {
                let Some(src) = table.get(src_key.as_str()) else {
                    warn!(src = %src_key, "staged source no longer exists");
                    return ApplyOutcome::Unresolved;
                };
                info!(src = %src.key, dst = %dst.key, "take");
                issuer.route(src, dst);
            }
            None => {
                info!(dst = %dst.key, "take disconnect");
                issuer.disconnect(dst);
            }
        }

        ApplyOutcome::Issued
    }

    pub fn clear(&mut self) {
        if self.pending.take().is_some() {
            debug!("staged route cleared");
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// `key` is the staged source for the selected destination.
    pub fn is_pending_source(&self, key: &str) -> bool {
        match (&self.pending, &self.selected) {
            (Some(pending), Some(selected)) if pending.dst == *selected => {
                pending.src.as_ref().is_some_and(|src| src.as_str() == key)
            }
            _ => false,
        }
    }

    pub fn is_pending_destination(&self, key: &str) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.dst.as_str() == key)
    }

    pub fn is_selected_destination(&self, key: &str) -> bool {
        self.selected.as_ref().is_some_and(|s| s.as_str() == key)
    }

    /// `key` currently feeds the selected destination.
    pub fn selected_source_is(&self, key: &str, table: &FlatTable) -> bool {
        self.selected
            .as_ref()
            .and_then(|dst| table.get(dst.as_str()))
            .and_then(|dst| dst.src_key.as_ref())
            .is_some_and(|src| src.as_str() == key)
    }
}
