//! racerlink - control and monitoring bridge for StageRacer routing grids
//!
//! The bridge mirrors the matrix by polling its REST API, flattens every
//! node's IO tree into stable port keys, decides whether a route is legal,
//! and stages routes for take when asked to.
//!
//! Layers, leaf first:
//! - [`model`]: wire tree types and flat [`IoData`] ports
//! - [`compat`]: protocol and bandwidth routing rules
//! - [`topology`]: tree to flat table
//! - [`activity`]: signal presence from telemetry bitmasks
//! - [`api`]: the [`GridApi`] seam and its HTTP client
//! - [`session`]: the polling driver publishing [`GridSnapshot`]s
//! - [`take`]: staged routes
//! - [`bridge`]: everything above behind one handle
//!
//! ```rust,no_run
//! use racerconf::RacerConfig;
//! use racerlink::Bridge;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut bridge = Bridge::new(RacerConfig::load()?)?;
//! bridge.select_destination("E12_SDI_4");
//! bridge.queue_source("E3_SDI_1");
//! bridge.apply();
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod api;
pub mod bridge;
pub mod compat;
pub mod error;
pub mod model;
pub mod session;
pub mod take;
pub mod topology;

pub use activity::ActivitySet;
pub use api::{ApiMeta, ApiMode, GridApi, HttpGridApi, PROTOCOL_VERSION};
pub use bridge::Bridge;
pub use compat::can_route;
pub use error::ApiError;
pub use model::{IoData, IoKey, IoPath, Node, NodeStatus, PortDirection};
pub use session::{GridSnapshot, SessionHandle, SessionSettings, SessionState, SessionStatus, SyncSession};
pub use take::{ApplyOutcome, CrosspointIssuer, PendingRoute, QueueOutcome, TakeController};
pub use topology::{flatten, FlatTable, ProtoFilter};
