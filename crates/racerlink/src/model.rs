//! Grid data model
//!
//! Two views of the same ports: the hierarchical `Node`/`Io` tree exactly as
//! the matrix API reports it, and the flat, uniquely keyed `IoData` entries
//! that the rest of the bridge addresses.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use crate::activity;

pub type NodeId = String;
pub type SyncToken = u64;
pub type Protocol = String;

/// Stable port address: survives reconnects and is identical across machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IoKey(pub String);

/// Session-scoped port address used when talking to the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IoPath(pub String);

macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype!(IoKey);
string_newtype!(IoPath);

/// A signal standard a port can carry, with its bandwidth cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standard {
    pub name: String,
    pub bw: f64,
}

/// Binding of an output (or bidirectional) port to its current source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputBinding {
    /// Declared source path, if any.
    pub source: Option<IoPath>,
    /// Whether the source is locked on the matrix.
    pub locked: bool,
    pub priority: Option<String>,
}

/// Direction descriptor of a tree IO.
///
/// On the wire this is either a bare tag (`"IN"`, `"OUT"`, `"IDLE"`, ...) or
/// an object `{"OUT": [source, priority]}` / `{"BIDIR": [source, priority]}`
/// where `source` is `"none"`, `{"locked": path}` or `{"unlocked": path}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum IoDirection {
    #[default]
    Idle,
    Input,
    Output(OutputBinding),
    Bidir(OutputBinding),
}

impl IoDirection {
    /// The routable direction, if any. Bidirectional and idle ports are not routable.
    pub fn port_direction(&self) -> Option<PortDirection> {
        match self {
            IoDirection::Input => Some(PortDirection::In),
            IoDirection::Output(_) => Some(PortDirection::Out),
            IoDirection::Idle | IoDirection::Bidir(_) => None,
        }
    }

    /// Declared source path of an output or bidirectional port.
    pub fn source_path(&self) -> Option<&IoPath> {
        match self {
            IoDirection::Output(binding) | IoDirection::Bidir(binding) => binding.source.as_ref(),
            IoDirection::Idle | IoDirection::Input => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
    Tag(String),
    Bound {
        #[serde(default)]
        locked: Option<IoPath>,
        #[serde(default)]
        unlocked: Option<IoPath>,
    },
}

#[derive(Deserialize)]
struct RawBinding(RawSource, #[serde(default)] Option<Value>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDirection {
    Tag(String),
    Object {
        #[serde(rename = "OUT", default)]
        out: Option<RawBinding>,
        #[serde(rename = "BIDIR", default)]
        bidir: Option<RawBinding>,
    },
}

impl From<RawBinding> for OutputBinding {
    fn from(raw: RawBinding) -> Self {
        let RawBinding(source, priority) = raw;
        let (source, locked) = match source {
            RawSource::Tag(_) => (None, false),
            RawSource::Bound { locked, unlocked } => match (locked, unlocked) {
                (Some(path), _) => (Some(path), true),
                (None, Some(path)) => (Some(path), false),
                (None, None) => (None, false),
            },
        };
        let priority = match priority {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        OutputBinding {
            source,
            locked,
            priority,
        }
    }
}

impl From<RawDirection> for IoDirection {
    fn from(raw: RawDirection) -> Self {
        match raw {
            RawDirection::Tag(tag) => match tag.as_str() {
                "IN" => IoDirection::Input,
                "OUT" => IoDirection::Output(OutputBinding::default()),
                "BIDIR" => IoDirection::Bidir(OutputBinding::default()),
                _ => IoDirection::Idle,
            },
            RawDirection::Object { out: Some(b), .. } => IoDirection::Output(b.into()),
            RawDirection::Object {
                out: None,
                bidir: Some(b),
            } => IoDirection::Bidir(b.into()),
            RawDirection::Object { .. } => IoDirection::Idle,
        }
    }
}

impl<'de> Deserialize<'de> for IoDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawDirection::deserialize(deserializer).map(IoDirection::from)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One IO in a node's tree, as reported by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Io {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "en", default)]
    pub enabled: bool,
    #[serde(rename = "proto")]
    pub protocol: Protocol,
    #[serde(default)]
    pub dir: IoDirection,
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<Io>,
    #[serde(default)]
    pub attrs: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stds: Vec<Standard>,
    #[serde(default)]
    pub stdi: Option<i64>,
}

impl Io {
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Currently active standard, if the index points at one.
    pub fn active_standard(&self) -> Option<&Standard> {
        let idx = usize::try_from(self.stdi?).ok()?;
        self.stds.get(idx)
    }

    pub fn tico_mode(&self) -> TicoMode {
        self.attr("sdi_input")
            .and_then(|a| a.get("tico_compression_mode"))
            .and_then(Value::as_str)
            .map(TicoMode::from_wire)
            .unwrap_or_default()
    }

    pub fn is_multiviewer(&self) -> bool {
        self.attr("multiviewer")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A physical controller unit and its IO tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub sync_token: SyncToken,
    /// Hardware identifier, stable across sessions.
    pub ember_id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ios_by_proto: HashMap<Protocol, Vec<Io>>,
    /// Latest telemetry, refreshed on every poll.
    #[serde(skip)]
    pub status: Option<NodeStatus>,
}

/// Per-node telemetry from the transient summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(alias = "id")]
    pub node_id: NodeId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub temperatures: Vec<Temperature>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub psus: Vec<PsuVoltage>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub trunks: Vec<TrunkPower>,
    #[serde(default)]
    pub io_state: Option<IoState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub name: String,
    pub celsius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsuVoltage {
    pub name: String,
    pub volts: f64,
}

/// Optical receive power of one trunk fiber. `None` when nothing is plugged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkPower {
    pub index: u32,
    #[serde(default)]
    pub popt_dbm: Option<f64>,
}

/// Activity bitmask: one integer, or 32-bit chunks for wide families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bitmask {
    Single(u64),
    Chunks(Vec<u32>),
}

/// Per-family activity bitmasks of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoState {
    #[serde(default)]
    pub sdi: Option<Bitmask>,
    #[serde(default)]
    pub analog_in: Option<Bitmask>,
    #[serde(default)]
    pub analog_out: Option<Bitmask>,
    #[serde(default)]
    pub gpi: Option<Bitmask>,
    #[serde(default)]
    pub gpo: Option<Bitmask>,
    #[serde(default)]
    pub madi_in: Option<Bitmask>,
    #[serde(default)]
    pub madi_out: Option<Bitmask>,
    #[serde(default)]
    pub dante_in: Option<Bitmask>,
    #[serde(default)]
    pub dante_out: Option<Bitmask>,
}

/// Compression scheme applied to an SDI input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TicoMode {
    #[default]
    #[serde(rename = "DISABLED")]
    Disabled,
    #[serde(rename = "TICO3G")]
    Tico3G,
    #[serde(rename = "TICOHD")]
    TicoHd,
}

impl TicoMode {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "TICO3G" => TicoMode::Tico3G,
            "TICOHD" => TicoMode::TicoHd,
            _ => TicoMode::Disabled,
        }
    }

    /// Bandwidth divisor for a standard under this mode.
    pub fn divisor(&self, standard: &str) -> f64 {
        match (self, standard) {
            (TicoMode::Tico3G, "HD" | "3G" | "6G" | "12G") => 4.0,
            (TicoMode::TicoHd, "HD" | "3G" | "6G") => 4.0,
            (TicoMode::TicoHd, "12G") => 8.0,
            _ => 1.0,
        }
    }
}

/// Routable direction of a flat port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl PortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortDirection::In => "IN",
            PortDirection::Out => "OUT",
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Short display alias for a protocol.
pub fn display_proto(protocol: &str) -> &str {
    match protocol {
        "ANALO_IN" | "ANALO_OUT" => "ANALOG",
        "GPI" | "GPO" => "GPIO",
        "DANTE_CH" => "DANTE",
        "SDI_PV" => "PREVIEW",
        "SDI_ACH" => "SDI_AUDIO",
        "GENLOCK" => "GL",
        "MADI_CH" => "MADI_AUDIO",
        other => other,
    }
}

fn join_indices(indices: &[u32], sep: &str) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

/// A routable port in the flat address space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoData {
    pub key: IoKey,
    pub path: IoPath,
    /// `<node name>/<protocol>/<indices>`, for humans.
    pub desc: String,
    pub node_id: NodeId,
    pub hw_id: u64,
    pub name: String,
    pub protocol: Protocol,
    /// 1-based position in the node tree, one entry per nesting level.
    pub indices: Vec<u32>,
    pub direction: PortDirection,
    pub enabled: bool,
    /// Source path declared by the matrix for outputs.
    pub source_path: Option<IoPath>,
    /// `source_path` resolved into the flat table.
    pub src_key: Option<IoKey>,
    pub standards: Vec<Standard>,
    pub active_standard: Option<Standard>,
    pub tico: TicoMode,
    pub multiviewer: bool,
}

impl IoData {
    /// Build the flat entry for a tree IO. Returns `None` for ports that are
    /// neither inputs nor outputs.
    pub fn from_tree(node: &Node, list_proto: &str, io: &Io, indices: &[u32]) -> Option<Self> {
        let direction = io.dir.port_direction()?;

        let key = format!("E{}_{}_{}", node.ember_id, list_proto, join_indices(indices, "."));
        let path = format!("{}/{}/{}", node.id, list_proto, join_indices(indices, "/"));
        let desc = format!("{}/{}/{}", node.name, list_proto, join_indices(indices, "/"));

        let name = if !io.name.is_empty() {
            io.name.clone()
        } else if io.is_multiviewer() {
            format!("{} MVIEW", node.name)
        } else {
            format!("{} {}", display_proto(&io.protocol), join_indices(indices, "/"))
        };

        Some(Self {
            key: IoKey(key),
            path: IoPath(path),
            desc,
            node_id: node.id.clone(),
            hw_id: node.ember_id,
            name,
            protocol: io.protocol.clone(),
            indices: indices.to_vec(),
            direction,
            enabled: io.enabled,
            source_path: io.dir.source_path().cloned(),
            src_key: None,
            standards: io.stds.clone(),
            active_standard: io.active_standard().cloned(),
            tico: io.tico_mode(),
            multiviewer: io.is_multiviewer(),
        })
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::In
    }

    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Out
    }

    pub fn display_proto(&self) -> &str {
        display_proto(&self.protocol)
    }

    /// Bandwidth of the active standard after compression.
    pub fn effective_bandwidth(&self) -> Option<f64> {
        let standard = self.active_standard.as_ref()?;
        Some(standard.bw / self.tico.divisor(&standard.name))
    }

    /// Highest bandwidth among declared standards, 0 when none are declared.
    pub fn max_bandwidth(&self) -> f64 {
        self.standards
            .iter()
            .map(|s| s.bw)
            .fold(0.0, f64::max)
    }

    /// Key under which the activity tracker reports this port, if its
    /// family carries activity telemetry.
    pub fn activity_key(&self) -> Option<String> {
        let index = *self.indices.last()?;
        activity::key_for(self.hw_id, &self.protocol, self.direction, index)
    }
}
