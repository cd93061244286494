//! Activity tracker
//!
//! Decodes per-node activity bitmasks into the set of port addresses that
//! currently carry signal.

use std::collections::HashSet;

use crate::model::{Bitmask, IoData, IoState, NodeStatus, PortDirection};

/// One telemetry family: which bitmask, which protocol, how many ports.
struct Family {
    protocol: &'static str,
    /// Set for families that share an index range between directions.
    direction: Option<PortDirection>,
    ports: u32,
    mask: fn(&IoState) -> Option<&Bitmask>,
}

const FAMILIES: &[Family] = &[
    Family { protocol: "SDI", direction: None, ports: 24, mask: |s| s.sdi.as_ref() },
    Family { protocol: "ANALO_IN", direction: None, ports: 16, mask: |s| s.analog_in.as_ref() },
    Family { protocol: "ANALO_OUT", direction: None, ports: 16, mask: |s| s.analog_out.as_ref() },
    Family { protocol: "GPI", direction: None, ports: 8, mask: |s| s.gpi.as_ref() },
    Family { protocol: "GPO", direction: None, ports: 8, mask: |s| s.gpo.as_ref() },
    Family { protocol: "MADI_CH", direction: Some(PortDirection::In), ports: 64, mask: |s| s.madi_in.as_ref() },
    Family { protocol: "MADI_CH", direction: Some(PortDirection::Out), ports: 64, mask: |s| s.madi_out.as_ref() },
    Family { protocol: "DANTE_CH", direction: Some(PortDirection::In), ports: 64, mask: |s| s.dante_in.as_ref() },
    Family { protocol: "DANTE_CH", direction: Some(PortDirection::Out), ports: 64, mask: |s| s.dante_out.as_ref() },
];

fn is_two_directional(protocol: &str) -> bool {
    FAMILIES
        .iter()
        .any(|f| f.protocol == protocol && f.direction.is_some())
}

fn has_telemetry(protocol: &str) -> bool {
    FAMILIES.iter().any(|f| f.protocol == protocol)
}

fn format_key(hw_id: u64, protocol: &str, direction: Option<PortDirection>, index: u32) -> String {
    match direction {
        Some(dir) => format!("E{}_{}_{}_{}", hw_id, protocol, dir, index),
        None => format!("E{}_{}_{}", hw_id, protocol, index),
    }
}

/// Activity key of a port, or `None` if its protocol reports no activity.
///
/// For single-direction families this equals the flat key of top-level
/// port `index`; MADI and DANTE channels fold in the direction.
pub fn key_for(hw_id: u64, protocol: &str, direction: PortDirection, index: u32) -> Option<String> {
    if !has_telemetry(protocol) {
        return None;
    }
    let direction = is_two_directional(protocol).then_some(direction);
    Some(format_key(hw_id, protocol, direction, index))
}

/// Decode a bitmask into `ports` booleans; entry 0 is port 1.
///
/// Bit n of chunk k describes port 32k + n + 1. Missing chunks read as idle.
pub fn decode(mask: &Bitmask, ports: u32) -> Vec<bool> {
    (0..ports)
        .map(|i| match mask {
            Bitmask::Single(bits) => i < 64 && bits & (1u64 << i) != 0,
            Bitmask::Chunks(chunks) => chunks
                .get((i / 32) as usize)
                .map(|chunk| chunk & (1u32 << (i % 32)) != 0)
                .unwrap_or(false),
        })
        .collect()
}

/// Set of activity keys currently carrying signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySet {
    active: HashSet<String>,
}

impl ActivitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh set from a poll's worth of node telemetry.
    pub fn from_statuses<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a NodeStatus)>,
    {
        let mut set = Self::new();
        for (hw_id, status) in statuses {
            if let Some(state) = &status.io_state {
                set.update(hw_id, state);
            }
        }
        set
    }

    /// Rewrite every family present in `state` for node `hw_id`.
    ///
    /// Each reported family replaces its whole index range; families absent
    /// from `state` keep their previous entries.
    pub fn update(&mut self, hw_id: u64, state: &IoState) {
        for family in FAMILIES {
            let Some(mask) = (family.mask)(state) else {
                continue;
            };

            for (i, active) in decode(mask, family.ports).into_iter().enumerate() {
                let key = format_key(hw_id, family.protocol, family.direction, i as u32 + 1);
                if active {
                    self.active.insert(key);
                } else {
                    self.active.remove(&key);
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    /// Whether a flat-table port currently carries signal.
    pub fn is_io_active(&self, io: &IoData) -> bool {
        io.activity_key()
            .map(|key| self.contains(&key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }
}
