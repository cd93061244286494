//! Topology flattener
//!
//! Walks each node's IO tree and produces the flat, uniquely keyed table of
//! routable ports. The table is rebuilt from scratch whenever a node is
//! added, dropped or refetched, then published as a whole.

use std::collections::HashMap;

use crate::model::{Io, IoData, IoKey, IoPath, Node, PortDirection};

/// Protocols that never appear in the table. The DANTE bus node only anchors
/// its DANTE_CH children, and GENLOCK is a sync reference with nothing to route.
const ANCHOR_PROTOCOLS: &[&str] = &["DANTE", "GENLOCK"];

/// Case-insensitive protocol substring filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoFilter {
    entries: Vec<String>,
}

impl ProtoFilter {
    /// Build from normalized or raw entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().to_uppercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Parse a comma-separated list such as `"MADI, gpi"`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn excludes(&self, protocol: &str) -> bool {
        let protocol = protocol.to_uppercase();
        self.entries.iter().any(|e| protocol.contains(e.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flat table of routable ports, in walk order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatTable {
    ios: Vec<IoData>,
    by_key: HashMap<IoKey, usize>,
    key_by_path: HashMap<IoPath, IoKey>,
}

impl FlatTable {
    pub fn get(&self, key: &str) -> Option<&IoData> {
        self.by_key.get(key).map(|&i| &self.ios[i])
    }

    pub fn key_for_path(&self, path: &str) -> Option<&IoKey> {
        self.key_by_path.get(path)
    }

    pub fn get_by_path(&self, path: &str) -> Option<&IoData> {
        self.key_for_path(path).and_then(|k| self.get(k.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoData> {
        self.ios.iter()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &IoData> {
        self.ios.iter().filter(|io| io.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &IoData> {
        self.ios.iter().filter(|io| io.is_output())
    }

    pub fn with_direction(&self, direction: PortDirection) -> impl Iterator<Item = &IoData> {
        self.ios.iter().filter(move |io| io.direction == direction)
    }

    pub fn len(&self) -> usize {
        self.ios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ios.is_empty()
    }

    fn insert(&mut self, io: IoData) {
        if let Some(&existing) = self.by_key.get(&io.key) {
            tracing::warn!(key = %io.key, "duplicate port key, keeping the later entry");
            self.key_by_path.remove(&self.ios[existing].path);
            self.key_by_path.insert(io.path.clone(), io.key.clone());
            self.ios[existing] = io;
            return;
        }

        self.by_key.insert(io.key.clone(), self.ios.len());
        self.key_by_path.insert(io.path.clone(), io.key.clone());
        self.ios.push(io);
    }

    fn resolve_sources(&mut self) {
        for io in &mut self.ios {
            io.src_key = io
                .source_path
                .as_ref()
                .and_then(|path| self.key_by_path.get(path))
                .cloned();
        }
    }
}

/// Flatten all nodes into a fresh table.
///
/// Nodes are visited by (name, id) and protocols by name, so identical input
/// always yields an identical table.
pub fn flatten<'a, I>(nodes: I, filter: &ProtoFilter) -> FlatTable
where
    I: IntoIterator<Item = &'a Node>,
{
    let mut nodes: Vec<&Node> = nodes.into_iter().collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut table = FlatTable::default();

    for node in nodes {
        let mut protos: Vec<&String> = node.ios_by_proto.keys().collect();
        protos.sort();

        for proto in protos {
            for (idx, io) in node.ios_by_proto[proto].iter().enumerate() {
                walk(&mut table, node, proto, io, idx as u32 + 1, filter);
            }
        }
    }

    table.resolve_sources();
    table
}

/// Depth-first walk of one top-level IO using an explicit stack.
fn walk(
    table: &mut FlatTable,
    node: &Node,
    list_proto: &str,
    root: &Io,
    root_index: u32,
    filter: &ProtoFilter,
) {
    let mut stack: Vec<(&Io, Vec<u32>)> = vec![(root, vec![root_index])];

    while let Some((io, indices)) = stack.pop() {
        let Some(data) = IoData::from_tree(node, list_proto, io, &indices) else {
            continue;
        };
        if !data.enabled {
            continue;
        }

        let skipped = filter.excludes(&io.protocol)
            || ANCHOR_PROTOCOLS.contains(&io.protocol.as_str());
        if !skipped {
            table.insert(data);
        }

        // Reverse so children come off the stack in declared order
        for (cidx, child) in io.children.iter().enumerate().rev() {
            let mut child_indices = indices.clone();
            child_indices.push(cidx as u32 + 1);
            stack.push((child, child_indices));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    fn stage_box() -> Node {
        node(json!({
            "id": "n-a",
            "name": "Stage Box",
            "sync_token": 1,
            "ember_id": 3,
            "ios_by_proto": {
                "SDI": [
                    {"name": "Cam 1", "en": true, "proto": "SDI", "dir": "IN",
                     "stds": [{"name": "HD", "bw": 1.5}], "stdi": 0},
                    {"name": "", "en": true, "proto": "SDI", "dir": {"OUT": [{"locked": "n-a/SDI/1"}, "HIGH"]},
                     "stds": [{"name": "HD", "bw": 1.5}, {"name": "3G", "bw": 3.0}], "stdi": 0},
                    {"name": "Spare", "en": false, "proto": "SDI", "dir": "IN"},
                    {"name": "Loop", "en": true, "proto": "SDI", "dir": "BIDIR"}
                ],
                "DANTE": [
                    {"name": "Dante bus", "en": true, "proto": "DANTE", "dir": "IN",
                     "children": [
                        {"name": "", "en": true, "proto": "DANTE_CH", "dir": "IN"},
                        {"name": "Talkback", "en": true, "proto": "DANTE_CH", "dir": "IN"}
                     ]}
                ],
                "GENLOCK": [
                    {"name": "Ref", "en": true, "proto": "GENLOCK", "dir": "IN"}
                ],
                "GPI": [
                    {"name": "", "en": true, "proto": "GPI", "dir": "IN"}
                ]
            }
        }))
    }

    fn router() -> Node {
        node(json!({
            "id": "n-b",
            "name": "Router",
            "sync_token": 9,
            "ember_id": 4,
            "ios_by_proto": {
                "SDI": [
                    {"name": "Monitor", "en": true, "proto": "SDI",
                     "dir": {"OUT": [{"unlocked": "n-a/SDI/1"}, "LOW"]}},
                    {"name": "", "en": true, "proto": "SDI",
                     "dir": {"OUT": [{"unlocked": "n-gone/SDI/1"}, "LOW"]}}
                ],
                "GPO": [
                    {"name": "", "en": true, "proto": "GPO", "dir": {"OUT": ["none", "LOW"]}}
                ]
            }
        }))
    }

    fn keys(table: &FlatTable) -> Vec<&str> {
        table.iter().map(|io| io.key.as_str()).collect()
    }

    #[test]
    fn test_flatten_keys_and_order() {
        let nodes = vec![stage_box(), router()];
        let table = flatten(&nodes, &ProtoFilter::default());

        assert_eq!(
            keys(&table),
            vec![
                "E4_GPO_1",
                "E4_SDI_1",
                "E4_SDI_2",
                "E3_DANTE_1.1",
                "E3_DANTE_1.2",
                "E3_GPI_1",
                "E3_SDI_1",
                "E3_SDI_2",
            ]
        );
    }

    #[test]
    fn test_anchor_children_kept() {
        let nodes = vec![stage_box()];
        let table = flatten(&nodes, &ProtoFilter::default());

        let ch = table.get("E3_DANTE_1.2").unwrap();
        assert_eq!(ch.protocol, "DANTE_CH");
        assert_eq!(ch.name, "Talkback");
        assert_eq!(table.get("E3_DANTE_1.1").unwrap().name, "DANTE 1/1");
        assert!(table.get("E3_DANTE_1").is_none());
        assert!(table.get("E3_GENLOCK_1").is_none());
    }

    #[test]
    fn test_skips_disabled_and_bidir() {
        let nodes = vec![stage_box()];
        let table = flatten(&nodes, &ProtoFilter::default());
        assert!(table.get("E3_SDI_3").is_none());
        assert!(table.get("E3_SDI_4").is_none());
    }

    #[test]
    fn test_source_resolution() {
        let nodes = vec![stage_box(), router()];
        let table = flatten(&nodes, &ProtoFilter::default());

        assert_eq!(
            table.get("E4_SDI_1").unwrap().src_key,
            Some(IoKey::from("E3_SDI_1"))
        );
        assert_eq!(
            table.get("E3_SDI_2").unwrap().src_key,
            Some(IoKey::from("E3_SDI_1"))
        );
        // Source on a node we no longer know about
        assert_eq!(table.get("E4_SDI_2").unwrap().src_key, None);
        assert_eq!(table.get("E4_GPO_1").unwrap().src_key, None);
    }

    #[test]
    fn test_path_index() {
        let nodes = vec![stage_box()];
        let table = flatten(&nodes, &ProtoFilter::default());
        assert_eq!(
            table.key_for_path("n-a/DANTE/1/2"),
            Some(&IoKey::from("E3_DANTE_1.2"))
        );
        assert_eq!(table.get_by_path("n-a/SDI/1").unwrap().name, "Cam 1");
    }

    #[test]
    fn test_flatten_idempotent() {
        let nodes = vec![stage_box(), router()];
        let first = flatten(&nodes, &ProtoFilter::default());
        let reversed: Vec<Node> = nodes.iter().rev().cloned().collect();
        let second = flatten(&reversed, &ProtoFilter::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_filter_removes_only_matches() {
        let nodes = vec![stage_box(), router()];
        let all = flatten(&nodes, &ProtoFilter::default());
        let filtered = flatten(&nodes, &ProtoFilter::parse("dante_ch, gp"));

        for io in all.iter() {
            let upper = io.protocol.to_uppercase();
            let excluded = upper.contains("DANTE_CH") || upper.contains("GP");
            assert_eq!(filtered.get(io.key.as_str()).is_none(), excluded, "{}", io.key);
        }
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_filter_parse() {
        let filter = ProtoFilter::parse(" madi ,, ip ");
        assert!(filter.excludes("MADI_CH"));
        assert!(filter.excludes("ip_video"));
        assert!(!filter.excludes("SDI"));
        assert!(ProtoFilter::parse("").is_empty());
        assert!(!ProtoFilter::parse(" , ").excludes("SDI"));
    }
}
