use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

use super::components::{EdgeDir, NodeKind, Sensor, TrackEdge, TrackNode};
use super::graph::Track;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TrackBuildError {
    #[error("`{0}` is not a valid sensor name")]
    BadSensorName(String),
    #[error("sensor {0} appears twice")]
    DuplicateSensor(String),
    #[error("node {0}: {1}")]
    BadTopology(String, &'static str),
}

/// Builds a [`Track`].
///
/// Every physical spot is added as a pair of nodes, one per direction of
/// travel, wired as each other's `reverse`. [`TrackBuilder::link`]
/// connects plain rail in both directions at once; branch legs and the
/// edges mirroring them are laid individually with
/// [`TrackBuilder::connect`].
///
/// ```
/// use trackpilot::control::track::build::TrackBuilder;
/// use trackpilot::control::track::components::SwitchTable;
///
/// let mut builder = TrackBuilder::new();
/// let (a1, _) = builder.sensor_pair("A1", "A2").unwrap();
/// let (b1, _) = builder.sensor_pair("B1", "B2").unwrap();
/// builder.link(a1, b1, 250);
/// builder.link(b1, a1, 250);
/// let track = builder.build().unwrap();
///
/// let next = track.find_next_sensor(a1, &SwitchTable::default()).unwrap();
/// assert_eq!(track.name(next), "B1");
/// ```
#[derive(Debug, Default)]
pub struct TrackBuilder {
    graph: DiGraph<TrackNode, TrackEdge>,
    sensors: HashMap<usize, NodeIndex>,
}

impl TrackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_pair(
        &mut self,
        forward: TrackNode,
        reverse: TrackNode,
    ) -> (NodeIndex, NodeIndex) {
        let fwd = self.graph.add_node(forward);
        let rev = self.graph.add_node(reverse);
        self.graph[fwd].reverse = rev;
        self.graph[rev].reverse = fwd;
        (fwd, rev)
    }

    /// Adds one physical sensor contact as its two directional nodes.
    pub fn sensor_pair(
        &mut self,
        forward: &str,
        reverse: &str,
    ) -> Result<(NodeIndex, NodeIndex), TrackBuildError> {
        let make = |name: &str| -> Result<TrackNode, TrackBuildError> {
            let sensor = Sensor::parse(name)
                .ok_or_else(|| TrackBuildError::BadSensorName(name.to_owned()))?;
            Ok(TrackNode {
                name: name.to_owned(),
                kind: NodeKind::Sensor,
                num: sensor.index() as u16,
                reverse: NodeIndex::end(),
            })
        };

        let fwd_node = make(forward)?;
        let rev_node = make(reverse)?;
        for node in [&fwd_node, &rev_node] {
            if self.sensors.contains_key(&(node.num as usize)) {
                return Err(TrackBuildError::DuplicateSensor(node.name.clone()));
            }
        }

        let fwd_num = fwd_node.num as usize;
        let rev_num = rev_node.num as usize;
        let (fwd, rev) = self.add_pair(fwd_node, rev_node);
        self.sensors.insert(fwd_num, fwd);
        self.sensors.insert(rev_num, rev);
        Ok((fwd, rev))
    }

    /// Adds one turnout as `(branch, merge)`: the branch faces the
    /// direction in which the track forks, the merge is the same spot
    /// from the other side.
    pub fn switch(&mut self, num: u16) -> (NodeIndex, NodeIndex) {
        self.add_pair(
            TrackNode {
                name: format!("BR{num}"),
                kind: NodeKind::Branch,
                num,
                reverse: NodeIndex::end(),
            },
            TrackNode {
                name: format!("MR{num}"),
                kind: NodeKind::Merge,
                num,
                reverse: NodeIndex::end(),
            },
        )
    }

    /// Adds one end of track as `(enter, exit)`.
    pub fn gate(&mut self, name: &str) -> (NodeIndex, NodeIndex) {
        let (exit, enter) = self.add_pair(
            TrackNode {
                name: format!("EX{name}"),
                kind: NodeKind::Exit,
                num: 0,
                reverse: NodeIndex::end(),
            },
            TrackNode {
                name: format!("EN{name}"),
                kind: NodeKind::Enter,
                num: 0,
                reverse: NodeIndex::end(),
            },
        );
        (enter, exit)
    }

    /// Lays a single directed edge.
    pub fn connect(&mut self, from: NodeIndex, to: NodeIndex, length_mm: i64, dir: EdgeDir) {
        self.graph.add_edge(from, to, TrackEdge { dir, length_mm });
    }

    /// Lays plain rail in both directions: `from -> to` and the mirror
    /// edge `to.reverse -> from.reverse`, both labelled ahead.
    pub fn link(&mut self, from: NodeIndex, to: NodeIndex, length_mm: i64) {
        let from_rev = self.graph[from].reverse;
        let to_rev = self.graph[to].reverse;
        self.connect(from, to, length_mm, EdgeDir::Ahead);
        self.connect(to_rev, from_rev, length_mm, EdgeDir::Ahead);
    }

    /// Validates the topology and freezes the track.
    pub fn build(self) -> Result<Track, TrackBuildError> {
        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let fail = |reason| Err(TrackBuildError::BadTopology(node.name.clone(), reason));

            let reverse = node.reverse;
            if reverse == index || self.graph.node_weight(reverse).is_none() {
                return fail("reverse does not point at another node");
            }
            if self.graph[reverse].reverse != index {
                return fail("reverse is not an involution");
            }

            let dirs: Vec<EdgeDir> =
                self.graph.edges(index).map(|e| e.weight().dir).collect();
            match node.kind {
                NodeKind::Exit => {
                    if !dirs.is_empty() {
                        return fail("exit must have no outgoing edges");
                    }
                }
                NodeKind::Branch => {
                    if dirs.len() != 2
                        || !dirs.contains(&EdgeDir::Straight)
                        || !dirs.contains(&EdgeDir::Curved)
                    {
                        return fail("branch needs exactly a straight and a curved leg");
                    }
                }
                _ => {
                    if dirs != [EdgeDir::Ahead] {
                        return fail("node needs exactly one ahead edge");
                    }
                }
            }
        }

        Ok(Track::new(self.graph, self.sensors))
    }
}
