use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

use crate::general::Micrometers;

use super::components::{EdgeDir, NodeKind, Sensor, SwitchDirection, SwitchTable, TrackEdge, TrackNode};

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum TrackError {
    #[error("sensor is not on this track")]
    UnknownSensor,
    #[error("no node of the requested kind ahead")]
    NothingAhead,
    #[error("destination not reachable along current switch settings")]
    Unreachable,
}

/// The immutable track graph.
///
/// Nodes and edges live in a petgraph arena; every cross-reference,
/// including the `reverse` relation, is a [`NodeIndex`]. Built once at
/// startup by [`super::build::TrackBuilder`] and shared read-only.
#[derive(Debug)]
pub struct Track {
    graph: DiGraph<TrackNode, TrackEdge>,
    sensors: HashMap<usize, NodeIndex>,
}

impl Track {
    pub(super) fn new(
        graph: DiGraph<TrackNode, TrackEdge>,
        sensors: HashMap<usize, NodeIndex>,
    ) -> Self {
        Track { graph, sensors }
    }

    pub fn graph(&self) -> &DiGraph<TrackNode, TrackEdge> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, index: NodeIndex) -> &TrackNode {
        &self.graph[index]
    }

    pub fn kind(&self, index: NodeIndex) -> NodeKind {
        self.graph[index].kind
    }

    pub fn name(&self, index: NodeIndex) -> &str {
        &self.graph[index].name
    }

    /// The same physical spot, traversed the other way.
    pub fn reverse(&self, index: NodeIndex) -> NodeIndex {
        self.graph[index].reverse
    }

    pub fn find_sensor(&self, sensor: &Sensor) -> Option<NodeIndex> {
        self.sensors.get(&sensor.index()).copied()
    }

    /// The sensor identity of a sensor node.
    pub fn sensor_at(&self, index: NodeIndex) -> Option<Sensor> {
        let node = &self.graph[index];
        match node.kind {
            NodeKind::Sensor => Sensor::from_index(node.num as usize),
            _ => None,
        }
    }

    /// The outgoing edge labelled `dir`, as `(destination, length in mm)`.
    pub fn edge_in_direction(
        &self,
        index: NodeIndex,
        dir: EdgeDir,
    ) -> Option<(NodeIndex, i64)> {
        self.graph
            .edges(index)
            .find(|edge| edge.weight().dir == dir)
            .map(|edge| (edge.target(), edge.weight().length_mm))
    }

    /// The edge a train actually takes out of `index` under the given
    /// switch settings. `None` at an exit, or when a branch's switch
    /// number is off the table.
    pub fn next_edge(
        &self,
        index: NodeIndex,
        switches: &SwitchTable,
    ) -> Option<(NodeIndex, i64)> {
        let node = &self.graph[index];
        match node.kind {
            NodeKind::Exit => None,
            NodeKind::Branch => {
                let dir = match switches.get(node.num)? {
                    SwitchDirection::Straight => EdgeDir::Straight,
                    SwitchDirection::Curved => EdgeDir::Curved,
                };
                self.edge_in_direction(index, dir)
            }
            _ => self.edge_in_direction(index, EdgeDir::Ahead),
        }
    }

    pub fn next_node(&self, index: NodeIndex, switches: &SwitchTable) -> Option<NodeIndex> {
        self.next_edge(index, switches).map(|(dest, _)| dest)
    }

    fn find_next_of_kind(
        &self,
        index: NodeIndex,
        kind: NodeKind,
        switches: &SwitchTable,
    ) -> Result<NodeIndex, TrackError> {
        let mut current = self
            .next_node(index, switches)
            .ok_or(TrackError::NothingAhead)?;

        for _ in 0..self.graph.node_count() {
            if self.graph[current].kind == kind {
                return Ok(current);
            }
            match self.next_node(current, switches) {
                Some(next) => current = next,
                None => return Err(TrackError::NothingAhead),
            }
        }

        // Walked a full cycle without finding one.
        Err(TrackError::NothingAhead)
    }

    /// The next sensor a train leaving `index` will trip, following the
    /// current switch settings.
    pub fn find_next_sensor(
        &self,
        index: NodeIndex,
        switches: &SwitchTable,
    ) -> Result<NodeIndex, TrackError> {
        self.find_next_of_kind(index, NodeKind::Sensor, switches)
    }

    /// The next branch ahead of `index` under the current switch
    /// settings.
    pub fn find_next_branch(
        &self,
        index: NodeIndex,
        switches: &SwitchTable,
    ) -> Result<NodeIndex, TrackError> {
        self.find_next_of_kind(index, NodeKind::Branch, switches)
    }

    /// Distance in micrometers from `from` to `to` walking the current
    /// switch settings. Fails if the walk reaches an exit or wraps back
    /// to `from` first.
    pub fn distance_between(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        switches: &SwitchTable,
    ) -> Result<Micrometers, TrackError> {
        let (mut current, first_len) =
            self.next_edge(from, switches).ok_or(TrackError::Unreachable)?;
        let mut total_mm = first_len;

        while current != from && current != to {
            match self.next_edge(current, switches) {
                Some((next, len)) => {
                    current = next;
                    total_mm += len;
                }
                None => return Err(TrackError::Unreachable),
            }
        }

        if current == to {
            Ok(total_mm * 1000)
        } else {
            Err(TrackError::Unreachable)
        }
    }

    /// All nodes within `radius` micrometers ahead of `from` under the
    /// current switch settings, `from` excluded.
    pub fn nodes_within(
        &self,
        from: NodeIndex,
        radius: Micrometers,
        switches: &SwitchTable,
    ) -> Vec<NodeIndex> {
        let mut nodes = Vec::new();
        let mut current = from;
        let mut travelled: Micrometers = 0;

        while let Some((next, len)) = self.next_edge(current, switches) {
            travelled += len * 1000;
            if travelled > radius || next == from {
                break;
            }
            nodes.push(next);
            current = next;
        }

        nodes
    }
}
