use std::sync::Arc;

use fixedbitset::FixedBitSet;
use petgraph::algo::astar;
use petgraph::graph::NodeIndex;
use petgraph::visit::{EdgeRef, NodeFiltered};
use tokio::sync::oneshot;
use tracing::debug;

use crate::general::{Micrometers, Ticks, TrainId};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox, IpcError};

use super::messages::{
    Direction, Location, Path, PathNode, Route, TrainDirection, TrainLocation,
};
use super::physics::Physics;
use super::switch::SwitchesHandle;
use super::track::components::EdgeDir;
use super::track::graph::Track;

pub const ROUTE_SERVER_NAME: &str = "route";

/// Collisions found while planning get their node blocked and the plan
/// redone, this many times.
const PLANNING_ATTEMPTS: usize = 3;

/// Safety radius around a stationary train, in micrometers.
const BLOCKED_RADIUS: Micrometers = 200_000;

/// Two trains crossing the same node closer together than this are a
/// collision.
const ALLOWABLE_OVERLAP: Ticks = 100;

/// A moving train only plans a reverse above this velocity; between
/// crawling and this the estimate is too noisy to stake a manoeuvre on.
const MIN_REVERSE_CONFIDENCE: Micrometers = 3000;

/// Reversing a fast train costs extra; scaled by current velocity.
const REVERSE_PENALTY_FACTOR: i64 = 400;

pub(crate) enum RouteRequest {
    LocationUpdate(TrainLocation),
    DirectionUpdate(TrainDirection),
    SetDestination {
        train: TrainId,
        location: Location,
        reply: oneshot::Sender<()>,
    },
    ClearDestination {
        train: TrainId,
        reply: oneshot::Sender<()>,
    },
}

struct RouteEntry {
    train: TrainId,
    destination: Option<Location>,
    direction: Direction,
    last_location: Option<TrainLocation>,
    last_path: Option<(Path, Ticks)>,
}

/// Plans a shortest path for every train with a destination, on every
/// location update, and publishes the result.
///
/// Stationary trains cast a safety radius nobody may route through; a
/// plan that would cross another train's published path too closely gets
/// the offending node blocked and is redone.
pub struct RouteServer {
    track: Arc<Track>,
    switches: SwitchesHandle,
    physics: Arc<Physics>,
    routes: Bus<Route>,
    entries: Vec<RouteEntry>,
}

impl RouteServer {
    pub fn start(
        track: Arc<Track>,
        switches: SwitchesHandle,
        physics: Arc<Physics>,
        clock: ClockHandle,
        mut locations: Subscription<TrainLocation>,
        mut direction_changes: Subscription<TrainDirection>,
    ) -> RouteHandle {
        let (ep, inbox) = ipc::channel(64);
        let routes = Bus::new(64);

        let server = RouteServer::new(track, switches, physics, routes.clone());

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(update) = locations.recv().await {
                    if ep.cast(RouteRequest::LocationUpdate(update)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(change) = direction_changes.recv().await {
                    if ep
                        .cast(RouteRequest::DirectionUpdate(change))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        tokio::spawn(server.run(inbox, clock));

        RouteHandle { ep, routes }
    }

    pub(crate) fn new(
        track: Arc<Track>,
        switches: SwitchesHandle,
        physics: Arc<Physics>,
        routes: Bus<Route>,
    ) -> Self {
        RouteServer {
            track,
            switches,
            physics,
            routes,
            entries: Vec::new(),
        }
    }

    async fn run(mut self, mut inbox: Inbox<RouteRequest>, clock: ClockHandle) {
        while let Some(request) = inbox.recv().await {
            match request {
                RouteRequest::LocationUpdate(update) => {
                    let Ok(now) = clock.time().await else { return };
                    self.handle_location(update, now);
                }
                RouteRequest::DirectionUpdate(change) => {
                    self.entry_mut(change.train).direction = change.direction;
                }
                RouteRequest::SetDestination {
                    train,
                    location,
                    reply,
                } => {
                    self.entry_mut(train).destination = Some(location);
                    let _ = reply.send(());
                }
                RouteRequest::ClearDestination { train, reply } => {
                    let entry = self.entry_mut(train);
                    entry.destination = None;
                    entry.last_path = None;
                    let _ = reply.send(());
                }
            }
        }
    }

    fn entry_mut(&mut self, train: TrainId) -> &mut RouteEntry {
        let index = match self.entries.iter().position(|e| e.train == train) {
            Some(index) => index,
            None => {
                self.entries.push(RouteEntry {
                    train,
                    destination: None,
                    direction: Direction::Forward,
                    last_location: None,
                    last_path: None,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }

    pub(crate) fn handle_location(&mut self, update: TrainLocation, now: Ticks) {
        let entry = self.entry_mut(update.train);
        entry.last_location = Some(update);
        let destination = entry.destination;
        let direction = entry.direction;

        let Some(destination) = destination else {
            return;
        };

        let path = self.plan(update.train, &update, destination, direction, now);
        if path.nodes.is_empty() {
            debug!(train = %update.train, "no route found");
        }

        self.entry_mut(update.train).last_path = Some((path.clone(), now));
        self.routes.publish(Route {
            train_location: update,
            path,
        });
    }

    fn plan(
        &self,
        train: TrainId,
        update: &TrainLocation,
        destination: Location,
        direction: Direction,
        now: Ticks,
    ) -> Path {
        let mut blocked = self.base_blocked(train);

        for _ in 0..PLANNING_ATTEMPTS {
            let forward = self
                .shortest(update.location.node, destination.node, None, &blocked)
                .and_then(|(_, nodes)| {
                    self.assemble(
                        nodes,
                        update.velocity,
                        update.location.distance_past_node,
                        None,
                    )
                });

            let reverse = if update.velocity == 0 || update.velocity > MIN_REVERSE_CONFIDENCE {
                self.reverse_plan(train, update, destination, direction, &blocked)
            } else {
                None
            };

            let chosen = match (forward, reverse) {
                (Some(forward), Some(reverse)) => {
                    let penalised =
                        reverse.total_distance + update.velocity * REVERSE_PENALTY_FACTOR;
                    if penalised < forward.total_distance {
                        reverse
                    } else {
                        forward
                    }
                }
                (Some(forward), None) => forward,
                (None, Some(reverse)) => reverse,
                (None, None) => break,
            };

            match self.first_collision(train, &chosen, now) {
                None => return chosen,
                Some(node) => {
                    debug!(train = %train, node = self.track.name(node), "path collides, replanning");
                    blocked.insert(node.index());
                    blocked.insert(self.track.reverse(node).index());
                }
            }
        }

        Path::default()
    }

    /// Every node inside a stationary train's safety radius, walked from
    /// both of its faces under current switch settings.
    fn base_blocked(&self, subject: TrainId) -> FixedBitSet {
        let mut blocked = FixedBitSet::with_capacity(self.track.node_count());
        let switches = self.switches.snapshot();

        for entry in &self.entries {
            if entry.train == subject {
                continue;
            }
            let Some(other) = &entry.last_location else {
                continue;
            };
            if other.velocity != 0 || other.acceleration_ticks != 0 {
                continue;
            }

            let node = other.location.node;
            let reverse = self.track.reverse(node);
            blocked.insert(node.index());
            blocked.insert(reverse.index());
            for within in self.track.nodes_within(node, BLOCKED_RADIUS, &switches) {
                blocked.insert(within.index());
            }
            for within in self.track.nodes_within(reverse, BLOCKED_RADIUS, &switches) {
                blocked.insert(within.index());
            }
        }

        blocked
    }

    /// Dijkstra (zero-heuristic A*) over the graph with blocked nodes
    /// filtered out. `goal_alt` lets a reverse leg stop on either face
    /// of the destination.
    fn shortest(
        &self,
        from: NodeIndex,
        goal: NodeIndex,
        goal_alt: Option<NodeIndex>,
        blocked: &FixedBitSet,
    ) -> Option<(i64, Vec<NodeIndex>)> {
        let mut goals: Vec<NodeIndex> = Vec::with_capacity(2);
        for candidate in std::iter::once(goal).chain(goal_alt) {
            if !blocked.contains(candidate.index()) {
                goals.push(candidate);
            }
        }
        if goals.is_empty() {
            return None;
        }

        let graph = self.track.graph();
        let filtered = NodeFiltered(graph, |n: NodeIndex| {
            n == from || goals.contains(&n) || !blocked.contains(n.index())
        });

        astar(
            &filtered,
            from,
            |n| goals.contains(&n),
            |edge| edge.weight().length_mm,
            |_| 0,
        )
    }

    /// Stop, flip, and route from the other face: the nodes coasted
    /// through while braking, their mirror images back, then a shortest
    /// path from the flipped start.
    fn reverse_plan(
        &self,
        train: TrainId,
        update: &TrainLocation,
        destination: Location,
        direction: Direction,
        blocked: &FixedBitSet,
    ) -> Option<Path> {
        let switches = self.switches.snapshot();
        let velocity = update.velocity;
        let start = update.location.node;
        let past = update.location.distance_past_node;

        let mut coast = vec![start];
        let mut coast_mm: i64 = 0;
        if velocity > 0 {
            let stop_target =
                past + self.physics.stopping_distance(train, velocity, direction);
            let mut current = start;
            while coast_mm * 1000 < stop_target {
                let (next, length) = self.track.next_edge(current, &switches)?;
                if blocked.contains(next.index()) {
                    return None;
                }
                coast_mm += length;
                coast.push(next);
                current = next;
                if coast.len() > self.track.node_count() {
                    return None;
                }
            }
        }
        let coast_um = coast_mm * 1000;

        let flip_from = self.track.reverse(start);
        let destination_alt = self.track.reverse(destination.node);
        let (_, tail) = self.shortest(flip_from, destination.node, Some(destination_alt), blocked)?;

        let flip_index = coast.len() - 1;
        let mut nodes = coast.clone();
        for &node in coast[1..].iter().rev() {
            nodes.push(self.track.reverse(node));
        }
        nodes.extend(tail);

        let t_flip = if velocity > 0 {
            self.physics.stopping_time(train, velocity)
        } else {
            0
        };

        let mut path = self.assemble(nodes, velocity, past, Some((flip_index, coast_um, t_flip)))?;
        path.performs_reverse = true;
        Some(path)
    }

    /// Lengths, edge labels and expected arrival offsets for a node
    /// sequence. `flip` is `(index of the node flipped at, coast
    /// distance, ticks to coast and flip)` for reverse paths; the pair
    /// across the flip seam has no connecting edge.
    fn assemble(
        &self,
        nodes: Vec<NodeIndex>,
        velocity: Micrometers,
        past: Micrometers,
        flip: Option<(usize, Micrometers, Ticks)>,
    ) -> Option<Path> {
        let graph = self.track.graph();
        let mut path_nodes = Vec::with_capacity(nodes.len());
        let mut travelled: Micrometers = 0;

        for (i, &node) in nodes.iter().enumerate() {
            let expected_arrival = match flip {
                Some((flip_index, coast_um, t_flip)) => {
                    if velocity == 0 {
                        0
                    } else if i <= flip_index {
                        ((travelled - past) / velocity).max(0)
                    } else {
                        t_flip + ((travelled - coast_um) / velocity).max(0)
                    }
                }
                None => {
                    if velocity > 0 {
                        ((travelled - past) / velocity).max(0)
                    } else {
                        0
                    }
                }
            };

            let direction = match nodes.get(i + 1) {
                Some(&next) => {
                    if flip.is_some_and(|(flip_index, _, _)| i == flip_index) {
                        // The flip seam: same physical spot, no rail
                        // between the two faces.
                        EdgeDir::Ahead
                    } else {
                        let edge = graph
                            .edges(node)
                            .filter(|e| e.target() == next)
                            .min_by_key(|e| e.weight().length_mm)?;
                        travelled += edge.weight().length_um();
                        edge.weight().dir
                    }
                }
                None => EdgeDir::Ahead,
            };

            path_nodes.push(PathNode {
                node,
                direction,
                expected_arrival,
            });
        }

        Some(Path {
            nodes: path_nodes,
            total_distance: travelled,
            performs_reverse: false,
        })
    }

    /// The first node of `path` that some other train's published path
    /// also crosses within the overlap window.
    fn first_collision(&self, train: TrainId, path: &Path, now: Ticks) -> Option<NodeIndex> {
        for path_node in &path.nodes {
            let arrival = now + path_node.expected_arrival;
            let mirror = self.track.reverse(path_node.node);

            for entry in &self.entries {
                if entry.train == train {
                    continue;
                }
                let Some((other, computed_at)) = &entry.last_path else {
                    continue;
                };
                for other_node in &other.nodes {
                    if other_node.node != path_node.node && other_node.node != mirror {
                        continue;
                    }
                    let other_arrival = computed_at + other_node.expected_arrival;
                    if (other_arrival - arrival).abs() <= ALLOWABLE_OVERLAP {
                        return Some(path_node.node);
                    }
                }
            }
        }
        None
    }
}

/// Client handle to the route server.
#[derive(Debug, Clone)]
pub struct RouteHandle {
    ep: Endpoint<RouteRequest>,
    routes: Bus<Route>,
}

impl RouteHandle {
    pub async fn set_destination(
        &self,
        train: TrainId,
        location: Location,
    ) -> Result<(), IpcError> {
        self.ep
            .call(|reply| RouteRequest::SetDestination {
                train,
                location,
                reply,
            })
            .await
    }

    pub async fn clear_destination(&self, train: TrainId) -> Result<(), IpcError> {
        self.ep
            .call(|reply| RouteRequest::ClearDestination { train, reply })
            .await
    }

    /// The planned route stream.
    pub fn routes(&self) -> Subscription<Route> {
        self.routes.subscribe()
    }
}
