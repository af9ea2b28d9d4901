//! Hierarchical bandwidth limiter.
//!
//! Rate limiters form a tree: the session owns a root node, each torrent a
//! child, each peer a grandchild. A child's effective cap is the minimum of
//! its own and every honored ancestor's. Nodes live in an arena and refer
//! to each other by stable ids, so the parent/child invariants hold without
//! reference cycles.

pub mod allocator;
pub mod rate;

use slab::Slab;

use crate::clock;
use crate::peer::{Priority, WeakPeerIo};

pub use rate::{RateMeter, GRANULARITY_MS, HISTORY_SIZE};

/// Transfer direction. Indexes per-direction state on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
        }
    }
}

/// Which meter to read: all bytes, or payload bytes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedKind {
    Raw,
    Piece,
}

/// Interval used when the throttle curve samples the current rate.
const SPEED_INTERVAL_MS: u64 = 1_000;

/// Per-direction budget and meters.
#[derive(Debug, Clone)]
struct Band {
    is_limited: bool,
    honor_parent_limits: bool,
    desired_speed_bps: u64,
    bytes_left: u64,
    raw: RateMeter,
    piece: RateMeter,
}

impl Default for Band {
    fn default() -> Self {
        Self {
            is_limited: false,
            honor_parent_limits: true,
            desired_speed_bps: 0,
            bytes_left: 0,
            raw: RateMeter::new(),
            piece: RateMeter::new(),
        }
    }
}

/// Stable identifier of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One node of the limiter tree.
pub struct BandwidthNode {
    band: [Band; 2],
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    peer: Option<WeakPeerIo>,
    priority: Priority,
}

impl BandwidthNode {
    fn new(priority: Priority) -> Self {
        Self {
            band: [Band::default(), Band::default()],
            parent: None,
            children: Vec::new(),
            peer: None,
            priority,
        }
    }
}

/// Arena owning every bandwidth node.
///
/// All operations are driven from the session's event task; the web
/// transport's clamp/consumed calls go through the same guarded handle.
pub struct BandwidthTree {
    nodes: Slab<BandwidthNode>,
}

impl Default for BandwidthTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthTree {
    pub fn new() -> Self {
        Self { nodes: Slab::new() }
    }

    /// Create a node attached to `parent` (or a new root).
    pub fn create(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.insert(BandwidthNode::new(Priority::Normal)));
        if parent.is_some() {
            self.set_parent(id, parent);
        }
        id
    }

    /// Re-parent `id`, detaching it from its current parent first.
    ///
    /// Aborts if the change would make the node its own ancestor.
    pub fn set_parent(&mut self, id: NodeId, new_parent: Option<NodeId>) {
        assert!(new_parent != Some(id), "bandwidth node cannot be its own parent");

        if let Some(old) = self.nodes[id.0].parent.take() {
            self.nodes[old.0].children.retain(|c| *c != id);
        }

        if let Some(parent) = new_parent {
            let mut ancestor = Some(parent);
            while let Some(a) = ancestor {
                assert!(a != id, "bandwidth tree must stay acyclic");
                ancestor = self.nodes[a.0].parent;
            }
            debug_assert!(!self.nodes[parent.0].children.contains(&id));

            self.nodes[parent.0].children.push(id);
            self.nodes[id.0].parent = Some(parent);
        }
    }

    /// Detach `id` and return it to the arena. Children are re-rooted onto
    /// the released node's parent so they stay reachable from traversals.
    pub fn release(&mut self, id: NodeId) {
        let parent = self.nodes[id.0].parent;
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
            self.set_parent(child, parent);
        }
        self.set_parent(id, None);
        self.nodes.remove(id.0);
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn set_limit(
        &mut self,
        id: NodeId,
        dir: Direction,
        speed_bps: u64,
        enabled: bool,
        honor_parent: bool,
    ) {
        let band = &mut self.nodes[id.0].band[dir.index()];
        band.desired_speed_bps = speed_bps;
        band.is_limited = enabled;
        band.honor_parent_limits = honor_parent;
    }

    pub fn is_limited(&self, id: NodeId, dir: Direction) -> bool {
        self.nodes[id.0].band[dir.index()].is_limited
    }

    pub fn desired_speed_bps(&self, id: NodeId, dir: Direction) -> u64 {
        self.nodes[id.0].band[dir.index()].desired_speed_bps
    }

    pub fn bytes_left(&self, id: NodeId, dir: Direction) -> u64 {
        self.nodes[id.0].band[dir.index()].bytes_left
    }

    pub fn set_priority(&mut self, id: NodeId, priority: Priority) {
        self.nodes[id.0].priority = priority;
    }

    pub fn priority(&self, id: NodeId) -> Priority {
        self.nodes[id.0].priority
    }

    /// Attach the peer connection serviced by this node. The tree holds a
    /// non-owning back-reference; the peer holds the strong one.
    pub fn attach_peer(&mut self, id: NodeId, peer: WeakPeerIo) {
        self.nodes[id.0].peer = Some(peer);
    }

    pub fn detach_peer(&mut self, id: NodeId) {
        self.nodes[id.0].peer = None;
    }

    pub(crate) fn peer(&self, id: NodeId) -> Option<&WeakPeerIo> {
        self.nodes[id.0].peer.as_ref()
    }

    /// Largest byte count `<= requested` permitted at `id` and, where
    /// parent limits are honored, by every ancestor.
    ///
    /// Near the speed limit the grant is squeezed before the budget runs
    /// out: past 80% of the desired rate only 90% of the request survives,
    /// past 90% only 80%, and past 100% nothing. The rate sampled here is
    /// the raw DOWN rate for either direction, so heavy download traffic
    /// also holds back upload grants.
    pub fn clamp(&mut self, now_ms: u64, id: NodeId, dir: Direction, requested: u64) -> u64 {
        let now_ms = clock::or_now(now_ms);
        let mut granted = requested;
        let mut cursor = Some(id);

        while let Some(cur) = cursor {
            let node = &mut self.nodes[cur.0];
            let d = dir.index();

            if node.band[d].is_limited {
                granted = granted.min(node.band[d].bytes_left);

                if granted > 0 {
                    let down = Direction::Down.index();
                    let current = node.band[down].raw.speed_bps(now_ms, SPEED_INTERVAL_MS);
                    let desired = node.band[down].desired_speed_bps;
                    let r = if desired >= 1 {
                        current as f64 / desired as f64
                    } else {
                        0.0
                    };

                    if r > 1.0 {
                        granted = 0;
                    } else if r > 0.9 {
                        granted = (granted as f64 * 0.8) as u64;
                    } else if r > 0.8 {
                        granted = (granted as f64 * 0.9) as u64;
                    }
                }
            }

            if granted == 0 {
                break;
            }
            cursor = if node.band[d].honor_parent_limits {
                node.parent
            } else {
                None
            };
        }

        granted
    }

    /// Account `nbytes` moved through `id`, cascading to every ancestor.
    /// Budget is only spent on payload bytes; meters see everything.
    pub fn consumed(&mut self, now_ms: u64, id: NodeId, dir: Direction, nbytes: u64, is_piece_data: bool) {
        let now_ms = clock::or_now(now_ms);
        let mut cursor = Some(id);

        while let Some(cur) = cursor {
            let node = &mut self.nodes[cur.0];
            let band = &mut node.band[dir.index()];

            if band.is_limited && is_piece_data {
                band.bytes_left -= band.bytes_left.min(nbytes);
            }

            band.raw.record(now_ms, nbytes);
            if is_piece_data {
                band.piece.record(now_ms, nbytes);
            }

            cursor = node.parent;
        }
    }

    pub fn speed_bps(&mut self, now_ms: u64, id: NodeId, dir: Direction, kind: SpeedKind) -> u64 {
        let band = &mut self.nodes[id.0].band[dir.index()];
        let meter = match kind {
            SpeedKind::Raw => &mut band.raw,
            SpeedKind::Piece => &mut band.piece,
        };
        meter.speed_bps(now_ms, SPEED_INTERVAL_MS)
    }

    /// Refill the tick budget on one node.
    pub(crate) fn refill(&mut self, id: NodeId, dir: Direction, period_ms: u64) {
        let band = &mut self.nodes[id.0].band[dir.index()];
        if band.is_limited {
            band.bytes_left = band.desired_speed_bps * period_ms / 1000;
        }
    }
}
