//! Per-tick bandwidth allocation.
//!
//! Every `period_ms` the session refills budgets across the tree and walks
//! the attached peers in priority-fair order. Phase one hands small fixed
//! increments to randomly picked peers so fast peers cannot starve the
//! rest; phase two re-enables on-demand I/O for anyone with budget left.

use std::sync::Mutex;

use rand::Rng;
use tracing::trace;

use crate::bandwidth::{BandwidthTree, Direction, NodeId};
use crate::peer::{Priority, SharedPeerIo};

/// Default interval between allocator ticks.
pub const DEFAULT_PERIOD_MS: u64 = 500;

/// Bytes handed to a peer per phase-one visit. Sized so a full uTP frame
/// goes out right away with enough buffered for the next one.
const INCREMENT: usize = 3_000;

/// Run one allocation tick for `dir` against the subtree rooted at `root`.
///
/// The tree lock is held only for the refill/collection pass; peer methods
/// are invoked afterwards so implementations are free to take the tree
/// lock themselves inside `flush`.
pub fn allocate(tree: &Mutex<BandwidthTree>, root: NodeId, dir: Direction, period_ms: u64) {
    let collected: Vec<(SharedPeerIo, Priority)> = {
        let mut guard = tree.lock().unwrap();
        let mut out = Vec::new();
        collect(&mut guard, root, Priority::Low, dir, period_ms, &mut out);
        out
    };

    let mut high = Vec::new();
    let mut normal = Vec::new();
    let mut low = Vec::new();

    // Stamp folded priorities, push protocol messages, and build the three
    // dispatch pools. A high-priority peer competes in every pool.
    for (peer, priority) in &collected {
        {
            let mut io = peer.lock().unwrap();
            io.set_priority(*priority);
            io.flush_outgoing_protocol();
        }
        match *priority {
            Priority::High => {
                high.push(peer.clone());
                normal.push(peer.clone());
                low.push(peer.clone());
            }
            Priority::Normal => {
                normal.push(peer.clone());
                low.push(peer.clone());
            }
            Priority::Low => low.push(peer.clone()),
        }
    }

    phase_one(&mut high, dir);
    phase_one(&mut normal, dir);
    phase_one(&mut low, dir);

    // Phase two: on-demand I/O for peers with budget to burn, until the
    // next tick starts over.
    for (peer, _) in &collected {
        let mut io = peer.lock().unwrap();
        let left = io.has_bandwidth_left(dir);
        io.set_enabled(dir, left);
    }
}

/// Refill budgets below `id` and collect attached peers with the
/// max-folded priority of their ancestry.
fn collect(
    tree: &mut BandwidthTree,
    id: NodeId,
    parent_priority: Priority,
    dir: Direction,
    period_ms: u64,
    out: &mut Vec<(SharedPeerIo, Priority)>,
) {
    let priority = parent_priority.max(tree.priority(id));
    tree.refill(id, dir, period_ms);

    if let Some(peer) = tree.peer(id).and_then(|weak| weak.upgrade()) {
        out.push((peer, priority));
    }

    for child in tree.children(id).to_vec() {
        collect(tree, child, priority, dir, period_ms, out);
    }
}

/// Distribute bandwidth fairly: pick a peer uniformly at random from the
/// active prefix, hand it one increment, and retire it to the tail once it
/// flushes less than a full increment.
fn phase_one(pool: &mut [SharedPeerIo], dir: Direction) {
    trace!(peers = pool.len(), ?dir, "phase-one dispatch");

    let mut rng = rand::thread_rng();
    let mut n = pool.len();
    while n > 0 {
        let i = rng.gen_range(0..n);
        let used = pool[i].lock().unwrap().flush(dir, INCREMENT);
        if used != INCREMENT {
            pool.swap(i, n - 1);
            n -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerIo;
    use std::sync::Arc;

    /// Peer that pulls real permission from its bandwidth node.
    struct TreePeer {
        tree: Arc<Mutex<BandwidthTree>>,
        node: NodeId,
        received: u64,
        flush_calls: u32,
        protocol_flushes: u32,
        priority: Priority,
        enabled: [Option<bool>; 2],
    }

    impl TreePeer {
        fn spawn(
            tree: &Arc<Mutex<BandwidthTree>>,
            parent: NodeId,
            priority: Priority,
        ) -> (SharedPeerIo, Arc<Mutex<TreePeer>>) {
            let node = {
                let mut t = tree.lock().unwrap();
                let id = t.create(Some(parent));
                t.set_priority(id, priority);
                id
            };
            let peer = Arc::new(Mutex::new(TreePeer {
                tree: tree.clone(),
                node,
                received: 0,
                flush_calls: 0,
                protocol_flushes: 0,
                priority: Priority::Normal,
                enabled: [None, None],
            }));
            let shared: SharedPeerIo = peer.clone();
            tree.lock().unwrap().attach_peer(node, Arc::downgrade(&shared));
            (shared, peer)
        }
    }

    impl PeerIo for TreePeer {
        fn flush(&mut self, dir: Direction, max_bytes: usize) -> usize {
            self.flush_calls += 1;
            let granted = {
                let mut t = self.tree.lock().unwrap();
                let g = t.clamp(0, self.node, dir, max_bytes as u64);
                if g > 0 {
                    t.consumed(0, self.node, dir, g, true);
                }
                g
            };
            self.received += granted;
            granted as usize
        }

        fn has_bandwidth_left(&self, dir: Direction) -> bool {
            let mut t = self.tree.lock().unwrap();
            t.clamp(0, self.node, dir, 1) > 0
        }

        fn set_enabled(&mut self, dir: Direction, enabled: bool) {
            self.enabled[match dir {
                Direction::Up => 0,
                Direction::Down => 1,
            }] = Some(enabled);
        }

        fn flush_outgoing_protocol(&mut self) {
            self.protocol_flushes += 1;
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn set_priority(&mut self, priority: Priority) {
            self.priority = priority;
        }
    }

    fn limited_root(tree: &Arc<Mutex<BandwidthTree>>, bps: u64) -> NodeId {
        let mut t = tree.lock().unwrap();
        let root = t.create(None);
        t.set_limit(root, Direction::Down, bps, true, true);
        root
    }

    #[test]
    fn one_tick_splits_a_limited_root_roughly_evenly() {
        // 2 MB/s over a 500 ms tick: a 1 MB budget, dispatched entirely in
        // full increments so the whole tick is spent in phase one.
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = limited_root(&tree, 2_000_000);
        let (_sa, a) = TreePeer::spawn(&tree, root, Priority::Normal);
        let (_sb, b) = TreePeer::spawn(&tree, root, Priority::Normal);

        allocate(&tree, root, Direction::Down, 500);

        let got_a = a.lock().unwrap().received;
        let got_b = b.lock().unwrap().received;
        assert_eq!(got_a + got_b, 1_000_000);
        for got in [got_a, got_b] {
            assert!(got >= 400_000 && got <= 600_000, "share {got}");
        }
    }

    #[test]
    fn high_priority_peer_gets_the_tick_budget_first() {
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = limited_root(&tree, 6_000);
        let (_sh, high) = TreePeer::spawn(&tree, root, Priority::High);
        let (_sl, low) = TreePeer::spawn(&tree, root, Priority::Low);

        allocate(&tree, root, Direction::Down, 1_000);

        assert!(high.lock().unwrap().received >= 3_000);
        assert_eq!(low.lock().unwrap().received, 0);
    }

    #[test]
    fn peers_compete_in_pools_matching_their_priority() {
        // With a zero budget every flush returns 0, so each pool visits a
        // member exactly once: visit counts expose pool membership.
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = limited_root(&tree, 0);
        let (_sh, high) = TreePeer::spawn(&tree, root, Priority::High);
        let (_sn, normal) = TreePeer::spawn(&tree, root, Priority::Normal);
        let (_sl, low) = TreePeer::spawn(&tree, root, Priority::Low);

        allocate(&tree, root, Direction::Down, 1_000);

        assert_eq!(high.lock().unwrap().flush_calls, 3);
        assert_eq!(normal.lock().unwrap().flush_calls, 2);
        assert_eq!(low.lock().unwrap().flush_calls, 1);
    }

    #[test]
    fn folded_priority_is_stamped_onto_the_peer() {
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = limited_root(&tree, 0);
        let torrent = {
            let mut t = tree.lock().unwrap();
            let id = t.create(Some(root));
            t.set_priority(id, Priority::High);
            id
        };
        let (_s, peer) = TreePeer::spawn(&tree, torrent, Priority::Normal);

        allocate(&tree, root, Direction::Down, 1_000);

        assert_eq!(peer.lock().unwrap().priority, Priority::High);
        assert_eq!(peer.lock().unwrap().protocol_flushes, 1);
    }

    #[test]
    fn phase_two_enables_peers_with_leftover_budget() {
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = {
            let mut t = tree.lock().unwrap();
            t.create(None)
        };
        // `broke` sits under an exhausted limiter, `rich` under an open one
        let strapped = {
            let mut t = tree.lock().unwrap();
            let id = t.create(Some(root));
            t.set_limit(id, Direction::Down, 0, true, true);
            id
        };
        let (_sa, broke) = TreePeer::spawn(&tree, strapped, Priority::Normal);
        let (_sb, rich) = TreePeer::spawn(&tree, root, Priority::Normal);

        allocate(&tree, root, Direction::Down, 1_000);

        assert_eq!(broke.lock().unwrap().enabled[1], Some(false));
        assert_eq!(rich.lock().unwrap().enabled[1], Some(true));
    }

    #[test]
    fn dropped_peers_are_skipped() {
        let tree = Arc::new(Mutex::new(BandwidthTree::new()));
        let root = limited_root(&tree, 10_000);
        let (shared, peer) = TreePeer::spawn(&tree, root, Priority::Normal);
        drop(shared);
        drop(peer);

        // the weak back-reference is dead; the tick must not panic
        allocate(&tree, root, Direction::Down, 1_000);
    }
}
