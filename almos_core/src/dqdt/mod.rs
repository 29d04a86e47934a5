//! The Distributed Quaternary Decision Tree: a 4-ary hierarchy of
//! per-cluster summaries used to place threads, tasks and memory requests
//! without a central scheduler.
//!
//! Grounded on `kern/dqdt.c` throughout. Every leaf node is a cluster; every
//! internal node holds the fold of up to four children. Only the cluster
//! that owns a leaf may write that leaf's summary (§3); parents only ever
//! read the child slots their own `update` call wrote.

use alloc::{sync::Arc, vec::Vec};

use crate::{collections::ArcSwap, config, memory::ppm::ClusterMemoryStats};

/// A cluster or aggregate-node summary: free pages, live thread count, and
/// average utilization, exactly the fields `dqdt_update` folds bottom-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Free pages across the subtree (`M`).
    pub free_pages: u64,
    /// Live thread count across the subtree (`T`).
    pub thread_count: u32,
    /// Average utilization, 0..100 (`U`).
    pub utilization: u8,
    /// Free blocks per buddy order, summed across the subtree.
    pub stats: ClusterMemoryStats,
}

impl Summary {
    /// The all-idle, fully-free summary a freshly booted leaf starts with.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            free_pages: 0,
            thread_count: 0,
            utilization: 0,
            stats: ClusterMemoryStats {
                pages_tbl: [0; config::MAX_ORDER],
            },
        }
    }

    /// Folds two child summaries into their parent's: sum of `M`/`T`, a
    /// population-weighted-by-cluster-count average of `U` (matching the
    /// original's plain arithmetic mean of the four children), and a
    /// per-order sum of free-block counts.
    #[must_use]
    pub fn fold(&self, other: &Self) -> Self {
        Self {
            free_pages: self.free_pages + other.free_pages,
            thread_count: self.thread_count + other.thread_count,
            utilization: (((u32::from(self.utilization) + u32::from(other.utilization)) / 2)
                as u8)
                .min(100),
            stats: self.stats.fold(&other.stats),
        }
    }
}

/// Manhattan vs. random distance, the two distance metrics `dqdt_distance`
/// supports when ordering children of a down-traversal scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// `|x1-x2| + |y1-y2|` over each child's home-leaf mesh coordinates.
    Manhattan,
    /// An arbitrary (pseudo-random) order, used when locality doesn't matter.
    Random,
}

/// A small xorshift PRNG seeded per-CPU, used only by [`DistanceMetric::Random`].
///
/// A hand-rolled generator is used here rather than pulling in `rand` as a
/// runtime dependency, since exactly one call site (`dqdt_distance`'s random
/// branch) needs randomness and `rand` remains a dev-only dependency.
#[derive(Debug, Clone, Copy)]
pub struct Xorshift32(u32);

impl Xorshift32 {
    /// Seeds the generator; a zero seed is replaced with a fixed non-zero value since xorshift
    /// cannot escape the all-zero state.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0x9e37_79b9 } else { seed })
    }

    /// Returns the next pseudo-random value and advances the generator.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// This leaf's position in the cluster mesh, for [`DistanceMetric::Manhattan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshCoord {
    pub x: i32,
    pub y: i32,
}

fn distance(a: MeshCoord, b: MeshCoord, metric: DistanceMetric, rng: &mut Xorshift32) -> u32 {
    match metric {
        DistanceMetric::Manhattan => a.x.abs_diff(b.x) + a.y.abs_diff(b.y),
        DistanceMetric::Random => rng.next_u32(),
    }
}

/// A node in the DQDT: a leaf (one cluster) or an internal aggregate of up
/// to four children. Child slots are [`ArcSwap`] cells so only the owning
/// cluster ever writes a given slot, matching the "only the cluster that
/// owns a leaf may write that leaf's summary" invariant.
pub struct Node {
    /// `None` for internal nodes; the home leaf's mesh coordinates otherwise.
    pub home: Option<MeshCoord>,
    children: Vec<Arc<Node>>,
    summary: ArcSwap<Summary>,
}

impl Node {
    /// Creates a leaf node at the given mesh coordinates.
    #[must_use]
    pub fn leaf(home: MeshCoord) -> Self {
        Self {
            home: Some(home),
            children: Vec::new(),
            summary: ArcSwap::new(Arc::new(Summary::empty())),
        }
    }

    /// Creates an internal node over up to four children.
    #[must_use]
    pub fn internal(children: Vec<Arc<Node>>) -> Self {
        debug_assert!(children.len() <= 4, "DQDT nodes are at most 4-ary");
        Self {
            home: None,
            children,
            summary: ArcSwap::new(Arc::new(Summary::empty())),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.home.is_some()
    }

    #[must_use]
    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    /// The current summary for this node.
    #[must_use]
    pub fn summary(&self) -> Summary {
        *self.summary.load()
    }

    /// Overwrites this leaf's own summary. Only ever called by the CPU local to this cluster.
    pub fn set_leaf_summary(&self, summary: Summary) {
        debug_assert!(self.is_leaf());
        self.summary.swap(Arc::new(summary));
    }

    /// Recomputes this node's summary as the fold of its children, and returns it. Call
    /// bottom-up: children must already be updated.
    pub fn refold(&self) -> Summary {
        let folded = self
            .children
            .iter()
            .map(|c| c.summary())
            .reduce(|a, b| a.fold(&b))
            .unwrap_or_else(Summary::empty);
        self.summary.swap(Arc::new(folded));
        folded
    }
}

/// Attributes threaded through a placement traversal: the distance metric to sort children by,
/// and the thresholds a `child_select`/`clstr_select` pair checks against.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub metric: DistanceMetric,
    pub u_threshold: u8,
    pub t_threshold: u32,
    pub m_threshold: u64,
}

/// `dqdt_up_traversal`: walks from `start` towards the root, stopping at the first ancestor for
/// which `clstr_select` returns true (or the root, if none do), then descends via
/// [`down_traversal`].
pub fn up_traversal<'a>(
    start: &'a Arc<Node>,
    path_to_root: &[&'a Arc<Node>],
    attr: &Attr,
    clstr_select: impl Fn(&Node, &Attr) -> bool,
    child_select: impl Fn(&Node, &Attr) -> bool + Copy,
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    let mut ancestor = start;
    for next in path_to_root {
        if clstr_select(ancestor, attr) {
            break;
        }
        ancestor = next;
    }
    down_traversal(ancestor, attr, child_select, rng)
}

/// `dqdt_down_traversal`: scans `node`'s children in distance order, recursing into the first
/// one `child_select` accepts; on a leaf, the leaf itself is the answer.
pub fn down_traversal(
    node: &Node,
    attr: &Attr,
    child_select: impl Fn(&Node, &Attr) -> bool + Copy,
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    if node.is_leaf() {
        return node.home;
    }
    let mut candidates: Vec<&Arc<Node>> = node.children().iter().filter(|c| child_select(c, attr)).collect();
    let home = node.home.unwrap_or_default();
    candidates.sort_by_key(|c| {
        let child_home = c.home.or_else(|| c.children().first().and_then(|gc| gc.home));
        distance(home, child_home.unwrap_or_default(), attr.metric, rng)
    });
    for child in candidates {
        if let Some(result) = down_traversal(child, attr, child_select, rng) {
            return Some(result);
        }
    }
    None
}

/// `dqdt_cpu_free_select`: the subtree has an idle CPU and is below the busy threshold.
#[must_use]
pub fn cpu_free_select(node: &Node, attr: &Attr) -> bool {
    node.summary().utilization <= attr.u_threshold && node.summary().thread_count <= attr.t_threshold
}

/// `dqdt_cpu_min_usage_select`: the weakest-utilization subtree that still clears `t_threshold`.
#[must_use]
pub fn cpu_min_usage_select(node: &Node, attr: &Attr) -> bool {
    node.summary().utilization <= attr.u_threshold
}

/// `dqdt_mem_select`: some order at or above the request exists, and the subtree's total free
/// memory clears the threshold.
#[must_use]
pub fn mem_select(node: &Node, attr: &Attr, min_order: usize) -> bool {
    node.summary().stats.has_block_at_or_above(min_order) && node.summary().free_pages >= attr.m_threshold
}

/// `dqdt_thread_placement`'s threshold schedule (§4.6.1): try a free CPU tightly bounded, then
/// progressively relax to the least-loaded CPU as `u_threshold` climbs.
#[must_use]
pub fn thread_placement_schedule() -> Vec<(u8, u32, bool)> {
    let mut schedule = alloc::vec![(98, 2, true)];
    for u in [10, 30, 50, 70, 90] {
        schedule.push((u, 2, false));
    }
    schedule
}

/// `dqdt_thread_migrate`'s threshold schedule (§4.6.1).
#[must_use]
pub fn thread_migrate_schedule() -> Vec<(u8, bool)> {
    [20, 40, 60, 80, 100]
        .into_iter()
        .map(|t| (t, t == 20 || t == 70))
        .collect()
}

/// `dqdt_task_placement`'s threshold schedule (§4.6.1): `M` halves at 55 and 70, `t_threshold`
/// relaxes to 10 only on the final, most permissive attempt.
#[must_use]
pub fn task_placement_schedule(base_m: u64) -> Vec<(u8, u64, u32)> {
    let mut m = base_m;
    [10u8, 25, 40, 55, 70, 85, 100]
        .into_iter()
        .map(|u| {
            if u == 55 || u == 70 {
                m /= 2;
            }
            let t = if u == 100 { 10 } else { 2 };
            (u, m, t)
        })
        .collect()
}

/// `dqdt_thread_placement`: walks [`thread_placement_schedule`]'s progressively looser
/// thresholds, returning the first cluster an `up_traversal` accepts. Falls back to `start`'s
/// own leaf if every threshold in the schedule is exhausted (the schedule's last entry has
/// `u_threshold: 90`, below the maximum, so this only happens under a pathological tree).
#[must_use]
pub fn thread_placement(
    start: &Arc<Node>,
    path_to_root: &[&Arc<Node>],
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    for (u_threshold, t_threshold, free_select) in thread_placement_schedule() {
        let attr = Attr {
            metric: DistanceMetric::Manhattan,
            u_threshold,
            t_threshold,
            m_threshold: 0,
        };
        let select: fn(&Node, &Attr) -> bool = if free_select {
            cpu_free_select
        } else {
            cpu_min_usage_select
        };
        if let Some(target) = up_traversal(start, path_to_root, &attr, select, select, rng) {
            return Some(target);
        }
    }
    start.home
}

/// `dqdt_thread_migrate`: same shape as [`thread_placement`] but over
/// [`thread_migrate_schedule`], used to relocate an already-running thread rather than place a
/// new one. Returns `None` (stay put) rather than falling back to `start`, since a migration
/// with nowhere better to go is a no-op, not a placement that must land somewhere.
#[must_use]
pub fn thread_migrate(
    start: &Arc<Node>,
    path_to_root: &[&Arc<Node>],
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    for (u_threshold, free_select) in thread_migrate_schedule() {
        let attr = Attr {
            metric: DistanceMetric::Manhattan,
            u_threshold,
            t_threshold: 2,
            m_threshold: 0,
        };
        let select: fn(&Node, &Attr) -> bool = if free_select {
            cpu_free_select
        } else {
            cpu_min_usage_select
        };
        if let Some(target) = up_traversal(start, path_to_root, &attr, select, select, rng) {
            return Some(target);
        }
    }
    None
}

/// `dqdt_task_placement`: walks [`task_placement_schedule`], picking the nearest cluster whose
/// subtree clears both the schedule's memory floor (at `min_order` or above) and its CPU-load
/// ceiling, matching `dqdt_task_placement_child_select`/`clstr_select`'s combined test.
#[must_use]
pub fn task_placement(
    start: &Arc<Node>,
    path_to_root: &[&Arc<Node>],
    min_order: usize,
    base_m: u64,
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    for (u_threshold, m_threshold, t_threshold) in task_placement_schedule(base_m) {
        let attr = Attr {
            metric: DistanceMetric::Manhattan,
            u_threshold,
            t_threshold,
            m_threshold,
        };
        let select = move |node: &Node, attr: &Attr| {
            mem_select(node, attr, min_order) && node.summary().thread_count <= attr.t_threshold
        };
        if let Some(target) = up_traversal(start, path_to_root, &attr, select, select, rng) {
            return Some(target);
        }
    }
    None
}

/// `dqdt_mem_request`: finds the nearest cluster with a free block at or above `min_order`,
/// with no load ceiling — a request for memory is satisfied wherever capacity exists,
/// regardless of how busy that cluster's CPUs are.
#[must_use]
pub fn mem_request(
    start: &Arc<Node>,
    path_to_root: &[&Arc<Node>],
    min_order: usize,
    rng: &mut Xorshift32,
) -> Option<MeshCoord> {
    let attr = Attr {
        metric: DistanceMetric::Manhattan,
        u_threshold: 100,
        t_threshold: u32::MAX,
        m_threshold: 0,
    };
    let select = move |node: &Node, attr: &Attr| mem_select(node, attr, min_order);
    up_traversal(start, path_to_root, &attr, select, select, rng)
}

/// Back-pressure state for `dqdt_wait_for_update`/`dqdt_update_done`: bounds how many
/// consecutive placements the same caller can issue before it must wait for the next update
/// cycle to widen the budget again.
pub struct BackPressure {
    count: core::sync::atomic::AtomicU32,
    threshold: core::sync::atomic::AtomicU32,
    last_caller: core::sync::atomic::AtomicU32,
}

impl Default for BackPressure {
    fn default() -> Self {
        Self::new()
    }
}

impl BackPressure {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: core::sync::atomic::AtomicU32::new(0),
            threshold: core::sync::atomic::AtomicU32::new(100),
            last_caller: core::sync::atomic::AtomicU32::new(0),
        }
    }

    /// `dqdt_wait_for_update`: returns `true` if `caller` may proceed immediately, `false` if it
    /// must wait (the caller then parks on its own wait queue; this module does not own the
    /// scheduler's wait-queue primitive).
    pub fn try_proceed(&self, caller: u32) -> bool {
        use core::sync::atomic::Ordering::AcqRel;
        let last = self.last_caller.load(AcqRel);
        let count = self.count.load(AcqRel);
        let threshold = self.threshold.load(AcqRel);
        if (last == caller && count < threshold) || (count == 0 && last == 0) {
            self.last_caller.store(caller, AcqRel);
            self.count.fetch_add(1, AcqRel);
            true
        } else {
            self.count.fetch_add(3, AcqRel);
            false
        }
    }

    /// `dqdt_update_done`: resets the burst budget and retunes `threshold` from the root's
    /// current utilization, exactly as §4.6.1 specifies (relaxed to 100 while `U < 60`, tight at
    /// 10 once the machine gets busy).
    pub fn update_done(&self, root_utilization: u8, released_caller: u32) {
        use core::sync::atomic::Ordering::AcqRel;
        self.count.store(0, AcqRel);
        self.last_caller.store(released_caller, AcqRel);
        self.threshold.store(
            if root_utilization < config::DQDT_ROOT_U_RELAXED {
                100
            } else {
                config::DQDT_THRESHOLD_DEFAULT
            },
            AcqRel,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(util: u8, threads: u32, free: u64) -> Arc<Node> {
        let node = Node::leaf(MeshCoord::default());
        node.set_leaf_summary(Summary {
            free_pages: free,
            thread_count: threads,
            utilization: util,
            stats: ClusterMemoryStats {
                pages_tbl: [0; config::MAX_ORDER],
            },
        });
        Arc::new(node)
    }

    #[test]
    fn fold_sums_and_averages() {
        let a = Summary {
            free_pages: 10,
            thread_count: 2,
            utilization: 40,
            stats: ClusterMemoryStats {
                pages_tbl: [0; config::MAX_ORDER],
            },
        };
        let b = Summary {
            free_pages: 5,
            thread_count: 3,
            utilization: 80,
            stats: ClusterMemoryStats {
                pages_tbl: [0; config::MAX_ORDER],
            },
        };
        let folded = a.fold(&b);
        assert_eq!(folded.free_pages, 15);
        assert_eq!(folded.thread_count, 5);
        assert_eq!(folded.utilization, 60);
    }

    #[test]
    fn refold_reflects_children() {
        let leaf_a = leaf_with(10, 1, 100);
        let leaf_b = leaf_with(90, 5, 50);
        let internal = Node::internal(alloc::vec![leaf_a, leaf_b]);
        let summary = internal.refold();
        assert_eq!(summary.thread_count, 6);
        assert_eq!(summary.free_pages, 150);
    }

    #[test]
    fn task_placement_schedule_halves_m_twice() {
        let schedule = task_placement_schedule(1000);
        let at_55 = schedule.iter().find(|(u, _, _)| *u == 55).unwrap();
        let at_70 = schedule.iter().find(|(u, _, _)| *u == 70).unwrap();
        let at_100 = schedule.iter().find(|(u, _, _)| *u == 100).unwrap();
        assert_eq!(at_55.1, 500);
        assert_eq!(at_70.1, 250);
        assert_eq!(at_100.2, 10);
    }

    #[test]
    fn thread_migrate_schedule_alternates_free_select() {
        let schedule = thread_migrate_schedule();
        assert!(schedule.iter().find(|(t, _)| *t == 20).unwrap().1);
        assert!(!schedule.iter().find(|(t, _)| *t == 40).unwrap().1);
        assert!(schedule.iter().find(|(t, _)| *t == 70).unwrap().1);
    }

    #[test]
    fn back_pressure_allows_burst_then_blocks() {
        let bp = BackPressure::new();
        bp.threshold.store(2, core::sync::atomic::Ordering::Relaxed);
        assert!(bp.try_proceed(1));
        assert!(bp.try_proceed(1));
        assert!(!bp.try_proceed(1));
        bp.update_done(40, 0);
        assert!(bp.try_proceed(7));
    }

    #[test]
    fn thread_placement_prefers_the_nearest_idle_leaf() {
        let busy = {
            let node = Node::leaf(MeshCoord { x: 5, y: 5 });
            node.set_leaf_summary(Summary {
                utilization: 95,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let idle = {
            let node = Node::leaf(MeshCoord { x: 1, y: 1 });
            node.set_leaf_summary(Summary {
                utilization: 0,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let root = Arc::new(Node::internal(alloc::vec![busy, idle]));
        let mut rng = Xorshift32::new(42);
        let picked = thread_placement(&root, &[], &mut rng);
        assert_eq!(picked, Some(MeshCoord { x: 1, y: 1 }));
    }

    #[test]
    fn thread_placement_falls_back_to_start_home_when_nothing_qualifies() {
        let overloaded = {
            let node = Node::leaf(MeshCoord { x: 3, y: 3 });
            node.set_leaf_summary(Summary {
                utilization: 100,
                thread_count: 1000,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let mut rng = Xorshift32::new(1);
        let picked = thread_placement(&overloaded, &[], &mut rng);
        assert_eq!(picked, Some(MeshCoord { x: 3, y: 3 }));
    }

    #[test]
    fn thread_migrate_returns_none_when_everything_is_saturated() {
        let overloaded = {
            let node = Node::leaf(MeshCoord { x: 2, y: 2 });
            node.set_leaf_summary(Summary {
                utilization: 100,
                thread_count: 1000,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let mut rng = Xorshift32::new(1);
        assert_eq!(thread_migrate(&overloaded, &[], &mut rng), None);
    }

    #[test]
    fn thread_migrate_picks_the_idle_sibling() {
        let busy = {
            let node = Node::leaf(MeshCoord { x: 0, y: 0 });
            node.set_leaf_summary(Summary {
                utilization: 90,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let idle = {
            let node = Node::leaf(MeshCoord { x: 4, y: 0 });
            node.set_leaf_summary(Summary {
                utilization: 10,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let root = Arc::new(Node::internal(alloc::vec![busy, idle]));
        let mut rng = Xorshift32::new(7);
        assert_eq!(
            thread_migrate(&root, &[], &mut rng),
            Some(MeshCoord { x: 4, y: 0 })
        );
    }

    fn leaf_with_order(coord: MeshCoord, order: usize, count: u64) -> Arc<Node> {
        let node = Node::leaf(coord);
        let mut pages_tbl = [0u64; config::MAX_ORDER];
        pages_tbl[order] = count;
        node.set_leaf_summary(Summary {
            free_pages: count << order,
            thread_count: 0,
            utilization: 10,
            stats: ClusterMemoryStats { pages_tbl },
        });
        node
    }

    #[test]
    fn task_placement_finds_a_cluster_with_enough_memory() {
        let empty = leaf_with_order(MeshCoord { x: 0, y: 0 }, 0, 0);
        let roomy = leaf_with_order(MeshCoord { x: 2, y: 0 }, 3, 10);
        let root = Arc::new(Node::internal(alloc::vec![empty, roomy]));
        let mut rng = Xorshift32::new(3);
        let picked = task_placement(&root, &[], 2, 16, &mut rng);
        assert_eq!(picked, Some(MeshCoord { x: 2, y: 0 }));
    }

    #[test]
    fn task_placement_fails_when_no_cluster_has_the_order() {
        let empty = leaf_with_order(MeshCoord { x: 0, y: 0 }, 0, 0);
        let mut rng = Xorshift32::new(3);
        assert_eq!(task_placement(&empty, &[], 5, 16, &mut rng), None);
    }

    #[test]
    fn mem_request_ignores_cpu_load() {
        let mut pages_tbl = [0u64; config::MAX_ORDER];
        pages_tbl[4] = 8;
        let node = Node::leaf(MeshCoord { x: 9, y: 9 });
        node.set_leaf_summary(Summary {
            free_pages: 8 << 4,
            thread_count: u32::MAX,
            utilization: 100,
            stats: ClusterMemoryStats { pages_tbl },
        });
        let node = Arc::new(node);
        let mut rng = Xorshift32::new(5);
        assert_eq!(
            mem_request(&node, &[], 4, &mut rng),
            Some(MeshCoord { x: 9, y: 9 })
        );
    }

    #[test]
    fn down_traversal_picks_nearest_eligible_leaf() {
        let near = {
            let node = Node::leaf(MeshCoord { x: 0, y: 0 });
            node.set_leaf_summary(Summary {
                utilization: 5,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let far = {
            let node = Node::leaf(MeshCoord { x: 10, y: 10 });
            node.set_leaf_summary(Summary {
                utilization: 5,
                ..Summary::empty()
            });
            Arc::new(node)
        };
        let root = Node::internal(alloc::vec![far, near]);
        let attr = Attr {
            metric: DistanceMetric::Manhattan,
            u_threshold: 98,
            t_threshold: 2,
            m_threshold: 0,
        };
        let mut rng = Xorshift32::new(1);
        let picked = down_traversal(&root, &attr, cpu_free_select, &mut rng);
        assert_eq!(picked, Some(MeshCoord { x: 0, y: 0 }));
    }
}
