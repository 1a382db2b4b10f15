use std::sync::Arc;

use log::trace;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use crate::envelope::{Destination, Envelope};
use crate::errors::{SimError, SimResult};
use crate::latency::LatencyModel;
use crate::message::{Message, Task};
use crate::node::{Node, NodeId};
use crate::partition::PartitionSet;
use crate::store::MessageStore;

/// A destination list accepted by [`Network::send`]: either a single node
/// or an explicit slice of nodes.
pub enum Destinations {
    Single(NodeId),
    Many(Vec<NodeId>),
}

impl From<NodeId> for Destinations {
    fn from(id: NodeId) -> Self {
        Destinations::Single(id)
    }
}

impl From<Vec<NodeId>> for Destinations {
    fn from(ids: Vec<NodeId>) -> Self {
        Destinations::Many(ids)
    }
}

impl From<&[NodeId]> for Destinations {
    fn from(ids: &[NodeId]) -> Self {
        Destinations::Many(ids.to_vec())
    }
}

struct ConditionalTask {
    owner: NodeId,
    duration: u64,
    min_start_time: u64,
    #[allow(clippy::type_complexity)]
    action: Box<dyn FnMut(&mut Network) + Send>,
    start_if: Box<dyn Fn(&Network) -> bool + Send + Sync>,
    repeat_if: Box<dyn Fn(&Network) -> bool + Send + Sync>,
}

/// The event kernel: current virtual time, the time-bucketed store, the
/// partition list, the deterministic RNG, and the conditional-task list.
/// Strictly single-threaded per scenario — see §5 of `SPEC_FULL.md`.
pub struct Network {
    registry: Vec<Node>,
    store: MessageStore,
    time: u64,
    partitions: PartitionSet,
    latency: LatencyModel,
    msg_discard_time: Option<u64>,
    rng: ChaCha8Rng,
    conditional_tasks: Vec<ConditionalTask>,
    in_flight: usize,
    fatal: Option<SimError>,
}

impl Network {
    pub fn new(seed: u64, latency: LatencyModel) -> Self {
        Self {
            registry: Vec::new(),
            store: MessageStore::new(0),
            time: 0,
            partitions: PartitionSet::new(),
            latency,
            msg_discard_time: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            conditional_tasks: Vec::new(),
            in_flight: 0,
            fatal: None,
        }
    }

    /// Marks the scenario as fatally broken; the first error recorded wins.
    /// Per §7 the kernel never recovers from a fatal bug: `receive_until`
    /// checks this after every action dispatch and aborts the run with it.
    pub fn fail(&mut self, err: SimError) {
        log::error!("fatal: {err}");
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    /// Reseeds the RNG with a fresh value. Used by the scenario runner to
    /// give each round a deterministic, round-indexed seed.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.registry[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.registry[id.index()]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.registry
    }

    pub fn node_count(&self) -> u32 {
        self.registry.len() as u32
    }

    /// Registers `node` at its own id, padding the dense registry with
    /// down placeholder nodes if it arrives ahead of its slot. Fails if
    /// that id is already occupied.
    pub fn add_node(&mut self, mut node: Node) -> SimResult<NodeId> {
        let idx = node.id.index();
        if idx < self.registry.len() {
            return Err(SimError::NodeAlreadyRegistered(node.id));
        }
        while self.registry.len() < idx {
            let pad_id = NodeId(self.registry.len() as u32);
            let mut placeholder = Node::new(pad_id, 0, 0);
            placeholder.down = true;
            self.registry.push(placeholder);
        }
        node.id = NodeId(idx as u32);
        self.registry.push(node);
        Ok(NodeId(idx as u32))
    }

    /// Draws a position uniformly over the `[0, MAX_X) x [0, MAX_Y)` plane
    /// using the kernel RNG, for protocols that don't place nodes themselves.
    pub fn gen_position(&mut self) -> (u32, u32) {
        (self.rng.gen_range(0..crate::node::MAX_X), self.rng.gen_range(0..crate::node::MAX_Y))
    }

    /// Shuffles `items` in place using the kernel RNG, so stochastic
    /// candidate-ordering choices stay reproducible under a fixed seed.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Deterministic mixing of `(node_id, seed)` into `[0, 99]`, independent
    /// of the kernel's own RNG state so a single `send` to many destinations
    /// produces the same per-destination latency regardless of iteration
    /// order.
    pub fn get_pseudo_random(&self, node_id: NodeId, seed: u64) -> u8 {
        let mut x = node_id.0 as i64;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x ^= seed as i64;
        (x.unsigned_abs() % 100) as u8
    }

    /// Schedules `msg` for delivery to `to` (one node or a list), computing
    /// each destination's arrival from the current latency model. See
    /// `SPEC_FULL.md` §4.2 for the per-destination accounting rules.
    pub fn send(
        &mut self,
        msg: impl Message + 'static,
        send_time: u64,
        from: NodeId,
        to: impl Into<Destinations>,
        delay_between: u64,
    ) -> SimResult<()> {
        let payload: Arc<dyn Message> = Arc::new(msg);
        self.send_arc(payload, send_time, from, to.into(), delay_between)
    }

    fn send_arc(&mut self, payload: Arc<dyn Message>, send_time: u64, from: NodeId, to: Destinations, delay_between: u64) -> SimResult<()> {
        if !payload.is_task() && payload.size() == 0 {
            return Err(SimError::ZeroSizeMessage);
        }
        let targets: Vec<NodeId> = match to {
            Destinations::Single(id) => vec![id],
            Destinations::Many(ids) => ids,
        };
        if targets.is_empty() {
            return Err(SimError::EmptyDestinationList);
        }

        let random_seed: u64 = self.rng.gen();
        let mut destinations: SmallVec<[Destination; 4]> = SmallVec::new();
        let mut effective_send_time = send_time;
        for (i, to_id) in targets.iter().copied().enumerate() {
            if i > 0 && delay_between > 0 {
                effective_send_time += delay_between + 1;
            }
            let to_node = &self.registry[to_id.index()];
            if to_node.down {
                continue;
            }
            let rnd = self.get_pseudo_random(to_id, random_seed);
            let latency = self.latency.delay(&self.registry[from.index()], to_node, rnd);
            if let Some(limit) = self.msg_discard_time {
                if latency >= limit {
                    continue;
                }
            }
            destinations.push(Destination { node: to_id, arrival: effective_send_time + latency });
            let from_node = &mut self.registry[from.index()];
            from_node.msg_sent += 1;
            from_node.bytes_sent += payload.size() as u64;
        }

        if destinations.is_empty() {
            // every destination was down or discarded: nothing to enqueue,
            // and that is an expected runtime outcome, not an error.
            return Ok(());
        }

        let env = Envelope::new(payload, from, destinations);
        self.store.add_msg(env, self.time)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Schedules `msg` to arrive at `to` at an explicit time. Fails if
    /// `arrive_at <= time`.
    pub fn send_arrive_at(&mut self, msg: Arc<dyn Message>, arrive_at: u64, from: NodeId, to: NodeId) -> SimResult<()> {
        if arrive_at <= self.time {
            return Err(SimError::ScheduleInPast { arrive_at, now: self.time });
        }
        if !msg.is_task() && msg.size() == 0 {
            return Err(SimError::ZeroSizeMessage);
        }
        let env = Envelope::new(msg, from, SmallVec::from_elem(Destination { node: to, arrival: arrive_at }, 1));
        self.store.add_msg(env, self.time)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Schedules a one-shot closure to run at `owner` at `start_at`.
    pub fn register_task(&mut self, owner: NodeId, start_at: u64, f: impl FnMut(&mut Network) + Send + 'static) -> SimResult<()> {
        self.send_arrive_at(Arc::new(Task::new(f)), start_at, owner, owner)
    }

    /// Schedules a closure that reschedules itself every `period` ms,
    /// starting at `start_at`, as long as `cond` (if given) holds.
    pub fn register_periodic_task(
        &mut self,
        owner: NodeId,
        start_at: u64,
        period: u64,
        f: impl FnMut(&mut Network) + Send + 'static,
        cond: Option<Box<dyn Fn(&Network) -> bool + Send + Sync>>,
    ) -> SimResult<()> {
        let task = PeriodicTask::new(owner, period, f, cond);
        self.send_arrive_at(task, start_at, owner, owner)
    }

    /// Registers a task that lives outside the store: each time virtual
    /// time advances, the task list is walked; dead entries (`repeat_if ==
    /// false`) are dropped, and live ones whose `start_if` holds run once
    /// `time >= min_start_time`, then reschedule `duration` ms out.
    pub fn register_conditional_task(
        &mut self,
        owner: NodeId,
        start_at: u64,
        duration: u64,
        action: impl FnMut(&mut Network) + Send + 'static,
        start_if: impl Fn(&Network) -> bool + Send + Sync + 'static,
        repeat_if: impl Fn(&Network) -> bool + Send + Sync + 'static,
    ) {
        self.conditional_tasks.push(ConditionalTask {
            owner,
            duration,
            min_start_time: start_at,
            action: Box::new(action),
            start_if: Box::new(start_if),
            repeat_if: Box::new(repeat_if),
        });
    }

    /// `partition(fraction)`: adds an X-cut at `fraction * MAX_X`.
    pub fn partition(&mut self, fraction: f64) -> SimResult<()> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(SimError::PartitionOutOfRange(fraction));
        }
        let x = (fraction * crate::node::MAX_X as f64) as u32;
        if !self.partitions.add_cut(x) {
            return Err(SimError::DuplicatePartition(fraction));
        }
        Ok(())
    }

    pub fn end_partition(&mut self) {
        self.partitions.clear();
    }

    pub fn set_network_latency(&mut self, model: LatencyModel) -> SimResult<()> {
        if self.in_flight > 0 {
            return Err(SimError::LatencyChangeWhileInFlight(self.in_flight));
        }
        self.latency = model;
        Ok(())
    }

    pub fn set_msg_discard_time(&mut self, limit_ms: u64) {
        self.msg_discard_time = Some(limit_ms);
    }

    pub fn run(&mut self, seconds: u64) -> SimResult<()> {
        self.run_ms(seconds * 1000)
    }

    pub fn run_ms(&mut self, ms: u64) -> SimResult<()> {
        let end_at = self.time + ms;
        self.receive_until(end_at)?;
        self.time = end_at;
        self.store.cleanup(self.time);
        Ok(())
    }

    fn receive_until(&mut self, end_at: u64) -> SimResult<()> {
        let mut last_time: Option<u64> = None;
        while self.time <= end_at {
            if last_time != Some(self.time) {
                self.run_conditional_tasks();
                last_time = Some(self.time);
                if let Some(err) = self.fatal.take() {
                    return Err(err);
                }
            }
            match self.store.poll(self.time) {
                Some(mut env) => {
                    self.deliver(&env);
                    self.in_flight -= 1;
                    if let Some(err) = self.fatal.take() {
                        return Err(err);
                    }
                    if env.advance() {
                        self.store.add_msg(env, self.time)?;
                        self.in_flight += 1;
                    }
                }
                None => {
                    self.time += 1;
                }
            }
        }
        Ok(())
    }

    fn run_conditional_tasks(&mut self) {
        let mut tasks = std::mem::take(&mut self.conditional_tasks);
        tasks.retain_mut(|t| {
            if !(t.repeat_if)(self) {
                return false;
            }
            if self.time >= t.min_start_time && (t.start_if)(self) {
                (t.action)(self);
                t.min_start_time = self.time + t.duration;
            }
            true
        });
        // An action above may itself have called `register_conditional_task`,
        // pushing new entries onto `self.conditional_tasks` (empty since the
        // `mem::take`). Append the retained tasks back in front of those
        // instead of overwriting, or re-registration from within an action
        // is silently dropped.
        tasks.append(&mut self.conditional_tasks);
        self.conditional_tasks = tasks;
    }

    /// Partitioning is observed here, at delivery time, never at send time:
    /// a message sent while partitions are absent but arriving during a
    /// partition is still suppressed.
    fn deliver(&mut self, env: &Envelope) {
        let dest = env.current_destination().expect("deliver is only called on an envelope with a pending destination");
        let from = env.from;
        let to = dest.node;
        if !self.partitions.same_partition(&self.registry[from.index()], &self.registry[to.index()]) {
            return;
        }
        if !env.payload.is_task() {
            let to_node = &mut self.registry[to.index()];
            to_node.msg_received += 1;
            to_node.bytes_received += env.payload.size() as u64;
        }
        trace!("t={} delivering from={from} to={to}", self.time);
        let payload = Arc::clone(&env.payload);
        payload.action(self, from, to);
    }
}

/// A task that reschedules itself every `period` ms. Uses `Arc::new_cyclic`
/// to hold a `Weak` handle to itself so `action` (which only receives `&self`
/// per the `Message` contract) can resubmit the same payload.
struct PeriodicTask {
    owner: NodeId,
    period: u64,
    #[allow(clippy::type_complexity)]
    action: parking_lot::Mutex<Box<dyn FnMut(&mut Network) + Send>>,
    cond: Option<Box<dyn Fn(&Network) -> bool + Send + Sync>>,
    self_ref: std::sync::Weak<PeriodicTask>,
}

impl PeriodicTask {
    fn new(
        owner: NodeId,
        period: u64,
        f: impl FnMut(&mut Network) + Send + 'static,
        cond: Option<Box<dyn Fn(&Network) -> bool + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            owner,
            period,
            action: parking_lot::Mutex::new(Box::new(f)),
            cond,
            self_ref: weak.clone(),
        })
    }
}

impl Message for PeriodicTask {
    fn size(&self) -> u32 {
        0
    }

    fn is_task(&self) -> bool {
        true
    }

    fn action(&self, net: &mut Network, _from: NodeId, _to: NodeId) {
        (self.action.lock())(net);
        let should_continue = self.cond.as_ref().is_none_or(|c| c(net));
        if should_continue {
            if let Some(strong) = self.self_ref.upgrade() {
                let next = net.time() + self.period;
                let _ = net.send_arrive_at(strong, next, self.owner, self.owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::latency::LatencyModel;

    fn network_with_nodes(n: u32) -> Network {
        let mut net = Network::new(1, LatencyModel::Constant(0));
        for i in 0..n {
            net.add_node(Node::new(NodeId(i), 0, 0)).unwrap();
        }
        net
    }

    struct Counting {
        size: u32,
        from_seen: Arc<std::sync::Mutex<Vec<(NodeId, NodeId)>>>,
    }

    impl Message for Counting {
        fn size(&self) -> u32 {
            self.size
        }
        fn action(&self, _net: &mut Network, from: NodeId, to: NodeId) {
            self.from_seen.lock().unwrap().push((from, to));
        }
    }

    #[test]
    fn event_ordering_scenario() {
        // Scenario 1: 4-node kernel, no latency, single send, observe exactly
        // one delivery with the expected (from, to) pair and an empty queue.
        let mut net = network_with_nodes(4);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let msg = Counting { size: 8, from_seen: seen.clone() };
        net.send(msg, 1, NodeId(1), NodeId(2), 0).unwrap();
        net.run(5).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(NodeId(1), NodeId(2))]);
        assert!(net.store.is_empty_at(net.time()));
    }

    #[test]
    fn task_scheduling_scenario() {
        // Scenario 2: registerTask(f, 100, n0); runMs(99) -> not fired;
        // runMs(1) -> fired; queue empty.
        let mut net = network_with_nodes(1);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        net.register_task(NodeId(0), 100, move |_net| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        net.run_ms(99).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        net.run_ms(1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(net.in_flight, 0);
    }

    #[test]
    fn multi_destination_arrival_split_scenario() {
        // Scenario 3: arrivals {n1:2, n2:3, n3:3} scheduled individually via
        // send_arrive_at so each destination lands at an explicit time.
        // After runMs(2), exactly one delivery has happened; after one more
        // ms, three total, and the queue is drained.
        let mut net = network_with_nodes(4);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let shared = Arc::new(Counting { size: 1, from_seen: seen.clone() }) as Arc<dyn Message>;
        net.send_arrive_at(shared.clone(), 2, NodeId(0), NodeId(1)).unwrap();
        net.send_arrive_at(shared.clone(), 3, NodeId(0), NodeId(2)).unwrap();
        net.send_arrive_at(shared, 3, NodeId(0), NodeId(3)).unwrap();

        net.run_ms(2).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        net.run_ms(1).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert!(net.store.is_empty_at(net.time()));
    }

    #[test]
    fn conditional_task_waits_for_min_start_time_and_start_if() {
        let mut net = network_with_nodes(1);
        let fired = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        let gate_clone = gate.clone();
        net.register_conditional_task(
            NodeId(0),
            50,
            10,
            move |_net| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            move |_net| gate_clone.load(std::sync::atomic::Ordering::SeqCst),
            |_net| true,
        );

        // start_if is false until the gate flips, even past min_start_time.
        net.run_ms(60).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        gate.store(true, std::sync::atomic::Ordering::SeqCst);
        net.run_ms(1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conditional_task_reschedules_and_stops_on_repeat_if() {
        let mut net = network_with_nodes(1);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        net.register_conditional_task(
            NodeId(0),
            10,
            10,
            move |_net| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_net| true,
            |net| net.time() < 25,
        );

        net.run_ms(9).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        net.run_ms(1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        net.run_ms(9).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        net.run_ms(1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // repeat_if turns false once time reaches 25, dropping the task
        // before its next min_start_time (30) is ever reached.
        net.run_ms(10).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn conditional_task_registered_from_within_an_action_survives() {
        // Regression test for the clobber in run_conditional_tasks: the
        // first task's action registers a second conditional task during
        // the same walk. Before the fix, the final `self.conditional_tasks
        // = tasks` assignment discarded it because it was pushed onto the
        // list that `mem::take` had already emptied.
        let mut net = network_with_nodes(1);
        let spawned_fired = Arc::new(AtomicU32::new(0));
        let spawned_fired_clone = spawned_fired.clone();
        let spawned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let spawned_clone = spawned.clone();

        net.register_conditional_task(
            NodeId(0),
            0,
            1000,
            move |net| {
                if spawned_clone.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return;
                }
                let spawned_fired_clone = spawned_fired_clone.clone();
                net.register_conditional_task(
                    NodeId(0),
                    net.time(),
                    1000,
                    move |_net| {
                        spawned_fired_clone.fetch_add(1, Ordering::SeqCst);
                    },
                    |_net| true,
                    |_net| true,
                );
            },
            |_net| true,
            |_net| true,
        );

        net.run_ms(5).unwrap();
        assert_eq!(spawned_fired.load(Ordering::SeqCst), 1);
    }
}
