//! The scenario runner: the one piece of tooling external to a single
//! protocol that knows how to run it many times and turn raw per-node
//! counters into a reportable series. See `SPEC_FULL.md` §10/§6.

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::errors::{SimError, SimResult};
use crate::kernel::Network;
use crate::node::Node;
use crate::protocol::Protocol;

/// Turns a live node slice into the named fields a [`ScenarioReport`]
/// tracks. Implementations are expected to be cheap and pure — they run
/// once per sampled step, per round.
pub trait StatsCollector: Sync {
    fn fields(&self) -> Vec<&'static str>;
    fn get(&self, nodes: &[Node]) -> IndexMap<&'static str, f64>;
}

/// Aggregated min/max/avg series across all rounds, one entry per sampled
/// step, keyed in the order [`StatsCollector::fields`] returned them —
/// an [`IndexMap`] rather than a `HashMap` so the report prints in a
/// stable, meaningful column order instead of hash-bucket order.
#[derive(Clone, Debug, Default)]
pub struct ScenarioReport {
    pub fields: Vec<&'static str>,
    pub min: IndexMap<&'static str, Vec<f64>>,
    pub max: IndexMap<&'static str, Vec<f64>>,
    pub avg: IndexMap<&'static str, Vec<f64>>,
}

/// Runs `round_count` independent rounds of `template`, each a fresh
/// `copy()` reseeded with its own round index, sampling `stats` every
/// `stat_each_x_ms` of virtual time until `continue_while` returns false.
/// Rounds are independent `Network`s with no shared state (§5), so they
/// run concurrently via `rayon` — never threads within a single round.
pub fn run_scenario<T>(
    template: &T,
    stats: &(dyn StatsCollector + Sync),
    round_count: u32,
    stat_each_x_ms: u64,
    continue_while: impl Fn(&Network) -> bool + Sync,
    on_round_end: impl Fn(u32, &T) + Sync,
) -> SimResult<ScenarioReport>
where
    T: Protocol + Send,
{
    if round_count == 0 {
        return Err(SimError::InvalidRoundCount);
    }

    let fields = stats.fields();
    // Every round's copy is made up front, sequentially, from the shared
    // `template` reference; the parallel stage below then owns each copy
    // outright, so it only needs `T: Send`, never `T: Sync` (the kernel's
    // conditional-task closures are deliberately not `Sync`, see §5).
    let rounds: Vec<(u32, T)> = (0..round_count)
        .map(|round| {
            let mut run = template.copy();
            run.network_mut().reseed(round as u64);
            (round, run)
        })
        .collect();

    let per_round: Vec<Vec<IndexMap<&'static str, f64>>> = rounds
        .into_par_iter()
        .map(|(round, mut run)| {
            run.init();

            let mut samples = Vec::new();
            while continue_while(run.network()) {
                run.network_mut().run_ms(stat_each_x_ms).expect("a scenario round never schedules into its own past");
                samples.push(stats.get(run.network().nodes()));
            }
            on_round_end(round, &run);
            samples
        })
        .collect();

    let longest = per_round.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut min = IndexMap::new();
    let mut max = IndexMap::new();
    let mut avg = IndexMap::new();
    for &field in &fields {
        let mut min_series = Vec::with_capacity(longest);
        let mut max_series = Vec::with_capacity(longest);
        let mut avg_series = Vec::with_capacity(longest);
        for step in 0..longest {
            let values: Vec<f64> = per_round.iter().filter_map(|s| s.get(step)).filter_map(|sample| sample.get(field).copied()).collect();
            if values.is_empty() {
                continue;
            }
            min_series.push(values.iter().copied().fold(f64::INFINITY, f64::min));
            max_series.push(values.iter().copied().fold(f64::NEG_INFINITY, f64::max));
            avg_series.push(values.iter().sum::<f64>() / values.len() as f64);
        }
        min.insert(field, min_series);
        max.insert(field, max_series);
        avg.insert(field, avg_series);
    }

    Ok(ScenarioReport { fields, min, max, avg })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::sanfermin::{SanFerminParams, SanFerminProtocol};

    struct DoneCount;
    impl StatsCollector for DoneCount {
        fn fields(&self) -> Vec<&'static str> {
            vec!["done"]
        }
        fn get(&self, nodes: &[Node]) -> IndexMap<&'static str, f64> {
            let mut m = IndexMap::new();
            m.insert("done", nodes.iter().filter(|n| n.done_at.is_some()).count() as f64);
            m
        }
    }

    fn params(node_count: u32) -> SanFerminParams {
        SanFerminParams {
            node_count,
            threshold: node_count,
            pairing_time_ms: 10,
            signature_size_bytes: 48,
            reply_timeout_ms: 200,
            candidate_count: 1,
            shuffled: false,
        }
    }

    #[test]
    fn rejects_zero_rounds() {
        let template = SanFerminProtocol::new(params(4), 1).unwrap();
        let err = run_scenario(&template, &DoneCount, 0, 50, |_| true, |_, _| {}).unwrap_err();
        assert!(matches!(err, SimError::InvalidRoundCount));
    }

    #[test]
    fn aggregates_min_max_avg_across_rounds() {
        let template = SanFerminProtocol::new(params(4), 1).unwrap();
        let report = run_scenario(&template, &DoneCount, 3, 20, |net| net.time() < 200, |_, _| {}).unwrap();
        assert_eq!(report.fields, vec!["done"]);
        assert!(!report.avg["done"].is_empty());
        for i in 0..report.avg["done"].len() {
            assert!(report.min["done"][i] <= report.avg["done"][i]);
            assert!(report.avg["done"][i] <= report.max["done"][i]);
        }
    }

    #[test]
    fn rounds_are_independent_given_different_seeds() {
        // Same template, two different round indices: each round reseeds
        // its own copy, so the node ids stay the same but RNG-derived
        // positions need not match across rounds.
        let template = SanFerminProtocol::new(params(8), 1).unwrap();
        let mut a = template.copy();
        a.network_mut().reseed(0);
        a.init();
        let mut b = template.copy();
        b.network_mut().reseed(1);
        b.init();
        assert_eq!(a.network().node_count(), b.network().node_count());
        let _ = NodeId(0);
    }
}
