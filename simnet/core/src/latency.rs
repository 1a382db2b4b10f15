use crate::node::Node;

/// `(from, to, rnd % 100) -> ms`. Models must be pure so that
/// [`crate::kernel::Network::get_pseudo_random`] alone determines variance —
/// no model may consult its own RNG.
#[derive(Clone, Debug)]
pub enum LatencyModel {
    /// Every delivery takes the same number of milliseconds.
    Constant(u64),
    /// Euclidean distance over `(x, y)` mapped through a linear curve.
    Distance { base_ms: u64, ms_per_unit: f64 },
    /// A small fixed empirical table standing in for a measured latency
    /// trace (e.g. an IC3-style inter-continental measurement set), bucketed
    /// by `rnd` the same way [`LatencyModel::Empirical`] is.
    Ic3Measured,
    /// A `(proportions[], values[])` empirical CDF. `sum(proportions)` need
    /// not be 100 — it is only ever used as the bucketing denominator.
    Empirical { props: Vec<f64>, vals: Vec<u64> },
}

const IC3_PROPS: [f64; 5] = [10.0, 30.0, 40.0, 15.0, 5.0];
const IC3_VALS: [u64; 5] = [75, 150, 300, 600, 1200];

impl LatencyModel {
    pub fn delay(&self, from: &Node, to: &Node, rnd: u8) -> u64 {
        match self {
            LatencyModel::Constant(ms) => *ms,
            LatencyModel::Distance { base_ms, ms_per_unit } => {
                let dx = from.x as f64 - to.x as f64;
                let dy = from.y as f64 - to.y as f64;
                let dist = (dx * dx + dy * dy).sqrt();
                *base_ms + (dist * ms_per_unit) as u64
            }
            LatencyModel::Ic3Measured => bucket(&IC3_PROPS, &IC3_VALS, rnd),
            LatencyModel::Empirical { props, vals } => bucket(props, vals, rnd),
        }
    }
}

/// Maps `rnd` (0..=99) into `vals` via the cumulative distribution implied
/// by `props`, using `sum(props)` as the denominator rather than assuming
/// it equals 100.
fn bucket(props: &[f64], vals: &[u64], rnd: u8) -> u64 {
    debug_assert_eq!(props.len(), vals.len(), "empirical latency table must pair every proportion with a value");
    let total: f64 = props.iter().sum();
    if total <= 0.0 || vals.is_empty() {
        return 0;
    }
    let target = total * (rnd as f64 / 100.0);
    let mut acc = 0.0;
    for (p, v) in props.iter().zip(vals.iter()) {
        acc += p;
        if target < acc {
            return *v;
        }
    }
    *vals.last().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    #[test]
    fn constant_ignores_position_and_rnd() {
        let model = LatencyModel::Constant(42);
        let a = Node::new(NodeId(0), 0, 0);
        let b = Node::new(NodeId(1), 900, 900);
        assert_eq!(model.delay(&a, &b, 0), 42);
        assert_eq!(model.delay(&a, &b, 99), 42);
    }

    #[test]
    fn empirical_respects_proportions_regardless_of_scale() {
        let model = LatencyModel::Empirical { props: vec![1.0, 1.0], vals: vec![10, 20] };
        let a = Node::new(NodeId(0), 0, 0);
        let b = Node::new(NodeId(1), 0, 0);
        assert_eq!(model.delay(&a, &b, 0), 10);
        assert_eq!(model.delay(&a, &b, 99), 20);
    }
}
