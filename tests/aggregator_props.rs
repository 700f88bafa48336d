//! Randomized record/drain interleavings against the delta aggregator.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use quota_meter::metering::DeltaAggregator;
use quota_meter::models::delta::PendingDelta;

#[derive(Debug, Clone)]
enum Op {
    Add { token_id: i64, delta: i64 },
    Drain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (1i64..6, -50i64..50).prop_map(|(token_id, delta)| Op::Add { token_id, delta }),
        1 => Just(Op::Drain),
    ]
}

fn fold(totals: &mut HashMap<i64, i64>, drained: Vec<PendingDelta>) {
    for entry in drained {
        *totals.entry(entry.token_id).or_default() += entry.delta;
    }
}

proptest! {
    /// Whatever the interleaving, the drained totals equal the recorded sums.
    #[test]
    fn drained_totals_match_recorded_sums(ops in proptest::collection::vec(op(), 0..200)) {
        let agg = DeltaAggregator::new();
        let mut expected: HashMap<i64, i64> = HashMap::new();
        let mut persisted: HashMap<i64, i64> = HashMap::new();

        for op in ops {
            match op {
                Op::Add { token_id, delta } => {
                    agg.add(token_id, delta);
                    *expected.entry(token_id).or_default() += delta;
                }
                Op::Drain => {
                    let drained = agg.drain();
                    prop_assert!(drained.iter().all(|e| e.delta != 0));
                    fold(&mut persisted, drained);
                }
            }
        }
        fold(&mut persisted, agg.drain());

        expected.retain(|_, v| *v != 0);
        persisted.retain(|_, v| *v != 0);
        prop_assert_eq!(expected, persisted);
    }

    /// Producers on several threads racing a draining thread lose nothing.
    #[test]
    fn concurrent_drains_conserve_deltas(
        per_thread in proptest::collection::vec(
            proptest::collection::vec((1i64..4, -20i64..20), 1..100),
            2..5,
        )
    ) {
        let agg = Arc::new(DeltaAggregator::new());
        let mut expected: HashMap<i64, i64> = HashMap::new();
        for (token_id, delta) in per_thread.iter().flatten() {
            *expected.entry(*token_id).or_default() += delta;
        }

        let producers: Vec<_> = per_thread
            .into_iter()
            .map(|adds| {
                let agg = agg.clone();
                thread::spawn(move || {
                    for (token_id, delta) in adds {
                        agg.add(token_id, delta);
                    }
                })
            })
            .collect();

        let drainer = {
            let agg = agg.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    seen.extend(agg.drain());
                    thread::yield_now();
                }
                seen
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut persisted = HashMap::new();
        fold(&mut persisted, drainer.join().unwrap());
        fold(&mut persisted, agg.drain());

        expected.retain(|_, v| *v != 0);
        persisted.retain(|_, v| *v != 0);
        prop_assert_eq!(expected, persisted);
    }
}
