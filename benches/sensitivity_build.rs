//! Benchmarks for sensitivity graph construction.

use std::collections::BTreeMap;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use groundwork::atom::AtomTemplate;
use groundwork::sensitivity::{Comparator, Grounding, SensitivityGraph};
use groundwork::solver::RuleGrounding;

/// A chain of `Smokes(i) & Friends(i, i+1) -> Smokes(i+1)` implications plus
/// one budget constraint per link.
fn chain(n: usize) -> (BTreeMap<AtomTemplate, f64>, Vec<RuleGrounding>) {
    let mut values = BTreeMap::new();
    let mut groundings = Vec::with_capacity(2 * n);
    for i in 0..n {
        let a = i.to_string();
        let b = (i + 1).to_string();
        let smokes_a = AtomTemplate::ground("Smokes", [a.as_str()]);
        let smokes_b = AtomTemplate::ground("Smokes", [b.as_str()]);
        let friends = AtomTemplate::ground("Friends", [a.as_str(), b.as_str()]);
        values.insert(smokes_a.clone(), (i % 10) as f64 / 10.0);
        values.insert(smokes_b.clone(), ((i + 3) % 10) as f64 / 10.0);
        values.insert(friends.clone(), 0.9);
        groundings.push(RuleGrounding::new(
            "Spread",
            Grounding::Logical {
                body: vec![smokes_a.clone(), friends],
                head: vec![smokes_b.clone()],
            },
        ));
        groundings.push(RuleGrounding::new(
            "Budget",
            Grounding::Arithmetic {
                atoms: vec![smokes_a, smokes_b],
                coefficients: vec![1.0, 1.0],
                comparator: Comparator::LessEq,
                constant: 1.0,
            },
        ));
    }
    (values, groundings)
}

fn bench_build(c: &mut Criterion) {
    let (values, groundings) = chain(10_000);

    c.bench_function("sensitivity_build_20k", |bench| {
        bench.iter(|| black_box(SensitivityGraph::build(&values, &groundings).unwrap()))
    });
}

fn bench_most_violated(c: &mut Criterion) {
    let (values, groundings) = chain(10_000);
    let graph = SensitivityGraph::build(&values, &groundings).unwrap();

    c.bench_function("most_violated_20k", |bench| {
        bench.iter(|| black_box(graph.most_violated(0.1)))
    });
}

criterion_group!(benches, bench_build, bench_most_violated);
criterion_main!(benches);
