use std::collections::HashSet;
use std::path::PathBuf;

use proptest::prelude::*;

use seqtoid_quant::dag::{DependencyGraph, GraphError, Resources, TaskInstance};

fn output_of(i: usize) -> PathBuf {
    PathBuf::from(format!("/graph/t{i}.out"))
}

fn source() -> PathBuf {
    PathBuf::from("/graph/source.txt")
}

/// Task `i` reads `source` plus the outputs of `deps`.
fn task(i: usize, deps: &[usize]) -> TaskInstance {
    let mut inputs = vec![source()];
    inputs.extend(deps.iter().map(|&d| output_of(d)));
    TaskInstance {
        id: format!("t{i}"),
        template: format!("t{i}"),
        sample: None,
        inputs,
        outputs: vec![output_of(i)],
        args: vec![],
        resources: Resources::default(),
        declared: i,
    }
}

/// Random DAG: every edge points from a lower to a higher index.
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    proptest::collection::btree_set(0..i, 0..=i.min(3))
                        .prop_map(|deps| deps.into_iter().collect::<Vec<_>>())
                        .boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

fn ordered_ids(graph: &DependencyGraph) -> Vec<String> {
    graph.order().iter().map(|&i| graph.task(i).id.clone()).collect()
}

proptest! {
    #[test]
    fn acceptance_and_order_do_not_depend_on_input_order(
        (deps, perm) in dag_strategy().prop_flat_map(|deps| {
            let n = deps.len();
            (Just(deps), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let external = HashSet::from([source()]);
        let declared: Vec<TaskInstance> = deps.iter().enumerate().map(|(i, d)| task(i, d)).collect();
        let shuffled: Vec<TaskInstance> = perm.iter().map(|&i| declared[i].clone()).collect();

        let a = DependencyGraph::build(declared, &external).unwrap();
        let b = DependencyGraph::build(shuffled, &external).unwrap();
        prop_assert_eq!(ordered_ids(&a), ordered_ids(&b));

        // every producer precedes its consumers
        for i in 0..b.len() {
            for p in b.producers(i) {
                prop_assert!(b.rank(p) < b.rank(i));
            }
        }
    }

    #[test]
    fn closing_a_chain_is_rejected(n in 1usize..10) {
        // t0 <- t1 <- ... <- t(n-1), then t0 also reads t(n-1)
        let mut tasks: Vec<TaskInstance> = (0..n)
            .map(|i| if i == 0 { task(0, &[]) } else { task(i, &[i - 1]) })
            .collect();
        tasks[0].inputs.push(output_of(n - 1));

        let result = DependencyGraph::build(tasks, &HashSet::from([source()]));
        match result {
            Err(GraphError::Cycle { cycle }) => {
                prop_assert_eq!(cycle.first(), cycle.last());
                prop_assert_eq!(cycle.len(), n + 1);
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|g| g.len())),
        }
    }
}
