//! Dependency graph keyed by produced/consumed file identity.
//!
//! Node `i` of the petgraph graph is task instance `i`; an edge `p -> c`
//! means `c` reads a file that `p` declares as output.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::path::PathBuf;

use fxhash::FxHashMap as HashMap;
use log::debug;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::error::GraphError;
use crate::dag::template::TaskInstance;
use crate::utils::file::clean_path;

#[derive(Debug)]
pub struct DependencyGraph {
    tasks: Vec<TaskInstance>,
    graph: DiGraph<usize, ()>,
    order: Vec<usize>,
    rank: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph and its topological order.
    ///
    /// # Arguments
    ///
    /// * `tasks` - Concrete task instances, any order.
    /// * `external` - Files that exist before the run (raw reference, reads).
    ///
    /// # Returns
    /// The DAG, or the first duplicate output, unresolved input or cycle.
    pub fn build(tasks: Vec<TaskInstance>, external: &HashSet<PathBuf>) -> Result<Self, GraphError> {
        let external: HashSet<PathBuf> = external.iter().map(clean_path).collect();

        let mut producer: HashMap<&PathBuf, usize> = HashMap::default();
        for (i, task) in tasks.iter().enumerate() {
            for output in &task.outputs {
                if let Some(&other) = producer.get(output) {
                    let (first, second) = if tasks[other].declared <= task.declared {
                        (&tasks[other], task)
                    } else {
                        (task, &tasks[other])
                    };
                    return Err(GraphError::DuplicateProducer {
                        path: output.clone(),
                        first: first.id.clone(),
                        second: second.id.clone(),
                    });
                }
                producer.insert(output, i);
            }
        }

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        for i in 0..tasks.len() {
            graph.add_node(i);
        }

        let mut edges = HashSet::new();
        for (consumer, task) in tasks.iter().enumerate() {
            for input in &task.inputs {
                match producer.get(input) {
                    Some(&p) => {
                        if edges.insert((p, consumer)) {
                            graph.add_edge(NodeIndex::new(p), NodeIndex::new(consumer), ());
                        }
                    }
                    None if external.contains(input) => {}
                    None => {
                        return Err(GraphError::UnresolvedInput {
                            task: task.id.clone(),
                            path: input.clone(),
                        });
                    }
                }
            }
        }
        drop(producer);

        let order = topological_order(&graph, &tasks)?;
        let mut rank = vec![0; tasks.len()];
        for (position, &i) in order.iter().enumerate() {
            rank[i] = position;
        }
        debug!("Task graph: {} tasks, {} edges", tasks.len(), graph.edge_count());

        Ok(DependencyGraph { tasks, graph, order, rank })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, i: usize) -> &TaskInstance {
        &self.tasks[i]
    }

    pub fn tasks(&self) -> &[TaskInstance] {
        &self.tasks
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Topological order; among unconstrained tasks the earliest declared
    /// comes first.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Position of task `i` in [`order`](Self::order).
    pub fn rank(&self, i: usize) -> usize {
        self.rank[i]
    }

    /// Tasks whose outputs task `i` reads.
    pub fn producers(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Incoming)
    }

    /// Tasks that read an output of task `i`.
    pub fn consumers(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Outgoing)
    }

    /// Every task reachable downstream of `i`, excluding `i`.
    pub fn descendants(&self, i: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.consumers(i).into();
        let mut found = Vec::new();
        while let Some(next) = queue.pop_front() {
            if seen[next] {
                continue;
            }
            seen[next] = true;
            found.push(next);
            queue.extend(self.consumers(next));
        }
        found.sort_by_key(|&t| self.rank[t]);
        found
    }

    fn neighbors(&self, i: usize, dir: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(i), dir)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }
}

/// Kahn's algorithm with a min-heap on the declaration index, so the order
/// does not depend on how the instance list happened to be arranged.
fn topological_order(graph: &DiGraph<usize, ()>, tasks: &[TaskInstance]) -> Result<Vec<usize>, GraphError> {
    let n = tasks.len();
    let mut indegree: Vec<usize> = (0..n)
        .map(|i| graph.neighbors_directed(NodeIndex::new(i), Direction::Incoming).count())
        .collect();

    let mut heap: BinaryHeap<Reverse<(usize, usize)>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(|i| Reverse((tasks[i].declared, i)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, i))) = heap.pop() {
        order.push(i);
        for next in graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
            let j = graph[next];
            indegree[j] -= 1;
            if indegree[j] == 0 {
                heap.push(Reverse((tasks[j].declared, j)));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(GraphError::Cycle {
            cycle: find_cycle(graph, tasks),
        })
    }
}

/// Names one concrete cycle, `a -> b -> a`, from the first non-trivial
/// strongly connected component.
fn find_cycle(graph: &DiGraph<usize, ()>, tasks: &[TaskInstance]) -> Vec<String> {
    let name = |n: NodeIndex| tasks[graph[n]].id.clone();

    for component in tarjan_scc(graph) {
        let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
        if component.len() < 2 && !self_loop {
            continue;
        }
        let Some(&start) = component.iter().min_by_key(|n| tasks[graph[**n]].declared) else {
            continue;
        };
        if self_loop {
            return vec![name(start), name(start)];
        }

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::default();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if graph.contains_edge(node, start) {
                let mut path = vec![node];
                let mut cursor = node;
                while cursor != start {
                    cursor = parent[&cursor];
                    path.push(cursor);
                }
                path.reverse();
                let mut cycle: Vec<String> = path.into_iter().map(name).collect();
                cycle.push(name(start));
                return cycle;
            }
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                if members.contains(&next) && next != start && !parent.contains_key(&next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::template::Resources;

    fn task(id: &str, declared: usize, inputs: &[&str], outputs: &[&str]) -> TaskInstance {
        TaskInstance {
            id: id.to_string(),
            template: id.to_string(),
            sample: None,
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            args: vec![],
            resources: Resources::default(),
            declared,
        }
    }

    fn external(paths: &[&str]) -> HashSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn edges_follow_file_identity() {
        let tasks = vec![
            task("index", 0, &["ref.fa"], &["ref.idx"]),
            task("quant[A]", 1, &["ref.idx", "A.fq"], &["A.tsv"]),
            task("quant[B]", 2, &["ref.idx", "B.fq"], &["B.tsv"]),
            task("collate", 3, &["A.tsv", "B.tsv"], &["all.tsv.gz"]),
        ];
        let graph = DependencyGraph::build(tasks, &external(&["ref.fa", "A.fq", "B.fq"])).unwrap();

        assert_eq!(graph.order(), &[0, 1, 2, 3]);
        assert_eq!(graph.producers(3), vec![1, 2]);
        assert_eq!(graph.consumers(0), vec![1, 2]);
        assert_eq!(graph.descendants(0), vec![1, 2, 3]);
        assert!(graph.producers(0).is_empty());
    }

    #[test]
    fn unresolved_input_names_task_and_path() {
        let tasks = vec![task("quant[A]", 0, &["ref.idx"], &["A.tsv"])];
        let err = DependencyGraph::build(tasks, &external(&[])).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvedInput {
                task: "quant[A]".to_string(),
                path: PathBuf::from("ref.idx"),
            }
        );
    }

    #[test]
    fn two_producers_of_one_file_are_rejected() {
        let tasks = vec![
            task("quant[B]", 2, &[], &["shared.tsv"]),
            task("quant[A]", 1, &[], &["shared.tsv"]),
        ];
        let err = DependencyGraph::build(tasks, &external(&[])).unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateProducer {
                path: PathBuf::from("shared.tsv"),
                first: "quant[A]".to_string(),
                second: "quant[B]".to_string(),
            }
        );
    }

    #[test]
    fn cycle_is_listed() {
        let tasks = vec![
            task("a", 0, &["c.out"], &["a.out"]),
            task("b", 1, &["a.out"], &["b.out"]),
            task("c", 2, &["b.out"], &["c.out"]),
            task("d", 3, &[], &["d.out"]),
        ];
        let err = DependencyGraph::build(tasks, &external(&[])).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("touch", 0, &["x"], &["x"])];
        let err = DependencyGraph::build(tasks, &external(&[])).unwrap_err();
        assert_eq!(err, GraphError::Cycle { cycle: vec!["touch".into(), "touch".into()] });
    }

    #[test]
    fn order_ignores_list_arrangement() {
        let forward = vec![
            task("index", 0, &[], &["ref.idx"]),
            task("quant", 1, &["ref.idx"], &["q.tsv"]),
            task("other", 2, &[], &["o.txt"]),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = DependencyGraph::build(forward, &external(&[])).unwrap();
        let b = DependencyGraph::build(reversed, &external(&[])).unwrap();
        let ids = |g: &DependencyGraph| g.order().iter().map(|&i| g.task(i).id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), vec!["index", "quant", "other"]);
        assert_eq!(ids(&a), ids(&b));
    }
}
