//! Task dependency graph.
//!
//! Stored as adjacency lists over task indices and validated once at load
//! time: unique names, known dependencies, no cycles. Dispatch walks tasks in
//! the topological order computed here.

use std::collections::{HashMap, VecDeque};

use crate::error::SchedulerError;
use crate::task::TaskSpec;

#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    index: HashMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self, SchedulerError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.name.clone(), i).is_some() {
                return Err(SchedulerError::DuplicateTask(task.name.clone()));
            }
        }

        let mut upstream = vec![Vec::new(); tasks.len()];
        let mut downstream = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.upstream {
                let &j = index.get(dep).ok_or_else(|| SchedulerError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                if !upstream[i].contains(&j) {
                    upstream[i].push(j);
                    downstream[j].push(i);
                }
            }
        }

        let order = topological_order(&upstream, &downstream)
            .map_err(|remaining| SchedulerError::Cycle(cycle_path(&tasks, &upstream, &remaining)))?;

        Ok(Self {
            tasks,
            index,
            upstream,
            downstream,
            order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in dependency order: every task comes after its upstreams.
    pub fn topo_order(&self) -> impl Iterator<Item = &TaskSpec> {
        self.order.iter().map(|&i| &self.tasks[i])
    }

    pub fn upstream_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.upstream)
    }

    pub fn downstream_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.downstream)
    }

    /// Position of `name` in the topological order.
    pub fn rank(&self, name: &str) -> usize {
        self.index
            .get(name)
            .and_then(|i| self.order.iter().position(|o| o == i))
            .unwrap_or(usize::MAX)
    }

    fn neighbours(&self, name: &str, edges: &[Vec<usize>]) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| edges[i].iter().map(|&j| self.tasks[j].name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Kahn's algorithm. On a cycle, returns the nodes that never reached
/// in-degree zero.
fn topological_order(
    upstream: &[Vec<usize>],
    downstream: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut ready: VecDeque<usize> = (0..upstream.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(upstream.len());

    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &downstream[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() == upstream.len() {
        Ok(order)
    } else {
        Err((0..upstream.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Walk upstream edges inside the unresolved set until a node repeats.
fn cycle_path(tasks: &[TaskSpec], upstream: &[Vec<usize>], remaining: &[usize]) -> Vec<String> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = upstream[current].iter().find(|j| remaining.contains(j)) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            path.drain(..pos);
            path.push(next);
            break;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(|i| tasks[i].name.clone()).collect()
}
