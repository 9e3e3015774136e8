//! Step dependency graph.
//!
//! Built once from the step catalog; rejects unknown edges, cycles and
//! undeclared derived-data reads before any step runs.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::step::StepDef;
use crate::error::Error;

/// Validated step catalog.
#[derive(Debug, Clone)]
pub struct StepGraph {
    defs: Vec<StepDef>,
    index: HashMap<String, usize>,
}

impl StepGraph {
    /// Validate and build the graph.
    pub fn new(defs: Vec<StepDef>) -> Result<Self, Error> {
        let mut index = HashMap::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(Error::Config(format!("step {} declared twice", def.name)));
            }
        }

        for def in &defs {
            for target in def.depends.iter().chain(&def.forces) {
                if !index.contains_key(target) {
                    return Err(Error::UnknownDependency {
                        step: def.name.clone(),
                        dependency: target.clone(),
                    });
                }
            }
        }

        let graph = Self { defs, index };
        graph.check_cycles()?;
        graph.check_reads()?;
        Ok(graph)
    }

    /// All step definitions in declaration order.
    pub fn defs(&self) -> &[StepDef] {
        &self.defs
    }

    /// Look up a step definition.
    pub fn get(&self, name: &str) -> Option<&StepDef> {
        self.index.get(name).map(|&i| &self.defs[i])
    }

    fn position(&self, name: &str) -> Result<usize, Error> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownStep(name.to_string()))
    }

    /// Steps that must run before `i`: its dependencies and any step forcing it.
    fn predecessors(&self, i: usize) -> Vec<usize> {
        let name = &self.defs[i].name;
        let mut preds: Vec<usize> = self.defs[i]
            .depends
            .iter()
            .filter_map(|d| self.index.get(d).copied())
            .collect();
        for (j, def) in self.defs.iter().enumerate() {
            if def.forces.iter().any(|f| f == name) {
                preds.push(j);
            }
        }
        preds
    }

    fn check_cycles(&self) -> Result<(), Error> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Finished,
        }

        let mut marks = vec![Mark::New; self.defs.len()];
        let preds: Vec<Vec<usize>> = (0..self.defs.len()).map(|i| self.predecessors(i)).collect();

        for root in 0..self.defs.len() {
            if marks[root] != Mark::New {
                continue;
            }
            // Iterative DFS; `path` mirrors the active stack for cycle reporting.
            let mut stack = vec![(root, 0usize)];
            let mut path = vec![root];
            marks[root] = Mark::Active;

            while let Some((node, next)) = stack.last_mut() {
                let node = *node;
                if let Some(&pred) = preds[node].get(*next) {
                    *next += 1;
                    match marks[pred] {
                        Mark::New => {
                            marks[pred] = Mark::Active;
                            stack.push((pred, 0));
                            path.push(pred);
                        }
                        Mark::Active => {
                            let start = path.iter().position(|&p| p == pred).unwrap_or(0);
                            let mut steps: Vec<String> = path[start..]
                                .iter()
                                .map(|&p| self.defs[p].name.clone())
                                .collect();
                            steps.push(self.defs[pred].name.clone());
                            return Err(Error::DependencyCycle { steps });
                        }
                        Mark::Finished => {}
                    }
                } else {
                    marks[node] = Mark::Finished;
                    stack.pop();
                    path.pop();
                }
            }
        }
        Ok(())
    }

    fn check_reads(&self) -> Result<(), Error> {
        for (i, def) in self.defs.iter().enumerate() {
            if def.reads.is_empty() {
                continue;
            }
            let mut upstream = self.ancestors(i);
            upstream.insert(i);
            for data in &def.reads {
                let provided = upstream
                    .iter()
                    .any(|&j| self.defs[j].provides.contains(data));
                if !provided {
                    return Err(Error::UndeclaredRead {
                        step: def.name.clone(),
                        data: data.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Transitive dependencies of step `i`.
    fn ancestors(&self, i: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: Vec<usize> = vec![i];
        while let Some(node) = queue.pop() {
            for dep in &self.defs[node].depends {
                if let Some(&j) = self.index.get(dep) {
                    if seen.insert(j) {
                        queue.push(j);
                    }
                }
            }
        }
        seen
    }

    /// Ordered execution plan for a selection.
    ///
    /// The plan contains the selected steps, everything they force, and every
    /// transitive dependency not listed in `done`.
    pub fn plan<S: AsRef<str>>(
        &self,
        selected: &[S],
        done: &HashSet<String>,
    ) -> Result<Vec<String>, Error> {
        let mut included: HashSet<usize> = HashSet::new();
        let mut queue = Vec::new();
        for name in selected {
            let i = self.position(name.as_ref())?;
            if included.insert(i) {
                queue.push(i);
            }
        }

        while let Some(i) = queue.pop() {
            let def = &self.defs[i];
            let forced = def.forces.iter();
            let needed = def.depends.iter().filter(|d| !done.contains(*d));
            for name in forced.chain(needed) {
                let j = self.position(name)?;
                if included.insert(j) {
                    queue.push(j);
                }
            }
        }

        // Kahn's algorithm; ready steps ordered by (not run_early, declaration).
        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut successors: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &included {
            let preds: Vec<usize> = self
                .predecessors(i)
                .into_iter()
                .filter(|p| included.contains(p))
                .collect();
            pending.insert(i, preds.len());
            for p in preds {
                successors.entry(p).or_default().push(i);
            }
        }

        let rank = |i: usize| (!self.defs[i].run_early, i);
        let mut ready: BTreeSet<(bool, usize)> = pending
            .iter()
            .filter(|entry| *entry.1 == 0)
            .map(|entry| rank(*entry.0))
            .collect();

        let mut order = Vec::with_capacity(included.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            let (_, i) = next;
            order.push(self.defs[i].name.clone());
            for &succ in successors.get(&i).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(count) = pending.get_mut(&succ) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(rank(succ));
                    }
                }
            }
        }

        if order.len() != included.len() {
            // Unreachable after check_cycles, kept as a guard for the invariant.
            let stuck = included
                .iter()
                .filter(|&&i| !order.contains(&self.defs[i].name))
                .map(|&i| self.defs[i].name.clone())
                .collect();
            return Err(Error::DependencyCycle { steps: stuck });
        }
        Ok(order)
    }
}
