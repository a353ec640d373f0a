//! Exemplar replay memory.
//!
//! The budget of `memory_size` exemplars is split evenly across every class
//! seen so far. Exemplars are chosen when a task completes, either at random
//! (seeded) or by herding toward the class-mean embedding, and earlier
//! selections are kept in priority order so shrinking a class's share only
//! drops its last picks.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SamplingStrategy;

/// A training sample retained for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Caller-side identifier used to re-load the sample.
    pub sample_id: String,
    pub class_id: usize,
    /// Pooled feature used for herding; may be empty for random sampling.
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ReplayMemory {
    capacity: usize,
    strategy: SamplingStrategy,
    rng: StdRng,
    slots: BTreeMap<usize, Vec<Exemplar>>,
}

impl ReplayMemory {
    pub fn new(capacity: usize, strategy: SamplingStrategy, seed: u64) -> Self {
        Self {
            capacity,
            strategy,
            rng: StdRng::seed_from_u64(seed),
            slots: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exemplars(&self) -> impl Iterator<Item = &Exemplar> {
        self.slots.values().flatten()
    }

    pub fn class_exemplars(&self, class_id: usize) -> &[Exemplar] {
        self.slots.get(&class_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rebalance after a task: shrink old classes, then select exemplars of
    /// classes in `seen` that have none yet from `candidates`.
    pub fn update(&mut self, seen: &BTreeSet<usize>, candidates: &[Exemplar]) {
        if !self.is_enabled() || seen.is_empty() {
            return;
        }
        let per_class = self.capacity / seen.len();
        for exemplars in self.slots.values_mut() {
            exemplars.truncate(per_class);
        }

        for &class_id in seen {
            if self.slots.contains_key(&class_id) {
                continue;
            }
            let pool: Vec<&Exemplar> = candidates.iter().filter(|e| e.class_id == class_id).collect();
            if pool.is_empty() {
                continue;
            }
            let selected = match self.strategy {
                SamplingStrategy::Random => self.select_random(&pool, per_class),
                SamplingStrategy::Icarl => select_herding(&pool, per_class),
            };
            self.slots.insert(class_id, selected);
        }
        debug!(
            stored = self.len(),
            classes = self.slots.len(),
            per_class,
            strategy = ?self.strategy,
            "Updated replay memory"
        );
    }

    /// Draw up to `n` distinct exemplars to mix into a batch.
    pub fn draw(&mut self, n: usize) -> Vec<Exemplar> {
        let all: Vec<&Exemplar> = self.slots.values().flatten().collect();
        all.choose_multiple(&mut self.rng, n.min(all.len()))
            .map(|&e| e.clone())
            .collect()
    }

    fn select_random(&mut self, pool: &[&Exemplar], budget: usize) -> Vec<Exemplar> {
        let mut picked: Vec<Exemplar> = pool.iter().map(|&e| e.clone()).collect();
        picked.shuffle(&mut self.rng);
        picked.truncate(budget);
        picked
    }
}

/// Greedy herding: each step adds the sample that keeps the running mean of
/// the selection closest to the class mean.
fn select_herding(pool: &[&Exemplar], budget: usize) -> Vec<Exemplar> {
    let dim = pool[0].embedding.len();
    let mut mean = vec![0.0f32; dim];
    for e in pool {
        for (m, v) in mean.iter_mut().zip(&e.embedding) {
            *m += v;
        }
    }
    mean.iter_mut().for_each(|m| *m /= pool.len() as f32);

    let mut running = vec![0.0f32; dim];
    let mut taken = vec![false; pool.len()];
    let mut selected = Vec::with_capacity(budget.min(pool.len()));
    for k in 0..budget.min(pool.len()) {
        let best = (0..pool.len())
            .filter(|&i| !taken[i])
            .map(|i| {
                let dist: f32 = mean
                    .iter()
                    .zip(&running)
                    .zip(&pool[i].embedding)
                    .map(|((m, r), x)| {
                        let d = m - (r + x) / (k + 1) as f32;
                        d * d
                    })
                    .sum();
                (i, dist)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i);
        let Some(i) = best else { break };
        taken[i] = true;
        for (r, x) in running.iter_mut().zip(&pool[i].embedding) {
            *r += x;
        }
        selected.push(pool[i].clone());
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exemplar(id: &str, class_id: usize, embedding: Vec<f32>) -> Exemplar {
        Exemplar {
            sample_id: id.to_string(),
            class_id,
            embedding,
        }
    }

    #[test]
    fn test_disabled_memory_stores_nothing() {
        let mut memory = ReplayMemory::new(0, SamplingStrategy::Random, 1);
        memory.update(&BTreeSet::from([0]), &[exemplar("a", 0, vec![])]);
        assert!(memory.is_empty());
        assert!(!memory.is_enabled());
    }

    #[test]
    fn test_budget_split_across_classes() {
        let mut memory = ReplayMemory::new(4, SamplingStrategy::Random, 1);
        let task0: Vec<Exemplar> = (0..6).map(|i| exemplar(&format!("a{i}"), 0, vec![])).collect();
        memory.update(&BTreeSet::from([0]), &task0);
        assert_eq!(memory.class_exemplars(0).len(), 4);

        let task1: Vec<Exemplar> = (0..6).map(|i| exemplar(&format!("b{i}"), 1, vec![])).collect();
        memory.update(&BTreeSet::from([0, 1]), &task1);
        assert_eq!(memory.class_exemplars(0).len(), 2);
        assert_eq!(memory.class_exemplars(1).len(), 2);
        assert_eq!(memory.len(), 4);
    }

    #[test]
    fn test_random_selection_is_seeded() {
        let pool: Vec<Exemplar> = (0..10).map(|i| exemplar(&format!("s{i}"), 0, vec![])).collect();
        let mut a = ReplayMemory::new(3, SamplingStrategy::Random, 9);
        let mut b = ReplayMemory::new(3, SamplingStrategy::Random, 9);
        a.update(&BTreeSet::from([0]), &pool);
        b.update(&BTreeSet::from([0]), &pool);
        assert_eq!(a.class_exemplars(0), b.class_exemplars(0));
    }

    #[test]
    fn test_herding_picks_closest_to_mean_first() {
        let pool = vec![
            exemplar("far", 0, vec![10.0, 0.0]),
            exemplar("center", 0, vec![2.0, 0.0]),
            exemplar("low", 0, vec![-4.0, 0.0]),
        ];
        let mut memory = ReplayMemory::new(2, SamplingStrategy::Icarl, 1);
        memory.update(&BTreeSet::from([0]), &pool);
        let picked = memory.class_exemplars(0);
        assert_eq!(picked.len(), 2);
        // mean is 8/3; "center" is nearest, then "far" pulls the average back up
        assert_eq!(picked[0].sample_id, "center");
        assert_eq!(picked[1].sample_id, "far");
    }

    #[test]
    fn test_draw_returns_distinct_exemplars() {
        let pool: Vec<Exemplar> = (0..4).map(|i| exemplar(&format!("s{i}"), 0, vec![])).collect();
        let mut memory = ReplayMemory::new(4, SamplingStrategy::Random, 2);
        memory.update(&BTreeSet::from([0]), &pool);
        let drawn = memory.draw(10);
        assert_eq!(drawn.len(), 4);
        let ids: BTreeSet<&str> = drawn.iter().map(|e| e.sample_id.as_str()).collect();
        assert_eq!(ids.len(), 4);
    }
}
