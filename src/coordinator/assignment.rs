// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// How partitions are split across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Contiguous blocks; the first `partitions % workers` workers get one extra.
    #[default]
    Range,
    /// Partition `p` goes to worker `p % workers`.
    Modulo,
}

/// The partitions owned by one worker out of a fixed pool of workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    total_partitions: u32,
    total_workers: u32,
    worker_index: u32,
    strategy: AssignmentStrategy,
    partitions: Vec<i32>,
}

impl Assignment {
    pub fn compute(
        total_partitions: u32,
        total_workers: u32,
        worker_index: u32,
        strategy: AssignmentStrategy,
    ) -> AppResult<Assignment> {
        if total_partitions == 0 {
            return Err(AppError::InvalidAssignment(
                "partition count must be positive".to_string(),
            ));
        }
        if total_workers == 0 {
            return Err(AppError::InvalidAssignment(
                "worker count must be positive".to_string(),
            ));
        }
        if worker_index >= total_workers {
            return Err(AppError::InvalidAssignment(format!(
                "worker index {} out of range for {} workers",
                worker_index, total_workers
            )));
        }

        let partitions = match strategy {
            AssignmentStrategy::Range => {
                let (start, len) = Self::range_of(total_partitions, total_workers, worker_index);
                (start..start + len).map(|p| p as i32).collect()
            }
            AssignmentStrategy::Modulo => (0..total_partitions)
                .filter(|p| p % total_workers == worker_index)
                .map(|p| p as i32)
                .collect(),
        };
        Ok(Assignment {
            total_partitions,
            total_workers,
            worker_index,
            strategy,
            partitions,
        })
    }

    fn range_of(total_partitions: u32, total_workers: u32, worker_index: u32) -> (u32, u32) {
        let base = total_partitions / total_workers;
        let remainder = total_partitions % total_workers;
        let start = worker_index * base + worker_index.min(remainder);
        let len = base + u32::from(worker_index < remainder);
        (start, len)
    }

    /// Owned partition ids, ascending. May be empty when there are more
    /// workers than partitions.
    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    pub fn owns(&self, partition_id: i32) -> bool {
        self.partitions.binary_search(&partition_id).is_ok()
    }

    /// Worker index owning `partition_id` under the same topology.
    pub fn owner_of(&self, partition_id: i32) -> Option<u32> {
        if partition_id < 0 || partition_id as u32 >= self.total_partitions {
            return None;
        }
        let partition = partition_id as u32;
        match self.strategy {
            AssignmentStrategy::Modulo => Some(partition % self.total_workers),
            AssignmentStrategy::Range => (0..self.total_workers).find(|worker| {
                let (start, len) = Self::range_of(self.total_partitions, self.total_workers, *worker);
                (start..start + len).contains(&partition)
            }),
        }
    }

    pub fn total_partitions(&self) -> u32 {
        self.total_partitions
    }

    pub fn total_workers(&self) -> u32 {
        self.total_workers
    }

    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    pub fn strategy(&self) -> AssignmentStrategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn sixteen_partitions_two_workers() {
        let first = Assignment::compute(16, 2, 0, AssignmentStrategy::Range).unwrap();
        let second = Assignment::compute(16, 2, 1, AssignmentStrategy::Range).unwrap();
        assert_eq!(first.partitions(), (0..8).collect::<Vec<_>>().as_slice());
        assert_eq!(second.partitions(), (8..16).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn uneven_range_front_loads_the_remainder() {
        let sizes: Vec<usize> = (0..3)
            .map(|i| {
                Assignment::compute(10, 3, i, AssignmentStrategy::Range)
                    .unwrap()
                    .partitions()
                    .len()
            })
            .collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn every_partition_has_exactly_one_owner() {
        for strategy in [AssignmentStrategy::Range, AssignmentStrategy::Modulo] {
            for partitions in 1..=17u32 {
                for workers in 1..=6u32 {
                    let mut seen = BTreeSet::new();
                    for index in 0..workers {
                        let assignment =
                            Assignment::compute(partitions, workers, index, strategy).unwrap();
                        for p in assignment.partitions() {
                            assert!(seen.insert(*p), "{p} assigned twice");
                            assert_eq!(assignment.owner_of(*p), Some(index));
                        }
                    }
                    assert_eq!(seen.len(), partitions as usize);
                }
            }
        }
    }

    #[test]
    fn modulo_interleaves() {
        let assignment = Assignment::compute(8, 3, 1, AssignmentStrategy::Modulo).unwrap();
        assert_eq!(assignment.partitions(), &[1, 4, 7]);
        assert!(assignment.owns(4));
        assert!(!assignment.owns(5));
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        for (partitions, workers, index) in [(0, 1, 0), (4, 0, 0), (4, 2, 2)] {
            assert!(matches!(
                Assignment::compute(partitions, workers, index, AssignmentStrategy::Range),
                Err(AppError::InvalidAssignment(_))
            ));
        }
    }

    #[test]
    fn more_workers_than_partitions() {
        let idle = Assignment::compute(2, 4, 3, AssignmentStrategy::Range).unwrap();
        assert!(idle.partitions().is_empty());
        assert_eq!(idle.owner_of(1), Some(1));
        assert_eq!(idle.owner_of(2), None);
    }
}
