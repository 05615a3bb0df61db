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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

pub use assignment::{Assignment, AssignmentStrategy};

use crate::checkpoint::{CheckpointKeyspace, CheckpointStore};
use crate::partition::{DeadLetterHandler, PartitionManager, PartitionSettings, PartitionStatus};
use crate::reader::LogClient;
use crate::{AppError, AppResult, SpoutConfig};

mod assignment;

type ManagerRef<C, S> = Arc<PartitionManager<C, S>>;

/// Owns the partition managers of this worker.
///
/// The set of partitions comes from a deterministic split of all partitions
/// over the worker pool, so workers agree on ownership without talking to
/// each other. The split only changes through `rebalance`.
pub struct PartitionCoordinator<C: LogClient, S: CheckpointStore> {
    client: Arc<C>,
    store: Arc<S>,
    settings: PartitionSettings,
    keyspace: CheckpointKeyspace,
    dead_letter: Arc<dyn DeadLetterHandler>,
    max_restarts: u32,
    assignment: RwLock<Assignment>,
    managers: RwLock<BTreeMap<i32, ManagerRef<C, S>>>,
    /// Restarts per partition since it was acquired.
    restarts: Mutex<HashMap<i32, u32>>,
}

impl<C: LogClient, S: CheckpointStore> PartitionCoordinator<C, S> {
    pub fn new(
        config: &SpoutConfig,
        client: Arc<C>,
        store: Arc<S>,
        dead_letter: Arc<dyn DeadLetterHandler>,
    ) -> AppResult<Self> {
        let assignment = Assignment::compute(
            config.eventhub.partition_count,
            config.coordinator.total_workers,
            config.coordinator.worker_index,
            config.coordinator.strategy,
        )?;
        let coordinator = Self {
            client,
            store,
            settings: config.partition_settings(),
            keyspace: config.keyspace(),
            dead_letter,
            max_restarts: config.coordinator.max_restarts,
            assignment: RwLock::new(assignment.clone()),
            managers: RwLock::new(BTreeMap::new()),
            restarts: Mutex::new(HashMap::new()),
        };

        let managers = assignment
            .partitions()
            .iter()
            .map(|partition_id| (*partition_id, coordinator.new_manager(*partition_id)))
            .collect();
        *coordinator.managers.write() = managers;
        info!(
            worker = assignment.worker_index(),
            workers = assignment.total_workers(),
            partitions = ?assignment.partitions(),
            "partition assignment computed"
        );
        Ok(coordinator)
    }

    fn new_manager(&self, partition_id: i32) -> ManagerRef<C, S> {
        Arc::new(PartitionManager::new(
            partition_id,
            self.client.clone(),
            self.store.clone(),
            self.keyspace.key(partition_id),
            self.settings.clone(),
            self.dead_letter.clone(),
        ))
    }

    /// Starts every owned partition. A partition that cannot start is left
    /// `Failed` for `supervise` and does not hold back the others. Errors
    /// that are not local to one partition, like starting twice, surface.
    pub async fn start(&self) -> AppResult<()> {
        for manager in self.partition_managers() {
            if let Err(e) = manager.start().await {
                if !e.is_partition_local() {
                    return Err(e);
                }
                error!(
                    partition = manager.partition_id(),
                    error = %e,
                    "partition isolated after failing to start"
                );
            }
        }
        Ok(())
    }

    /// Replaces failed managers with fresh ones that resume from the stored
    /// checkpoint. Fails once a partition used up its restarts.
    pub async fn supervise(&self) -> AppResult<()> {
        let failed: Vec<ManagerRef<C, S>> = self
            .managers
            .read()
            .values()
            .filter(|manager| manager.status() == PartitionStatus::Failed)
            .cloned()
            .collect();

        for manager in failed {
            let partition_id = manager.partition_id();
            let restarts = {
                let mut restarts = self.restarts.lock();
                let used = restarts.entry(partition_id).or_insert(0);
                if *used >= self.max_restarts {
                    return Err(AppError::PartitionExhausted {
                        partition_id,
                        restarts: *used,
                    });
                }
                *used += 1;
                *used
            };
            warn!(partition = partition_id, restarts, "restarting failed partition");

            manager.stop().await;
            let fresh = self.new_manager(partition_id);
            let replaced = self.managers.write().insert(partition_id, fresh.clone());
            if replaced.is_none() {
                // released by a rebalance meanwhile
                self.managers.write().remove(&partition_id);
                continue;
            }
            if let Err(e) = fresh.start().await {
                error!(partition = partition_id, error = %e, "partition restart failed");
            }
        }
        Ok(())
    }

    /// Moves to a new worker topology: partitions no longer owned are stopped
    /// with a final checkpoint, newly owned ones are started.
    pub async fn rebalance(&self, total_workers: u32, worker_index: u32) -> AppResult<()> {
        let (next, released, acquired) = {
            let current = self.assignment.read();
            let next = Assignment::compute(
                current.total_partitions(),
                total_workers,
                worker_index,
                current.strategy(),
            )?;
            let released: Vec<i32> = current
                .partitions()
                .iter()
                .copied()
                .filter(|p| !next.owns(*p))
                .collect();
            let acquired: Vec<i32> = next
                .partitions()
                .iter()
                .copied()
                .filter(|p| !current.owns(*p))
                .collect();
            (next, released, acquired)
        };

        for partition_id in &released {
            let manager = self.managers.write().remove(partition_id);
            self.restarts.lock().remove(partition_id);
            if let Some(manager) = manager {
                manager.stop().await;
            }
        }
        *self.assignment.write() = next;

        for partition_id in &acquired {
            let manager = self.new_manager(*partition_id);
            self.managers.write().insert(*partition_id, manager.clone());
            if let Err(e) = manager.start().await {
                error!(partition = partition_id, error = %e, "acquired partition failed to start");
            }
        }
        info!(
            worker = worker_index,
            workers = total_workers,
            ?released,
            ?acquired,
            "rebalanced"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        for manager in self.partition_managers() {
            manager.stop().await;
        }
    }

    /// Managers of the owned partitions, by partition id.
    pub fn partition_managers(&self) -> Vec<ManagerRef<C, S>> {
        self.managers.read().values().cloned().collect()
    }

    pub fn manager_for(&self, partition_id: i32) -> Option<ManagerRef<C, S>> {
        self.managers.read().get(&partition_id).cloned()
    }

    pub fn assignment(&self) -> Assignment {
        self.assignment.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::partition::LogAndDrop;
    use crate::reader::{MemoryLogClient, StartPosition};
    use crate::service::setup_local_tracing;
    use rstest::{fixture, rstest};

    type Coordinator = PartitionCoordinator<MemoryLogClient, MemoryCheckpointStore>;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    fn config(partitions: u32, workers: u32, index: u32) -> SpoutConfig {
        let mut config = SpoutConfig::default();
        config.eventhub.partition_count = partitions;
        config.coordinator.total_workers = workers;
        config.coordinator.worker_index = index;
        config.coordinator.max_restarts = 2;
        config.receiver.receive_timeout_ms = 20;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 1;
        config.retry.max_attempts = 0;
        config
    }

    fn coordinator(
        config: &SpoutConfig,
        client: &Arc<MemoryLogClient>,
        store: &Arc<MemoryCheckpointStore>,
    ) -> Coordinator {
        PartitionCoordinator::new(config, client.clone(), store.clone(), Arc::new(LogAndDrop))
            .unwrap()
    }

    fn owned(coordinator: &Coordinator) -> Vec<i32> {
        coordinator
            .partition_managers()
            .iter()
            .map(|manager| manager.partition_id())
            .collect()
    }

    #[rstest]
    #[tokio::test]
    async fn starts_only_assigned_partitions(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(4));
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(4, 2, 1), &client, &store);
        coordinator.start().await.unwrap();

        assert_eq!(owned(&coordinator), vec![2, 3]);
        assert!(coordinator.manager_for(0).is_none());
        for manager in coordinator.partition_managers() {
            assert_eq!(manager.status(), PartitionStatus::Active);
        }
        assert!(client.connect_history(0).is_empty());
        coordinator.stop().await;
    }

    #[rstest]
    #[tokio::test]
    async fn starting_twice_is_not_isolated(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(2));
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(2, 1, 0), &client, &store);
        coordinator.start().await.unwrap();

        let result = coordinator.start().await;
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
        assert!(!result.unwrap_err().is_partition_local());
        for manager in coordinator.partition_managers() {
            assert_eq!(manager.status(), PartitionStatus::Active);
        }
        coordinator.stop().await;
    }

    #[rstest]
    #[tokio::test]
    async fn failing_partition_is_isolated_and_restarted(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(2));
        client.fail_next_connects(0, 1);
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(2, 1, 0), &client, &store);
        coordinator.start().await.unwrap();

        let failed = coordinator.manager_for(0).unwrap();
        assert_eq!(failed.status(), PartitionStatus::Failed);
        assert_eq!(
            coordinator.manager_for(1).unwrap().status(),
            PartitionStatus::Active
        );

        coordinator.supervise().await.unwrap();
        let restarted = coordinator.manager_for(0).unwrap();
        assert!(!Arc::ptr_eq(&failed, &restarted));
        assert_eq!(restarted.status(), PartitionStatus::Active);
        coordinator.stop().await;
    }

    #[rstest]
    #[tokio::test]
    async fn restarts_are_bounded(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(1));
        client.fail_next_connects(0, 100);
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(1, 1, 0), &client, &store);
        coordinator.start().await.unwrap();

        coordinator.supervise().await.unwrap();
        coordinator.supervise().await.unwrap();
        let result = coordinator.supervise().await;
        assert!(matches!(
            result,
            Err(AppError::PartitionExhausted {
                partition_id: 0,
                restarts: 2
            })
        ));
        coordinator.stop().await;
    }

    #[rstest]
    #[tokio::test]
    async fn rebalance_hands_partitions_over_at_the_checkpoint(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(4));
        client.append(3, ["a", "b", "c"]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(4, 1, 0), &client, &store);
        coordinator.start().await.unwrap();
        assert_eq!(owned(&coordinator), vec![0, 1, 2, 3]);

        let manager = coordinator.manager_for(3).unwrap();
        for _ in 0..2 {
            let message = manager.pull().await.unwrap();
            manager.ack(&message.id);
        }

        coordinator.rebalance(2, 0).await.unwrap();
        assert_eq!(owned(&coordinator), vec![0, 1]);
        assert_eq!(manager.status(), PartitionStatus::Closed);
        let key = store_key(3);
        assert_eq!(store.get(&key), Some(1));

        coordinator.rebalance(2, 1).await.unwrap();
        assert_eq!(owned(&coordinator), vec![2, 3]);
        assert_eq!(
            client.connect_history(3).last(),
            Some(&StartPosition::Offset(2))
        );
        let resumed = coordinator.manager_for(3).unwrap().pull().await.unwrap();
        assert_eq!(resumed.id.offset, 2);
        coordinator.stop().await;
    }

    #[rstest]
    #[tokio::test]
    async fn invalid_rebalance_keeps_the_assignment(_setup: ()) {
        let client = Arc::new(MemoryLogClient::new(4));
        let store = Arc::new(MemoryCheckpointStore::new());
        let coordinator = coordinator(&config(4, 2, 0), &client, &store);

        let result = coordinator.rebalance(2, 5).await;
        assert!(matches!(result, Err(AppError::InvalidAssignment(_))));
        assert_eq!(coordinator.assignment().partitions(), &[0, 1]);
    }

    #[test]
    fn invalid_topology_fails_construction() {
        let client = Arc::new(MemoryLogClient::new(4));
        let store = Arc::new(MemoryCheckpointStore::new());
        let result = PartitionCoordinator::new(
            &config(4, 0, 0),
            client,
            store,
            Arc::new(LogAndDrop),
        );
        assert!(matches!(result, Err(AppError::InvalidAssignment(_))));
    }

    fn store_key(partition_id: i32) -> String {
        SpoutConfig::default().keyspace().key(partition_id)
    }
}
