// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::{HashMap, HashSet};

use log::debug;
use serde::{Deserialize, Serialize};

use ballista_core::error::{BallistaError, Result};
use ballista_core::serde::scheduler::{CatalogHandle, HostAddress, PlanNodeId};
use ballista_core::split::Split;

/// Placement constraints of a partition, fixed when the partition is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequirements {
    /// Catalog the executing node must have available
    pub catalog: Option<CatalogHandle>,
    /// If not empty, the task must run on one of these hosts
    pub addresses: HashSet<HostAddress>,
}

impl NodeRequirements {
    pub fn new(catalog: Option<CatalogHandle>, addresses: HashSet<HostAddress>) -> Self {
        Self { catalog, addresses }
    }

    /// No placement constraints.
    pub fn any() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub partition_id: usize,
    pub node_requirements: NodeRequirements,
}

impl Partition {
    pub fn new(partition_id: usize, node_requirements: NodeRequirements) -> Self {
        Self {
            partition_id,
            node_requirements,
        }
    }
}

/// Splits of one plan node added to a partition.
#[derive(Debug, Clone)]
pub struct PartitionUpdate {
    pub partition_id: usize,
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<Split>,
    /// No more splits will arrive for this partition from `plan_node_id`
    pub no_more_splits: bool,
}

impl PartitionUpdate {
    pub fn new(
        partition_id: usize,
        plan_node_id: PlanNodeId,
        splits: Vec<Split>,
        no_more_splits: bool,
    ) -> Self {
        Self {
            partition_id,
            plan_node_id,
            splits,
            no_more_splits,
        }
    }
}

/// The finalized input of one task.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub partition_id: usize,
    /// Splits to read, per plan node
    pub splits: HashMap<PlanNodeId, Vec<Split>>,
    pub node_requirements: NodeRequirements,
}

impl TaskDescriptor {
    pub fn split_count(&self) -> usize {
        self.splits.values().map(|splits| splits.len()).sum()
    }
}

/// Accumulated state of a partition which is not sealed yet.
#[derive(Debug)]
struct OpenPartition {
    node_requirements: NodeRequirements,
    splits: HashMap<PlanNodeId, Vec<Split>>,
    finished_sources: HashSet<PlanNodeId>,
}

/// Splits accumulated per partition until the partition is sealed.
///
/// Only open partitions retain their splits, sealed ones are turned into a
/// [`TaskDescriptor`] and released.
#[derive(Debug)]
pub(crate) struct PartitionTable {
    declared_sources: HashSet<PlanNodeId>,
    open: HashMap<usize, OpenPartition>,
    sealed: HashSet<usize>,
}

impl PartitionTable {
    pub(crate) fn new(declared_sources: HashSet<PlanNodeId>) -> Self {
        Self {
            declared_sources,
            open: HashMap::new(),
            sealed: HashSet::new(),
        }
    }

    pub(crate) fn add_partition(&mut self, partition: &Partition) -> Result<()> {
        let partition_id = partition.partition_id;
        if self.open.contains_key(&partition_id) || self.sealed.contains(&partition_id) {
            return Err(BallistaError::Internal(format!(
                "partition {partition_id} is already created"
            )));
        }
        self.open.insert(
            partition_id,
            OpenPartition {
                node_requirements: partition.node_requirements.clone(),
                splits: HashMap::new(),
                finished_sources: HashSet::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn update_partition(&mut self, update: &PartitionUpdate) -> Result<()> {
        let partition_id = update.partition_id;
        if !self.declared_sources.contains(&update.plan_node_id) {
            return Err(BallistaError::Internal(format!(
                "update of partition {partition_id} references undeclared plan node {}",
                update.plan_node_id
            )));
        }
        if self.sealed.contains(&partition_id) {
            return Err(BallistaError::Internal(format!(
                "partition {partition_id} is sealed and cannot be updated"
            )));
        }
        let partition = self.open.get_mut(&partition_id).ok_or_else(|| {
            BallistaError::Internal(format!("partition {partition_id} is not created"))
        })?;
        if partition.finished_sources.contains(&update.plan_node_id) {
            if !update.splits.is_empty() {
                return Err(BallistaError::Internal(format!(
                    "plan node {} already finished for partition {partition_id}",
                    update.plan_node_id
                )));
            }
        } else if update.no_more_splits {
            partition
                .finished_sources
                .insert(update.plan_node_id.clone());
        }
        if !update.splits.is_empty() {
            partition
                .splits
                .entry(update.plan_node_id.clone())
                .or_default()
                .extend(update.splits.iter().cloned());
        }
        Ok(())
    }

    /// Seal a partition and build its descriptor.
    pub(crate) fn seal_partition(&mut self, partition_id: usize) -> Result<TaskDescriptor> {
        if self.sealed.contains(&partition_id) {
            return Err(BallistaError::Internal(format!(
                "partition {partition_id} is already sealed"
            )));
        }
        let partition = self.open.remove(&partition_id).ok_or_else(|| {
            BallistaError::Internal(format!("partition {partition_id} is not created"))
        })?;
        self.sealed.insert(partition_id);
        debug!(
            "Sealed partition {} with splits from {} plan nodes",
            partition_id,
            partition.splits.len()
        );
        Ok(TaskDescriptor {
            partition_id,
            splits: partition.splits,
            node_requirements: partition.node_requirements,
        })
    }

    pub(crate) fn open_partitions(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn sealed_partitions(&self) -> usize {
        self.sealed.len()
    }

    /// Drop all accumulated splits.
    pub(crate) fn clear(&mut self) {
        self.open.clear();
    }
}
