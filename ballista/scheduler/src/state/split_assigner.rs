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

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use ballista_core::error::{BallistaError, Result};
use ballista_core::serde::scheduler::{CatalogHandle, PlanNodeId};
use ballista_core::split::Split;

use crate::state::partition::{NodeRequirements, Partition, PartitionUpdate};
use crate::state::partitioning_scheme::PartitioningScheme;

/// Outcome of a single [`SplitAssigner`] call.
///
/// The lists are applied in order: new partitions first, then updates, then
/// sealed partitions. A sealed partition never receives another update.
#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    pub partitions_added: Vec<Partition>,
    pub no_more_partitions: bool,
    pub partition_updates: Vec<PartitionUpdate>,
    pub sealed_partitions: Vec<usize>,
}

impl AssignmentResult {
    pub fn builder() -> AssignmentResultBuilder {
        AssignmentResultBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions_added.is_empty()
            && !self.no_more_partitions
            && self.partition_updates.is_empty()
            && self.sealed_partitions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AssignmentResultBuilder {
    result: AssignmentResult,
}

impl AssignmentResultBuilder {
    pub fn add_partition(mut self, partition: Partition) -> Self {
        self.result.partitions_added.push(partition);
        self
    }

    pub fn update_partition(mut self, update: PartitionUpdate) -> Self {
        self.result.partition_updates.push(update);
        self
    }

    pub fn seal_partition(mut self, partition_id: usize) -> Self {
        self.result.sealed_partitions.push(partition_id);
        self
    }

    pub fn set_no_more_partitions(mut self) -> Self {
        self.result.no_more_partitions = true;
        self
    }

    pub fn build(self) -> AssignmentResult {
        self.result
    }
}

/// Policy grouping incoming splits into partitions.
///
/// Calls are never concurrent. Any error is terminal for the stage and the
/// call is not retried.
pub trait SplitAssigner: Send {
    /// Assign a batch of splits of `plan_node_id`, already grouped by partition.
    fn assign(
        &mut self,
        plan_node_id: &PlanNodeId,
        splits: HashMap<usize, Vec<Split>>,
        no_more_splits: bool,
    ) -> Result<AssignmentResult>;

    /// Called once after every source finished.
    fn finish(&mut self) -> Result<AssignmentResult>;
}

/// Creates partitions as their ids show up and seals all of them once every
/// source of the stage finished.
///
/// A stage without any input still gets partition 0, so that it runs at
/// least one task.
pub struct DefaultSplitAssigner {
    catalog_requirement: Option<CatalogHandle>,
    all_sources: HashSet<PlanNodeId>,
    partitioning_scheme: Arc<PartitioningScheme>,
    partitions: BTreeSet<usize>,
    finished_sources: BTreeSet<PlanNodeId>,
    sealed: bool,
    finished: bool,
}

impl DefaultSplitAssigner {
    pub fn new(
        catalog_requirement: Option<CatalogHandle>,
        all_sources: HashSet<PlanNodeId>,
        partitioning_scheme: Arc<PartitioningScheme>,
    ) -> Self {
        Self {
            catalog_requirement,
            all_sources,
            partitioning_scheme,
            partitions: BTreeSet::new(),
            finished_sources: BTreeSet::new(),
            sealed: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn node_requirements(&self, partition_id: usize) -> NodeRequirements {
        NodeRequirements::new(
            self.catalog_requirement.clone(),
            self.partitioning_scheme
                .node_requirement(partition_id)
                .cloned()
                .into_iter()
                .collect(),
        )
    }

    fn all_sources_finished(&self) -> bool {
        self.all_sources
            .iter()
            .all(|source| self.finished_sources.contains(source))
    }
}

impl SplitAssigner for DefaultSplitAssigner {
    fn assign(
        &mut self,
        plan_node_id: &PlanNodeId,
        splits: HashMap<usize, Vec<Split>>,
        no_more_splits: bool,
    ) -> Result<AssignmentResult> {
        if self.finished {
            return Err(BallistaError::Internal(format!(
                "splits of {plan_node_id} assigned after the assigner finished"
            )));
        }
        if !self.all_sources.contains(plan_node_id) {
            return Err(BallistaError::Internal(format!(
                "splits assigned for undeclared plan node {plan_node_id}"
            )));
        }
        if self.finished_sources.contains(plan_node_id) {
            return Err(BallistaError::Internal(format!(
                "splits of {plan_node_id} assigned after it finished"
            )));
        }

        let mut result = AssignmentResult::builder();
        let mut splits = splits.into_iter().collect::<Vec<_>>();
        splits.sort_by_key(|(partition_id, _)| *partition_id);
        for (partition_id, partition_splits) in splits {
            if self.sealed {
                return Err(BallistaError::Internal(format!(
                    "split for partition {partition_id} arrived after all partitions were sealed"
                )));
            }
            if self.partitions.insert(partition_id) {
                result = result.add_partition(Partition::new(
                    partition_id,
                    self.node_requirements(partition_id),
                ));
                for finished_source in &self.finished_sources {
                    result = result.update_partition(PartitionUpdate::new(
                        partition_id,
                        finished_source.clone(),
                        vec![],
                        true,
                    ));
                }
            }
            result = result.update_partition(PartitionUpdate::new(
                partition_id,
                plan_node_id.clone(),
                partition_splits,
                no_more_splits,
            ));
        }

        if no_more_splits {
            self.finished_sources.insert(plan_node_id.clone());
            for partition_id in &self.partitions {
                result = result.update_partition(PartitionUpdate::new(
                    *partition_id,
                    plan_node_id.clone(),
                    vec![],
                    true,
                ));
            }
        }

        if !self.sealed && self.all_sources_finished() {
            self.sealed = true;
            for partition_id in &self.partitions {
                result = result.seal_partition(*partition_id);
            }
        }

        Ok(result.build())
    }

    fn finish(&mut self) -> Result<AssignmentResult> {
        if self.finished {
            return Err(BallistaError::Internal(
                "split assigner is already finished".to_owned(),
            ));
        }
        if !self.all_sources_finished() {
            let pending = self
                .all_sources
                .iter()
                .filter(|source| !self.finished_sources.contains(*source))
                .map(|source| source.to_string())
                .collect::<Vec<_>>();
            return Err(BallistaError::Internal(format!(
                "split assigner finished while sources {pending:?} are still running"
            )));
        }
        self.finished = true;

        let mut result = AssignmentResult::builder();
        if self.partitions.is_empty() {
            self.partitions.insert(0);
            result = result
                .add_partition(Partition::new(0, self.node_requirements(0)))
                .seal_partition(0);
        }
        Ok(result.set_no_more_partitions().build())
    }
}
