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

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use ballista_core::error::{BallistaError, Result};
use ballista_core::serde::scheduler::HostAddress;
use ballista_core::split::Split;

/// Maps a split to the bucket of the table it scans.
pub type SplitToBucketFn = Arc<dyn Fn(&Split) -> Result<usize> + Send + Sync>;

/// Describes how the input of a stage is divided into partitions, each of
/// which becomes a task.
///
/// The mapping is pure: a split always lands in the same partition no matter
/// how often it is asked for. Exchange handles carry the partition assigned
/// by the producing stage and never go through this mapping.
#[derive(Clone)]
pub struct PartitioningScheme {
    partition_count: usize,
    bucket_to_partition: Option<Vec<usize>>,
    split_to_bucket: Option<SplitToBucketFn>,
    partition_to_node: Option<Vec<HostAddress>>,
}

impl PartitioningScheme {
    /// Every split maps to partition 0.
    pub fn single() -> Self {
        Self {
            partition_count: 1,
            bucket_to_partition: None,
            split_to_bucket: None,
            partition_to_node: None,
        }
    }

    pub fn bucketed(
        partition_count: usize,
        bucket_to_partition: Vec<usize>,
        split_to_bucket: SplitToBucketFn,
    ) -> Result<Self> {
        if let Some(partition) = bucket_to_partition
            .iter()
            .find(|partition| **partition >= partition_count)
        {
            return Err(BallistaError::Internal(format!(
                "bucket is mapped to partition {partition} but only {partition_count} partitions exist"
            )));
        }
        Ok(Self {
            partition_count,
            bucket_to_partition: Some(bucket_to_partition),
            split_to_bucket: Some(split_to_bucket),
            partition_to_node: None,
        })
    }

    /// Pin every partition to a node. The index of the Vec is the partition id.
    pub fn with_partition_to_node(mut self, partition_to_node: Vec<HostAddress>) -> Result<Self> {
        if partition_to_node.len() != self.partition_count {
            return Err(BallistaError::Internal(format!(
                "partition to node mapping has {} entries, expected {}",
                partition_to_node.len(),
                self.partition_count
            )));
        }
        self.partition_to_node = Some(partition_to_node);
        Ok(self)
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn bucket_to_partition_map(&self) -> Option<&[usize]> {
        self.bucket_to_partition.as_deref()
    }

    pub fn partition(&self, split: &Split) -> Result<usize> {
        match (&self.split_to_bucket, &self.bucket_to_partition) {
            (Some(split_to_bucket), Some(bucket_to_partition)) => {
                let bucket = split_to_bucket(split)?;
                bucket_to_partition.get(bucket).copied().ok_or_else(|| {
                    BallistaError::Internal(format!(
                        "bucket {bucket} is out of range, bucket to partition map has {} entries",
                        bucket_to_partition.len()
                    ))
                })
            }
            (None, None) if self.partition_count == 1 => Ok(0),
            (None, None) => Err(BallistaError::Internal(format!(
                "split to bucket function is required for {} partitions",
                self.partition_count
            ))),
            _ => Err(BallistaError::Internal(
                "split to bucket function and bucket to partition map must be set together"
                    .to_owned(),
            )),
        }
    }

    /// The node a partition must run on, if partitions are pinned.
    pub fn node_requirement(&self, partition: usize) -> Option<&HostAddress> {
        self.partition_to_node
            .as_ref()
            .and_then(|nodes| nodes.get(partition))
    }
}

/// Use the bucket reported by the connector split.
pub fn connector_bucket(split: &Split) -> Result<usize> {
    split.connector_split().bucket().ok_or_else(|| {
        BallistaError::Internal(format!(
            "split {:?} of catalog {} has no bucket",
            split.connector_split(),
            split.catalog()
        ))
    })
}

impl Debug for PartitioningScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitioningScheme")
            .field("partition_count", &self.partition_count)
            .field("bucket_to_partition", &self.bucket_to_partition)
            .field("partition_to_node", &self.partition_to_node)
            .finish()
    }
}
