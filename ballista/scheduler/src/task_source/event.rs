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

use std::fmt::{Display, Formatter};

use ballista_core::error::Result;
use ballista_core::exchange::ExchangeSourceHandleBatch;
use ballista_core::serde::scheduler::{PlanFragmentId, PlanNodeId};
use ballista_core::split::SplitBatch;

/// A source the task source pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskSourceId {
    /// Split source of a table scan
    Split(PlanNodeId),
    /// Exchange handles produced by an upstream fragment
    Exchange(PlanFragmentId),
}

impl Display for TaskSourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskSourceId::Split(plan_node_id) => write!(f, "split source {plan_node_id}"),
            TaskSourceId::Exchange(fragment_id) => write!(f, "exchange of {fragment_id}"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum SourceBatch {
    Splits(SplitBatch),
    Handles(ExchangeSourceHandleBatch),
}

#[derive(Debug)]
pub(crate) enum TaskSourceEvent {
    /// Open every source and request the first batches
    Start,
    BatchFetched {
        source: TaskSourceId,
        result: Result<SourceBatch>,
    },
}
