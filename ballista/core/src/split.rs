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

//! Splits and the asynchronous sources which produce them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::exchange::ExchangeSourceHandle;
use crate::serde::scheduler::{CatalogHandle, PlanNodeId};

/// Connector specific description of a unit of scannable data.
pub trait ConnectorSplit: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Bucket of a bucketed table this split belongs to, if any.
    fn bucket(&self) -> Option<usize> {
        None
    }
}

/// A connector split tagged with the catalog it was produced by.
#[derive(Debug, Clone)]
pub struct Split {
    catalog: CatalogHandle,
    connector_split: Arc<dyn ConnectorSplit>,
}

impl Split {
    pub fn new(catalog: CatalogHandle, connector_split: Arc<dyn ConnectorSplit>) -> Self {
        Self {
            catalog,
            connector_split,
        }
    }

    /// Wrap a set of exchange source handles into a split of the remote catalog.
    pub fn remote(handles: Vec<Arc<dyn ExchangeSourceHandle>>) -> Self {
        Self::new(CatalogHandle::remote(), Arc::new(RemoteSplit::new(handles)))
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    pub fn connector_split(&self) -> &Arc<dyn ConnectorSplit> {
        &self.connector_split
    }

    /// The remote split carried by this split, if it reads exchange output.
    pub fn as_remote(&self) -> Option<&RemoteSplit> {
        if !self.catalog.is_remote() {
            return None;
        }
        self.connector_split.as_any().downcast_ref::<RemoteSplit>()
    }
}

/// Split reading previously written exchange output.
#[derive(Debug, Clone)]
pub struct RemoteSplit {
    handles: Vec<Arc<dyn ExchangeSourceHandle>>,
}

impl RemoteSplit {
    pub fn new(handles: Vec<Arc<dyn ExchangeSourceHandle>>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &[Arc<dyn ExchangeSourceHandle>] {
        &self.handles
    }

    pub fn data_size_in_bytes(&self) -> u64 {
        self.handles.iter().map(|h| h.data_size_in_bytes()).sum()
    }
}

impl ConnectorSplit for RemoteSplit {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SplitBatch {
    pub splits: Vec<Split>,
    pub last_batch: bool,
}

impl SplitBatch {
    pub fn new(splits: Vec<Split>, last_batch: bool) -> Self {
        Self { splits, last_batch }
    }
}

/// Source of splits for a single table scan.
///
/// At most one `get_next_batch` call is outstanding at any time. The token is
/// cancelled once the caller is no longer interested in the result.
#[async_trait]
pub trait SplitSource: Send + Sync {
    async fn get_next_batch(
        &self,
        max_size: usize,
        cancellation: CancellationToken,
    ) -> Result<SplitBatch>;

    /// Release all resources. Must be idempotent.
    fn close(&self) -> Result<()>;

    fn is_finished(&self) -> bool;
}

/// Creates the split sources of a stage's table scans.
pub trait SplitSourceFactory: Send + Sync {
    fn create_split_sources(&self) -> Result<HashMap<PlanNodeId, Arc<dyn SplitSource>>>;
}

impl<F> SplitSourceFactory for F
where
    F: Fn() -> Result<HashMap<PlanNodeId, Arc<dyn SplitSource>>> + Send + Sync,
{
    fn create_split_sources(&self) -> Result<HashMap<PlanNodeId, Arc<dyn SplitSource>>> {
        self()
    }
}
