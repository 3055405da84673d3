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

//! Handles to shuffle output written by upstream stages.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Reference to a readable range of an exchange's output. The partition id is
/// assigned by the producing stage.
pub trait ExchangeSourceHandle: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn partition_id(&self) -> usize;

    fn data_size_in_bytes(&self) -> u64;
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeSourceHandleBatch {
    pub handles: Vec<Arc<dyn ExchangeSourceHandle>>,
    pub last_batch: bool,
}

impl ExchangeSourceHandleBatch {
    pub fn new(handles: Vec<Arc<dyn ExchangeSourceHandle>>, last_batch: bool) -> Self {
        Self {
            handles,
            last_batch,
        }
    }
}

#[async_trait]
pub trait ExchangeSourceHandleSource: Send + Sync {
    async fn get_next_batch(
        &self,
        cancellation: CancellationToken,
    ) -> Result<ExchangeSourceHandleBatch>;

    /// Release all resources. Must be idempotent.
    fn close(&self) -> Result<()>;
}

pub trait Exchange: Send + Sync {
    /// Source of the handles of this exchange. Can be retrieved only once.
    fn source_handles(&self) -> Result<Arc<dyn ExchangeSourceHandleSource>>;
}
