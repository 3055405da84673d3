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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ballista_core::exchange::{ExchangeSourceHandle, ExchangeSourceHandleSource};
use ballista_core::split::Split;

/// Packs the handles of one exchange into remote splits.
///
/// Handles are buffered per partition id until the buffered data reaches the
/// target split size. Whatever is buffered when the exchange reports its last
/// batch is flushed.
pub(crate) struct ExchangeSplitSource {
    handle_source: Arc<dyn ExchangeSourceHandleSource>,
    target_split_size_in_bytes: u64,
    buffers: BTreeMap<usize, HandleBuffer>,
}

#[derive(Default)]
struct HandleBuffer {
    handles: Vec<Arc<dyn ExchangeSourceHandle>>,
    size_in_bytes: u64,
}

impl ExchangeSplitSource {
    pub(crate) fn new(
        handle_source: Arc<dyn ExchangeSourceHandleSource>,
        target_split_size_in_bytes: u64,
    ) -> Self {
        Self {
            handle_source,
            target_split_size_in_bytes,
            buffers: BTreeMap::new(),
        }
    }

    pub(crate) fn handle_source(&self) -> Arc<dyn ExchangeSourceHandleSource> {
        self.handle_source.clone()
    }

    /// Buffer a batch of handles, returning the remote splits that are complete.
    pub(crate) fn add_handles(
        &mut self,
        handles: Vec<Arc<dyn ExchangeSourceHandle>>,
        last_batch: bool,
    ) -> HashMap<usize, Vec<Split>> {
        let mut splits: HashMap<usize, Vec<Split>> = HashMap::new();
        for handle in handles {
            let partition_id = handle.partition_id();
            let buffer = self.buffers.entry(partition_id).or_default();
            buffer.size_in_bytes = buffer
                .size_in_bytes
                .saturating_add(handle.data_size_in_bytes());
            buffer.handles.push(handle);
            if buffer.size_in_bytes >= self.target_split_size_in_bytes {
                let buffer = std::mem::take(buffer);
                splits
                    .entry(partition_id)
                    .or_default()
                    .push(Split::remote(buffer.handles));
            }
        }
        if last_batch {
            for (partition_id, buffer) in std::mem::take(&mut self.buffers) {
                if !buffer.handles.is_empty() {
                    splits
                        .entry(partition_id)
                        .or_default()
                        .push(Split::remote(buffer.handles));
                }
            }
        }
        splits
    }

    pub(crate) fn buffered_handles(&self) -> usize {
        self.buffers.values().map(|b| b.handles.len()).sum()
    }
}
