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

//! Ballista scheduler specific configuration

use ballista_core::error::{BallistaError, Result};

/// Configurations for the ballista scheduler of scheduling stage tasks
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The event loop buffer size. for a system of high throughput, a larger value like 1000000 is recommended
    pub event_loop_buffer_size: u32,
    /// Maximum number of splits requested from a split source in one batch
    pub split_batch_size: usize,
    /// Exchange handles of one partition are packed into a remote split until it holds this many bytes
    pub target_exchange_split_size_in_bytes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_loop_buffer_size: 10000,
            split_batch_size: 1000,
            target_exchange_split_size_in_bytes: 64 * 1024 * 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn with_event_loop_buffer_size(mut self, buffer_size: u32) -> Self {
        self.event_loop_buffer_size = buffer_size;
        self
    }

    pub fn with_split_batch_size(mut self, split_batch_size: usize) -> Self {
        self.split_batch_size = split_batch_size;
        self
    }

    pub fn with_target_exchange_split_size_in_bytes(mut self, size: u64) -> Self {
        self.target_exchange_split_size_in_bytes = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_loop_buffer_size == 0 {
            return Err(BallistaError::General(
                "event_loop_buffer_size must be greater than 0".to_owned(),
            ));
        }
        if self.split_batch_size == 0 {
            return Err(BallistaError::General(
                "split_batch_size must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}
