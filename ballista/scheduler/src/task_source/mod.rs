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

//! Discovers the input of a stage and groups it into tasks.
//!
//! An [`EventDrivenTaskSource`] pulls batches from every split source and
//! exchange of a stage concurrently. Each batch is mapped to partitions by the
//! [`PartitioningScheme`], handed to the [`SplitAssigner`], and the resulting
//! partition changes are reported to a [`TaskSourceCallback`]. Once a partition
//! is sealed its splits are frozen into a [`TaskDescriptor`].
//!
//! All batches go through a single event loop, one at a time. Any failure is
//! terminal: outstanding requests are cancelled, every source is closed once,
//! and the first error is reported through [`TaskSourceCallback::failed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ballista_core::error::{BallistaError, Result};
use ballista_core::event_loop::EventLoop;
use ballista_core::exchange::{Exchange, ExchangeSourceHandleSource};
use ballista_core::serde::scheduler::{PlanFragmentId, PlanNodeId};
use ballista_core::split::{SplitSource, SplitSourceFactory};

use crate::config::SchedulerConfig;
use crate::state::partition::{Partition, PartitionUpdate, TaskDescriptor};
use crate::state::partitioning_scheme::PartitioningScheme;
use crate::state::split_assigner::SplitAssigner;
use crate::task_source::event::TaskSourceEvent;
use crate::task_source::task_source_scheduler::TaskSourceScheduler;

pub mod event;
mod exchange_split_source;
mod task_source_scheduler;

/// Observes the wall time of every `get_next_batch` call on a split source.
pub type GetSplitTimeRecorder = Arc<dyn Fn(Duration) + Send + Sync>;

/// Receives the partition lifecycle of a task source.
///
/// Notifications are delivered from the task source's event loop, one at a
/// time, and must not block. An error returned by a notification fails the
/// task source. `finished` and `failed` are mutually exclusive and are the
/// last calls the callback receives.
pub trait TaskSourceCallback: Send + Sync {
    fn partitions_added(&self, partitions: &[Partition]) -> Result<()>;

    fn partitions_updated(&self, partition_updates: &[PartitionUpdate]) -> Result<()>;

    fn partitions_sealed(&self, partition_ids: &[usize]) -> Result<()>;

    fn no_more_partitions(&self) -> Result<()>;

    fn finished(&self, task_descriptors: &[TaskDescriptor]);

    fn failed(&self, error: BallistaError);
}

/// The inputs of a stage.
pub struct StageSources {
    /// Exchange of every upstream fragment
    pub exchanges: HashMap<PlanFragmentId, Arc<dyn Exchange>>,
    /// Remote source plan node reading the output of each upstream fragment
    pub remote_sources: HashMap<PlanFragmentId, PlanNodeId>,
    /// Creates a split source per table scan, called once on start
    pub split_source_factory: Arc<dyn SplitSourceFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSourceStatus {
    Created,
    Running,
    Finished,
    Failed,
    Closed,
}

pub(crate) enum RegisteredSource {
    Split(PlanNodeId, Arc<dyn SplitSource>),
    Exchange(PlanFragmentId, Arc<dyn ExchangeSourceHandleSource>),
}

impl RegisteredSource {
    fn close(&self) {
        let (result, description) = match self {
            RegisteredSource::Split(plan_node_id, source) => {
                (source.close(), format!("split source {plan_node_id}"))
            }
            RegisteredSource::Exchange(fragment_id, source) => {
                (source.close(), format!("exchange source of {fragment_id}"))
            }
        };
        if let Err(e) = result {
            warn!("Fail to close {} due to {:?}", description, e);
        }
    }
}

/// Every source opened by a task source. Each one is closed exactly once.
#[derive(Default)]
pub(crate) struct SourceRegistry {
    inner: Mutex<SourceRegistryInner>,
}

#[derive(Default)]
struct SourceRegistryInner {
    closed: bool,
    sources: Vec<RegisteredSource>,
}

impl SourceRegistry {
    /// Track an opened source. Returns false, after closing the source, when
    /// the registry is already closed.
    pub(crate) fn register(&self, source: RegisteredSource) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.closed {
                inner.sources.push(source);
                return true;
            }
        }
        source.close();
        false
    }

    pub(crate) fn close_all(&self) {
        let sources = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.sources)
        };
        for source in sources {
            source.close();
        }
    }
}

/// State shared between a task source handle and its event loop.
pub(crate) struct TaskSourceShared {
    pub(crate) sources: SourceRegistry,
    cancellation: CancellationToken,
    state: Mutex<SharedState>,
}

struct SharedState {
    status: TaskSourceStatus,
    task_descriptors: Option<Vec<TaskDescriptor>>,
    suppressed: Vec<BallistaError>,
}

impl TaskSourceShared {
    fn new(cancellation: CancellationToken) -> Self {
        Self {
            sources: SourceRegistry::default(),
            cancellation,
            state: Mutex::new(SharedState {
                status: TaskSourceStatus::Created,
                task_descriptors: None,
                suppressed: vec![],
            }),
        }
    }

    fn status(&self) -> TaskSourceStatus {
        self.state.lock().status
    }

    fn set_running(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.status {
            TaskSourceStatus::Created => {
                state.status = TaskSourceStatus::Running;
                Ok(())
            }
            TaskSourceStatus::Closed => Err(BallistaError::General(
                "task source is already closed".to_owned(),
            )),
            status => Err(BallistaError::Internal(format!(
                "task source is already started, status is {status:?}"
            ))),
        }
    }

    pub(crate) fn try_finish(&self, task_descriptors: Vec<TaskDescriptor>) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskSourceStatus::Running {
            return false;
        }
        state.status = TaskSourceStatus::Finished;
        state.task_descriptors = Some(task_descriptors);
        true
    }

    pub(crate) fn try_fail(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskSourceStatus::Running {
            return false;
        }
        state.status = TaskSourceStatus::Failed;
        true
    }

    /// Move a non terminated task source to `Closed`, cancel outstanding
    /// requests and close every registered source.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(
                state.status,
                TaskSourceStatus::Created | TaskSourceStatus::Running
            ) {
                state.status = TaskSourceStatus::Closed;
            }
        }
        self.cancellation.cancel();
        self.sources.close_all();
    }

    pub(crate) fn add_suppressed(&self, error: BallistaError) {
        self.state.lock().suppressed.push(error);
    }
}

/// Task source of a single stage.
///
/// Requires a tokio runtime. The task source is closed when dropped.
pub struct EventDrivenTaskSource {
    job_id: String,
    stage_id: usize,
    event_loop: EventLoop<TaskSourceEvent>,
    shared: Arc<TaskSourceShared>,
}

impl EventDrivenTaskSource {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        job_id: &str,
        stage_id: usize,
        sources: StageSources,
        split_assigner: Box<dyn SplitAssigner>,
        partitioning_scheme: Arc<PartitioningScheme>,
        callback: Arc<dyn TaskSourceCallback>,
        config: Arc<SchedulerConfig>,
        get_split_time_recorder: Option<GetSplitTimeRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let unknown_fragments = sources
            .remote_sources
            .keys()
            .filter(|fragment_id| !sources.exchanges.contains_key(*fragment_id))
            .map(|fragment_id| fragment_id.to_string())
            .collect::<Vec<_>>();
        if !unknown_fragments.is_empty() {
            return Err(BallistaError::General(format!(
                "no exchange for remote source fragments {unknown_fragments:?}"
            )));
        }

        let cancellation = CancellationToken::new();
        let shared = Arc::new(TaskSourceShared::new(cancellation.clone()));
        let scheduler = TaskSourceScheduler::new(
            job_id.to_owned(),
            stage_id,
            config.clone(),
            sources,
            split_assigner,
            partitioning_scheme,
            callback,
            get_split_time_recorder,
            shared.clone(),
            cancellation.clone(),
        );
        let event_loop = EventLoop::new(
            format!("task_source_{job_id}_{stage_id}"),
            config.event_loop_buffer_size as usize,
            Box::new(scheduler),
        )
        .with_stop_token(cancellation);

        Ok(Self {
            job_id: job_id.to_owned(),
            stage_id,
            event_loop,
            shared,
        })
    }

    pub fn job_id(&self) -> &str {
        self.job_id.as_str()
    }

    pub fn stage_id(&self) -> usize {
        self.stage_id
    }

    /// Start pulling from all sources. Progress is reported to the callback.
    pub fn start(&mut self) -> Result<()> {
        self.shared.set_running()?;
        // the loop task is detached, it ends when the task source terminates or is closed
        let _ = self.event_loop.start()?;
        self.event_loop
            .get_sender()?
            .try_post_event(TaskSourceEvent::Start)
    }

    /// Cancel outstanding requests and close every opened source.
    ///
    /// Safe to call several times and concurrently with the event loop.
    pub fn close(&self) {
        self.shared.close();
        self.event_loop.stop();
    }

    pub fn status(&self) -> TaskSourceStatus {
        self.shared.status()
    }

    /// Descriptors of all tasks, ordered by sealing, once the task source finished.
    pub fn task_descriptors(&self) -> Option<Vec<TaskDescriptor>> {
        self.shared.state.lock().task_descriptors.clone()
    }

    /// Failures which happened after the task source already terminated.
    pub fn suppressed_failures(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .suppressed
            .iter()
            .map(|e| e.to_string())
            .collect()
    }
}

impl Drop for EventDrivenTaskSource {
    fn drop(&mut self) {
        self.close();
    }
}
