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
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use itertools::Itertools;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ballista_core::error::{BallistaError, Result};
use ballista_core::event_loop::{EventAction, EventSender};
use ballista_core::exchange::Exchange;
use ballista_core::serde::scheduler::{PlanFragmentId, PlanNodeId};
use ballista_core::split::{Split, SplitSource, SplitSourceFactory};

use crate::config::SchedulerConfig;
use crate::state::partition::{PartitionTable, TaskDescriptor};
use crate::state::partitioning_scheme::PartitioningScheme;
use crate::state::split_assigner::{AssignmentResult, SplitAssigner};
use crate::task_source::event::{SourceBatch, TaskSourceEvent, TaskSourceId};
use crate::task_source::exchange_split_source::ExchangeSplitSource;
use crate::task_source::{
    GetSplitTimeRecorder, RegisteredSource, StageSources, TaskSourceCallback, TaskSourceShared,
};

/// Merges the batches of all sources of a stage into partitions.
///
/// Runs as the action of the task source's event loop, so batches are merged
/// one at a time and the assigner is never called concurrently.
pub(crate) struct TaskSourceScheduler {
    job_id: String,
    stage_id: usize,
    config: Arc<SchedulerConfig>,
    exchanges: HashMap<PlanFragmentId, Arc<dyn Exchange>>,
    remote_sources: HashMap<PlanFragmentId, PlanNodeId>,
    split_source_factory: Option<Arc<dyn SplitSourceFactory>>,
    split_assigner: Box<dyn SplitAssigner>,
    partitioning_scheme: Arc<PartitioningScheme>,
    callback: Arc<dyn TaskSourceCallback>,
    get_split_time_recorder: Option<GetSplitTimeRecorder>,
    shared: Arc<TaskSourceShared>,
    cancellation: CancellationToken,
    split_sources: HashMap<PlanNodeId, Arc<dyn SplitSource>>,
    exchange_split_sources: HashMap<PlanFragmentId, ExchangeSplitSource>,
    /// Sources which did not deliver their last batch yet
    pending_sources: HashSet<TaskSourceId>,
    partitions: PartitionTable,
    /// Descriptors of sealed partitions, in sealing order
    task_descriptors: Vec<TaskDescriptor>,
    no_more_partitions: bool,
    assigner_finished: bool,
    terminated: bool,
}

impl TaskSourceScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: String,
        stage_id: usize,
        config: Arc<SchedulerConfig>,
        sources: StageSources,
        split_assigner: Box<dyn SplitAssigner>,
        partitioning_scheme: Arc<PartitioningScheme>,
        callback: Arc<dyn TaskSourceCallback>,
        get_split_time_recorder: Option<GetSplitTimeRecorder>,
        shared: Arc<TaskSourceShared>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            stage_id,
            config,
            exchanges: sources.exchanges,
            remote_sources: sources.remote_sources,
            split_source_factory: Some(sources.split_source_factory),
            split_assigner,
            partitioning_scheme,
            callback,
            get_split_time_recorder,
            shared,
            cancellation,
            split_sources: HashMap::new(),
            exchange_split_sources: HashMap::new(),
            pending_sources: HashSet::new(),
            partitions: PartitionTable::new(HashSet::new()),
            task_descriptors: vec![],
            no_more_partitions: false,
            assigner_finished: false,
            terminated: false,
        }
    }

    fn open_sources(&mut self, tx_event: &mpsc::Sender<TaskSourceEvent>) -> Result<()> {
        debug!(
            "Opening sources of job {} stage {}",
            self.job_id, self.stage_id
        );
        let split_source_factory = self.split_source_factory.take().ok_or_else(|| {
            BallistaError::Internal(format!(
                "sources of job {} stage {} are already opened",
                self.job_id, self.stage_id
            ))
        })?;

        // a closed registry closes whatever is registered, so keep registering
        let mut registry_closed = false;
        for (plan_node_id, split_source) in split_source_factory.create_split_sources()? {
            if self.shared.sources.register(RegisteredSource::Split(
                plan_node_id.clone(),
                split_source.clone(),
            )) {
                self.split_sources.insert(plan_node_id, split_source);
            } else {
                registry_closed = true;
            }
        }
        if registry_closed {
            return Ok(());
        }

        let fragments = self.remote_sources.keys().cloned().sorted().collect::<Vec<_>>();
        for fragment_id in fragments {
            let exchange = self.exchanges.get(&fragment_id).ok_or_else(|| {
                BallistaError::Internal(format!("no exchange found for fragment {fragment_id}"))
            })?;
            let handle_source = exchange.source_handles()?;
            if !self.shared.sources.register(RegisteredSource::Exchange(
                fragment_id.clone(),
                handle_source.clone(),
            )) {
                return Ok(());
            }
            self.exchange_split_sources.insert(
                fragment_id,
                ExchangeSplitSource::new(
                    handle_source,
                    self.config.target_exchange_split_size_in_bytes,
                ),
            );
        }

        let remote_plan_nodes = self.remote_sources.values().cloned().collect::<HashSet<_>>();
        // every opened source is registered before failing
        if let Some(plan_node_id) = self
            .split_sources
            .keys()
            .find(|plan_node_id| remote_plan_nodes.contains(*plan_node_id))
        {
            return Err(BallistaError::Internal(format!(
                "plan node {plan_node_id} is declared both as table scan and remote source"
            )));
        }

        let declared_sources = self
            .split_sources
            .keys()
            .cloned()
            .chain(remote_plan_nodes)
            .collect::<HashSet<_>>();
        debug!(
            "Job {} stage {} reads from {} split sources and {} exchanges",
            self.job_id,
            self.stage_id,
            self.split_sources.len(),
            self.exchange_split_sources.len()
        );
        self.partitions = PartitionTable::new(declared_sources);

        self.pending_sources = self
            .split_sources
            .keys()
            .cloned()
            .map(TaskSourceId::Split)
            .chain(
                self.exchange_split_sources
                    .keys()
                    .cloned()
                    .map(TaskSourceId::Exchange),
            )
            .collect();
        for source in self.pending_sources.iter().cloned().collect::<Vec<_>>() {
            self.fetch_next(source, tx_event)?;
        }

        if self.pending_sources.is_empty() {
            self.finish()?;
        }
        Ok(())
    }

    /// Request the next batch of a source. The result is posted back to the event loop.
    fn fetch_next(
        &self,
        source: TaskSourceId,
        tx_event: &mpsc::Sender<TaskSourceEvent>,
    ) -> Result<()> {
        let cancellation = self.cancellation.child_token();
        let (fetch, recorder): (BoxFuture<'static, Result<SourceBatch>>, _) = match &source {
            TaskSourceId::Split(plan_node_id) => {
                let split_source = self.split_sources.get(plan_node_id).cloned().ok_or_else(|| {
                    BallistaError::Internal(format!("unknown split source {plan_node_id}"))
                })?;
                let max_size = self.config.split_batch_size;
                let token = cancellation.clone();
                (
                    async move {
                        split_source
                            .get_next_batch(max_size, token)
                            .await
                            .map(SourceBatch::Splits)
                    }
                    .boxed(),
                    self.get_split_time_recorder.clone(),
                )
            }
            TaskSourceId::Exchange(fragment_id) => {
                let handle_source = self
                    .exchange_split_sources
                    .get(fragment_id)
                    .map(|source| source.handle_source())
                    .ok_or_else(|| {
                        BallistaError::Internal(format!("unknown exchange of {fragment_id}"))
                    })?;
                let token = cancellation.clone();
                (
                    async move {
                        handle_source
                            .get_next_batch(token)
                            .await
                            .map(SourceBatch::Handles)
                    }
                    .boxed(),
                    None,
                )
            }
        };

        let event_sender = EventSender::new(tx_event.clone());
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let started_at = Instant::now();
            let result = tokio::select! {
                biased;
                result = fetch => result,
                _ = cancellation.cancelled() => return,
            };
            if let (Ok(_), Some(recorder)) = (&result, recorder) {
                recorder(started_at.elapsed());
            }
            if cancellation.is_cancelled() {
                match result {
                    Err(BallistaError::Cancelled) | Ok(_) => {}
                    Err(e) => {
                        warn!("Suppressing failure of {source} after cancellation: {e}");
                        shared.add_suppressed(e);
                    }
                }
                return;
            }
            let description = source.to_string();
            if let Err(e) = event_sender
                .post_event(TaskSourceEvent::BatchFetched { source, result })
                .await
            {
                debug!("Discarding batch of {description}: {e}");
            }
        });
        Ok(())
    }

    fn on_batch_fetched(
        &mut self,
        source: TaskSourceId,
        result: Result<SourceBatch>,
        tx_event: &mpsc::Sender<TaskSourceEvent>,
    ) -> Result<()> {
        let batch = result?;
        if !self.pending_sources.contains(&source) {
            return Err(BallistaError::Internal(format!(
                "received a batch from {source} after its last batch"
            )));
        }

        let last_batch = match (&source, batch) {
            (TaskSourceId::Split(plan_node_id), SourceBatch::Splits(batch)) => {
                debug!(
                    "Job {} stage {} received {} splits from {} (last batch: {})",
                    self.job_id,
                    self.stage_id,
                    batch.splits.len(),
                    plan_node_id,
                    batch.last_batch
                );
                let splits = batch
                    .splits
                    .into_iter()
                    .map(|split| {
                        self.partitioning_scheme
                            .partition(&split)
                            .map(|partition_id| (partition_id, split))
                    })
                    .collect::<Result<Vec<(usize, Split)>>>()?
                    .into_iter()
                    .into_group_map();
                let result = self
                    .split_assigner
                    .assign(plan_node_id, splits, batch.last_batch)?;
                self.process_assignment_result(result)?;
                batch.last_batch
            }
            (TaskSourceId::Exchange(fragment_id), SourceBatch::Handles(batch)) => {
                debug!(
                    "Job {} stage {} received {} exchange handles from {} (last batch: {})",
                    self.job_id,
                    self.stage_id,
                    batch.handles.len(),
                    fragment_id,
                    batch.last_batch
                );
                let plan_node_id = self.remote_sources.get(fragment_id).cloned().ok_or_else(|| {
                    BallistaError::Internal(format!("fragment {fragment_id} is not a remote source"))
                })?;
                let exchange_split_source = self
                    .exchange_split_sources
                    .get_mut(fragment_id)
                    .ok_or_else(|| {
                        BallistaError::Internal(format!("unknown exchange of {fragment_id}"))
                    })?;
                let splits = exchange_split_source.add_handles(batch.handles, batch.last_batch);
                debug!(
                    "{} handles of {} are buffered",
                    exchange_split_source.buffered_handles(),
                    fragment_id
                );
                // a remote source is done once every fragment feeding it is done
                let no_more_splits = batch.last_batch
                    && self
                        .remote_sources
                        .iter()
                        .filter(|(other, node)| *other != fragment_id && **node == plan_node_id)
                        .all(|(other, _)| {
                            !self
                                .pending_sources
                                .contains(&TaskSourceId::Exchange(other.clone()))
                        });
                let result = self
                    .split_assigner
                    .assign(&plan_node_id, splits, no_more_splits)?;
                self.process_assignment_result(result)?;
                batch.last_batch
            }
            (source, _) => {
                return Err(BallistaError::Internal(format!(
                    "received a batch of unexpected type from {source}"
                )))
            }
        };

        if last_batch {
            if let TaskSourceId::Split(plan_node_id) = &source {
                if let Some(split_source) = self.split_sources.get(plan_node_id) {
                    if !split_source.is_finished() {
                        warn!("Split source {plan_node_id} delivered its last batch but is not finished");
                    }
                }
            }
            self.pending_sources.remove(&source);
        } else {
            self.fetch_next(source, tx_event)?;
        }

        if self.pending_sources.is_empty() {
            self.finish()?;
        }
        Ok(())
    }

    fn process_assignment_result(&mut self, result: AssignmentResult) -> Result<()> {
        if result.is_empty() {
            return Ok(());
        }
        let AssignmentResult {
            partitions_added,
            no_more_partitions,
            partition_updates,
            sealed_partitions,
        } = result;
        debug!(
            "Job {} stage {} assignment: {} partitions added, {} updates, {} sealed, no more partitions: {}",
            self.job_id,
            self.stage_id,
            partitions_added.len(),
            partition_updates.len(),
            sealed_partitions.len(),
            no_more_partitions
        );

        if !partitions_added.is_empty() {
            if self.no_more_partitions {
                return Err(BallistaError::Internal(format!(
                    "{} partitions added after no more partitions was signaled",
                    partitions_added.len()
                )));
            }
            for partition in &partitions_added {
                self.partitions.add_partition(partition)?;
            }
            self.callback.partitions_added(&partitions_added)?;
        }

        if !partition_updates.is_empty() {
            for update in &partition_updates {
                self.partitions.update_partition(update)?;
            }
            self.callback.partitions_updated(&partition_updates)?;
        }

        if !sealed_partitions.is_empty() {
            for partition_id in &sealed_partitions {
                let task_descriptor = self.partitions.seal_partition(*partition_id)?;
                self.task_descriptors.push(task_descriptor);
            }
            self.callback.partitions_sealed(&sealed_partitions)?;
        }

        if no_more_partitions && !self.no_more_partitions {
            self.no_more_partitions = true;
            self.callback.no_more_partitions()?;
        }
        Ok(())
    }

    /// Flush the assigner once every source finished and hand out the descriptors.
    fn finish(&mut self) -> Result<()> {
        if self.assigner_finished {
            return Err(BallistaError::Internal(format!(
                "split assigner of job {} stage {} finished twice",
                self.job_id, self.stage_id
            )));
        }
        self.assigner_finished = true;
        let result = self.split_assigner.finish()?;
        self.process_assignment_result(result)?;

        if self.partitions.open_partitions() > 0 {
            return Err(BallistaError::Internal(format!(
                "{} partitions of job {} stage {} were never sealed",
                self.partitions.open_partitions(),
                self.job_id,
                self.stage_id
            )));
        }
        if !self.no_more_partitions {
            return Err(BallistaError::Internal(format!(
                "split assigner of job {} stage {} finished without signaling no more partitions",
                self.job_id, self.stage_id
            )));
        }

        self.terminated = true;
        let task_descriptors = std::mem::take(&mut self.task_descriptors);
        info!(
            "Task source for job {} stage {} finished with {} tasks",
            self.job_id,
            self.stage_id,
            self.partitions.sealed_partitions()
        );
        if self.shared.try_finish(task_descriptors.clone()) {
            self.callback.finished(&task_descriptors);
        }
        self.cancellation.cancel();
        self.shared.sources.close_all();
        Ok(())
    }

    fn fail(&mut self, error: BallistaError) {
        if self.terminated {
            warn!(
                "Suppressing failure of job {} stage {} after the task source terminated: {}",
                self.job_id, self.stage_id, error
            );
            self.shared.add_suppressed(error);
            return;
        }
        self.terminated = true;
        error!(
            "Task source for job {} stage {} failed: {}",
            self.job_id, self.stage_id, error
        );
        self.cancellation.cancel();
        self.shared.sources.close_all();
        self.partitions.clear();
        self.task_descriptors.clear();
        if self.shared.try_fail() {
            self.callback.failed(error);
        }
    }
}

#[async_trait]
impl EventAction<TaskSourceEvent> for TaskSourceScheduler {
    fn on_start(&mut self) {
        info!(
            "Starting TaskSourceScheduler for job {} stage {}",
            self.job_id, self.stage_id
        );
    }

    fn on_stop(&mut self) {
        info!(
            "Stopping TaskSourceScheduler for job {} stage {}",
            self.job_id, self.stage_id
        );
    }

    async fn on_receive(
        &mut self,
        event: TaskSourceEvent,
        tx_event: &mpsc::Sender<TaskSourceEvent>,
    ) -> Result<()> {
        if self.terminated || self.cancellation.is_cancelled() {
            if let TaskSourceEvent::BatchFetched {
                source,
                result: Err(e),
            } = event
            {
                warn!("Suppressing failure of {source} after the task source terminated: {e}");
                self.shared.add_suppressed(e);
            }
            return Ok(());
        }

        let outcome = match event {
            TaskSourceEvent::Start => self.open_sources(tx_event),
            TaskSourceEvent::BatchFetched { source, result } => {
                self.on_batch_fetched(source, result, tx_event)
            }
        };
        if let Err(e) = outcome {
            self.fail(e);
        }
        Ok(())
    }

    fn on_error(&mut self, error: BallistaError) {
        error!(
            "Error received by TaskSourceScheduler for job {} stage {}: {:?}",
            self.job_id, self.stage_id, error
        );
    }
}
