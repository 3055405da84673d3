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

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ballista_core::error::{BallistaError, Result};
use ballista_core::exchange::{
    Exchange, ExchangeSourceHandle, ExchangeSourceHandleBatch, ExchangeSourceHandleSource,
};
use ballista_core::serde::scheduler::{CatalogHandle, PlanNodeId};
use ballista_core::split::{ConnectorSplit, Split, SplitBatch, SplitSource};

use crate::state::partition::{NodeRequirements, Partition, PartitionUpdate, TaskDescriptor};
use crate::state::split_assigner::{AssignmentResult, DefaultSplitAssigner, SplitAssigner};
use crate::task_source::TaskSourceCallback;

pub const TEST_CATALOG: &str = "test";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` every `interval` until it returns true, at most `iterations` times.
pub async fn await_condition<Fut: Future<Output = Result<bool>>, F: Fn() -> Fut>(
    interval: Duration,
    iterations: usize,
    cond: F,
) -> Result<bool> {
    let mut iteration = 0;

    while iteration < iterations {
        let check = cond().await?;

        if check {
            return Ok(true);
        } else {
            iteration += 1;
            tokio::time::sleep(interval).await;
        }
    }

    Ok(false)
}

/// Sleep between 0 and 2 milliseconds, so that sources complete in random order.
async fn random_delay() {
    let millis = rand::thread_rng().gen_range(0..=2);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    } else {
        tokio::task::yield_now().await;
    }
}

/// Hands out unique ids for splits and exchange handles of a test.
#[derive(Debug, Default)]
pub struct TestingIds {
    next: AtomicUsize,
}

impl TestingIds {
    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TestingConnectorSplit {
    pub id: usize,
    pub bucket: usize,
}

impl ConnectorSplit for TestingConnectorSplit {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bucket(&self) -> Option<usize> {
        Some(self.bucket)
    }
}

pub fn create_split(ids: &TestingIds, bucket: usize) -> Split {
    Split::new(
        CatalogHandle::new(TEST_CATALOG),
        Arc::new(TestingConnectorSplit {
            id: ids.next(),
            bucket,
        }),
    )
}

pub fn create_splits(ids: &TestingIds, count: usize, bucket_count: usize) -> Vec<Split> {
    (0..count)
        .map(|_| create_split(ids, rand::thread_rng().gen_range(0..bucket_count)))
        .collect()
}

/// Id of a split created by [`create_split`].
pub fn split_id(split: &Split) -> Option<usize> {
    split
        .connector_split()
        .as_any()
        .downcast_ref::<TestingConnectorSplit>()
        .map(|split| split.id)
}

/// Ids of the exchange handles carried by a remote split.
pub fn handle_ids(split: &Split) -> Vec<usize> {
    split
        .as_remote()
        .map(|remote| {
            remote
                .handles()
                .iter()
                .filter_map(|handle| {
                    handle
                        .as_any()
                        .downcast_ref::<TestingExchangeSourceHandle>()
                        .map(|handle| handle.id)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct TestingExchangeSourceHandle {
    pub id: usize,
    partition_id: usize,
    data_size_in_bytes: u64,
}

impl TestingExchangeSourceHandle {
    pub fn new(id: usize, partition_id: usize, data_size_in_bytes: u64) -> Self {
        Self {
            id,
            partition_id,
            data_size_in_bytes,
        }
    }
}

impl ExchangeSourceHandle for TestingExchangeSourceHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn partition_id(&self) -> usize {
        self.partition_id
    }

    fn data_size_in_bytes(&self) -> u64 {
        self.data_size_in_bytes
    }
}

pub fn create_handles(
    ids: &TestingIds,
    count: usize,
    partition_count: usize,
) -> Vec<Arc<dyn ExchangeSourceHandle>> {
    (0..count)
        .map(|_| {
            Arc::new(TestingExchangeSourceHandle::new(
                ids.next(),
                rand::thread_rng().gen_range(0..partition_count),
                1,
            )) as Arc<dyn ExchangeSourceHandle>
        })
        .collect()
}

/// Queue of items handed out one per batch, tracking how the source is used.
struct TestingQueue<T> {
    items: Mutex<VecDeque<T>>,
    in_flight: AtomicBool,
    concurrent_requests: AtomicUsize,
    finished: AtomicBool,
    close_count: AtomicUsize,
}

impl<T> TestingQueue<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items.into()),
            in_flight: AtomicBool::new(false),
            concurrent_requests: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    async fn next_batch(&self) -> Result<(Vec<T>, bool)> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.concurrent_requests.fetch_add(1, Ordering::SeqCst);
            return Err(BallistaError::Internal(
                "concurrent get_next_batch calls".to_owned(),
            ));
        }
        if self.finished.load(Ordering::SeqCst) {
            return Err(BallistaError::Internal(
                "get_next_batch called after the last batch".to_owned(),
            ));
        }
        random_delay().await;
        let batch = {
            let mut items = self.items.lock();
            let item = items.pop_front();
            (item.into_iter().collect::<Vec<_>>(), items.is_empty())
        };
        if batch.1 {
            self.finished.store(true, Ordering::SeqCst);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(batch)
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Split source returning one split per batch after a random delay.
pub struct TestingSplitSource {
    queue: TestingQueue<Split>,
}

impl TestingSplitSource {
    pub fn new(splits: Vec<Split>) -> Self {
        Self {
            queue: TestingQueue::new(splits),
        }
    }

    pub fn close_count(&self) -> usize {
        self.queue.close_count.load(Ordering::SeqCst)
    }

    pub fn concurrent_requests(&self) -> usize {
        self.queue.concurrent_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SplitSource for TestingSplitSource {
    async fn get_next_batch(
        &self,
        max_size: usize,
        _cancellation: CancellationToken,
    ) -> Result<SplitBatch> {
        assert!(max_size > 0);
        let (splits, last_batch) = self.queue.next_batch().await?;
        Ok(SplitBatch::new(splits, last_batch))
    }

    fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.queue.finished.load(Ordering::SeqCst)
    }
}

/// Exchange handle source returning one handle per batch after a random delay.
pub struct TestingExchangeSourceHandleSource {
    queue: TestingQueue<Arc<dyn ExchangeSourceHandle>>,
}

impl TestingExchangeSourceHandleSource {
    pub fn new(handles: Vec<Arc<dyn ExchangeSourceHandle>>) -> Self {
        Self {
            queue: TestingQueue::new(handles),
        }
    }

    pub fn close_count(&self) -> usize {
        self.queue.close_count.load(Ordering::SeqCst)
    }

    pub fn concurrent_requests(&self) -> usize {
        self.queue.concurrent_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeSourceHandleSource for TestingExchangeSourceHandleSource {
    async fn get_next_batch(
        &self,
        _cancellation: CancellationToken,
    ) -> Result<ExchangeSourceHandleBatch> {
        let (handles, last_batch) = self.queue.next_batch().await?;
        Ok(ExchangeSourceHandleBatch::new(handles, last_batch))
    }

    fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}

pub const SOURCE_FAILURE: &str = "source failure";

/// Fails every request, either right away or after a delay.
pub struct FailingSource {
    fail_future: bool,
    close_count: AtomicUsize,
}

impl FailingSource {
    pub fn new(fail_future: bool) -> Self {
        Self {
            fail_future,
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    async fn fail<T>(&self) -> Result<T> {
        if self.fail_future {
            random_delay().await;
        }
        Err(BallistaError::General(SOURCE_FAILURE.to_owned()))
    }
}

#[async_trait]
impl SplitSource for FailingSource {
    async fn get_next_batch(
        &self,
        _max_size: usize,
        _cancellation: CancellationToken,
    ) -> Result<SplitBatch> {
        self.fail().await
    }

    fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        false
    }
}

#[async_trait]
impl ExchangeSourceHandleSource for FailingSource {
    async fn get_next_batch(
        &self,
        _cancellation: CancellationToken,
    ) -> Result<ExchangeSourceHandleBatch> {
        self.fail().await
    }

    fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Exchange whose handle source can be retrieved once.
pub struct TestingExchange {
    source: Mutex<Option<Arc<dyn ExchangeSourceHandleSource>>>,
}

impl TestingExchange {
    pub fn new(source: Arc<dyn ExchangeSourceHandleSource>) -> Self {
        Self {
            source: Mutex::new(Some(source)),
        }
    }
}

impl Exchange for TestingExchange {
    fn source_handles(&self) -> Result<Arc<dyn ExchangeSourceHandleSource>> {
        self.source.lock().take().ok_or_else(|| {
            BallistaError::Internal("exchange source handles already retrieved".to_owned())
        })
    }
}

#[derive(Debug)]
struct RecordedPartition {
    node_requirements: NodeRequirements,
    splits: HashMap<PlanNodeId, Vec<Split>>,
    finished_sources: HashSet<PlanNodeId>,
    sealed: bool,
}

#[derive(Debug, Default)]
struct RecordedState {
    partitions: BTreeMap<usize, RecordedPartition>,
    sealed_order: Vec<usize>,
    no_more_partitions: bool,
    task_descriptors: Option<Vec<TaskDescriptor>>,
    failures: Vec<String>,
    /// Calls which break the partition lifecycle
    violations: Vec<String>,
}

impl RecordedState {
    fn check_open(&mut self) {
        if self.task_descriptors.is_some() || !self.failures.is_empty() {
            self.violations
                .push("callback invoked after the task source terminated".to_owned());
        }
    }
}

/// Records every notification and checks that the partition lifecycle is respected.
#[derive(Debug, Default)]
pub struct RecordingTaskSourceCallback {
    state: Mutex<RecordedState>,
}

impl RecordingTaskSourceCallback {
    pub fn partition_ids(&self) -> Vec<usize> {
        self.state.lock().partitions.keys().cloned().collect()
    }

    pub fn sealed_partitions(&self) -> Vec<usize> {
        self.state.lock().sealed_order.clone()
    }

    pub fn node_requirements(&self, partition_id: usize) -> Option<NodeRequirements> {
        self.state
            .lock()
            .partitions
            .get(&partition_id)
            .map(|partition| partition.node_requirements.clone())
    }

    /// Splits received by a partition, per plan node.
    pub fn splits(&self, partition_id: usize) -> HashMap<PlanNodeId, Vec<Split>> {
        self.state
            .lock()
            .partitions
            .get(&partition_id)
            .map(|partition| partition.splits.clone())
            .unwrap_or_default()
    }

    pub fn has_no_more_partitions(&self) -> bool {
        self.state.lock().no_more_partitions
    }

    pub fn task_descriptors(&self) -> Option<Vec<TaskDescriptor>> {
        self.state.lock().task_descriptors.clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.task_descriptors.is_some() || !state.failures.is_empty()
    }
}

impl TaskSourceCallback for RecordingTaskSourceCallback {
    fn partitions_added(&self, partitions: &[Partition]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open();
        if state.no_more_partitions {
            state
                .violations
                .push("partition added after no more partitions".to_owned());
        }
        for partition in partitions {
            let recorded = RecordedPartition {
                node_requirements: partition.node_requirements.clone(),
                splits: HashMap::new(),
                finished_sources: HashSet::new(),
                sealed: false,
            };
            if state
                .partitions
                .insert(partition.partition_id, recorded)
                .is_some()
            {
                state
                    .violations
                    .push(format!("partition {} added twice", partition.partition_id));
            }
        }
        Ok(())
    }

    fn partitions_updated(&self, partition_updates: &[PartitionUpdate]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open();
        for update in partition_updates {
            let violation = match state.partitions.get_mut(&update.partition_id) {
                None => Some(format!("update of unknown partition {}", update.partition_id)),
                Some(partition) if partition.sealed => {
                    Some(format!("update of sealed partition {}", update.partition_id))
                }
                Some(partition)
                    if partition.finished_sources.contains(&update.plan_node_id)
                        && !update.splits.is_empty() =>
                {
                    Some(format!(
                        "splits of finished source {} added to partition {}",
                        update.plan_node_id, update.partition_id
                    ))
                }
                Some(partition) => {
                    partition
                        .splits
                        .entry(update.plan_node_id.clone())
                        .or_default()
                        .extend(update.splits.iter().cloned());
                    if update.no_more_splits {
                        partition
                            .finished_sources
                            .insert(update.plan_node_id.clone());
                    }
                    None
                }
            };
            state.violations.extend(violation);
        }
        Ok(())
    }

    fn partitions_sealed(&self, partition_ids: &[usize]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open();
        for partition_id in partition_ids {
            let violation = match state.partitions.get_mut(partition_id) {
                None => Some(format!("seal of unknown partition {partition_id}")),
                Some(partition) if partition.sealed => {
                    Some(format!("partition {partition_id} sealed twice"))
                }
                Some(partition) => {
                    partition.sealed = true;
                    None
                }
            };
            state.violations.extend(violation);
            state.sealed_order.push(*partition_id);
        }
        Ok(())
    }

    fn no_more_partitions(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open();
        if state.no_more_partitions {
            state
                .violations
                .push("no more partitions signaled twice".to_owned());
        }
        state.no_more_partitions = true;
        Ok(())
    }

    fn finished(&self, task_descriptors: &[TaskDescriptor]) {
        let mut state = self.state.lock();
        state.check_open();
        state.task_descriptors = Some(task_descriptors.to_vec());
    }

    fn failed(&self, error: BallistaError) {
        let mut state = self.state.lock();
        state.check_open();
        state.failures.push(error.to_string());
    }
}

pub const CALLBACK_FAILURE: &str = "callback failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    PartitionsAdded,
    PartitionsUpdated,
    PartitionsSealed,
    NoMorePartitions,
}

/// Records like [`RecordingTaskSourceCallback`] but fails one kind of notification.
pub struct FailingTaskSourceCallback {
    fail_on: CallbackFailure,
    recorded: Arc<RecordingTaskSourceCallback>,
}

impl FailingTaskSourceCallback {
    pub fn new(fail_on: CallbackFailure, recorded: Arc<RecordingTaskSourceCallback>) -> Self {
        Self { fail_on, recorded }
    }

    fn check(&self, call: CallbackFailure) -> Result<()> {
        if self.fail_on == call {
            Err(BallistaError::General(CALLBACK_FAILURE.to_owned()))
        } else {
            Ok(())
        }
    }
}

impl TaskSourceCallback for FailingTaskSourceCallback {
    fn partitions_added(&self, partitions: &[Partition]) -> Result<()> {
        self.check(CallbackFailure::PartitionsAdded)?;
        self.recorded.partitions_added(partitions)
    }

    fn partitions_updated(&self, partition_updates: &[PartitionUpdate]) -> Result<()> {
        self.check(CallbackFailure::PartitionsUpdated)?;
        self.recorded.partitions_updated(partition_updates)
    }

    fn partitions_sealed(&self, partition_ids: &[usize]) -> Result<()> {
        self.check(CallbackFailure::PartitionsSealed)?;
        self.recorded.partitions_sealed(partition_ids)
    }

    fn no_more_partitions(&self) -> Result<()> {
        self.check(CallbackFailure::NoMorePartitions)?;
        self.recorded.no_more_partitions()
    }

    fn finished(&self, task_descriptors: &[TaskDescriptor]) {
        self.recorded.finished(task_descriptors)
    }

    fn failed(&self, error: BallistaError) {
        self.recorded.failed(error)
    }
}

pub const ASSIGNER_FAILURE: &str = "assigner failure";

/// Delegates to a [`DefaultSplitAssigner`] but fails either `assign` or `finish`.
pub struct FailingSplitAssigner {
    fail_on_finish: bool,
    inner: DefaultSplitAssigner,
}

impl FailingSplitAssigner {
    pub fn new(fail_on_finish: bool, inner: DefaultSplitAssigner) -> Self {
        Self {
            fail_on_finish,
            inner,
        }
    }
}

impl SplitAssigner for FailingSplitAssigner {
    fn assign(
        &mut self,
        plan_node_id: &PlanNodeId,
        splits: HashMap<usize, Vec<Split>>,
        no_more_splits: bool,
    ) -> Result<AssignmentResult> {
        if !self.fail_on_finish {
            return Err(BallistaError::General(ASSIGNER_FAILURE.to_owned()));
        }
        self.inner.assign(plan_node_id, splits, no_more_splits)
    }

    fn finish(&mut self) -> Result<AssignmentResult> {
        if self.fail_on_finish {
            return Err(BallistaError::General(ASSIGNER_FAILURE.to_owned()));
        }
        self.inner.finish()
    }
}
