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

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BallistaError, Result};

/// Consumer side of an [`EventLoop`].
///
/// Events are handed to `on_receive` strictly one at a time from a single
/// task, so implementations can keep their state behind `&mut self`.
#[async_trait]
pub trait EventAction<E>: Send {
    fn on_start(&mut self);

    fn on_stop(&mut self);

    async fn on_receive(&mut self, event: E, tx_event: &mpsc::Sender<E>) -> Result<()>;

    fn on_error(&mut self, error: BallistaError);
}

pub struct EventLoop<E> {
    pub name: String,
    pub buffer_size: usize,
    stopped: CancellationToken,
    action: Option<Box<dyn EventAction<E>>>,
    tx_event: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(name: String, buffer_size: usize, action: Box<dyn EventAction<E>>) -> Self {
        Self {
            name,
            buffer_size,
            stopped: CancellationToken::new(),
            action: Some(action),
            tx_event: None,
        }
    }

    /// Stop the loop once `stopped` is cancelled. Lets an action which holds
    /// the same token end its own loop.
    pub fn with_stop_token(mut self, stopped: CancellationToken) -> Self {
        self.stopped = stopped;
        self
    }

    fn run(
        &self,
        mut action: Box<dyn EventAction<E>>,
        tx_event: mpsc::Sender<E>,
        mut rx_event: mpsc::Receiver<E>,
    ) -> JoinHandle<()> {
        let name = self.name.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            info!("Starting the event loop {}", name);
            action.on_start();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    event = rx_event.recv() => event,
                };
                match event {
                    Some(event) => {
                        if let Err(e) = action.on_receive(event, &tx_event).await {
                            error!("Fail to process event due to {}", e);
                            action.on_error(e);
                        }
                    }
                    None => {
                        info!("Event Channel closed, shutting down");
                        break;
                    }
                }
            }
            action.on_stop();
            info!("The event loop {} has been stopped", name);
        })
    }

    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        if self.stopped.is_cancelled() {
            return Err(BallistaError::General(format!(
                "{} has already been stopped",
                self.name
            )));
        }
        let action = self.action.take().ok_or_else(|| {
            BallistaError::Internal(format!("{} has already been started", self.name))
        })?;
        let (tx_event, rx_event) = mpsc::channel::<E>(self.buffer_size);
        self.tx_event = Some(tx_event.clone());
        Ok(self.run(action, tx_event, rx_event))
    }

    pub fn stop(&self) {
        // Cancelling twice is a no-op, so `stop` may be called multiple times.
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        Ok(EventSender {
            tx_event: self.tx_event.as_ref().cloned().ok_or_else(|| {
                BallistaError::General("Event sender not exist!!!".to_string())
            })?,
        })
    }
}

#[derive(Clone)]
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post_event(&self, event: E) -> Result<()> {
        self.tx_event
            .send(event)
            .await
            .map_err(|e| BallistaError::General(format!("Fail to send event due to {e}")))
    }

    /// Post without waiting for queue capacity.
    pub fn try_post_event(&self, event: E) -> Result<()> {
        self.tx_event
            .try_send(event)
            .map_err(|e| BallistaError::General(format!("Fail to send event due to {e}")))
    }
}
