// THEORY:
// The `RequestCoordinator` is the single entry point callers talk to. It accepts stitch
// requests, keeps at most one of them live, runs the live one in the background and
// hands its outcome to the caller's completion context.
//
// Key architectural principles:
// 1.  **Latest Wins**: One slot holds the current request. Submitting replaces the
//     slot and raises the previous request's cancel flag under one lock. The previous
//     request runs to its next checkpoint and whatever it still produces is discarded,
//     its result file included.
// 2.  **Linearizable Delivery**: A finished request sends its `Delivery` while holding
//     the slot lock and only if it is still the slot's occupant. The completion context
//     checks again as it takes the delivery, so a queued result is dropped once a newer
//     request has been submitted. A result is therefore either delivered or superseded,
//     never both, regardless of thread timing.
// 3.  **One Workspace at a Time**: The blocking engine call of a superseded request
//     cannot be interrupted. A one-permit semaphore (the workspace lease) travels with
//     the blocking work, so the next request's workspace is only created once the
//     previous one has been cleaned up.
// 4.  **Completion Context**: Outcomes flow through a channel. Whoever drives the
//     `ResultStream` (an async task, a UI loop, a test) is the completion context.
//     Once the coordinator is disposed, nothing more comes out of it.

use crate::config::StitchConfig;
use crate::core_modules::engine::{StitchEngine, StitchMode, TranslationEngine};
use crate::core_modules::workspace::{ImageRef, WorkspaceManager};
use crate::error::{StitchError, StitchResult};
use crate::pipeline::{CancelFlag, RequestId, StitchPipeline, StitchRequest};
use futures::Stream;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

/// What the completion context receives for each request that was not superseded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub request_id: RequestId,
    pub result: StitchResult,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the coordinator has been disposed")]
pub struct CoordinatorDisposed;

/// Snapshot of the coordinator's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// No request is running and nothing is waiting to be picked up.
    Idle,
    /// The request is being resolved, preprocessed or stitched.
    InFlight(RequestId),
    /// The request's outcome is waiting for the completion context.
    Delivering(RequestId),
    /// Torn down. Accepts and delivers nothing.
    Disposed,
}

struct Active {
    id: RequestId,
    cancel: CancelFlag,
}

struct Slot {
    state: CoordinatorState,
    current: Option<Active>,
    sender: Option<mpsc::UnboundedSender<Delivery>>,
    last_id: RequestId,
}

struct Shared {
    slot: Mutex<Slot>,
    pipeline: StitchPipeline,
    lease: Arc<Semaphore>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `result` to the completion context if `id` is still the current request.
    fn deliver(&self, id: RequestId, result: StitchResult) {
        let mut slot = self.lock();
        let is_current = slot.current.as_ref().is_some_and(|active| active.id == id);
        if !is_current {
            warn!("Discarding result of superseded request {id}");
            discard(&result);
            return;
        }

        slot.current = None;
        let delivery = Delivery {
            request_id: id,
            result,
        };
        match &slot.sender {
            Some(sender) if sender.send(delivery).is_ok() => {
                info!("Request {id} ready for delivery");
                slot.state = CoordinatorState::Delivering(id);
            }
            _ => {
                warn!("Request {id} finished but nobody is listening for results");
                slot.state = CoordinatorState::Idle;
            }
        }
    }

    /// Called by the completion context as it takes a delivery. Returns `false` if
    /// the delivery must be dropped, either because the coordinator is disposed or
    /// because a newer request was submitted while it sat in the queue.
    fn accept(&self, delivery: &Delivery) -> bool {
        let mut slot = self.lock();
        if slot.state == CoordinatorState::Disposed {
            debug!("Dropping delivery of request {} after dispose", delivery.request_id);
            return false;
        }
        if delivery.request_id != slot.last_id {
            warn!(
                "Dropping queued result of request {}, superseded by request {}",
                delivery.request_id, slot.last_id
            );
            return false;
        }
        if slot.state == CoordinatorState::Delivering(delivery.request_id) {
            slot.state = CoordinatorState::Idle;
        }
        true
    }
}

/// Removes the file behind a result nobody will receive.
fn discard(result: &StitchResult) {
    if let StitchResult::Success { location } = result {
        remove_result(location);
    }
}

fn remove_result(location: &Path) {
    if let Err(e) = std::fs::remove_file(location) {
        warn!("Failed to remove discarded result {location:?}: {e}");
    }
}

/// Single-flight, latest-wins front end of the stitcher.
pub struct RequestCoordinator {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl RequestCoordinator {
    /// Builds a coordinator around `engine`. Must be called inside a Tokio runtime,
    /// which is where requests will run.
    pub fn new(
        config: &StitchConfig,
        engine: Arc<dyn StitchEngine>,
    ) -> Result<(Self, ResultStream), StitchError> {
        let runtime = Handle::try_current().map_err(|e| {
            StitchError::unexpected(format!("coordinator needs a Tokio runtime: {e}"))
        })?;
        let pipeline = StitchPipeline::new(config, engine)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: CoordinatorState::Idle,
                current: None,
                sender: Some(sender),
                last_id: 0,
            }),
            pipeline,
            lease: Arc::new(Semaphore::new(1)),
        });
        let stream = ResultStream {
            receiver,
            shared: Arc::downgrade(&shared),
        };
        Ok((Self { shared, runtime }, stream))
    }

    /// Same as `new`, using the bundled [`TranslationEngine`].
    pub fn with_default_engine(config: &StitchConfig) -> Result<(Self, ResultStream), StitchError> {
        let engine = TranslationEngine::new(config.engine.clone());
        Self::new(config, Arc::new(engine))
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.lock().state
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        self.shared.pipeline.workspaces()
    }

    /// Starts stitching `images`, superseding whatever request is still running.
    pub fn submit(
        &self,
        images: Vec<ImageRef>,
        mode: StitchMode,
    ) -> Result<RequestId, CoordinatorDisposed> {
        let mut slot = self.shared.lock();
        if slot.state == CoordinatorState::Disposed {
            return Err(CoordinatorDisposed);
        }

        slot.last_id += 1;
        let id = slot.last_id;
        if let Some(previous) = slot.current.take() {
            info!("Request {} superseded by request {id}", previous.id);
            previous.cancel.cancel();
        }

        info!("Submitting request {id}: {} images, {mode} mode", images.len());
        let request = StitchRequest { id, images, mode };
        let cancel = CancelFlag::new();
        self.runtime.spawn(run_request(Arc::clone(&self.shared), request, cancel.clone()));

        // The task cannot deliver before this lock is released, so the slot is
        // always populated first.
        slot.current = Some(Active { id, cancel });
        slot.state = CoordinatorState::InFlight(id);
        Ok(id)
    }

    /// Tears the coordinator down. The in-flight request is cancelled and nothing is
    /// delivered from now on, including outcomes already waiting in the stream.
    pub fn dispose(&self) {
        let mut slot = self.shared.lock();
        if slot.state == CoordinatorState::Disposed {
            return;
        }
        if let Some(active) = slot.current.take() {
            debug!("Cancelling request {} on dispose", active.id);
            active.cancel.cancel();
        }
        slot.sender = None;
        slot.state = CoordinatorState::Disposed;
        info!("Coordinator disposed");
    }
}

impl Drop for RequestCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_request(shared: Arc<Shared>, request: StitchRequest, cancel: CancelFlag) {
    let id = request.id;
    let Ok(lease) = Arc::clone(&shared.lease).acquire_owned().await else {
        return;
    };
    if cancel.is_cancelled() {
        return;
    }

    let worker = Arc::clone(&shared);
    let outcome = tokio::task::spawn_blocking(move || {
        // Held until the workspace is gone, even if this task is dropped meanwhile.
        let _lease = lease;
        match worker.pipeline.run(&request, &cancel) {
            Ok(location) if cancel.is_cancelled() => {
                debug!("Request {id} was superseded after stitching, removing its result");
                remove_result(&location);
                Err(StitchError::Superseded)
            }
            outcome => outcome,
        }
    })
    .await;

    let result = match outcome {
        Ok(outcome) => StitchResult::from(outcome),
        Err(e) => StitchResult::from(Err(StitchError::unexpected(format!(
            "request {id} stopped unexpectedly: {e}"
        )))),
    };
    shared.deliver(id, result);
}

/// The receiving end of the coordinator, polled by the completion context.
pub struct ResultStream {
    receiver: mpsc::UnboundedReceiver<Delivery>,
    shared: Weak<Shared>,
}

impl ResultStream {
    /// Waits for the next delivery. `None` once the coordinator is disposed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        std::future::poll_fn(|cx| self.poll_delivery(cx)).await
    }

    /// Drives the stream on `handle`, calling `callback` there for every delivery.
    pub fn spawn_delivery<F>(mut self, handle: &Handle, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        handle.spawn(async move {
            while let Some(delivery) = self.recv().await {
                callback(delivery);
            }
        })
    }

    fn poll_delivery(&mut self, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        loop {
            match self.receiver.poll_recv(cx) {
                Poll::Ready(Some(delivery)) => {
                    let accepted = self
                        .shared
                        .upgrade()
                        .is_some_and(|shared| shared.accept(&delivery));
                    if accepted {
                        return Poll::Ready(Some(delivery));
                    }
                    discard(&delivery.result);
                }
                other => return other,
            }
        }
    }
}

impl Stream for ResultStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.poll_delivery(cx)
    }
}
