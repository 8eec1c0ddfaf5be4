//! Streaming generation.
//!
//! A generation is a lazy stream of text fragments. The prompt is evaluated
//! on the first poll; after that every poll runs one decode step on the
//! execution lane, so other lane work (loads, formatting) can interleave
//! between steps without ever overlapping one.
//!
//! The stream stops when the engine signals the end of generation, when the
//! context window is full, when its [`CancellationToken`] fires, or on the
//! first error. Metrics are recorded only for the first two.

pub mod lane;
pub(crate) mod state;

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::stream::Stream;
use llama_runtime::GenerationTimer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{LaneError, Result, SessionError};
use lane::ExecutionLane;
use state::LaneState;

/// Iterations between progress log lines.
const PROGRESS_INTERVAL: usize = 100;

/// How a generation stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// The engine signalled the end of generation or the context window
    /// filled up.
    Complete,
    /// Cancelled before completion.
    Stopped,
    /// Ended by the contained error.
    Error(String),
}

/// Submit `work` to the lane and flatten lane failures into [`SessionError`].
pub(crate) async fn run_on_lane<T, W>(lane: &ExecutionLane<LaneState>, work: W) -> Result<T>
where
    W: FnOnce(&mut LaneState) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    lane.submit(work).await?
}

/// Tracks the one generation a session may run at a time.
#[derive(Debug, Default)]
pub(crate) struct ActiveSlot {
    current: Mutex<Option<(Uuid, CancellationToken)>>,
}

impl ActiveSlot {
    /// Reserve the slot for generation `id`, or fail with `Busy`.
    pub(crate) fn claim(self: &Arc<Self>, id: Uuid) -> Result<GenerationGuard> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(SessionError::Busy);
        }
        let cancel = CancellationToken::new();
        *current = Some((id, cancel.clone()));
        Ok(GenerationGuard {
            id,
            cancel,
            slot: Arc::clone(self),
        })
    }

    /// Cancel the active generation. Returns whether one was running.
    pub(crate) fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some((id, cancel)) => {
                debug!(request_id = %id, "cancelling active generation");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Holds the active slot for one generation; releases it on drop.
pub(crate) struct GenerationGuard {
    id: Uuid,
    cancel: CancellationToken,
    slot: Arc<ActiveSlot>,
}

impl GenerationGuard {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        // Signal cancellation so an abandoned decode loop stops.
        self.cancel.cancel();
        let mut current = self
            .slot
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(current.as_ref(), Some((id, _)) if *id == self.id) {
            *current = None;
        }
    }
}

/// Everything a generation needs once it has been admitted.
pub(crate) struct GenerationRequest {
    pub(crate) prompt: String,
    pub(crate) max_tokens: usize,
    pub(crate) timer: GenerationTimer,
    pub(crate) guard: GenerationGuard,
}

/// Stream of text fragments from one generation.
///
/// Dropping the stream cancels the generation. Items are `Err` at most once,
/// as the last item.
pub struct FragmentStream {
    id: Uuid,
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
    cancel: CancellationToken,
    status: Arc<Mutex<Option<StreamStatus>>>,
}

impl FragmentStream {
    pub(crate) fn start(lane: Arc<ExecutionLane<LaneState>>, request: GenerationRequest) -> Self {
        let id = request.guard.id();
        let cancel = request.guard.cancellation_token();
        let status = Arc::new(Mutex::new(None));
        let inner = Box::pin(decode_loop(lane, request, Arc::clone(&status)));
        FragmentStream {
            id,
            inner,
            cancel,
            status,
        }
    }

    /// Request id, also attached to this generation's log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the generation. Takes effect before the next decode step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// How the stream ended, or `None` while it is still running.
    pub fn status(&self) -> Option<StreamStatus> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;

        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for FragmentStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn set_status(slot: &Mutex<Option<StreamStatus>>, status: StreamStatus) {
    let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if current.is_none() {
        *current = Some(status);
    }
}

fn decode_loop(
    lane: Arc<ExecutionLane<LaneState>>,
    request: GenerationRequest,
    status: Arc<Mutex<Option<StreamStatus>>>,
) -> impl Stream<Item = Result<String>> + Send {
    async_stream::stream! {
        let GenerationRequest { prompt, max_tokens, mut timer, guard } = request;
        let id = guard.id();
        let cancel = guard.cancellation_token();
        // Keep the slot reserved for the lifetime of the stream.
        let _guard = guard;

        if cancel.is_cancelled() {
            set_status(&status, StreamStatus::Stopped);
            return;
        }

        info!(request_id = %id, prompt_chars = prompt.len(), "generation started");
        let start = run_on_lane(&lane, move |state| {
            state.begin_completion(&prompt, max_tokens)
        })
        .await;
        let start = match start {
            Ok(start) => start,
            Err(err) => {
                // No epoch yet; clear whatever is loaded.
                if matches!(err, SessionError::Lane(LaneError::Panicked)) {
                    let _ = run_on_lane(&lane, |state| {
                        state.clear_current_cache();
                        Ok(())
                    })
                    .await;
                }
                error!(request_id = %id, error = %err, "prompt evaluation failed");
                set_status(&status, StreamStatus::Error(err.to_string()));
                yield Err(err);
                return;
            }
        };
        timer.mark_prefill_complete();

        let epoch = start.epoch;
        let remaining = start.remaining;
        let mut cursor = start.cursor;
        debug!(request_id = %id, position = cursor.position(), remaining, "prompt evaluated");
        if remaining == 0 {
            warn!(request_id = %id, "context window already full");
        }

        let mut iterations = 0usize;
        while iterations < remaining {
            if cancel.is_cancelled() {
                debug!(request_id = %id, iterations, "generation cancelled");
                set_status(&status, StreamStatus::Stopped);
                return;
            }

            let step = run_on_lane(&lane, move |state| {
                let mut cursor = cursor;
                let fragment = state.next_fragment(epoch, &mut cursor, max_tokens)?;
                Ok((fragment, cursor))
            })
            .await;

            match step {
                Ok((Some(fragment), next)) => {
                    cursor = next;
                    iterations += 1;
                    if cancel.is_cancelled() {
                        debug!(request_id = %id, iterations, "generation cancelled");
                        set_status(&status, StreamStatus::Stopped);
                        return;
                    }
                    if !fragment.is_empty() {
                        timer.mark_fragment();
                        yield Ok(fragment);
                    }
                    if iterations % PROGRESS_INTERVAL == 0 {
                        debug!(
                            request_id = %id,
                            iterations,
                            fragments = timer.fragment_count(),
                            "generation progress"
                        );
                    }
                }
                Ok((None, _)) => {
                    debug!(request_id = %id, iterations, "end of generation");
                    break;
                }
                Err(err) => {
                    // A panicking engine call never reached the cache clear.
                    if matches!(err, SessionError::Lane(LaneError::Panicked)) {
                        let _ = run_on_lane(&lane, move |state| {
                            state.clear_cache(epoch);
                            Ok(())
                        })
                        .await;
                    }
                    error!(request_id = %id, iterations, error = %err, "generation failed");
                    set_status(&status, StreamStatus::Error(err.to_string()));
                    yield Err(err);
                    return;
                }
            }
        }

        if remaining > 0 && iterations >= remaining {
            warn!(request_id = %id, remaining, "context window exhausted");
        }

        timer.finish();
        set_status(&status, StreamStatus::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_admits_one_generation() {
        let slot = Arc::new(ActiveSlot::default());
        let guard = slot.claim(Uuid::new_v4()).unwrap();
        assert!(slot.is_active());
        assert!(matches!(slot.claim(Uuid::new_v4()), Err(SessionError::Busy)));

        drop(guard);
        assert!(!slot.is_active());
        assert!(slot.claim(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn cancel_reaches_the_guard_token() {
        let slot = Arc::new(ActiveSlot::default());
        assert!(!slot.cancel());

        let guard = slot.claim(Uuid::new_v4()).unwrap();
        let token = guard.cancellation_token();
        assert!(slot.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn dropping_guard_cancels_its_token() {
        let slot = Arc::new(ActiveSlot::default());
        let token = slot.claim(Uuid::new_v4()).unwrap().cancellation_token();
        assert!(token.is_cancelled());
    }

    #[test]
    fn first_status_wins() {
        let status = Mutex::new(None);
        set_status(&status, StreamStatus::Stopped);
        set_status(&status, StreamStatus::Complete);
        assert_eq!(*status.lock().unwrap(), Some(StreamStatus::Stopped));
    }
}
