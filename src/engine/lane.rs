//! Single-owner execution lane for the native engine.
//!
//! The lane isolates engine state on one dedicated OS thread. Callers submit
//! closures over that state and await the result; nothing else ever touches
//! it, so native resources that are unsafe to share between threads are only
//! reached from one place.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     crossbeam channel    ┌───────────────────┐
//! │ async caller │ ──── LaneCommand ───────>│  Execution Lane    │
//! │ (any thread) │ <──── oneshot result ────│  (dedicated thread)│
//! │              │                          │  Owns: S           │
//! └──────────────┘                          └───────────────────┘
//! ```
//!
//! Work runs strictly in submission order. A panicking unit of work is
//! caught and reported to its submitter; the lane keeps serving.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;

use crate::error::LaneError;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum LaneCommand<S> {
    /// Run one unit of work against the lane state.
    Run(Job<S>),

    /// Finish queued work, drop the state, and exit.
    Shutdown,
}

/// Handle to an execution lane owning a value of type `S`.
pub struct ExecutionLane<S> {
    cmd_tx: Sender<LaneCommand<S>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<S: 'static> ExecutionLane<S> {
    /// Spawn the lane thread. `bootstrap` runs on the new thread before the
    /// first submission and produces the state every job operates on.
    pub fn spawn<B>(name: &str, bootstrap: B) -> Result<Self, LaneError>
    where
        B: FnOnce() -> S + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = unbounded::<LaneCommand<S>>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!(
                    thread = thread::current().name().unwrap_or("unnamed"),
                    "execution lane started"
                );
                let state = bootstrap();
                lane_loop(state, cmd_rx);
            })
            .map_err(LaneError::Spawn)?;

        Ok(ExecutionLane {
            cmd_tx,
            thread: Some(thread),
        })
    }

    /// Run `work` on the lane and wait for its result.
    ///
    /// The work never runs on the caller's thread. If the caller stops
    /// waiting, already-queued work still runs; its result is discarded.
    pub async fn submit<W, R>(&self, work: W) -> Result<R, LaneError>
    where
        W: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job: Job<S> = Box::new(move |state: &mut S| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(state)));
            let outcome = outcome.map_err(|payload| {
                tracing::error!(panic = panic_message(payload.as_ref()), "unit of work panicked");
            });
            let _ = result_tx.send(outcome);
        });

        self.cmd_tx
            .send(LaneCommand::Run(job))
            .map_err(|_| LaneError::Closed)?;

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(())) => Err(LaneError::Panicked),
            Err(_) => Err(LaneError::Closed),
        }
    }
}

impl<S> ExecutionLane<S> {
    /// Finish queued work, drop the state on the lane thread, and join it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(LaneCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            // Joining from the lane itself would deadlock; the loop exits on
            // the Shutdown command either way.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl<S> Drop for ExecutionLane<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main loop running on the lane thread.
fn lane_loop<S>(mut state: S, cmd_rx: Receiver<LaneCommand<S>>) {
    loop {
        match cmd_rx.recv() {
            Ok(LaneCommand::Run(job)) => job(&mut state),
            Ok(LaneCommand::Shutdown) => break,
            Err(_) => {
                // All handles dropped
                break;
            }
        }
    }
    drop(state);
    tracing::debug!("execution lane stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
