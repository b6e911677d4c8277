// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Observable lifecycle of a controllable unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Resumed,
    Paused,
    Fulfilled,
    Cancelled,
    Rejected,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Fulfilled | State::Cancelled | State::Rejected)
    }
}

/// Terminal outcome observed by the task owner
#[derive(Debug, PartialEq)]
pub enum Outcome<T, E> {
    Fulfilled(T),
    Cancelled,
    Rejected(E),
}

/// Why a task body stopped early
#[derive(Debug, PartialEq)]
pub enum Stop<E> {
    Cancelled,
    Error(E),
}

/// Returned by [`Controls::checkpoint`] when the task was cancelled;
/// converts into [`Stop::Cancelled`] so bodies can use `?`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl<E> From<Interrupted> for Stop<E> {
    fn from(_: Interrupted) -> Self {
        Stop::Cancelled
    }
}

/// Byte-level progress notification, delivered best-effort to all
/// subscribers
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub delta: u64,
    pub completed: u64,
    pub total: u64,
}

struct Shared {
    state: watch::Sender<State>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    progress: broadcast::Sender<Progress>,
    /// Control operations are serialized; a losing contender fails
    /// instead of waiting
    op: Mutex<()>,
}

/// Create a control pair. The [`Controller`] belongs to the owner,
/// the [`Controls`] to the work body.
pub fn control() -> (Controller, Controls) {
    let shared = Arc::new(Shared {
        state: watch::Sender::new(State::Resumed),
        paused: watch::Sender::new(false),
        cancel: CancellationToken::new(),
        progress: broadcast::channel(64).0,
        op: Mutex::new(()),
    });

    (
        Controller {
            shared: shared.clone(),
        },
        Controls { shared },
    )
}

/// Owner-side handle: pause, resume, cancel, observe
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn state(&self) -> State {
        *self.shared.state.borrow()
    }

    pub fn pause(&self) -> Result<(), PreconditionError> {
        let _op = self.try_op()?;

        match self.state() {
            State::Resumed => {
                self.shared.paused.send_replace(true);
                self.shared.state.send_replace(State::Paused);
                Ok(())
            }
            State::Paused => Err(PreconditionError::AlreadyPaused),
            _ => Err(PreconditionError::Settled),
        }
    }

    pub fn resume(&self) -> Result<(), PreconditionError> {
        let _op = self.try_op()?;

        match self.state() {
            State::Paused => {
                self.shared.paused.send_replace(false);
                self.shared.state.send_replace(State::Resumed);
                Ok(())
            }
            State::Resumed => Err(PreconditionError::NotPaused),
            _ => Err(PreconditionError::Settled),
        }
    }

    /// Request cooperative cancellation. The task quiesces at its
    /// next checkpoint; await [`Controller::settled`] to observe it.
    pub fn cancel(&self) -> Result<(), PreconditionError> {
        let _op = self.try_op()?;

        if self.state().is_terminal() {
            return Err(PreconditionError::Settled);
        }

        self.shared.cancel.cancel();

        Ok(())
    }

    /// Wait for the task to reach a terminal state
    pub async fn settled(&self) -> State {
        let mut receiver = self.shared.state.subscribe();

        loop {
            let state = *receiver.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if receiver.changed().await.is_err() {
                return *self.shared.state.borrow();
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    fn try_op(&self) -> Result<std::sync::MutexGuard<'_, ()>, PreconditionError> {
        self.shared.op.try_lock().map_err(|_| PreconditionError::Busy)
    }
}

/// Body-side handle: emit progress and cooperate with control
/// requests at suspension points
#[derive(Clone)]
pub struct Controls {
    shared: Arc<Shared>,
}

impl Controls {
    /// Best-effort progress delivery; a lagging or absent subscriber
    /// never blocks the producer
    pub fn emit(&self, progress: Progress) {
        let _ = self.shared.progress.send(progress);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// A pause request is pending; producers holding live streams
    /// should drop them before parking in [`Controls::checkpoint`]
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Honour pending pause and cancel requests. Suspends while the
    /// task is paused; fails once it is cancelled.
    pub async fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.shared.cancel.is_cancelled() {
            return Err(Interrupted);
        }
        if !*self.shared.paused.borrow() {
            return Ok(());
        }

        let mut paused = self.shared.paused.subscribe();

        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(Interrupted);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }

            tokio::select! {
                () = self.shared.cancel.cancelled() => return Err(Interrupted),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn settle(&self, state: State) {
        debug_assert!(state.is_terminal());
        self.shared.paused.send_replace(false);
        self.shared.state.send_replace(state);
    }
}

/// Drive a task body to its terminal outcome under `controls`.
///
/// A fulfilment that lands while the task is paused is deferred to
/// the next resume, preserving the contract that nothing is
/// observable between pause and resume. A cancel racing the
/// fulfilment settles as cancelled.
pub async fn run<T, E>(
    controls: &Controls,
    body: impl Future<Output = Result<T, Stop<E>>>,
) -> Outcome<T, E> {
    let result = body.await;

    let mut paused = controls.shared.paused.subscribe();

    let deferred = loop {
        if controls.shared.cancel.is_cancelled() {
            break true;
        }
        if !*paused.borrow_and_update() {
            break false;
        }

        tokio::select! {
            () = controls.shared.cancel.cancelled() => break true,
            changed = paused.changed() => {
                if changed.is_err() {
                    break false;
                }
            }
        }
    };

    let outcome = if deferred {
        Outcome::Cancelled
    } else {
        match result {
            Ok(value) => Outcome::Fulfilled(value),
            Err(Stop::Cancelled) => Outcome::Cancelled,
            Err(Stop::Error(error)) => Outcome::Rejected(error),
        }
    };

    controls.settle(match &outcome {
        Outcome::Fulfilled(_) => State::Fulfilled,
        Outcome::Cancelled => State::Cancelled,
        Outcome::Rejected(_) => State::Rejected,
    });

    outcome
}

/// Spawn an owned controllable task onto the runtime
pub fn spawn<T, E, F, Fut>(body: F) -> Handle<T, E>
where
    F: FnOnce(Controls) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Stop<E>>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (controller, controls) = control();
    let (done_sender, done) = oneshot::channel();

    tokio::spawn(async move {
        let shared = controls.clone();
        let outcome = run(&shared, body(controls)).await;
        let _ = done_sender.send(outcome);
    });

    Handle { controller, done }
}

/// An owned, spawned controllable task
pub struct Handle<T, E> {
    pub controller: Controller,
    done: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> Handle<T, E> {
    /// Await the terminal outcome
    pub async fn join(self) -> Outcome<T, E> {
        self.done.await.unwrap_or(Outcome::Cancelled)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("another control operation is in flight")]
    Busy,
    #[error("task already settled")]
    Settled,
    #[error("task is not paused")]
    NotPaused,
    #[error("task is already paused")]
    AlreadyPaused,
}
