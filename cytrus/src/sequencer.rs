// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::action::{self, Action, Context, UpdateKind};
use crate::environment;
use crate::repository;
use crate::task::{self, Outcome, Stop};

/// Owner-facing command surface of a running sequencer
#[derive(Debug)]
pub enum Command {
    Pause,
    Resume,
    Stop,
    /// The configuration emitted a new fragment selection
    SetFragments(Vec<String>),
}

/// Lifecycle events emitted towards the update queue / host
#[derive(Debug)]
pub enum Event {
    Progress(Snapshot),
    /// The run finished; `fragments` is the final selection actually
    /// installed (it may differ from the initial one)
    Completed { fragments: Vec<String> },
    Cancelled,
    Error(action::Error),
}

/// Coarse progress snapshot: per-fragment and overall byte counts
/// plus the sliding-window download speed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub fragments: BTreeMap<String, FragmentProgress>,
    pub overall: FragmentProgress,
    pub speed_bps: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentProgress {
    pub downloaded: u64,
    pub total: u64,
}

/// Handle held by the queue; all operations are best-effort sends to
/// the running sequencer
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
}

impl Handle {
    /// A handle backed by a bare channel, for hosts that drive a
    /// sequencer-shaped loop of their own
    pub fn detached() -> (Self, mpsc::Receiver<Command>) {
        let (commands, receiver) = mpsc::channel(16);
        (Self { commands }, receiver)
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(Command::Resume).await;
    }

    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    pub async fn set_fragments(&self, fragments: Vec<String>) {
        let _ = self.commands.send(Command::SetFragments(fragments)).await;
    }
}

/// Per-release action sequencer: drives the action queue for one
/// install / update / repair / pre-install run
pub struct Sequencer {
    repository: Arc<repository::Client>,
    ctx: Context,
    queue: VecDeque<Action>,
    events: mpsc::Sender<Event>,
    commands: mpsc::Receiver<Command>,
    book: ProgressBook,
    stopping: bool,
    pending_fragments: Option<Vec<String>>,
    last_emit: Option<Instant>,
}

impl Sequencer {
    pub fn new(
        repository: Arc<repository::Client>,
        ctx: Context,
        already_downloaded: u64,
    ) -> (Self, Handle, mpsc::Receiver<Event>) {
        let (event_sender, event_receiver) = mpsc::channel(64);
        let (command_sender, command_receiver) = mpsc::channel(16);

        let queue = initial_queue(ctx.kind, &ctx.fragments);

        (
            Self {
                repository,
                ctx,
                queue,
                events: event_sender,
                commands: command_receiver,
                book: ProgressBook::new(already_downloaded),
                stopping: false,
                pending_fragments: None,
                last_emit: None,
            },
            Handle {
                commands: command_sender,
            },
            event_receiver,
        )
    }

    /// Drive the queue to a terminal event. Consumes the sequencer;
    /// exactly one of `Completed`, `Cancelled` or `Error` is emitted
    /// last.
    pub async fn run(mut self) {
        let result = self.drive().await;

        let terminal = match result {
            Ok(()) => Event::Completed {
                fragments: self.ctx.fragments.clone(),
            },
            Err(Stop::Cancelled) => Event::Cancelled,
            Err(Stop::Error(error)) => Event::Error(error),
        };

        let _ = self.events.send(terminal).await;
    }

    async fn drive(&mut self) -> Result<(), Stop<action::Error>> {
        while let Some(action) = self.queue.pop_front() {
            let fragments_before = self.ctx.fragments.clone();

            let outcome = self.run_action(&action).await;

            match outcome {
                Outcome::Fulfilled(()) => {
                    self.after_action(&action, &fragments_before);
                }
                Outcome::Cancelled => {
                    if self.stopping || self.pending_fragments.is_none() {
                        return Err(Stop::Cancelled);
                    }
                    // Cancelled to make room for the new selection;
                    // the rebuilt plan replaces this action's work
                    self.apply_fragment_change();
                }
                Outcome::Rejected(error) => return Err(Stop::Error(error)),
            }

            if self.stopping {
                return Err(Stop::Cancelled);
            }

            if self.pending_fragments.is_some() {
                self.apply_fragment_change();
            }
        }

        Ok(())
    }

    async fn run_action(&mut self, action: &Action) -> Outcome<(), action::Error> {
        debug!("running {action:?}");

        let (controller, controls) = task::control();
        let mut progress = controller.subscribe();

        let repository = self.repository.clone();
        let ctx = &mut self.ctx;
        let commands = &mut self.commands;
        let book = &mut self.book;
        let events = &self.events;
        let stopping = &mut self.stopping;
        let pending = &mut self.pending_fragments;
        let last_emit = &mut self.last_emit;

        let fragment = action.fragment().map(ToOwned::to_owned);

        let mut fut = pin!(task::run(
            &controls,
            action.run(&repository, ctx, &controls)
        ));

        loop {
            tokio::select! {
                outcome = &mut fut => break outcome,
                received = progress.recv() => {
                    if let (Ok(chunk), Some(fragment)) = (received, &fragment) {
                        book.add(fragment, chunk.delta);
                        emit_progress(events, book, last_emit);
                    }
                }
                Some(command) = commands.recv() => {
                    match command {
                        Command::Pause => {
                            if let Err(error) = controller.pause() {
                                warn!("pause refused: {error}");
                            }
                        }
                        Command::Resume => {
                            if let Err(error) = controller.resume() {
                                warn!("resume refused: {error}");
                            }
                        }
                        Command::Stop => {
                            *stopping = true;
                            let _ = controller.cancel();
                        }
                        Command::SetFragments(fragments) => {
                            *pending = Some(fragments);
                            if action.cancellable_on_fragment_change() {
                                let _ = controller.cancel();
                            }
                        }
                    }
                }
            }
        }
    }

    fn after_action(&mut self, action: &Action, fragments_before: &[String]) {
        match action {
            Action::CreateDiff { .. } => {
                if let Some(diff) = &self.ctx.diff {
                    self.book.reset_from(diff, self.ctx.meta.as_ref());
                }
            }
            Action::LoadConfiguration => {
                if self.ctx.fragments != fragments_before {
                    debug!(
                        "configuration changed selection {fragments_before:?} -> {:?}",
                        self.ctx.fragments
                    );
                    self.pending_fragments = Some(self.ctx.fragments.clone());
                }
            }
            _ => {}
        }
    }

    /// Clear rebuildable actions and schedule the plan for the new
    /// selection, checkpointing hashes first
    fn apply_fragment_change(&mut self) {
        let Some(fragments) = self.pending_fragments.take() else {
            return;
        };

        self.ctx.fragments = fragments.clone();
        self.queue.retain(Action::survives_fragment_change);

        self.queue.push_back(Action::SaveHashes);
        for action in content_plan(&fragments) {
            self.queue.push_back(action);
        }
    }
}

fn emit_progress(
    events: &mpsc::Sender<Event>,
    book: &mut ProgressBook,
    last_emit: &mut Option<Instant>,
) {
    let now = Instant::now();

    if let Some(last) = *last_emit {
        if now - last < Duration::from_millis(100) {
            return;
        }
    }

    *last_emit = Some(now);
    let _ = events.try_send(Event::Progress(book.snapshot()));
}

/// Queue composition per update kind
fn initial_queue(kind: UpdateKind, fragments: &[String]) -> VecDeque<Action> {
    let configuration = environment::CONFIGURATION_FRAGMENT.to_owned();

    let mut queue = VecDeque::new();
    queue.push_back(Action::GetRemoteHashes);

    if kind == UpdateKind::PreInstall {
        queue.push_back(Action::CreateDiff {
            fragments: vec![configuration.clone()],
        });
        queue.push_back(Action::DownloadFragment {
            fragment: configuration,
        });
        queue.push_back(Action::LoadConfiguration);
        return queue;
    }

    match kind {
        UpdateKind::Update => queue.push_back(Action::GetLocalHashes),
        UpdateKind::Repair => queue.push_back(Action::Repair),
        UpdateKind::Install | UpdateKind::PreInstall => {}
    }

    queue.push_back(Action::CreateDiff {
        fragments: vec![configuration.clone()],
    });
    queue.push_back(Action::DownloadFragment {
        fragment: configuration,
    });
    queue.push_back(Action::LoadConfiguration);
    queue.push_back(Action::CheckConfiguration);
    queue.push_back(Action::WriteReleaseInfos);

    for action in content_plan(fragments) {
        queue.push_back(action);
    }

    queue
}

/// The rebuildable tail of a run: full diff, per-fragment downloads,
/// finalization
fn content_plan(fragments: &[String]) -> Vec<Action> {
    let mut plan = vec![Action::CreateDiff {
        fragments: fragments.to_vec(),
    }];

    for fragment in fragments {
        if fragment == environment::CONFIGURATION_FRAGMENT {
            continue;
        }
        plan.push(Action::CreateDirectories {
            fragment: fragment.clone(),
        });
        plan.push(Action::DownloadFragment {
            fragment: fragment.clone(),
        });
    }

    plan.push(Action::DeleteFiles);
    plan.push(Action::ClearEmptyDirectories);
    plan.push(Action::SaveHashes);

    plan
}

/// Per-fragment and overall byte accounting. Totals come from the
/// release meta when available, the diff otherwise; progress never
/// exceeds them.
struct ProgressBook {
    fragments: BTreeMap<String, FragmentProgress>,
    already_downloaded: u64,
    speed: Speedometer,
}

impl ProgressBook {
    fn new(already_downloaded: u64) -> Self {
        Self {
            fragments: BTreeMap::new(),
            already_downloaded,
            speed: Speedometer::default(),
        }
    }

    fn reset_from(&mut self, diff: &crate::diff::Diff, meta: Option<&crate::manifest::ReleaseMeta>) {
        self.fragments.clear();

        for (name, bucket) in diff.fragments() {
            let wanted = bucket.download_size();
            if wanted == 0 {
                continue;
            }

            let total = meta
                .and_then(|meta| meta.0.get(name))
                .map(|fragment| fragment.fragment_size)
                .filter(|size| *size >= wanted)
                .unwrap_or(wanted);

            self.fragments
                .insert(name.clone(), FragmentProgress { downloaded: 0, total });
        }
    }

    fn add(&mut self, fragment: &str, delta: u64) {
        if let Some(progress) = self.fragments.get_mut(fragment) {
            progress.downloaded = (progress.downloaded + delta).min(progress.total);
        }
        self.speed.add(delta);
    }

    fn snapshot(&mut self) -> Snapshot {
        let downloaded: u64 = self
            .fragments
            .values()
            .map(|progress| progress.downloaded)
            .sum();
        let total: u64 = self.fragments.values().map(|progress| progress.total).sum();

        Snapshot {
            fragments: self.fragments.clone(),
            overall: FragmentProgress {
                downloaded: self.already_downloaded + downloaded,
                total: self.already_downloaded + total,
            },
            speed_bps: self.speed.rate(),
        }
    }
}

/// Sliding-bucket download speed: bytes land in 100ms buckets, only
/// buckets inside the 1500ms window count, and the elapsed divisor
/// never goes below 50ms
#[derive(Default)]
struct Speedometer {
    buckets: VecDeque<(Instant, u64)>,
}

impl Speedometer {
    fn add(&mut self, bytes: u64) {
        let now = Instant::now();

        match self.buckets.back_mut() {
            Some((start, bucket)) if now - *start < environment::SPEED_BUCKET => {
                *bucket += bytes;
            }
            _ => self.buckets.push_back((now, bytes)),
        }

        self.evict(now);
    }

    fn rate(&mut self) -> u64 {
        let now = Instant::now();
        self.evict(now);

        let Some((oldest, _)) = self.buckets.front() else {
            return 0;
        };

        let bytes: u64 = self.buckets.iter().map(|(_, bucket)| bucket).sum();
        let elapsed = (now - *oldest).max(environment::SPEED_FLOOR);

        (bytes as f64 * 1000.0 / elapsed.as_millis() as f64) as u64
    }

    fn evict(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if now - *start > environment::SPEED_WINDOW {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
