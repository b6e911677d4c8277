// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeSet, VecDeque};

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sequencer;

/// Conditions that pause the whole queue. Clearing the last active
/// gate resumes whatever was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gate {
    /// No network connectivity
    Offline,
    /// The host application is downloading its own update
    SelfUpdate,
}

/// Identity of a queued update
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub game_uid: String,
    pub release_name: String,
}

/// A sequencer prepared by a release but not yet started. Invoking
/// the launcher spawns the run and yields its control surfaces.
pub type Launcher = Box<dyn FnOnce() -> Running + Send>;

pub struct Running {
    pub handle: sequencer::Handle,
    pub events: mpsc::Receiver<sequencer::Event>,
    pub task: JoinHandle<()>,
}

/// A request to enqueue one update run
pub struct Request {
    pub key: Key,
    pub launch: Launcher,
}

/// Events forwarded out of the queue, tagged with the update they
/// belong to
#[derive(Debug)]
pub struct QueueEvent {
    pub key: Key,
    pub event: sequencer::Event,
}

#[derive(Debug)]
enum Command {
    Add(Request),
    SetIndex { key: Key, index: usize },
    PauseCurrent { by_user: bool },
    Resume { key: Key, by_user: bool },
    SetGate { gate: Gate, active: bool },
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("key", &self.key).finish()
    }
}

/// Control surface handed to releases and the host
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
}

impl Handle {
    pub async fn add(&self, request: Request) {
        let _ = self.commands.send(Command::Add(request)).await;
    }

    pub async fn set_index(&self, key: Key, index: usize) {
        let _ = self.commands.send(Command::SetIndex { key, index }).await;
    }

    pub async fn pause_current(&self, by_user: bool) {
        let _ = self
            .commands
            .send(Command::PauseCurrent { by_user })
            .await;
    }

    pub async fn resume(&self, key: Key, by_user: bool) {
        let _ = self.commands.send(Command::Resume { key, by_user }).await;
    }

    pub async fn set_gate(&self, gate: Gate, active: bool) {
        let _ = self.commands.send(Command::SetGate { gate, active }).await;
    }
}

enum State {
    Queued(Option<Launcher>),
    Running(Running),
}

struct Update {
    key: Key,
    paused_by_user: bool,
    state: State,
}

impl Update {
    fn running_mut(&mut self) -> Option<&mut Running> {
        match &mut self.state {
            State::Running(running) => Some(running),
            State::Queued(_) => None,
        }
    }
}

/// FIFO of update runs with an at-most-one-running invariant,
/// connectivity gating and user priority
pub struct UpdateQueue {
    updates: VecDeque<Update>,
    /// Key of the update currently allowed to make progress
    current: Option<Key>,
    gates: BTreeSet<Gate>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<QueueEvent>,
}

enum Turn {
    Command(Option<Command>),
    Event(Option<sequencer::Event>),
}

pub fn new() -> (UpdateQueue, Handle, mpsc::Receiver<QueueEvent>) {
    let (command_sender, command_receiver) = mpsc::channel(64);
    let (event_sender, event_receiver) = mpsc::channel(64);

    (
        UpdateQueue {
            updates: VecDeque::new(),
            current: None,
            gates: BTreeSet::new(),
            commands: command_receiver,
            events: event_sender,
        },
        Handle {
            commands: command_sender,
        },
        event_receiver,
    )
}

impl UpdateQueue {
    /// Actor loop; runs until every handle is dropped
    pub async fn run(mut self) {
        loop {
            let turn = match self.current_running_index() {
                Some(index) => {
                    let commands = &mut self.commands;
                    let running = self.updates[index]
                        .running_mut()
                        .expect("current update is running");

                    tokio::select! {
                        command = commands.recv() => Turn::Command(command),
                        event = running.events.recv() => Turn::Event(event),
                    }
                }
                None => Turn::Command(self.commands.recv().await),
            };

            match turn {
                Turn::Command(Some(command)) => self.handle_command(command).await,
                Turn::Command(None) => break,
                Turn::Event(event) => self.handle_event(event).await,
            }
        }
    }

    fn current_running_index(&self) -> Option<usize> {
        let current = self.current.as_ref()?;
        self.updates.iter().position(|update| {
            &update.key == current && matches!(update.state, State::Running(_))
        })
    }

    fn position(&self, key: &Key) -> Option<usize> {
        self.updates.iter().position(|update| &update.key == key)
    }

    fn gated(&self) -> bool {
        !self.gates.is_empty()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(request) => {
                debug!("queue: add {:?}", request.key);

                self.updates.push_back(Update {
                    key: request.key,
                    paused_by_user: false,
                    state: State::Queued(Some(request.launch)),
                });

                let current_user_paused = self
                    .current_update()
                    .map(|update| update.paused_by_user)
                    .unwrap_or(false);

                if self.current.is_none() || current_user_paused {
                    self.start_head(None).await;
                }
            }
            Command::SetIndex { key, index } => {
                let Some(position) = self.position(&key) else {
                    return;
                };

                let update = self.updates.remove(position).expect("position exists");
                let index = index.min(self.updates.len());
                self.updates.insert(index, update);

                if position == 0 || index == 0 {
                    self.pause_current(false, false).await;
                    if !self.gated() {
                        self.start_head(None).await;
                    }
                }
            }
            Command::PauseCurrent { by_user } => {
                self.pause_current(by_user, true).await;
                if !self.gated() {
                    self.start_head(None).await;
                }
            }
            Command::Resume { key, by_user } => {
                let Some(position) = self.position(&key) else {
                    return;
                };

                if self.current.as_ref() != Some(&key) {
                    self.pause_current(false, false).await;
                }

                let update = self.updates.remove(position).expect("position exists");
                self.updates.push_front(update);

                if !self.gated() {
                    self.start_head(by_user.then(|| key.clone())).await;
                }
            }
            Command::SetGate { gate, active } => {
                let was_gated = self.gated();

                if active {
                    self.gates.insert(gate);
                } else {
                    self.gates.remove(&gate);
                }

                if !was_gated && self.gated() {
                    debug!("queue: gated by {gate:?}");
                    // Keep paused_by_user untouched so connectivity
                    // returning restarts automatically
                    if let Some(running) = self.current_running() {
                        running.handle.pause().await;
                    }
                } else if was_gated && !self.gated() {
                    debug!("queue: gates cleared");
                    match self.current_running() {
                        Some(running) => running.handle.resume().await,
                        None => self.start_head(None).await,
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Option<sequencer::Event>) {
        let Some(key) = self.current.clone() else {
            return;
        };

        let terminal = matches!(
            event,
            None | Some(
                sequencer::Event::Completed { .. }
                    | sequencer::Event::Cancelled
                    | sequencer::Event::Error(_)
            )
        );

        if let Some(event) = event {
            let _ = self
                .events
                .send(QueueEvent {
                    key: key.clone(),
                    event,
                })
                .await;
        }

        if terminal {
            debug!("queue: {key:?} finished");

            if let Some(position) = self.position(&key) {
                self.updates.remove(position);
            }
            self.current = None;

            if !self.gated() {
                self.start_head(None).await;
            }
        }
    }

    fn current_update(&mut self) -> Option<&mut Update> {
        let current = self.current.clone()?;
        self.updates.iter_mut().find(|update| update.key == current)
    }

    fn current_running(&mut self) -> Option<&mut Running> {
        self.current_update().and_then(Update::running_mut)
    }

    /// Pause whatever is running. `to_tail` sends it to the back of
    /// the queue unless it is the only entry.
    async fn pause_current(&mut self, by_user: bool, to_tail: bool) {
        let Some(current) = self.current.clone() else {
            return;
        };

        if let Some(update) = self.current_update() {
            update.paused_by_user = by_user;
            if let Some(running) = update.running_mut() {
                running.handle.pause().await;
            }
        }

        if to_tail && self.updates.len() > 1 {
            if let Some(position) = self.position(&current) {
                if let Some(update) = self.updates.remove(position) {
                    self.updates.push_back(update);
                }
            }
            self.current = None;
        } else if !to_tail {
            self.current = None;
        }
        // Paused in place (single entry): stays current, so a later
        // add() knows the head is user-paused
    }

    /// Start (or resume) the first startable update. A user-paused
    /// entry is skipped unless this start is the user resuming it.
    async fn start_head(&mut self, user_resume: Option<Key>) {
        if self.gated() {
            return;
        }

        let position = self.updates.iter().position(|update| {
            !update.paused_by_user || user_resume.as_ref() == Some(&update.key)
        });

        let Some(position) = position else {
            return;
        };

        let update = &mut self.updates[position];
        let key = update.key.clone();
        update.paused_by_user = false;

        match &mut update.state {
            State::Queued(launcher) => {
                let launcher = launcher.take().expect("queued update has a launcher");
                debug!("queue: starting {key:?}");
                update.state = State::Running(launcher());
            }
            State::Running(running) => {
                debug!("queue: resuming {key:?}");
                running.handle.resume().await;
            }
        }

        self.current = Some(key);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    struct Fake {
        /// Count of launcher invocations
        launched: Arc<AtomicUsize>,
        /// Feed sequencer events into the queue
        events: mpsc::Sender<sequencer::Event>,
        /// Observe pause/resume commands the queue sends
        commands: mpsc::Receiver<sequencer::Command>,
    }

    fn request(game: &str) -> (Request, Fake) {
        let launched = Arc::new(AtomicUsize::new(0));
        let (event_sender, event_receiver) = mpsc::channel(16);
        let (handle, command_receiver) = sequencer::Handle::detached();

        let fake = Fake {
            launched: launched.clone(),
            events: event_sender,
            commands: command_receiver,
        };

        let mut running = Some(Running {
            handle,
            events: event_receiver,
            task: tokio::spawn(async {}),
        });

        let request = Request {
            key: Key {
                game_uid: game.to_owned(),
                release_name: "main".into(),
            },
            launch: Box::new(move || {
                launched.fetch_add(1, Ordering::SeqCst);
                running.take().expect("launched once")
            }),
        };

        (request, fake)
    }

    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn single_runner_invariant() {
        let (queue, handle, _events) = new();
        tokio::spawn(queue.run());

        let (first, first_fake) = request("a");
        let (second, second_fake) = request("b");

        handle.add(first).await;
        handle.add(second).await;
        settle().await;

        assert_eq!(first_fake.launched.load(Ordering::SeqCst), 1);
        assert_eq!(second_fake.launched.load(Ordering::SeqCst), 0);

        // First finishes; second starts
        first_fake
            .events
            .send(sequencer::Event::Completed { fragments: vec![] })
            .await
            .unwrap();
        settle().await;

        assert_eq!(second_fake.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_events_are_forwarded() {
        let (queue, handle, mut events) = new();
        tokio::spawn(queue.run());

        let (request, fake) = request("a");
        handle.add(request).await;
        settle().await;

        fake.events
            .send(sequencer::Event::Completed { fragments: vec![] })
            .await
            .unwrap();

        let forwarded = events.recv().await.unwrap();
        assert_eq!(forwarded.key.game_uid, "a");
        assert!(matches!(forwarded.event, sequencer::Event::Completed { .. }));
    }

    #[tokio::test]
    async fn pause_current_moves_to_tail_and_starts_next() {
        let (queue, handle, _events) = new();
        tokio::spawn(queue.run());

        let (first, mut first_fake) = request("a");
        let (second, second_fake) = request("b");

        handle.add(first).await;
        handle.add(second).await;
        settle().await;

        handle.pause_current(true).await;
        settle().await;

        // The paused sequencer received a pause command
        let command = first_fake.commands.recv().await.unwrap();
        assert!(matches!(command, sequencer::Command::Pause));

        // And the queue moved on
        assert_eq!(second_fake.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn user_paused_head_is_skipped() {
        let (queue, handle, _events) = new();
        tokio::spawn(queue.run());

        let (first, _first_fake) = request("a");
        handle.add(first).await;
        settle().await;

        // Pause in place: single entry
        handle.pause_current(true).await;
        settle().await;

        // A new update starts even though the paused one is ahead
        let (second, second_fake) = request("b");
        handle.add(second).await;
        settle().await;

        assert_eq!(second_fake.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gates_pause_and_resume() {
        let (queue, handle, _events) = new();
        tokio::spawn(queue.run());

        let (request_a, mut fake) = request("a");
        handle.add(request_a).await;
        settle().await;

        handle.set_gate(Gate::Offline, true).await;
        settle().await;
        assert!(matches!(
            fake.commands.recv().await.unwrap(),
            sequencer::Command::Pause
        ));

        // Nothing new starts while gated
        let (request_b, fake_b) = request("b");
        handle.add(request_b).await;
        settle().await;
        assert_eq!(fake_b.launched.load(Ordering::SeqCst), 0);

        handle.set_gate(Gate::Offline, false).await;
        settle().await;
        assert!(matches!(
            fake.commands.recv().await.unwrap(),
            sequencer::Command::Resume
        ));
    }

    #[tokio::test]
    async fn user_resume_promotes_to_head() {
        let (queue, handle, _events) = new();
        tokio::spawn(queue.run());

        let (first, _first_fake) = request("a");
        let (second, second_fake) = request("b");
        let (third, _third_fake) = request("c");

        handle.add(first).await;
        handle.add(second).await;
        handle.add(third).await;
        settle().await;

        handle
            .resume(
                Key {
                    game_uid: "b".into(),
                    release_name: "main".into(),
                },
                true,
            )
            .await;
        settle().await;

        assert_eq!(second_fake.launched.load(Ordering::SeqCst), 1);
    }
}
