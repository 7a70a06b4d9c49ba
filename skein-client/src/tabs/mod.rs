//! Cross-tab push ownership.
//!
//! Exactly one tab per origin holds the push connection. Election runs over
//! the tab bus:
//!
//! 1. A tab with a session asks `lookingForSseOwner` and waits the election
//!    timeout for an `iOwnSse` answer.
//! 2. Without an answer it tries the advisory lock. The winner becomes
//!    [`TabRole::Owner`], records itself in shared storage and announces
//!    `iOwnSse`. Losers ask again, a bounded number of times.
//! 3. Deferring tabs re-ask every owner-check interval; an owner that stops
//!    answering (a crashed tab releases its lock but says nothing) is
//!    replaced through the same steps.
//! 4. Every tab announces `out` on shutdown. The owner releases the lock
//!    first, so the tabs that re-elect can take it.
//!
//! The owner also announces `sseHealthy` whenever its push connection goes
//! up or down, and after every `iOwnSse` answer. Deferring tabs mirror that
//! into [`TabCoordinator::subscribe_owner_health`]; a new owner counts as
//! unhealthy until it says otherwise.
//!
//! Event batches relayed by the owner are handed to the client through the
//! receiver returned by [`TabCoordinator::spawn`].

mod local;

pub use local::LocalTabHub;

use crate::lock;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use skein_core::{
    AdvisoryLocks, ClientConfig, EventBatch, KeyValueStorage, LockGuard, TabBus, TabId,
    TabMessage, PUSH_OWNER_KEY,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// This tab's part in push ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabRole {
    /// No known owner and no election in progress.
    Unowned,
    /// Election in progress.
    SeekingOwnership,
    /// This tab holds the lock and the push connection.
    Owner,
    /// Another tab owns push and relays its events here.
    DeferringToOwner(TabId),
}

impl TabRole {
    pub fn is_owner(&self) -> bool {
        matches!(self, TabRole::Owner)
    }

    /// The other tab this one defers to.
    pub fn owner(&self) -> Option<&TabId> {
        match self {
            TabRole::DeferringToOwner(owner) => Some(owner),
            _ => None,
        }
    }
}

/// Election timings.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lock_name: String,
    /// How long a query waits for an owner to answer.
    pub timeout: Duration,
    /// Queries before giving up and falling back to `Unowned`.
    pub max_attempts: u32,
    /// How often a deferring tab checks that its owner is alive. Also the
    /// pause before an `Unowned` tab with a session tries again.
    pub owner_check_interval: Duration,
}

impl ElectionConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            lock_name: config.lock_name.clone(),
            timeout: config.election_timeout(),
            max_attempts: config.election_max_attempts.max(1),
            owner_check_interval: config.owner_check_interval(),
        }
    }
}

/// The environment an election runs against.
#[derive(Clone)]
pub struct TabPorts {
    pub bus: Arc<dyn TabBus>,
    pub locks: Arc<dyn AdvisoryLocks>,
    /// Storage shared by every tab; holds the owner marker.
    pub shared: Arc<dyn KeyValueStorage>,
}

enum Command {
    SessionStarted,
    SessionEnded,
    Shutdown(oneshot::Sender<()>),
}

/// Handle on the background election task of one tab.
pub struct TabCoordinator {
    tab_id: TabId,
    commands: mpsc::UnboundedSender<Command>,
    role: watch::Receiver<TabRole>,
    owner_health: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TabCoordinator {
    /// Start the election task. Returns the handle and the stream of event
    /// batches relayed by the owner.
    ///
    /// `push_health` is this tab's own connection state, announced to the
    /// others while this tab is the owner.
    pub fn spawn(
        tab_id: TabId,
        ports: TabPorts,
        config: ElectionConfig,
        push_health: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<EventBatch>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (role_tx, role) = watch::channel(TabRole::Unowned);
        let (owner_health_tx, owner_health) = watch::channel(false);
        let (relay, relayed) = mpsc::unbounded_channel();
        let inbox = ports.bus.subscribe(&tab_id);

        let election = Election {
            tab_id: tab_id.clone(),
            ports,
            config,
            role: role_tx,
            owner_health: owner_health_tx,
            push_health: push_health.clone(),
            relay,
            has_session: false,
            guard: None,
            phase: Phase::Idle,
        };
        let task = tokio::spawn(election.run(inbox, command_rx, push_health));

        let coordinator = Self {
            tab_id,
            commands,
            role,
            owner_health,
            task: Mutex::new(Some(task)),
        };
        (coordinator, relayed)
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn role(&self) -> TabRole {
        self.role.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TabRole> {
        self.role.clone()
    }

    /// Push health last announced by the tab this one defers to. False
    /// whenever this tab is not deferring.
    pub fn subscribe_owner_health(&self) -> watch::Receiver<bool> {
        self.owner_health.clone()
    }

    /// Wait until the role satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&TabRole) -> bool) -> TabRole {
        let mut role = self.role.clone();
        let result = match role.wait_for(|current| predicate(current)).await {
            Ok(current) => current.clone(),
            Err(_) => self.role(),
        };
        result
    }

    /// A session began: join or start an election.
    pub fn session_started(&self) {
        let _ = self.commands.send(Command::SessionStarted);
    }

    /// The session ended: an owner relinquishes, everyone else goes `Unowned`.
    pub fn session_ended(&self) {
        let _ = self.commands.send(Command::SessionEnded);
    }

    /// Announce `out`, release ownership and stop the election task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        lock(&self.task).take();
    }

    /// Stop without announcing anything. The lock is released when the task
    /// drops it, as when a tab crashes.
    pub fn abort(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Asked for an owner; seek the lock at `deadline` unless answered.
    Querying { deadline: Instant, attempt: u32 },
    /// Deferring; ask the owner again at `next_check`.
    Watching { next_check: Instant },
    /// Deferring and re-asked; the owner is presumed gone at `deadline`.
    Verifying { deadline: Instant },
    /// Gave up; start over at `until`.
    Backoff { until: Instant },
}

impl Phase {
    fn deadline(&self) -> Option<Instant> {
        match *self {
            Phase::Idle => None,
            Phase::Querying { deadline, .. } => Some(deadline),
            Phase::Watching { next_check } => Some(next_check),
            Phase::Verifying { deadline } => Some(deadline),
            Phase::Backoff { until } => Some(until),
        }
    }
}

struct Election {
    tab_id: TabId,
    ports: TabPorts,
    config: ElectionConfig,
    role: watch::Sender<TabRole>,
    owner_health: watch::Sender<bool>,
    push_health: watch::Receiver<bool>,
    relay: mpsc::UnboundedSender<EventBatch>,
    has_session: bool,
    guard: Option<LockGuard>,
    phase: Phase,
}

impl Election {
    async fn run(
        mut self,
        mut inbox: BoxStream<'static, TabMessage>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut push_health: watch::Receiver<bool>,
    ) {
        let mut inbox_open = true;
        let mut health_open = true;
        loop {
            let deadline = self.phase.deadline();
            tokio::select! {
                message = inbox.next(), if inbox_open => match message {
                    Some(message) => self.on_message(message),
                    None => {
                        warn!(tab_id = %self.tab_id, "Tab bus closed");
                        inbox_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::SessionStarted) => self.on_session_started(),
                    Some(Command::SessionEnded) => self.on_session_ended(),
                    Some(Command::Shutdown(ack)) => {
                        self.unload();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.unload();
                        return;
                    }
                },
                changed = push_health.changed(), if health_open => match changed {
                    Ok(()) => {
                        let healthy = *push_health.borrow_and_update();
                        self.on_push_health(healthy);
                    }
                    Err(_) => health_open = false,
                },
                _ = wait_until(deadline) => self.on_deadline(),
            }
        }
    }

    fn current(&self) -> TabRole {
        self.role.borrow().clone()
    }

    fn is_owner(&self) -> bool {
        self.role.borrow().is_owner()
    }

    fn set_role(&self, role: TabRole) {
        if role.owner().is_none() || role.owner() != self.current().owner() {
            self.set_owner_health(false);
        }
        let tab_id = &self.tab_id;
        self.role.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            debug!(%tab_id, from = ?current, to = ?role, "Tab role changed");
            *current = role;
            true
        });
    }

    fn set_owner_health(&self, healthy: bool) {
        self.owner_health.send_if_modified(|current| {
            if *current == healthy {
                return false;
            }
            *current = healthy;
            true
        });
    }

    fn broadcast(&self, message: TabMessage) {
        self.ports.bus.broadcast(&self.tab_id, message);
    }

    fn announce_health(&self) {
        let healthy = *self.push_health.borrow();
        self.broadcast(TabMessage::push_health(self.tab_id.clone(), healthy));
    }

    fn on_push_health(&self, healthy: bool) {
        if self.is_owner() {
            debug!(tab_id = %self.tab_id, healthy, "Announcing push health");
            self.broadcast(TabMessage::push_health(self.tab_id.clone(), healthy));
        }
    }

    fn on_session_started(&mut self) {
        self.has_session = true;
        match (self.current(), self.phase) {
            (TabRole::Unowned, Phase::Idle | Phase::Backoff { .. }) => self.query(1),
            (TabRole::DeferringToOwner(_), Phase::Idle) => self.watch_owner(),
            _ => {}
        }
    }

    fn on_session_ended(&mut self) {
        self.has_session = false;
        if self.is_owner() {
            self.relinquish();
        } else {
            self.set_role(TabRole::Unowned);
        }
        self.phase = Phase::Idle;
    }

    fn on_message(&mut self, message: TabMessage) {
        match message {
            TabMessage::LookingForOwner { id, .. } => {
                if self.is_owner() {
                    debug!(tab_id = %self.tab_id, asker = %id, "Answering owner query");
                    self.broadcast(TabMessage::i_own(self.tab_id.clone()));
                    self.announce_health();
                }
            }
            TabMessage::IOwn { id, .. } => {
                if self.is_owner() {
                    warn!(tab_id = %self.tab_id, other = %id, "Another tab claims push ownership");
                    return;
                }
                if self.current().owner() != Some(&id) {
                    info!(tab_id = %self.tab_id, owner = %id, "Deferring to push owner");
                }
                self.set_role(TabRole::DeferringToOwner(id));
                if self.has_session {
                    self.watch_owner();
                } else {
                    self.phase = Phase::Idle;
                }
            }
            TabMessage::Out { id, .. } => {
                if self.current().owner() == Some(&id) {
                    info!(tab_id = %self.tab_id, owner = %id, "Push owner left");
                    self.set_role(TabRole::Unowned);
                    if self.has_session {
                        self.query(1);
                    } else {
                        self.phase = Phase::Idle;
                    }
                }
            }
            TabMessage::PushHealth { id, healthy } => {
                if self.current().owner() == Some(&id) {
                    debug!(tab_id = %self.tab_id, owner = %id, healthy, "Owner push health");
                    self.set_owner_health(healthy);
                }
            }
            TabMessage::Events(batch) => {
                let _ = self.relay.send(batch);
            }
        }
    }

    fn on_deadline(&mut self) {
        match self.phase {
            Phase::Idle => {}
            Phase::Querying { attempt, .. } => self.seek(attempt),
            Phase::Watching { .. } => {
                self.broadcast(TabMessage::looking_for_owner(self.tab_id.clone()));
                self.phase = Phase::Verifying {
                    deadline: Instant::now() + self.config.timeout,
                };
            }
            Phase::Verifying { .. } => {
                info!(tab_id = %self.tab_id, "Push owner stopped answering");
                self.set_role(TabRole::Unowned);
                self.seek(1);
            }
            Phase::Backoff { .. } => self.query(1),
        }
    }

    fn query(&mut self, attempt: u32) {
        debug!(tab_id = %self.tab_id, attempt, "Looking for push owner");
        self.broadcast(TabMessage::looking_for_owner(self.tab_id.clone()));
        self.phase = Phase::Querying {
            deadline: Instant::now() + self.config.timeout,
            attempt,
        };
    }

    fn watch_owner(&mut self) {
        self.phase = Phase::Watching {
            next_check: Instant::now() + self.config.owner_check_interval,
        };
    }

    /// Nobody answered: try to take the lock.
    fn seek(&mut self, attempt: u32) {
        if !self.has_session {
            self.set_role(TabRole::Unowned);
            self.phase = Phase::Idle;
            return;
        }
        self.set_role(TabRole::SeekingOwnership);
        match self.ports.locks.try_acquire(&self.config.lock_name) {
            Some(guard) => self.become_owner(guard),
            None if attempt < self.config.max_attempts => {
                debug!(tab_id = %self.tab_id, attempt, "Push lock held elsewhere");
                self.query(attempt + 1);
            }
            None => {
                warn!(
                    tab_id = %self.tab_id,
                    attempts = attempt,
                    "No push owner found, falling back to polling"
                );
                self.set_role(TabRole::Unowned);
                self.phase = Phase::Backoff {
                    until: Instant::now() + self.config.owner_check_interval,
                };
            }
        }
    }

    fn become_owner(&mut self, guard: LockGuard) {
        self.guard = Some(guard);
        if let Err(err) = self.ports.shared.set(PUSH_OWNER_KEY, self.tab_id.as_str()) {
            warn!(tab_id = %self.tab_id, error = %err, "Failed to record push owner");
        }
        self.set_role(TabRole::Owner);
        self.phase = Phase::Idle;
        self.broadcast(TabMessage::i_own(self.tab_id.clone()));
        info!(tab_id = %self.tab_id, "Took push ownership");
    }

    fn relinquish(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
        if self.ports.shared.get(PUSH_OWNER_KEY).as_deref() == Some(self.tab_id.as_str()) {
            if let Err(err) = self.ports.shared.remove(PUSH_OWNER_KEY) {
                warn!(tab_id = %self.tab_id, error = %err, "Failed to clear push owner");
            }
        }
        self.set_role(TabRole::Unowned);
        self.broadcast(TabMessage::out(self.tab_id.clone()));
        info!(tab_id = %self.tab_id, "Released push ownership");
    }

    fn unload(&mut self) {
        if self.is_owner() {
            self.relinquish();
        } else {
            self.set_role(TabRole::Unowned);
            self.broadcast(TabMessage::out(self.tab_id.clone()));
        }
        self.phase = Phase::Idle;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
