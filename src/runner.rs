#![forbid(unsafe_code)]

// Load test runner - owns the population of simulated clients
//
// All structural changes (start, stop, rescale) and all session-event
// aggregation happen on one worker task, so population changes never race
// each other and counter updates never need a lock on the hot path.
// Sessions run concurrently and report through an unbounded event channel.

use crate::config::LoadTestConfig;
use crate::db;
use crate::pacing::PacingPolicy;
use crate::session::{ClientSession, SessionEvent, SessionHandle, SessionInput, SessionState};
use crate::stats::{self, StatsSnapshot};
use crate::user::SimulatedUser;
use anyhow::bail;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Control surface over the simulated population. Cheap to clone handles are
/// not needed — the dashboard/CLI owns one runner for the process lifetime.
pub struct LoadTestRunner {
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
}

enum Control {
    Start {
        host: Arc<str>,
        port: u16,
        pacing: PacingPolicy,
    },
    SetTarget(usize),
    Stop(oneshot::Sender<()>),
    LiveIds(oneshot::Sender<Vec<u32>>),
}

struct Shared {
    running: AtomicBool,
    started_at: StdMutex<Option<Instant>>,
    created_games: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    state_counts: [AtomicU64; SessionState::ALL.len()],
    received_by_command: StdRwLock<HashMap<String, u64>>,
    /// Baseline for the next snapshot's rate computation.
    previous: StdMutex<Option<StatsSnapshot>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            started_at: StdMutex::new(None),
            created_games: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            received_messages: AtomicU64::new(0),
            state_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            received_by_command: StdRwLock::new(HashMap::new()),
            previous: StdMutex::new(None),
        }
    }

    fn reset(&self) {
        self.created_games.store(0, Relaxed);
        self.sent_messages.store(0, Relaxed);
        self.received_messages.store(0, Relaxed);
        for counter in &self.state_counts {
            counter.store(0, Relaxed);
        }
        self.received_by_command
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Decrement, tolerating a count already cleared by `stop()`.
    fn dec_state(&self, state: SessionState) {
        let _ = self.state_counts[state.index()].fetch_update(Relaxed, Relaxed, |v| v.checked_sub(1));
    }

    fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed())
            .unwrap_or_default();
        let created_games = self.created_games.load(Relaxed);
        let sent_messages = self.sent_messages.load(Relaxed);
        let received_messages = self.received_messages.load(Relaxed);

        let mut session_states = BTreeMap::new();
        for state in SessionState::ALL {
            session_states.insert(state, self.state_counts[state.index()].load(Relaxed));
        }

        for (command, count) in self
            .received_by_command
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            debug!("Received '{}': {}", command, count);
        }

        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let (incoming_rate, outgoing_rate) = match previous.as_ref() {
            Some(prev) => {
                let delta_ms = elapsed.saturating_sub(prev.elapsed).as_millis() as u64;
                (
                    stats::message_rate(
                        received_messages.saturating_sub(prev.received_messages),
                        delta_ms,
                    ),
                    stats::message_rate(
                        sent_messages.saturating_sub(prev.sent_messages),
                        delta_ms,
                    ),
                )
            }
            // no baseline right after start
            None => (0, 0),
        };

        let snapshot = StatsSnapshot {
            elapsed,
            created_games,
            sent_messages,
            received_messages,
            session_states,
            incoming_rate,
            outgoing_rate,
        };
        *previous = Some(snapshot.clone());
        snapshot
    }
}

impl LoadTestRunner {
    pub fn new(config: Arc<LoadTestConfig>, db: Option<PgPool>) -> Self {
        let shared = Arc::new(Shared::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            shared: Arc::clone(&shared),
            target: config.clients,
            config,
            db,
            events_tx,
            sessions: Vec::new(),
            stopping: Vec::new(),
            server: None,
        };
        tokio::spawn(worker.run(control_rx, events_rx));

        Self {
            control: control_tx,
            shared,
        }
    }

    /// Begin a run: reset counters and bring the population up to the
    /// current target size, starting session ids at 0.
    pub fn start(&self, host: &str, port: u16, pacing: PacingPolicy) -> anyhow::Result<()> {
        if host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if port == 0 {
            bail!("port must not be 0");
        }
        self.send(Control::Start {
            host: Arc::from(host),
            port,
            pacing,
        })
    }

    /// Live-rescale the population to `target`. While stopped, the value is
    /// remembered for the next start.
    pub fn set_target_population(&self, target: usize) -> anyhow::Result<()> {
        self.send(Control::SetTarget(target))
    }

    /// End the run: stop every session, release its resources, and clear the
    /// population and all counters. Resolves once teardown is complete.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Control::Stop(done_tx))?;
        done_rx.await?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Relaxed)
    }

    /// Ids of the currently registered sessions, in registry order.
    pub async fn live_session_ids(&self) -> anyhow::Result<Vec<u32>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::LiveIds(reply_tx))?;
        Ok(reply_rx.await?)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.shared.snapshot()
    }

    fn send(&self, control: Control) -> anyhow::Result<()> {
        if self.control.send(control).is_err() {
            bail!("runner worker is gone");
        }
        Ok(())
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: Arc<LoadTestConfig>,
    db: Option<PgPool>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Live sessions ordered by ascending id.
    sessions: Vec<SessionHandle>,
    /// Sessions stopped by a rescale-down that have not yet terminated.
    stopping: Vec<SessionHandle>,
    target: usize,
    server: Option<(Arc<str>, u16, PacingPolicy)>,
}

impl Worker {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Start { host, port, pacing }) => self.start(host, port, pacing).await,
                    Some(Control::SetTarget(target)) => self.set_target(target).await,
                    Some(Control::Stop(done)) => {
                        self.stop(&mut events).await;
                        let _ = done.send(());
                    }
                    Some(Control::LiveIds(reply)) => {
                        let _ = reply.send(self.sessions.iter().map(|s| s.id).collect());
                    }
                    None => {
                        // control surface dropped; tear everything down
                        self.stop(&mut events).await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.apply(event),
            }
        }
    }

    async fn start(&mut self, host: Arc<str>, port: u16, pacing: PacingPolicy) {
        if self.shared.running.load(Relaxed) {
            warn!("Load test already running");
            return;
        }
        self.shared.reset();
        *self
            .shared
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.shared.running.store(true, Relaxed);
        self.server = Some((host, port, pacing));
        self.spawn_clients(self.target).await;
        info!("Load test started");
    }

    async fn set_target(&mut self, target: usize) {
        self.target = target;
        if !self.shared.running.load(Relaxed) {
            return;
        }

        let current = self.sessions.len();
        if target < current {
            // evict most-recently-added sessions first
            for handle in self.sessions.split_off(target) {
                debug!("Stopping client {}", handle.id);
                let _ = handle.input.send(SessionInput::Stop);
                self.stopping.push(handle);
            }
        } else if target > current {
            self.spawn_clients(target - current).await;
        }
    }

    async fn spawn_clients(&mut self, count: usize) {
        let Some((host, port, pacing)) = self.server.clone() else {
            return;
        };
        let mut next_id = self.sessions.last().map(|s| s.id + 1).unwrap_or(0);
        for _ in 0..count {
            let user = SimulatedUser::new(next_id);
            next_id += 1;

            if let Some(pool) = &self.db {
                if let Err(e) = db::ensure_user(pool, &user).await {
                    warn!("Failed to persist credentials for {}: {}", user.username(), e);
                }
            }

            let handle = ClientSession::spawn(
                user,
                Arc::clone(&host),
                port,
                pacing,
                Arc::clone(&self.config),
                self.events_tx.clone(),
            );
            self.sessions.push(handle);
        }
    }

    async fn stop(&mut self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        self.shared.running.store(false, Relaxed);
        self.server = None;

        for handle in &self.sessions {
            let _ = handle.input.send(SessionInput::Stop);
        }
        for handle in self.sessions.drain(..).chain(self.stopping.drain(..)) {
            let _ = handle.task.await;
        }

        // every session has terminated, so all of their events are queued;
        // drain them before clearing the counters
        while let Ok(event) = events.try_recv() {
            self.apply(event);
        }

        self.shared.reset();
        *self
            .shared
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        info!("Load test stopped");
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new, .. } => {
                if let Some(old) = old {
                    self.shared.dec_state(old);
                }
                self.shared.state_counts[new.index()].fetch_add(1, Relaxed);
            }
            SessionEvent::MessageSent { .. } => {
                self.shared.sent_messages.fetch_add(1, Relaxed);
            }
            SessionEvent::MessageReceived { command, .. } => {
                self.shared.received_messages.fetch_add(1, Relaxed);
                *self
                    .shared
                    .received_by_command
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(command)
                    .or_insert(0) += 1;
            }
            SessionEvent::GameCreated { .. } => {
                self.shared.created_games.fetch_add(1, Relaxed);
            }
            SessionEvent::Stopped { id, last_state } => {
                if let Some(state) = last_state {
                    self.shared.dec_state(state);
                }
                // removal is idempotent and keyed by id; a rescale-evicted
                // session reaps from `stopping`, never from a live session
                // that may have reused its id
                if let Some(pos) = self.stopping.iter().position(|s| s.id == id) {
                    self.stopping.swap_remove(pos);
                } else {
                    self.sessions.retain(|s| s.id != id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Stub lobby server: pushes `session` on connect, answers `hello` with
    /// `welcome` and `game_host` with `game_launch`.
    async fn spawn_stub_lobby() -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    if codec::write_text(&mut write_half, Some(r#"{"command":"session","session":1}"#))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    loop {
                        match codec::read_text(&mut reader).await {
                            Ok(Some(payload)) => {
                                let reply = if payload.contains("\"command\":\"hello\"") {
                                    Some(r#"{"command":"welcome","id":1,"login":"x"}"#)
                                } else if payload.contains("\"command\":\"game_host\"") {
                                    Some(r#"{"command":"game_launch","uid":1,"mod":"faf"}"#)
                                } else {
                                    None
                                };
                                if let Some(reply) = reply {
                                    if codec::write_text(&mut write_half, Some(reply)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(_) => break,
                        }
                    }
                });
            }
        });
        (addr, task)
    }

    fn test_runner() -> LoadTestRunner {
        LoadTestRunner::new(Arc::new(LoadTestConfig::default()), None)
    }

    async fn wait_for(runner: &LoadTestRunner, what: &str, cond: impl Fn(&StatsSnapshot) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = runner.snapshot();
            if cond(&snapshot) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn brute_force_population_walks_into_the_game_lobby() {
        let (addr, _server) = spawn_stub_lobby().await;
        let runner = test_runner();
        runner.set_target_population(3).unwrap();
        runner
            .start(&addr.ip().to_string(), addr.port(), PacingPolicy::BruteForce)
            .unwrap();

        // each session hosted a game, which requires the full
        // DISCONNECTED -> ... -> CREATING_GAME -> GAME_LOBBY walk
        wait_for(&runner, "3 hosted games", |s| {
            s.created_games >= 3 && s.live_sessions() == 3
        })
        .await;

        let snapshot = runner.snapshot();
        // at minimum ask_session + hello + game_host per client
        assert!(snapshot.sent_messages >= 9, "sent: {}", snapshot.sent_messages);
        // at minimum session + welcome + game_launch per client
        assert!(snapshot.received_messages >= 9, "received: {}", snapshot.received_messages);

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rescale_removes_highest_ids_first_and_continues_from_the_maximum() {
        let (addr, _server) = spawn_stub_lobby().await;
        let runner = test_runner();
        runner.set_target_population(2).unwrap();
        runner
            .start(&addr.ip().to_string(), addr.port(), PacingPolicy::BruteForce)
            .unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), vec![0, 1]);

        runner.set_target_population(5).unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), vec![0, 1, 2, 3, 4]);

        runner.set_target_population(2).unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), vec![0, 1]);

        runner.set_target_population(4).unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), vec![0, 1, 2, 3]);

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rescale_while_stopped_is_remembered_for_the_next_start() {
        let (addr, _server) = spawn_stub_lobby().await;
        let runner = test_runner();
        runner.set_target_population(2).unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), Vec::<u32>::new());

        runner
            .start(&addr.ip().to_string(), addr.port(), PacingPolicy::BruteForce)
            .unwrap();
        assert_eq!(runner.live_session_ids().await.unwrap(), vec![0, 1]);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_empties_the_population_and_zeroes_all_counters() {
        let (addr, _server) = spawn_stub_lobby().await;
        let runner = test_runner();
        runner.set_target_population(3).unwrap();
        runner
            .start(&addr.ip().to_string(), addr.port(), PacingPolicy::BruteForce)
            .unwrap();
        wait_for(&runner, "some traffic", |s| s.created_games >= 1).await;

        runner.stop().await.unwrap();
        assert!(!runner.is_running());

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.live_sessions(), 0);
        assert_eq!(snapshot.created_games, 0);
        assert_eq!(snapshot.sent_messages, 0);
        assert_eq!(snapshot.received_messages, 0);
        assert_eq!(snapshot.elapsed, Duration::ZERO);
        assert_eq!(runner.live_session_ids().await.unwrap(), Vec::<u32>::new());
    }

    #[tokio::test]
    async fn first_snapshot_after_start_has_zero_rates() {
        let (addr, _server) = spawn_stub_lobby().await;
        let runner = test_runner();
        runner.set_target_population(1).unwrap();
        runner
            .start(&addr.ip().to_string(), addr.port(), PacingPolicy::BruteForce)
            .unwrap();

        let first = runner.snapshot();
        assert_eq!(first.incoming_rate, 0);
        assert_eq!(first.outgoing_rate, 0);

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn structural_errors_are_surfaced_synchronously() {
        let runner = test_runner();
        assert!(runner.start("", 8001, PacingPolicy::Human).is_err());
        assert!(runner.start("localhost", 0, PacingPolicy::Human).is_err());
    }
}
