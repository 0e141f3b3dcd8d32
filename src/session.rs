#![forbid(unsafe_code)]

// Client session - one simulated lobby client's full lifecycle
//
// Each session is a single-threaded actor: timer-fired steps and inbound
// server messages arrive through one ordered inbox, so the state machine is
// only ever touched from one execution context. The blocking read loop runs
// as a separate task that produces inbox events instead of mutating state.

use crate::codec::{self, CodecError};
use crate::config::LoadTestConfig;
use crate::pacing::{DelayBounds, PacingPolicy};
use crate::protocol::{self, ClientCommand, ServerCommand, Target};
use crate::user::SimulatedUser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Fixed delay before a dropped connection is retried.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Number of scripted participants in every hosted game.
const SCRIPTED_PLAYERS: u32 = 12;

/// Settle time between the last scripted death and the score screen.
const GAME_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Fixed post-game statistics block reported for every scripted participant.
const GAME_STATS_JSON: &str = r#"{"stats":[{"faction":1,"type":"Human","name":"player","general":{"score":10,"currentcap":{"count":1000},"kills":{"count":12,"mass":18230,"energy":94012},"built":{"count":240,"mass":52101,"energy":408220},"lost":{"count":118,"mass":24080,"energy":101500}},"units":{"cdr":{"kills":1,"built":0,"lost":1}}}]}"#;

/// Session lifecycle states in strict topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    InitiatingSession,
    LoggingIn,
    Idle,
    CreatingGame,
    GameLobby,
    Playing,
    ScoreScreen,
}

impl SessionState {
    pub const ALL: [SessionState; 10] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::InitiatingSession,
        SessionState::LoggingIn,
        SessionState::Idle,
        SessionState::CreatingGame,
        SessionState::GameLobby,
        SessionState::Playing,
        SessionState::ScoreScreen,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Events a session reports to its listener (the runner's aggregation loop).
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        id: u32,
        old: Option<SessionState>,
        new: SessionState,
    },
    MessageSent {
        id: u32,
    },
    MessageReceived {
        id: u32,
        command: String,
    },
    GameCreated {
        id: u32,
    },
    /// Emitted exactly once, after which no further events follow.
    Stopped {
        id: u32,
        last_state: Option<SessionState>,
    },
}

/// Inputs delivered to a session's inbox. Reader-produced inputs carry the
/// connection generation so events from a torn-down reader are ignored.
#[derive(Debug)]
pub enum SessionInput {
    Frame { generation: u64, payload: String },
    ConnectionLost { generation: u64 },
    Stop,
}

/// A live session as seen by the runner.
pub struct SessionHandle {
    pub id: u32,
    pub input: mpsc::UnboundedSender<SessionInput>,
    pub task: JoinHandle<()>,
}

/// Transition attempted from the wrong source state. Fatal to the session.
#[derive(Debug, Error)]
#[error("client {id}: expected state {expected:?} but was {actual:?}")]
pub struct StateError {
    pub id: u32,
    pub expected: Option<SessionState>,
    pub actual: Option<SessionState>,
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum Flow {
    Continue,
    Shutdown,
}

/// A scripted step waiting on the session's private timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Connect,
    HostGame,
    OpenLobby,
    SeatPlayers,
    LaunchGame,
    PlayerDied(u32),
    EndGame,
    CloseGame,
}

struct PendingAction {
    at: Instant,
    seq: u64,
    action: Action,
}

pub struct ClientSession {
    user: SimulatedUser,
    host: Arc<str>,
    port: u16,
    pacing: PacingPolicy,
    config: Arc<LoadTestConfig>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,

    state: Option<SessionState>,
    writer: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    generation: u64,
    stop_requested: bool,
    pending: Vec<PendingAction>,
    next_seq: u64,
}

impl ClientSession {
    /// Spawn a session actor. It begins disconnected and immediately
    /// schedules its first connect attempt.
    pub fn spawn(
        user: SimulatedUser,
        host: Arc<str>,
        port: u16,
        pacing: PacingPolicy,
        config: Arc<LoadTestConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionHandle {
        let (session, inbox) = Self::new(user, host, port, pacing, config, events);
        let id = user.id;
        let input = session.inbox_tx.clone();
        let task = tokio::spawn(session.run(inbox));
        SessionHandle { id, input, task }
    }

    fn new(
        user: SimulatedUser,
        host: Arc<str>,
        port: u16,
        pacing: PacingPolicy,
        config: Arc<LoadTestConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionInput>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let session = Self {
            user,
            host,
            port,
            pacing,
            config,
            events,
            inbox_tx,
            state: None,
            writer: None,
            reader_task: None,
            generation: 0,
            stop_requested: false,
            pending: Vec::new(),
            next_seq: 0,
        };
        (session, inbox_rx)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        if let Err(e) = self.change_state(None, SessionState::Disconnected) {
            error!("{}: {}", self.user.id, e);
            self.finish();
            return;
        }
        self.schedule(Duration::ZERO, Action::Connect);

        loop {
            let deadline = self.next_deadline();
            let sleep_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                input = inbox.recv() => match input {
                    Some(SessionInput::Frame { generation, payload })
                        if generation == self.generation =>
                    {
                        match self.on_frame(&payload).await {
                            Ok(()) => {}
                            Err(e) => {
                                if !self.handle_error(e) {
                                    break;
                                }
                            }
                        }
                    }
                    Some(SessionInput::ConnectionLost { generation })
                        if generation == self.generation =>
                    {
                        if !self.degrade() {
                            break;
                        }
                    }
                    // stale events from a reader that was already torn down
                    Some(SessionInput::Frame { .. }) | Some(SessionInput::ConnectionLost { .. }) => {}
                    Some(SessionInput::Stop) | None => {
                        self.stop_requested = true;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(sleep_at), if deadline.is_some() => {
                    let Some(action) = self.pop_due() else { continue };
                    let result = match action {
                        Action::Connect => self.connect(&mut inbox).await,
                        other => self.perform(other).await.map(|()| Flow::Continue),
                    };
                    match result {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => break,
                        Err(e) => {
                            if !self.handle_error(e) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.finish();
    }

    /// Transport errors degrade the session; anything else is fatal to it.
    /// Returns whether the session should keep running.
    fn handle_error(&mut self, error: SessionError) -> bool {
        match error {
            SessionError::Codec(e) => {
                debug!("{}: connection lost: {}", self.user.id, e);
                self.degrade()
            }
            SessionError::State(e) => {
                error!("{}: {}", self.user.id, e);
                false
            }
            SessionError::Serialize(e) => {
                error!("{}: {}", self.user.id, e);
                false
            }
        }
    }

    /// Enforced state transition. The session must currently be in `from`;
    /// anything else is a defect, never silently repaired.
    fn change_state(
        &mut self,
        from: Option<SessionState>,
        to: SessionState,
    ) -> Result<(), StateError> {
        if self.state != from {
            return Err(StateError {
                id: self.user.id,
                expected: from,
                actual: self.state,
            });
        }
        self.state = Some(to);
        self.emit(SessionEvent::StateChanged {
            id: self.user.id,
            old: from,
            new: to,
        });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn schedule(&mut self, delay: Duration, action: Action) {
        self.next_seq += 1;
        self.pending.push(PendingAction {
            at: Instant::now() + delay,
            seq: self.next_seq,
            action,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.at).min()
    }

    /// Earliest pending action; ties broken by scheduling order.
    fn pop_due(&mut self) -> Option<Action> {
        let idx = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.at, p.seq))
            .map(|(i, _)| i)?;
        Some(self.pending.swap_remove(idx).action)
    }

    fn think(&self, bounds: DelayBounds) -> Duration {
        self.pacing.think_time(bounds)
    }

    // --- Connection management ---

    async fn connect(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<SessionInput>,
    ) -> Result<Flow, SessionError> {
        // guard against duplicate concurrent connect attempts
        if self.state != Some(SessionState::Disconnected) {
            return Ok(Flow::Continue);
        }

        debug!("{}: connecting to {}:{}", self.user.id, self.host, self.port);
        self.change_state(Some(SessionState::Disconnected), SessionState::Connecting)?;

        let connect = TcpStream::connect((self.host.to_string(), self.port));
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                input = inbox.recv() => match input {
                    Some(SessionInput::Stop) | None => {
                        self.stop_requested = true;
                        return Ok(Flow::Shutdown);
                    }
                    // stale events from the previous connection
                    _ => {}
                }
            }
        };

        match connected {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.writer = Some(write_half);
                self.spawn_reader(read_half);
                self.change_state(Some(SessionState::Connecting), SessionState::Connected)?;
                debug!("{}: connected", self.user.id);
                self.ask_session().await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                debug!("{}: connection failed: {}", self.user.id, e);
                self.change_state(Some(SessionState::Connecting), SessionState::Disconnected)?;
                if self.stop_requested {
                    Ok(Flow::Shutdown)
                } else {
                    self.schedule(RECONNECT_DELAY, Action::Connect);
                    Ok(Flow::Continue)
                }
            }
        }
    }

    fn spawn_reader(&mut self, read_half: OwnedReadHalf) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let tx = self.inbox_tx.clone();
        let id = self.user.id;

        self.reader_task = Some(tokio::spawn(async move {
            debug!("{}: server reader started", id);
            let mut reader = BufReader::new(read_half);
            loop {
                match codec::read_text(&mut reader).await {
                    Ok(Some(payload)) => {
                        if tx.send(SessionInput::Frame { generation, payload }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => trace!("{}: ignoring empty frame", id),
                    Err(e) => {
                        debug!("{}: read failed: {}", id, e);
                        let _ = tx.send(SessionInput::ConnectionLost { generation });
                        break;
                    }
                }
            }
            debug!("{}: server reader stopped", id);
        }));
    }

    /// Drop the connection and every scripted timer, then either schedule a
    /// reconnect or (when stopping) report that the session is done.
    /// Returns whether the session should keep running.
    fn degrade(&mut self) -> bool {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.generation += 1;
        self.pending.clear();

        if self.state != Some(SessionState::Disconnected) {
            let old = self.state;
            self.state = Some(SessionState::Disconnected);
            self.emit(SessionEvent::StateChanged {
                id: self.user.id,
                old,
                new: SessionState::Disconnected,
            });
        }

        if self.stop_requested {
            false
        } else {
            self.schedule(RECONNECT_DELAY, Action::Connect);
            true
        }
    }

    /// Release everything and report termination. Called exactly once, at
    /// the end of the actor loop.
    fn finish(&mut self) {
        self.pending.clear();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        debug!("{}: client terminated", self.user.id);
        self.emit(SessionEvent::Stopped {
            id: self.user.id,
            last_state: self.state,
        });
    }

    // --- Outbound ---

    async fn write_command(&mut self, command: &ClientCommand) -> Result<(), SessionError> {
        let payload = serde_json::to_string(command)?;
        self.write_raw(&payload).await
    }

    async fn write_raw(&mut self, payload: &str) -> Result<(), SessionError> {
        self.emit(SessionEvent::MessageSent { id: self.user.id });
        trace!("{}: sending: {}", self.user.id, payload);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CodecError::Io(std::io::ErrorKind::NotConnected.into()))?;
        codec::write_text(writer, Some(payload)).await?;
        Ok(())
    }

    // --- Inbound ---

    async fn on_frame(&mut self, raw: &str) -> Result<(), SessionError> {
        trace!("{}: received: {}", self.user.id, raw);

        if raw == protocol::KEEPALIVE_PROBE {
            self.emit(SessionEvent::MessageReceived {
                id: self.user.id,
                command: protocol::KEEPALIVE_PROBE.to_string(),
            });
            return self.write_raw(protocol::KEEPALIVE_REPLY).await;
        }

        let message = match protocol::parse_inbound(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: dropping malformed message: {}", self.user.id, e);
                return Ok(());
            }
        };

        self.emit(SessionEvent::MessageReceived {
            id: self.user.id,
            command: message.command.clone(),
        });

        match message.target {
            // game-scoped messages are accepted but not interpreted
            Target::Game => Ok(()),
            Target::Client => match message.body {
                Some(ServerCommand::Session) => self.log_in().await,
                Some(ServerCommand::Welcome) => self.on_welcome(),
                Some(ServerCommand::GameLaunch) => self.on_game_launch().await,
                Some(
                    ServerCommand::Social
                    | ServerCommand::AuthenticationFailed
                    | ServerCommand::ModInfo
                    | ServerCommand::Notice
                    | ServerCommand::PlayerInfo
                    | ServerCommand::GameInfo,
                ) => Ok(()),
                None => {
                    warn!("{}: no handler for '{}'", self.user.id, message.command);
                    Ok(())
                }
            },
        }
    }

    // --- Protocol steps ---

    async fn ask_session(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::Connected), SessionState::InitiatingSession)?;
        self.write_command(&ClientCommand::ask_session()).await
    }

    async fn log_in(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::InitiatingSession), SessionState::LoggingIn)?;
        let hello = ClientCommand::hello(self.user.username(), self.user.password_hash());
        self.write_command(&hello).await
    }

    fn on_welcome(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::LoggingIn), SessionState::Idle)?;
        let delay = self.think(self.config.idle);
        self.schedule(delay, Action::HostGame);
        Ok(())
    }

    async fn on_game_launch(&mut self) -> Result<(), SessionError> {
        self.emit(SessionEvent::GameCreated { id: self.user.id });
        self.change_state(Some(SessionState::CreatingGame), SessionState::GameLobby)?;
        self.write_command(&ClientCommand::game_state("Idle")).await?;
        let startup = self.think(self.config.game_startup);
        self.schedule(startup, Action::OpenLobby);
        let launch = self.think(self.config.game);
        self.schedule(launch, Action::LaunchGame);
        Ok(())
    }

    async fn perform(&mut self, action: Action) -> Result<(), SessionError> {
        match action {
            Action::Connect => Ok(()),
            Action::HostGame => self.host_game().await,
            Action::OpenLobby => self.open_lobby().await,
            Action::SeatPlayers => self.seat_players().await,
            Action::LaunchGame => self.launch_game().await,
            Action::PlayerDied(player_id) => self.player_died(player_id).await,
            Action::EndGame => self.end_game(),
            Action::CloseGame => self.close_game().await,
        }
    }

    async fn host_game(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::Idle), SessionState::CreatingGame)?;
        let host = ClientCommand::game_host(format!("Test Game {}", self.user.id));
        self.write_command(&host).await
    }

    async fn open_lobby(&mut self) -> Result<(), SessionError> {
        self.write_command(&ClientCommand::game_state("Lobby")).await?;
        for command in [
            ClientCommand::game_option("UnitCap", "1000"),
            ClientCommand::game_option("ShareUnitCap", "none"),
            ClientCommand::game_option("FogOfWar", "explored"),
            ClientCommand::game_option("Victory", "demoralization"),
            ClientCommand::game_option("Timeouts", "3"),
            ClientCommand::game_option("GameSpeed", "normal"),
            ClientCommand::game_option("AllowObservers", 0),
            ClientCommand::game_option("CheatsEnabled", "false"),
            ClientCommand::game_option("CivilianAlliance", "enemy"),
            ClientCommand::game_option("RevealCivilians", "Yes"),
            ClientCommand::game_option("PrebuiltUnits", "Off"),
            ClientCommand::game_option("NoRushOption", "Off"),
            ClientCommand::game_option("RandomMap", "Off"),
            ClientCommand::game_option("Score", "no"),
            ClientCommand::game_option("Share", "ShareUntilDeath"),
            ClientCommand::game_option("TeamLock", "locked"),
            ClientCommand::game_option("BuildMult", "2.0"),
            ClientCommand::game_option("CheatMult", "2.0"),
            ClientCommand::game_option("TMLRandom", "0"),
            ClientCommand::game_option("LandExpansionsAllowed", "5"),
            ClientCommand::game_option("NavalExpansionsAllowed", "4"),
            ClientCommand::game_option("OmniCheat", "on"),
            ClientCommand::game_option(
                "ScenarioFile",
                "/maps/12 The Pass/12 The Pass_scenario.lua",
            ),
            ClientCommand::game_option("Slots", 12),
        ] {
            self.write_command(&command).await?;
        }
        let delay = self.think(self.config.lobby);
        self.schedule(delay, Action::SeatPlayers);
        Ok(())
    }

    async fn seat_players(&mut self) -> Result<(), SessionError> {
        for player_id in 1..=SCRIPTED_PLAYERS {
            self.write_command(&ClientCommand::player_option(player_id, "Faction", 1)).await?;
            self.write_command(&ClientCommand::player_option(player_id, "Color", player_id)).await?;
            self.write_command(&ClientCommand::player_option(player_id, "Team", player_id)).await?;
            self.write_command(&ClientCommand::player_option(player_id, "StartSpot", player_id)).await?;
        }
        for slot_id in 1..=SCRIPTED_PLAYERS {
            self.write_command(&ClientCommand::clear_slot(slot_id)).await?;
        }
        Ok(())
    }

    async fn launch_game(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::GameLobby), SessionState::Playing)?;
        self.write_command(&ClientCommand::game_state("Launching")).await?;

        // deaths are staggered so later participants outlive earlier ones
        let mut last_death = Duration::ZERO;
        for player_id in 1..=SCRIPTED_PLAYERS {
            let offset_ms = u64::from(player_id) * 30_000;
            let death = self.think(DelayBounds::new(offset_ms, offset_ms + 60_000));
            last_death = last_death.max(death);
            self.schedule(death, Action::PlayerDied(player_id));
        }
        self.schedule(last_death + GAME_SETTLE_DELAY, Action::EndGame);
        Ok(())
    }

    async fn player_died(&mut self, player_id: u32) -> Result<(), SessionError> {
        self.write_command(&ClientCommand::game_result(player_id, "score 10")).await?;
        self.write_command(&ClientCommand::game_result(player_id, "victory")).await?;
        self.write_command(&ClientCommand::json_stats(GAME_STATS_JSON)).await
    }

    fn end_game(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::Playing), SessionState::ScoreScreen)?;
        let delay = self.think(self.config.score_screen);
        self.schedule(delay, Action::CloseGame);
        Ok(())
    }

    async fn close_game(&mut self) -> Result<(), SessionError> {
        self.change_state(Some(SessionState::ScoreScreen), SessionState::Idle)?;
        self.write_command(&ClientCommand::game_state("Ended")).await?;
        let delay = self.think(self.config.idle);
        self.schedule(delay, Action::HostGame);
        Ok(())
    }
}
