//! Synchronization Engine
//!
//! Keeps one client's `SessionState` consistent with the shared store and the
//! broadcast channel.
//!
//! - The store is read once at connect; broadcast events drive steady state.
//! - Local actions write the store first, adopt the committed records, then
//!   broadcast them. A failed broadcast is logged and never fails the action.
//! - Reconciliation re-reads the store on a timer and rebases, closing the gap
//!   left by a lost broadcast.
//!
//! The `run` loop owns the engine; each event or command is handled to
//! completion before the next one is polled.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::core::digest::{short_hex, SessionDigest};
use crate::game::board::LineReport;
use crate::game::events::{BroadcastEvent, EventKind};
use crate::game::session::{FoldOutcome, SessionState};
use crate::game::state::{GameId, GameStatus, PlayerNumber};
use crate::game::turn::{
    check_board_submission, needs_auto_heal, plan_call, should_start, unrecorded_win, CallOutcome, CallPlan,
    TurnError,
};
use crate::network::broadcast::{BroadcastError, Broadcaster, Subscription};
use crate::network::identity::SeatIdentity;
use crate::store::{GamePatch, GameStore, NewMove, PlayerPatch, StoreError};

/// Default reconciliation period.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Store re-read period; `None` disables reconciliation
    pub reconcile_interval: Option<Duration>,
    /// Capacity of the command channel created by `spawn`
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Some(DEFAULT_RECONCILE_INTERVAL),
            command_buffer: 32,
        }
    }
}

impl SyncConfig {
    /// Create config from environment. `BINGO_RECONCILE_SECS=0` disables
    /// reconciliation.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconcile_interval = match std::env::var("BINGO_RECONCILE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.reconcile_interval,
        };
        Self { reconcile_interval, ..defaults }
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store read or write failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Action rejected by the turn rules.
    #[error("rejected: {0}")]
    Turn(#[from] TurnError),

    /// Subscribing to the session topic failed.
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    /// No player record matches the seat.
    #[error("no player {player_number} named {player_name:?} in game {game_id}")]
    SeatNotFound {
        /// Game
        game_id: GameId,
        /// Seat looked for
        player_number: PlayerNumber,
        /// Name looked for
        player_name: String,
    },

    /// The engine task is gone.
    #[error("sync engine stopped")]
    Stopped,
}

/// One client's synchronization engine.
pub struct SyncEngine {
    seat: SeatIdentity,
    state: SessionState,
    store: Arc<dyn GameStore>,
    broadcaster: Arc<dyn Broadcaster>,
    subscription: Subscription,
    topic: String,
    config: SyncConfig,
}

impl SyncEngine {
    /// Subscribe, load the session and resolve the seat.
    ///
    /// The subscription is opened before the store read so no event published
    /// in between is lost; events already queued are folded before returning.
    /// The seat is matched by number and name, and its player id is taken from
    /// the store.
    #[instrument(skip_all, fields(game_id = %seat.game_id, seat = %seat.player_number))]
    pub async fn connect(
        mut seat: SeatIdentity,
        store: Arc<dyn GameStore>,
        broadcaster: Arc<dyn Broadcaster>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let topic = seat.game_id.topic();
        let subscription = broadcaster.subscribe(&topic).await?;
        let snapshot = store.load_session(&seat.game_id).await?;

        let player = snapshot
            .players
            .iter()
            .find(|p| seat.matches(p))
            .ok_or_else(|| SyncError::SeatNotFound {
                game_id: seat.game_id.clone(),
                player_number: seat.player_number,
                player_name: seat.player_name.clone(),
            })?;
        if seat.player_id != player.id {
            debug!(player_id = %player.id, "Resolved seat from store");
            seat.player_id = player.id;
        }

        let mut engine = Self {
            seat,
            state: SessionState::from_snapshot(snapshot),
            store,
            broadcaster,
            subscription,
            topic,
            config,
        };
        engine.auto_heal().await;
        engine.pump_pending();

        info!(
            status = %engine.state.game().status,
            players = engine.state.players().len(),
            moves = engine.state.moves().len(),
            "Session loaded"
        );
        Ok(engine)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current local view.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// This client's seat.
    pub fn seat(&self) -> &SeatIdentity {
        &self.seat
    }

    /// Broadcast topic of the session.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether this seat may call now.
    pub fn is_my_turn(&self) -> bool {
        self.state.game().status == GameStatus::Playing && self.state.turn() == self.seat.player_number
    }

    /// Line evaluation of this seat's board.
    pub fn report(&self) -> LineReport {
        self.state.report_for(self.seat.player_number)
    }

    /// Digest of the local view.
    pub fn digest(&self) -> SessionDigest {
        self.state.digest()
    }

    // =========================================================================
    // REMOTE EVENTS
    // =========================================================================

    /// Fold one broadcast event into the local view.
    pub fn handle_event(&mut self, event: BroadcastEvent) -> FoldOutcome {
        let kind = event.kind();
        let outcome = match event {
            BroadcastEvent::PlayerJoined { player } => self.state.apply_remote_player_joined(player),
            BroadcastEvent::GameUpdated { game } => self.state.apply_remote_game_update(game),
            BroadcastEvent::BoardSetupComplete { player_id, .. } => {
                self.state.apply_remote_board_setup_complete(player_id)
            }
            BroadcastEvent::NumberCalled { call, updated_players } => {
                self.state.apply_remote_move(call, updated_players)
            }
            BroadcastEvent::GameFinished { winner, game } => self.state.apply_remote_game_finished(winner, game),
        };

        match outcome {
            FoldOutcome::Applied => debug!(
                kind = kind.as_str(),
                status = %self.state.game().status,
                turn = %self.state.turn(),
                "Folded event"
            ),
            FoldOutcome::Unchanged => debug!(kind = kind.as_str(), "Event already reflected"),
            FoldOutcome::Stale => debug!(kind = kind.as_str(), "Discarded stale event"),
            FoldOutcome::Foreign => warn!(kind = kind.as_str(), "Event for another game ignored"),
        }
        if kind == EventKind::GameFinished && outcome.changed() {
            info!(winner = ?self.state.game().winner, "Game finished");
        }
        outcome
    }

    /// Fold every event already queued on the subscription.
    pub fn pump_pending(&mut self) -> usize {
        let mut folded = 0;
        while let Some(event) = self.subscription.try_recv() {
            self.handle_event(event);
            folded += 1;
        }
        folded
    }

    // =========================================================================
    // LOCAL ACTIONS
    // =========================================================================

    /// Tell the other seat this client joined.
    ///
    /// The lobby cannot publish on a topic it never subscribed to, so the
    /// joiner announces itself once connected.
    pub async fn announce_join(&mut self) {
        let Some(player) = self.state.player(self.seat.player_number).cloned() else {
            return;
        };
        let game = self.state.game().clone();
        self.publish(BroadcastEvent::PlayerJoined { player }).await;
        self.publish(BroadcastEvent::GameUpdated { game }).await;
    }

    /// Submit this seat's board, then start the game if both boards are in.
    #[instrument(skip_all, fields(game_id = %self.seat.game_id, seat = %self.seat.player_number))]
    pub async fn submit_board(&mut self, board: &[u8]) -> Result<(), SyncError> {
        let board = check_board_submission(&self.state, self.seat.player_number, board)?;
        let player = self
            .store
            .update_player(self.seat.player_id, PlayerPatch::board(board))
            .await?;
        self.state.adopt_player(player);
        info!("Board submitted");

        self.publish(BroadcastEvent::BoardSetupComplete {
            player_id: self.seat.player_id,
            player_number: self.seat.player_number,
        })
        .await;

        // the other seat's flag may not have reached us yet; ask the store.
        // The board is already written, so a failure here is left to reconcile.
        if let Err(e) = self.catch_up_and_start().await {
            warn!("Board saved but start check failed: {}", e);
        }
        Ok(())
    }

    async fn catch_up_and_start(&mut self) -> Result<(), SyncError> {
        let players = self.store.list_players(&self.seat.game_id).await?;
        let game = self.store.get_game(&self.seat.game_id).await?;
        for player in players {
            self.state.adopt_player(player);
        }
        self.state.apply_remote_game_update(game);
        self.start_if_ready().await
    }

    /// Call a number on this seat's turn.
    ///
    /// The move is written before the marks; the store's one-call-per-number
    /// constraint turns a racing double call into `AlreadyCalled`.
    #[instrument(skip(self), fields(game_id = %self.seat.game_id, seat = %self.seat.player_number))]
    pub async fn call_number(&mut self, number: u8) -> Result<CallOutcome, SyncError> {
        // `board_setup_complete` carries no layout; marks need every board
        if self.state.players().iter().any(|p| p.board_setup_complete && !p.has_full_board()) {
            debug!("Board layout missing locally, re-reading");
            self.rebase().await?;
        }
        self.finish_if_won().await?;
        let plan = plan_call(&self.state, self.seat.player_number, number)?;

        let call = match self
            .store
            .insert_move(NewMove {
                game_id: self.seat.game_id.clone(),
                number_called: number,
                called_by_player: plan.caller,
            })
            .await
        {
            Ok(call) => call,
            Err(StoreError::Conflict(reason)) => {
                warn!("Call lost to a concurrent write: {}", reason);
                self.rebase().await?;
                return Err(TurnError::AlreadyCalled(number).into());
            }
            Err(e) => return Err(e.into()),
        };

        // the call is durable from here on; the turn passes even if a later write fails
        self.state.commit_call(call.clone(), Vec::new());
        let persisted = self.persist_call(&plan).await;
        if let Err(e) = &persisted {
            warn!(number, "Call recorded but follow-up write failed: {}", e);
        }

        let updated_players = self.state.players().to_vec();
        self.publish(BroadcastEvent::NumberCalled { call, updated_players }).await;
        persisted.map(|()| plan.outcome)
    }

    /// Marks, then the game row, for a call already in the store.
    async fn persist_call(&mut self, plan: &CallPlan) -> Result<(), SyncError> {
        for player in &plan.marked_players {
            let updated = self
                .store
                .update_player(player.id, PlayerPatch::marks(player.marked_numbers.clone()))
                .await?;
            self.state.adopt_player(updated);
        }

        match &plan.outcome {
            CallOutcome::Win { winner, report } => {
                let game = self
                    .store
                    .update_game(
                        &self.seat.game_id,
                        GamePatch::status(GameStatus::Finished).with_winner(*winner),
                    )
                    .await?;
                self.state.adopt_game(game.clone());
                info!(winner = %winner, lines = report.completed_line_count, "Bingo");
                if let Some(winner) = self.state.player(*winner).cloned() {
                    self.publish(BroadcastEvent::GameFinished { winner, game }).await;
                }
            }
            CallOutcome::NextTurn { next, report } => {
                let patch = GamePatch { current_player: Some(*next), ..GamePatch::default() };
                let game = self.store.update_game(&self.seat.game_id, patch).await?;
                self.state.adopt_game(game.clone());
                debug!(next = %next, lines = report.completed_line_count, "Turn passed");
                self.publish(BroadcastEvent::GameUpdated { game }).await;
            }
        }
        Ok(())
    }

    /// Re-read the store and rebase, then start the game if both boards are in.
    #[instrument(skip(self), fields(game_id = %self.seat.game_id))]
    pub async fn reconcile(&mut self) -> Result<FoldOutcome, SyncError> {
        let outcome = self.rebase().await?;
        self.start_if_ready().await?;
        self.finish_if_won().await?;
        Ok(outcome)
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    /// Drive the engine until `Shutdown` or until every command sender is
    /// dropped. Returns the final view.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ClientCommand>) -> SessionState {
        let mut ticker = self.config.reconcile_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut subscribed = true;

        loop {
            tokio::select! {
                event = self.subscription.recv(), if subscribed => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        warn!(topic = %self.topic, "Broadcast subscription closed");
                        subscribed = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.reconcile().await {
                        warn!("Reconciliation failed: {}", e);
                    }
                }
            }
        }

        debug!(digest = %short_hex(&self.state.digest()), "Sync engine stopped");
        self.state
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<SessionState>) {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let handle = SessionHandle { commands: tx, seat: self.seat.clone() };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::SubmitBoard { board, reply } => {
                let _ = reply.send(self.submit_board(&board).await);
            }
            ClientCommand::CallNumber { number, reply } => {
                let _ = reply.send(self.call_number(number).await);
            }
            ClientCommand::Reconcile { reply } => {
                let _ = reply.send(self.reconcile().await);
            }
            ClientCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            ClientCommand::AnnounceJoin { reply } => {
                self.announce_join().await;
                let _ = reply.send(());
            }
            ClientCommand::Shutdown => {}
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// On load: a join whose status write was lost leaves the game waiting
    /// with two players. Advance it to setup. Failures are logged only.
    async fn auto_heal(&mut self) {
        if !needs_auto_heal(self.state.game(), self.state.players()) {
            return;
        }
        let patch = GamePatch::status(GameStatus::Setup).expect_version(self.state.game().version);
        match self.store.update_game(&self.seat.game_id, patch).await {
            Ok(game) => {
                info!("Auto-healed waiting game to setup");
                self.state.adopt_game(game.clone());
                self.publish(BroadcastEvent::GameUpdated { game }).await;
            }
            Err(e) => warn!("Auto-heal failed: {}", e),
        }
    }

    /// `setup -> playing` once both flags are set. Losing the race to the
    /// other seat is fine; the winner's record is read back instead.
    async fn start_if_ready(&mut self) -> Result<(), SyncError> {
        if !should_start(self.state.game(), self.state.players()) {
            return Ok(());
        }
        let patch = GamePatch::status(GameStatus::Playing)
            .with_setup_complete(true)
            .with_current_player(PlayerNumber::One)
            .expect_version(self.state.game().version);

        match self.store.update_game(&self.seat.game_id, patch).await {
            Ok(game) => {
                info!("Both boards ready, game started");
                self.state.adopt_game(game.clone());
                self.publish(BroadcastEvent::GameUpdated { game }).await;
            }
            Err(StoreError::VersionConflict { .. }) => {
                debug!("Game changed concurrently, re-reading");
                self.rebase().await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Record a win whose finishing write was lost. Either seat may do it.
    async fn finish_if_won(&mut self) -> Result<(), SyncError> {
        let Some((winner, report)) = unrecorded_win(&self.state) else {
            return Ok(());
        };
        let patch = GamePatch::status(GameStatus::Finished)
            .with_winner(winner)
            .expect_version(self.state.game().version);

        match self.store.update_game(&self.seat.game_id, patch).await {
            Ok(game) => {
                info!(winner = %winner, lines = report.completed_line_count, "Recorded missed win");
                self.state.adopt_game(game.clone());
                if let Some(winner) = self.state.player(winner).cloned() {
                    self.publish(BroadcastEvent::GameFinished { winner, game }).await;
                }
            }
            Err(StoreError::VersionConflict { .. }) => {
                debug!("Game changed concurrently, re-reading");
                self.rebase().await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn rebase(&mut self) -> Result<FoldOutcome, SyncError> {
        let snapshot = self.store.load_session(&self.seat.game_id).await?;
        let outcome = self.state.replace_from_store(snapshot);
        if outcome.changed() {
            info!(digest = %short_hex(&self.state.digest()), "Rebased on store");
        }
        Ok(outcome)
    }

    async fn publish(&self, event: BroadcastEvent) {
        let kind = event.kind();
        if let Err(e) = self.broadcaster.publish(&self.topic, event).await {
            warn!(kind = kind.as_str(), "Broadcast failed: {}", e);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// COMMAND HANDLE
// =============================================================================

/// Requests to a running engine.
#[derive(Debug)]
pub enum ClientCommand {
    /// Submit this seat's board.
    SubmitBoard {
        /// Row-major layout
        board: Vec<u8>,
        /// Result
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    /// Call a number.
    CallNumber {
        /// Number to call
        number: u8,
        /// Result
        reply: oneshot::Sender<Result<CallOutcome, SyncError>>,
    },
    /// Re-read the store now.
    Reconcile {
        /// Result
        reply: oneshot::Sender<Result<FoldOutcome, SyncError>>,
    },
    /// Copy of the local view.
    Snapshot {
        /// Result
        reply: oneshot::Sender<SessionState>,
    },
    /// Publish the join announcement.
    AnnounceJoin {
        /// Done
        reply: oneshot::Sender<()>,
    },
    /// Stop the loop.
    Shutdown,
}

/// Cloneable handle to a spawned engine.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<ClientCommand>,
    seat: SeatIdentity,
}

impl SessionHandle {
    /// Seat the engine plays.
    pub fn seat(&self) -> &SeatIdentity {
        &self.seat
    }

    async fn request<T>(&self, command: ClientCommand, rx: oneshot::Receiver<T>) -> Result<T, SyncError> {
        self.commands.send(command).await.map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Submit a board.
    pub async fn submit_board(&self, board: Vec<u8>) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::SubmitBoard { board, reply }, rx).await?
    }

    /// Call a number.
    pub async fn call_number(&self, number: u8) -> Result<CallOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::CallNumber { number, reply }, rx).await?
    }

    /// Force a reconciliation.
    pub async fn reconcile(&self) -> Result<FoldOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Reconcile { reply }, rx).await?
    }

    /// Copy of the engine's view.
    pub async fn snapshot(&self) -> Result<SessionState, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Snapshot { reply }, rx).await
    }

    /// Announce this seat to the other client.
    pub async fn announce_join(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::AnnounceJoin { reply }, rx).await
    }

    /// Ask the loop to stop.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.commands
            .send(ClientCommand::Shutdown)
            .await
            .map_err(|_| SyncError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Player;
    use crate::network::broadcast::LocalHub;
    use crate::store::MemoryStore;
    use crate::sync::lobby::Lobby;

    fn no_reconcile() -> SyncConfig {
        SyncConfig { reconcile_interval: None, ..SyncConfig::default() }
    }

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.reconcile_interval, Some(DEFAULT_RECONCILE_INTERVAL));
        assert!(config.command_buffer > 0);
    }

    #[tokio::test]
    async fn test_connect_resolves_seat_by_number_and_name() {
        let store = Arc::new(MemoryStore::new());
        let hub = LocalHub::new();
        let grant = Lobby::new(store.clone()).create_game("Ann", false).await.unwrap();

        let mut seat = grant.seat.clone();
        seat.player_id = crate::game::state::PlayerId(uuid::Uuid::nil());
        let engine = SyncEngine::connect(seat, store.clone(), Arc::new(hub.client()), no_reconcile())
            .await
            .unwrap();
        assert_eq!(engine.seat().player_id, grant.player.id);
        assert!(!engine.is_my_turn());

        let mut wrong = grant.seat.clone();
        wrong.player_name = "Someone".into();
        let err = SyncEngine::connect(wrong, store, Arc::new(hub.client()), no_reconcile()).await;
        assert!(matches!(err, Err(SyncError::SeatNotFound { .. })));
    }

    #[tokio::test]
    async fn test_foreign_event_ignored() {
        let store = Arc::new(MemoryStore::new());
        let hub = LocalHub::new();
        let grant = Lobby::new(store.clone()).create_game("Ann", false).await.unwrap();
        let mut engine = SyncEngine::connect(grant.seat, store, Arc::new(hub.client()), no_reconcile())
            .await
            .unwrap();

        let stranger = Player::new(GameId::new("OTHERGAME"), PlayerNumber::Two, "Cy");
        let before = engine.digest();
        assert_eq!(
            engine.handle_event(BroadcastEvent::PlayerJoined { player: stranger }),
            FoldOutcome::Foreign
        );
        assert_eq!(engine.digest(), before);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped() {
        let store = Arc::new(MemoryStore::new());
        let hub = LocalHub::new();
        let grant = Lobby::new(store.clone()).create_game("Ann", false).await.unwrap();
        let engine = SyncEngine::connect(grant.seat, store, Arc::new(hub.client()), no_reconcile())
            .await
            .unwrap();
        let (handle, task) = engine.spawn();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.game().status, GameStatus::Waiting);
        handle.shutdown().await.unwrap();
        let final_state = task.await.unwrap();
        assert_eq!(final_state, snapshot);
        assert!(matches!(handle.call_number(3).await, Err(SyncError::Stopped)));
    }
}
