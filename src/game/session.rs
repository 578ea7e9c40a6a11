//! Session State
//!
//! One client's copy of a game: the game record, both players and the call
//! history. Remote events are folded in through idempotent `apply_remote_*`
//! functions; local writes are adopted through `adopt_*` once the store has
//! returned the committed record.
//!
//! Every fold is a single `&mut self` call, so an event handler can never
//! observe a half-applied update.

use std::collections::BTreeSet;

use serde::{Serialize, Deserialize};

use crate::core::digest::{SessionDigest, StateHasher};
use crate::game::board::{evaluate, LineReport};
use crate::game::state::{Game, GameStatus, Move, MoveId, Player, PlayerId, PlayerNumber};

/// Everything the store knows about one game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Game record
    pub game: Game,
    /// Players ordered by player number
    pub players: Vec<Player>,
    /// Moves ordered by creation
    pub moves: Vec<Move>,
}

/// What a fold did with its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Local state changed.
    Applied,
    /// Input already reflected locally.
    Unchanged,
    /// Input older than the local copy; discarded.
    Stale,
    /// Input belongs to another game.
    Foreign,
}

impl FoldOutcome {
    /// Local state changed.
    #[inline]
    pub fn changed(self) -> bool {
        self == FoldOutcome::Applied
    }

    fn or(self, other: FoldOutcome) -> FoldOutcome {
        if self.changed() || other.changed() {
            FoldOutcome::Applied
        } else {
            self
        }
    }
}

/// Per-client view of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    game: Game,
    players: Vec<Player>,
    moves: Vec<Move>,
}

impl SessionState {
    /// Build from a store snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let SessionSnapshot { game, players, moves } = snapshot;
        let mut state = Self { game, players: Vec::new(), moves: Vec::new() };
        for player in players {
            state.insert_player(player);
        }
        for call in moves {
            state.insert_move(call);
        }
        state.strike_called_numbers();
        state.sync_turn();
        state
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Game record.
    pub fn game(&self) -> &Game {
        &self.game
    }

    /// Players, ordered by player number.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Call history, in creation order.
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Player in a seat.
    pub fn player(&self, number: PlayerNumber) -> Option<&Player> {
        self.players.iter().find(|p| p.player_number == number)
    }

    /// Player by identifier.
    pub fn player_by_id(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Numbers called so far.
    pub fn called_numbers(&self) -> BTreeSet<u8> {
        self.moves.iter().map(|m| m.number_called).collect()
    }

    /// Whether a move id is already known.
    pub fn has_move(&self, id: MoveId) -> bool {
        self.moves.iter().any(|m| m.id == id)
    }

    /// Whether `number` was already called.
    pub fn is_called(&self, number: u8) -> bool {
        self.moves.iter().any(|m| m.number_called == number)
    }

    /// Whose turn it is.
    ///
    /// While playing the turn follows the parity of the call history: player
    /// one calls on an even count. Outside of play the stored field is used.
    pub fn turn(&self) -> PlayerNumber {
        if self.game.status == GameStatus::Playing {
            turn_for_move_count(self.moves.len())
        } else {
            self.game.current_player
        }
    }

    /// Both seats hold a submitted board.
    pub fn both_boards_ready(&self) -> bool {
        self.players.len() == PlayerNumber::ALL.len()
            && self.players.iter().all(|p| p.board_setup_complete)
    }

    /// Line evaluation for one seat. Empty when the seat is vacant.
    pub fn report_for(&self, number: PlayerNumber) -> LineReport {
        match self.player(number) {
            Some(player) => evaluate(&player.board_numbers, &player.marked_numbers, &self.called_numbers()),
            None => LineReport::default(),
        }
    }

    /// Digest of the converged view.
    ///
    /// Covers identity, lifecycle, boards, marks and the call history. Versions,
    /// timestamps and the raw `current_player` field are excluded; the derived
    /// turn is hashed instead.
    pub fn digest(&self) -> SessionDigest {
        let mut h = StateHasher::for_session();
        h.update_str(self.game.id.as_str());
        h.update_str(self.game.status.as_str());
        h.update_u8(self.turn().as_u8());
        h.update_u8(self.game.winner.map_or(0, PlayerNumber::as_u8));
        h.update_bool(self.game.show_opponent);
        h.update_bool(self.game.setup_complete);

        h.update_u32(self.players.len() as u32);
        for p in &self.players {
            h.update_uuid(&p.id.0);
            h.update_u8(p.player_number.as_u8());
            h.update_str(&p.player_name);
            h.update_u8_seq(p.board_numbers.iter());
            h.update_u8_seq(p.marked_numbers.iter());
            h.update_bool(p.board_setup_complete);
        }

        h.update_u32(self.moves.len() as u32);
        for m in &self.moves {
            h.update_uuid(&m.id.0);
            h.update_u8(m.number_called);
            h.update_u8(m.called_by_player.as_u8());
        }
        h.finalize()
    }

    // =========================================================================
    // REMOTE FOLDS
    // =========================================================================

    /// Fold a `game_updated` snapshot.
    ///
    /// Replaced when the status or current player differs, or when the
    /// snapshot is newer. Lower versions and status regressions are stale.
    pub fn apply_remote_game_update(&mut self, incoming: Game) -> FoldOutcome {
        if incoming.id != self.game.id {
            return FoldOutcome::Foreign;
        }
        if incoming.version < self.game.version || !self.game.status.may_become(incoming.status) {
            return FoldOutcome::Stale;
        }
        let differs = incoming.status != self.game.status
            || incoming.current_player != self.game.current_player;
        let newer = incoming.version > self.game.version && incoming != self.game;
        if !differs && !newer {
            return FoldOutcome::Unchanged;
        }
        self.game = incoming;
        self.sync_turn();
        FoldOutcome::Applied
    }

    /// Fold a `number_called` event.
    ///
    /// The move is appended once by id. Player records are replaced only when
    /// some marked set size differs, and never by an older version. The called
    /// number is then struck on every board holding it, so marks stay correct
    /// even when the player payload lagged behind.
    pub fn apply_remote_move(&mut self, call: Move, updated_players: Vec<Player>) -> FoldOutcome {
        if call.game_id != self.game.id {
            return FoldOutcome::Foreign;
        }
        let number = call.number_called;
        let mut outcome = self.insert_move(call);

        let marks_differ = updated_players.iter().any(|incoming| {
            self.player_by_id(incoming.id)
                .map_or(true, |local| local.marked_numbers.len() != incoming.marked_numbers.len())
        });
        if marks_differ {
            for incoming in updated_players {
                outcome = outcome.or(self.merge_player(incoming));
            }
        }

        if self.is_called(number) && self.strike(number) {
            outcome = FoldOutcome::Applied;
        }
        if outcome.changed() {
            self.sync_turn();
        }
        outcome
    }

    /// Fold a `player_joined` event.
    pub fn apply_remote_player_joined(&mut self, player: Player) -> FoldOutcome {
        if player.game_id != self.game.id {
            return FoldOutcome::Foreign;
        }
        if self.player_by_id(player.id).is_some() {
            return FoldOutcome::Unchanged;
        }
        if self.player(player.player_number).is_some() {
            // seat already taken by another record; the store decides
            return FoldOutcome::Stale;
        }
        let outcome = self.insert_player(player);
        self.strike_called_numbers();
        outcome
    }

    /// Fold a `board_setup_complete` event.
    pub fn apply_remote_board_setup_complete(&mut self, player_id: PlayerId) -> FoldOutcome {
        match self.players.iter_mut().find(|p| p.id == player_id) {
            Some(player) if !player.board_setup_complete => {
                player.board_setup_complete = true;
                FoldOutcome::Applied
            }
            Some(_) => FoldOutcome::Unchanged,
            None => FoldOutcome::Foreign,
        }
    }

    /// Fold a `game_finished` event.
    pub fn apply_remote_game_finished(&mut self, winner: Player, game: Game) -> FoldOutcome {
        if game.id != self.game.id {
            return FoldOutcome::Foreign;
        }
        let mut outcome = FoldOutcome::Unchanged;
        if game.version >= self.game.version && self.game.status.may_become(game.status) {
            if game != self.game {
                self.game = game;
                outcome = FoldOutcome::Applied;
            }
        } else {
            outcome = FoldOutcome::Stale;
        }
        if winner.game_id == self.game.id {
            outcome = outcome.or(self.merge_player(winner));
        }
        outcome
    }

    /// Rebase onto a fresh store read.
    ///
    /// Records are taken unless the local copy is newer. Moves are merged by
    /// id and never dropped.
    pub fn replace_from_store(&mut self, snapshot: SessionSnapshot) -> FoldOutcome {
        let SessionSnapshot { game, players, moves } = snapshot;
        if game.id != self.game.id {
            return FoldOutcome::Foreign;
        }

        let mut outcome = FoldOutcome::Unchanged;
        if game.version >= self.game.version && self.game.status.may_become(game.status) && game != self.game {
            self.game = game;
            outcome = FoldOutcome::Applied;
        }
        for player in players {
            outcome = outcome.or(self.merge_player(player));
        }
        for call in moves {
            outcome = outcome.or(self.insert_move(call));
        }
        if self.strike_called_numbers() {
            outcome = FoldOutcome::Applied;
        }
        self.sync_turn();
        outcome
    }

    // =========================================================================
    // LOCAL ADOPTION
    // =========================================================================

    /// Adopt a game record this client just wrote.
    pub fn adopt_game(&mut self, game: Game) -> FoldOutcome {
        if game.id != self.game.id {
            return FoldOutcome::Foreign;
        }
        if game.version < self.game.version {
            return FoldOutcome::Stale;
        }
        self.game = game;
        self.sync_turn();
        FoldOutcome::Applied
    }

    /// Adopt a player record this client just wrote.
    pub fn adopt_player(&mut self, player: Player) -> FoldOutcome {
        if player.game_id != self.game.id {
            return FoldOutcome::Foreign;
        }
        self.merge_player(player)
    }

    /// Record a call this client just committed.
    pub fn commit_call(&mut self, call: Move, updated_players: Vec<Player>) -> FoldOutcome {
        if call.game_id != self.game.id {
            return FoldOutcome::Foreign;
        }
        let number = call.number_called;
        let mut outcome = self.insert_move(call);
        for player in updated_players {
            outcome = outcome.or(self.merge_player(player));
        }
        if self.strike(number) {
            outcome = FoldOutcome::Applied;
        }
        self.sync_turn();
        outcome
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn insert_player(&mut self, player: Player) -> FoldOutcome {
        if self.player_by_id(player.id).is_some() {
            return FoldOutcome::Unchanged;
        }
        self.players.push(player);
        self.players.sort_by_key(|p| p.player_number);
        FoldOutcome::Applied
    }

    /// Replace by id unless older, insert when unknown.
    fn merge_player(&mut self, incoming: Player) -> FoldOutcome {
        let Some(idx) = self.players.iter().position(|p| p.id == incoming.id) else {
            if self.player(incoming.player_number).is_some() {
                return FoldOutcome::Stale;
            }
            return self.insert_player(incoming);
        };

        let local = &mut self.players[idx];
        if incoming.version < local.version {
            return FoldOutcome::Stale;
        }
        if *local == incoming {
            return FoldOutcome::Unchanged;
        }
        // a flag or a mark once seen is never lost to a lagging record
        let keep_setup = local.board_setup_complete;
        let mut marks = std::mem::take(&mut local.marked_numbers);
        *local = incoming;
        local.board_setup_complete |= keep_setup;
        marks.retain(|n| local.board_numbers.contains(n));
        local.marked_numbers.append(&mut marks);
        FoldOutcome::Applied
    }

    fn insert_move(&mut self, call: Move) -> FoldOutcome {
        if self.moves.iter().any(|m| m.id == call.id) {
            return FoldOutcome::Unchanged;
        }
        if self.is_called(call.number_called) {
            // a number is called at most once; keep the first record
            return FoldOutcome::Stale;
        }
        let key = call.order_key();
        let at = self.moves.partition_point(|m| m.order_key() <= key);
        self.moves.insert(at, call);
        FoldOutcome::Applied
    }

    /// Strike `number` on every board holding it. True if any mark was added.
    fn strike(&mut self, number: u8) -> bool {
        let mut struck = false;
        for player in &mut self.players {
            if player.has_number(number) {
                struck |= player.marked_numbers.insert(number);
            }
        }
        struck
    }

    fn strike_called_numbers(&mut self) -> bool {
        let called = self.called_numbers();
        called.into_iter().fold(false, |acc, n| self.strike(n) | acc)
    }

    /// Keep the stored turn field in line with the derived turn.
    fn sync_turn(&mut self) {
        if self.game.status == GameStatus::Playing {
            self.game.current_player = turn_for_move_count(self.moves.len());
        }
    }
}

/// Turn after `count` calls.
#[inline]
pub fn turn_for_move_count(count: usize) -> PlayerNumber {
    if count % 2 == 0 {
        PlayerNumber::One
    } else {
        PlayerNumber::Two
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::GameId;
    use chrono::{Duration, Utc};

    fn board() -> Vec<u8> {
        (1..=25).collect()
    }

    fn reversed() -> Vec<u8> {
        (1..=25).rev().collect()
    }

    fn playing_state() -> SessionState {
        let id = GameId::new("ABCD1234");
        let mut game = Game::new(id.clone(), false);
        game.status = GameStatus::Playing;
        game.setup_complete = true;
        game.version = 3;

        let mut p1 = Player::new(id.clone(), PlayerNumber::One, "Ann");
        p1.board_numbers = board();
        p1.board_setup_complete = true;
        p1.version = 2;
        let mut p2 = Player::new(id, PlayerNumber::Two, "Bo");
        p2.board_numbers = reversed();
        p2.board_setup_complete = true;
        p2.version = 2;

        SessionState::from_snapshot(SessionSnapshot { game, players: vec![p2, p1], moves: vec![] })
    }

    fn call(state: &SessionState, number: u8, by: PlayerNumber, seq: u64) -> Move {
        Move {
            id: MoveId::generate(),
            game_id: state.game().id.clone(),
            number_called: number,
            called_by_player: by,
            created_at: Utc::now(),
            sequence: seq,
        }
    }

    fn marked(state: &SessionState, number: u8) -> Vec<Player> {
        state
            .players()
            .iter()
            .cloned()
            .map(|mut p| {
                p.marked_numbers.insert(number);
                p.version += 1;
                p
            })
            .collect()
    }

    #[test]
    fn test_players_sorted_on_load() {
        let state = playing_state();
        let seats: Vec<_> = state.players().iter().map(|p| p.player_number).collect();
        assert_eq!(seats, vec![PlayerNumber::One, PlayerNumber::Two]);
    }

    #[test]
    fn test_duplicate_move_is_idempotent() {
        let mut state = playing_state();
        let m = call(&state, 7, PlayerNumber::One, 1);
        let players = marked(&state, 7);

        assert_eq!(state.apply_remote_move(m.clone(), players.clone()), FoldOutcome::Applied);
        assert_eq!(state.moves().len(), 1);
        assert_eq!(state.apply_remote_move(m, players), FoldOutcome::Unchanged);
        assert_eq!(state.moves().len(), 1);
        assert_eq!(state.turn(), PlayerNumber::Two);
    }

    #[test]
    fn test_stale_player_payload_still_strikes() {
        let mut state = playing_state();
        let m = call(&state, 9, PlayerNumber::One, 1);
        // payload carries the pre-call records
        let stale: Vec<Player> = state.players().to_vec();
        state.apply_remote_move(m, stale);
        for p in state.players() {
            assert!(p.marked_numbers.contains(&9));
        }
    }

    #[test]
    fn test_moves_ordered_by_creation() {
        let mut state = playing_state();
        let now = Utc::now();
        let mut late = call(&state, 3, PlayerNumber::Two, 2);
        late.created_at = now + Duration::seconds(1);
        let mut early = call(&state, 8, PlayerNumber::One, 1);
        early.created_at = now;

        state.apply_remote_move(late, vec![]);
        state.apply_remote_move(early, vec![]);
        let order: Vec<u8> = state.moves().iter().map(|m| m.number_called).collect();
        assert_eq!(order, vec![8, 3]);
    }

    #[test]
    fn test_same_number_different_id_is_stale() {
        let mut state = playing_state();
        let first = call(&state, 4, PlayerNumber::One, 1);
        let second = call(&state, 4, PlayerNumber::Two, 2);
        state.apply_remote_move(first, vec![]);
        assert_eq!(state.apply_remote_move(second, vec![]), FoldOutcome::Stale);
        assert_eq!(state.moves().len(), 1);
    }

    #[test]
    fn test_game_update_rules() {
        let mut state = playing_state();
        let mut same = state.game().clone();
        assert_eq!(state.apply_remote_game_update(same.clone()), FoldOutcome::Unchanged);

        same.version = 1;
        same.status = GameStatus::Finished;
        assert_eq!(state.apply_remote_game_update(same), FoldOutcome::Stale);

        let mut regress = state.game().clone();
        regress.version = 10;
        regress.status = GameStatus::Setup;
        assert_eq!(state.apply_remote_game_update(regress), FoldOutcome::Stale);
        assert_eq!(state.game().status, GameStatus::Playing);

        let mut finished = state.game().clone();
        finished.version = 4;
        finished.status = GameStatus::Finished;
        finished.winner = Some(PlayerNumber::One);
        assert_eq!(state.apply_remote_game_update(finished), FoldOutcome::Applied);
        assert!(state.game().is_finished());
    }

    #[test]
    fn test_out_of_order_turn_update() {
        let mut state = playing_state();
        // the turn flip arrives before the call that implies it
        let mut flipped = state.game().clone();
        flipped.current_player = PlayerNumber::Two;
        flipped.version += 1;
        state.apply_remote_game_update(flipped);
        assert_eq!(state.turn(), PlayerNumber::One);

        let m = call(&state, 12, PlayerNumber::One, 1);
        let players = marked(&state, 12);
        state.apply_remote_move(m, players);
        assert_eq!(state.turn(), PlayerNumber::Two);
        assert_eq!(state.game().current_player, PlayerNumber::Two);
    }

    #[test]
    fn test_player_joined_idempotent_and_sorted() {
        let id = GameId::new("ABCD1234");
        let game = Game::new(id.clone(), true);
        let host = Player::new(id.clone(), PlayerNumber::One, "Ann");
        let mut state = SessionState::from_snapshot(SessionSnapshot {
            game,
            players: vec![host],
            moves: vec![],
        });
        let guest = Player::new(id.clone(), PlayerNumber::Two, "Bo");
        assert_eq!(state.apply_remote_player_joined(guest.clone()), FoldOutcome::Applied);
        assert_eq!(state.apply_remote_player_joined(guest), FoldOutcome::Unchanged);
        assert_eq!(state.players().len(), 2);
        assert_eq!(state.players()[1].player_number, PlayerNumber::Two);

        let intruder = Player::new(id, PlayerNumber::Two, "Cy");
        assert_eq!(state.apply_remote_player_joined(intruder), FoldOutcome::Stale);

        let foreign = Player::new(GameId::new("ZZZZ9999"), PlayerNumber::Two, "Di");
        assert_eq!(state.apply_remote_player_joined(foreign), FoldOutcome::Foreign);
    }

    #[test]
    fn test_board_setup_complete_flag() {
        let id = GameId::new("ABCD1234");
        let p = Player::new(id.clone(), PlayerNumber::One, "Ann");
        let pid = p.id;
        let mut state = SessionState::from_snapshot(SessionSnapshot {
            game: Game::new(id, false),
            players: vec![p],
            moves: vec![],
        });
        assert_eq!(state.apply_remote_board_setup_complete(pid), FoldOutcome::Applied);
        assert_eq!(state.apply_remote_board_setup_complete(pid), FoldOutcome::Unchanged);
        assert_eq!(state.apply_remote_board_setup_complete(PlayerId::generate()), FoldOutcome::Foreign);
        assert!(!state.both_boards_ready());
    }

    #[test]
    fn test_replace_from_store_merges_moves() {
        let mut local = playing_state();
        let m1 = call(&local, 1, PlayerNumber::One, 1);
        local.apply_remote_move(m1.clone(), vec![]);

        let mut game = local.game().clone();
        game.version += 2;
        let m2 = call(&local, 2, PlayerNumber::Two, 2);
        let snapshot = SessionSnapshot {
            game,
            players: local.players().to_vec(),
            moves: vec![m2.clone()],
        };
        assert_eq!(local.replace_from_store(snapshot), FoldOutcome::Applied);
        assert!(local.has_move(m1.id));
        assert!(local.has_move(m2.id));
        assert_eq!(local.turn(), PlayerNumber::One);
        assert!(local.players().iter().all(|p| p.marked_numbers.contains(&2)));
    }

    #[test]
    fn test_report_and_digest() {
        let mut a = playing_state();
        let mut b = a.clone();
        for (i, n) in (1..=5u8).enumerate() {
            let by = turn_for_move_count(i);
            let m = call(&a, n, by, i as u64 + 1);
            let players = marked(&a, n);
            a.apply_remote_move(m.clone(), players.clone());
            b.apply_remote_move(m, players);
        }
        assert_eq!(a.report_for(PlayerNumber::One).completed_line_count, 1);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), playing_state().digest());
    }
}
