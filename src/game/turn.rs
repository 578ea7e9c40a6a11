//! Turn Controller
//!
//! Validates actions against a session view and plans their effects. Nothing
//! here touches the store; the sync engine persists a plan and folds the
//! committed records back in.
//!
//! Lifecycle: `waiting -> setup -> playing -> finished`. `finished` is terminal.

use thiserror::Error;

use crate::game::board::{evaluate, validate_board, BoardError, LineReport};
use crate::game::session::SessionState;
use crate::game::state::{Game, GameStatus, Player, PlayerNumber};
use crate::MAX_NUMBER;

/// Rejected actions. A rejection never mutates anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    /// Calls are only accepted while playing.
    #[error("game is {status}, not playing")]
    GameNotPlaying {
        /// Current status
        status: GameStatus,
    },

    /// The game already has a winner.
    #[error("game finished, player {winner:?} won")]
    GameFinished {
        /// Winner, if known locally
        winner: Option<PlayerNumber>,
    },

    /// Caller does not hold the turn.
    #[error("not player {caller}'s turn, player {current} to call")]
    NotYourTurn {
        /// Who tried to call
        caller: PlayerNumber,
        /// Who holds the turn
        current: PlayerNumber,
    },

    /// Number was called before.
    #[error("number {0} already called")]
    AlreadyCalled(u8),

    /// Number outside 1..=25.
    #[error("number {0} out of range 1..={MAX_NUMBER}")]
    NumberOutOfRange(u8),

    /// Seat has no player record.
    #[error("no player in seat {0}")]
    UnknownPlayer(PlayerNumber),

    /// Boards can no longer be submitted.
    #[error("board setup closed, game is {status}")]
    SetupClosed {
        /// Current status
        status: GameStatus,
    },

    /// Seat already submitted a board.
    #[error("player {0} already submitted a board")]
    AlreadySubmitted(PlayerNumber),

    /// Board failed validation.
    #[error(transparent)]
    Board(#[from] BoardError),
}

/// Result of a call: win XOR turn switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// Caller reached the winning line count.
    Win {
        /// Winning seat
        winner: PlayerNumber,
        /// Caller's evaluation
        report: LineReport,
    },
    /// Turn passes to the other seat.
    NextTurn {
        /// Seat to call next
        next: PlayerNumber,
        /// Caller's evaluation
        report: LineReport,
    },
}

impl CallOutcome {
    /// Whether the call ended the game.
    pub fn is_win(&self) -> bool {
        matches!(self, CallOutcome::Win { .. })
    }
}

/// A validated call, ready to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallPlan {
    /// Number being called
    pub number: u8,
    /// Calling seat
    pub caller: PlayerNumber,
    /// Players whose marks change; each already holds the new mark
    pub marked_players: Vec<Player>,
    /// Win or next turn
    pub outcome: CallOutcome,
}

/// Validate a call and plan its effects.
///
/// Only the caller's board is evaluated; the opponent may also have reached
/// five lines without it being declared on this call.
pub fn plan_call(state: &SessionState, caller: PlayerNumber, number: u8) -> Result<CallPlan, TurnError> {
    if !(1..=MAX_NUMBER).contains(&number) {
        return Err(TurnError::NumberOutOfRange(number));
    }
    let game = state.game();
    if game.is_finished() {
        return Err(TurnError::GameFinished { winner: game.winner });
    }
    if game.status != GameStatus::Playing {
        return Err(TurnError::GameNotPlaying { status: game.status });
    }
    let current = state.turn();
    if current != caller {
        return Err(TurnError::NotYourTurn { caller, current });
    }
    if state.is_called(number) {
        return Err(TurnError::AlreadyCalled(number));
    }
    let caller_record = state.player(caller).ok_or(TurnError::UnknownPlayer(caller))?;

    let marked_players: Vec<Player> = state
        .players()
        .iter()
        .filter(|p| p.has_number(number) && !p.marked_numbers.contains(&number))
        .cloned()
        .map(|mut p| {
            p.marked_numbers.insert(number);
            p
        })
        .collect();

    let caller_marks = marked_players
        .iter()
        .find(|p| p.player_number == caller)
        .map_or(&caller_record.marked_numbers, |p| &p.marked_numbers);
    let mut called = state.called_numbers();
    called.insert(number);
    let report = evaluate(&caller_record.board_numbers, caller_marks, &called);

    let outcome = if report.is_win() {
        CallOutcome::Win { winner: caller, report }
    } else {
        CallOutcome::NextTurn { next: caller.other(), report }
    };

    Ok(CallPlan { number, caller, marked_players, outcome })
}

/// Validate a board submission for a seat. Returns the board to persist.
pub fn check_board_submission(
    state: &SessionState,
    seat: PlayerNumber,
    board: &[u8],
) -> Result<Vec<u8>, TurnError> {
    let status = state.game().status;
    if !matches!(status, GameStatus::Waiting | GameStatus::Setup) {
        return Err(TurnError::SetupClosed { status });
    }
    let player = state.player(seat).ok_or(TurnError::UnknownPlayer(seat))?;
    if player.board_setup_complete {
        return Err(TurnError::AlreadySubmitted(seat));
    }
    validate_board(board)?;
    Ok(board.to_vec())
}

/// Whether a fresh store read calls for the `setup -> playing` transition.
///
/// Both seats must be present with their flags set and the game must not have
/// started yet. Running the transition twice is harmless.
pub fn should_start(game: &Game, players: &[Player]) -> bool {
    matches!(game.status, GameStatus::Waiting | GameStatus::Setup)
        && players.len() == PlayerNumber::ALL.len()
        && players.iter().all(|p| p.board_setup_complete)
}

/// Whether an initial load sees a join that never advanced the status.
pub fn needs_auto_heal(game: &Game, players: &[Player]) -> bool {
    game.status == GameStatus::Waiting && players.len() == PlayerNumber::ALL.len()
}

/// A win the last call reached that the game row never recorded.
///
/// The call is durable before the finishing write, so a lost write leaves a
/// playing game whose last caller already holds five lines.
pub fn unrecorded_win(state: &SessionState) -> Option<(PlayerNumber, LineReport)> {
    if state.game().status != GameStatus::Playing {
        return None;
    }
    let caller = state.moves().last()?.called_by_player;
    let report = state.report_for(caller);
    report.is_win().then_some((caller, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::SessionSnapshot;
    use crate::game::state::{GameId, Move, MoveId};
    use chrono::Utc;

    fn state_with(status: GameStatus, p1_board: Vec<u8>, p2_board: Vec<u8>) -> SessionState {
        let id = GameId::new("ABCD1234");
        let mut game = Game::new(id.clone(), false);
        game.status = status;
        let mut p1 = Player::new(id.clone(), PlayerNumber::One, "Ann");
        p1.board_setup_complete = !p1_board.is_empty();
        p1.board_numbers = p1_board;
        let mut p2 = Player::new(id, PlayerNumber::Two, "Bo");
        p2.board_setup_complete = !p2_board.is_empty();
        p2.board_numbers = p2_board;
        SessionState::from_snapshot(SessionSnapshot { game, players: vec![p1, p2], moves: vec![] })
    }

    fn ordered() -> Vec<u8> {
        (1..=25).collect()
    }

    fn record(state: &mut SessionState, plan: &CallPlan, seq: u64) {
        let call = Move {
            id: MoveId::generate(),
            game_id: state.game().id.clone(),
            number_called: plan.number,
            called_by_player: plan.caller,
            created_at: Utc::now(),
            sequence: seq,
        };
        state.commit_call(call, plan.marked_players.clone());
    }

    #[test]
    fn test_call_switches_turn() {
        let mut state = state_with(GameStatus::Playing, ordered(), ordered());
        let plan = plan_call(&state, PlayerNumber::One, 7).unwrap();
        assert_eq!(plan.marked_players.len(), 2);
        assert!(matches!(plan.outcome, CallOutcome::NextTurn { next: PlayerNumber::Two, .. }));
        record(&mut state, &plan, 1);

        assert_eq!(state.turn(), PlayerNumber::Two);
        let before = state.clone();
        let err = plan_call(&state, PlayerNumber::One, 8).unwrap_err();
        assert_eq!(err, TurnError::NotYourTurn { caller: PlayerNumber::One, current: PlayerNumber::Two });
        assert_eq!(state, before);
    }

    #[test]
    fn test_already_called_is_rejected() {
        let mut state = state_with(GameStatus::Playing, ordered(), ordered());
        let plan = plan_call(&state, PlayerNumber::One, 7).unwrap();
        record(&mut state, &plan, 1);
        assert_eq!(plan_call(&state, PlayerNumber::Two, 7), Err(TurnError::AlreadyCalled(7)));
    }

    #[test]
    fn test_range_and_status_guards() {
        let state = state_with(GameStatus::Setup, ordered(), ordered());
        assert_eq!(plan_call(&state, PlayerNumber::One, 0), Err(TurnError::NumberOutOfRange(0)));
        assert_eq!(plan_call(&state, PlayerNumber::One, 26), Err(TurnError::NumberOutOfRange(26)));
        assert_eq!(
            plan_call(&state, PlayerNumber::One, 3),
            Err(TurnError::GameNotPlaying { status: GameStatus::Setup })
        );
        let finished = state_with(GameStatus::Finished, ordered(), ordered());
        assert!(matches!(plan_call(&finished, PlayerNumber::One, 3), Err(TurnError::GameFinished { .. })));
    }

    #[test]
    fn test_fifth_line_wins() {
        let mut state = state_with(GameStatus::Playing, ordered(), ordered());
        // alternate calls 1..=20, then 22 completes column 1 for whoever calls it
        let mut seq = 0;
        for n in 1..=20u8 {
            let caller = state.turn();
            let plan = plan_call(&state, caller, n).unwrap();
            assert!(!plan.outcome.is_win(), "no win expected at {n}");
            seq += 1;
            record(&mut state, &plan, seq);
        }
        let caller = state.turn();
        let plan = plan_call(&state, caller, 22).unwrap();
        match plan.outcome {
            CallOutcome::Win { winner, report } => {
                assert_eq!(winner, caller);
                assert_eq!(report.completed_line_count, 5);
            }
            other => panic!("expected win, got {other:?}"),
        }
    }

    #[test]
    fn test_unrecorded_win_after_lost_finish() {
        let mut state = state_with(GameStatus::Playing, ordered(), ordered());
        assert!(unrecorded_win(&state).is_none());
        let mut seq = 0;
        for n in 1..=20u8 {
            let plan = plan_call(&state, state.turn(), n).unwrap();
            seq += 1;
            record(&mut state, &plan, seq);
        }
        assert!(unrecorded_win(&state).is_none());

        // the winning call lands but the game row stays `playing`
        let caller = state.turn();
        let plan = plan_call(&state, caller, 22).unwrap();
        record(&mut state, &plan, seq + 1);
        let (winner, report) = unrecorded_win(&state).expect("win should be detected");
        assert_eq!(winner, caller);
        assert_eq!(report.completed_line_count, 5);

        let finished = state_with(GameStatus::Finished, ordered(), ordered());
        assert!(unrecorded_win(&finished).is_none());
    }

    #[test]
    fn test_board_submission_checks() {
        let state = state_with(GameStatus::Setup, vec![], vec![]);
        assert_eq!(check_board_submission(&state, PlayerNumber::One, &ordered()).unwrap(), ordered());
        let mut dup = ordered();
        dup[0] = 2;
        assert!(matches!(
            check_board_submission(&state, PlayerNumber::One, &dup),
            Err(TurnError::Board(BoardError::Duplicate { .. }))
        ));

        let submitted = state_with(GameStatus::Setup, ordered(), vec![]);
        assert_eq!(
            check_board_submission(&submitted, PlayerNumber::One, &ordered()),
            Err(TurnError::AlreadySubmitted(PlayerNumber::One))
        );

        let playing = state_with(GameStatus::Playing, ordered(), ordered());
        assert_eq!(
            check_board_submission(&playing, PlayerNumber::Two, &ordered()),
            Err(TurnError::SetupClosed { status: GameStatus::Playing })
        );
    }

    #[test]
    fn test_should_start_requires_both_flags() {
        let one = state_with(GameStatus::Setup, ordered(), vec![]);
        assert!(!should_start(one.game(), one.players()));
        let both = state_with(GameStatus::Setup, ordered(), ordered());
        assert!(should_start(both.game(), both.players()));
        let started = state_with(GameStatus::Playing, ordered(), ordered());
        assert!(!should_start(started.game(), started.players()));
    }

    #[test]
    fn test_auto_heal_condition() {
        let waiting = state_with(GameStatus::Waiting, vec![], vec![]);
        assert!(needs_auto_heal(waiting.game(), waiting.players()));
        assert!(!needs_auto_heal(waiting.game(), &waiting.players()[..1]));
        let setup = state_with(GameStatus::Setup, vec![], vec![]);
        assert!(!needs_auto_heal(setup.game(), setup.players()));
    }
}
