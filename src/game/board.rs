//! Board Model
//!
//! Line evaluation over a row-major 5×5 board, plus setup drafts and random
//! boards. Everything here is pure: the same inputs give the same report on
//! both clients, so each can evaluate independently.

use std::collections::BTreeSet;

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::rng::DeterministicRng;
use crate::{BOARD_CELLS, BOARD_SIDE, LINE_COUNT, MAX_NUMBER, WINNING_LINE_COUNT};

// =============================================================================
// LINES
// =============================================================================

/// Orientation of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Horizontal, index = row.
    Row,
    /// Vertical, index = column.
    Column,
    /// Index 0 runs top-left to bottom-right, index 1 top-right to bottom-left.
    Diagonal,
}

/// One of the 12 lines on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineDescriptor {
    /// Orientation
    pub kind: LineKind,
    /// Row, column or diagonal index
    pub index: u8,
}

impl LineDescriptor {
    /// Cell indices covered by this line, in row-major numbering.
    pub fn cells(&self) -> [usize; BOARD_SIDE] {
        let i = self.index as usize;
        let mut cells = [0usize; BOARD_SIDE];
        for (k, cell) in cells.iter_mut().enumerate() {
            *cell = match (self.kind, i) {
                (LineKind::Row, row) => row * BOARD_SIDE + k,
                (LineKind::Column, col) => k * BOARD_SIDE + col,
                (LineKind::Diagonal, 0) => k * BOARD_SIDE + k,
                (LineKind::Diagonal, _) => k * BOARD_SIDE + (BOARD_SIDE - 1 - k),
            };
        }
        cells
    }
}

/// Every line in evaluation order: rows, columns, diagonals.
pub fn all_lines() -> impl Iterator<Item = LineDescriptor> {
    let rows = (0..BOARD_SIDE as u8).map(|index| LineDescriptor { kind: LineKind::Row, index });
    let cols = (0..BOARD_SIDE as u8).map(|index| LineDescriptor { kind: LineKind::Column, index });
    let diags = (0..2u8).map(|index| LineDescriptor { kind: LineKind::Diagonal, index });
    rows.chain(cols).chain(diags)
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Result of evaluating one board.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReport {
    /// Number of fully covered lines (0..=12)
    pub completed_line_count: usize,
    /// Cells belonging to at least one completed line
    pub completed_cells: BTreeSet<usize>,
    /// Completed lines, for strike-through rendering
    pub lines: Vec<LineDescriptor>,
}

impl LineReport {
    /// Five or more completed lines.
    #[inline]
    pub fn is_win(&self) -> bool {
        self.completed_line_count >= WINNING_LINE_COUNT
    }
}

/// Whether a board holds 25 filled cells (0 marks an empty slot).
pub fn is_board_ready(board: &[u8]) -> bool {
    board.len() == BOARD_CELLS && board.iter().all(|n| (1..=MAX_NUMBER).contains(n))
}

/// Evaluate completed lines.
///
/// A cell counts as marked when its number is in `player_marks` or in
/// `called_numbers`. Returns an empty report for a board that is not set up
/// or when nothing is marked or called.
pub fn evaluate(
    board: &[u8],
    player_marks: &BTreeSet<u8>,
    called_numbers: &BTreeSet<u8>,
) -> LineReport {
    let mut report = LineReport::default();

    if !is_board_ready(board) || (player_marks.is_empty() && called_numbers.is_empty()) {
        return report;
    }

    let is_marked = |cell: usize| {
        let number = board[cell];
        player_marks.contains(&number) || called_numbers.contains(&number)
    };

    for line in all_lines() {
        let cells = line.cells();
        if cells.iter().all(|&cell| is_marked(cell)) {
            report.completed_line_count += 1;
            report.completed_cells.extend(cells);
            report.lines.push(line);
        }
    }

    debug_assert!(report.completed_line_count <= LINE_COUNT);
    report
}

// =============================================================================
// SETUP
// =============================================================================

/// Board setup failures. These never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    /// Board does not have 25 cells.
    #[error("board has {len} cells, expected {BOARD_CELLS}")]
    WrongLength {
        /// Actual length
        len: usize,
    },

    /// Some cells are still empty.
    #[error("board incomplete: {missing} empty cells")]
    Incomplete {
        /// Empty cell count
        missing: usize,
    },

    /// A number appears more than once.
    #[error("duplicate numbers on board: {numbers:?}")]
    Duplicate {
        /// Every duplicated number
        numbers: Vec<u8>,
    },

    /// A number outside 1..=25.
    #[error("number {value} out of range 1..={MAX_NUMBER}")]
    OutOfRange {
        /// Offending value
        value: u8,
    },

    /// Cell index outside the grid.
    #[error("cell {index} outside the board")]
    CellOutOfRange {
        /// Offending index
        index: usize,
    },
}

/// Check a submitted layout: 25 distinct numbers in 1..=25.
pub fn validate_board(board: &[u8]) -> Result<(), BoardError> {
    if board.len() != BOARD_CELLS {
        return Err(BoardError::WrongLength { len: board.len() });
    }
    let mut draft = BoardDraft::new();
    for (index, &value) in board.iter().enumerate() {
        if value == 0 {
            continue;
        }
        draft.set(index, Some(value))?;
    }
    draft.validate().map(|_| ())
}

/// A board being filled in during setup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoardDraft {
    cells: [Option<u8>; BOARD_CELLS],
}

impl BoardDraft {
    /// Empty draft.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill or clear one cell. Only 1..=25 is accepted.
    pub fn set(&mut self, index: usize, value: Option<u8>) -> Result<(), BoardError> {
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(BoardError::CellOutOfRange { index })?;
        if let Some(v) = value {
            if !(1..=MAX_NUMBER).contains(&v) {
                return Err(BoardError::OutOfRange { value: v });
            }
        }
        *cell = value;
        Ok(())
    }

    /// Cell content.
    pub fn get(&self, index: usize) -> Option<u8> {
        self.cells.get(index).copied().flatten()
    }

    /// Clear all cells.
    pub fn clear(&mut self) {
        self.cells = [None; BOARD_CELLS];
    }

    /// Numbers used at least once.
    pub fn used_numbers(&self) -> BTreeSet<u8> {
        self.cells.iter().flatten().copied().collect()
    }

    /// Numbers used more than once.
    pub fn duplicates(&self) -> BTreeSet<u8> {
        let mut seen = BTreeSet::new();
        let mut dupes = BTreeSet::new();
        for &n in self.cells.iter().flatten() {
            if !seen.insert(n) {
                dupes.insert(n);
            }
        }
        dupes
    }

    /// Empty cell count.
    pub fn missing(&self) -> usize {
        self.cells.iter().filter(|c| c.is_none()).count()
    }

    /// All cells filled with distinct numbers.
    pub fn is_complete(&self) -> bool {
        self.missing() == 0 && self.duplicates().is_empty()
    }

    /// Replace every cell with a random permutation.
    pub fn fill_random(&mut self, rng: &mut DeterministicRng) {
        for (cell, n) in self.cells.iter_mut().zip(random_board(rng)) {
            *cell = Some(n);
        }
    }

    /// Produce the submittable layout.
    pub fn validate(&self) -> Result<Vec<u8>, BoardError> {
        let dupes = self.duplicates();
        if !dupes.is_empty() {
            return Err(BoardError::Duplicate { numbers: dupes.into_iter().collect() });
        }
        let missing = self.missing();
        if missing > 0 {
            return Err(BoardError::Incomplete { missing });
        }
        Ok(self.cells.iter().flatten().copied().collect())
    }
}

/// A uniformly shuffled permutation of 1..=25.
pub fn random_board(rng: &mut DeterministicRng) -> Vec<u8> {
    let mut numbers: Vec<u8> = (1..=MAX_NUMBER).collect();
    rng.shuffle(&mut numbers);
    numbers
}
