// Logical board mirrored from the game side
//
// Rows are stored rank 8 first so the text form reads like a diagram.
// Pieces use FEN letters (uppercase white), '.' marks an empty square.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::messages::{ChessMove, Square};

pub const EMPTY: char = '.';

const STARTING_ROWS: [&str; 8] = [
    "rnbqkbnr", "pppppppp", "........", "........", "........", "........", "PPPPPPPP", "RNBQKBNR",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error("Board needs 8 rows, got {0}")]
    RowCount(usize),

    #[error("Row {row} must have 8 squares: {text:?}")]
    RowLength { row: usize, text: String },

    #[error("Unknown piece {piece:?} in row {row}")]
    Piece { row: usize, piece: char },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Board {
    rows: [[char; 8]; 8],
}

impl Default for Board {
    fn default() -> Self {
        Self::starting()
    }
}

impl Board {
    pub fn starting() -> Self {
        // the literal rows are well formed
        let mut rows = [[EMPTY; 8]; 8];
        for (row, text) in rows.iter_mut().zip(STARTING_ROWS) {
            for (slot, piece) in row.iter_mut().zip(text.chars()) {
                *slot = piece;
            }
        }
        Self { rows }
    }

    pub fn empty() -> Self {
        Self {
            rows: [[EMPTY; 8]; 8],
        }
    }

    /// Parse eight rows, rank 8 first
    pub fn from_rows<S: AsRef<str>>(rows: &[S]) -> Result<Self, BoardError> {
        if rows.len() != 8 {
            return Err(BoardError::RowCount(rows.len()));
        }
        let mut board = Self::empty();
        for (row, text) in rows.iter().enumerate() {
            let text = text.as_ref();
            let pieces: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
            if pieces.len() != 8 {
                return Err(BoardError::RowLength {
                    row,
                    text: text.to_string(),
                });
            }
            for (col, piece) in pieces.into_iter().enumerate() {
                if piece != EMPTY && !"kqrbnpKQRBNP".contains(piece) {
                    return Err(BoardError::Piece { row, piece });
                }
                board.rows[row][col] = piece;
            }
        }
        Ok(board)
    }

    pub fn piece_at(&self, square: Square) -> char {
        self.rows[7 - square.y as usize][square.x as usize]
    }

    pub fn is_empty(&self, square: Square) -> bool {
        self.piece_at(square) == EMPTY
    }

    pub fn set(&mut self, square: Square, piece: char) {
        self.rows[7 - square.y as usize][square.x as usize] = piece;
    }

    /// Move whatever is on `from` to `to`; a piece on `to` is overwritten
    pub fn apply(&mut self, mv: ChessMove) {
        let piece = self.piece_at(mv.from);
        self.set(mv.to, piece);
        self.set(mv.from, EMPTY);
    }

    pub fn rows(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.iter().collect()).collect()
    }
}

impl TryFrom<Vec<String>> for Board {
    type Error = BoardError;

    fn try_from(rows: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_rows(&rows)
    }
}

impl From<Board> for Vec<String> {
    fn from(board: Board) -> Self {
        board.rows()
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows.iter().enumerate() {
            let line: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            writeln!(f, "{} {}", 8 - i, line.join(" "))?;
        }
        write!(f, "  a b c d e f g h")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sq(s: &str) -> Square {
        s.parse().unwrap()
    }

    #[test]
    fn test_starting_position() {
        let board = Board::starting();
        assert_eq!(board.piece_at(sq("e1")), 'K');
        assert_eq!(board.piece_at(sq("d8")), 'q');
        assert_eq!(board.piece_at(sq("g1")), 'N');
        assert!(board.is_empty(sq("e4")));
        assert!(!board.is_empty(sq("h7")));
    }

    #[test]
    fn test_apply_moves_piece() {
        let mut board = Board::starting();
        board.apply("e2e4".parse().unwrap());
        assert!(board.is_empty(sq("e2")));
        assert_eq!(board.piece_at(sq("e4")), 'P');
    }

    #[test]
    fn test_from_rows_validation() {
        assert_eq!(Board::from_rows(&["........"]), Err(BoardError::RowCount(1)));
        let mut rows = vec!["........"; 8];
        rows[3] = "...x....";
        assert!(matches!(Board::from_rows(&rows), Err(BoardError::Piece { row: 3, piece: 'x' })));
        rows[3] = "r . . . k . . r";
        let board = Board::from_rows(&rows).unwrap();
        assert_eq!(board.piece_at(sq("e5")), 'k');
    }

    #[test]
    fn test_serde_rows() {
        let json = serde_json::to_string(&Board::starting()).unwrap();
        assert!(json.starts_with("[\"rnbqkbnr\""));
        let back: Board = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Board::starting());
    }

    #[test]
    fn test_display() {
        let text = Board::starting().to_string();
        assert!(text.starts_with("8 r n b q k b n r"));
        assert!(text.ends_with("  a b c d e f g h"));
    }
}
