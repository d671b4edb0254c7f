// Move notation and the records exchanged with the game orchestration side

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Malformed notation, rejected before any motion is attempted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("Invalid move format {0:?}: expected 4 characters like \"e2e4\"")]
    Length(String),

    #[error("Invalid square {0:?}: files a-h, ranks 1-8")]
    Square(String),
}

/// Board square in grid coordinates: x = file (a=0), y = rank (1=0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Square {
    pub x: u8,
    pub y: u8,
}

impl Square {
    pub fn new(x: u8, y: u8) -> Option<Self> {
        (x < 8 && y < 8).then_some(Self { x, y })
    }

    /// Offset by a signed grid delta, `None` if it leaves the board
    pub fn offset(self, dx: i8, dy: i8) -> Option<Self> {
        let x = u8::try_from(self.x as i8 + dx).ok()?;
        let y = u8::try_from(self.y as i8 + dy).ok()?;
        Self::new(x, y)
    }

    fn from_chars(file: char, rank: char) -> Option<Self> {
        if !('a'..='h').contains(&file) || !('1'..='8').contains(&rank) {
            return None;
        }
        Some(Self {
            x: file as u8 - b'a',
            y: rank as u8 - b'1',
        })
    }
}

impl FromStr for Square {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(file), Some(rank), None) => {
                Self::from_chars(file, rank).ok_or_else(|| FormatError::Square(s.to_string()))
            }
            _ => Err(FormatError::Square(s.to_string())),
        }
    }
}

impl TryFrom<String> for Square {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Square> for String {
    fn from(square: Square) -> Self {
        square.to_string()
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'a' + self.x) as char, (b'1' + self.y) as char)
    }
}

/// A move between two squares, "e2e4"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChessMove {
    pub from: Square,
    pub to: Square,
}

impl ChessMove {
    pub fn new(from: Square, to: Square) -> Self {
        Self { from, to }
    }

    /// Signed grid delta (files, ranks)
    pub fn delta(&self) -> (i8, i8) {
        (
            self.to.x as i8 - self.from.x as i8,
            self.to.y as i8 - self.from.y as i8,
        )
    }
}

impl FromStr for ChessMove {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 4 {
            return Err(FormatError::Length(s.to_string()));
        }
        let from = Square::from_chars(chars[0], chars[1])
            .ok_or_else(|| FormatError::Square(s.to_string()))?;
        let to = Square::from_chars(chars[2], chars[3])
            .ok_or_else(|| FormatError::Square(s.to_string()))?;
        Ok(Self { from, to })
    }
}

impl TryFrom<String> for ChessMove {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChessMove> for String {
    fn from(mv: ChessMove) -> Self {
        mv.to_string()
    }
}

impl fmt::Display for ChessMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    White,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastlingKind {
    /// Short castling, rook h-file -> f-file
    Kingside,
    /// Long castling, rook a-file -> d-file
    Queenside,
}

/// Pending rook relocation after the king's castling move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Castling {
    pub side: Side,
    pub kind: CastlingKind,
    pub rook_move: ChessMove,
}

/// What the trolley did for one commanded move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveReport {
    /// The move as commanded
    pub executed: ChessMove,
    /// Rook follow-up performed as part of the same command
    pub castling: Option<Castling>,
    /// Path segments driven while carrying pieces
    pub loaded_segments: usize,
    /// Pieces carried, in order; a castling rook comes after its king
    pub carried: Vec<ChessMove>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        let mv: ChessMove = "e2e4".parse().unwrap();
        assert_eq!(mv.from, Square { x: 4, y: 1 });
        assert_eq!(mv.to, Square { x: 4, y: 3 });
        assert_eq!(mv.delta(), (0, 2));
        assert_eq!(mv.to_string(), "e2e4");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            "e2e".parse::<ChessMove>(),
            Err(FormatError::Length("e2e".to_string()))
        );
        assert!(matches!("e2e44".parse::<ChessMove>(), Err(FormatError::Length(_))));
        assert!(matches!("i2e4".parse::<ChessMove>(), Err(FormatError::Square(_))));
        assert!(matches!("e0e4".parse::<ChessMove>(), Err(FormatError::Square(_))));
        assert!(matches!("e2e9".parse::<ChessMove>(), Err(FormatError::Square(_))));
        assert!(matches!("E2E4".parse::<ChessMove>(), Err(FormatError::Square(_))));
    }

    #[test]
    fn test_square_offset() {
        let a1: Square = "a1".parse().unwrap();
        assert_eq!(a1.offset(1, 2), Some("b3".parse().unwrap()));
        assert_eq!(a1.offset(-1, 0), None);
        assert_eq!("h8".parse::<Square>().unwrap().offset(0, 1), None);
    }

    #[test]
    fn test_serde_as_notation() {
        let mv: ChessMove = "g1f3".parse().unwrap();
        let json = serde_json::to_string(&mv).unwrap();
        assert_eq!(json, "\"g1f3\"");
        let back: ChessMove = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mv);
        assert!(serde_json::from_str::<Square>("\"z9\"").is_err());
    }
}
