// CoreXY kinematics for the chess trolley
//
// Motor A and motor B drive one belt loop. Turning both the same way moves
// the trolley along a file, turning them against each other moves it along
// a rank, and turning just one moves it along a diagonal:
//   x = (A - B) / 2,  y = (A + B) / 2
// Path planning here is pure: it turns a move and a board into segments.

use tracing::warn;

use crate::board::Board;
use crate::messages::{Castling, CastlingKind, ChessMove, Side, Square};

/// Direction of one straight segment, as seen from white's side of the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heading {
    Left,
    Right,
    Down,
    Up,
    UpRight,
    DownLeft,
    DownRight,
    UpLeft,
}

/// Motor sign for one heading: +1, -1, or 0 when the motor stays put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorDrive {
    pub a: i8,
    pub b: i8,
}

impl Heading {
    pub const ALL: [Heading; 8] = [
        Heading::Left,
        Heading::Right,
        Heading::Down,
        Heading::Up,
        Heading::UpRight,
        Heading::DownLeft,
        Heading::DownRight,
        Heading::UpLeft,
    ];

    pub fn drive(self) -> MotorDrive {
        let (a, b) = match self {
            Heading::Left => (-1, 1),
            Heading::Right => (1, -1),
            Heading::Down => (-1, -1),
            Heading::Up => (1, 1),
            Heading::UpRight => (1, 0),
            Heading::DownLeft => (-1, 0),
            Heading::DownRight => (0, -1),
            Heading::UpLeft => (0, 1),
        };
        MotorDrive { a, b }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(
            self,
            Heading::UpRight | Heading::DownLeft | Heading::DownRight | Heading::UpLeft
        )
    }

    /// Grid displacement of one square along this heading
    pub fn unit(self) -> (i8, i8) {
        match self {
            Heading::Left => (-1, 0),
            Heading::Right => (1, 0),
            Heading::Down => (0, -1),
            Heading::Up => (0, 1),
            Heading::UpRight => (1, 1),
            Heading::DownLeft => (-1, -1),
            Heading::DownRight => (1, -1),
            Heading::UpLeft => (-1, 1),
        }
    }

    fn horizontal(dx: i8) -> Self {
        if dx > 0 { Heading::Right } else { Heading::Left }
    }

    fn vertical(dy: i8) -> Self {
        if dy > 0 { Heading::Up } else { Heading::Down }
    }

    fn diagonal(dx: i8, dy: i8) -> Self {
        match (dx > 0, dy > 0) {
            (true, true) => Heading::UpRight,
            (true, false) => Heading::DownRight,
            (false, true) => Heading::UpLeft,
            (false, false) => Heading::DownLeft,
        }
    }
}

/// One straight motion; both motors run it together
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub heading: Heading,
    /// Distance in squares (fractions for grid-line detours)
    pub squares: f32,
}

impl Segment {
    pub fn new(heading: Heading, squares: f32) -> Self {
        Self { heading, squares }
    }

    /// Relative steps for motor A and motor B; `None` leaves that motor idle
    pub fn motor_steps(&self, square_steps: u32, diagonal_steps: u32) -> (Option<i64>, Option<i64>) {
        let per_square = if self.heading.is_diagonal() {
            diagonal_steps
        } else {
            square_steps
        };
        let base = (per_square as f64 * self.squares as f64).round() as i64;
        let drive = self.heading.drive();
        let steps = |sign: i8| (sign != 0).then_some(base * sign as i64);
        (steps(drive.a), steps(drive.b))
    }

    /// Grid displacement (dx, dy) in squares
    pub fn displacement(&self) -> (f32, f32) {
        let (ux, uy) = self.heading.unit();
        (ux as f32 * self.squares, uy as f32 * self.squares)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveShape {
    Null,
    /// Along a file or a rank
    Orthogonal,
    Diagonal,
    Knight,
    /// Anything else: horizontal leg, then vertical leg
    Compound,
}

pub fn classify(dx: i8, dy: i8) -> MoveShape {
    let (ax, ay) = (dx.unsigned_abs(), dy.unsigned_abs());
    match (ax, ay) {
        (0, 0) => MoveShape::Null,
        (0, _) | (_, 0) => MoveShape::Orthogonal,
        _ if ax == ay => MoveShape::Diagonal,
        (1, 2) | (2, 1) => MoveShape::Knight,
        _ => MoveShape::Compound,
    }
}

/// Straight-line travel between squares without regard to pieces
pub fn plan_transit(from: Square, to: Square) -> Vec<Segment> {
    let (dx, dy) = ChessMove::new(from, to).delta();
    match classify(dx, dy) {
        MoveShape::Null => Vec::new(),
        MoveShape::Diagonal => vec![Segment::new(
            Heading::diagonal(dx, dy),
            dx.unsigned_abs() as f32,
        )],
        _ => {
            let mut segments = Vec::with_capacity(2);
            if dx != 0 {
                segments.push(Segment::new(Heading::horizontal(dx), dx.unsigned_abs() as f32));
            }
            if dy != 0 {
                segments.push(Segment::new(Heading::vertical(dy), dy.unsigned_abs() as f32));
            }
            segments
        }
    }
}

/// How a knight gets to its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnightRoute {
    /// Two legs through a free intermediate square
    Via(Square),
    /// Both intermediates occupied: half a square onto the grid lines, the
    /// long leg between the pieces, half a square back
    GridLines,
}

/// Candidate intermediates for a knight move, in preference order.
/// Each L is one straight leg (one square) plus one diagonal leg.
fn knight_candidates(mv: ChessMove) -> [Square; 2] {
    let (from, to) = (mv.from, mv.to);
    let (dx, _) = mv.delta();
    if dx.unsigned_abs() == 2 {
        let x_mid = (from.x + to.x) / 2;
        [Square { x: x_mid, y: to.y }, Square { x: x_mid, y: from.y }]
    } else {
        let y_mid = (from.y + to.y) / 2;
        [Square { x: from.x, y: y_mid }, Square { x: to.x, y: y_mid }]
    }
}

/// Route a knight around occupied squares, looking at the board before the move
pub fn plan_knight(board: &Board, mv: ChessMove) -> (KnightRoute, Vec<Segment>) {
    for mid in knight_candidates(mv) {
        if board.is_empty(mid) {
            let mut segments = plan_transit(mv.from, mid);
            segments.extend(plan_transit(mid, mv.to));
            return (KnightRoute::Via(mid), segments);
        }
    }

    warn!("Both intermediate squares of {} are occupied, routing along grid lines", mv);
    let (dx, dy) = mv.delta();
    let segments = if dx.unsigned_abs() == 2 {
        vec![
            Segment::new(Heading::vertical(dy), 0.5),
            Segment::new(Heading::horizontal(dx), 2.0),
            Segment::new(Heading::vertical(dy), 0.5),
        ]
    } else {
        vec![
            Segment::new(Heading::horizontal(dx), 0.5),
            Segment::new(Heading::vertical(dy), 2.0),
            Segment::new(Heading::horizontal(dx), 0.5),
        ]
    };
    (KnightRoute::GridLines, segments)
}

/// A king moving two files from its home square castles
pub fn castling_for(board: &Board, mv: ChessMove) -> Option<Castling> {
    let side = match (board.piece_at(mv.from), mv.from.y) {
        ('K', 0) => Side::White,
        ('k', 7) => Side::Black,
        _ => return None,
    };
    if mv.from.x != 4 || mv.to.y != mv.from.y {
        return None;
    }
    let (kind, rook_from, rook_to) = match mv.to.x {
        6 => (CastlingKind::Kingside, 7, 5),
        2 => (CastlingKind::Queenside, 0, 3),
        _ => return None,
    };
    let rank = mv.from.y;
    Some(Castling {
        side,
        kind,
        rook_move: ChessMove::new(
            Square { x: rook_from, y: rank },
            Square { x: rook_to, y: rank },
        ),
    })
}

/// Rook path during castling: step off the back rank between the rows,
/// slide past the king, step back
pub fn plan_castling_rook(castling: &Castling) -> Vec<Segment> {
    let (off, back) = match castling.side {
        Side::White => (Heading::Up, Heading::Down),
        Side::Black => (Heading::Down, Heading::Up),
    };
    let slide = match castling.kind {
        CastlingKind::Kingside => Segment::new(Heading::Left, 2.0),
        CastlingKind::Queenside => Segment::new(Heading::Right, 3.0),
    };
    vec![Segment::new(off, 0.5), slide, Segment::new(back, 0.5)]
}

/// Path for a move made with the magnet on
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPlan {
    pub segments: Vec<Segment>,
    pub castling: Option<Castling>,
    pub knight_route: Option<KnightRoute>,
}

pub fn plan_loaded_move(board: &Board, mv: ChessMove) -> LoadedPlan {
    let castling = castling_for(board, mv);
    let (dx, dy) = mv.delta();
    if classify(dx, dy) == MoveShape::Knight {
        let (route, segments) = plan_knight(board, mv);
        return LoadedPlan {
            segments,
            castling,
            knight_route: Some(route),
        };
    }
    LoadedPlan {
        segments: plan_transit(mv.from, mv.to),
        castling,
        knight_route: None,
    }
}
