// Chess trolley: two CoreXY axes plus the electromagnet
//
// Turns commanded moves into segment sequences, runs each segment on both
// axes at once and waits for both before the next one starts.

use crossbeam_channel::Receiver;
use std::collections::VecDeque;
use std::thread;
use tracing::{debug, info, warn};

use super::gpio::{MotorPin, SensePin};
use super::kinematics::{Heading, Segment, plan_castling_rook, plan_loaded_move, plan_transit};
use super::ramp::{Direction, MovementMode, StopMode};
use super::stallguard::{self, HomingError, HomingReport, StallEdge, StallWatcher};
use super::stepper::{StepperAxis, StepperError};
use super::tmc2209::TmcError;
use crate::board::Board;
use crate::config::{ConfigError, HomingConfig, SpeedProfile, TrolleyConfig};
use crate::messages::{Castling, ChessMove, FormatError, MoveReport, Square};

/// Where the trolley ends up after homing both axes
const HOME_SQUARE: Square = Square { x: 7, y: 7 };

#[derive(Debug, thiserror::Error)]
pub enum TrolleyError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Stepper error: {0}")]
    Stepper(#[from] StepperError),

    #[error("Homing failed: {0}")]
    Homing(#[from] HomingError),

    #[error("Driver error: {0}")]
    Protocol(#[from] TmcError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Magnet pin error: {0}")]
    Magnet(String),

    #[error("Failed to start DIAG watcher: {0}")]
    Watcher(#[from] std::io::Error),

    #[error("Trolley is halted, configure and calibrate before moving")]
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisId {
    A,
    B,
}

/// Moves waiting to be carried out for one command
enum Transport {
    Commanded(ChessMove),
    CastlingRook(Castling),
}

pub struct Trolley<P: MotorPin> {
    axis_a: StepperAxis<P>,
    axis_b: StepperAxis<P>,
    magnet: P,
    magnet_on: bool,
    config: TrolleyConfig,
    position: Square,
    board: Board,
    edges_a: Option<Receiver<StallEdge>>,
    edges_b: Option<Receiver<StallEdge>>,
    watchers: Vec<StallWatcher>,
    /// Drivers programmed and energized since the last halt
    configured: bool,
    /// Position unknown after a halt; cleared by a successful calibration
    halted: bool,
}

impl<P: MotorPin> Trolley<P> {
    pub fn new(
        axis_a: StepperAxis<P>,
        axis_b: StepperAxis<P>,
        magnet: P,
        config: TrolleyConfig,
    ) -> Result<Self, TrolleyError> {
        let config = config.validate()?;
        let mut trolley = Self {
            axis_a,
            axis_b,
            magnet,
            magnet_on: true,
            config,
            position: HOME_SQUARE,
            board: Board::starting(),
            edges_a: None,
            edges_b: None,
            watchers: Vec::new(),
            configured: false,
            halted: false,
        };
        trolley.magnet_off()?;
        Ok(trolley)
    }

    pub fn position(&self) -> Square {
        self.position
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Replace the board with the game side's view before the next move
    pub fn set_board(&mut self, board: Board) {
        self.board = board;
    }

    pub fn magnet_is_on(&self) -> bool {
        self.magnet_on
    }

    pub fn axis(&self, id: AxisId) -> &StepperAxis<P> {
        match id {
            AxisId::A => &self.axis_a,
            AxisId::B => &self.axis_b,
        }
    }

    pub fn config(&self) -> &TrolleyConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn ensure_ready(&self) -> Result<(), TrolleyError> {
        if self.halted {
            return Err(TrolleyError::Halted);
        }
        Ok(())
    }

    /// Program both drivers and energize the motors
    pub fn configure(&mut self) -> Result<(), TrolleyError> {
        self.axis_a.configure()?;
        self.axis_b.configure()?;
        self.axis_a.set_motor_enabled(true)?;
        self.axis_b.set_motor_enabled(true)?;
        self.configured = true;
        Ok(())
    }

    /// Report DIAG edges of one axis during homing
    pub fn watch_diag<S: SensePin>(&mut self, id: AxisId, pin: S) -> Result<(), TrolleyError> {
        let homing = match id {
            AxisId::A => &self.config.homing_a,
            AxisId::B => &self.config.homing_b,
        };
        let (watcher, edges) = StallWatcher::spawn(self.axis(id).name(), pin, homing.debounce())?;
        match id {
            AxisId::A => self.edges_a = Some(edges),
            AxisId::B => self.edges_b = Some(edges),
        }
        self.watchers.push(watcher);
        Ok(())
    }

    pub fn magnet_on(&mut self) -> Result<(), TrolleyError> {
        self.magnet
            .set_high()
            .map_err(|e| TrolleyError::Magnet(format!("{:?}", e)))?;
        self.magnet_on = true;
        debug!("Magnet on");
        Ok(())
    }

    pub fn magnet_off(&mut self) -> Result<(), TrolleyError> {
        self.magnet
            .set_low()
            .map_err(|e| TrolleyError::Magnet(format!("{:?}", e)))?;
        self.magnet_on = false;
        debug!("Magnet off");
        Ok(())
    }

    pub fn set_speed_profile(&mut self, profile: SpeedProfile) -> Result<(), TrolleyError> {
        for axis in [&mut self.axis_a, &mut self.axis_b] {
            axis.set_acceleration(profile.acceleration)?;
            axis.set_max_speed(profile.max_speed)?;
        }
        Ok(())
    }

    /// Drive one segment on both axes at once and wait for both
    pub fn move_in_direction(&mut self, heading: Heading, squares: f32) -> Result<(), TrolleyError> {
        self.ensure_ready()?;
        self.run_segment(Segment::new(heading, squares))
    }

    fn run_segment(&mut self, segment: Segment) -> Result<(), TrolleyError> {
        let (steps_a, steps_b) =
            segment.motor_steps(self.config.square_steps, self.config.diagonal_steps);
        debug!(
            "Segment {:?} x{}: A={:?} B={:?}",
            segment.heading, segment.squares, steps_a, steps_b
        );
        if let Some(steps) = steps_a {
            self.axis_a
                .run_to_position_steps_threaded(steps, MovementMode::Relative)?;
        }
        if let Some(steps) = steps_b {
            if let Err(e) = self
                .axis_b
                .run_to_position_steps_threaded(steps, MovementMode::Relative)
            {
                self.axis_a.stop(StopMode::Hard);
                self.axis_a.wait_for_movement_finished_threaded()?;
                return Err(e.into());
            }
        }
        let finished_a = self.axis_a.wait_for_movement_finished_threaded();
        let finished_b = self.axis_b.wait_for_movement_finished_threaded();
        finished_a?;
        finished_b?;
        Ok(())
    }

    fn run_segments(&mut self, segments: &[Segment]) -> Result<(), TrolleyError> {
        segments
            .iter()
            .try_for_each(|segment| self.run_segment(*segment))
    }

    /// Travel without a piece
    fn transit_to(&mut self, square: Square) -> Result<(), TrolleyError> {
        self.ensure_ready()?;
        self.set_speed_profile(self.config.free)?;
        let segments = plan_transit(self.position, square);
        self.run_segments(&segments)?;
        self.position = square;
        Ok(())
    }

    fn home_axis(&mut self, id: AxisId) -> Result<HomingReport, HomingError> {
        let (axis, config, edges): (_, &HomingConfig, _) = match id {
            AxisId::A => (&mut self.axis_a, &self.config.homing_a, self.edges_a.as_ref()),
            AxisId::B => (&mut self.axis_b, &self.config.homing_b, self.edges_b.as_ref()),
        };
        stallguard::home(axis, config, Direction::Cw, edges)
    }

    fn home_both(&mut self) -> Result<(), TrolleyError> {
        self.set_speed_profile(self.config.free)?;

        // one axis at a time, the other one unpowered
        self.axis_b.set_motor_enabled(false)?;
        self.axis_a.set_motor_enabled(true)?;
        self.home_axis(AxisId::A)?;

        self.axis_b.set_motor_enabled(true)?;
        self.axis_a.set_motor_enabled(false)?;
        self.home_axis(AxisId::B)?;
        self.axis_a.set_motor_enabled(true)?;

        self.axis_a.set_current_position(0)?;
        self.axis_b.set_current_position(0)?;
        self.position = HOME_SQUARE;

        // homed corner -> centre of h8
        self.run_segment(Segment::new(Heading::Left, self.config.origin_offset_squares))?;
        Ok(())
    }

    /// Find the physical origin with StallGuard on both axes
    pub fn calibrate(&mut self) -> Result<(), TrolleyError> {
        if self.halted && !self.configured {
            return Err(TrolleyError::Halted);
        }
        info!("Calibrating trolley");
        self.guarded(|trolley| trolley.home_both())?;
        self.halted = false;
        info!("Calibration done, trolley at {}", self.position);
        Ok(())
    }

    /// Reset to the starting position and park
    pub fn take_initial_position(&mut self) -> Result<(), TrolleyError> {
        self.ensure_ready()?;
        self.board = Board::starting();
        let park = self.config.park;
        self.guarded(|trolley| trolley.transit_to(park))?;
        info!("Parked at {}", park);
        Ok(())
    }

    /// Execute a move given in coordinate notation ("e2e4").
    /// Castling also relocates the rook as part of the same command.
    pub fn make_move(&mut self, notation: &str) -> Result<MoveReport, TrolleyError> {
        let mv: ChessMove = notation.trim().parse()?;
        self.execute(mv)
    }

    pub fn execute(&mut self, mv: ChessMove) -> Result<MoveReport, TrolleyError> {
        self.ensure_ready()?;
        info!("Move {} (trolley at {})", mv, self.position);
        let mut report = MoveReport {
            executed: mv,
            castling: None,
            loaded_segments: 0,
            carried: Vec::new(),
        };
        let mut queue = VecDeque::from([Transport::Commanded(mv)]);

        while let Some(transport) = queue.pop_front() {
            let (mv, segments) = match transport {
                Transport::Commanded(mv) => {
                    let plan = plan_loaded_move(&self.board, mv);
                    if let Some(route) = plan.knight_route {
                        debug!("Knight route for {}: {:?}", mv, route);
                    }
                    if let Some(castling) = plan.castling {
                        info!("Castling {:?} {:?}, rook {}", castling.side, castling.kind, castling.rook_move);
                        report.castling = Some(castling);
                        queue.push_back(Transport::CastlingRook(castling));
                    }
                    (mv, plan.segments)
                }
                Transport::CastlingRook(castling) => {
                    (castling.rook_move, plan_castling_rook(&castling))
                }
            };
            report.loaded_segments += segments.len();
            self.guarded(|trolley| trolley.carry(mv, &segments))?;
            report.carried.push(mv);
        }
        Ok(report)
    }

    /// Pick up the piece on `mv.from`, drag it along `segments`, put it down
    fn carry(&mut self, mv: ChessMove, segments: &[Segment]) -> Result<(), TrolleyError> {
        self.transit_to(mv.from)?;

        self.set_speed_profile(self.config.loaded)?;
        self.magnet_on()?;
        self.run_segments(segments)?;
        thread::sleep(self.config.magnet_settle());
        self.magnet_off()?;

        self.position = mv.to;
        self.board.apply(mv);
        debug!("Carried {}, board:\n{}", mv, self.board);
        Ok(())
    }

    /// Run `op`; on failure stop everything before handing the error back
    fn guarded<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, TrolleyError>,
    ) -> Result<T, TrolleyError> {
        op(self).inspect_err(|e| {
            warn!("Unrecoverable error, halting trolley: {}", e);
            self.safe_halt();
        })
    }

    /// HARD stop both axes, drop the piece and cut motor current
    pub fn safe_halt(&mut self) {
        self.halted = true;
        self.configured = false;
        for axis in [&mut self.axis_a, &mut self.axis_b] {
            axis.stop(StopMode::Hard);
            if let Err(e) = axis.wait_for_movement_finished_threaded() {
                warn!("Axis {} did not stop cleanly: {}", axis.name(), e);
            }
            if let Err(e) = axis.set_motor_enabled(false) {
                warn!("Axis {}: {}", axis.name(), e);
            }
        }
        if let Err(e) = self.magnet_off() {
            warn!("{}", e);
        }
    }

    /// Park, release the magnet and disable the motors
    pub fn shutdown(&mut self) {
        if !self.halted {
            info!("Parking before shutdown");
            let park = self.config.park;
            if let Err(e) = self.transit_to(park) {
                warn!("Could not park: {}", e);
            }
        }
        self.safe_halt();
    }
}

impl<P: MotorPin> Drop for Trolley<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::motor::gpio::SimPin;
    use crate::motor::sim::SimulatedChips;
    use crate::motor::tmc2209::{Tmc2209, TmcBus};

    const FAST: SpeedProfile = SpeedProfile {
        max_speed: 20_000.0,
        acceleration: 1_000_000.0,
    };

    struct Rig {
        chips: SimulatedChips,
        magnet: SimPin,
        enable_a: SimPin,
        enable_b: SimPin,
        step_a: SimPin,
        trolley: Trolley<SimPin>,
    }

    fn rig() -> Rig {
        let chips = SimulatedChips::new();
        let bus = TmcBus::from_transport(chips.clone()).into_shared();
        let driver = DriverConfig {
            max_speed: FAST.max_speed,
            acceleration: FAST.acceleration,
            ..DriverConfig::default()
        };
        let (enable_a, enable_b, step_a, magnet) =
            (SimPin::new(), SimPin::new(), SimPin::new(), SimPin::new());
        let axis_a = StepperAxis::new(
            "A",
            Tmc2209::new(bus.clone(), 1).unwrap(),
            step_a.clone(),
            SimPin::new(),
            enable_a.clone(),
            driver.clone(),
        )
        .unwrap();
        let axis_b = StepperAxis::new(
            "B",
            Tmc2209::new(bus, 0).unwrap(),
            SimPin::new(),
            SimPin::new(),
            enable_b.clone(),
            driver,
        )
        .unwrap();
        let config = TrolleyConfig {
            square_steps: 10,
            diagonal_steps: 20,
            free: FAST,
            loaded: FAST,
            magnet_settle_ms: 0,
            homing_a: HomingConfig {
                max_travel_steps: 2000,
                ..HomingConfig::default()
            },
            homing_b: HomingConfig {
                max_travel_steps: 2000,
                ..HomingConfig::default()
            },
            ..TrolleyConfig::default()
        };
        let mut trolley = Trolley::new(axis_a, axis_b, magnet.clone(), config).unwrap();
        trolley.configure().unwrap();
        Rig {
            chips,
            magnet,
            enable_a,
            enable_b,
            step_a,
            trolley,
        }
    }

    fn sq(s: &str) -> Square {
        s.parse().unwrap()
    }

    /// Motor positions for a grid offset from h8 at 10 steps per square
    fn motor_positions(square: Square) -> (i64, i64) {
        let dx = square.x as i64 - 7;
        let dy = square.y as i64 - 7;
        (10 * (dx + dy), 10 * (dy - dx))
    }

    #[test]
    fn test_take_initial_position_parks_on_d8() {
        let mut rig = rig();
        rig.trolley.take_initial_position().unwrap();
        assert_eq!(rig.trolley.position(), sq("d8"));
        let (a, b) = motor_positions(sq("d8"));
        assert_eq!(rig.trolley.axis(AxisId::A).current_position(), a);
        assert_eq!(rig.trolley.axis(AxisId::B).current_position(), b);
    }

    #[test]
    fn test_e2e4_moves_pawn() {
        let mut rig = rig();
        rig.trolley.take_initial_position().unwrap();
        let report = rig.trolley.make_move("e2e4").unwrap();

        assert_eq!(report.executed.to_string(), "e2e4");
        assert_eq!(report.loaded_segments, 1);
        assert!(report.castling.is_none());
        assert_eq!(report.carried, vec![report.executed]);
        assert_eq!(rig.trolley.position(), sq("e4"));
        assert_eq!(rig.trolley.board().piece_at(sq("e4")), 'P');
        assert!(rig.trolley.board().is_empty(sq("e2")));
        assert!(!rig.magnet.level());
        assert!(!rig.trolley.magnet_is_on());

        let (a, b) = motor_positions(sq("e4"));
        assert_eq!(rig.trolley.axis(AxisId::A).current_position(), a);
        assert_eq!(rig.trolley.axis(AxisId::B).current_position(), b);
    }

    #[test]
    fn test_knight_around_blockers() {
        let mut rig = rig();
        rig.trolley.take_initial_position().unwrap();
        let report = rig.trolley.make_move("g1f3").unwrap();
        assert_eq!(report.loaded_segments, 3);
        assert_eq!(rig.trolley.position(), sq("f3"));
        assert_eq!(rig.trolley.board().piece_at(sq("f3")), 'N');

        // half-square detours cancel out
        let (a, b) = motor_positions(sq("f3"));
        assert_eq!(rig.trolley.axis(AxisId::A).current_position(), a);
        assert_eq!(rig.trolley.axis(AxisId::B).current_position(), b);
    }

    #[test]
    fn test_castling_moves_king_then_rook() {
        let mut rig = rig();
        let board = Board::from_rows(&[
            "r...k..r", "........", "........", "........", "........", "........", "........",
            "R...K..R",
        ])
        .unwrap();
        rig.trolley.set_board(board);
        let report = rig.trolley.make_move("e1g1").unwrap();

        let castling = report.castling.unwrap();
        assert_eq!(castling.rook_move.to_string(), "h1f1");
        assert_eq!(report.executed.to_string(), "e1g1");
        assert_eq!(report.loaded_segments, 1 + 3);
        let carried: Vec<String> = report.carried.iter().map(|mv| mv.to_string()).collect();
        assert_eq!(carried, ["e1g1", "h1f1"]);

        let board = rig.trolley.board();
        assert_eq!(board.piece_at(sq("g1")), 'K');
        assert_eq!(board.piece_at(sq("f1")), 'R');
        assert!(board.is_empty(sq("e1")));
        assert!(board.is_empty(sq("h1")));
        // rook went last
        assert_eq!(rig.trolley.position(), sq("f1"));
    }

    #[test]
    fn test_malformed_move_never_moves() {
        let mut rig = rig();
        let err = rig.trolley.make_move("e2e9").unwrap_err();
        assert!(matches!(err, TrolleyError::Format(FormatError::Square(_))));
        assert_eq!(rig.step_a.rising_edges(), 0);
        assert_eq!(rig.trolley.position(), HOME_SQUARE);
        assert!(!rig.enable_a.level());
    }

    #[test]
    fn test_calibrate_homes_each_axis() {
        let mut rig = rig();
        rig.chips.script_stallguard(1, [400, 400, 400, 10]);
        rig.chips.script_stallguard(0, [400, 400, 400, 10]);
        rig.trolley.calibrate().unwrap();

        assert_eq!(rig.trolley.position(), HOME_SQUARE);
        // origin offset: 0.75 squares left from the homed corner
        assert_eq!(rig.trolley.axis(AxisId::A).current_position(), -8);
        assert_eq!(rig.trolley.axis(AxisId::B).current_position(), 8);
        assert!(!rig.enable_a.level());
        assert!(!rig.enable_b.level());
    }

    #[test]
    fn test_failed_homing_halts_everything() {
        let mut rig = rig();
        rig.chips.script_stallguard(1, [400]);
        let err = rig.trolley.calibrate().unwrap_err();

        assert!(matches!(
            err,
            TrolleyError::Homing(HomingError::TravelExhausted { axis: "A", .. })
        ));
        assert!(rig.enable_a.level());
        assert!(rig.enable_b.level());
        assert!(!rig.magnet.level());
    }

    #[test]
    fn test_halted_trolley_refuses_moves_until_recalibrated() {
        let mut rig = rig();
        rig.chips.script_stallguard(1, [400]);
        rig.trolley.calibrate().unwrap_err();
        assert!(rig.trolley.is_halted());

        let pulses = rig.step_a.rising_edges();
        let position = rig.trolley.position();
        let board = rig.trolley.board().clone();
        assert!(matches!(rig.trolley.make_move("e2e4"), Err(TrolleyError::Halted)));
        assert!(matches!(rig.trolley.take_initial_position(), Err(TrolleyError::Halted)));
        assert!(matches!(
            rig.trolley.move_in_direction(Heading::Up, 1.0),
            Err(TrolleyError::Halted)
        ));
        assert_eq!(rig.step_a.rising_edges(), pulses);
        assert_eq!(rig.trolley.position(), position);
        assert_eq!(rig.trolley.board(), &board);
        assert!(rig.enable_a.level());

        // drivers were cut, so calibration alone is not enough
        assert!(matches!(rig.trolley.calibrate(), Err(TrolleyError::Halted)));

        rig.chips.script_stallguard(1, [400, 400, 400, 10]);
        rig.chips.script_stallguard(0, [400, 400, 400, 10]);
        rig.trolley.configure().unwrap();
        assert!(matches!(rig.trolley.make_move("e2e4"), Err(TrolleyError::Halted)));
        rig.trolley.calibrate().unwrap();
        assert!(!rig.trolley.is_halted());

        rig.trolley.make_move("e2e4").unwrap();
        assert_eq!(rig.trolley.position(), sq("e4"));
        assert_eq!(rig.trolley.board().piece_at(sq("e4")), 'P');
    }

    #[test]
    fn test_drop_parks_and_disables() {
        let rig = rig();
        let (enable_a, enable_b) = (rig.enable_a.clone(), rig.enable_b.clone());
        let mut trolley = rig.trolley;
        trolley.make_move("e2e4").unwrap();
        drop(trolley);
        assert!(enable_a.level());
        assert!(enable_b.level());
    }
}
