// Axis controller: one TMC2209 plus its STEP/DIR/EN pins
//
// A movement runs on its own thread. The step/dir pins and the ramp move
// into that thread for the duration of the move and come back through the
// join handle, so nothing outside the thread can touch them mid-move.
// Position, phase and the stop request are shared through atomics and are
// safe to observe from anywhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::gpio::MotorPin;
use super::ramp::{Direction, MovementMode, MovementPhase, Ramp, StopMode};
use super::tmc2209::{Tmc2209, TmcError};
use crate::config::{ConfigError, DriverConfig, FULLSTEPS_PER_REV};

/// Minimum STEP high time; the chip needs ~100 ns
const STEP_PULSE_WIDTH: Duration = Duration::from_micros(1);

#[derive(Debug, thiserror::Error)]
pub enum StepperError {
    #[error("Axis {axis} is moving")]
    Busy { axis: &'static str },

    #[error("Driver error: {0}")]
    Protocol(#[from] TmcError),

    #[error("Pin error: {0}")]
    Pin(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Movement task of axis {axis} was lost")]
    TaskLost { axis: &'static str },

    #[error("Failed to start movement task: {0}")]
    Spawn(#[from] std::io::Error),
}

fn pin_error(axis: &'static str, what: &str, err: impl std::fmt::Debug) -> StepperError {
    StepperError::Pin(format!("axis {} {}: {:?}", axis, what, err))
}

/// State the movement thread publishes
#[derive(Debug, Default)]
struct AxisState {
    current: AtomicI64,
    target: AtomicI64,
    phase: AtomicU8,
    stop: AtomicU8,
}

impl AxisState {
    fn phase(&self) -> MovementPhase {
        MovementPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: MovementPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn stop_mode(&self) -> StopMode {
        StopMode::from_u8(self.stop.load(Ordering::Acquire))
    }

    fn distance_to_go(&self) -> i64 {
        self.target.load(Ordering::Acquire) - self.current.load(Ordering::Acquire)
    }

    /// Back to rest: target = current before the phase says STANDSTILL
    fn settle(&self) {
        let current = self.current.load(Ordering::Acquire);
        self.target.store(current, Ordering::Release);
        self.set_phase(MovementPhase::Standstill);
    }
}

/// Everything the movement thread owns while a move runs
struct Motion<P> {
    step: P,
    dir: P,
    ramp: Ramp,
    dir_level: Option<bool>,
}

type TaskOutput<P> = (Motion<P>, Result<(), StepperError>);

impl<P: MotorPin> Motion<P> {
    /// Set DIR from the pending direction, then one STEP pulse
    fn make_a_step(&mut self, axis: &'static str) -> Result<(), StepperError> {
        let high = self.ramp.direction() == Direction::Cw;
        if self.dir_level != Some(high) {
            let res = if high { self.dir.set_high() } else { self.dir.set_low() };
            res.map_err(|e| pin_error(axis, "dir", e))?;
            self.dir_level = Some(high);
        }
        self.step.set_high().map_err(|e| pin_error(axis, "step", e))?;
        spin_sleep::sleep(STEP_PULSE_WIDTH);
        self.step.set_low().map_err(|e| pin_error(axis, "step", e))?;
        Ok(())
    }

    /// Step loop; the first interval was computed before the thread started
    fn run(&mut self, axis: &'static str, state: &AxisState) -> Result<(), StepperError> {
        let mut last_step = Instant::now();
        loop {
            if state.stop_mode() == StopMode::Hard {
                break;
            }
            let Some(interval) = self.ramp.step_interval() else {
                break;
            };
            let elapsed = last_step.elapsed();
            if interval > elapsed {
                spin_sleep::sleep(interval - elapsed);
            }
            // observed once per tick
            let stop = state.stop_mode();
            if stop == StopMode::Hard {
                break;
            }
            last_step = Instant::now();
            self.make_a_step(axis)?;
            state
                .current
                .fetch_add(self.ramp.direction().sign(), Ordering::AcqRel);

            let phase = self
                .ramp
                .compute_new_speed(state.distance_to_go(), stop == StopMode::Soft);
            state.set_phase(phase);
        }
        Ok(())
    }
}

/// One axis of the trolley. Configure once while idle, then issue moves.
pub struct StepperAxis<P: MotorPin> {
    name: &'static str,
    driver: Tmc2209,
    config: DriverConfig,
    enable: P,
    motion: Option<Motion<P>>,
    task: Option<JoinHandle<TaskOutput<P>>>,
    state: Arc<AxisState>,
    movement_mode: MovementMode,
    steps_per_rev: u32,
}

impl<P: MotorPin> StepperAxis<P> {
    /// Takes ownership of the pins; the motor output starts disabled
    pub fn new(
        name: &'static str,
        driver: Tmc2209,
        step: P,
        dir: P,
        enable: P,
        config: DriverConfig,
    ) -> Result<Self, StepperError> {
        let config = config.validate()?;
        let ramp = Ramp::new(config.max_speed, config.acceleration)
            .with_first_step_correction(config.first_step_correction);
        let steps_per_rev = config.steps_per_rev();
        let mut axis = Self {
            name,
            driver,
            config,
            enable,
            motion: Some(Motion {
                step,
                dir,
                ramp,
                dir_level: None,
            }),
            task: None,
            state: Arc::new(AxisState::default()),
            movement_mode: MovementMode::Relative,
            steps_per_rev,
        };
        axis.set_motor_enabled(false)?;
        Ok(axis)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register access to the underlying chip
    pub fn driver(&self) -> &Tmc2209 {
        &self.driver
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn steps_per_rev(&self) -> u32 {
        self.steps_per_rev
    }

    /// Apply the driver configuration to the chip
    pub fn configure(&mut self) -> Result<(), StepperError> {
        self.ensure_idle()?;
        info!("Configuring axis {} (driver {})", self.name, self.driver.address());

        let driver = &self.driver;
        driver.clear_gstat()?;
        driver.set_direction_reg(self.config.invert_direction)?;
        driver.set_current(self.config.run_current_ma)?;
        driver.set_interpolation(self.config.interpolation)?;
        driver.set_spreadcycle(self.config.spreadcycle)?;
        if !driver.set_microstepping_resolution(self.config.microsteps)? {
            return Err(ConfigError::Invalid {
                field: "microsteps",
                reason: format!("{} is not a valid resolution", self.config.microsteps),
            }
            .into());
        }
        driver.set_internal_rsense(self.config.internal_rsense)?;
        // motion comes from STEP/DIR, not the internal pulse generator
        driver.set_vactual(0)?;

        let microsteps = driver.read_microstepping_resolution()?;
        self.steps_per_rev = FULLSTEPS_PER_REV * microsteps as u32;
        debug!(
            "Axis {}: {} microsteps, {} steps/rev",
            self.name, microsteps, self.steps_per_rev
        );
        Ok(())
    }

    /// Enable is active low
    pub fn set_motor_enabled(&mut self, enabled: bool) -> Result<(), StepperError> {
        let res = if enabled {
            self.enable.set_low()
        } else {
            self.enable.set_high()
        };
        res.map_err(|e| pin_error(self.name, "enable", e))?;
        debug!("Axis {} output {}", self.name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn set_max_speed(&mut self, speed: f64) -> Result<(), StepperError> {
        let motion = self.idle_motion()?;
        motion.ramp.set_max_speed(speed);
        self.config.max_speed = speed.abs();
        Ok(())
    }

    pub fn set_acceleration(&mut self, acceleration: f64) -> Result<(), StepperError> {
        let motion = self.idle_motion()?;
        motion.ramp.set_acceleration(acceleration);
        self.config.acceleration = acceleration.abs();
        Ok(())
    }

    pub fn max_speed(&self) -> f64 {
        self.config.max_speed
    }

    pub fn acceleration(&self) -> f64 {
        self.config.acceleration
    }

    /// Default interpretation of step counts for `run_to_position_steps*`
    pub fn set_movement_mode(&mut self, mode: MovementMode) {
        self.movement_mode = mode;
    }

    pub fn movement_mode(&self) -> MovementMode {
        self.movement_mode
    }

    pub fn current_position(&self) -> i64 {
        self.state.current.load(Ordering::Acquire)
    }

    pub fn target_position(&self) -> i64 {
        self.state.target.load(Ordering::Acquire)
    }

    pub fn distance_to_go(&self) -> i64 {
        self.state.distance_to_go()
    }

    pub fn movement_phase(&self) -> MovementPhase {
        self.state.phase()
    }

    pub fn is_moving(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Redefine where the axis is (e.g. after homing)
    pub fn set_current_position(&mut self, position: i64) -> Result<(), StepperError> {
        self.idle_motion()?;
        self.state.current.store(position, Ordering::Release);
        self.state.target.store(position, Ordering::Release);
        Ok(())
    }

    /// Start a movement on the axis thread and return immediately.
    /// The phase is already past STANDSTILL when this returns (unless there is nothing to do).
    pub fn run_to_position_steps_threaded(
        &mut self,
        steps: i64,
        mode: MovementMode,
    ) -> Result<(), StepperError> {
        let name = self.name;
        self.ensure_idle()?;
        let mut motion = self.motion.take().ok_or(StepperError::TaskLost { axis: name })?;
        let state = self.state.clone();

        let current = state.current.load(Ordering::Acquire);
        let target = match mode {
            MovementMode::Absolute => steps,
            MovementMode::Relative => current + steps,
        };
        state.stop.store(StopMode::None as u8, Ordering::Release);
        state.target.store(target, Ordering::Release);

        let phase = motion.ramp.compute_new_speed(target - current, false);
        if phase == MovementPhase::Standstill {
            state.settle();
            self.motion = Some(motion);
            return Ok(());
        }
        state.set_phase(phase);
        debug!("Axis {}: move {} -> {}", name, current, target);

        let task = thread::Builder::new()
            .name(format!("axis-{}", name))
            .spawn(move || {
                let result = motion.run(name, &state);
                motion.ramp.reset();
                state.settle();
                (motion, result)
            });
        match task {
            Ok(task) => {
                self.task = Some(task);
                Ok(())
            }
            Err(e) => {
                // the pins went down with the closure
                self.state.settle();
                Err(e.into())
            }
        }
    }

    /// Block until the running movement ends; returns how it ended.
    /// Returns immediately if nothing is running.
    pub fn wait_for_movement_finished_threaded(&mut self) -> Result<StopMode, StepperError> {
        let Some(task) = self.task.take() else {
            return Ok(StopMode::None);
        };
        let (motion, result) = task.join().map_err(|_| StepperError::TaskLost { axis: self.name })?;
        self.motion = Some(motion);
        let stop = StopMode::from_u8(self.state.stop.swap(StopMode::None as u8, Ordering::AcqRel));
        result?;
        debug!(
            "Axis {}: finished at {} ({:?})",
            self.name,
            self.current_position(),
            stop
        );
        Ok(stop)
    }

    /// Start and wait
    pub fn run_to_position_steps(
        &mut self,
        steps: i64,
        mode: MovementMode,
    ) -> Result<StopMode, StepperError> {
        self.run_to_position_steps_threaded(steps, mode)?;
        self.wait_for_movement_finished_threaded()
    }

    /// Move in the axis' default movement mode
    pub fn run_steps(&mut self, steps: i64) -> Result<StopMode, StepperError> {
        self.run_to_position_steps(steps, self.movement_mode)
    }

    /// Request a stop; takes effect within one step interval
    pub fn stop(&self, mode: StopMode) {
        if mode == StopMode::None {
            return;
        }
        self.state.stop.store(mode as u8, Ordering::Release);
        debug!("Axis {}: {:?} stop requested", self.name, mode);
    }

    fn ensure_idle(&mut self) -> Result<(), StepperError> {
        if self.is_moving() {
            return Err(StepperError::Busy { axis: self.name });
        }
        // a finished task still holds the pins
        if self.task.is_some() {
            self.wait_for_movement_finished_threaded()?;
        }
        Ok(())
    }

    fn idle_motion(&mut self) -> Result<&mut Motion<P>, StepperError> {
        self.ensure_idle()?;
        self.motion
            .as_mut()
            .ok_or(StepperError::TaskLost { axis: self.name })
    }
}

impl<P: MotorPin> Drop for StepperAxis<P> {
    fn drop(&mut self) {
        self.stop(StopMode::Hard);
        if let Err(e) = self.wait_for_movement_finished_threaded() {
            warn!("Axis {}: movement ended with error on shutdown: {}", self.name, e);
        }
        if let Err(e) = self.set_motor_enabled(false) {
            warn!("Axis {}: failed to disable output on shutdown: {}", self.name, e);
        }
    }
}
