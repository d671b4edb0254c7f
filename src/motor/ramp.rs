// Trapezoidal step timing (constant acceleration, cruise, constant deceleration)
//
// Step intervals follow the recurrence from D. Austin, "Generate stepper-motor
// speed profiles in real time": c_n = c_{n-1} - 2 c_{n-1} / (4n + 1), where n
// is positive while accelerating and is driven negative to decelerate.
// Pure math, no I/O and no clock: the movement thread owns the timing.

use std::time::Duration;

/// Optional first-step correction (Austin, eq. 15). Without it the
/// acceleration ramp takes about twice the steps of the deceleration ramp.
const C0_CORRECTION: f64 = 0.676;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementPhase {
    #[default]
    Standstill = 0,
    Accelerating = 1,
    MaxSpeed = 2,
    Decelerating = 3,
}

impl MovementPhase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MovementPhase::Accelerating,
            2 => MovementPhase::MaxSpeed,
            3 => MovementPhase::Decelerating,
            _ => MovementPhase::Standstill,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// No stop requested
    #[default]
    None = 0,
    /// Ramp down to zero speed, then halt
    Soft = 1,
    /// Halt at the next step regardless of speed
    Hard = 2,
}

impl StopMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => StopMode::Soft,
            2 => StopMode::Hard,
            _ => StopMode::None,
        }
    }
}

/// Whether a step count is a target position or an offset from the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementMode {
    #[default]
    Absolute,
    Relative,
}

/// Rotation sense; positive step counts are clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Cw,
    Ccw,
}

impl Direction {
    pub fn from_distance(distance: i64) -> Self {
        if distance > 0 { Direction::Cw } else { Direction::Ccw }
    }

    pub fn sign(self) -> i64 {
        match self {
            Direction::Cw => 1,
            Direction::Ccw => -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ramp {
    acceleration: f64,
    max_speed: f64,
    first_step_correction: bool,
    /// Initial step interval (us)
    c0: f64,
    /// Floor step interval at max speed (us)
    cmin: f64,
    /// Last step interval (us)
    cn: f64,
    /// Signed step counter
    n: i64,
    /// Steps per second, signed
    speed: f64,
    /// Interval until the next step (us), 0 when stopped
    step_interval: f64,
    direction: Direction,
    phase: MovementPhase,
}

impl Ramp {
    /// Both values must be positive and finite (checked by `DriverConfig::validate`)
    pub fn new(max_speed: f64, acceleration: f64) -> Self {
        let mut ramp = Self {
            acceleration: 1.0,
            max_speed: 1.0,
            first_step_correction: false,
            c0: 0.0,
            cmin: 0.0,
            cn: 0.0,
            n: 0,
            speed: 0.0,
            step_interval: 0.0,
            direction: Direction::Cw,
            phase: MovementPhase::Standstill,
        };
        ramp.set_max_speed(max_speed);
        ramp.set_acceleration(acceleration);
        ramp
    }

    /// Scale the first interval by 0.676 so both ramps take the same number
    /// of steps. Off by default: c0 = 1e6 * sqrt(2 / a).
    pub fn with_first_step_correction(mut self, on: bool) -> Self {
        self.first_step_correction = on;
        self.c0 = self.initial_interval(self.acceleration);
        self
    }

    fn initial_interval(&self, acceleration: f64) -> f64 {
        let c0 = (2.0 / acceleration).sqrt() * 1_000_000.0;
        if self.first_step_correction { c0 * C0_CORRECTION } else { c0 }
    }

    pub fn set_max_speed(&mut self, speed: f64) {
        let speed = speed.abs();
        if speed == 0.0 {
            return;
        }
        self.max_speed = speed;
        self.cmin = 1_000_000.0 / speed;
        if self.n > 0 {
            // keep the position on the ramp consistent with the current speed
            self.n = self.steps_to_stop() as i64;
        }
    }

    pub fn set_acceleration(&mut self, acceleration: f64) {
        let acceleration = acceleration.abs();
        if acceleration == 0.0 {
            return;
        }
        self.n = (self.n as f64 * (self.acceleration / acceleration)) as i64;
        self.c0 = self.initial_interval(acceleration);
        self.acceleration = acceleration;
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> MovementPhase {
        self.phase
    }

    /// Interval until the next step, `None` once the ramp has come to rest
    pub fn step_interval(&self) -> Option<Duration> {
        (self.step_interval > 0.0).then(|| Duration::from_nanos((self.step_interval * 1000.0).round() as u64))
    }

    /// Steps needed to brake from the current speed: v^2 / 2a
    pub fn steps_to_stop(&self) -> f64 {
        (self.speed * self.speed) / (2.0 * self.acceleration)
    }

    /// Back to rest without touching speed limits
    pub fn reset(&mut self) {
        self.step_interval = 0.0;
        self.speed = 0.0;
        self.n = 0;
        self.phase = MovementPhase::Standstill;
    }

    /// Recompute speed and the next interval given what is left to travel.
    /// Called once before the first step and after every step.
    pub fn compute_new_speed(&mut self, distance_to_go: i64, soft_stop: bool) -> MovementPhase {
        let steps_to_stop = self.steps_to_stop();

        if (distance_to_go == 0 && steps_to_stop <= 2.0) || (soft_stop && steps_to_stop <= 1.0) {
            self.reset();
            return self.phase;
        }

        if distance_to_go != 0 {
            let toward = Direction::from_distance(distance_to_go);
            let remaining = distance_to_go.unsigned_abs() as f64;
            if self.n > 0 {
                // accelerating or cruising: brake now, or moving the wrong way
                if steps_to_stop >= remaining || self.direction != toward || soft_stop {
                    self.n = -(steps_to_stop as i64);
                    self.phase = MovementPhase::Decelerating;
                }
            } else if self.n < 0 {
                // braking: enough room to speed up again
                if steps_to_stop < remaining && self.direction == toward && !soft_stop {
                    self.n = -self.n;
                    self.phase = MovementPhase::Accelerating;
                }
            }
        }

        if self.n == 0 {
            // first step from rest
            self.cn = self.c0;
            self.direction = Direction::from_distance(distance_to_go);
            self.phase = MovementPhase::Accelerating;
        } else {
            self.cn -= (2.0 * self.cn) / ((4.0 * self.n as f64) + 1.0);
            self.cn = self.cn.max(self.cmin);
            if self.cn == self.cmin {
                self.phase = MovementPhase::MaxSpeed;
            }
        }
        self.n += 1;
        self.step_interval = self.cn;
        self.speed = 1_000_000.0 / self.cn * self.direction.sign() as f64;
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Profile {
        position: i64,
        phases: Vec<MovementPhase>,
        seconds: f64,
    }

    /// Run the ramp without a clock until it comes to rest, stopping softly
    /// after `soft_after` steps
    fn run_profile(mut ramp: Ramp, delta: i64, soft_after: Option<usize>) -> (Ramp, Profile) {
        let mut position = 0i64;
        let mut phases = Vec::new();
        let mut seconds = 0.0;
        ramp.compute_new_speed(delta - position, false);
        while let Some(interval) = ramp.step_interval() {
            seconds += interval.as_secs_f64();
            position += ramp.direction().sign();
            let soft = soft_after.is_some_and(|n| phases.len() + 1 >= n);
            phases.push(ramp.compute_new_speed(delta - position, soft));
        }
        (ramp, Profile { position, phases, seconds })
    }

    fn count(phases: &[MovementPhase], phase: MovementPhase) -> usize {
        phases.iter().filter(|p| **p == phase).count()
    }

    #[test]
    fn test_phase_order_for_long_move() {
        let (_, profile) = run_profile(Ramp::new(1000.0, 1000.0), 4040, None);
        assert_eq!(profile.position, 4040);

        let first_max = profile.phases.iter().position(|p| *p == MovementPhase::MaxSpeed).unwrap();
        let first_decel = profile.phases.iter().position(|p| *p == MovementPhase::Decelerating).unwrap();
        assert!(profile.phases[..first_max].iter().all(|p| *p == MovementPhase::Accelerating));
        assert!(first_max < first_decel);
        assert_eq!(profile.phases.last(), Some(&MovementPhase::Standstill));
    }

    #[test]
    fn test_corrected_ramp_is_symmetric() {
        let ramp = Ramp::new(1000.0, 1000.0).with_first_step_correction(true);
        let (_, profile) = run_profile(ramp, 4040, None);
        let accel = count(&profile.phases, MovementPhase::Accelerating) as i64;
        let decel = count(&profile.phases, MovementPhase::Decelerating) as i64;
        assert!((accel - decel).abs() <= 2, "accel={accel} decel={decel}");

        let ramp = Ramp::new(500.0, 300.0).with_first_step_correction(true);
        let (_, profile) = run_profile(ramp, 1010, None);
        let accel = count(&profile.phases, MovementPhase::Accelerating) as i64;
        let decel = count(&profile.phases, MovementPhase::Decelerating) as i64;
        assert!((accel - decel).abs() <= 2, "accel={accel} decel={decel}");
    }

    #[test]
    fn test_uncorrected_ramp_accelerates_longer() {
        let (_, profile) = run_profile(Ramp::new(1000.0, 1000.0), 4040, None);
        let accel = count(&profile.phases, MovementPhase::Accelerating);
        let decel = count(&profile.phases, MovementPhase::Decelerating);
        assert!(accel > decel, "accel={accel} decel={decel}");
        assert!((decel as i64 - 500).abs() <= 2);
    }

    #[test]
    fn test_negative_move() {
        let (ramp, profile) = run_profile(Ramp::new(1000.0, 1000.0), -3, None);
        assert_eq!(profile.position, -3);
        assert_eq!(ramp.speed(), 0.0);
        assert_eq!(ramp.direction(), Direction::Ccw);
    }

    #[test]
    fn test_zero_move_never_steps() {
        let mut ramp = Ramp::new(1000.0, 1000.0);
        assert_eq!(ramp.compute_new_speed(0, false), MovementPhase::Standstill);
        assert!(ramp.step_interval().is_none());
    }

    #[test]
    fn test_soft_stop_decelerates_before_target() {
        let (ramp, profile) = run_profile(Ramp::new(2000.0, 20000.0), 5000, Some(300));
        assert!(profile.position < 5000);
        assert!(profile.position > 300);
        assert_eq!(ramp.speed(), 0.0);
        assert_eq!(profile.phases.last(), Some(&MovementPhase::Standstill));
        let last_moving = profile.phases[profile.phases.len() - 2];
        assert_eq!(last_moving, MovementPhase::Decelerating);
    }

    #[test]
    fn test_cruise_interval_matches_max_speed() {
        let mut ramp = Ramp::new(2000.0, 1_000_000.0);
        let mut phase = ramp.compute_new_speed(500, false);
        let mut distance = 500;
        while phase != MovementPhase::MaxSpeed {
            distance -= 1;
            phase = ramp.compute_new_speed(distance, false);
        }
        assert_eq!(ramp.step_interval(), Some(Duration::from_micros(500)));
        assert_eq!(ramp.speed(), 2000.0);
    }

    #[test]
    fn test_first_interval() {
        let mut ramp = Ramp::new(1000.0, 1000.0);
        ramp.compute_new_speed(100, false);
        let expected = (2.0f64 / 1000.0).sqrt();
        let actual = ramp.step_interval().unwrap().as_secs_f64();
        assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");

        let mut ramp = Ramp::new(1000.0, 1000.0).with_first_step_correction(true);
        ramp.compute_new_speed(100, false);
        let actual = ramp.step_interval().unwrap().as_secs_f64();
        assert!((actual - 0.676 * expected).abs() < 1e-6);
    }

    #[test]
    fn test_correction_survives_acceleration_change() {
        let mut ramp = Ramp::new(1000.0, 1000.0).with_first_step_correction(true);
        ramp.set_acceleration(4000.0);
        ramp.compute_new_speed(100, false);
        let expected = 0.676 * (2.0f64 / 4000.0).sqrt();
        let actual = ramp.step_interval().unwrap().as_secs_f64();
        assert!((actual - expected).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn prop_converges_to_target(
            max_speed in 50.0f64..5000.0,
            acceleration in 100.0f64..100_000.0,
            delta in -2000i64..2000,
            corrected in any::<bool>(),
        ) {
            let ramp = Ramp::new(max_speed, acceleration).with_first_step_correction(corrected);
            let (ramp, profile) = run_profile(ramp, delta, None);
            prop_assert_eq!(profile.position, delta);
            prop_assert_eq!(profile.phases.len() as u64, delta.unsigned_abs());
            prop_assert_eq!(ramp.speed(), 0.0);
            prop_assert!(ramp.step_interval().is_none());
            prop_assert!(profile.seconds.is_finite());
        }
    }
}
