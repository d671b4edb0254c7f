// StallGuard threshold probe: run one axis and sample SG_RESULT
//
// Moves a single axis by a fixed number of steps (free-travel profile) and
// prints min/max/mean SG_RESULT for each movement phase. Pick a homing
// threshold clearly below the MAXSPEED minimum seen on a free run and above
// the values seen when the trolley hits the frame.
//
// ⚠ The trolley MOVES. Keep the path clear and start from the board centre.
//
// Usage: cargo run --example stall_threshold -- [A|B] [steps]
// Example: cargo run --example stall_threshold -- A 2000

use chess_trolley_runtime::config::{RuntimeConfig, SpeedProfile};
use chess_trolley_runtime::motor::stallguard::configure_stallguard;
use chess_trolley_runtime::motor::{
    MovementMode, MovementPhase, StepperAxis, SysfsPin, Tmc2209, TmcBus,
};

#[derive(Default)]
struct Stats {
    samples: usize,
    min: u16,
    max: u16,
    sum: u64,
}

impl Stats {
    fn add(&mut self, value: u16) {
        if self.samples == 0 {
            self.min = value;
            self.max = value;
        }
        self.samples += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value as u64;
    }

    fn print(&self, label: &str) {
        if self.samples == 0 {
            println!("  {:<13} no samples", label);
            return;
        }
        println!(
            "  {:<13} n={:<5} min={:<4} max={:<4} mean={:.0}",
            label,
            self.samples,
            self.min,
            self.max,
            self.sum as f64 / self.samples as f64
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let axis_name = args.next().unwrap_or_else(|| "A".to_string());
    let steps: i64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(2000);

    let config = RuntimeConfig::default();
    let (name, address, pins, homing) = match axis_name.to_ascii_uppercase().as_str() {
        "A" => ("A", config.bus.axis_a_address, config.pins.axis_a, &config.trolley.homing_a),
        "B" => ("B", config.bus.axis_b_address, config.pins.axis_b, &config.trolley.homing_b),
        other => return Err(format!("unknown axis {:?}, expected A or B", other).into()),
    };

    println!("StallGuard threshold probe: axis {} (driver {}), {} steps", name, address, steps);
    println!("Current homing threshold: {}", homing.threshold);
    println!();

    let bus = TmcBus::open_with_baudrate(&config.bus.port, config.bus.baudrate)?.into_shared();
    let mut axis = StepperAxis::new(
        name,
        Tmc2209::new(bus, address)?,
        SysfsPin::output(pins.step, false)?,
        SysfsPin::output(pins.dir, false)?,
        SysfsPin::output(pins.enable, true)?,
        config.driver.clone(),
    )?;
    axis.configure()?;
    axis.driver().set_spreadcycle(false)?;
    configure_stallguard(&axis, homing)?;
    let SpeedProfile {
        max_speed,
        acceleration,
    } = config.trolley.free;
    axis.set_max_speed(max_speed)?;
    axis.set_acceleration(acceleration)?;
    axis.set_motor_enabled(true)?;

    let mut accelerating = Stats::default();
    let mut max_speed_stats = Stats::default();
    let mut decelerating = Stats::default();

    axis.run_to_position_steps_threaded(steps, MovementMode::Relative)?;
    loop {
        let phase = axis.movement_phase();
        if phase == MovementPhase::Standstill {
            break;
        }
        let value = axis.driver().get_stallguard_result()?;
        match phase {
            MovementPhase::Accelerating => accelerating.add(value),
            MovementPhase::MaxSpeed => max_speed_stats.add(value),
            MovementPhase::Decelerating => decelerating.add(value),
            MovementPhase::Standstill => {}
        }
    }
    axis.wait_for_movement_finished_threaded()?;

    println!("SG_RESULT per phase:");
    accelerating.print("ACCELERATING");
    max_speed_stats.print("MAXSPEED");
    decelerating.print("DECELERATING");
    println!();
    println!("Only MAXSPEED samples are used for homing.");

    axis.set_motor_enabled(false)?;
    Ok(())
}
