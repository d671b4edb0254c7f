// Move loop: one command per line on stdin, one JSON report per move on stdout
//
// Commands:
//   e2e4            execute a move
//   board [..8 rows..]  replace the board (JSON array, rank 8 first)
//   show            print the board
//   quit            park and exit

use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::board::Board;
use crate::config::RuntimeConfig;
use crate::motor::gpio::{MotorPin, SimPin, SysfsPin};
use crate::motor::sim::SimulatedChips;
use crate::motor::{AxisId, StepperAxis, Tmc2209, TmcBus, Trolley, TrolleyError};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Reads before the simulated chips report a stall during calibration
const SIM_READS_BEFORE_STALL: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub simulate: bool,
    pub skip_calibration: bool,
}

impl Options {
    /// Config file (or defaults) with command line overrides applied
    pub fn runtime_config(&self) -> Result<RuntimeConfig, Error> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(port) = &self.port {
            config.bus.port = port.clone();
        }
        if let Some(baudrate) = self.baudrate {
            config.bus.baudrate = baudrate;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Move(String),
    Board(Board),
    Show,
    Quit,
}

/// `None` for blank lines and comments
pub fn parse_command(line: &str) -> Result<Option<Command>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let command = match line {
        "quit" | "exit" => Command::Quit,
        "show" => Command::Show,
        _ => match line.strip_prefix("board") {
            Some(rows) => Command::Board(serde_json::from_str(rows.trim())?),
            None => Command::Move(line.to_string()),
        },
    };
    Ok(Some(command))
}

/// Trolley on real hardware: UART bus plus sysfs GPIO
pub fn hardware_trolley(config: &RuntimeConfig) -> Result<Trolley<SysfsPin>, Error> {
    info!("Opening driver bus on {} at {} baud", config.bus.port, config.bus.baudrate);
    let bus = TmcBus::open_with_baudrate(&config.bus.port, config.bus.baudrate)?
        .with_max_attempts(config.bus.max_attempts)
        .into_shared();
    let pins = &config.pins;

    let axis_a = StepperAxis::new(
        "A",
        Tmc2209::new(bus.clone(), config.bus.axis_a_address)?,
        SysfsPin::output(pins.axis_a.step, false)?,
        SysfsPin::output(pins.axis_a.dir, false)?,
        SysfsPin::output(pins.axis_a.enable, true)?,
        config.driver.clone(),
    )?;
    let axis_b = StepperAxis::new(
        "B",
        Tmc2209::new(bus, config.bus.axis_b_address)?,
        SysfsPin::output(pins.axis_b.step, false)?,
        SysfsPin::output(pins.axis_b.dir, false)?,
        SysfsPin::output(pins.axis_b.enable, true)?,
        config.driver.clone(),
    )?;
    let magnet = SysfsPin::output(pins.magnet, false)?;
    let mut trolley = Trolley::new(axis_a, axis_b, magnet, config.trolley.clone())?;

    for (id, diag) in [(AxisId::A, pins.axis_a.diag), (AxisId::B, pins.axis_b.diag)] {
        if let Some(pin) = diag {
            trolley.watch_diag(id, SysfsPin::input(pin)?)?;
        }
    }
    Ok(trolley)
}

/// Trolley on simulated chips and pins. The chips report a stall after a
/// while so calibration completes.
pub fn simulated_trolley(config: &RuntimeConfig) -> Result<(SimulatedChips, Trolley<SimPin>), Error> {
    info!("Running on simulated drivers");
    let chips = SimulatedChips::new();
    for address in [config.bus.axis_a_address, config.bus.axis_b_address] {
        chips.script_stallguard(
            address,
            std::iter::repeat_n(400, SIM_READS_BEFORE_STALL).chain([0]),
        );
    }
    let bus = TmcBus::from_transport(chips.clone())
        .with_max_attempts(config.bus.max_attempts)
        .into_shared();

    let axis = |name: &'static str, address: u8| -> Result<StepperAxis<SimPin>, Error> {
        Ok(StepperAxis::new(
            name,
            Tmc2209::new(bus.clone(), address)?,
            SimPin::new(),
            SimPin::new(),
            SimPin::new(),
            config.driver.clone(),
        )?)
    };
    let axis_a = axis("A", config.bus.axis_a_address)?;
    let axis_b = axis("B", config.bus.axis_b_address)?;
    let trolley = Trolley::new(axis_a, axis_b, SimPin::new(), config.trolley.clone())?;
    Ok((chips, trolley))
}

/// Bring the trolley up, then execute commands until input ends
pub fn serve<P: MotorPin>(
    trolley: &mut Trolley<P>,
    input: impl BufRead,
    mut output: impl Write,
    skip_calibration: bool,
) -> Result<(), Error> {
    trolley.configure()?;
    if skip_calibration {
        warn!("Skipping calibration, assuming the trolley sits on h8");
    } else {
        trolley.calibrate()?;
    }
    trolley.take_initial_position()?;
    info!("Ready for moves");

    for line in input.lines() {
        let line = line?;
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("Rejected board: {}", e);
                continue;
            }
        };
        match command {
            Command::Quit => break,
            Command::Show => writeln!(output, "{}", trolley.board())?,
            Command::Board(board) => {
                trolley.set_board(board);
                info!("Board replaced");
            }
            Command::Move(notation) => match trolley.make_move(&notation) {
                Ok(report) => writeln!(output, "{}", serde_json::to_string(&report)?)?,
                Err(TrolleyError::Format(e)) => warn!("{}", e),
                // the trolley is already halted
                Err(e) => return Err(e.into()),
            },
        }
        output.flush()?;
    }
    Ok(())
}

pub fn run(options: Options) -> Result<(), Error> {
    let config = options.runtime_config()?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    if options.simulate {
        let (_chips, mut trolley) = simulated_trolley(&config)?;
        serve(&mut trolley, stdin.lock(), stdout.lock(), options.skip_calibration)
    } else {
        let mut trolley = hardware_trolley(&config)?;
        serve(&mut trolley, stdin.lock(), stdout.lock(), options.skip_calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedProfile;
    use crate::messages::MoveReport;
    use std::io::Cursor;

    fn fast_config() -> RuntimeConfig {
        let fast = SpeedProfile {
            max_speed: 20_000.0,
            acceleration: 1_000_000.0,
        };
        let mut config = RuntimeConfig::default();
        config.driver.max_speed = fast.max_speed;
        config.driver.acceleration = fast.acceleration;
        config.trolley.square_steps = 10;
        config.trolley.diagonal_steps = 20;
        config.trolley.free = fast;
        config.trolley.loaded = fast;
        config.trolley.magnet_settle_ms = 0;
        config
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("# note").unwrap(), None);
        assert_eq!(parse_command("quit").unwrap(), Some(Command::Quit));
        assert_eq!(
            parse_command(" e2e4 ").unwrap(),
            Some(Command::Move("e2e4".to_string()))
        );
        let json = serde_json::to_string(&Board::starting()).unwrap();
        assert_eq!(
            parse_command(&format!("board {}", json)).unwrap(),
            Some(Command::Board(Board::starting()))
        );
        assert!(parse_command("board [\"x\"]").is_err());
    }

    #[test]
    fn test_options_override_config() {
        let options = Options {
            port: Some("/dev/ttyAMA0".to_string()),
            baudrate: Some(57_600),
            ..Options::default()
        };
        let config = options.runtime_config().unwrap();
        assert_eq!(config.bus.port, "/dev/ttyAMA0");
        assert_eq!(config.bus.baudrate, 57_600);
    }

    #[test]
    fn test_serve_reports_moves_and_skips_bad_input() {
        let (_chips, mut trolley) = simulated_trolley(&fast_config()).unwrap();
        let input = Cursor::new("e2e4\nxx\n\ne7e5\nquit\ne5e4\n");
        let mut output = Vec::new();
        serve(&mut trolley, input, &mut output, true).unwrap();

        let text = String::from_utf8(output).unwrap();
        let reports: Vec<MoveReport> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].executed.to_string(), "e7e5");
        assert_eq!(trolley.board().piece_at("e5".parse().unwrap()), 'p');
    }

    #[test]
    fn test_serve_calibrates_on_simulated_chips() {
        let mut config = fast_config();
        config.trolley.homing_a.max_travel_steps = 100_000;
        config.trolley.homing_b.max_travel_steps = 100_000;
        let (_chips, mut trolley) = simulated_trolley(&config).unwrap();
        serve(&mut trolley, Cursor::new("quit\n"), std::io::sink(), false).unwrap();
        assert_eq!(trolley.position(), "d8".parse().unwrap());
    }
}
