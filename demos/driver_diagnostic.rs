// Driver diagnostic: READ-ONLY check of the TMC2209 bus
//
// Reads the status and configuration registers from every address on the
// bus, then dumps the raw register file. Nothing is written, no pin is touched, no motor moves.
// Use this first when bringing up a new board.
//
// Usage: cargo run --example driver_diagnostic -- [port]
// Example: cargo run --example driver_diagnostic -- /dev/serial0

use chess_trolley_runtime::config::{AXIS_A_ADDRESS, AXIS_B_ADDRESS, BUS_PORT};
use chess_trolley_runtime::motor::tmc2209::{MAX_ADDRESS, Register, Tmc2209, TmcBus, bits};

fn axis_label(address: u8) -> &'static str {
    match address {
        AXIS_A_ADDRESS => "axis A",
        AXIS_B_ADDRESS => "axis B",
        _ => "unused",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let port = std::env::args().nth(1).unwrap_or_else(|| BUS_PORT.to_string());

    println!("TMC2209 driver diagnostic (READ-ONLY)");
    println!("Serial port: {}", port);
    println!();

    println!("Step 1: Opening serial port...");
    let bus = match TmcBus::open(&port) {
        Ok(bus) => bus.into_shared(),
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Enable the UART (enable_uart=1) and disable the serial console");
            println!("  - Check that the 1k resistor between TX and RX is fitted");
            return Err(e.into());
        }
    };
    println!("  ✓ Serial port opened");
    println!();

    println!("Step 2: Probing addresses 0-{}...", MAX_ADDRESS);
    let mut found = Vec::new();
    for address in 0..=MAX_ADDRESS {
        let driver = Tmc2209::new(bus.clone(), address)?;
        match driver.read_ioin() {
            Ok(ioin) => {
                println!(
                    "  Address {} ({}): ✓ version 0x{:02X}",
                    address,
                    axis_label(address),
                    ioin.version
                );
                found.push((driver, ioin));
            }
            Err(e) => println!("  Address {} ({}): ✗ {}", address, axis_label(address), e),
        }
    }
    println!();

    if found.is_empty() {
        println!("⚠ No driver answered. Check VIO/VM power and the PDN_UART wiring.");
        return Ok(());
    }

    println!("Step 3: Reading registers...");
    println!();
    for (driver, ioin) in &found {
        println!("  === Driver {} ({}) ===", driver.address(), axis_label(driver.address()));
        println!(
            "    IOIN:       ENN={} MS1={} MS2={} DIAG={} DIR={} STEP={}",
            ioin.enn as u8, ioin.ms1 as u8, ioin.ms2 as u8, ioin.diag as u8, ioin.dir as u8, ioin.step as u8
        );

        match driver.read_gconf() {
            Ok(gconf) => println!(
                "    GCONF:      0x{:08X} (spreadcycle={} shaft={} internal_rsense={})",
                gconf,
                gconf & bits::gconf::EN_SPREADCYCLE != 0,
                gconf & bits::gconf::SHAFT != 0,
                gconf & bits::gconf::INTERNAL_RSENSE != 0
            ),
            Err(e) => println!("    GCONF:      ERROR - {}", e),
        }

        match (driver.read_chopconf(), driver.read_microstepping_resolution()) {
            (Ok(chopconf), Ok(microsteps)) => println!(
                "    CHOPCONF:   0x{:08X} ({} microsteps, vsense={}, intpol={})",
                chopconf,
                microsteps,
                chopconf & bits::chopconf::VSENSE != 0,
                chopconf & bits::chopconf::INTPOL != 0
            ),
            _ => println!("    CHOPCONF:   ERROR"),
        }

        match driver.read_drv_status() {
            Ok(status) => {
                println!(
                    "    DRV_STATUS: standstill={} stealth={} CS_ACTUAL={}",
                    status.standstill, status.stealth, status.cs_actual
                );
                if status.has_fault() {
                    println!("    ⚠ fault flags: {:?}", status);
                }
            }
            Err(e) => println!("    DRV_STATUS: ERROR - {}", e),
        }

        match driver.read_gstat() {
            Ok(gstat) => println!(
                "    GSTAT:      reset={} drv_err={} uv_cp={}",
                gstat & bits::gstat::RESET != 0,
                gstat & bits::gstat::DRV_ERR != 0,
                gstat & bits::gstat::UV_CP != 0
            ),
            Err(e) => println!("    GSTAT:      ERROR - {}", e),
        }

        match driver.get_interface_transmission_counter() {
            Ok(count) => println!("    IFCNT:      {}", count),
            Err(e) => println!("    IFCNT:      ERROR - {}", e),
        }

        match (driver.get_tstep(), driver.get_microstep_counter()) {
            (Ok(tstep), Ok(mscnt)) => println!("    TSTEP:      {} (MSCNT={})", tstep, mscnt),
            _ => println!("    TSTEP:      ERROR"),
        }

        match (driver.get_interpolation(), driver.get_internal_rsense()) {
            (Ok(intpol), Ok(rsense)) => {
                println!("    Settings:   interpolation={} internal_rsense={}", intpol, rsense)
            }
            _ => println!("    Settings:   ERROR"),
        }
        println!();
    }

    println!("Step 4: Raw register dump (write-only registers read back as garbage)...");
    for (driver, _) in &found {
        println!("  Driver {}:", driver.address());
        for register in Register::ALL {
            match driver.read(register) {
                Ok(value) => println!("    0x{:02X} {:<11} 0x{:08X}", register as u8, format!("{:?}", register), value),
                Err(e) => println!("    0x{:02X} {:<11} ERROR - {}", register as u8, format!("{:?}", register), e),
            }
        }
    }
    println!();

    println!("Diagnostic complete.");
    println!("Next step: run 'cargo run --example stall_threshold' with the belts fitted");
    Ok(())
}
