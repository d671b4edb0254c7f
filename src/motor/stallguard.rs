// StallGuard: stall detection setup, DIAG edge notifications and homing
//
// Two independent signals exist. The DIAG pin rises on a stall but also on
// driver faults, so edges are only reported as events. Homing decides from
// the SG_RESULT register, polled while the axis cruises at max speed.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::gpio::{MotorPin, SensePin};
use super::ramp::{Direction, MovementMode, MovementPhase, StopMode};
use super::stepper::{StepperAxis, StepperError};
use super::tmc2209::{TmcError, steps_to_tstep};
use crate::config::HomingConfig;

const DIAG_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum HomingError {
    #[error("Axis {axis} travelled {travel} steps without a stall ({edge_events} DIAG edges)")]
    TravelExhausted {
        axis: &'static str,
        travel: u64,
        edge_events: usize,
    },

    #[error("Stepper error: {0}")]
    Stepper(#[from] StepperError),

    #[error("Driver error: {0}")]
    Protocol(#[from] TmcError),
}

/// Debounced rising edge on a DIAG input
#[derive(Debug, Clone, Copy)]
pub struct StallEdge {
    pub axis: &'static str,
    pub at: Instant,
}

/// Background thread watching one DIAG pin. Stops when dropped.
pub struct StallWatcher {
    axis: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StallWatcher {
    pub fn spawn<S: SensePin>(
        axis: &'static str,
        pin: S,
        debounce: Duration,
    ) -> std::io::Result<(Self, Receiver<StallEdge>)> {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("diag-{}", axis))
            .spawn(move || watch(axis, pin, debounce, &flag, &tx))?;
        info!("Watching DIAG of axis {} (debounce {:?})", axis, debounce);
        Ok((
            Self {
                axis,
                running,
                handle: Some(handle),
            },
            rx,
        ))
    }
}

fn watch<S: SensePin>(
    axis: &'static str,
    mut pin: S,
    debounce: Duration,
    running: &AtomicBool,
    tx: &Sender<StallEdge>,
) {
    let mut was_high = false;
    let mut last_event: Option<Instant> = None;
    while running.load(Ordering::Acquire) {
        let high = match pin.is_high() {
            Ok(high) => high,
            Err(e) => {
                warn!("DIAG of axis {} unreadable, watcher stopped: {:?}", axis, e);
                return;
            }
        };
        if high && !was_high {
            let now = Instant::now();
            if last_event.is_none_or(|t| now.duration_since(t) >= debounce) {
                last_event = Some(now);
                debug!("DIAG edge on axis {}", axis);
                if tx.send(StallEdge { axis, at: now }).is_err() {
                    return;
                }
            }
        }
        was_high = high;
        thread::sleep(DIAG_POLL_INTERVAL);
    }
}

impl Drop for StallWatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("DIAG watcher of axis {} panicked", self.axis);
            }
        }
    }
}

/// SGTHRS and TCOOLTHRS for a homing pass.
/// The chip flags a stall when SG_RESULT <= 2 * SGTHRS.
pub fn configure_stallguard<P: MotorPin>(
    axis: &StepperAxis<P>,
    config: &HomingConfig,
) -> Result<(), TmcError> {
    let driver = axis.driver();
    let sgthrs = (config.threshold / 2).min(u8::MAX as u16) as u8;
    driver.set_stallguard_threshold(sgthrs)?;
    let microsteps = driver.read_microstepping_resolution()?;
    let tcoolthrs = steps_to_tstep(config.min_speed, microsteps);
    driver.set_coolstep_threshold(tcoolthrs)?;
    debug!(
        "Axis {}: SGTHRS={} TCOOLTHRS={} ({} steps/s)",
        axis.name(),
        sgthrs,
        tcoolthrs,
        config.min_speed
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingReport {
    /// Axis position after the stop
    pub position: i64,
    pub travel: u64,
    /// SG_RESULT that triggered the stop
    pub stall_value: u16,
    /// DIAG edges seen during the pass, for comparison only
    pub edge_events: usize,
}

/// Drive the axis toward its end stop until SG_RESULT drops below the
/// threshold at max speed, or until `max_travel_steps` is used up.
/// On exhaustion the axis output is disabled.
pub fn home<P: MotorPin>(
    axis: &mut StepperAxis<P>,
    config: &HomingConfig,
    direction: Direction,
    edges: Option<&Receiver<StallEdge>>,
) -> Result<HomingReport, HomingError> {
    info!(
        "Homing axis {} {:?} with threshold {}",
        axis.name(),
        direction,
        config.threshold
    );
    axis.driver().set_spreadcycle(false)?;
    configure_stallguard(axis, config)?;

    let count_edges = || edges.map_or(0, |rx| rx.try_iter().count());
    count_edges(); // stale edges from before this pass
    let start = axis.current_position();
    axis.run_to_position_steps_threaded(
        config.max_travel_steps as i64 * direction.sign(),
        MovementMode::Relative,
    )?;

    let mut edge_events = 0;
    let mut stall_value = None;
    while axis.movement_phase() != MovementPhase::Standstill {
        edge_events += count_edges();
        let result = match axis.driver().get_stallguard_result() {
            Ok(result) => result,
            Err(e) => {
                axis.stop(StopMode::Hard);
                axis.wait_for_movement_finished_threaded()?;
                return Err(e.into());
            }
        };
        // the metric is meaningless while the ramp changes speed
        if axis.movement_phase() == MovementPhase::MaxSpeed && result < config.threshold {
            axis.stop(StopMode::Hard);
            stall_value = Some(result);
            break;
        }
    }
    axis.wait_for_movement_finished_threaded()?;
    edge_events += count_edges();

    let position = axis.current_position();
    let travel = (position - start).unsigned_abs();
    match stall_value {
        Some(stall_value) => {
            info!(
                "Axis {} stalled at {} (SG_RESULT {}, {} DIAG edges)",
                axis.name(),
                position,
                stall_value,
                edge_events
            );
            Ok(HomingReport {
                position,
                travel,
                stall_value,
                edge_events,
            })
        }
        None => {
            axis.set_motor_enabled(false)?;
            if edge_events > 0 {
                warn!(
                    "Axis {}: {} DIAG edges but SG_RESULT never crossed {}",
                    axis.name(),
                    edge_events,
                    config.threshold
                );
            }
            Err(HomingError::TravelExhausted {
                axis: axis.name(),
                travel,
                edge_events,
            })
        }
    }
}
