// Motion control for the CoreXY chess trolley
//
// Provides:
// - TMC2209 single-wire UART register protocol (shared bus, retries)
// - Trapezoidal step ramp and threaded axis controllers
// - StallGuard homing with DIAG edge notifications
// - CoreXY kinematics and path planning around pieces
// - The trolley itself: two axes plus the electromagnet
// - GPIO seam and simulated chips/pins for running without hardware

mod driver;
pub mod gpio;
pub mod kinematics;
pub mod ramp;
pub mod sim;
pub mod stallguard;
pub mod stepper;
pub mod tmc2209;

pub use driver::{AxisId, Trolley, TrolleyError};
pub use gpio::{MotorPin, SensePin, SimPin, SysfsPin};
pub use ramp::{Direction, MovementMode, MovementPhase, StopMode};
pub use stallguard::{HomingError, HomingReport, StallEdge, StallWatcher};
pub use stepper::{StepperAxis, StepperError};
pub use tmc2209::{Register, Tmc2209, TmcBus, TmcError};
