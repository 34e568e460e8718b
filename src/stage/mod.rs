// Stage controller module
//
// Provides:
// - Serial transport with per-transaction locking
// - ASCII command protocol (opcodes, parameter domains, response parsing)
// - High-level stage driver API
// - Homing and centering

mod driver;
pub mod error;
pub mod homing;
pub mod protocol;
pub mod transport;

pub use driver::Stage;
pub use error::{Result, StageError};
pub use homing::{CancelToken, Clock, HomingController, HomingState, SystemClock};
pub use protocol::{BaudRate, ConfigMode, CurrentRange, Direction, Motor, StopKind};
pub use transport::{SerialLink, SerialPortLink, Transport};
