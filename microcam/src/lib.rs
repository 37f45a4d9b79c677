/**
The microcam control core drives a high speed CMOS camera head and its frame
acquisition board. The head is configured through a serial command protocol
carried by an external updater program, while the board captures frames into
host memory. The core keeps the two in step: a parameter is only committed
once the head accepted it, and any change that alters frame size or timing
tears the board buffers down and rebuilds them before capture resumes.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall control system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Errors shared by every layer of the core.
pub mod error;
/// Subscriber set up for the system binaries.
pub mod logging;
/// Message structure for communication into the control
/// system from other processes.
pub mod messages;
/// Development utilities for working with serialisation and
/// image information.
pub mod utils;

pub use error::{CameraError, Result};
