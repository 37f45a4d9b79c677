/// Hardware the camera core drives: the sensor head behind its serial
/// command protocol and the frame acquisition board.
pub mod hardware {
    /// Command protocol to the sensor head and the updater boundary.
    pub mod camera;
    /// Capability interface to the frame acquisition board.
    pub mod framegrabber;
}

/// Device state that lives only in software.
pub mod software {
    /// Table of device parameters and their validation rules.
    pub mod parameters;
}

/// Simulated board and updater for running without hardware.
pub mod simulated;
