/// Components of the microscope camera station.
pub mod microscope {
    /// Board memory and display surfaces sized to the frame geometry.
    pub mod buffers;
    /// Capture state machine and polling loop.
    pub mod acquisition;
    /// Safe teardown and rebuild around buffer invalidating changes.
    pub mod reconfigure;
    /// Writing captured frames to disk.
    pub mod export;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::microscope::acquisition::*;
    pub use crate::components::microscope::buffers::*;
    pub use crate::components::microscope::export::*;
    pub use crate::components::microscope::reconfigure::*;
}
