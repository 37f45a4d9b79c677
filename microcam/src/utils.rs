/// Frame geometry and conversion of raw frames into images.
pub mod image;
/// Macros used by the unit tests to locate fixture files.
pub mod tests;
