/// Standardise how requests reach the camera core from other
/// processes, such as a user interface. Provide test suite to
/// ensure interfaces are respected.
pub mod control {
    /// Parameter change requests.
    pub mod parameter;
}
