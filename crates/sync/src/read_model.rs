//! Read model trait for locally cached views.

/// A read model providing query access to data owned by another subsystem.
///
/// Read models are refreshed from inbound events and never feed back into
/// stock quantities.
pub trait ReadModel: Send + Sync {
    /// Returns the name of this read model.
    fn name(&self) -> &'static str;

    /// Returns the number of entries in this read model.
    fn count(&self) -> usize;
}
