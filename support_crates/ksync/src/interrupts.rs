/// Access to the interrupt enable state of the executing core.
///
/// The functions are associated functions rather than methods so that lock types can name an implementation as a
/// type parameter and still be constructed in `const` context.
pub trait InterruptMask {
    /// Mask interrupts and return whether they were enabled before.
    fn disable() -> bool;

    /// Re-enable interrupts if `was_enabled` is set.
    fn restore(was_enabled: bool);
}

/// An [`InterruptMask`] for environments without interrupts, e.g. when running on a hosted target.
#[derive(Debug)]
pub struct NoInterruptMask;

impl InterruptMask for NoInterruptMask {
    #[inline]
    fn disable() -> bool {
        false
    }

    #[inline]
    fn restore(_was_enabled: bool) {}
}
