use crate::kernel::Network;

/// Minimal contract implemented by every protocol driven by the kernel.
/// Surrounding tooling — the scenario runner, a plotter, a server wrapper —
/// depends only on this façade, never on a protocol's internals.
///
/// `P` is the protocol's parameter record type (a flat struct of
/// integers/booleans/strings enumerating its tunables), taken by the
/// concrete constructor rather than by this trait — there is no reflection
/// layer at the core level.
pub trait Protocol: Sized {
    /// Populates nodes and schedules the initial wave of events.
    fn init(&mut self);

    /// Returns an independent instance with identical parameters.
    fn copy(&self) -> Self;

    fn network(&self) -> &Network;
    fn network_mut(&mut self) -> &mut Network;
}
