use axerrno::AxResult;

use crate::GuestVCpu;

/// The interrupt-subsystem capability the mediator invokes.
///
/// The mediator never stores the route itself; it only flips it while it
/// holds its lock, and the IRQ delivery path reads it.
pub trait IrqRouter {
    /// Claims the physical `irq` line and installs the hypervisor handler for it.
    ///
    /// Called once at platform bring-up. The line must stay disabled until
    /// [`IrqRouter::set_enabled`] is called.
    fn reserve(&self, irq: usize) -> AxResult;

    /// Enables or disables delivery of the physical `irq` line to `target`.
    ///
    /// Called with `enabled` only by the lock holder's START, and with
    /// `!enabled` by its END and after each forwarded IRQ.
    fn set_enabled(&self, irq: usize, target: GuestVCpu, enabled: bool);

    /// Injects the virtual interrupt `irq` into `target`.
    ///
    /// `target` is the lock holder that was armed when the IRQ was taken. It
    /// keeps holding the lock until this call and the disable after it have
    /// returned. The call may come from any physical CPU, so delivery to a
    /// vCPU running elsewhere is up to the implementation.
    fn inject(&self, target: GuestVCpu, irq: usize) -> AxResult;
}

/// The inter-VM communication hypercall handler.
///
/// An opaque peer of the mediator inside the dispatcher; its semantics are
/// defined by the IPC subsystem.
pub trait IpcHandler {
    /// Handles an `IPC` hypercall, returning the guest-visible result.
    fn ipc_hypercall(&self, caller: GuestVCpu, arg0: u64, arg1: u64, arg2: u64) -> isize;
}
