use axerrno::{ax_err, AxResult};

use crate::hal::{IpcHandler, IrqRouter};
use crate::hypercall::HyperCallDispatcher;
use crate::GuestVCpu;

/// The guest register state at a trap into the hypervisor.
///
/// Keeps the register convention in one place; nothing else in this crate
/// knows which register holds what.
pub trait TrapFrame {
    /// The general-purpose registers carrying `arg0..arg2` of a hypercall.
    const HYPERCALL_ARG_REGS: [usize; 3];

    /// The vCPU that trapped.
    fn caller(&self) -> GuestVCpu;

    /// Reads a general-purpose register.
    fn gpr(&self, reg: usize) -> u64;

    /// Sets the return value that will be delivered to the guest.
    fn set_return_value(&mut self, val: usize);
}

/// Why a guest trapped into the mailbox core.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// The vcpu performs a hypercall.
    ///
    /// The arguments stay in the frame, at [`TrapFrame::HYPERCALL_ARG_REGS`].
    Hypercall {
        /// The hypercall number, raw or as an SMCCC function id.
        nr: u64,
    },
    /// A physical interrupt arrived while the vcpu was running.
    ExternalInterrupt {
        /// The interrupt vector.
        vector: usize,
    },
}

/// Handles a trap taken by `frame`.
///
/// Hypercalls always complete with a result in the guest's return register.
/// Of the external interrupts only the mailbox IRQ is served here; other
/// vectors are reported as [`Unsupported`](axerrno::AxError::Unsupported)
/// and left untouched.
pub fn handle_trap<R, I, F>(
    dispatcher: &HyperCallDispatcher<'_, R, I>,
    frame: &mut F,
    reason: TrapReason,
) -> AxResult
where
    R: IrqRouter,
    I: IpcHandler,
    F: TrapFrame,
{
    match reason {
        TrapReason::Hypercall { nr } => {
            dispatcher.handle_hypercall(frame, nr);
            Ok(())
        }
        TrapReason::ExternalInterrupt { vector } if vector == dispatcher.mediator().irq_id() => {
            dispatcher.mediator().handle_irq(vector)
        }
        TrapReason::ExternalInterrupt { .. } => {
            ax_err!(Unsupported, "interrupt is not owned by the mailbox mediator")
        }
    }
}
