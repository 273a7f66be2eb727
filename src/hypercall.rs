use crate::error::HyperCallError;
use crate::hal::{IpcHandler, IrqRouter};
use crate::mediator::DeviceMediator;
use crate::trap::TrapFrame;
use crate::GuestVCpu;

/// SMCCC: fast (atomic) call.
pub const SMCCC_FAST_CALL: u64 = 1 << 31;
/// SMCCC: 64-bit calling convention.
pub const SMCCC_64: u64 = 1 << 30;
/// SMCCC: service owner field.
pub const SMCCC_OWNER_SHIFT: u64 = 24;
/// SMCCC: width of the service owner field, applied after the shift.
pub const SMCCC_OWNER_MASK: u64 = 0x3f;
/// SMCCC: vendor-specific hypervisor service calls.
pub const SMCCC_OWNER_VENDOR_HYP: u64 = 6;
/// SMCCC: function number.
pub const SMCCC_FUNC_MASK: u64 = 0xffff;

/// Builds the SMCCC function id a guest puts in `x0` for hypercall `func`.
pub const fn smccc_function_id(func: u64) -> u64 {
    SMCCC_FAST_CALL
        | SMCCC_64
        | (SMCCC_OWNER_VENDOR_HYP << SMCCC_OWNER_SHIFT)
        | (func & SMCCC_FUNC_MASK)
}

/// Reduces a vendor-hypervisor SMCCC function id to its function number.
///
/// Anything else is taken as a raw hypercall id.
pub const fn decode_hypercall_nr(nr: u64) -> u64 {
    let owner = (nr >> SMCCC_OWNER_SHIFT) & SMCCC_OWNER_MASK;
    if nr & SMCCC_FAST_CALL != 0 && owner == SMCCC_OWNER_VENDOR_HYP {
        nr & SMCCC_FUNC_MASK
    } else {
        nr
    }
}

/// Hypercall ids understood by the dispatcher.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HyperCallId {
    /// Reserved, always rejected.
    Invalid = 0,
    /// Inter-VM communication.
    Ipc = 1,
    /// Raspberry Pi firmware mailbox arbitration.
    RpiFirmware = 2,
}

impl HyperCallId {
    /// Decodes a hypercall id; `None` if it is not one of ours.
    pub const fn from_nr(nr: u64) -> Option<Self> {
        match nr {
            0 => Some(Self::Invalid),
            1 => Some(Self::Ipc),
            2 => Some(Self::RpiFirmware),
            _ => None,
        }
    }
}

/// One guest hypercall, as read at the trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HyperCallRequest {
    /// The hypercall id.
    pub id: u64,
    /// `arg0..arg2`.
    pub args: [u64; 3],
}

impl HyperCallRequest {
    /// Create a new [`HyperCallRequest`].
    pub const fn new(id: u64, arg0: u64, arg1: u64, arg2: u64) -> Self {
        Self {
            id,
            args: [arg0, arg1, arg2],
        }
    }

    /// Reads the request for hypercall `nr` out of the guest registers.
    pub fn from_frame<F: TrapFrame>(frame: &F, nr: u64) -> Self {
        let [r0, r1, r2] = F::HYPERCALL_ARG_REGS;
        Self::new(
            decode_hypercall_nr(nr),
            frame.gpr(r0),
            frame.gpr(r1),
            frame.gpr(r2),
        )
    }
}

/// Routes guest hypercalls to their handlers.
///
/// The dispatcher owns no shared mutable state and takes no lock itself, so
/// every core can dispatch concurrently.
pub struct HyperCallDispatcher<'a, R: IrqRouter, I: IpcHandler> {
    mediator: &'a DeviceMediator<R>,
    ipc: &'a I,
}

impl<'a, R: IrqRouter, I: IpcHandler> HyperCallDispatcher<'a, R, I> {
    /// Create a new [`HyperCallDispatcher`].
    pub const fn new(mediator: &'a DeviceMediator<R>, ipc: &'a I) -> Self {
        Self { mediator, ipc }
    }

    /// The mailbox mediator behind `RPI_FIRMWARE`.
    pub fn mediator(&self) -> &'a DeviceMediator<R> {
        self.mediator
    }

    /// Handles `req` on behalf of `caller` and returns the guest-visible result.
    ///
    /// Negative values are [`HyperCallError`] codes. An unknown id is not
    /// fatal: it is logged and reported back to the caller.
    pub fn dispatch(&self, caller: GuestVCpu, req: &HyperCallRequest) -> isize {
        let [arg0, arg1, arg2] = req.args;
        match HyperCallId::from_nr(req.id) {
            Some(HyperCallId::Ipc) => self.ipc.ipc_hypercall(caller, arg0, arg1, arg2),
            Some(HyperCallId::RpiFirmware) => {
                match self.mediator.hypercall(caller, arg0, arg1, arg2) {
                    Ok(ret) => ret as isize,
                    Err(err) => HyperCallError::from(err).to_guest(),
                }
            }
            Some(HyperCallId::Invalid) | None => {
                warn!("{}: unknown hypercall id {}", caller, req.id);
                HyperCallError::InvalidId.to_guest()
            }
        }
    }

    /// Serves hypercall `nr` from `frame` and writes the result back to it.
    pub fn handle_hypercall<F: TrapFrame>(&self, frame: &mut F, nr: u64) -> isize {
        let req = HyperCallRequest::from_frame(frame, nr);
        let ret = self.dispatch(frame.caller(), &req);
        frame.set_return_value(ret as usize);
        ret
    }
}
