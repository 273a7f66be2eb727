//! The guest side of the mailbox protocol.
//!
//! A guest driver wraps every firmware transaction in START/END hypercalls:
//! the hypervisor lock keeps other VMs off the mailbox, the local
//! transaction lock keeps the guest's own callers in line.

use core::time::Duration;

use axerrno::{AxError, AxResult};
use memory_addr::PhysAddr;
use spin::Mutex;

use crate::hypercall::HyperCallId;
use crate::mediator::MailboxOp;

/// How long a guest waits for the mailbox to signal completion.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Required alignment of a firmware property buffer.
pub const MBOX_BUFFER_ALIGN: usize = 16;
const MBOX_CHAN_MASK: u32 = 0xf;

/// Encodes a mailbox message: buffer address in the upper bits, channel in the low nibble.
///
/// `None` if `data` is not a 16-byte aligned address below 4 GiB, which the
/// mailbox cannot carry.
pub fn mbox_msg(chan: u8, data: PhysAddr) -> Option<u32> {
    if !data.is_aligned(MBOX_BUFFER_ALIGN) {
        return None;
    }
    let addr = u32::try_from(data.as_usize()).ok()?;
    Some(addr | (chan as u32 & MBOX_CHAN_MASK))
}

/// The guest's trap into the hypervisor.
pub trait HyperCall {
    /// Issues hypercall `id` and returns the signed result.
    fn hypercall(&self, id: HyperCallId, arg0: u64, arg1: u64, arg2: u64) -> isize;
}

/// `hvc #0` with the SMCCC vendor-hypervisor function id in `x0` and the
/// arguments in `x1..x3`; the result comes back in `x0`.
#[cfg(target_arch = "aarch64")]
#[derive(Clone, Copy, Debug, Default)]
pub struct SmcccHvc;

#[cfg(target_arch = "aarch64")]
impl HyperCall for SmcccHvc {
    fn hypercall(&self, id: HyperCallId, arg0: u64, arg1: u64, arg2: u64) -> isize {
        let mut x0 = crate::hypercall::smccc_function_id(id as u64);
        // SAFETY: the hypervisor only writes x0..x3 and returns to the next instruction.
        unsafe {
            core::arch::asm!(
                "hvc #0",
                inout("x0") x0,
                inout("x1") arg0 => _,
                inout("x2") arg1 => _,
                inout("x3") arg2 => _,
                options(nostack),
            );
        }
        x0 as isize
    }
}

/// The physical mailbox as seen by the guest driver.
pub trait MailboxChannel {
    /// Forgets a completion left over from an earlier transaction.
    fn reinit_completion(&self);

    /// Writes `message` to the mailbox.
    fn send(&self, message: u32) -> AxResult;

    /// Waits until the mailbox IRQ signals completion; `false` on timeout.
    fn wait_completion(&self, timeout: Duration) -> bool;
}

/// Why a firmware transaction failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionError {
    /// The property buffer is not a 16-byte aligned 32-bit bus address.
    InvalidBuffer,
    /// START was refused; the mailbox was not touched.
    Rejected(isize),
    /// The mailbox refused the message.
    Send(AxError),
    /// The mailbox did not complete in time.
    Timeout,
    /// END was refused.
    ReleaseFailed(isize),
}

/// Runs firmware transactions under the hypervisor mailbox protocol.
pub struct FirmwareClient<H: HyperCall, C: MailboxChannel> {
    hvc: H,
    channel: C,
    transaction_lock: Mutex<()>,
    timeout: Duration,
}

impl<H: HyperCall, C: MailboxChannel> FirmwareClient<H, C> {
    /// Create a new [`FirmwareClient`] with the default timeout.
    pub const fn new(hvc: H, channel: C) -> Self {
        Self::with_timeout(hvc, channel, TRANSACTION_TIMEOUT)
    }

    /// Create a new [`FirmwareClient`] waiting at most `timeout` per transaction.
    pub const fn with_timeout(hvc: H, channel: C, timeout: Duration) -> Self {
        Self {
            hvc,
            channel,
            transaction_lock: Mutex::new(()),
            timeout,
        }
    }

    /// Sends the property buffer at `data` on mailbox channel `chan` and
    /// waits for the firmware to answer.
    ///
    /// Once START succeeded, END is issued exactly once whatever happens to
    /// the transaction itself, so a timeout never starves other VMs.
    pub fn transaction(&self, chan: u8, data: PhysAddr) -> Result<(), TransactionError> {
        let Some(message) = mbox_msg(chan, data) else {
            warn!("invalid firmware buffer {:#x}", data.as_usize());
            return Err(TransactionError::InvalidBuffer);
        };

        let _guard = self.transaction_lock.lock();

        let ret = self
            .hvc
            .hypercall(HyperCallId::RpiFirmware, MailboxOp::Acquire as u64, 0, 0);
        if ret < 0 {
            error!("hypercall START failed: {}", ret);
            return Err(TransactionError::Rejected(ret));
        }

        self.channel.reinit_completion();
        let result = match self.channel.send(message) {
            Ok(()) if self.channel.wait_completion(self.timeout) => Ok(()),
            Ok(()) => {
                warn!("firmware transaction timeout");
                Err(TransactionError::Timeout)
            }
            Err(err) => {
                error!(
                    "mailbox send failed for chan: {}, data: {:#010x}: {:?}",
                    chan, message, err
                );
                Err(TransactionError::Send(err))
            }
        };

        let ret = self
            .hvc
            .hypercall(HyperCallId::RpiFirmware, MailboxOp::Release as u64, 0, 0);
        if ret < 0 {
            error!("hypercall END failed: {}", ret);
            return Err(TransactionError::ReleaseFailed(ret));
        }

        result
    }
}
