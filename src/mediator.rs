use axerrno::{ax_err, AxError, AxResult};
use spin::Once;

use crate::hal::IrqRouter;
use crate::lock::MediatorLock;
use crate::GuestVCpu;

/// The interrupt line of the BCM2711 VideoCore mailbox.
pub const RPI_MAILBOX_IRQ_ID: usize = 65;

/// Sub-operation of the `RPI_FIRMWARE` hypercall, carried in `arg0`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxOp {
    /// START: take the mailbox and its interrupt.
    Acquire = 1,
    /// END: give the interrupt and the mailbox back.
    Release = 2,
}

impl TryFrom<u64> for MailboxOp {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Acquire),
            2 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

/// Static configuration of a [`DeviceMediator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediatorConfig {
    /// The physical IRQ line owned by the mediated device.
    pub irq_id: usize,
}

impl MediatorConfig {
    /// The firmware mailbox of the Raspberry Pi 4.
    pub const RPI4: Self = Self {
        irq_id: RPI_MAILBOX_IRQ_ID,
    };
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self::RPI4
    }
}

/// Exclusive, IRQ-coordinated access to one shared physical device.
///
/// There is one mediator per mediated device for the whole lifetime of the
/// hypervisor; it is built at platform bring-up and handed by reference to
/// the [`HyperCallDispatcher`](crate::HyperCallDispatcher) and to the IRQ
/// entry path. The device's registers are never touched here, only the lock
/// and the interrupt route.
///
/// A holder that never issues END starves every other VM; nothing in here
/// revokes a hold. [`DeviceMediator::holder`] lets the VM lifecycle layer
/// see who is holding the device.
pub struct DeviceMediator<R: IrqRouter> {
    config: MediatorConfig,
    lock: MediatorLock,
    router: R,
    reserved: Once<AxResult>,
}

impl<R: IrqRouter> DeviceMediator<R> {
    /// Create a new [`DeviceMediator`] routing its IRQ through `router`.
    pub const fn new(config: MediatorConfig, router: R) -> Self {
        Self {
            config,
            lock: MediatorLock::new(),
            router,
            reserved: Once::new(),
        }
    }

    /// Reserves the device IRQ with the interrupt subsystem.
    ///
    /// Only the first call reaches the router; later calls return its
    /// outcome again, so a failed reservation is not retried.
    pub fn init(&self) -> AxResult {
        self.reserved
            .call_once(|| {
                let irq = self.config.irq_id;
                self.router.reserve(irq).map_err(|err| {
                    error!("failed to reserve mailbox irq {}: {:?}", irq, err);
                    err
                })?;
                debug!("mailbox irq {} reserved", irq);
                Ok(())
            })
            .clone()
    }

    /// The `RPI_FIRMWARE` hypercall entry point.
    pub fn hypercall(
        &self,
        caller: GuestVCpu,
        arg0: u64,
        _arg1: u64,
        _arg2: u64,
    ) -> AxResult<usize> {
        match MailboxOp::try_from(arg0) {
            Ok(MailboxOp::Acquire) => self.acquire(caller),
            Ok(MailboxOp::Release) => self.release(caller),
            Err(op) => {
                error!("{}: unknown mailbox operation {}", caller, op);
                Err(AxError::InvalidInput)
            }
        }
    }

    /// START: spins until `caller` owns the device, then routes the IRQ to it.
    ///
    /// The spin happens in hypervisor context; the calling vCPU does not run
    /// until it returns.
    pub fn acquire(&self, caller: GuestVCpu) -> AxResult<usize> {
        if !matches!(self.reserved.get(), Some(Ok(()))) {
            return ax_err!(BadState, "mailbox mediator is not initialized");
        }
        if self.lock.holder() == Some(caller) {
            error!("{}: mailbox acquired twice without release", caller);
            return Err(AxError::BadState);
        }

        let hold = match self.lock.try_lock(caller) {
            Some(hold) => hold,
            None => {
                trace!("{}: waiting for mailbox held by {:?}", caller, self.lock.holder());
                self.lock.lock(caller)
            }
        };
        hold.arm();
        self.router.set_enabled(self.config.irq_id, hold.owner(), true);
        debug!("{}: mailbox acquired", hold.owner());
        hold.persist();
        Ok(0)
    }

    /// END: unroutes the IRQ from `caller`, then frees the device.
    ///
    /// The line is disabled before the lock becomes visible as free. If the
    /// IRQ path is delivering to `caller` at that moment, the lock is only
    /// freed once that delivery has finished.
    pub fn release(&self, caller: GuestVCpu) -> AxResult<usize> {
        let Some(hold) = self.lock.reclaim(caller) else {
            error!(
                "{}: mailbox released without holding it (holder: {:?})",
                caller,
                self.lock.holder()
            );
            return Err(AxError::BadState);
        };

        hold.disarm();
        self.router.set_enabled(self.config.irq_id, hold.owner(), false);
        drop(hold);
        debug!("{}: mailbox released", caller);
        Ok(0)
    }

    /// Handles the physical device IRQ.
    ///
    /// The interrupt goes to the holder only, and only once per START: the
    /// line is disabled again until the next acquisition. An IRQ with no
    /// armed holder is stale and dropped. The holder can't release the device
    /// until the injection and the following disable have returned.
    pub fn handle_irq(&self, irq: usize) -> AxResult {
        if irq != self.config.irq_id {
            return ax_err!(InvalidInput, "not the mailbox irq");
        }

        match self.lock.take_armed() {
            Some(delivery) => {
                let holder = delivery.target();
                trace!("forwarding mailbox irq {} to {}", irq, holder);
                let injected = self.router.inject(holder, irq);
                self.router.set_enabled(irq, holder, false);
                drop(delivery);
                injected
            }
            None => {
                warn!("dropping stale mailbox irq {}", irq);
                Ok(())
            }
        }
    }

    /// The vCPU currently owning the device, if any.
    pub fn holder(&self) -> Option<GuestVCpu> {
        self.lock.holder()
    }

    /// Whether the device IRQ is currently routed to the holder.
    pub fn irq_enabled(&self) -> bool {
        self.lock.is_armed()
    }

    /// The physical IRQ line of the device.
    pub const fn irq_id(&self) -> usize {
        self.config.irq_id
    }

    /// The interrupt router this mediator drives.
    pub fn router(&self) -> &R {
        &self.router
    }
}
