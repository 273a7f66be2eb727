use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::GuestVCpu;

/// Set while some vCPU holds the lock.
const HELD: u64 = 1 << 62;
/// Set while the holder may receive the mediated IRQ.
const ARMED: u64 = 1 << 63;
/// Set while the IRQ path is delivering to the holder; the hold can't end meanwhile.
const IN_IRQ: u64 = 1 << 61;
const OWNER_MASK: u64 = 0xffff_ffff;

const fn encode(owner: GuestVCpu) -> u64 {
    HELD | ((owner.vm_id as u64) << 16) | owner.vcpu_id as u64
}

const fn decode(state: u64) -> GuestVCpu {
    let owner = state & OWNER_MASK;
    GuestVCpu::new((owner >> 16) as u16, owner as u16)
}

/// The mediator's cross-core spin lock.
///
/// A single state word holds the owner identity and whether the owner is
/// armed for the mediated IRQ, so `irq_enabled` can never be observed for
/// anyone but the current holder. Acquisition synchronizes-with the previous
/// release (`Acquire`/`Release`).
///
/// A hold outlives the hypercall that took it: START takes a [`HoldToken`]
/// and [`HoldToken::persist`]s it, END gets it back with
/// [`MediatorLock::reclaim`] and drops it.
pub struct MediatorLock {
    state: AtomicU64,
}

impl MediatorLock {
    /// Create a new, free lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Spins until `owner` holds the lock.
    pub fn lock(&self, owner: GuestVCpu) -> HoldToken<'_> {
        let held = encode(owner);
        loop {
            if self
                .state
                .compare_exchange_weak(0, held, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return HoldToken { lock: self, owner };
            }
            // Wait on plain loads so waiters don't bounce the cache line.
            while self.state.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }
    }

    /// Takes the lock for `owner` if it is free, without spinning.
    ///
    /// Used as the uncontended fast path of an acquisition.
    pub fn try_lock(&self, owner: GuestVCpu) -> Option<HoldToken<'_>> {
        self.state
            .compare_exchange(0, encode(owner), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| HoldToken { lock: self, owner })
    }

    /// Returns the token of a persisted hold if `owner` is the holder.
    pub fn reclaim(&self, owner: GuestVCpu) -> Option<HoldToken<'_>> {
        match self.holder() {
            Some(holder) if holder == owner => Some(HoldToken { lock: self, owner }),
            _ => None,
        }
    }

    /// The current holder, if any.
    pub fn holder(&self) -> Option<GuestVCpu> {
        let state = self.state.load(Ordering::Acquire);
        (state & HELD != 0).then(|| decode(state))
    }

    /// Whether the holder is currently armed for the mediated IRQ.
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) & ARMED != 0
    }

    /// Atomically disarms the holder and starts delivering the IRQ to it.
    ///
    /// Returns `None` if nobody is armed. Reading the holder and disarming in
    /// one step means an IRQ can't be attributed to a holder that has
    /// already handed the lock on. Until the returned [`IrqDelivery`] is
    /// dropped, the holder's [`HoldToken`] can't release the lock, so nobody
    /// else can take it and reroute the IRQ.
    pub fn take_armed(&self) -> Option<IrqDelivery<'_>> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & ARMED == 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                state,
                (state & !ARMED) | IN_IRQ,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(IrqDelivery {
                        lock: self,
                        target: decode(state),
                    })
                }
                Err(current) => state = current,
            }
        }
    }
}

impl Default for MediatorLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a vCPU holds a [`MediatorLock`].
///
/// Dropping the token releases the lock, so every early return of the
/// owning code path gives the lock back.
pub struct HoldToken<'a> {
    lock: &'a MediatorLock,
    owner: GuestVCpu,
}

impl HoldToken<'_> {
    /// The vCPU holding the lock, as passed to [`MediatorLock::lock`].
    pub fn owner(&self) -> GuestVCpu {
        self.owner
    }

    /// Allows the mediated IRQ to be taken by [`MediatorLock::take_armed`].
    pub fn arm(&self) {
        self.lock.state.fetch_or(ARMED, Ordering::Release);
    }

    /// Withdraws a pending [`HoldToken::arm`].
    pub fn disarm(&self) {
        self.lock.state.fetch_and(!ARMED, Ordering::Release);
    }

    /// Keeps the lock held after the token goes away.
    ///
    /// The hold can only be ended through [`MediatorLock::reclaim`].
    pub fn persist(self) {
        core::mem::forget(self);
    }
}

impl Drop for HoldToken<'_> {
    fn drop(&mut self) {
        // Wait out an IRQ delivery to this holder before anyone else can lock.
        while self.lock.state.load(Ordering::Acquire) & IN_IRQ != 0 {
            spin_loop();
        }
        self.lock.state.store(0, Ordering::Release);
    }
}

/// An IRQ delivery in progress, returned by [`MediatorLock::take_armed`].
///
/// The holder stays in place until the delivery is dropped.
pub struct IrqDelivery<'a> {
    lock: &'a MediatorLock,
    target: GuestVCpu,
}

impl IrqDelivery<'_> {
    /// The holder the IRQ is delivered to.
    pub fn target(&self) -> GuestVCpu {
        self.target
    }
}

impl Drop for IrqDelivery<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!IN_IRQ, Ordering::Release);
    }
}
