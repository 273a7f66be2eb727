// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxMbox - hypercall-mediated sharing of the firmware mailbox between VMs.
//!
//! The firmware mailbox of the Raspberry Pi cannot be partitioned per VM, so
//! every guest that talks to the firmware goes through a START/END hypercall
//! pair. The hypervisor side serializes those transactions across all cores
//! with a single spin lock and hands the mailbox interrupt to whichever vCPU
//! holds it.
//!
//! # Features
//!
//! - Hypercall dispatch from the trap boundary (`IPC`, `RPI_FIRMWARE`)
//! - Cross-VM mutual exclusion with acquire/release ordering
//! - Mailbox IRQ routing to, and only to, the current holder
//! - A guest-side transaction client honouring the START/END contract

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

// Core modules
mod error; // Guest-visible hypercall error codes
mod guest; // Guest transaction client and hvc trampoline
mod hal; // Interfaces provided by the surrounding hypervisor
mod hypercall; // Hypercall decoding and dispatch
mod lock; // Mediator spin lock and hold token
mod mediator; // START/END arbitration and IRQ forwarding
mod trap; // Trap boundary: register convention and trap routing

// Public API exports
pub use error::HyperCallError;
pub use guest::*;
pub use hal::{IpcHandler, IrqRouter};
pub use hypercall::*;
pub use lock::{HoldToken, IrqDelivery, MediatorLock};
pub use mediator::*;
pub use trap::*;

/// Identity of the guest execution context issuing a hypercall.
///
/// This is the "calling context" the mediator arbitrates between: the
/// lock holder, the target of the forwarded mailbox IRQ and the subject of
/// every protocol-violation log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GuestVCpu {
    /// The id of the VM.
    pub vm_id: u16,
    /// The id of the vcpu inside the VM.
    pub vcpu_id: u16,
}

impl GuestVCpu {
    /// Create a new [`GuestVCpu`].
    pub const fn new(vm_id: u16, vcpu_id: u16) -> Self {
        Self { vm_id, vcpu_id }
    }
}

impl core::fmt::Display for GuestVCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VM[{}] vCPU[{}]", self.vm_id, self.vcpu_id)
    }
}
