use axerrno::AxError;

/// Errors reported to the guest in its return-value register.
///
/// The guest sees the negated discriminant; non-negative values are
/// handler-defined success payloads.
#[repr(isize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HyperCallError {
    /// The request was understood but could not be honoured.
    Failure = 1,
    /// The hypercall id is not one this hypervisor serves.
    InvalidId = 2,
    /// An argument (e.g. the mediator sub-operation) is out of range.
    InvalidArgs = 3,
}

impl HyperCallError {
    /// The value written back to the guest.
    pub const fn to_guest(self) -> isize {
        -(self as isize)
    }
}

impl From<AxError> for HyperCallError {
    fn from(err: AxError) -> Self {
        match err {
            AxError::InvalidInput => Self::InvalidArgs,
            AxError::Unsupported => Self::InvalidId,
            _ => Self::Failure,
        }
    }
}
