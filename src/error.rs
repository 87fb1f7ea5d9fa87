//! definition of the general ethercat error type

use std::sync::Arc;
use core::{fmt, time::Duration};

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it.

    [Self::Slave] variant should not be used without an appropriate type for `T`, `T` depend on the operation the slave reports for, and is usually an error code, or an enum.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a slave, its type depend on the operation returning this error
    ///
    /// these errors can generally be handled and fixed by retrying the operation or reconfiguring the slave
    Slave(T),

    /// error reported by the master
    ///
    /// these errors can generally be handled and fixed by retrying the operation or using the master differently when the issue is in the user code
    Master(&'static str),

    /// error detected by the master in the ethercat communication
    ///
    /// these errors can generally not be fixed and the whole communication has to be restarted
    Protocol(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),

    /// the slave has no mailbox protocol configured, nothing was sent
    UnsupportedMailbox {slave: u16},
    /// a mailbox message does not fit in the slave's receive mailbox, nothing was sent
    PayloadTooLarge {size: usize, capacity: usize},
    /// a mailbox answer announces more data than the slave's transmit mailbox can hold, the frame was discarded
    CorruptMailboxFrame {length: usize, capacity: usize},
    /// the slave did not report a mailbox answer within the given number of cycles
    PollTimeout {cycles: u32},
    /// a cycle took longer than its time budget, its data is still consistent
    CycleOverrun {elapsed: Duration, budget: Duration},
    /// the shape of a domain cannot change once the master is active
    DomainAlreadyActive,
    /// process data can only be accessed while the master is active
    NotActive,
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Slave(error) => write!(f, "slave: {:?}", error),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Protocol(message) => write!(f, "protocol: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
            Self::UnsupportedMailbox {slave} =>
                write!(f, "master: slave {} does not support mailbox communication", slave),
            Self::PayloadTooLarge {size, capacity} =>
                write!(f, "master: {} bytes of mailbox data do not fit in a {} bytes mailbox", size, capacity),
            Self::CorruptMailboxFrame {length, capacity} =>
                write!(f, "protocol: corrupt mailbox frame announcing {} bytes in a {} bytes mailbox", length, capacity),
            Self::PollTimeout {cycles} =>
                write!(f, "timeout: no mailbox answer after {} cycles", cycles),
            Self::CycleOverrun {elapsed, budget} =>
                write!(f, "timeout: cycle took {:?} for a budget of {:?}", elapsed, budget),
            Self::DomainAlreadyActive => write!(f, "master: domains cannot be changed while active"),
            Self::NotActive => write!(f, "master: not active"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::BadAlignment(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// because rust doesn't allow specialization and already implements `From<T> for T`, we cannot write smart conversions for generic EthercatError<T>, so these are manual conversion methods
impl<E> EthercatError<E> {
    /// convert the error if the slave specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the error with a callback handling the case of slave-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(value) => EthercatError::Slave(callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::UnsupportedMailbox {slave} => EthercatError::UnsupportedMailbox {slave},
            EthercatError::PayloadTooLarge {size, capacity} => EthercatError::PayloadTooLarge {size, capacity},
            EthercatError::CorruptMailboxFrame {length, capacity} => EthercatError::CorruptMailboxFrame {length, capacity},
            EthercatError::PollTimeout {cycles} => EthercatError::PollTimeout {cycles},
            EthercatError::CycleOverrun {elapsed, budget} => EthercatError::CycleOverrun {elapsed, budget},
            EthercatError::DomainAlreadyActive => EthercatError::DomainAlreadyActive,
            EthercatError::NotActive => EthercatError::NotActive,
        }
    }
}
impl EthercatError<()> {
    /// convert an error with no slave-specific type into an error with any slave-specific type
    pub fn upgrade<F>(self) -> EthercatError<F> {
        self.map(|_|  unreachable!("an ethercat error with no slave-specific type cannot hold a slave error"))
    }
}
