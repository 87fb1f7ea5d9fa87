/*!
    Core of an ethercat master: transport of datagrams over a socket, mailbox exchanges with slaves, and cyclic exchange of process data gathered in domains.

    - [Master] is the entry point, owning the segment's configuration and running its cycles
    - [CycleDriver] runs the master cycles at a fixed frequency, and forwards ticks to a host timekeeper
    - [Monitor] samples the cycles [Telemetry] from a tokio runtime

    Sockets to communicate with a segment are in [socket], including a [SimulatedSocket] for running without hardware.
*/

pub mod data;
pub mod registers;
pub mod error;
pub mod socket;
pub mod rawmaster;
pub mod slave;
pub mod mailbox;
pub mod domain;
pub mod master;
pub mod scheduler;
pub mod driver;
pub mod telemetry;

pub use crate::data::{PduData, Field};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::socket::*;
pub use crate::rawmaster::{RawMaster, TransportStats};
pub use crate::slave::{Slave, SlaveId, MailboxBuffer};
pub use crate::registers::MailboxSupport;
pub use crate::mailbox::{MailboxType, MailboxError, MailboxResponse, ExchangeId};
pub use crate::domain::{Domain, DomainId, DomainField, DomainState, FieldLocator, FieldInit};
pub use crate::master::{Master, MasterConfig};
pub use crate::scheduler::{Strategy, CyclePhase, CycleTiming};
pub use crate::driver::{CycleDriver, RunningDriver, DriverConfig, HostTick, NoHost, TickDivider};
pub use crate::telemetry::{Telemetry, Monitor, TimingSnapshot};
