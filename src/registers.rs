/*!
    structs and consts for the registers of a standard slave's physical memory used by the bus core. This should be used instead of any hardcoded register value.

    Only the sync manager registers are needed here: they control mailbox exchanges, and their status byte tells whether a slave has a mailbox answer waiting.
*/

use bilge::prelude::*;
use crate::data::{self, Field};

/**
    SM (Sync Managers) are used for configuring and controling two distinct things:
    - mailbox exchanges (CoE, FoE, ...)
    - pdo exchanges (copying PDO data to slave's physical memory)
*/
pub mod sync_manager {
    use super::*;

	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
    /// state of the channel the slave writes its mailbox answers in, polled by the master to know when an answer is ready
    pub const mailbox_state: Field<SyncManagerChannel> = Field::simple(0x0808);
}

/// this is not a PduData but a convenience struct transporting the addresses of a sync manager
/// ETG.1000.4 table 59
#[derive(Copy, Clone, Debug)]
pub struct SyncManager {
    /// start address of the sync manager (address of the first channel)
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    /// return the register of one sync manager channel, `None` if the index exceeds the number of channels
    pub const fn channel(&self, index: u8) -> Option<Field<SyncManagerChannel>> {
        if index >= self.num {return None}
        Some(Field::simple(self.address as usize + index as usize * 8))
    }
    /// return the sync manager channel reserved for mailbox in (master to slave)
    pub const fn mailbox_write(&self) -> Field<SyncManagerChannel>   {Field::simple(self.address as usize)}
    /// return the sync manager channel reserved for mailbox out (slave to master)
    pub const fn mailbox_read(&self) -> Field<SyncManagerChannel>   {Field::simple(self.address as usize + 8)}
}

/**
    The Sync manager controls the access to the DL-user memory. Each channel defines a consistent area of the DL-user memory.

    There is two ways of data exchange between master and PDI:
    - Handshake mode (mailbox): one entity fills data in and cannot access the area until the other entity reads out the data.
    - Buffered mode: the interaction between both producer of data and consumer of data is uncorrelated – each entity expects access at any time, always providing the consumer with the newest data.

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct SyncManagerChannel {
    /// start address in octets in the physical memory of the consistent DL-user memory area.
    pub address: u16,
    /// size in octets of the consistent DL -user memory area.
    pub length: u16,
    /// `0` for buffered, `2` for mailbox
    pub mode: u2,
    /// `0` if the area is read by the master, `1` if written by the master
    pub direction: u2,
    /// an event is generated if there is new data available in the consistent DL-user memory area which was written by the master (direction write) or if the new data from the DL-user was read by the master (direction read).
    pub ec_event: bool,
    /// an event is generated if there is new data available in the consistent DL-user memory area which was written by DLS-user or if the new data from the Master was read by the DLS-user.
    pub dls_user_event: bool,
    /// if the monitoring of an access to the consistent DL-user memory area is enabled.
    pub watchdog: bool,
    pub unused0: u1,

    /// if the consistent DL -user memory (direction write) has been written by the master and the event enable parameter is set.
    pub write_event: bool,
    /// if the consistent DL -user memory (direction read) has been read by the master and the event enable parameter is set.
    pub read_event: bool,
    pub unused1: u1,
    /// true if there is data waiting to be read (by master or slave) in the buffer
    pub mailbox_full: bool,
    /// state (buffer number, locked) of the consistent DL-user memory if it is of buffered access type.
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,

    /// activate this channel
    pub enable: bool,
    /// A change in this parameter indicates a repeat request. This is primarily used to repeat the last mailbox interactions.
    pub repeat: bool,
    pub unused2: u4,
    /// if the DC 0 Event shall be invoked in case of a EtherCAT write
    pub dc_event_bus: bool,
    /// if the DC 0 Event shall be invoked in case of a local write
    pub dc_event_local: bool,

    /// disable this channel for PDI access
    pub disable_pdi: bool,
    /// indicates a repeat request acknowledge. After setting the value of Repeat in the parameter repeat acknowledge.
    pub repeat_ack: bool,
    pub unused3: u6,
}
data::bilge_pdudata!(SyncManagerChannel, u64);

/// used by the slave to inform the master which mailbox protocl can be used with the slave.
/// ETG.1000.6 table 18
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq, Eq)]
pub struct MailboxSupport {
    /// ADS over EtherCAT (routing and parallel services)
    pub aoe: bool,
    /// Ethernet over EtherCAT (tunnelling of Data Link services)
    pub eoe: bool,
    /// CAN application protocol over EtherCAT (access to SDO)
    pub coe: bool,
    /// File Access over EtherCAT
    pub foe: bool,
    /// Servo Drive Profile over EtherCAT
    pub soe: bool,
    /// Vendor specific protocol over EtherCAT
    pub voe: bool,
    pub unused: u10,
}
data::bilge_pdudata!(MailboxSupport, u16);

impl MailboxSupport {
    /// no mailbox protocol at all, the slave has no usable mailbox
    pub fn none() -> Self {Self::from(0u16)}
    /// true if at least one mailbox protocol is supported
    pub fn any(&self) -> bool {u16::from(*self) != 0}
}

impl Default for MailboxSupport {
    fn default() -> Self {Self::none()}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn mailbox_full_is_bit3_of_status_byte() {
        let mut raw = [0u8; 8];
        raw[5] = 0x08;
        assert!(SyncManagerChannel::unpack(&raw).unwrap().mailbox_full());
        raw[5] = 0xf7;
        assert!(! SyncManagerChannel::unpack(&raw).unwrap().mailbox_full());
    }

    #[test]
    fn mailbox_channels() {
        assert_eq!(sync_manager::interface.mailbox_read().byte, sync_manager::mailbox_state.byte);
        assert_eq!(sync_manager::interface.channel(2).unwrap().byte, 0x0810);
        assert!(sync_manager::interface.channel(16).is_none());
    }

    #[test]
    fn mailbox_support_mask() {
        assert!(! MailboxSupport::none().any());
        assert!(MailboxSupport::from(0b100u16).coe());
        assert!(MailboxSupport::from(0b100u16).any());
    }
}
