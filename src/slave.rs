/*!
    configuration of a slave, as needed by the bus core.

    Slave discovery and SII parsing are not done here: they produce a [Slave] that is injected in the [crate::Master] and stays read-only from then on.
*/

use crate::registers::MailboxSupport;


/// location of a mailbox buffer in a slave's physical memory
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MailboxBuffer {
    /// start address in the slave's physical memory
    pub offset: u16,
    /// size in bytes, mailbox frames including their header must fit in
    pub size: u16,
}

/// identifier of a slave in a [crate::Master]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SlaveId(pub(crate) usize);

/**
    a configured bus participant

    Mailbox sizes are fixed for the whole life of the slave, any mailbox message exceeding them is rejected before transmission.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Slave {
    /// fixed address the slave answers to
    pub station_address: u16,
    /// topological position of the slave in the segment
    pub ring_position: u16,
    /// mailbox protocols supported, an empty set means the slave has no usable mailbox
    pub protocols: MailboxSupport,
    /// mailbox written by the master (master to slave)
    pub rx_mailbox: MailboxBuffer,
    /// mailbox written by the slave (slave to master)
    pub tx_mailbox: MailboxBuffer,
    /// vendor identifier, as read from the SII
    pub vendor: u32,
    /// product code, as read from the SII
    pub product: u32,
}
impl Slave {
    /// slave with no mailbox, only usable for process data
    pub fn new(station_address: u16, ring_position: u16) -> Self {
        Self {
            station_address,
            ring_position,
            protocols: MailboxSupport::none(),
            rx_mailbox: MailboxBuffer::default(),
            tx_mailbox: MailboxBuffer::default(),
            vendor: 0,
            product: 0,
        }
    }
    /// set the mailbox configuration
    pub fn with_mailbox(self, protocols: MailboxSupport, rx_mailbox: MailboxBuffer, tx_mailbox: MailboxBuffer) -> Self {
        Self {protocols, rx_mailbox, tx_mailbox, .. self}
    }
    /// set the identity reported by the slave
    pub fn with_identity(self, vendor: u32, product: u32) -> Self {
        Self {vendor, product, .. self}
    }
    /// true if the slave has a mailbox the master can talk to
    pub fn has_mailbox(&self) -> bool {
        self.protocols.any()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_compares() {
        let rx = MailboxBuffer {offset: 0x1000, size: 128};
        let tx = MailboxBuffer {offset: 0x1080, size: 128};
        let drive = Slave::new(0x1001, 0).with_mailbox(MailboxSupport::from(0b100u16), rx, tx);
        assert!(drive.has_mailbox());
        assert!(drive.protocols.coe());
        assert_eq!(drive, drive.clone());
        assert_ne!(drive, Slave::new(0x1001, 0));
        assert!(! Slave::new(0x1001, 0).has_mailbox());
    }
}
