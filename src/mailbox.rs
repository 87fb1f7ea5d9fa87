/*!
    implementation of communication with a slave's mailbox

    The mailbox is a small buffer in each slave's physical memory, used for reliable acyclic exchanges (CoE, FoE, ...) over the same addressing scheme as process data. An exchange is made of three steps, each one being a datagram that goes out with the cyclic frames:

    1. write the request to the slave's receive mailbox ([prepare_send])
    2. poll the mailbox state until the slave tells its answer is ready ([prepare_check], [check]), this usually takes several cycles
    3. read the answer from the slave's transmit mailbox ([prepare_fetch], [fetch])

    These functions only prepare or decode datagrams, they never send nor wait. [MailboxExchange] chains them over cycles.
*/

use crate::{
    slave::{Slave, SlaveId},
    rawmaster::{RawMaster, Datagram, DatagramIndex, DatagramState},
    socket::EthercatSocket,
    registers::{self, SyncManagerChannel},
    data::{self, PduData, Field},
    error::{EthercatError, EthercatResult},
    };
use bilge::prelude::*;
use core::fmt;
use log::{debug, error, trace, warn};


/**
    prepare a datagram writing a mailbox frame of `size` bytes of payload to the slave

    returns the payload part of the datagram buffer, for the caller to fill. The frame header is already written, nothing is sent.
*/
pub fn prepare_send<'a>(slave: &Slave, datagram: &'a mut Datagram, ty: MailboxType, size: usize) -> EthercatResult<&'a mut [u8]> {
    check_request(slave, size)?;
    datagram.fpwr(slave.station_address, slave.rx_mailbox.offset, usize::from(slave.rx_mailbox.size))?;
    let header = MailboxHeader::new(
        size as u16,
        slave.station_address,
        u6::new(0),  // channel is reserved for future use
        u2::new(0),
        u4::new(u8::from(ty) & 0xf),
        u3::new(0),
        u1::new(0),
        );
    let data = datagram.data_mut();
    header.pack(data)?;
    Ok(&mut data[MailboxHeader::packed_size() ..][.. size])
}

/// fail if a payload of `size` bytes cannot be sent to the slave's mailbox
pub fn check_request(slave: &Slave, size: usize) -> EthercatResult {
    if ! slave.has_mailbox() {
        error!("slave {} does not support mailbox communication", slave.ring_position);
        return Err(EthercatError::UnsupportedMailbox {slave: slave.station_address});
    }
    let capacity = usize::from(slave.rx_mailbox.size);
    if size + MailboxHeader::packed_size() > capacity {
        error!("{} bytes do not fit in mailbox of slave {}", size, slave.ring_position);
        return Err(EthercatError::PayloadTooLarge {size, capacity});
    }
    Ok(())
}

/// prepare a datagram reading the slave's mailbox state
pub fn prepare_check(slave: &Slave, datagram: &mut Datagram) -> EthercatResult {
    let state = registers::sync_manager::mailbox_state;
    datagram.fprd(slave.station_address, state.byte as u16, state.len)
}

/// true if the received mailbox state tells an answer is waiting in the slave's transmit mailbox
pub fn check(datagram: &Datagram) -> bool {
    SyncManagerChannel::unpack(datagram.data())
        .map(|state| state.mailbox_full())
        .unwrap_or(false)
}

/// prepare a datagram reading the whole slave's transmit mailbox
pub fn prepare_fetch(slave: &Slave, datagram: &mut Datagram) -> EthercatResult {
    datagram.fprd(slave.station_address, slave.tx_mailbox.offset, usize::from(slave.tx_mailbox.size))
}

/**
    decode a mailbox frame read from the slave's transmit mailbox

    returns the protocol type and the payload, borrowed from the datagram. An error reply from the slave is reported as [EthercatError::Slave] and never returns a payload.
*/
pub fn fetch<'a>(slave: &Slave, datagram: &'a Datagram) -> EthercatResult<(MailboxType, &'a [u8]), MailboxError> {
    let frame = MailboxFrame::parse::<MailboxError>(datagram.data(), usize::from(slave.tx_mailbox.size))
        .map_err(|error| {
            error!("corrupt mailbox response received from slave {}: {:02x?}",
                slave.ring_position,
                &datagram.data()[.. datagram.data().len().min(usize::from(slave.tx_mailbox.size))]);
            error
        })?;

    match frame.ty() {
        MailboxType::Exception => {
            let code = match ERROR_CODE.get(datagram.data()) {
                Ok(code) => code,
                Err(_) => return Err(EthercatError::Protocol("mailbox error reply too short")),
            };
            let error = MailboxError::from(code);
            error!("mailbox error response received from slave {}: {}", slave.ring_position, error);
            debug!("mailbox error reply {:02x?}", frame.payload());
            Err(EthercatError::Slave(error))
        },
        ty => Ok((ty, frame.payload())),
    }
}


/**
    typed view of a received mailbox frame

    The announced payload length is checked against the mailbox capacity at construction, so the payload can be used without further checks.

    ETG 1000.4 5.6
*/
#[derive(Copy, Clone, Debug)]
pub struct MailboxFrame<'a> {
    header: MailboxHeader,
    payload: &'a [u8],
}
impl<'a> MailboxFrame<'a> {
    /// parse a frame read from a mailbox of `capacity` bytes
    pub fn parse<E>(data: &'a [u8], capacity: usize) -> EthercatResult<Self, E> {
        let header = MailboxHeader::unpack(data)?;
        let length = usize::from(header.length());
        if length > capacity.saturating_sub(MailboxHeader::packed_size())
            {return Err(EthercatError::CorruptMailboxFrame {length, capacity})}
        match data.get(MailboxHeader::packed_size() ..).and_then(|payload| payload.get(.. length)) {
            Some(payload) => Ok(Self {header, payload}),
            None => Err(EthercatError::CorruptMailboxFrame {length, capacity: data.len()}),
        }
    }
    pub fn header(&self) -> MailboxHeader  {self.header}
    pub fn ty(&self) -> MailboxType  {MailboxType::from(self.header.ty().value())}
    pub fn payload(&self) -> &'a [u8]  {self.payload}
}

/// ETG 1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    /// protocol carried, see [MailboxType]
    pub ty: u4,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u3,
    pub unused: u1,
}
data::bilge_pdudata!(MailboxHeader, u48, u64);

/// ETG 1000.4 table 29
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxType {
    /// error reply, only sent by slaves
    Exception,
    Ads,
    Ethernet,
    Can,
    File,
    Servo,
    Specific,
    Unknown(u8),
}
impl From<u8> for MailboxType {
    fn from(code: u8) -> Self {
        match code {
            0x0 => Self::Exception,
            0x1 => Self::Ads,
            0x2 => Self::Ethernet,
            0x3 => Self::Can,
            0x4 => Self::File,
            0x5 => Self::Servo,
            0xf => Self::Specific,
            other => Self::Unknown(other),
        }
    }
}
impl From<MailboxType> for u8 {
    fn from(ty: MailboxType) -> u8 {
        match ty {
            MailboxType::Exception => 0x0,
            MailboxType::Ads => 0x1,
            MailboxType::Ethernet => 0x2,
            MailboxType::Can => 0x3,
            MailboxType::File => 0x4,
            MailboxType::Servo => 0x5,
            MailboxType::Specific => 0xf,
            MailboxType::Unknown(other) => other,
        }
    }
}

/// error code in an error reply frame, it follows a service type word. ETG 1000.4 table 30
const ERROR_CODE: Field<u16> = Field::simple(8);

/// error reply code sent by a slave that cannot process a mailbox request, ETG 1000.4 table 30
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MailboxError {
    Syntax,
    UnsupportedProtocol,
    InvalidChannel,
    ServiceNotSupported,
    InvalidHeader,
    SizeTooShort,
    NoMoreMemory,
    InvalidSize,
    ServiceInWork,
    /// code absent from the standard, it is still reported
    Unknown(u16),
}
impl MailboxError {
    pub fn code(&self) -> u16 {
        match self {
            Self::Syntax => 0x1,
            Self::UnsupportedProtocol => 0x2,
            Self::InvalidChannel => 0x3,
            Self::ServiceNotSupported => 0x4,
            Self::InvalidHeader => 0x5,
            Self::SizeTooShort => 0x6,
            Self::NoMoreMemory => 0x7,
            Self::InvalidSize => 0x8,
            Self::ServiceInWork => 0x9,
            Self::Unknown(code) => *code,
        }
    }
    pub fn description(&self) -> &'static str {
        match self {
            Self::Syntax => "MBXERR_SYNTAX",
            Self::UnsupportedProtocol => "MBXERR_UNSUPPORTEDPROTOCOL",
            Self::InvalidChannel => "MBXERR_INVALIDCHANNEL",
            Self::ServiceNotSupported => "MBXERR_SERVICENOTSUPPORTED",
            Self::InvalidHeader => "MBXERR_INVALIDHEADER",
            Self::SizeTooShort => "MBXERR_SIZETOOSHORT",
            Self::NoMoreMemory => "MBXERR_NOMOREMEMORY",
            Self::InvalidSize => "MBXERR_INVALIDSIZE",
            Self::ServiceInWork => "MBXERR_SERVICEINWORK",
            Self::Unknown(_) => "unknown error reply code",
        }
    }
}
impl From<u16> for MailboxError {
    fn from(code: u16) -> Self {
        match code {
            0x1 => Self::Syntax,
            0x2 => Self::UnsupportedProtocol,
            0x3 => Self::InvalidChannel,
            0x4 => Self::ServiceNotSupported,
            0x5 => Self::InvalidHeader,
            0x6 => Self::SizeTooShort,
            0x7 => Self::NoMoreMemory,
            0x8 => Self::InvalidSize,
            0x9 => Self::ServiceInWork,
            other => Self::Unknown(other),
        }
    }
}
impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code 0x{:04X}: {}", self.code(), self.description())
    }
}
// errors wrapped in [EthercatError::Slave] are shown with their debug format
impl fmt::Debug for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxError")
            .field("code", &format_args!("0x{:04X}", self.code()))
            .field("description", &self.description())
            .finish()
    }
}



/// identifier of a [MailboxExchange] in a [crate::Master]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeId(pub(crate) usize);

/// answer of a slave to a mailbox request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxResponse {
    pub ty: MailboxType,
    pub data: Vec<u8>,
}

/// step of a [MailboxExchange]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExchangeStep {
    /// request is being written to the slave
    Write,
    /// waiting for the slave to present its answer
    Check,
    /// answer is being read from the slave
    Fetch,
    /// finished, successfully or not
    Done,
}

/**
    one mailbox request/response, progressing by one step per cycle

    Each cycle, [Self::issue] prepares and queues the datagram of the current step, and [Self::advance] decodes its answer once received. The exchange never blocks nor retries forever: the number of cycles spent waiting for the answer is bounded by `max_checks`, lost datagrams count as such cycles and are issued again.
*/
pub struct MailboxExchange {
    slave: SlaveId,
    ty: MailboxType,
    request: Vec<u8>,
    datagram: DatagramIndex,
    step: ExchangeStep,
    /// the datagram of the current step went out and was not decoded yet
    issued: bool,
    checks: u32,
    max_checks: u32,
    result: Option<EthercatResult<MailboxResponse, MailboxError>>,
}
impl MailboxExchange {
    pub fn new(slave: SlaveId, datagram: DatagramIndex, ty: MailboxType, request: &[u8], max_checks: u32) -> Self {
        Self {
            slave,
            ty,
            request: request.to_vec(),
            datagram,
            step: ExchangeStep::Write,
            issued: false,
            checks: 0,
            max_checks,
            result: None,
        }
    }
    pub fn slave(&self) -> SlaveId  {self.slave}
    pub fn step(&self) -> ExchangeStep  {self.step}
    pub fn datagram(&self) -> DatagramIndex  {self.datagram}
    /// number of cycles spent waiting for the answer so far
    pub fn checks(&self) -> u32  {self.checks}
    pub fn is_done(&self) -> bool  {self.step == ExchangeStep::Done}
    /// the result, once done
    pub fn take_result(&mut self) -> Option<EthercatResult<MailboxResponse, MailboxError>> {self.result.take()}

    /// prepare and queue the datagram of the current step, if not already in flight
    pub fn issue<S: EthercatSocket>(&mut self, slave: &Slave, transport: &mut RawMaster<S>) {
        if self.issued || self.is_done()  {return}
        let datagram = transport.datagram_mut(self.datagram);
        let prepared = match self.step {
            ExchangeStep::Write => prepare_send(slave, datagram, self.ty, self.request.len())
                .map(|payload| payload.copy_from_slice(&self.request)),
            ExchangeStep::Check => prepare_check(slave, datagram),
            ExchangeStep::Fetch => prepare_fetch(slave, datagram),
            ExchangeStep::Done => Ok(()),
        };
        match prepared {
            Ok(()) => {
                transport.queue(self.datagram);
                self.issued = true;
            },
            Err(error) => self.finish(Err(error.upgrade())),
        }
    }

    /// decode the answer of the datagram issued, moving to the next step when possible
    pub fn advance<S: EthercatSocket>(&mut self, slave: &Slave, transport: &RawMaster<S>) {
        if ! self.issued || self.is_done()  {return}
        let datagram = transport.datagram(self.datagram);
        if datagram.state() == DatagramState::Sent || datagram.state() == DatagramState::Queued
            {return}
        self.issued = false;

        if datagram.state() != DatagramState::Received || datagram.working_counter() != 1 {
            if self.step == ExchangeStep::Write && datagram.state() == DatagramState::Received {
                self.finish(Err(EthercatError::Protocol("mailbox write not acknowledged by slave")));
            }
            else {
                warn!("mailbox {:?} datagram to slave {} lost", self.step, slave.ring_position);
                self.count_check();
            }
            return;
        }

        match self.step {
            ExchangeStep::Write => {
                trace!("mailbox request written to slave {}", slave.ring_position);
                self.step = ExchangeStep::Check;
            },
            ExchangeStep::Check => {
                if check(datagram)
                    {self.step = ExchangeStep::Fetch}
                else
                    {self.count_check()}
            },
            ExchangeStep::Fetch => {
                let result = fetch(slave, datagram)
                    .map(|(ty, data)| MailboxResponse {ty, data: data.to_vec()});
                self.finish(result);
            },
            ExchangeStep::Done => {},
        }
    }

    fn count_check(&mut self) {
        self.checks += 1;
        if self.checks >= self.max_checks {
            warn!("no mailbox answer after {} cycles", self.checks);
            self.finish(Err(EthercatError::PollTimeout {cycles: self.checks}));
        }
    }

    fn finish(&mut self, result: EthercatResult<MailboxResponse, MailboxError>) {
        self.step = ExchangeStep::Done;
        self.issued = false;
        self.result = Some(result);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::MailboxBuffer;
    use crate::registers::MailboxSupport;

    const RX: MailboxBuffer = MailboxBuffer {offset: 0x1000, size: 128};
    const TX: MailboxBuffer = MailboxBuffer {offset: 0x1080, size: 128};

    fn slave() -> Slave {
        Slave::new(0x1001, 0)
            .with_mailbox(MailboxSupport::from(0b100u16), RX, TX)
    }

    /// datagram as received from the transmit mailbox, with the given frame at its start
    fn received(frame: &[u8]) -> Datagram {
        let mut datagram = Datagram::new();
        prepare_fetch(&slave(), &mut datagram).unwrap();
        datagram.data_mut()[.. frame.len()].copy_from_slice(frame);
        datagram
    }

    #[test]
    fn send_boundary() {
        let slave = slave();
        let mut datagram = Datagram::new();
        let payload = prepare_send(&slave, &mut datagram, MailboxType::Can, 122).unwrap();
        assert_eq!(payload.len(), 122);
        assert!(matches!(
            prepare_send(&slave, &mut datagram, MailboxType::Can, 123),
            Err(EthercatError::PayloadTooLarge {size: 123, capacity: 128}),
            ));
    }

    #[test]
    fn send_header() {
        let slave = slave();
        let mut datagram = Datagram::new();
        prepare_send(&slave, &mut datagram, MailboxType::Can, 4).unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(datagram.slave(), 0x1001);
        assert_eq!(datagram.memory(), 0x1000);
        assert_eq!(datagram.data().len(), 128);
        assert_eq!(&datagram.data()[.. 10], &[4, 0, 0x01, 0x10, 0, 3, 1, 2, 3, 4]);
    }

    #[test]
    fn send_without_mailbox() {
        let mut datagram = Datagram::new();
        assert!(matches!(
            prepare_send(&Slave::new(0x1002, 1), &mut datagram, MailboxType::Can, 1),
            Err(EthercatError::UnsupportedMailbox {slave: 0x1002}),
            ));
    }

    #[test]
    fn check_bit() {
        let mut datagram = Datagram::new();
        prepare_check(&slave(), &mut datagram).unwrap();
        assert_eq!(datagram.memory(), 0x808);
        assert_eq!(datagram.data().len(), 8);
        for (status, ready) in [(0x08, true), (0xf7, false), (0xff, true), (0x00, false)] {
            datagram.data_mut()[5] = status;
            assert_eq!(check(&datagram), ready, "status byte {:#x}", status);
        }
    }

    #[test]
    fn fetch_payload() {
        let datagram = received(&[3, 0, 0x01, 0x10, 0, 3, 0xa, 0xb, 0xc, 0xff]);
        let (ty, payload) = fetch(&slave(), &datagram).unwrap();
        assert_eq!(ty, MailboxType::Can);
        assert_eq!(payload, &[0xa, 0xb, 0xc]);
    }

    #[test]
    fn fetch_largest_payload() {
        let mut frame = vec![122, 0, 0x01, 0x10, 0, 3];
        frame.extend((0 .. 122).map(|i| i as u8));
        let datagram = received(&frame);
        let (_, payload) = fetch(&slave(), &datagram).unwrap();
        assert_eq!(payload, &frame[6 ..]);
    }

    #[test]
    fn fetch_corrupt() {
        let datagram = received(&[123, 0, 0x01, 0x10, 0, 3]);
        assert!(matches!(
            fetch(&slave(), &datagram),
            Err(EthercatError::CorruptMailboxFrame {length: 123, capacity: 128}),
            ));
    }

    #[test]
    fn fetch_error_reply() {
        let datagram = received(&[4, 0, 0x01, 0x10, 0, 0, 1, 0, 0x02, 0x00]);
        match fetch(&slave(), &datagram) {
            Err(EthercatError::Slave(error)) => {
                assert_eq!(error, MailboxError::UnsupportedProtocol);
                assert_eq!(error.description(), "MBXERR_UNSUPPORTEDPROTOCOL");
            },
            other => panic!("unexpected fetch result {:?}", other),
        }

        let datagram = received(&[4, 0, 0x01, 0x10, 0, 0, 1, 0, 0xff, 0x00]);
        match fetch(&slave(), &datagram) {
            Err(EthercatError::Slave(error)) => {
                assert_eq!(error, MailboxError::Unknown(0xff));
                assert_eq!(error.code(), 0xff);
                assert_eq!(error.description(), "unknown error reply code");
            },
            other => panic!("unexpected fetch result {:?}", other),
        }
    }

    #[test]
    fn slave_error_message() {
        let message = EthercatError::Slave(MailboxError::UnsupportedProtocol).to_string();
        assert!(message.contains("0x0002"), "{}", message);
        assert!(message.contains("MBXERR_UNSUPPORTEDPROTOCOL"), "{}", message);
        let message = EthercatError::Slave(MailboxError::Unknown(0x42)).to_string();
        assert!(message.contains("0x0042"), "{}", message);
    }

    #[test]
    fn error_type_ignores_high_nibble() {
        // the high nibble of the type byte holds the counter
        let datagram = received(&[4, 0, 0x01, 0x10, 0, 0x30, 1, 0, 0x01, 0x00]);
        assert!(matches!(fetch(&slave(), &datagram), Err(EthercatError::Slave(MailboxError::Syntax))));
    }
}
