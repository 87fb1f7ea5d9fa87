/*!
	low level ethercat communication functions.

	It wraps an ethercat socket to schedule, send and receive ethercat frames containing datagrams (PDUs).

	Unlike an asynchronous master that sends PDUs whenever a task asks for it, this transport works by cycles: datagrams are prepared and queued by their owners, all queued datagrams are sent at once by [RawMaster::send], and all answers are collected by [RawMaster::receive]. Between those calls, the owner of each datagram can inspect its state and data.
*/

use std::{
    collections::HashMap,
    time::Instant,
    };
use core::time::Duration;
use bilge::prelude::*;
use log::{debug, trace, warn};

use crate::{
    socket::EthercatSocket,
    data::{self, PduData, Storage, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// maximum frame size, limited by the ethernet payload size
pub const MAX_ETHERCAT_FRAME: usize = 1500;
/// maximum data size of one datagram, so that it fits alone in a frame
pub const MAX_DATAGRAM_DATA: usize = MAX_ETHERCAT_FRAME
                                    - <<EthercatHeader as PduData>::Packed as Storage>::LEN
                                    - <<PduHeader as PduData>::Packed as Storage>::LEN
                                    - <<PduFooter as PduData>::Packed as Storage>::LEN;
/// number of distinct PDU indices, hence of datagrams in flight at the same time
const MAX_IN_FLIGHT: usize = 256;

/// what a [RawMaster::send] did so far, to restore the queue if it fails
#[derive(Default)]
struct SendProgress {
    /// number of queue entries handled
    handled: usize,
    /// datagrams packed in the frame not sent yet, with their PDU index
    unflushed: Vec<(u8, DatagramIndex)>,
    /// datagrams kept for the next send
    postponed: Vec<DatagramIndex>,
    /// command of a datagram that cannot fit in any frame
    oversized: Option<PduCommand>,
    frames: usize,
}


/// stable identifier of a datagram in a [RawMaster]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DatagramIndex(usize);

/// progress of a datagram through a transport cycle
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DatagramState {
    /// prepared but not queued
    Init,
    /// waiting for the next [RawMaster::send]
    Queued,
    /// sent, waiting for its answer
    Sent,
    /// answer received, data and working counter are valid
    Received,
    /// no answer came back in time
    TimedOut,
    /// an answer came back but does not match the request
    Error,
}

/**
    one transport exchange unit: a PDU command, its addresses and data buffer.

    The data buffer is sent as is and replaced by the answer received. A datagram is owned by the [RawMaster] and borrowed by the component issuing it, the buffer content is only meaningful according to [Self::state].
*/
#[derive(Clone, Debug)]
pub struct Datagram {
    command: PduCommand,
    /// slave address, its meaning depends on the command (low word of a logical address)
    slave: u16,
    /// memory address (high word of a logical address)
    memory: u16,
    data: Vec<u8>,
    state: DatagramState,
    working_counter: u16,
    cycle: u64,
}
impl Datagram {
    pub fn new() -> Self {
        Self {
            command: PduCommand::NOP,
            slave: 0,
            memory: 0,
            data: Vec::new(),
            state: DatagramState::Init,
            working_counter: 0,
            cycle: 0,
        }
    }

    fn prepare(&mut self, command: PduCommand, slave: u16, memory: u16, size: usize) -> EthercatResult {
        if size > MAX_DATAGRAM_DATA
            {return Err(EthercatError::Master("datagram data does not fit in a frame"))}
        self.command = command;
        self.slave = slave;
        self.memory = memory;
        self.data.clear();
        self.data.resize(size, 0);
        self.state = DatagramState::Init;
        self.working_counter = 0;
        Ok(())
    }

    /// auto-incremented slave read, `position` is the topological index of the slave
    pub fn aprd(&mut self, position: u16, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::APRD, 0u16.wrapping_sub(position), offset, size)
    }
    /// auto-incremented slave write, `position` is the topological index of the slave
    pub fn apwr(&mut self, position: u16, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::APWR, 0u16.wrapping_sub(position), offset, size)
    }
    /// fixed slave read
    pub fn fprd(&mut self, station: u16, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::FPRD, station, offset, size)
    }
    /// fixed slave write
    pub fn fpwr(&mut self, station: u16, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::FPWR, station, offset, size)
    }
    /// broadcast read
    pub fn brd(&mut self, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::BRD, 0, offset, size)
    }
    /// broadcast write
    pub fn bwr(&mut self, offset: u16, size: usize) -> EthercatResult {
        self.prepare(PduCommand::BWR, 0, offset, size)
    }
    /// logical memory read
    pub fn lrd(&mut self, address: u32, size: usize) -> EthercatResult {
        self.prepare(PduCommand::LRD, address as u16, (address >> 16) as u16, size)
    }
    /// logical memory write
    pub fn lwr(&mut self, address: u32, size: usize) -> EthercatResult {
        self.prepare(PduCommand::LWR, address as u16, (address >> 16) as u16, size)
    }
    /// logical memory read & write
    pub fn lrw(&mut self, address: u32, size: usize) -> EthercatResult {
        self.prepare(PduCommand::LRW, address as u16, (address >> 16) as u16, size)
    }

    pub fn command(&self) -> PduCommand  {self.command}
    /// slave address as put in the PDU header
    pub fn slave(&self) -> u16  {self.slave}
    /// memory address as put in the PDU header
    pub fn memory(&self) -> u16  {self.memory}
    /// full logical address, only meaningful for logical commands
    pub fn logical(&self) -> u32  {u32::from(self.slave) | (u32::from(self.memory) << 16)}
    pub fn data(&self) -> &[u8]  {&self.data}
    pub fn data_mut(&mut self) -> &mut [u8]  {&mut self.data}
    pub fn state(&self) -> DatagramState  {self.state}
    /// number of slaves who processed the command, valid once [DatagramState::Received]
    pub fn working_counter(&self) -> u16  {self.working_counter}
    /// send sequence number of the frame this datagram was last sent in
    pub fn cycle(&self) -> u64  {self.cycle}
}
impl Default for Datagram {
    fn default() -> Self {Self::new()}
}

/// counters of what the transport did since its creation
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub datagrams_timed_out: u64,
    /// PDUs received that answer no datagram in flight
    pub unmatched: u64,
}

/**
    low level ethercat communication functions, with no notion of slave.

    genericity allows to use a UDP socket or raw ethernet socket, see [crate::socket] for more details.

    This struct does not do any checking of the communication states on the slaves, and has no notion of slave, it is just executing the basic commands.

    The ethercat low level is all about PDUs: an ethercat frame intended for slaves is a PDU frame and PDU frames contain any number of PDU (Process Data Unit), each PDU is a command, acting on one of the 2 memories types:

   - **Physical Memory** (aka. registers)

		each slave has its own physical memory, commands for physical memory (`*P*`, `B*`) are addressing a specific slave, or combining the memory reads from all slaves

	- **Logical Memory** (aka. fieldbus memory)

		this memory doesn't physically exist anywhere, but can be read/write using `L*`  commands with each slave contributing to the record according to the configuration set before.

	See variants of [PduCommand] for more details.
*/
pub struct RawMaster<S: EthercatSocket> {
	socket: S,
	datagrams: Vec<Datagram>,
	/// datagrams to put in the next frames, in queuing order
	queue: Vec<DatagramIndex>,
	/// datagrams sent and not answered yet, by PDU index
	in_flight: HashMap<u8, DatagramIndex>,
	next_index: u8,
	/// send sequence number, incremented on every [Self::send]
	sequence: u64,
	stats: TransportStats,
}
impl<S: EthercatSocket> RawMaster<S> {
	pub fn new(socket: S) -> Self {
        Self {
            socket,
            datagrams: Vec::new(),
            queue: Vec::new(),
            in_flight: HashMap::new(),
            next_index: 0,
            sequence: 0,
            stats: TransportStats::default(),
        }
	}
	/// give the socket back, every datagram is dropped
	pub fn release(self) -> S {self.socket}

	pub fn socket(&self) -> &S {&self.socket}

	/// create a new datagram owned by this transport
	pub fn allocate(&mut self) -> DatagramIndex {
        self.datagrams.push(Datagram::new());
        DatagramIndex(self.datagrams.len() - 1)
	}
	pub fn datagram(&self, index: DatagramIndex) -> &Datagram {
        &self.datagrams[index.0]
	}
	pub fn datagram_mut(&mut self, index: DatagramIndex) -> &mut Datagram {
        &mut self.datagrams[index.0]
	}
	/// sequence number the next call to [Self::send] will tag datagrams with
	pub fn sequence(&self) -> u64 {self.sequence}
	pub fn stats(&self) -> TransportStats {self.stats}
	/// number of datagrams sent and not yet answered
	pub fn in_flight(&self) -> usize {self.in_flight.len()}

	/// mark a prepared datagram for sending in the next frame
	pub fn queue(&mut self, index: DatagramIndex) {
        if self.datagrams[index.0].state == DatagramState::Sent
            {return}
        self.datagrams[index.0].state = DatagramState::Queued;
        // a datagram left queued by a failed send may be prepared again
        if ! self.queue.contains(&index) {
            self.queue.push(index);
        }
	}

	/// maximum data size of a datagram sent alone in a frame of this socket
	pub fn max_datagram_data(&self) -> usize {
        self.socket.max_frame().min(MAX_ETHERCAT_FRAME)
            .saturating_sub(MAX_ETHERCAT_FRAME - MAX_DATAGRAM_DATA)
	}

	/**
        send all queued datagrams, packed in as few frames as possible

        returns the number of frames sent. Datagrams that cannot be sent because too many are already in flight stay queued for the next call.

        If the socket fails, the datagrams not sent yet stay queued for the next call. A datagram too big for any frame of the socket is marked [DatagramState::Error] and reported once sending is over.
	*/
	pub fn send(&mut self) -> EthercatResult<usize> {
        let sequence = self.sequence;
        self.sequence += 1;
        let queue = core::mem::take(&mut self.queue);
        let mut progress = SendProgress::default();
        match self.send_queue(&queue, sequence, &mut progress) {
            Ok(()) => {
                self.queue = progress.postponed;
                match progress.oversized {
                    Some(command) => {
                        warn!("{:?} datagram does not fit in a frame of this socket", command);
                        Err(EthercatError::Master("datagram does not fit in a frame of this socket"))
                    },
                    None => Ok(progress.frames),
                }
            },
            Err(error) => {
                // the frame being built never left, its datagrams are still to send
                for (token, index) in progress.unflushed.iter() {
                    self.in_flight.remove(token);
                    self.datagrams[index.0].state = DatagramState::Queued;
                }
                self.queue = progress.unflushed.iter().map(|(_, index)| *index)
                    .chain(progress.postponed)
                    .chain(queue[progress.handled ..].iter().copied())
                    .collect();
                warn!("send interrupted, {} datagrams kept for the next send", self.queue.len());
                Err(error)
            },
        }
	}

	fn send_queue(&mut self, queue: &[DatagramIndex], sequence: u64, progress: &mut SendProgress) -> EthercatResult {
        let max_frame = self.socket.max_frame().min(MAX_ETHERCAT_FRAME);
        let mut frame = [0u8; MAX_ETHERCAT_FRAME];
        let mut end = EthercatHeader::packed_size();
        let mut last: Option<usize> = None;

        for (i, &index) in queue.iter().enumerate() {
            if self.in_flight.len() >= MAX_IN_FLIGHT {
                progress.postponed.push(index);
                progress.handled = i + 1;
                continue;
            }
            let size = self.datagrams[index.0].data.len();
            let needed = PduHeader::packed_size() + size + PduFooter::packed_size();
            if EthercatHeader::packed_size() + needed > max_frame {
                self.datagrams[index.0].state = DatagramState::Error;
                progress.oversized = Some(self.datagrams[index.0].command);
                progress.handled = i + 1;
                continue;
            }
            if end + needed > max_frame {
                self.flush(&mut frame, end)?;
                progress.unflushed.clear();
                progress.frames += 1;
                end = EthercatHeader::packed_size();
                last = None;
            }
            // the previous PDU is now followed by an other
            if let Some(start) = last {
                let mut header = PduHeader::unpack(&frame[start ..])?;
                header.set_next(true);
                header.pack(&mut frame[start ..])?;
            }
            let token = self.reserve_index(index);
            progress.unflushed.push((token, index));
            progress.handled = i + 1;

            let datagram = &mut self.datagrams[index.0];
            let mut cursor = Cursor::new(&mut frame[end ..]);
            cursor.pack(&PduHeader::new(
                u8::from(datagram.command),
                token,
                datagram.slave,
                datagram.memory,
                u11::new(size as u16),
                u3::new(0),
                false,
                false,
                0,
                ))?;
            cursor.write(&datagram.data)?;
            cursor.pack(&PduFooter::new(0))?;
            datagram.state = DatagramState::Sent;
            datagram.cycle = sequence;
            last = Some(end);
            end += cursor.position();
        }
        if last.is_some() {
            self.flush(&mut frame, end)?;
            progress.unflushed.clear();
            progress.frames += 1;
        }
        Ok(())
	}

	/// pick a PDU index not in flight for the given datagram
	fn reserve_index(&mut self, index: DatagramIndex) -> u8 {
        while self.in_flight.contains_key(&self.next_index) {
            self.next_index = self.next_index.wrapping_add(1);
        }
        let token = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.in_flight.insert(token, index);
        token
	}

	fn flush(&mut self, frame: &mut [u8], end: usize) -> EthercatResult {
        EthercatHeader::new(
            u11::new((end - EthercatHeader::packed_size()) as u16),
            u1::new(0),
            u4::new(ETHERCAT_TYPE_PDU),
            ).pack(frame)?;
        trace!("send frame {:02x?}", &frame[.. end]);
        self.socket.send(&frame[.. end])?;
        self.stats.frames_sent += 1;
        Ok(())
	}

	/**
        receive answers until every datagram in flight is answered or the timeout expired.

        A null timeout only collects the frames already arrived. Datagrams still in flight afterwards are marked [DatagramState::TimedOut]. Returns the number of datagrams received.
	*/
	pub fn receive(&mut self, timeout: Duration) -> EthercatResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut frame = [0u8; MAX_ETHERCAT_FRAME];
        let mut received = 0;
        while ! self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.socket.receive(&mut frame, remaining)? {
                Some(size) => {
                    self.stats.frames_received += 1;
                    received += self.dispatch(&frame[.. size]);
                },
                None => break,
            }
        }
        for (_, index) in self.in_flight.drain() {
            let datagram = &mut self.datagrams[index.0];
            datagram.state = DatagramState::TimedOut;
            self.stats.datagrams_timed_out += 1;
            debug!("datagram {:?} {:?} timed out", index, datagram.command);
        }
        Ok(received)
	}

	/// extract a received frame of PDUs and store each answer in its datagram, returns the number of datagrams answered
	fn dispatch(&mut self, frame: &[u8]) -> usize {
        match self.dispatch_frame(frame) {
            Ok(received) => received,
            Err(error) => {
                warn!("dropping malformed frame: {}", error);
                0
            },
        }
	}
	fn dispatch_frame(&mut self, frame: &[u8]) -> EthercatResult<usize> {
        let header = EthercatHeader::unpack(frame)?;
        if header.ty().value() != ETHERCAT_TYPE_PDU {
            // no mailbox gateway or network variable frame shall transit to this master
            debug!("ignoring ethercat frame of type {}", header.ty());
            return Ok(0);
        }
        let content = match frame.get(EthercatHeader::packed_size() ..)
                .and_then(|content| content.get(.. usize::from(header.len().value()))) {
            Some(content) => content,
            None => return Err(EthercatError::Protocol("frame shorter than its header announces")),
        };

        let mut received = 0;
        let mut frame = Cursor::new(content);
        loop {
            let header = frame.unpack::<PduHeader>()?;
            let content = frame.read(usize::from(header.len().value()))?;
            let working_counter = frame.unpack::<PduFooter>()?.working_counter();

            match self.in_flight.remove(&header.index()) {
                Some(index) => {
                    let datagram = &mut self.datagrams[index.0];
                    if u8::from(datagram.command) != header.command()
                    || datagram.slave != header.slave_address() && ! datagram.command.is_auto_incremented()
                    || datagram.memory != header.memory_address()
                    || datagram.data.len() != content.len() {
                        warn!("PDU {} does not match datagram {:?}", header.index(), datagram.command);
                        datagram.state = DatagramState::Error;
                    }
                    else {
                        datagram.data.copy_from_slice(content);
                        datagram.working_counter = working_counter;
                        datagram.state = DatagramState::Received;
                        received += 1;
                    }
                },
                None => {
                    self.stats.unmatched += 1;
                    warn!("received PDU {} answering no datagram in flight", header.index());
                },
            }
            if ! header.next() {break}
        }
        Ok(received)
	}

	/// forget every datagram queued or in flight, answers still on the wire will be ignored
	pub fn reset(&mut self) {
        for index in self.queue.drain(..).chain(self.in_flight.drain().map(|(_, index)| index)) {
            self.datagrams[index.0].state = DatagramState::Init;
        }
	}
}


/// type of ethercat frame carrying PDUs, other types (network variables, mailbox gateway) are not handled
pub(crate) const ETHERCAT_TYPE_PDU: u8 = 0x1;

/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    pub len: u11,
    pub unused: u1,
    /// frame type
    pub ty: u4,
}
data::bilge_pdudata!(EthercatHeader, u16);

/// header of a PDU frame, this one of the possible ethercat frames
#[bitsize(80)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    pub command: u8,
    /// PDU task request identifier
    pub index: u8,
    /// slave address, its meaning depend on the command
    pub slave_address: u16,
    /// memory address of the data to access, which memory is accessed depend on the command
    pub memory_address: u16,
    /// data length following the header, excluding the footer. starting from `memory_address` in the addressed memory
    pub len: u11,
    pub unused: u3,
    pub circulating: bool,
    /// true if there is an other PDU in the same PDU frame
    pub next: bool,
    pub interrupt: u16,
}
data::bilge_pdudata!(PduHeader, u80, u128);

/// footer for PDU exchange
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct PduFooter {
    pub working_counter: u16,
}
data::bilge_pdudata!(PduFooter, u16);

/// the possible PDU commands
#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum PduCommand {
    /// no operation
    #[default]
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented slave read multiple write
    ARMW = 0x0D,
    /// fixed slave read multiple write
    FRMW = 0x0E,
}
impl PduCommand {
    /// the slave address of these commands is incremented by every slave it passes through
    pub fn is_auto_incremented(&self) -> bool {
        matches!(self, Self::APRD | Self::APWR | Self::APRW | Self::ARMW | Self::BRD | Self::BWR | Self::BRW)
    }
}
impl From<PduCommand> for u8 {
    fn from(command: PduCommand) -> u8 {command as u8}
}
impl From<u8> for PduCommand {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::APRD,
            0x02 => Self::APWR,
            0x03 => Self::APRW,
            0x04 => Self::FPRD,
            0x05 => Self::FPWR,
            0x06 => Self::FPRW,
            0x07 => Self::BRD,
            0x08 => Self::BWR,
            0x09 => Self::BRW,
            0x0A => Self::LRD,
            0x0B => Self::LWR,
            0x0C => Self::LRW,
            0x0D => Self::ARMW,
            0x0E => Self::FRMW,
            _ => Self::NOP,
        }
    }
}
