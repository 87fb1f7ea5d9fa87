use std::{
    io,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    };
use core::time::Duration;
use super::EthercatSocket;
use crate::{
    data::PduData,
    rawmaster::{PduCommand, EthercatHeader, PduHeader, ETHERCAT_TYPE_PDU},
    registers,
    };


/// size of the physical memory of every simulated slave
const SLAVE_MEMORY: usize = 0x2000;
const PDU_HEADER: usize = 10;
const PDU_FOOTER: usize = 2;

/**
    in-process ethercat segment, answering frames like a chain of slaves would

    It is meant for tests and demos without hardware: every frame sent is processed immediately by the simulated slaves, and its answer is made available to the next call to [EthercatSocket::receive].

    - physical memory commands (`*P*`, `B*`) act on each slave's own memory
    - logical memory commands (`L*`) act on a logical memory image shared by all slaves, write commands store the data and read commands return it. Inputs set with [Self::set_input] override what is read back, as if slaves were producing these values.
*/
#[derive(Clone)]
pub struct SimulatedSocket {
    segment: Arc<Mutex<Segment>>,
}

/// handle on one slave of a [SimulatedSocket], allowing to inspect or drive its memory
#[derive(Clone)]
pub struct SimulatedSlave {
    segment: Arc<Mutex<Segment>>,
    index: usize,
}

struct Segment {
    slaves: Vec<SlaveMemory>,
    logical: Vec<u8>,
    inputs: Vec<(u32, Vec<u8>)>,
    answers: VecDeque<Vec<u8>>,
    /// number of the next frames that will get no answer
    lose: usize,
    /// number of the next sends that will fail
    fail: usize,
    max_frame: usize,
    sent: u64,
}

struct SlaveMemory {
    station: u16,
    memory: Vec<u8>,
    pending: Option<PendingAnswer>,
    /// offset of the mailbox answer currently presented to the master
    presented: Option<u16>,
}

struct PendingAnswer {
    offset: u16,
    frame: Vec<u8>,
    /// number of mailbox state reads before the answer gets available
    checks: u32,
}

fn lock(segment: &Mutex<Segment>) -> MutexGuard<'_, Segment> {
    // a panicking test thread must not hide the segment content to others
    segment.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedSocket {
    pub fn new() -> Self {
        Self {segment: Arc::new(Mutex::new(Segment {
            slaves: Vec::new(),
            logical: Vec::new(),
            inputs: Vec::new(),
            answers: VecDeque::new(),
            lose: 0,
            fail: 0,
            max_frame: crate::rawmaster::MAX_ETHERCAT_FRAME,
            sent: 0,
        }))}
    }
    /// append a slave at the end of the segment, answering to the given fixed station address
    pub fn add_slave(&self, station: u16) -> SimulatedSlave {
        let mut segment = lock(&self.segment);
        segment.slaves.push(SlaveMemory {
            station,
            memory: vec![0; SLAVE_MEMORY],
            pending: None,
            presented: None,
        });
        SimulatedSlave {segment: self.segment.clone(), index: segment.slaves.len() - 1}
    }
    /// make the logical memory at `address` read back as `value`, whatever is written there
    pub fn set_input(&self, address: u32, value: &[u8]) {
        let mut segment = lock(&self.segment);
        segment.inputs.retain(|(start, _)| *start != address);
        segment.inputs.push((address, value.to_vec()));
    }
    /// current content of the logical memory image
    pub fn logical(&self, address: u32, size: usize) -> Vec<u8> {
        let segment = lock(&self.segment);
        let start = address as usize;
        (start .. start + size)
            .map(|i| segment.logical.get(i).copied().unwrap_or(0))
            .collect()
    }
    /// the next `count` frames sent will be lost, as if a cable was unplugged
    pub fn lose_next(&self, count: usize) {
        lock(&self.segment).lose += count;
    }
    /// the next `count` calls to send will fail without reaching the segment, as if the interface was down
    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.segment).fail += count;
    }
    /// limit the frame size accepted, as a medium with a smaller payload would do
    pub fn set_max_frame(&self, size: usize) {
        lock(&self.segment).max_frame = size;
    }
    /// number of frames sent to the segment so far
    pub fn sent(&self) -> u64 {
        lock(&self.segment).sent
    }
}
impl Default for SimulatedSocket {
    fn default() -> Self {Self::new()}
}

impl EthercatSocket for SimulatedSocket {
    fn receive(&self, data: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
        // answers are produced at sending, so waiting cannot bring more
        match lock(&self.segment).answers.pop_front() {
            Some(answer) => {
                if answer.len() > data.len()
                    {return Err(io::Error::new(io::ErrorKind::InvalidData, "received frame exceeds buffer"))}
                data[.. answer.len()].copy_from_slice(&answer);
                Ok(Some(answer.len()))
            },
            None => Ok(None),
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut segment = lock(&self.segment);
        if segment.fail > 0 {
            segment.fail -= 1;
            return Err(io::Error::new(io::ErrorKind::NetworkDown, "simulated send failure"));
        }
        if data.len() > segment.max_frame
            {return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds the medium"))}
        segment.sent += 1;
        if segment.lose > 0 {
            segment.lose -= 1;
            return Ok(());
        }
        let mut frame = data.to_vec();
        segment.process(&mut frame)
            .map_err(|message| io::Error::new(io::ErrorKind::InvalidInput, message))?;
        segment.answers.push_back(frame);
        Ok(())
    }
    fn max_frame(&self) -> usize  {lock(&self.segment).max_frame}
}

impl Segment {
    /// answer all PDUs of a frame in place
    fn process(&mut self, frame: &mut [u8]) -> Result<(), &'static str> {
        let header = EthercatHeader::unpack(frame).map_err(|_| "frame too short")?;
        if header.ty().value() != ETHERCAT_TYPE_PDU
            {return Err("not a PDU frame")}
        let mut position = EthercatHeader::packed_size();
        loop {
            let mut pdu = frame.get(position ..)
                .and_then(|remain| PduHeader::unpack(remain).ok())
                .ok_or("truncated PDU header")?;
            let start = position + PDU_HEADER;
            let end = start + usize::from(pdu.len().value());
            if end + PDU_FOOTER > frame.len()
                {return Err("truncated PDU")}

            let counter = self.execute(&mut pdu, &mut frame[start .. end]);
            let previous = u16::from_le_bytes([frame[end], frame[end+1]]);
            frame[end .. end + PDU_FOOTER].copy_from_slice(&previous.wrapping_add(counter).to_le_bytes());
            pdu.pack(&mut frame[position ..]).map_err(|_| "truncated PDU header")?;

            position = end + PDU_FOOTER;
            if ! pdu.next() {break}
        }
        Ok(())
    }

    /// execute one PDU command on the slaves, returning the working counter increment
    fn execute(&mut self, pdu: &mut PduHeader, data: &mut [u8]) -> u16 {
        let command = PduCommand::from(pdu.command());
        let offset = usize::from(pdu.memory_address());
        let mut counter = 0;
        match command {
            PduCommand::FPRD | PduCommand::FPWR | PduCommand::FPRW => {
                let station = pdu.slave_address();
                if let Some(slave) = self.slaves.iter_mut().find(|slave| slave.station == station) {
                    counter = slave.access(command, offset, data);
                }
            },
            PduCommand::APRD | PduCommand::APWR | PduCommand::APRW => {
                let address = pdu.slave_address();
                for (position, slave) in self.slaves.iter_mut().enumerate() {
                    if address.wrapping_add(position as u16) == 0 {
                        counter = slave.access(command, offset, data);
                    }
                }
                pdu.set_slave_address(address.wrapping_add(self.slaves.len() as u16));
            },
            PduCommand::BRD => {
                let mut combined = vec![0; data.len()];
                for slave in self.slaves.iter_mut() {
                    let mut read = data.to_vec();
                    counter += slave.access(PduCommand::FPRD, offset, &mut read);
                    for (dst, src) in combined.iter_mut().zip(read) {*dst |= src}
                }
                data.copy_from_slice(&combined);
                pdu.set_slave_address(pdu.slave_address().wrapping_add(self.slaves.len() as u16));
            },
            PduCommand::BWR => {
                for slave in self.slaves.iter_mut() {
                    counter += slave.access(PduCommand::FPWR, offset, data);
                }
                pdu.set_slave_address(pdu.slave_address().wrapping_add(self.slaves.len() as u16));
            },
            PduCommand::LRD | PduCommand::LWR | PduCommand::LRW => {
                if self.slaves.is_empty() {return 0}
                let address = (u32::from(pdu.slave_address()) | (u32::from(pdu.memory_address()) << 16)) as usize;
                let end = address + data.len();
                if self.logical.len() < end {
                    self.logical.resize(end, 0);
                }
                let written = data.to_vec();
                if command != PduCommand::LWR {
                    if command == PduCommand::LRD {
                        data.copy_from_slice(&self.logical[address .. end]);
                    }
                    for (start, value) in self.inputs.iter() {
                        let start = *start as usize;
                        for (i, byte) in value.iter().enumerate() {
                            if (address .. end).contains(&(start + i)) {
                                data[start + i - address] = *byte;
                            }
                        }
                    }
                }
                if command != PduCommand::LRD {
                    self.logical[address .. end].copy_from_slice(&written);
                }
                counter = self.slaves.len() as u16;
            },
            _ => {},
        }
        counter
    }
}

impl SlaveMemory {
    /// execute a physical memory access, returning the working counter increment
    fn access(&mut self, command: PduCommand, offset: usize, data: &mut [u8]) -> u16 {
        let end = offset + data.len();
        if end > self.memory.len()  {return 0}
        let status = registers::sync_manager::mailbox_state.byte;

        if matches!(command, PduCommand::FPRD | PduCommand::APRD | PduCommand::FPRW | PduCommand::APRW) {
            // polling the mailbox state brings the pending answer closer
            if (offset .. end).contains(&(status + 5)) {
                self.advance_mailbox();
            }
            let previous = self.memory[offset .. end].to_vec();
            if matches!(command, PduCommand::FPRW | PduCommand::APRW) {
                self.memory[offset .. end].copy_from_slice(data);
            }
            data.copy_from_slice(&previous);
            // reading the answer frees the mailbox
            if let Some(presented) = self.presented {
                if offset == usize::from(presented) {
                    self.memory[status + 5] &= !0x08;
                    self.presented = None;
                }
            }
            if matches!(command, PduCommand::FPRW | PduCommand::APRW) {3} else {1}
        }
        else {
            self.memory[offset .. end].copy_from_slice(data);
            1
        }
    }

    fn advance_mailbox(&mut self) {
        if self.presented.is_some()  {return}
        let ready = match self.pending.as_mut() {
            Some(pending) => {
                pending.checks = pending.checks.saturating_sub(1);
                pending.checks == 0
            },
            None => false,
        };
        if ! ready  {return}
        if let Some(pending) = self.pending.take() {
            let start = usize::from(pending.offset);
            let end = (start + pending.frame.len()).min(self.memory.len());
            self.memory[start .. end].copy_from_slice(&pending.frame[.. end - start]);
            self.memory[registers::sync_manager::mailbox_state.byte + 5] |= 0x08;
            self.presented = Some(pending.offset);
        }
    }
}

impl SimulatedSlave {
    pub fn station(&self) -> u16 {
        lock(&self.segment).slaves[self.index].station
    }
    /// content of the slave's physical memory
    pub fn read(&self, offset: u16, size: usize) -> Vec<u8> {
        let segment = lock(&self.segment);
        let start = usize::from(offset);
        segment.slaves[self.index].memory[start .. start + size].to_vec()
    }
    /// overwrite the slave's physical memory
    pub fn write(&self, offset: u16, data: &[u8]) {
        let mut segment = lock(&self.segment);
        let start = usize::from(offset);
        segment.slaves[self.index].memory[start .. start + data.len()].copy_from_slice(data);
    }
    /**
        prepare a mailbox answer, that will be presented in the slave's transmit mailbox at `offset` once the master polled the mailbox state `checks` times.

        `frame` is the complete mailbox frame, header included.
    */
    pub fn answer(&self, offset: u16, frame: &[u8], checks: u32) {
        let mut segment = lock(&self.segment);
        segment.slaves[self.index].pending = Some(PendingAnswer {
            offset,
            frame: frame.to_vec(),
            checks: checks.max(1),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawmaster::{RawMaster, DatagramState};

    #[test]
    fn physical_read_write() {
        let socket = SimulatedSocket::new();
        let slave = socket.add_slave(0x1001);
        let mut master = RawMaster::new(socket.clone());
        let write = master.allocate();
        let read = master.allocate();
        master.datagram_mut(write).fpwr(0x1001, 0x1000, 4).unwrap();
        master.datagram_mut(write).data_mut().copy_from_slice(&[1, 2, 3, 4]);
        master.datagram_mut(read).fprd(0x1001, 0x1000, 4).unwrap();
        master.queue(write);
        master.queue(read);
        assert_eq!(master.send().unwrap(), 1);
        assert_eq!(master.receive(Duration::from_millis(1)).unwrap(), 2);

        assert_eq!(slave.read(0x1000, 4), vec![1, 2, 3, 4]);
        assert_eq!(master.datagram(read).state(), DatagramState::Received);
        assert_eq!(master.datagram(read).working_counter(), 1);
        assert_eq!(master.datagram(read).data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn absent_station_is_not_counted() {
        let socket = SimulatedSocket::new();
        socket.add_slave(0x1001);
        let mut master = RawMaster::new(socket);
        let read = master.allocate();
        master.datagram_mut(read).fprd(0x2002, 0x0, 2).unwrap();
        master.queue(read);
        master.send().unwrap();
        master.receive(Duration::ZERO).unwrap();
        assert_eq!(master.datagram(read).working_counter(), 0);
    }

    #[test]
    fn lost_frames_time_out() {
        let socket = SimulatedSocket::new();
        socket.add_slave(0x1001);
        socket.lose_next(1);
        let mut master = RawMaster::new(socket);
        let read = master.allocate();
        master.datagram_mut(read).brd(0x0, 1).unwrap();
        master.queue(read);
        master.send().unwrap();
        assert_eq!(master.receive(Duration::ZERO).unwrap(), 0);
        assert_eq!(master.datagram(read).state(), DatagramState::TimedOut);
        assert_eq!(master.stats().datagrams_timed_out, 1);
    }

    #[test]
    fn logical_inputs_override() {
        let socket = SimulatedSocket::new();
        socket.add_slave(0x1001);
        socket.set_input(0x10002, &[0xaa]);
        let mut master = RawMaster::new(socket.clone());
        let exchange = master.allocate();
        master.datagram_mut(exchange).lrw(0x10000, 4).unwrap();
        master.datagram_mut(exchange).data_mut().copy_from_slice(&[1, 2, 3, 4]);
        master.queue(exchange);
        master.send().unwrap();
        master.receive(Duration::ZERO).unwrap();
        assert_eq!(master.datagram(exchange).data(), &[1, 2, 0xaa, 4]);
        assert_eq!(socket.logical(0x10000, 4), vec![1, 2, 3, 4]);
    }
}
