/*!
    domains group process data of slaves into a contiguous slice of the logical memory, exchanged once per cycle.

    A domain is shaped before activation by registering fields, each one being a value of a slave's process data placed at a byte offset in the domain. Once active, the domain owns an exchange buffer and the datagrams carrying it:

    - [Domain::queue] copies the exchange buffer into the outgoing datagrams, before sending
    - [Domain::process] copies the received datagrams back into the exchange buffer, after receiving

    Between these two calls, the application reads and writes registered fields in the exchange buffer.
*/

use crate::{
    rawmaster::{RawMaster, DatagramIndex, DatagramState},
    socket::EthercatSocket,
    slave::SlaveId,
    data::{PduData, Field},
    error::{EthercatError, EthercatResult},
    };
use core::fmt;
use log::{debug, info};


/// identifier of a [Domain] in a [crate::Master]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DomainId(pub(crate) usize);

/**
    human readable location of a process data field: which slave, and which of its values

    It is only kept for diagnostics, the byte offset given at registration is what actually locates the field in the domain.
*/
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldLocator {
    /// alias or ring position of the slave
    pub position: u16,
    pub vendor: String,
    pub product: String,
    /// name of the value in the slave's process data
    pub name: String,
}
impl FieldLocator {
    pub fn new(position: u16, vendor: impl Into<String>, product: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            position,
            vendor: vendor.into(),
            product: product.into(),
            name: name.into(),
        }
    }
}
impl fmt::Display for FieldLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.position, self.vendor, self.product, self.name)
    }
}

/// one entry of a bulk field registration, see [crate::Master::register_fields]
#[derive(Clone, Debug)]
pub struct FieldInit {
    pub slave: SlaveId,
    pub locator: FieldLocator,
    /// byte offset of the value in the domain
    pub offset: usize,
}

/**
    handle to a value of type `T` in a domain's exchange buffer

    It is only valid for the domain it was registered in, and can only be read or written while the master is active.
*/
pub struct DomainField<T: PduData> {
    pub(crate) domain: DomainId,
    pub(crate) field: Field<T>,
}
impl<T: PduData> DomainField<T> {
    pub fn domain(&self) -> DomainId  {self.domain}
    /// position of the value in the domain's exchange buffer
    pub fn field(&self) -> Field<T>  {self.field}
}
impl<T: PduData> Clone for DomainField<T> {
    fn clone(&self) -> Self  {Self {domain: self.domain, field: self.field}}
}
impl<T: PduData> Copy for DomainField<T> {}
impl<T: PduData> fmt::Debug for DomainField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainField{{{:?}, {:?}}}", self.domain, self.field)
    }
}

/// field registered in a domain
#[derive(Clone, Debug)]
struct Registered {
    slave: SlaveId,
    locator: FieldLocator,
    byte: usize,
    len: usize,
}

/// health of a domain's exchanges
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DomainState {
    /// sum of the working counters of the domain's datagrams in the last processed cycle
    pub working_counter: u16,
    /// number of cycles whose data did not come back, the exchange buffer kept its previous content
    pub lost: u64,
    /// number of cycles whose data was processed
    pub processed: u64,
}

/// contiguous process data of several slaves, see the module documentation
pub struct Domain {
    id: DomainId,
    fields: Vec<Registered>,
    size: usize,
    /// start of the domain in the logical memory, set at activation
    base: u32,
    active: bool,
    data: Vec<u8>,
    /// one datagram per chunk of the domain
    datagrams: Vec<DatagramIndex>,
    /// byte size of a chunk, fitting alone in a frame of the socket
    chunk: usize,
    /// sequence number of the send carrying the last queued data
    expected: Option<u64>,
    state: DomainState,
}
impl Domain {
    pub(crate) fn new(id: DomainId) -> Self {
        Self {
            id,
            fields: Vec::new(),
            size: 0,
            base: 0,
            active: false,
            data: Vec::new(),
            datagrams: Vec::new(),
            chunk: 0,
            expected: None,
            state: DomainState::default(),
        }
    }

    pub fn id(&self) -> DomainId  {self.id}
    /// byte size of the exchange buffer
    pub fn size(&self) -> usize  {self.size}
    /// start address in the logical memory, only meaningful once activated
    pub fn base(&self) -> u32  {self.base}
    pub fn is_active(&self) -> bool  {self.active}
    pub fn state(&self) -> DomainState  {self.state}
    /// number of fields registered
    pub fn len(&self) -> usize  {self.fields.len()}
    pub fn is_empty(&self) -> bool  {self.fields.is_empty()}

    /// bind a value of type `T` at `offset` in the domain
    pub fn register_field<T: PduData>(&mut self, slave: SlaveId, locator: FieldLocator, offset: usize) -> EthercatResult<DomainField<T>> {
        if self.active
            {return Err(EthercatError::DomainAlreadyActive)}
        let field = Field::<T>::simple(offset);
        debug!("domain {:?} registers {} at {:?}", self.id, locator, field);
        self.size = self.size.max(field.end());
        self.fields.push(Registered {slave, locator, byte: field.byte, len: field.len});
        Ok(DomainField {domain: self.id, field})
    }

    /// locator of the registered field covering the given byte of the domain, for diagnostics
    pub fn locate(&self, byte: usize) -> Option<(SlaveId, &FieldLocator)> {
        self.fields.iter()
            .find(|field| (field.byte .. field.byte + field.len).contains(&byte))
            .map(|field| (field.slave, &field.locator))
    }

    /// lock the shape of the domain and allocate its exchange buffer at `base` in the logical memory
    pub(crate) fn activate<S: EthercatSocket>(&mut self, base: u32, transport: &mut RawMaster<S>) -> EthercatResult {
        let chunk = transport.max_datagram_data();
        if chunk == 0
            {return Err(EthercatError::Master("socket frames cannot carry process data"))}
        let chunks = (self.size + chunk - 1) / chunk;
        while self.datagrams.len() < chunks {
            self.datagrams.push(transport.allocate());
        }
        self.datagrams.truncate(chunks);
        self.chunk = chunk;
        self.base = base;
        self.data = vec![0; self.size];
        self.expected = None;
        self.state = DomainState::default();
        self.active = true;
        debug!("domain {:?} exchanged in {} datagrams of at most {} bytes", self.id, chunks, chunk);
        Ok(())
    }
    /// release the exchange buffer, fields cannot be accessed anymore
    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.data = Vec::new();
        self.expected = None;
    }

    /// chunks of the domain, each exchanged by one datagram
    fn chunks(&self) -> impl Iterator<Item=(DatagramIndex, usize, usize)> + '_ {
        let (size, chunk) = (self.size, self.chunk);
        self.datagrams.iter().enumerate()
            .map(move |(i, &datagram)| {
                let start = i * chunk;
                (datagram, start, (size - start).min(chunk))
            })
    }

    /// copy the exchange buffer into the domain's datagrams and queue them for the next send
    pub fn queue<S: EthercatSocket>(&mut self, transport: &mut RawMaster<S>) -> EthercatResult {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        for (index, start, len) in self.chunks() {
            let datagram = transport.datagram_mut(index);
            datagram.lrw(self.base + start as u32, len)?;
            datagram.data_mut().copy_from_slice(&self.data[start .. start + len]);
            transport.queue(index);
        }
        self.expected = Some(transport.sequence());
        Ok(())
    }

    /**
        copy the received datagrams into the exchange buffer

        Data is only accepted if all the domain's datagrams came back from the send following the last [Self::queue]. Otherwise the exchange buffer is left untouched and the cycle counts as lost.
    */
    pub fn process<S: EthercatSocket>(&mut self, transport: &RawMaster<S>) -> EthercatResult {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        let expected = match self.expected.take() {
            Some(expected) => expected,
            None => return Ok(()),
        };
        let complete = self.chunks().all(|(index, _, _)| {
            let datagram = transport.datagram(index);
            datagram.state() == DatagramState::Received && datagram.cycle() == expected
        });
        if ! complete {
            self.state.lost += 1;
            debug!("domain {:?} lost data of send {}", self.id, expected);
            return Ok(());
        }

        let mut working_counter = 0u16;
        for (index, start, len) in self.chunks().collect::<Vec<_>>() {
            let datagram = transport.datagram(index);
            self.data[start .. start + len].copy_from_slice(datagram.data());
            working_counter = working_counter.wrapping_add(datagram.working_counter());
        }
        if working_counter != self.state.working_counter {
            info!("domain {:?} working counter changed to {}", self.id, working_counter);
        }
        self.state.working_counter = working_counter;
        self.state.processed += 1;
        Ok(())
    }

    /// the exchange buffer, only accessible while active
    pub fn data(&self) -> EthercatResult<&[u8]> {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        Ok(&self.data)
    }
    pub fn data_mut(&mut self) -> EthercatResult<&mut [u8]> {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        Ok(&mut self.data)
    }

    /// read a registered value from the exchange buffer
    pub fn get<T: PduData>(&self, field: DomainField<T>) -> EthercatResult<T> {
        if field.domain != self.id
            {return Err(EthercatError::Master("field belongs to another domain"))}
        Ok(field.field.get(self.data()?)?)
    }
    /// write a registered value to the exchange buffer
    pub fn set<T: PduData>(&mut self, field: DomainField<T>, value: T) -> EthercatResult {
        if field.domain != self.id
            {return Err(EthercatError::Master("field belongs to another domain"))}
        Ok(field.field.set(self.data_mut()?, value)?)
    }
}
