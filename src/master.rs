use crate::{
	socket::EthercatSocket,
	rawmaster::{RawMaster, DatagramIndex, TransportStats},
	data::PduData,
	slave::{Slave, SlaveId},
	domain::{Domain, DomainId, DomainField, FieldLocator, FieldInit},
	mailbox::{self, MailboxExchange, MailboxType, MailboxResponse, MailboxError, ExchangeId},
	scheduler::{Strategy, CyclePhase, CycleTiming},
	error::{EthercatError, EthercatResult},
	};
use core::time::Duration;
use log::{info, debug, warn};


/// settings of a [Master], fixed at creation
#[derive(Copy, Clone, Debug)]
pub struct MasterConfig {
    /// how transport and process data exchanges are ordered in a cycle
    pub strategy: Strategy,
    /// maximum time a synchronous cycle waits for its frames to come back
    pub round_trip: Duration,
    /// maximum duration of a cycle, longer cycles are reported as overruns
    pub cycle_budget: Option<Duration>,
    /// maximum number of cycles a mailbox exchange waits for the slave's answer
    pub mailbox_checks: u32,
}
impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Synchronous,
            round_trip: Duration::from_micros(500),
            cycle_budget: None,
            mailbox_checks: 100,
        }
    }
}

/**
    This struct exposes the ethercat master functions addressing the whole ethercat segment: it owns the transport, the configured slaves, the domains and the mailbox exchanges in progress.

    Its life is made of the following steps

    1. acquire with [Self::new]
    2. configure: [Self::add_slave], [Self::create_domain], [Self::register_field]
    3. [Self::activate] locks the configuration and allocates process data
    4. call [Self::cycle] once per period, typically from a [crate::CycleDriver]
    5. [Self::deactivate] stops exchanges and releases process data
    6. [Self::release] gives the socket back

    ## Example

    ```ignore
    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    let encoder = master.add_slave(Slave::new(0x1001, 0))?;
    let domain = master.create_domain()?;
    let position = master.register_field::<u32>(domain, encoder, FieldLocator::new(1, "Beckhoff", "EL5001", "InputValue"), 0)?;
    master.activate()?;
    loop {
        master.cycle(|master| {
            let value = master.get(position).unwrap();
        })?;
    }
    ```
*/
pub struct Master<S: EthercatSocket> {
    pub(crate) transport: RawMaster<S>,
    pub(crate) config: MasterConfig,
    slaves: Vec<Slave>,
    pub(crate) domains: Vec<Domain>,
    pub(crate) exchanges: Vec<Option<MailboxExchange>>,
    /// datagrams of finished exchanges, reused by the next ones
    free: Vec<DatagramIndex>,
    active: bool,
    pub(crate) phase: CyclePhase,
    pub(crate) cycles: u64,
    pub(crate) timing: CycleTiming,
}
impl<S: EthercatSocket> Master<S> {
    /// acquire a master on the given socket
    pub fn new(socket: S, config: MasterConfig) -> Self {
        Self {
            transport: RawMaster::new(socket),
            config,
            slaves: Vec::new(),
            domains: Vec::new(),
            exchanges: Vec::new(),
            free: Vec::new(),
            active: false,
            phase: CyclePhase::Idle,
            cycles: 0,
            timing: CycleTiming::default(),
        }
    }
    /// release the master and give its socket back, deactivating it if needed
    pub fn release(mut self) -> S {
        if self.active {
            self.deactivate();
        }
        info!("master released");
        self.transport.release()
    }

    pub fn config(&self) -> &MasterConfig  {&self.config}
    pub fn is_active(&self) -> bool  {self.active}
    /// current step of the cycle state machine
    pub fn phase(&self) -> CyclePhase  {self.phase}
    /// number of cycles run since activation
    pub fn cycles(&self) -> u64  {self.cycles}
    /// timing of the last cycle
    pub fn timing(&self) -> CycleTiming  {self.timing}
    pub fn transport_stats(&self) -> TransportStats  {self.transport.stats()}

    /// add a configured slave, the master will only talk to slaves added this way
    pub fn add_slave(&mut self, slave: Slave) -> EthercatResult<SlaveId> {
        if self.active
            {return Err(EthercatError::DomainAlreadyActive)}
        if self.slaves.iter().any(|other| other.station_address == slave.station_address)
            {return Err(EthercatError::Master("station address already used by another slave"))}
        debug!("adding slave {} at station {:#x}", slave.ring_position, slave.station_address);
        self.slaves.push(slave);
        Ok(SlaveId(self.slaves.len() - 1))
    }
    pub fn slave(&self, id: SlaveId) -> Option<&Slave>  {self.slaves.get(id.0)}
    pub fn slaves(&self) -> &[Slave]  {&self.slaves}

    /// create an empty domain, fields can be registered in it until activation
    pub fn create_domain(&mut self) -> EthercatResult<DomainId> {
        if self.active
            {return Err(EthercatError::DomainAlreadyActive)}
        let id = DomainId(self.domains.len());
        self.domains.push(Domain::new(id));
        Ok(id)
    }
    pub fn domain(&self, id: DomainId) -> Option<&Domain>  {self.domains.get(id.0)}

    fn domain_ref(&self, id: DomainId) -> EthercatResult<&Domain> {
        self.domains.get(id.0).ok_or(EthercatError::Master("no such domain"))
    }
    fn domain_mut(&mut self, id: DomainId) -> EthercatResult<&mut Domain> {
        self.domains.get_mut(id.0).ok_or(EthercatError::Master("no such domain"))
    }
    fn slave_ref(&self, id: SlaveId) -> EthercatResult<&Slave> {
        self.slaves.get(id.0).ok_or(EthercatError::Master("no such slave"))
    }

    /// bind a value of type `T`, located in a slave's process data, at byte `offset` of a domain
    pub fn register_field<T: PduData>(&mut self, domain: DomainId, slave: SlaveId, locator: FieldLocator, offset: usize) -> EthercatResult<DomainField<T>> {
        self.slave_ref(slave)?;
        self.domain_mut(domain)?.register_field(slave, locator, offset)
    }
    /// register several fields of the same type at once, none is registered if one fails
    pub fn register_fields<T: PduData>(&mut self, domain: DomainId, fields: &[FieldInit]) -> EthercatResult<Vec<DomainField<T>>> {
        if self.active
            {return Err(EthercatError::DomainAlreadyActive)}
        if fields.iter().any(|init| self.slave(init.slave).is_none())
            {return Err(EthercatError::Master("no such slave"))}
        let target = self.domain_mut(domain)?;
        fields.iter()
            .map(|init| target.register_field(init.slave, init.locator.clone(), init.offset))
            .collect()
    }

    /**
        lock the configuration and start cyclic operation

        Each domain gets its place in the logical memory and its exchange buffer. With the asynchronous strategy, a first exchange is sent right away so the first cycle has data to receive.
    */
    pub fn activate(&mut self) -> EthercatResult {
        if self.active
            {return Err(EthercatError::Master("master already active"))}
        match self.start() {
            Ok(size) => {
                self.active = true;
                self.cycles = 0;
                self.phase = CyclePhase::Idle;
                info!("master activated with {} domains, {} bytes of process data", self.domains.len(), size);
                Ok(())
            },
            Err(error) => {
                // nothing of a failed activation must remain
                self.transport.reset();
                for domain in self.domains.iter_mut() {
                    domain.deactivate();
                }
                warn!("master activation failed: {}", error);
                Err(error)
            },
        }
    }

    /// place the domains in the logical memory and prime the pipeline, returns the process data size
    fn start(&mut self) -> EthercatResult<u32> {
        let mut base = 0u32;
        for domain in self.domains.iter_mut() {
            base = match u32::try_from(domain.size()).ok().and_then(|size| base.checked_add(size)) {
                Some(end) => {
                    domain.activate(base, &mut self.transport)?;
                    end
                },
                None => return Err(EthercatError::Master("domains exceed the logical memory")),
            };
        }
        if self.config.strategy == Strategy::Asynchronous {
            for domain in self.domains.iter_mut() {
                domain.queue(&mut self.transport)?;
            }
            self.transport.send()?;
        }
        Ok(base)
    }

    /**
        stop cyclic operation and release process data

        Datagrams in flight are forgotten, and mailbox exchanges in progress are dropped. Registered fields cannot be accessed until the next activation.
    */
    pub fn deactivate(&mut self) {
        if ! self.active  {return}
        self.active = false;
        self.phase = CyclePhase::Idle;
        self.transport.reset();
        for domain in self.domains.iter_mut() {
            domain.deactivate();
        }
        for exchange in self.exchanges.iter_mut() {
            if let Some(exchange) = exchange.take() {
                self.free.push(exchange.datagram());
            }
        }
        info!("master deactivated after {} cycles", self.cycles);
    }

    /// read a registered value, only possible while active
    pub fn get<T: PduData>(&self, field: DomainField<T>) -> EthercatResult<T> {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        self.domain_ref(field.domain)?.get(field)
    }
    /// write a registered value, only possible while active. It will be sent at the next queue
    pub fn set<T: PduData>(&mut self, field: DomainField<T>, value: T) -> EthercatResult {
        if ! self.active
            {return Err(EthercatError::NotActive)}
        self.domain_mut(field.domain)?.set(field, value)
    }

    /**
        start a mailbox exchange with a slave: `data` is sent as payload of the given protocol and the slave's answer is collected over the next cycles.

        Fails right away if the slave cannot receive such message. The result is collected with [Self::take_exchange].
    */
    pub fn mailbox_request(&mut self, slave: SlaveId, ty: MailboxType, data: &[u8]) -> EthercatResult<ExchangeId> {
        mailbox::check_request(self.slave_ref(slave)?, data.len())?;
        let datagram = match self.free.pop() {
            Some(datagram) => datagram,
            None => self.transport.allocate(),
        };
        let exchange = MailboxExchange::new(slave, datagram, ty, data, self.config.mailbox_checks);
        let id = match self.exchanges.iter().position(Option::is_none) {
            Some(free) => {
                self.exchanges[free] = Some(exchange);
                free
            },
            None => {
                self.exchanges.push(Some(exchange));
                self.exchanges.len() - 1
            },
        };
        Ok(ExchangeId(id))
    }
    /// exchange in progress, `None` if unknown or already taken
    pub fn exchange(&self, id: ExchangeId) -> Option<&MailboxExchange> {
        self.exchanges.get(id.0).and_then(Option::as_ref)
    }
    /// result of a finished exchange, `None` while in progress. The exchange is forgotten once its result is taken
    pub fn take_exchange(&mut self, id: ExchangeId) -> Option<EthercatResult<MailboxResponse, MailboxError>> {
        let slot = self.exchanges.get_mut(id.0)?;
        if ! slot.as_ref().map_or(false, MailboxExchange::is_done)
            {return None}
        let mut exchange = slot.take()?;
        self.free.push(exchange.datagram());
        exchange.take_result()
    }

    /**
        run a mailbox exchange to its end, sending and receiving frames by itself

        This is meant for configuration steps outside of cyclic operation, it blocks for up to `mailbox_checks` round trips and must not be called while a [crate::CycleDriver] runs the master.
    */
    pub fn mailbox_transfer(&mut self, slave: SlaveId, ty: MailboxType, data: &[u8]) -> EthercatResult<MailboxResponse, MailboxError> {
        let id = match self.mailbox_request(slave, ty, data) {
            Ok(id) => id,
            Err(error) => return Err(error.upgrade()),
        };
        loop {
            if let Some(result) = self.take_exchange(id)
                {return result}
            if let Err(error) = self.exchange_step()
                {return Err(error.upgrade())}
        }
    }

    /// issue, send, receive and decode every mailbox exchange once
    fn exchange_step(&mut self) -> EthercatResult {
        self.issue_exchanges();
        self.transport.send()?;
        self.transport.receive(self.config.round_trip)?;
        self.advance_exchanges();
        Ok(())
    }

    pub(crate) fn issue_exchanges(&mut self) {
        for exchange in self.exchanges.iter_mut().flatten() {
            if let Some(slave) = self.slaves.get(exchange.slave().0) {
                exchange.issue(slave, &mut self.transport);
            }
        }
    }
    pub(crate) fn advance_exchanges(&mut self) {
        for exchange in self.exchanges.iter_mut().flatten() {
            if let Some(slave) = self.slaves.get(exchange.slave().0) {
                exchange.advance(slave, &self.transport);
            }
        }
    }
}
