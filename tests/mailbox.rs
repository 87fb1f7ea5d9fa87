use ethercore::*;


const STATION: u16 = 0x1001;
const RX: MailboxBuffer = MailboxBuffer {offset: 0x1000, size: 128};
const TX: MailboxBuffer = MailboxBuffer {offset: 0x1080, size: 128};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// a drive supporting CoE, and the simulated slave behind it
fn bench(config: MasterConfig) -> (Master<SimulatedSocket>, SimulatedSlave, SlaveId) {
    init_logs();
    let socket = SimulatedSocket::new();
    let simulated = socket.add_slave(STATION);
    let mut master = Master::new(socket, config);
    let drive = master.add_slave(Slave::new(STATION, 0)
        .with_mailbox(MailboxSupport::from(0b100u16), RX, TX)
        .with_identity(0x2, 0x1a2c3052)
        ).unwrap();
    (master, simulated, drive)
}

/// mailbox frame as a slave would present it in its transmit mailbox
fn frame(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&STATION.to_le_bytes());
    frame.extend_from_slice(&[0, ty]);
    frame.extend_from_slice(payload);
    frame
}

/// run cycles until the exchange finishes
fn complete(master: &mut Master<SimulatedSocket>, exchange: ExchangeId, limit: usize) -> (usize, EthercatResult<MailboxResponse, MailboxError>) {
    let mut finished = None;
    for cycle in 1 ..= limit {
        master.cycle(|master| {
            if finished.is_none() {
                finished = master.take_exchange(exchange);
            }
        }).unwrap();
        if let Some(result) = finished.take() {
            return (cycle, result);
        }
    }
    panic!("exchange not finished after {} cycles", limit);
}

#[test]
fn exchange_across_cycles() {
    let (mut master, simulated, drive) = bench(MasterConfig::default());
    master.activate().unwrap();
    simulated.answer(TX.offset, &frame(3, &[0x43, 0x00, 0x18, 0x10, 0x01]), 2);

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[0x40, 0x18, 0x10, 0x01]).unwrap();
    assert_eq!(master.exchange(exchange).unwrap().step(), mailbox::ExchangeStep::Write);

    // write, two checks, fetch
    let (cycles, result) = complete(&mut master, exchange, 10);
    assert_eq!(cycles, 4);
    assert_eq!(result.unwrap(), MailboxResponse {ty: MailboxType::Can, data: vec![0x43, 0x00, 0x18, 0x10, 0x01]});
    assert_eq!(simulated.read(RX.offset, 10), vec![4, 0, 0x01, 0x10, 0, 3, 0x40, 0x18, 0x10, 0x01]);
    // the exchange is forgotten once taken
    assert!(master.exchange(exchange).is_none());
    assert!(master.take_exchange(exchange).is_none());
}

#[test]
fn exchange_in_asynchronous_cycles() {
    let (mut master, simulated, drive) = bench(MasterConfig {
        strategy: Strategy::Asynchronous,
        .. MasterConfig::default()
        });
    master.activate().unwrap();
    simulated.answer(TX.offset, &frame(3, &[1, 2]), 1);

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[9]).unwrap();
    let (_, result) = complete(&mut master, exchange, 10);
    assert_eq!(result.unwrap().data, vec![1, 2]);
}

#[test]
fn poll_timeout() {
    let (mut master, _simulated, drive) = bench(MasterConfig {
        mailbox_checks: 3,
        .. MasterConfig::default()
        });
    master.activate().unwrap();

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[1, 2, 3]).unwrap();
    let (cycles, result) = complete(&mut master, exchange, 10);
    assert_eq!(cycles, 4);
    assert!(matches!(result, Err(EthercatError::PollTimeout {cycles: 3})));
}

#[test]
fn error_reply() {
    let (mut master, simulated, drive) = bench(MasterConfig::default());
    master.activate().unwrap();
    simulated.answer(TX.offset, &frame(0, &[0x01, 0x00, 0x02, 0x00]), 1);

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[0]).unwrap();
    let (_, result) = complete(&mut master, exchange, 10);
    match result {
        Err(EthercatError::Slave(error)) => {
            assert_eq!(error, MailboxError::UnsupportedProtocol);
            assert_eq!(error.to_string(), "code 0x0002: MBXERR_UNSUPPORTEDPROTOCOL");
        },
        other => panic!("expected an error reply, got {:?}", other),
    }
}

#[test]
fn corrupt_answer() {
    let (mut master, simulated, drive) = bench(MasterConfig::default());
    master.activate().unwrap();
    let mut corrupt = frame(3, &[0; 4]);
    corrupt[0] = 123;
    simulated.answer(TX.offset, &corrupt, 1);

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[0]).unwrap();
    let (_, result) = complete(&mut master, exchange, 10);
    assert!(matches!(result, Err(EthercatError::CorruptMailboxFrame {length: 123, capacity: 128})));
}

#[test]
fn rejected_before_sending() {
    let (mut master, simulated, drive) = bench(MasterConfig::default());
    let plain = master.add_slave(Slave::new(0x1002, 1)).unwrap();

    assert!(matches!(
        master.mailbox_request(drive, MailboxType::Can, &[0; 123]),
        Err(EthercatError::PayloadTooLarge {size: 123, capacity: 128}),
        ));
    assert!(matches!(
        master.mailbox_request(plain, MailboxType::Can, &[0]),
        Err(EthercatError::UnsupportedMailbox {slave: 0x1002}),
        ));
    assert!(master.mailbox_request(drive, MailboxType::Can, &[0; 122]).is_ok());
    // nothing reached the slave
    assert_eq!(simulated.read(RX.offset, 6), vec![0; 6]);
}

#[test]
fn blocking_transfer() {
    let (mut master, simulated, drive) = bench(MasterConfig::default());
    simulated.answer(TX.offset, &frame(3, &[0x60, 0x00, 0x60, 0x00]), 3);

    let response = master.mailbox_transfer(drive, MailboxType::Can, &[0x23, 0x00, 0x60, 0x00]).unwrap();
    assert_eq!(response.ty, MailboxType::Can);
    assert_eq!(response.data, vec![0x60, 0x00, 0x60, 0x00]);
}

#[test]
fn exchanges_dropped_at_deactivation() {
    let (mut master, _simulated, drive) = bench(MasterConfig::default());
    master.activate().unwrap();
    let exchange = master.mailbox_request(drive, MailboxType::Can, &[0]).unwrap();
    master.cycle(|_| {}).unwrap();
    master.deactivate();
    assert!(master.exchange(exchange).is_none());
}

#[test]
fn exchange_survives_send_failure() {
    init_logs();
    let socket = SimulatedSocket::new();
    let simulated = socket.add_slave(STATION);
    let mut master = Master::new(socket.clone(), MasterConfig::default());
    let drive = master.add_slave(Slave::new(STATION, 0)
        .with_mailbox(MailboxSupport::from(0b100u16), RX, TX)
        ).unwrap();
    // a full frame of process data, so the mailbox write goes in a second frame
    let domain = master.create_domain().unwrap();
    master.register_field::<u8>(domain, drive, FieldLocator::default(), 1485).unwrap();
    master.activate().unwrap();
    simulated.answer(TX.offset, &frame(3, &[5, 6]), 1);

    let exchange = master.mailbox_request(drive, MailboxType::Can, &[7]).unwrap();
    socket.fail_next_sends(1);
    assert!(master.cycle(|_| {}).is_err());
    assert_eq!(master.phase(), CyclePhase::Idle);
    assert_eq!(master.exchange(exchange).unwrap().step(), mailbox::ExchangeStep::Write);

    let (_, result) = complete(&mut master, exchange, 10);
    assert_eq!(result.unwrap().data, vec![5, 6]);
    assert_eq!(simulated.read(RX.offset, 7), vec![1, 0, 0x01, 0x10, 0, 3, 7]);
}
