use ethercore::{
    SimulatedSocket,
    Master, MasterConfig,
    Slave, MailboxBuffer, MailboxSupport,
    MailboxType,
    };

const RX: MailboxBuffer = MailboxBuffer {offset: 0x1000, size: 128};
const TX: MailboxBuffer = MailboxBuffer {offset: 0x1080, size: 128};

fn main() {
    env_logger::init();

    let socket = SimulatedSocket::new();
    let simulated = socket.add_slave(0x1001);
    let mut master = Master::new(socket, MasterConfig::default());
    let drive = master.add_slave(Slave::new(0x1001, 0)
        .with_mailbox(MailboxSupport::from(0b100u16), RX, TX)
        ).unwrap();
    master.activate().unwrap();

    // the drive answers an SDO upload of its device type after 5 polls
    simulated.answer(TX.offset, &[10, 0, 0x01, 0x10, 0, 3,  0x00, 0x20, 0x43, 0x00, 0x10, 0x00, 0x92, 0x01, 0x02, 0x00], 5);
    let exchange = master.mailbox_request(drive, MailboxType::Can, &[0x00, 0x20, 0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]).unwrap();

    let mut cycles = 0;
    let result = loop {
        cycles += 1;
        let mut finished = None;
        master.cycle(|master| finished = master.take_exchange(exchange)).unwrap();
        if let Some(result) = finished  {break result}
    };
    match result {
        Ok(response) => println!("answer after {} cycles: {:?} {:02x?}", cycles, response.ty, response.data),
        Err(error) => println!("exchange failed after {} cycles: {}", cycles, error),
    }

    master.deactivate();
    master.release();
}
