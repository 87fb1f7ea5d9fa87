use core::time::Duration;
use ethercore::{
    SimulatedSocket,
    Master, MasterConfig, Strategy,
    Slave, FieldLocator,
    CycleDriver, DriverConfig, Monitor,
    };

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    // a segment with an encoder and an analog output module
    let socket = SimulatedSocket::new();
    socket.add_slave(0x1001);
    socket.add_slave(0x1002);

    let mut master = Master::new(socket.clone(), MasterConfig {
        strategy: Strategy::Asynchronous,
        cycle_budget: Some(Duration::from_micros(800)),
        .. MasterConfig::default()
        });
    let encoder = master.add_slave(Slave::new(0x1001, 0).with_identity(0x2, 0x13893052)).unwrap();
    let output = master.add_slave(Slave::new(0x1002, 1).with_identity(0x2, 0x10063052)).unwrap();

    let inputs = master.create_domain().unwrap();
    let outputs = master.create_domain().unwrap();
    let position = master.register_field::<u32>(inputs, encoder, FieldLocator::new(0, "Beckhoff", "EL5001", "InputValue"), 0).unwrap();
    let voltage = master.register_field::<i16>(outputs, output, FieldLocator::new(1, "Beckhoff", "EL4102", "Output 1"), 0).unwrap();
    master.activate().unwrap();

    let driver = CycleDriver::new(DriverConfig::default(), NoisyHost::default()).unwrap();
    let monitor = Monitor::spawn(driver.telemetry(), Duration::from_millis(100));
    let running = driver.spawn(master, move |master| {
        // follow the encoder with the analog output
        if let Ok(value) = master.get(position) {
            master.set(voltage, (value % 0x7fff) as i16).ok();
        }
    }).unwrap();

    for step in 0 .. 10u32 {
        socket.set_input(0, &(step * 1000).to_le_bytes());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sample = monitor.latest();
        println!("cycles {}  overruns {}  last cycle {} ns  output {:?}",
            sample.cycles, sample.overruns, sample.finished,
            socket.logical(4, 2));
    }

    monitor.stop();
    running.shutdown().unwrap();
    Ok(())
}

/// host timekeeper printing a dot every second
#[derive(Default)]
struct NoisyHost {
    ticks: u32,
}
impl ethercore::HostTick for NoisyHost {
    fn forward(&mut self) {
        self.ticks += 1;
        if self.ticks % 250 == 0 {
            println!("host second {}", self.ticks / 250);
        }
    }
}
