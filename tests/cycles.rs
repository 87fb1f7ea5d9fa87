use ethercore::*;
use core::time::Duration;
use std::time::Instant;


const ENCODER: u16 = 0x1001;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Bench {
    socket: SimulatedSocket,
    master: Master<SimulatedSocket>,
    position: DomainField<u32>,
    control: DomainField<u16>,
}

/// one encoder, with its input position and an output control word in a single domain
fn bench(config: MasterConfig) -> Bench {
    init_logs();
    let socket = SimulatedSocket::new();
    socket.add_slave(ENCODER);
    let mut master = Master::new(socket.clone(), config);
    let encoder = master.add_slave(Slave::new(ENCODER, 0).with_identity(0x2, 0x13893052)).unwrap();
    let domain = master.create_domain().unwrap();
    let position = master.register_field::<u32>(domain, encoder, FieldLocator::new(0, "Beckhoff", "EL5001", "InputValue"), 0).unwrap();
    let control = master.register_field::<u16>(domain, encoder, FieldLocator::new(0, "Beckhoff", "EL5001", "Control"), 4).unwrap();
    Bench {socket, master, position, control}
}

#[test]
fn synchronous_round_trip() {
    let Bench {socket, mut master, position, control} = bench(MasterConfig::default());
    master.activate().unwrap();

    for i in 1 .. 5u32 {
        socket.set_input(0, &(i * 100).to_le_bytes());
        let mut seen = None;
        master.cycle(|master| {
            seen = Some(master.get(position).unwrap());
            master.set(control, i as u16).unwrap();
        }).unwrap();
        // inputs are read back in the cycle they were produced
        assert_eq!(seen, Some(i * 100));
    }
    // outputs written by the application go out with the next cycle
    master.cycle(|_| {}).unwrap();
    assert_eq!(socket.logical(4, 2), vec![4, 0]);

    assert_eq!(master.cycles(), 5);
    assert_eq!(master.phase(), CyclePhase::Idle);
    let domain = master.domain(position.domain()).unwrap();
    assert_eq!(domain.state().working_counter, 1);
    assert_eq!(domain.state().processed, 5);
}

#[test]
fn asynchronous_lags_one_cycle() {
    let Bench {socket, mut master, position, ..} = bench(MasterConfig {
        strategy: Strategy::Asynchronous,
        .. MasterConfig::default()
        });
    socket.set_input(0, &0u32.to_le_bytes());
    master.activate().unwrap();

    for i in 1 .. 20u32 {
        socket.set_input(0, &i.to_le_bytes());
        let mut seen = None;
        master.cycle(|master| seen = Some(master.get(position).unwrap())).unwrap();
        assert_eq!(seen, Some(i - 1), "cycle {}", i);
    }
    let domain = master.domain(position.domain()).unwrap();
    assert_eq!(domain.state().lost, 0);
}

#[test]
fn lost_frame_keeps_previous_data() {
    let Bench {socket, mut master, position, ..} = bench(MasterConfig::default());
    master.activate().unwrap();
    socket.set_input(0, &42u32.to_le_bytes());
    master.cycle(|_| {}).unwrap();

    socket.set_input(0, &43u32.to_le_bytes());
    socket.lose_next(1);
    let mut seen = None;
    let result = master.cycle(|master| seen = Some(master.get(position).unwrap()));
    assert!(matches!(result, Err(EthercatError::CycleOverrun {..})));
    assert_eq!(seen, Some(42));
    assert_eq!(master.domain(position.domain()).unwrap().state().lost, 1);

    // the next cycle recovers
    master.cycle(|master| seen = Some(master.get(position).unwrap())).unwrap();
    assert_eq!(seen, Some(43));
}

#[test]
fn cycle_budget_overrun() {
    let Bench {mut master, ..} = bench(MasterConfig {
        cycle_budget: Some(Duration::from_millis(1)),
        .. MasterConfig::default()
        });
    master.activate().unwrap();
    let mut ran = false;
    let late = Instant::now() - Duration::from_millis(10);
    let result = master.cycle_from(late, |_| ran = true);
    assert!(ran);
    match result {
        Err(EthercatError::CycleOverrun {elapsed, budget}) => {
            assert!(elapsed >= Duration::from_millis(10));
            assert_eq!(budget, Duration::from_millis(1));
        },
        other => panic!("expected an overrun, got {:?}", other),
    }
    // the cycle completed anyway
    assert_eq!(master.cycles(), 1);
    assert!(master.timing().finished >= Duration::from_millis(10));
}

#[test]
fn use_after_deactivate() {
    let Bench {mut master, position, control, ..} = bench(MasterConfig::default());
    assert!(matches!(master.get(position), Err(EthercatError::NotActive)));
    assert!(matches!(master.cycle(|_| {}), Err(EthercatError::NotActive)));

    master.activate().unwrap();
    master.cycle(|_| {}).unwrap();
    master.deactivate();

    assert!(! master.is_active());
    assert!(matches!(master.get(position), Err(EthercatError::NotActive)));
    assert!(matches!(master.set(control, 1), Err(EthercatError::NotActive)));
    assert!(matches!(master.cycle(|_| {}), Err(EthercatError::NotActive)));
}

#[test]
fn shape_locked_when_active() {
    let Bench {mut master, position, ..} = bench(MasterConfig::default());
    master.activate().unwrap();
    let encoder = master.slaves().iter().position(|slave| slave.station_address == ENCODER).unwrap();
    assert_eq!(encoder, 0);

    assert!(matches!(master.create_domain(), Err(EthercatError::DomainAlreadyActive)));
    assert!(matches!(master.add_slave(Slave::new(0x1002, 1)), Err(EthercatError::DomainAlreadyActive)));
    let domain = position.domain();
    let fields = [FieldInit {
        slave: master.domain(domain).unwrap().locate(0).unwrap().0,
        locator: FieldLocator::default(),
        offset: 8,
        }];
    assert!(matches!(master.register_fields::<u8>(domain, &fields), Err(EthercatError::DomainAlreadyActive)));
}

#[test]
fn domains_are_contiguous() {
    init_logs();
    let socket = SimulatedSocket::new();
    socket.add_slave(0x1001);
    socket.add_slave(0x1002);
    let mut master = Master::new(socket.clone(), MasterConfig::default());
    let first = master.add_slave(Slave::new(0x1001, 0)).unwrap();
    let second = master.add_slave(Slave::new(0x1002, 1)).unwrap();
    assert!(master.add_slave(Slave::new(0x1002, 2)).is_err());

    let inputs = master.create_domain().unwrap();
    let outputs = master.create_domain().unwrap();
    let values = master.register_fields::<u16>(inputs, &[
        FieldInit {slave: first, locator: FieldLocator::new(0, "Beckhoff", "EL3102", "Value 1"), offset: 0},
        FieldInit {slave: second, locator: FieldLocator::new(1, "Beckhoff", "EL3102", "Value 1"), offset: 2},
        ]).unwrap();
    let command = master.register_field::<u32>(outputs, second, FieldLocator::new(1, "Beckhoff", "EL4102", "Output"), 0).unwrap();
    master.activate().unwrap();

    assert_eq!(master.domain(inputs).unwrap().base(), 0);
    assert_eq!(master.domain(outputs).unwrap().base(), 4);

    socket.set_input(2, &[0x34, 0x12]);
    let mut seen = None;
    master.cycle(|master| {
        seen = Some(master.get(values[1]).unwrap());
        master.set(command, 0xcafe).unwrap();
    }).unwrap();
    assert_eq!(seen, Some(0x1234));
    // a field cannot be read through an other domain
    assert!(master.domain(inputs).unwrap().get(command).is_err());

    master.cycle(|_| {}).unwrap();
    assert_eq!(socket.logical(4, 4), 0xcafeu32.to_le_bytes().to_vec());
    assert_eq!(master.domain(inputs).unwrap().state().working_counter, 2);

    let socket_back = master.release();
    assert!(socket_back.sent() >= 2);
}

/**
    inputs and outputs seen by the application over 7 cycles

    Before cycle `i` the encoder produces `10 * i`, and in cycle `i` the application writes `10 * i` to its control word after reading it back.
*/
fn echoed(strategy: Strategy) -> (Vec<u32>, Vec<u16>) {
    let Bench {socket, mut master, position, control} = bench(MasterConfig {strategy, .. MasterConfig::default()});
    master.activate().unwrap();
    let (mut inputs, mut outputs) = (Vec::new(), Vec::new());
    for i in 0 .. 7u16 {
        socket.set_input(0, &u32::from(10 * i).to_le_bytes());
        master.cycle(|master| {
            inputs.push(master.get(position).unwrap());
            outputs.push(master.get(control).unwrap());
            master.set(control, 10 * i).unwrap();
        }).unwrap();
    }
    (inputs, outputs)
}

#[test]
fn synchronous_echo() {
    let (inputs, outputs) = echoed(Strategy::Synchronous);
    // inputs are read in the cycle they are produced
    assert_eq!(inputs, vec![0, 10, 20, 30, 40, 50, 60]);
    // a value written in cycle `i` is queued at the start of cycle `i+1` and read back in that same cycle
    assert_eq!(outputs, vec![0, 0, 10, 20, 30, 40, 50]);
}

#[test]
fn asynchronous_echo() {
    let (inputs, outputs) = echoed(Strategy::Asynchronous);
    // inputs come from the frame sent one cycle earlier, the first one primed at activation
    assert_eq!(inputs, vec![0, 0, 10, 20, 30, 40, 50]);
    // a value written in cycle `i` is queued at the end of cycle `i` and read back one cycle later
    assert_eq!(outputs, vec![0, 0, 10, 20, 30, 40, 50]);
}

#[test]
fn udp_sized_frames() {
    init_logs();
    let socket = SimulatedSocket::new();
    socket.add_slave(ENCODER);
    socket.set_max_frame(1472);
    let mut master = Master::new(socket.clone(), MasterConfig::default());
    let encoder = master.add_slave(Slave::new(ENCODER, 0)).unwrap();
    let domain = master.create_domain().unwrap();
    let first = master.register_field::<u32>(domain, encoder, FieldLocator::new(0, "Beckhoff", "EL5001", "InputValue"), 0).unwrap();
    let last = master.register_field::<u32>(domain, encoder, FieldLocator::new(0, "Beckhoff", "EL5001", "InputValue"), 1996).unwrap();
    master.activate().unwrap();
    socket.set_input(0, &1u32.to_le_bytes());
    socket.set_input(1996, &2u32.to_le_bytes());

    for _ in 0 .. 3 {
        let mut seen = None;
        master.cycle(|master| seen = Some((master.get(first).unwrap(), master.get(last).unwrap()))).unwrap();
        assert_eq!(seen, Some((1, 2)));
    }
    assert_eq!(master.domain(domain).unwrap().state().lost, 0);
    assert_eq!(socket.sent(), 6);
}

#[test]
fn failed_activation_leaves_nothing_active() {
    let Bench {socket, mut master, position, ..} = bench(MasterConfig {
        strategy: Strategy::Asynchronous,
        .. MasterConfig::default()
        });
    // the first exchange cannot be sent
    socket.fail_next_sends(1);
    assert!(master.activate().is_err());
    assert!(! master.is_active());
    assert!(! master.domain(position.domain()).unwrap().is_active());
    assert!(matches!(master.get(position), Err(EthercatError::NotActive)));
    assert!(matches!(master.cycle(|_| {}), Err(EthercatError::NotActive)));

    // a later activation starts from scratch
    socket.set_input(0, &5u32.to_le_bytes());
    master.activate().unwrap();
    master.cycle(|_| {}).unwrap();
    assert_eq!(master.get(position).unwrap(), 5);
    assert_eq!(master.domain(position.domain()).unwrap().state().lost, 0);
}
