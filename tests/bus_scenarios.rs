//! End-to-end scenarios against the simulated bus

use buslink_core::core::protocol::modbus::{self, FunctionCode};
use buslink_core::core::simulator::{
    MatchCondition, ResponseAction, ResponseRule, SimHandle, WireEvent,
};
use buslink_core::core::timing::{inter_frame_silence_us, FIXED_SILENCE_US};
use buslink_core::{
    Bus, BusOptions, BusTransport, ChannelConfig, DeviceTemplates, DirectionControl,
    DirectionState, FailureKind, FrameProfile, SimulatedBus, TransactionState, VirtualDevice,
};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const REQUEST: [u8; 6] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
const REPLY: [u8; 5] = [0x01, 0x03, 0x02, 0x00, 0x2A];

fn rs485(baud: u32) -> ChannelConfig {
    ChannelConfig::new("sim", baud).direction(DirectionControl::default())
}

fn device(action: ResponseAction) -> VirtualDevice {
    VirtualDevice::new("device").with_rule(ResponseRule::new("reply", MatchCondition::Any, action))
}

fn bus(baud: u32, device: VirtualDevice, options: BusOptions) -> (Bus, SimHandle) {
    let sim = SimulatedBus::new(rs485(baud), device);
    let handle = sim.handle();
    (Bus::new(sim, options).expect("valid channel"), handle)
}

#[test]
fn silence_follows_character_time_up_to_19200() {
    for baud in [300, 600, 1200, 2400, 4800, 9600, 14_400, 19_200] {
        for data_bits in 5..=8u8 {
            for stop_bits in 1..=2u8 {
                let expected =
                    3_500_000 * (u64::from(data_bits) + u64::from(stop_bits) + 2) / u64::from(baud);
                assert_eq!(inter_frame_silence_us(baud, data_bits, stop_bits), expected);
            }
        }
    }
    assert_eq!(inter_frame_silence_us(9600, 8, 1), 4010);
}

#[test]
fn silence_is_fixed_above_19200() {
    for baud in [19_201, 38_400, 57_600, 115_200, 921_600] {
        assert_eq!(inter_frame_silence_us(baud, 8, 1), FIXED_SILENCE_US);
        assert_eq!(inter_frame_silence_us(baud, 7, 2), 1750);
    }
}

#[tokio::test(start_paused = true)]
async fn echo_response_completes_at_9600() {
    let (bus, handle) = bus(
        9600,
        device(ResponseAction::Send { data: REPLY.to_vec() }),
        BusOptions::default(),
    );
    assert_eq!(bus.timing().inter_frame_silence_us(), 4010);

    let response = assert_ok!(bus.send_receive(REQUEST).await);
    assert_eq!(&response[..], &REPLY);

    let last = bus.last_transaction().expect("transaction recorded");
    assert_eq!(last.state(), TransactionState::Complete);
    assert_eq!(last.attempt(), 1);
    assert_eq!(handle.written(), vec![REQUEST.to_vec()]);
    assert_eq!(handle.direction(), DirectionState::Receive);
}

#[tokio::test(start_paused = true)]
async fn gap_splits_frames() {
    let (bus, handle) = bus(9600, VirtualDevice::new("talker"), BusOptions::default());
    handle.schedule(Duration::from_millis(10), &[0x10, 0x11, 0x12]);
    handle.schedule(Duration::from_millis(16), &[0x20, 0x21]);

    let first = assert_ok!(bus.receive(Duration::from_millis(100)).await);
    assert_eq!(&first[..], &[0x10, 0x11, 0x12]);

    let second = assert_ok!(bus.receive(Duration::from_millis(100)).await);
    assert_eq!(&second[..], &[0x20, 0x21]);
}

#[tokio::test(start_paused = true)]
async fn long_listen_outlasts_the_poll_cap() {
    let (bus, handle) = bus(9600, VirtualDevice::new("late"), BusOptions::default());
    let timing = *bus.timing();
    let capped = timing.poll_interval * timing.max_polls;
    assert!(capped < Duration::from_secs(30));

    handle.schedule(Duration::from_secs(30), &REPLY);
    let frame = assert_ok!(bus.receive(Duration::from_secs(60)).await);
    assert_eq!(&frame[..], &REPLY);
}

#[tokio::test(start_paused = true)]
async fn chunks_within_silence_form_one_frame() {
    let (bus, _handle) = bus(
        9600,
        device(ResponseAction::Burst {
            data: REPLY.to_vec(),
            chunk: 2,
            gap_us: 1500,
        }),
        BusOptions::default(),
    );

    let response = assert_ok!(bus.send_receive(REQUEST).await);
    assert_eq!(&response[..], &REPLY);
}

#[tokio::test(start_paused = true)]
async fn flush_is_idempotent() {
    let mut sim = SimulatedBus::new(rs485(9600), VirtualDevice::new("noise"));
    let handle = sim.handle();
    handle.inject(&[0xFF, 0x00, 0xFF]);

    let grace = Duration::from_millis(1);
    assert_eq!(assert_ok!(sim.flush_input(grace).await), 3);
    assert_eq!(assert_ok!(sim.flush_input(grace).await), 0);
    assert_eq!(handle.pending_inbound(), 0);
    assert_eq!(handle.events(), vec![WireEvent::Flush(3)]);
}

#[tokio::test(start_paused = true)]
async fn line_returns_to_receive_after_every_outcome() {
    let good = device(ResponseAction::Send { data: REPLY.to_vec() });
    let mut corrupt_reply = modbus::build_read_response(1, 0x03, &[7]);
    corrupt_reply[3] ^= 0x55;
    let corrupt = device(ResponseAction::Send { data: corrupt_reply });
    let silent = VirtualDevice::new("silent");

    let cases = [
        (good, FrameProfile::default(), None),
        (corrupt, FrameProfile::modbus_rtu(), Some(FailureKind::MalformedResponse)),
        (silent, FrameProfile::default(), Some(FailureKind::NoResponse)),
    ];

    for (device, frame, expected) in cases {
        let (bus, handle) = bus(9600, device, BusOptions::default().frame(frame));
        let outcome = bus.send_receive(REQUEST).await;
        assert_eq!(outcome.as_ref().err().map(|e| e.kind()), expected);
        assert_eq!(handle.direction(), DirectionState::Receive);
        assert_eq!(bus.direction().await, DirectionState::Receive);
        assert_eq!(handle.writes_while_receiving(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_are_served_in_order() {
    let (bus, handle) = bus(19_200, DeviceTemplates::echo(), BusOptions::default());

    let requests: Vec<Vec<u8>> = (1..=4u8).map(|n| vec![n; usize::from(n) + 1]).collect();
    let responses =
        futures::future::join_all(requests.iter().map(|r| bus.send_receive(r.clone()))).await;

    for (request, response) in requests.iter().zip(responses) {
        assert_eq!(&assert_ok!(response)[..], &request[..]);
    }
    assert_eq!(handle.written(), requests);

    // every write sits inside its own transmit window
    let mut transmitting = false;
    let mut writes = 0;
    for event in handle.events() {
        match event {
            WireEvent::Direction(DirectionState::Transmit) => {
                assert!(!transmitting);
                transmitting = true;
            }
            WireEvent::Direction(DirectionState::Receive) => transmitting = false,
            WireEvent::Write { direction, .. } => {
                assert!(transmitting);
                assert_eq!(direction, DirectionState::Transmit);
                writes += 1;
            }
            WireEvent::Flush(_) => assert!(!transmitting),
        }
    }
    assert_eq!(writes, 4);
}

#[tokio::test(start_paused = true)]
async fn silent_slave_exhausts_retries_with_no_response() {
    let (bus, handle) = bus(9600, VirtualDevice::new("silent"), BusOptions::default());

    let err = assert_err!(bus.send_receive(REQUEST).await);
    assert_eq!(err.kind(), FailureKind::NoResponse);
    assert_eq!(handle.written().len(), 3);

    let stats = bus.stats();
    assert_eq!(stats.no_response, 1);
    assert_eq!(stats.malformed, 0);
    assert_eq!(stats.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_frame_is_malformed() {
    let (bus, handle) = bus(
        9600,
        device(ResponseAction::Sequence(vec![
            ResponseAction::Send {
                data: REPLY[..3].to_vec(),
            },
            ResponseAction::Delay { ms: 1 },
            ResponseAction::Disconnect,
        ])),
        BusOptions::default(),
    );

    let err = assert_err!(bus.send_receive(REQUEST).await);
    assert_eq!(err.kind(), FailureKind::MalformedResponse);
    assert_eq!(err.raw_response().map(|b| b.to_vec()), Some(REPLY[..3].to_vec()));
    assert_eq!(handle.direction(), DirectionState::Receive);
}

#[tokio::test(start_paused = true)]
async fn modbus_slave_round_trip() {
    let registers = vec![100, 200, 300, 400];
    let (bus, _handle) = bus(
        19_200,
        DeviceTemplates::modbus_slave(3, registers),
        BusOptions::default().frame(FrameProfile::modbus_rtu()),
    );

    let request = modbus::build_rtu_request(3, FunctionCode::ReadHoldingRegisters, 1, 2);
    let response = assert_ok!(bus.send_receive(request.clone()).await);
    let decoded = assert_ok!(modbus::check_response(&request, &response));
    assert_eq!(decoded.registers(), vec![200, 300]);

    let unsupported = modbus::build_rtu_request(3, FunctionCode::WriteSingleCoil, 0, 0xFF00);
    let response = assert_ok!(bus.send_receive(unsupported.clone()).await);
    assert!(matches!(
        modbus::check_response(&unsupported, &response),
        Err(modbus::ModbusError::Exception { code: 0x01, .. })
    ));
}
