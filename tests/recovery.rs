//! Error acknowledgement, hot-unplug detection and slave recovery flows.

mod util;

use catenary::{Master, MasterConfig, SlaveState, Timeouts};
use core::time::Duration;
use pretty_assertions::assert_eq;
use util::{sim_segment, SimSlaveConfig};

fn fast_timeouts() -> Timeouts {
    Timeouts {
        wait_loop_delay: Duration::from_micros(10),
        state_transition: Duration::from_millis(100),
        ..Timeouts::default()
    }
}

fn bring_up(master: &mut Master<util::SimLink>, io_map: &mut [u8]) {
    master.config_init(false).expect("config_init");
    master.config_map_group(io_map, 0).expect("map");
    master.write_state(0, SlaveState::Op).expect("request op");

    let state = master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .expect("state check");

    assert_eq!(state, SlaveState::Op);
}

#[test]
fn safe_op_error_is_acknowledged_and_resumed() {
    let (link, handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());
    let mut io_map = [0u8; 16];

    bring_up(&mut master, &mut io_map);

    // Drop the terminal into SAFE-OP + ERROR behind the master's back
    handle.inject_error(1, 0x001b);

    let lowest = master.read_state().expect("read state");

    assert_eq!(lowest, SlaveState::SafeOp);
    assert_eq!(master.slave(2).unwrap().state(), SlaveState::SafeOp);
    assert_eq!(
        master.slave(2).unwrap().al_status_code(),
        catenary::AlStatusCode::SyncManagerWatchdog
    );

    // Supervisor policy: acknowledge, then push back towards OP
    for slave in 1..=master.slave_count() as u16 {
        if master.slave(slave).unwrap().state() != SlaveState::Op {
            master.ack_state(slave, SlaveState::SafeOp).expect("ack");
            master.write_state(slave, SlaveState::Op).expect("op");
        }
    }

    let state = master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .expect("state check");

    assert_eq!(state, SlaveState::Op);
    assert_eq!(handle.al_state(1), 0x08);
}

#[test]
fn hot_unplug_is_detected_and_recovered() {
    let (link, handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());
    let mut io_map = [0u8; 16];

    bring_up(&mut master, &mut io_map);

    let expected = master.group(0).expected_wkc();

    // One clean cycle first
    master.send_process_data(&mut io_map).unwrap();

    assert_eq!(
        master
            .receive_process_data(&mut io_map, Duration::from_millis(10))
            .unwrap(),
        expected
    );

    // Unplug the terminal: the frame still circulates but the terminal no
    // longer contributes to the working counter
    handle.set_offline(1, true);

    for _ in 0..3 {
        master.send_process_data(&mut io_map).unwrap();

        let wkc = master
            .receive_process_data(&mut io_map, Duration::from_millis(10))
            .unwrap();

        assert!(wkc < expected);
    }

    assert!(master.group(0).needs_state_check());

    // The supervisor notices the dead slave
    master.read_state().expect("read state");

    assert_eq!(master.slave(2).unwrap().state(), SlaveState::None);
    assert!(master.slave(2).unwrap().is_lost());

    // The device comes back after a power cycle: configuration and station
    // address are gone
    handle.power_cycle(1);
    handle.set_offline(1, false);

    let recovered = master
        .recover_slave(2, Duration::from_millis(20))
        .expect("recover");

    assert!(recovered);
    assert!(!master.slave(2).unwrap().is_lost());
    assert_eq!(master.slave(2).unwrap().configured_address(), 0x1002);

    // Reprogram its sync managers and FMMUs and bring it back
    let state = master
        .reconfig_slave(2, Duration::from_millis(20))
        .expect("reconfig");

    assert_eq!(state, SlaveState::SafeOp);

    master.write_state(2, SlaveState::Op).expect("op");

    let state = master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .expect("state check");

    assert_eq!(state, SlaveState::Op);

    // Cyclic exchange is whole again
    master.group(0).clear_state_check();

    io_map[0] = 0x55;

    master.send_process_data(&mut io_map).unwrap();

    assert_eq!(
        master
            .receive_process_data(&mut io_map, Duration::from_millis(10))
            .unwrap(),
        expected
    );

    assert_eq!(handle.slave_mem(1, 0x0f00, 1), vec![0x55]);
}

#[test]
fn recover_refuses_wrong_identity() {
    let (link, handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());
    let mut io_map = [0u8; 16];

    bring_up(&mut master, &mut io_map);

    handle.set_offline(1, true);
    master.read_state().expect("read state");

    assert!(master.slave(2).unwrap().is_lost());

    // A different device appears at the same position
    handle.power_cycle(1);
    handle.swap_identity(1, 0x0099, 0x1234_5678);
    handle.set_offline(1, false);

    let recovered = master
        .recover_slave(2, Duration::from_millis(20))
        .expect("recover");

    assert!(!recovered);
    assert!(master.slave(2).unwrap().is_lost());
}
