//! End to end bring-up against the emulated segment: discovery, SII
//! configuration, mapping, state transitions and the cyclic exchange.

mod util;

use catenary::{Master, MasterConfig, SlaveState, Timeouts, Topology};
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

#[test]
fn two_slave_bring_up() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (link, handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    let count = master.config_init(false).expect("config_init");

    assert_eq!(count, 2);
    assert_eq!(master.slave_count(), 2);

    let coupler = master.slave(1).unwrap();

    assert_eq!(coupler.name(), "EK1100");
    assert_eq!(coupler.vendor_id(), 0x2);
    assert_eq!(coupler.product_code(), 0x044c_2c52);
    assert_eq!(coupler.configured_address(), 0x1001);
    assert!(coupler.has_dc());
    assert_eq!(coupler.topology(), Topology::Passthrough);

    let terminal = master.slave(2).unwrap();

    assert_eq!(terminal.name(), "EL2008");
    assert_eq!(terminal.product_code(), 0x07d8_3052);
    assert_eq!(terminal.parent(), 1);
    assert_eq!(terminal.topology(), Topology::LineEnd);

    let mut io_map = [0u8; 16];

    let image_size = master.config_map_group(&mut io_map, 0).expect("map");

    assert_eq!(image_size, 1);
    assert_eq!(master.group(0).output_bytes(), 1);
    assert_eq!(master.group(0).input_bytes(), 0);
    assert_eq!(master.group(0).expected_wkc(), 2);

    assert_eq!(master.slave(2).unwrap().output_bits(), 8);
    assert_eq!(master.slave(2).unwrap().outputs(), Some((0, 1)));

    master.write_state(0, SlaveState::Op).expect("request op");

    let state = master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .expect("state check");

    assert_eq!(state, SlaveState::Op);

    // Drive the outputs and run one cycle
    io_map[0] = 0xaa;

    master.send_process_data(&mut io_map).expect("send");

    let wkc = master
        .receive_process_data(&mut io_map, Duration::from_millis(10))
        .expect("receive");

    assert_eq!(wkc, master.group(0).expected_wkc());

    // The byte must have landed in the terminal's output sync manager
    assert_eq!(handle.slave_mem(1, 0x0f00, 1), vec![0xaa]);
}

#[test]
fn empty_segment_returns_zero_without_error() {
    let (link, _handle) = sim_segment(Vec::new());

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    assert_eq!(master.config_init(false).expect("config_init"), 0);
}

#[test]
fn over_long_segment_is_rejected() {
    let configs = (0..201).map(|_| SimSlaveConfig::ek1100()).collect();

    let (link, _handle) = sim_segment(configs);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    assert_eq!(
        master.config_init(false),
        Err(catenary::error::Error::SlaveCountExceeded)
    );
}

#[test]
fn repeated_config_init_is_stable() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("first init");

    let first: Vec<_> = master
        .slaves()
        .iter()
        .map(|s| {
            (
                s.configured_address(),
                s.vendor_id(),
                s.product_code(),
                s.revision(),
                s.name().to_string(),
            )
        })
        .collect();

    master.config_init(false).expect("second init");

    let second: Vec<_> = master
        .slaves()
        .iter()
        .map(|s| {
            (
                s.configured_address(),
                s.vendor_id(),
                s.product_code(),
                s.revision(),
                s.name().to_string(),
            )
        })
        .collect();

    assert_eq!(first, second);
}

#[test]
fn dc_reference_is_first_capable_slave() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    let mut io_map = [0u8; 16];

    master.config_map_group(&mut io_map, 0).expect("map");

    assert!(master.config_dc().expect("config_dc"));

    // The EK1100 is the first (and only) DC capable slave
    assert_eq!(master.dc_reference(), Some(0x1001));

    // The cyclic exchange now carries the distribution datagram and still
    // produces the expected working counter
    master.write_state(0, SlaveState::Op).unwrap();
    master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .unwrap();

    master.send_process_data(&mut io_map).expect("send");

    let wkc = master
        .receive_process_data(&mut io_map, Duration::from_millis(10))
        .expect("receive");

    assert_eq!(wkc, master.group(0).expected_wkc());
}

#[test]
fn config_table_overrides_sii() {
    static TABLE: &[catenary::SlaveConfigEntry] = &[catenary::SlaveConfigEntry {
        vendor_id: 0x2,
        product_code: 0x07d8_3052,
        name: "TABLE2008",
        output_bits: 8,
        input_bits: 0,
        sm2_address: 0,
        sm2_flags: 0,
        sm3_address: 0,
        sm3_flags: 0,
        fmmu0_active: true,
        fmmu1_active: false,
    }];

    let (link, _handle) = sim_segment(vec![SimSlaveConfig::ek1100(), SimSlaveConfig::el2008()]);

    let mut master = Master::new(
        link,
        fast_timeouts(),
        MasterConfig {
            config_table: TABLE,
            ..MasterConfig::default()
        },
    );

    master.config_init(true).expect("config_init");

    assert_eq!(master.slave(2).unwrap().name(), "TABLE2008");

    let mut io_map = [0u8; 16];

    let image_size = master.config_map_group(&mut io_map, 0).expect("map");

    assert_eq!(image_size, 1);
    assert_eq!(master.group(0).expected_wkc(), 2);
}
