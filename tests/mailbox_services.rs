//! Mailbox protocol flows against the emulated segment: CoE object access,
//! PDO discovery through the object dictionary, and FoE transfers.

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

#[test]
fn sdo_identity_read_is_idempotent() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    assert_eq!(master.config_init(false).expect("config_init"), 1);

    let mut first = [0u8; 4];
    let mut second = [0u8; 4];

    let len = master
        .sdo_read(1, 0x1018, 0x02, false, &mut first, Duration::from_millis(20))
        .expect("first read");

    assert_eq!(len, 4);
    assert_eq!(u32::from_le_bytes(first), 0x07d8_3052);

    master
        .sdo_read(1, 0x1018, 0x02, false, &mut second, Duration::from_millis(20))
        .expect("second read");

    assert_eq!(first, second);
}

#[test]
fn sdo_write_read_round_trip() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    master
        .sdo_write(
            1,
            0x2000,
            0x01,
            false,
            &0xcafe_f00du32.to_le_bytes(),
            Duration::from_millis(20),
        )
        .expect("write");

    let mut readback = [0u8; 4];

    master
        .sdo_read(1, 0x2000, 0x01, false, &mut readback, Duration::from_millis(20))
        .expect("read");

    assert_eq!(u32::from_le_bytes(readback), 0xcafe_f00d);
}

#[test]
fn missing_object_aborts_and_lands_in_error_ring() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    let mut buf = [0u8; 4];

    let result = master.sdo_read(1, 0x5fff, 0x01, false, &mut buf, Duration::from_millis(20));

    assert!(matches!(
        result,
        Err(catenary::error::Error::Mailbox(
            catenary::error::MailboxError::Aborted {
                code: catenary::CoeAbortCode::NotFound,
                address: 0x5fff,
                sub_index: 0x01,
            }
        ))
    ));

    let item = master.pop_error().expect("error recorded");

    assert_eq!(item.slave, 1);
    assert_eq!(item.index, 0x5fff);
    assert_eq!(item.code, 0x0602_0000);
}

#[test]
fn coe_pdo_discovery_maps_and_exchanges() {
    let (link, handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    let mut io_map = [0u8; 16];

    let image_size = master.config_map_group(&mut io_map, 0).expect("map");

    // 16 output bits + 8 input bits
    assert_eq!(image_size, 3);
    assert_eq!(master.group(0).output_bytes(), 2);
    assert_eq!(master.group(0).input_bytes(), 1);

    // One slave contributing both directions: 2 + 1
    assert_eq!(master.group(0).expected_wkc(), 3);

    master.write_state(0, SlaveState::Op).unwrap();
    master
        .state_check(0, SlaveState::Op, Duration::from_millis(100))
        .unwrap();

    // Present an input value in the slave's input sync manager
    handle.set_slave_mem(0, 0x1180, &[0x5a]);

    io_map[0] = 0x12;
    io_map[1] = 0x34;

    master.send_process_data(&mut io_map).expect("send");

    let wkc = master
        .receive_process_data(&mut io_map, Duration::from_millis(10))
        .expect("receive");

    assert_eq!(wkc, 3);

    // Outputs landed, input came back, outputs in the map untouched
    assert_eq!(handle.slave_mem(0, 0x1100, 2), vec![0x12, 0x34]);
    assert_eq!(io_map[..3], [0x12, 0x34, 0x5a]);
}

#[test]
fn foe_write_uses_one_packet_window() {
    let (link, handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    // 100 kB with 124 byte chunks: 807 packets, the last one short
    let file: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();

    master
        .foe_write(1, "firmware.bin", 0, &file, Duration::from_millis(50))
        .expect("foe write");

    let stats = handle.foe_stats(0);

    assert_eq!(stats.write_requests, 1);
    assert_eq!(stats.data_packets.len(), 807);
    assert_eq!(stats.received_bytes, 100_000);

    // Every packet number in 1..=807 acked exactly once and in order
    for (position, (number, len)) in stats.data_packets.iter().enumerate() {
        assert_eq!(*number, position as u32 + 1);

        if position < 806 {
            assert_eq!(*len, 124);
        } else {
            // Short final packet signals EOF; no trailing empty packet
            assert_eq!(*len, 56);
        }
    }

    assert_eq!(handle.foe_file(0), file);
}

#[test]
fn foe_read_returns_written_content() {
    let (link, _handle) = sim_segment(vec![SimSlaveConfig::coe_io(16, 8)]);

    let mut master = Master::new(link, fast_timeouts(), MasterConfig::default());

    master.config_init(false).expect("config_init");

    let file: Vec<u8> = (0..50u8).collect();

    master
        .foe_write(1, "small.bin", 0, &file, Duration::from_millis(50))
        .expect("foe write");

    let mut readback = [0u8; 128];

    let len = master
        .foe_read(1, "small.bin", 0, &mut readback, Duration::from_millis(50))
        .expect("foe read");

    assert_eq!(len, 50);
    assert_eq!(&readback[..50], &file[..]);
}
