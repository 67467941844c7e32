//! A pure Rust EtherCAT master with a blocking, thread friendly API.
//!
//! The master owns a raw Ethernet [`Link`], discovers the slaves chained on
//! the segment, configures their sync managers and FMMUs from EEPROM (or CoE,
//! SoE and compiled-in tables), drives them through the EtherCAT state
//! machine and exchanges cyclic process data with a bounded working counter
//! contract.
//!
//! All blocking operations take microsecond scale timeouts and return a
//! distinguished timeout outcome; nothing in the crate panics on bus
//! misbehaviour. The cyclic path performs no heap allocation.
//!
//! # Example
//!
//! ```no_run
//! use catenary::{Master, MasterConfig, SlaveState, Timeouts};
//! use core::time::Duration;
//!
//! # fn main() -> Result<(), catenary::error::Error> {
//! let link = catenary::std::RawSocketLink::open("eth0")?;
//! let mut master = Master::new(link, Timeouts::default(), MasterConfig::default());
//!
//! let slave_count = master.config_init(false)?;
//! println!("discovered {} slaves", slave_count);
//!
//! let mut io_map = [0u8; 128];
//! let _image_size = master.config_map_group(&mut io_map, 0)?;
//!
//! master.write_state(0, SlaveState::Op)?;
//! master.state_check(0, SlaveState::Op, Timeouts::default().state_transition)?;
//!
//! loop {
//!     master.send_process_data(&mut io_map)?;
//!     let wkc = master.receive_process_data(&mut io_map, Duration::from_micros(2000))?;
//!
//!     assert_eq!(wkc, master.group(0).expected_wkc());
//!     # break;
//! }
//! # Ok(()) }
//! ```

pub mod error;
mod wire;

mod al_status_code;
mod coe;
mod command;
mod config;
mod dc;
mod eoe;
mod fmmu;
mod foe;
mod frame;
mod group;
mod link;
mod mailbox;
mod master;
mod port;
mod process_data;
mod register;
mod sii;
mod slave;
mod slave_state;
mod soe;
mod state;
mod sync_manager;

#[cfg(unix)]
pub mod std;

pub use al_status_code::AlStatusCode;
pub use coe::{CoeAbortCode, ObjectDescription, ObjectDescriptionList, ObjectEntryInfo};
pub use command::Command;
pub use dc::{ethercat_now, SyncController};
pub use eoe::{EoeReassembler, EthernetSettings};
pub use soe::SoeElements;
pub use fmmu::{Fmmu, FmmuFunction};
pub use group::SlaveGroup;
pub use link::{Link, RedundantLink};
pub use master::{Master, MasterConfig, SlaveConfigEntry};
pub use register::RegisterAddress;
pub use sii::SiiCategory;
pub use slave::{MailboxProtocols, Slave, Topology};
pub use slave_state::SlaveState;
pub use sync_manager::{SmControl, SmType, SyncManagerChannel};
pub use wire::{WireError, WireRead, WireReadSized, WireWrite};

use core::time::Duration;

/// Maximum number of slaves on one segment, the master pseudo-slave included.
pub const MAX_SLAVES: usize = 200;
/// Maximum number of slave groups.
pub const MAX_GROUPS: usize = 2;
/// Sync manager channels per slave.
pub const MAX_SM: usize = 8;
/// FMMU entities used per slave.
pub const MAX_FMMU: usize = 4;
/// Size of the SII cache in bytes.
pub const MAX_EEP_BUF: usize = 4096;
/// Maximum payload of a single datagram.
pub const MAX_LRW_DATA: usize = 1486;
/// Bytes reserved in the first cyclic frame for the DC distribution datagram.
pub const FIRST_DC_DATAGRAM: usize = 20;
/// Maximum number of logical segments per group.
pub const MAX_IO_SEGMENTS: usize = 64;
/// Maximum number of parallel PDO mapping workers.
pub const MAX_MAPT: usize = 1;
/// Maximum slave name length, in bytes.
pub const MAX_NAME_LEN: usize = 40;
/// Capacity of the error ring.
pub const MAX_ERROR_ITEMS: usize = 64;

/// Maximum Ethernet frame length handled, excluding the FCS.
pub(crate) const MAX_FRAME_LEN: usize = 1518;
/// The EtherCAT EtherType.
pub(crate) const ETHERCAT_ETHERTYPE: u16 = 0x88a4;
/// Fixed source MAC of the master.
pub(crate) const MASTER_ADDR: [u8; 6] = [0x10, 0x10, 0x10, 0x10, 0x10, 0x10];
/// Frames are always sent to the broadcast MAC.
pub(crate) const BROADCAST_ADDR: [u8; 6] = [0xff; 6];
/// Mask for the 11 bit length fields in frame and datagram headers.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;
/// Offset added to slave indices to form configured station addresses.
pub(crate) const NODE_OFFSET: u16 = 0x1000;
/// Temporary station address used while recovering a lost slave.
pub(crate) const TEMP_NODE: u16 = 0xffff;
/// Each group's logical window starts at `group << LOG_GROUP_OFFSET`.
pub(crate) const LOG_GROUP_OFFSET: u32 = 16;

pub(crate) const fn bytes_for_bits(bits: u16) -> u16 {
    (bits + 7) / 8
}

/// Timeouts used by the various layers of the master.
///
/// All defaults follow the values the bus has been qualified with; individual
/// fields can be overridden at construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Timeout for a single datagram round trip.
    pub pdu: Duration,
    /// Timeout for "safe" operations such as the discovery broadcast.
    pub safe: Duration,
    /// Timeout for one EEPROM interface operation.
    pub eeprom: Duration,
    /// Timeout for an AL state transition.
    pub state_transition: Duration,
    /// Timeout for a mailbox write to be accepted by the slave.
    pub mailbox_echo: Duration,
    /// Timeout for a mailbox response to arrive.
    pub mailbox_response: Duration,
    /// Pacing delay between polls in busy-wait loops.
    pub wait_loop_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pdu: Duration::from_micros(1000),
            safe: Duration::from_micros(20_000),
            eeprom: Duration::from_micros(20_000),
            state_transition: Duration::from_micros(2_000_000),
            mailbox_echo: Duration::from_micros(20_000),
            mailbox_response: Duration::from_micros(20_000),
            wait_loop_delay: Duration::from_micros(100),
        }
    }
}

impl Timeouts {
    /// Three datagram round trips; the retry budget used for configuration
    /// register traffic.
    pub(crate) fn pdu3(&self) -> Duration {
        self.pdu * 3
    }
}
