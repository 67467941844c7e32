//! Per-slave device record.

use crate::{
    al_status_code::AlStatusCode,
    fmmu::{Fmmu, FmmuFunction},
    slave_state::SlaveState,
    sync_manager::{SmType, SyncManagerChannel},
    MAX_FMMU, MAX_NAME_LEN, MAX_SM,
};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

bitflags::bitflags! {
    /// Mailbox protocols advertised by the SII mailbox protocol word.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CANopen over EtherCAT.
        const COE = 0x0004;
        /// File access over EtherCAT.
        const FOE = 0x0008;
        /// Servo drive profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific.
        const VOE = 0x0020;
    }
}

/// Topology class of a slave, derived from its number of open ports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Topology {
    /// One open port: the last device in its branch.
    LineEnd,
    /// Two open ports: one upstream, one downstream neighbour.
    Passthrough,
    /// Three open ports: the chain splits here.
    Fork,
    /// Four open ports: a full cross.
    Cross,
}

impl Topology {
    pub(crate) fn from_open_ports(count: u8) -> Self {
        match count {
            0 | 1 => Self::LineEnd,
            2 => Self::Passthrough,
            3 => Self::Fork,
            _ => Self::Cross,
        }
    }
}

/// Everything the master knows about one slave device.
///
/// Fields the supervisor mutates while the cyclic thread is running (AL
/// state, status code, mailbox counters, lost flag, configured address during
/// recovery) are atomics so the record can be shared by reference between
/// both threads.
#[derive(Debug, Default)]
pub struct Slave {
    /// Position in the slave list; 1 based, 0 is the master pseudo-slave.
    pub(crate) index: u16,
    pub(crate) configured_address: AtomicU16,
    pub(crate) alias_address: u16,
    /// SII vendor id.
    pub(crate) vendor_id: u32,
    /// SII product code.
    pub(crate) product_code: u32,
    /// SII revision.
    pub(crate) revision: u32,
    /// SII serial number.
    pub(crate) serial: u32,
    /// PDI control word; the low byte identifies the interface type.
    pub(crate) interface_type: u16,
    /// The EEPROM interface supports 8 byte reads.
    pub(crate) eeprom_8byte: bool,

    /// Index of the upstream slave; 0 means attached directly to the master.
    pub(crate) parent: u16,
    /// Bitmap of ports with established communication, port 0 = bit 0.
    pub(crate) active_ports: u8,
    /// Number of open ports.
    pub(crate) open_ports: u8,
    /// Physical port descriptors register.
    pub(crate) port_descriptors: u8,
    /// The slave supports distributed clocks.
    pub(crate) has_dc: bool,
    /// Latched DC receive time of each port, in ns.
    pub(crate) dc_receive_times: [u32; 4],
    /// Propagation delay from the master, in ns.
    pub(crate) propagation_delay: u32,

    /// Mailbox master-to-slave buffer start in slave memory.
    pub(crate) mailbox_write_offset: u16,
    /// Mailbox master-to-slave buffer length; zero means no mailbox.
    pub(crate) mailbox_write_len: u16,
    /// Mailbox slave-to-master buffer start in slave memory.
    pub(crate) mailbox_read_offset: u16,
    /// Mailbox slave-to-master buffer length.
    pub(crate) mailbox_read_len: u16,
    /// Mailbox protocols this slave supports.
    pub(crate) mailbox_protocols: MailboxProtocols,
    /// Rolling 3 bit counter for outgoing mailbox messages.
    pub(crate) mailbox_counter: AtomicU8,
    /// Last counter received, for duplicate detection.
    pub(crate) last_mailbox_counter: AtomicU8,
    /// Drain this slave's mailbox from the cyclic handler.
    pub(crate) cyclic_mailbox: AtomicBool,

    pub(crate) sm: [SyncManagerChannel; MAX_SM],
    pub(crate) sm_type: [SmType; MAX_SM],
    pub(crate) fmmu: [Fmmu; MAX_FMMU],
    pub(crate) fmmu_function: [FmmuFunction; MAX_FMMU],
    /// First FMMU slot not yet assigned by the mapper.
    pub(crate) fmmu_unused: u8,

    pub(crate) output_bits: u16,
    pub(crate) input_bits: u16,
    /// Whole output bytes; zero for a bit oriented slave.
    pub(crate) output_bytes: u16,
    /// Whole input bytes; zero for a bit oriented slave.
    pub(crate) input_bytes: u16,
    /// Byte offset of this slave's outputs in the group IO map.
    pub(crate) output_offset: Option<usize>,
    /// Byte offset of this slave's inputs in the group IO map.
    pub(crate) input_offset: Option<usize>,
    pub(crate) output_start_bit: u8,
    pub(crate) input_start_bit: u8,

    pub(crate) state: AtomicU8,
    pub(crate) al_status_code: AtomicU16,
    pub(crate) is_lost: AtomicBool,

    /// CoE detail flags from the SII general category.
    pub(crate) coe_details: u8,
    /// FoE detail flags from the SII general category.
    pub(crate) foe_details: u8,
    /// EoE detail flags from the SII general category.
    pub(crate) eoe_details: u8,
    /// SoE detail flags from the SII general category.
    pub(crate) soe_details: u8,
    /// The slave cannot service LRW datagrams.
    pub(crate) block_lrw: bool,
    /// E-bus current consumption in mA; negative values feed in.
    pub(crate) ebus_current: i16,
    /// Group this slave is assigned to.
    pub(crate) group: u8,
    /// Index into the compiled-in config table; zero when discovered via SII.
    pub(crate) config_index: usize,
    pub(crate) name: heapless::String<MAX_NAME_LEN>,
}

impl Slave {
    /// The slave's configured station address.
    pub fn configured_address(&self) -> u16 {
        self.configured_address.load(Ordering::Relaxed)
    }

    pub(crate) fn set_configured_address(&self, address: u16) {
        self.configured_address.store(address, Ordering::Relaxed);
    }

    /// The slave's station alias.
    pub fn alias_address(&self) -> u16 {
        self.alias_address
    }

    /// SII vendor id.
    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// SII product code.
    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    /// SII revision number.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// SII serial number.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// PDI control word; the low byte identifies the interface type.
    pub fn interface_type(&self) -> u16 {
        self.interface_type
    }

    /// Physical port descriptors register.
    pub fn port_descriptors(&self) -> u8 {
        self.port_descriptors
    }

    /// Bitmap of ports with established communication, port 0 = bit 0.
    pub fn active_ports(&self) -> u8 {
        self.active_ports
    }

    /// Device name from the SII strings category or the config table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last AL state read back from the slave.
    pub fn state(&self) -> SlaveState {
        SlaveState::from(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: SlaveState) {
        self.state.store(state.raw(), Ordering::Relaxed);
    }

    /// Last AL status code read back from the slave.
    pub fn al_status_code(&self) -> AlStatusCode {
        AlStatusCode::from(self.al_status_code.load(Ordering::Relaxed))
    }

    pub(crate) fn set_al_status_code(&self, code: AlStatusCode) {
        self.al_status_code.store(code.into(), Ordering::Relaxed);
    }

    /// Whether the supervisor has marked this slave as lost.
    pub fn is_lost(&self) -> bool {
        self.is_lost.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lost(&self, lost: bool) {
        self.is_lost.store(lost, Ordering::Relaxed);
    }

    /// The slave has a configured mailbox.
    pub fn has_mailbox(&self) -> bool {
        self.mailbox_write_len > 0
    }

    /// Mailbox protocols this slave supports.
    pub fn mailbox_protocols(&self) -> MailboxProtocols {
        self.mailbox_protocols
    }

    /// The slave supports distributed clocks.
    pub fn has_dc(&self) -> bool {
        self.has_dc
    }

    /// Index of the upstream slave, 0 for the master.
    pub fn parent(&self) -> u16 {
        self.parent
    }

    /// Propagation delay from the master in nanoseconds.
    pub fn propagation_delay(&self) -> u32 {
        self.propagation_delay
    }

    /// Output process image size in bits.
    pub fn output_bits(&self) -> u16 {
        self.output_bits
    }

    /// Input process image size in bits.
    pub fn input_bits(&self) -> u16 {
        self.input_bits
    }

    /// Byte range of this slave's outputs within the group IO map.
    pub fn outputs(&self) -> Option<(usize, usize)> {
        self.output_offset
            .map(|offset| (offset, usize::from(crate::bytes_for_bits(self.output_bits))))
    }

    /// Byte range of this slave's inputs within the group IO map.
    pub fn inputs(&self) -> Option<(usize, usize)> {
        self.input_offset
            .map(|offset| (offset, usize::from(crate::bytes_for_bits(self.input_bits))))
    }

    /// First output bit within the first mapped output byte.
    pub fn output_start_bit(&self) -> u8 {
        self.output_start_bit
    }

    /// First input bit within the first mapped input byte.
    pub fn input_start_bit(&self) -> u8 {
        self.input_start_bit
    }

    /// Topology class, from the number of open ports.
    pub fn topology(&self) -> Topology {
        Topology::from_open_ports(self.open_ports)
    }

    /// Protocol detail bytes from the SII general category, in
    /// (CoE, FoE, EoE, SoE) order.
    pub fn protocol_details(&self) -> (u8, u8, u8, u8) {
        (
            self.coe_details,
            self.foe_details,
            self.eoe_details,
            self.soe_details,
        )
    }

    /// The slave cannot service LRW datagrams.
    pub fn blocks_lrw(&self) -> bool {
        self.block_lrw
    }

    /// E-bus current consumption in mA; negative values feed in.
    pub fn ebus_current(&self) -> i16 {
        self.ebus_current
    }

    /// FMMU function assignments from the SII FMMU category or config table.
    pub fn fmmu_functions(&self) -> &[crate::fmmu::FmmuFunction] {
        &self.fmmu_function
    }

    /// Next value of the rolling 3 bit mailbox counter: 1..=7, never 0.
    pub(crate) fn next_mailbox_counter(&self) -> u8 {
        let prev = self.mailbox_counter.load(Ordering::Relaxed);
        let next = if prev >= 7 { 1 } else { prev + 1 };

        self.mailbox_counter.store(next, Ordering::Relaxed);

        next
    }

    /// Record a received mailbox counter. Returns `false` when the value
    /// repeats the previous message, i.e. a retransmission to be ignored.
    pub(crate) fn accept_mailbox_counter(&self, counter: u8) -> bool {
        let last = self.last_mailbox_counter.swap(counter, Ordering::Relaxed);

        counter == 0 || counter != last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_counter_wraps_to_one() {
        let slave = Slave::default();

        let seq = (0..9).map(|_| slave.next_mailbox_counter()).collect::<Vec<_>>();

        assert_eq!(seq, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }

    #[test]
    fn duplicate_counter_is_rejected_once() {
        let slave = Slave::default();

        assert!(slave.accept_mailbox_counter(3));
        assert!(!slave.accept_mailbox_counter(3));
        assert!(slave.accept_mailbox_counter(4));
        assert!(slave.accept_mailbox_counter(3));
    }

    #[test]
    fn topology_classes() {
        assert_eq!(Topology::from_open_ports(1), Topology::LineEnd);
        assert_eq!(Topology::from_open_ports(2), Topology::Passthrough);
        assert_eq!(Topology::from_open_ports(3), Topology::Fork);
        assert_eq!(Topology::from_open_ports(4), Topology::Cross);
    }
}
