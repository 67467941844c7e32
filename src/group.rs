//! Slave groups: sets of slaves sharing one logical address segment and one
//! cyclic exchange.

use crate::MAX_IO_SEGMENTS;
use std::sync::atomic::{AtomicBool, Ordering};

/// A group of slaves mapped into one logical address window.
///
/// Groups are exchanged independently: each gets its own IO map buffer and
/// its own set of cyclic datagrams.
#[derive(Debug, Default)]
pub struct SlaveGroup {
    /// First logical address of this group's window.
    pub(crate) logical_start_address: u32,
    /// Mapped output bytes.
    pub(crate) output_bytes: u32,
    /// Mapped input bytes.
    pub(crate) input_bytes: u32,
    /// Number of slaves contributing an output FMMU.
    pub(crate) outputs_wkc: u16,
    /// Number of slaves contributing an input FMMU.
    pub(crate) inputs_wkc: u16,
    /// Logical segment sizes; one cyclic datagram is issued per segment.
    pub(crate) io_segments: heapless::Vec<u32, MAX_IO_SEGMENTS>,
    /// Index of the segment where inputs start.
    pub(crate) input_segment: usize,
    /// Byte offset within that segment where inputs start.
    pub(crate) input_offset: u32,
    /// Number of slaves in the group that cannot service LRW.
    pub(crate) block_lrw: u16,
    /// Sum of E-bus current consumption in mA.
    pub(crate) ebus_current: i32,
    /// The group was mapped with overlapping input/output logical windows.
    pub(crate) overlapping: bool,
    /// The group contains at least one DC capable slave.
    pub(crate) has_dc: bool,
    /// Set by the cyclic path when a working counter mismatch suggests the
    /// supervisor should re-check slave states.
    pub(crate) check_state: AtomicBool,
}

impl SlaveGroup {
    /// The working counter the cyclic exchange should produce when every
    /// slave services its datagrams: reads count once, writes count once, a
    /// combined read-write counts twice.
    pub fn expected_wkc(&self) -> u16 {
        self.outputs_wkc * 2 + self.inputs_wkc
    }

    /// Bytes of IO map this group needs.
    pub fn io_map_size(&self) -> usize {
        (self.output_bytes + self.input_bytes) as usize
    }

    /// Mapped output bytes.
    pub fn output_bytes(&self) -> usize {
        self.output_bytes as usize
    }

    /// Mapped input bytes.
    pub fn input_bytes(&self) -> usize {
        self.input_bytes as usize
    }

    /// First logical address of this group's window.
    pub fn logical_start_address(&self) -> u32 {
        self.logical_start_address
    }

    /// Sizes of the logical segments the cyclic exchange is split into.
    pub fn io_segments(&self) -> &[u32] {
        &self.io_segments
    }

    /// Index of the segment where inputs start, and the byte offset of the
    /// first input within it.
    pub fn input_split(&self) -> (usize, u32) {
        (self.input_segment, self.input_offset)
    }

    /// Sum of E-bus current consumption of the group's slaves, in mA.
    pub fn ebus_current(&self) -> i32 {
        self.ebus_current
    }

    /// Whether the group was mapped with overlapping IO windows.
    pub fn is_overlapping(&self) -> bool {
        self.overlapping
    }

    /// Whether the cyclic path has flagged this group for a state check.
    pub fn needs_state_check(&self) -> bool {
        self.check_state.load(Ordering::Relaxed)
    }

    /// Clear the state check flag once the supervisor has acted on it.
    pub fn clear_state_check(&self) {
        self.check_state.store(false, Ordering::Relaxed);
    }

    pub(crate) fn flag_state_check(&self) {
        self.check_state.store(true, Ordering::Relaxed);
    }

    /// Reset all mapping bookkeeping. Called on (re)entry to the mapper so a
    /// group can be mapped again after a teardown.
    pub(crate) fn reset_mapping(&mut self) {
        self.output_bytes = 0;
        self.input_bytes = 0;
        self.outputs_wkc = 0;
        self.inputs_wkc = 0;
        self.io_segments.clear();
        self.input_segment = 0;
        self.input_offset = 0;
        self.block_lrw = 0;
        self.ebus_current = 0;
        self.overlapping = false;
        self.has_dc = false;
        self.check_state.store(false, Ordering::Relaxed);
    }
}
