//! Application layer (AL) state handling.

use crate::wire::{WireError, WireRead, WireReadSized, WireWrite};
use num_enum::FromPrimitive;

/// The acknowledge/error bit carried alongside the state nibble in the AL
/// control and status registers.
pub(crate) const STATE_ACK_OR_ERROR: u16 = 0x10;

/// AL state of a single slave.
///
/// Read from register `0x0130`
/// ([`RegisterAddress::AlStatus`](crate::register::RegisterAddress::AlStatus)).
/// Defined in ETG1000.6 Table 9.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum SlaveState {
    /// No state recorded/read/known.
    None = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state.
    Boot = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
    /// State is an unknown value.
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Default for SlaveState {
    fn default() -> Self {
        Self::None
    }
}

impl SlaveState {
    pub(crate) fn raw(self) -> u8 {
        match self {
            SlaveState::None => 0x00,
            SlaveState::Init => 0x01,
            SlaveState::PreOp => 0x02,
            SlaveState::Boot => 0x03,
            SlaveState::SafeOp => 0x04,
            SlaveState::Op => 0x08,
            SlaveState::Unknown(raw) => raw,
        }
    }
}

impl core::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlaveState::None => f.write_str("None"),
            SlaveState::Init => f.write_str("Init"),
            SlaveState::PreOp => f.write_str("Pre-Operational"),
            SlaveState::Boot => f.write_str("Bootstrap"),
            SlaveState::SafeOp => f.write_str("Safe-Operational"),
            SlaveState::Op => f.write_str("Operational"),
            SlaveState::Unknown(value) => write!(f, "Unknown({:#04x})", value),
        }
    }
}

/// The AL control register image: requested state plus the acknowledge bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct AlControl {
    pub state: SlaveState,
    pub ack: bool,
}

impl AlControl {
    pub fn new(state: SlaveState) -> Self {
        Self { state, ack: false }
    }

    /// Request a state and acknowledge any pending error at the same time.
    pub fn acknowledging(state: SlaveState) -> Self {
        Self { state, ack: true }
    }

    /// The reset request issued during pre-init: INIT plus acknowledge.
    pub fn reset() -> Self {
        Self::acknowledging(SlaveState::Init)
    }
}

impl WireWrite for AlControl {
    fn packed_len(&self) -> usize {
        2
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = u16::from(self.state.raw()) | if self.ack { STATE_ACK_OR_ERROR } else { 0 };

        raw.pack_to_slice_unchecked(buf)
    }
}

/// The AL status register image: current state plus the error flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct AlStatus {
    pub state: SlaveState,
    pub error: bool,
}

impl WireRead for AlStatus {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            state: SlaveState::from((raw & 0x0f) as u8),
            error: raw & STATE_ACK_OR_ERROR != 0,
        })
    }
}

impl WireReadSized for AlStatus {
    const PACKED_LEN: usize = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn al_control_packs_ack_flag() {
        let mut buf = [0u8; 2];

        AlControl::reset().pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x11, 0x00]);

        AlControl::new(SlaveState::Op).pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x08, 0x00]);
    }

    #[test]
    fn al_status_separates_error_bit() {
        let status = AlStatus::unpack_from_slice(&[0x14, 0x00]).unwrap();

        assert_eq!(
            status,
            AlStatus {
                state: SlaveState::SafeOp,
                error: true
            }
        );
    }

    #[test]
    fn unknown_states_are_preserved() {
        assert_eq!(SlaveState::from(0x06), SlaveState::Unknown(0x06));
        assert_eq!(SlaveState::Unknown(0x06).raw(), 0x06);
    }
}
