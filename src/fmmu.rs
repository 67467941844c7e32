//! Fieldbus Memory Management Unit (FMMU) register image.

use crate::wire::{WireError, WireRead, WireReadSized, WireWrite};

/// FMMU mapping function, as assigned to a hardware slot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum FmmuFunction {
    /// Slot not used.
    #[default]
    Unused = 0,
    /// Maps output process data (slave memory written by the master).
    Outputs = 1,
    /// Maps input process data (slave memory read by the master).
    Inputs = 2,
    /// Maps the sync manager status area.
    SyncManagerStatus = 3,
}

impl FmmuFunction {
    pub(crate) fn from_sii(raw: u8) -> Self {
        match raw {
            1 => Self::Outputs,
            2 => Self::Inputs,
            3 => Self::SyncManagerStatus,
            _ => Self::Unused,
        }
    }
}

/// One FMMU entity, 16 bytes written to `0x0600 + 16n`.
///
/// Defined in ETG1000.4 Table 56.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct Fmmu {
    /// Start address in the logical memory area.
    pub logical_start_address: u32,
    /// Mapping length in bytes (rounded up for bit mappings).
    pub length_bytes: u16,
    /// First mapped bit within the first logical byte, 0..=7.
    pub logical_start_bit: u8,
    /// Last mapped bit within the last logical byte, 0..=7.
    pub logical_end_bit: u8,
    /// Start address in slave physical memory.
    pub physical_start_address: u16,
    /// First mapped bit within the first physical byte, 0..=7.
    pub physical_start_bit: u8,
    /// Slave memory is readable through this mapping.
    pub read_enable: bool,
    /// Slave memory is writable through this mapping.
    pub write_enable: bool,
    /// Mapping active.
    pub enable: bool,
}

impl Fmmu {
    /// End of the mapped logical byte range, exclusive.
    pub(crate) fn logical_end_address(&self) -> u32 {
        self.logical_start_address + u32::from(self.length_bytes)
    }
}

impl core::fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}:{}", self.logical_start_address, self.logical_start_bit),
            )
            .field("length_bytes", &self.length_bytes)
            .field("logical_end_bit", &self.logical_end_bit)
            .field(
                "physical_start_address",
                &format_args!(
                    "{:#06x}:{}",
                    self.physical_start_address, self.physical_start_bit
                ),
            )
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl WireWrite for Fmmu {
    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..Self::PACKED_LEN];

        buf[0..4].copy_from_slice(&self.logical_start_address.to_le_bytes());
        buf[4..6].copy_from_slice(&self.length_bytes.to_le_bytes());
        buf[6] = self.logical_start_bit & 0x07;
        buf[7] = self.logical_end_bit & 0x07;
        buf[8..10].copy_from_slice(&self.physical_start_address.to_le_bytes());
        buf[10] = self.physical_start_bit & 0x07;
        buf[11] = u8::from(self.read_enable) | u8::from(self.write_enable) << 1;
        buf[12] = u8::from(self.enable);
        buf[13..16].fill(0);

        buf
    }
}

impl WireRead for Fmmu {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let buf = buf
            .get(0..Self::PACKED_LEN)
            .ok_or(WireError::ReadBufferTooShort)?;

        Ok(Self {
            logical_start_address: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length_bytes: u16::from_le_bytes([buf[4], buf[5]]),
            logical_start_bit: buf[6] & 0x07,
            logical_end_bit: buf[7] & 0x07,
            physical_start_address: u16::from_le_bytes([buf[8], buf[9]]),
            physical_start_bit: buf[10] & 0x07,
            read_enable: buf[11] & 0x01 != 0,
            write_enable: buf[11] & 0x02 != 0,
            enable: buf[12] & 0x01 != 0,
        })
    }
}

impl WireReadSized for Fmmu {
    const PACKED_LEN: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_one() {
        let raw = [
            // Logical start address
            0x00, 0x00, 0x00, 0x00, //
            // Length
            0x01, 0x00, //
            // Logical start bit
            0x00, //
            // Logical end bit
            0x03, //
            // Physical start address
            0x00, 0x10, //
            // Physical start bit
            0x00, //
            // Read/write enable
            0x01, //
            // FMMU enable
            0x01, //
            // Padding
            0x00, 0x00, 0x00,
        ];

        let fmmu = Fmmu::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            fmmu,
            Fmmu {
                logical_start_address: 0,
                length_bytes: 1,
                logical_start_bit: 0,
                logical_end_bit: 3,
                physical_start_address: 0x1000,
                physical_start_bit: 0,
                read_enable: true,
                write_enable: false,
                enable: true,
            }
        );
    }

    #[test]
    fn default_is_zero() {
        let mut buf = [0xffu8; 16];

        Fmmu::default().pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0u8; 16]);
    }
}
