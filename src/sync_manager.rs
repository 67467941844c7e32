//! Sync manager (SM) channel register images.

use crate::wire::{WireError, WireRead, WireReadSized, WireWrite};

bitflags::bitflags! {
    /// The SM control byte. Defined in ETG1000.4 6.7.2.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct SmControl: u8 {
        /// Operation mode bits `0b10`: mailbox (single buffer, handshaked).
        const MAILBOX = 0b0000_0010;
        /// Direction bits `0b01 << 2`: master writes, slave reads.
        const DIRECTION_WRITE = 0b0000_0100;
        /// Raise an ECAT event on buffer activity.
        const IRQ_ECAT = 1 << 4;
        /// Raise a PDI event on buffer activity.
        const IRQ_PDI = 1 << 5;
        /// Watchdog trigger enable.
        const WATCHDOG = 1 << 6;
    }
}

/// SM status byte flags.
pub(crate) mod status {
    /// Mailbox full (one buffer mode).
    pub const MAILBOX_FULL: u8 = 0x08;
}

/// What a sync manager channel is used for.
///
/// The numbering mirrors the CoE sync manager communication type object
/// (`0x1C00`).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum SmType {
    /// Channel not used for anything.
    #[default]
    Unused = 0,
    /// Mailbox written by the master (SM0 conventionally).
    MailboxOut = 1,
    /// Mailbox read by the master (SM1 conventionally).
    MailboxIn = 2,
    /// Cyclic output process data (SM2 conventionally).
    Outputs = 3,
    /// Cyclic input process data (SM3 conventionally).
    Inputs = 4,
}

impl From<u8> for SmType {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Self::MailboxOut,
            2 => Self::MailboxIn,
            3 => Self::Outputs,
            4 => Self::Inputs,
            _ => Self::Unused,
        }
    }
}

/// Standard SM0 configuration word for mailbox slaves.
pub(crate) const DEFAULT_MBX_SM0_FLAGS: u32 = 0x0001_0026;
/// Standard SM1 configuration word for mailbox slaves.
pub(crate) const DEFAULT_MBX_SM1_FLAGS: u32 = 0x0001_0022;
/// Standard SM0 configuration word for simple digital output slaves.
pub(crate) const DEFAULT_DO_SM0_FLAGS: u32 = 0x0001_0044;

/// Sync manager channel register image.
///
/// Eight bytes written to `0x0800 + 8n`. Defined in ETG1000.4 Table 59.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct SyncManagerChannel {
    /// Physical start address in slave memory.
    pub physical_start_address: u16,
    /// Buffer length in bytes.
    pub length_bytes: u16,
    /// Control byte.
    pub control: SmControl,
    /// Status byte. Read only; written as zero.
    pub status: u8,
    /// Activation word; bit 0 enables the channel.
    pub enable: u16,
}

impl SyncManagerChannel {
    /// Build a channel image from the packed `control + status + enable` u32
    /// used by configuration tables and the SII SM category.
    pub(crate) fn from_flags(physical_start_address: u16, length_bytes: u16, flags: u32) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: SmControl::from_bits_retain(flags as u8),
            status: (flags >> 8) as u8,
            enable: (flags >> 16) as u16,
        }
    }

    /// The packed `control + status + enable` configuration word.
    pub(crate) fn flags(&self) -> u32 {
        u32::from(self.control.bits())
            | u32::from(self.status) << 8
            | u32::from(self.enable) << 16
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.enable |= 0x0001;
        } else {
            self.enable &= !0x0001;
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enable & 0x0001 != 0
    }
}

impl core::fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field(
                "length_bytes",
                &format_args!("{:#06x} ({})", self.length_bytes, self.length_bytes),
            )
            .field("control", &self.control)
            .field("enable", &format_args!("{:#06x}", self.enable))
            .finish()
    }
}

impl WireWrite for SyncManagerChannel {
    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..Self::PACKED_LEN];

        buf[0..2].copy_from_slice(&self.physical_start_address.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length_bytes.to_le_bytes());
        buf[4] = self.control.bits();
        buf[5] = self.status;
        buf[6..8].copy_from_slice(&self.enable.to_le_bytes());

        buf
    }
}

impl WireRead for SyncManagerChannel {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let buf = buf
            .get(0..Self::PACKED_LEN)
            .ok_or(WireError::ReadBufferTooShort)?;

        Ok(Self {
            physical_start_address: u16::from_le_bytes([buf[0], buf[1]]),
            length_bytes: u16::from_le_bytes([buf[2], buf[3]]),
            control: SmControl::from_bits_retain(buf[4]),
            status: buf[5],
            enable: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

impl WireReadSized for SyncManagerChannel {
    const PACKED_LEN: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_one() {
        // Taken from `soem-single-lan9252.pcap`
        let raw = [
            // Start address
            0x00, 0x10, //
            // Length
            0x80, 0x00, //
            // Control
            0x26, //
            // Status
            0x00, //
            // Enable
            0x01, 0x00,
        ];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(parsed.physical_start_address, 0x1000);
        assert_eq!(parsed.length_bytes, 0x0080);
        assert_eq!(
            parsed.control,
            SmControl::MAILBOX | SmControl::DIRECTION_WRITE | SmControl::IRQ_PDI
        );
        assert!(parsed.is_enabled());
    }

    #[test]
    fn default_mailbox_flags_round_trip() {
        let sm = SyncManagerChannel::from_flags(0x1000, 0x0080, DEFAULT_MBX_SM0_FLAGS);

        assert_eq!(sm.flags(), DEFAULT_MBX_SM0_FLAGS);

        let mut buf = [0u8; 8];

        sm.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn enable_toggles_only_bit_zero() {
        let mut sm = SyncManagerChannel::from_flags(0x1100, 0, DEFAULT_MBX_SM1_FLAGS);

        sm.set_enabled(false);

        assert_eq!(sm.enable, 0x0000);

        sm.set_enabled(true);

        assert_eq!(sm.enable, 0x0001);
    }
}
