//! Servo drive profile over EtherCAT: IDN access for drives speaking the
//! SERCOS parameter model instead of CoE.

use crate::{
    error::{Error, ErrorItem, ErrorKind, SoeError},
    link::Link,
    mailbox::{MailboxHeader, MailboxType, MAX_MBX, MBX_HEADER_LEN},
    master::Master,
    slave::MailboxProtocols,
    wire::{WireRead, WireWrite},
};
use core::time::Duration;

const OP_READ_REQUEST: u8 = 0x01;
const OP_READ_RESPONSE: u8 = 0x02;
const OP_WRITE_REQUEST: u8 = 0x03;
const OP_WRITE_RESPONSE: u8 = 0x04;

/// SoE header length after the mailbox header.
const SOE_HEADER_LEN: usize = 4;

bitflags::bitflags! {
    /// Which elements of an IDN a request addresses.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct SoeElements: u8 {
        /// Data state.
        const DATA_STATE = 0x01;
        /// Name.
        const NAME = 0x02;
        /// Attribute.
        const ATTRIBUTE = 0x04;
        /// Unit.
        const UNIT = 0x08;
        /// Minimum value.
        const MIN = 0x10;
        /// Maximum value.
        const MAX = 0x20;
        /// Operating value.
        const VALUE = 0x40;
        /// Default value.
        const DEFAULT = 0x80;
    }
}

/// IDN of the MDT (master → drive) configuration list.
const IDN_MDT_CONFIG: u16 = 24;
/// IDN of the AT (drive → master) configuration list.
const IDN_AT_CONFIG: u16 = 16;

/// Maximum IDNs in a telegram configuration list.
const MAX_IDN_MAPPING: usize = 64;

/// SoE header: opcode (0..=2), incomplete (3), error (4), drive number
/// (5..=7), element flags byte, then the IDN or fragments-left word.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct SoeHeader {
    op_code: u8,
    incomplete: bool,
    error: bool,
    drive_no: u8,
    elements: u8,
    idn_or_fragments: u16,
}

impl SoeHeader {
    fn pack(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        buf[0] = (self.op_code & 0x07)
            | (u8::from(self.incomplete) << 3)
            | (u8::from(self.error) << 4)
            | (self.drive_no & 0x07) << 5;
        buf[1] = self.elements;
        buf[2..4].copy_from_slice(&self.idn_or_fragments.to_le_bytes());

        buf
    }

    fn unpack(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SOE_HEADER_LEN {
            return Err(Error::Soe(SoeError::InvalidResponse));
        }

        Ok(Self {
            op_code: buf[0] & 0x07,
            incomplete: buf[0] & 0x08 != 0,
            error: buf[0] & 0x10 != 0,
            drive_no: buf[0] >> 5,
            elements: buf[1],
            idn_or_fragments: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}

impl<L: Link> Master<L> {
    fn require_soe(&self, slave: u16) -> Result<usize, Error> {
        let rec = self.slave(slave)?;

        let usable = usize::from(rec.mailbox_write_len)
            .saturating_sub(MBX_HEADER_LEN + SOE_HEADER_LEN);

        if usable == 0 || !rec.mailbox_protocols().contains(MailboxProtocols::SOE) {
            return Err(Error::Mailbox(crate::error::MailboxError::NoMailbox));
        }

        Ok(usable)
    }

    fn soe_error(&self, slave: u16, idn: u16, code: u16) -> Error {
        self.push_error(ErrorItem {
            slave,
            index: idn,
            sub_index: 0,
            kind: ErrorKind::Soe,
            code: u32::from(code),
        });

        Error::Soe(SoeError::Error { idn, code })
    }

    /// Read elements of an IDN from a drive into `out`.
    ///
    /// Fragmented responses are reassembled transparently. Returns the number
    /// of bytes read.
    pub fn soe_read(
        &self,
        slave: u16,
        drive_no: u8,
        elements: SoeElements,
        idn: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.require_soe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + SOE_HEADER_LEN];

        MailboxHeader::new(MailboxType::Soe, SOE_HEADER_LEN as u16, counter)
            .pack_to_slice_unchecked(&mut request);
        request[6..10].copy_from_slice(
            &SoeHeader {
                op_code: OP_READ_REQUEST,
                incomplete: false,
                error: false,
                drive_no,
                elements: elements.bits(),
                idn_or_fragments: idn,
            }
            .pack(),
        );

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut received = 0usize;

        loop {
            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let mbx_header = MailboxHeader::unpack_from_slice(&response)?;

            if mbx_header.mailbox_type != MailboxType::Soe {
                return Err(Error::Soe(SoeError::InvalidResponse));
            }

            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];
            let header = SoeHeader::unpack(payload)?;

            if header.op_code != OP_READ_RESPONSE || header.drive_no != drive_no {
                return Err(Error::Soe(SoeError::InvalidResponse));
            }

            if header.error {
                // The error code trails the (empty) data
                let code = payload
                    .get(payload.len() - 2..)
                    .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
                    .unwrap_or(0);

                return Err(self.soe_error(slave, idn, code));
            }

            let data = &payload[SOE_HEADER_LEN..];

            if received + data.len() > out.len() {
                return Err(Error::Soe(SoeError::BufferTooSmall));
            }

            out[received..received + data.len()].copy_from_slice(data);
            received += data.len();

            if !header.incomplete {
                return Ok(received);
            }
        }
    }

    /// Write elements of an IDN to a drive, fragmenting over as many mailbox
    /// cycles as needed.
    pub fn soe_write(
        &self,
        slave: u16,
        drive_no: u8,
        elements: SoeElements,
        idn: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let max_data = self.require_soe(slave)?;

        self.mailbox_flush(slave)?;

        let mut offset = 0usize;
        let total_fragments = data.len().div_ceil(max_data).max(1);

        for fragment in 0..total_fragments {
            let remaining = data.len() - offset;
            let chunk = remaining.min(max_data);
            let last = fragment + 1 == total_fragments;
            let fragments_left = (total_fragments - fragment - 1) as u16;

            let counter = self.slave(slave)?.next_mailbox_counter();

            let mut request = [0u8; MAX_MBX];

            MailboxHeader::new(
                MailboxType::Soe,
                (SOE_HEADER_LEN + chunk) as u16,
                counter,
            )
            .pack_to_slice_unchecked(&mut request);
            request[6..10].copy_from_slice(
                &SoeHeader {
                    op_code: OP_WRITE_REQUEST,
                    incomplete: !last,
                    error: false,
                    drive_no,
                    elements: elements.bits(),
                    // Fragments carry the remaining count; the last one the IDN
                    idn_or_fragments: if last { idn } else { fragments_left },
                }
                .pack(),
            );
            request[10..10 + chunk].copy_from_slice(&data[offset..offset + chunk]);

            self.mailbox_send(
                slave,
                &request[..MBX_HEADER_LEN + SOE_HEADER_LEN + chunk],
                self.timeouts.mailbox_echo,
            )?;

            offset += chunk;
        }

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
        let mbx_header = MailboxHeader::unpack_from_slice(&response)?;

        if mbx_header.mailbox_type != MailboxType::Soe {
            return Err(Error::Soe(SoeError::InvalidResponse));
        }

        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];
        let header = SoeHeader::unpack(payload)?;

        if header.op_code != OP_WRITE_RESPONSE || header.drive_no != drive_no {
            return Err(Error::Soe(SoeError::InvalidResponse));
        }

        if header.error {
            let code = payload
                .get(payload.len() - 2..)
                .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
                .unwrap_or(0);

            return Err(self.soe_error(slave, idn, code));
        }

        Ok(())
    }

    /// Derive the process image sizes of a drive from its AT and MDT telegram
    /// configuration lists.
    ///
    /// Returns `(output_bits, input_bits)`.
    pub(crate) fn read_idn_map(&self, slave: u16) -> Result<(u32, u32), Error> {
        let output_bits = self.idn_list_bits(slave, IDN_MDT_CONFIG)?;
        let input_bits = self.idn_list_bits(slave, IDN_AT_CONFIG)?;

        Ok((output_bits, input_bits))
    }

    fn idn_list_bits(&self, slave: u16, idn: u16) -> Result<u32, Error> {
        // List header: current length and max length in bytes, then one u16
        // IDN per mapped parameter.
        let mut list = [0u8; 4 + MAX_IDN_MAPPING * 2];

        let len = self.soe_read(
            slave,
            0,
            SoeElements::VALUE,
            idn,
            &mut list,
            self.timeouts.mailbox_response,
        )?;

        if len < 4 {
            return Ok(0);
        }

        let current_length = usize::from(u16::from_le_bytes([list[0], list[1]]));
        let entries = (current_length / 2).min(MAX_IDN_MAPPING);

        if entries == 0 {
            return Ok(0);
        }

        // Control/status word plus 16 data bits per mapped IDN
        Ok(16 + entries as u32 * 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = SoeHeader {
            op_code: OP_READ_REQUEST,
            incomplete: false,
            error: false,
            drive_no: 2,
            elements: SoeElements::VALUE.bits(),
            idn_or_fragments: 24,
        };

        let packed = header.pack();

        assert_eq!(packed, [0x41, 0x40, 0x18, 0x00]);
        assert_eq!(SoeHeader::unpack(&packed).unwrap(), header);
    }

    #[test]
    fn error_flag_is_bit_four() {
        let header = SoeHeader::unpack(&[0x12, 0x00, 0x7f, 0x00]).unwrap();

        assert!(header.error);
        assert_eq!(header.op_code, OP_READ_RESPONSE);
        assert_eq!(header.idn_or_fragments, 0x7f);
    }
}
