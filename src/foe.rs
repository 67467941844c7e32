//! File access over EtherCAT: windowed file transfer with a window of one
//! outstanding packet.

use crate::{
    error::{Error, ErrorItem, ErrorKind, FoeError},
    link::Link,
    mailbox::{MailboxHeader, MailboxType, MAX_MBX, MBX_HEADER_LEN},
    master::Master,
    slave::MailboxProtocols,
    wire::{WireRead, WireWrite},
};
use core::time::Duration;

const OP_READ: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const OP_DATA: u8 = 0x03;
const OP_ACK: u8 = 0x04;
const OP_ERROR: u8 = 0x05;
const OP_BUSY: u8 = 0x06;

/// FoE error code for "file not found".
const ERR_NOT_FOUND: u32 = 0x8001;

/// FoE header length after the mailbox header: opcode, reserved and the
/// password/packet number/error code word.
const FOE_HEADER_LEN: usize = 6;

fn build_request(
    buf: &mut [u8],
    op_code: u8,
    counter: u8,
    value: u32,
    data: &[u8],
) -> usize {
    let total = MBX_HEADER_LEN + FOE_HEADER_LEN + data.len();

    MailboxHeader::new(MailboxType::Foe, (FOE_HEADER_LEN + data.len()) as u16, counter)
        .pack_to_slice_unchecked(buf);

    buf[6] = op_code;
    buf[7] = 0;
    buf[8..12].copy_from_slice(&value.to_le_bytes());
    buf[12..12 + data.len()].copy_from_slice(data);

    total
}

struct FoeResponse<'a> {
    op_code: u8,
    value: u32,
    data: &'a [u8],
}

fn parse_response(buf: &[u8]) -> Result<FoeResponse<'_>, Error> {
    let header = MailboxHeader::unpack_from_slice(buf)?;

    if header.mailbox_type != MailboxType::Foe {
        return Err(Error::Foe(FoeError::UnexpectedPacket));
    }

    let payload_len = usize::from(header.length);

    if payload_len < FOE_HEADER_LEN {
        return Err(Error::Foe(FoeError::UnexpectedPacket));
    }

    let payload = buf
        .get(MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len)
        .ok_or(Error::Foe(FoeError::UnexpectedPacket))?;

    Ok(FoeResponse {
        op_code: payload[0],
        value: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
        data: &payload[FOE_HEADER_LEN..],
    })
}

impl<L: Link> Master<L> {
    fn require_foe(&self, slave: u16) -> Result<usize, Error> {
        let rec = self.slave(slave)?;

        let usable = usize::from(rec.mailbox_write_len)
            .saturating_sub(MBX_HEADER_LEN + FOE_HEADER_LEN);

        if usable == 0 || !rec.mailbox_protocols().contains(MailboxProtocols::FOE) {
            return Err(Error::Mailbox(crate::error::MailboxError::NoMailbox));
        }

        // Opcode and number word eat into every mailbox payload
        Ok(usable)
    }

    fn foe_error(&self, slave: u16, code: u32) -> Error {
        self.push_error(ErrorItem {
            slave,
            index: 0,
            sub_index: 0,
            kind: ErrorKind::Foe,
            code,
        });

        if code == ERR_NOT_FOUND {
            Error::Foe(FoeError::FileNotFound)
        } else {
            Error::Foe(FoeError::Error(code))
        }
    }

    /// Read a file from the slave into `out`. Returns the file length.
    ///
    /// `timeout` bounds each mailbox cycle, not the whole transfer.
    pub fn foe_read(
        &self,
        slave: u16,
        file_name: &str,
        password: u32,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let max_data = self.require_foe(slave)?;

        self.mailbox_flush(slave)?;

        let name = file_name.as_bytes();
        let name_len = name.len().min(max_data);

        let mut request = [0u8; MAX_MBX];

        let counter = self.slave(slave)?.next_mailbox_counter();
        let len = build_request(
            &mut request,
            OP_READ,
            counter,
            password,
            &name[..name_len],
        );

        self.mailbox_send(slave, &request[..len], self.timeouts.mailbox_echo)?;

        let mut received = 0usize;
        let mut expected_packet = 1u32;

        loop {
            let mut response = [0u8; MAX_MBX];

            self.mailbox_receive(slave, &mut response, timeout)?;

            let parsed = parse_response(&response)?;

            match parsed.op_code {
                OP_DATA => {
                    if parsed.value != expected_packet {
                        return Err(Error::Foe(FoeError::PacketNumber {
                            expected: expected_packet,
                            received: parsed.value,
                        }));
                    }

                    if received + parsed.data.len() > out.len() {
                        return Err(Error::Foe(FoeError::BufferTooSmall));
                    }

                    out[received..received + parsed.data.len()].copy_from_slice(parsed.data);
                    received += parsed.data.len();

                    if let Some(hook) = &self.foe_hook {
                        hook(slave, parsed.value, received);
                    }

                    let done = parsed.data.len() < max_data;

                    let counter = self.slave(slave)?.next_mailbox_counter();
                    let len = build_request(
                        &mut request,
                        OP_ACK,
                        counter,
                        expected_packet,
                        &[],
                    );

                    self.mailbox_send(slave, &request[..len], self.timeouts.mailbox_echo)?;

                    if done {
                        return Ok(received);
                    }

                    expected_packet += 1;
                }
                OP_ERROR => return Err(self.foe_error(slave, parsed.value)),
                _ => return Err(Error::Foe(FoeError::UnexpectedPacket)),
            }
        }
    }

    /// Write a file to the slave.
    ///
    /// The transfer keeps one packet in flight; each DATA packet is only sent
    /// after the previous one was acknowledged by number. A BUSY reply rewinds
    /// the window by one packet. `timeout` bounds each mailbox cycle.
    pub fn foe_write(
        &self,
        slave: u16,
        file_name: &str,
        password: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let max_data = self.require_foe(slave)?;

        self.mailbox_flush(slave)?;

        let name = file_name.as_bytes();
        let name_len = name.len().min(max_data);

        let mut request = [0u8; MAX_MBX];

        let counter = self.slave(slave)?.next_mailbox_counter();
        let len = build_request(
            &mut request,
            OP_WRITE,
            counter,
            password,
            &name[..name_len],
        );

        self.mailbox_send(slave, &request[..len], self.timeouts.mailbox_echo)?;

        let mut sent_packets = 0u32;
        let mut offset = 0usize;
        let mut last_chunk = 0usize;
        let mut final_zero_pending = false;

        loop {
            let mut response = [0u8; MAX_MBX];

            self.mailbox_receive(slave, &mut response, timeout)?;

            let parsed = parse_response(&response)?;

            match parsed.op_code {
                OP_ACK => {
                    if parsed.value != sent_packets {
                        return Err(Error::Foe(FoeError::PacketNumber {
                            expected: sent_packets,
                            received: parsed.value,
                        }));
                    }

                    if let Some(hook) = &self.foe_hook {
                        hook(slave, parsed.value, offset);
                    }

                    let remaining = data.len() - offset;

                    if remaining == 0 && !final_zero_pending {
                        return Ok(());
                    }

                    let chunk = remaining.min(max_data);

                    // A final full sized chunk needs a zero length packet to
                    // signal EOF.
                    final_zero_pending = remaining == chunk && chunk == max_data;

                    sent_packets += 1;

                    let counter = self.slave(slave)?.next_mailbox_counter();
                    let len = build_request(
                        &mut request,
                        OP_DATA,
                        counter,
                        sent_packets,
                        &data[offset..offset + chunk],
                    );

                    self.mailbox_send(slave, &request[..len], self.timeouts.mailbox_echo)?;

                    last_chunk = chunk;
                    offset += chunk;
                }
                OP_BUSY => {
                    // Rewind one packet and let the next ACK resend it
                    if sent_packets > 0 {
                        offset -= last_chunk;
                        sent_packets -= 1;

                        if offset == data.len() {
                            final_zero_pending = true;
                        }
                    }
                }
                OP_ERROR => return Err(self.foe_error(slave, parsed.value)),
                _ => return Err(Error::Foe(FoeError::UnexpectedPacket)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Number of DATA packets a file of `len` bytes produces with `max_data`
    /// byte chunks, and whether a trailing zero length packet is needed.
    ///
    /// EOF is signalled by a short chunk; a file that divides evenly needs
    /// one empty packet to terminate the stream.
    fn data_packet_count(len: usize, max_data: usize) -> (usize, bool) {
        if len == 0 {
            return (0, false);
        }

        let full = len / max_data;
        let rem = len % max_data;

        if rem == 0 {
            (full, true)
        } else {
            (full + 1, false)
        }
    }

    #[test]
    fn packet_count_for_short_final_chunk() {
        // 100_000 byte file with 124 byte chunks: 807 packets, the last one
        // short, so no trailing empty packet.
        assert_eq!(data_packet_count(100_000, 124), (807, false));
    }

    #[test]
    fn packet_count_for_exact_multiple() {
        assert_eq!(data_packet_count(992, 124), (8, true));
    }

    #[test]
    fn empty_file_sends_no_data_packets() {
        assert_eq!(data_packet_count(0, 124), (0, false));
    }

    #[test]
    fn request_layout() {
        let mut buf = [0u8; 64];

        let len = build_request(&mut buf, OP_READ, 3, 0, b"firmware.bin");

        assert_eq!(len, 6 + 6 + 12);
        // Mailbox header: length 18, type FoE | counter 3
        assert_eq!(&buf[0..6], &[0x12, 0x00, 0x00, 0x00, 0x00, 0x34]);
        assert_eq!(buf[6], OP_READ);
        assert_eq!(&buf[12..24], b"firmware.bin");
    }
}
