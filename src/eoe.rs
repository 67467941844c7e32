//! Ethernet over EtherCAT: tunnelling Ethernet frames through the mailbox as
//! numbered fragments, plus the IP parameter sub-protocol.

use crate::{
    error::{Error, ErrorItem, ErrorKind},
    link::Link,
    mailbox::{MailboxHeader, MailboxType, MAX_MBX, MBX_HEADER_LEN},
    master::Master,
    slave::MailboxProtocols,
    wire::{WireRead, WireWrite},
};
use core::time::Duration;

const TYPE_FRAGMENT: u8 = 0x00;
const TYPE_INIT_REQ: u8 = 0x02;
const TYPE_INIT_RESP: u8 = 0x03;
const TYPE_GET_IP_REQ: u8 = 0x06;
const TYPE_GET_IP_RESP: u8 = 0x07;

/// EoE header length after the mailbox header.
const EOE_HEADER_LEN: usize = 4;

/// Fragment offsets and sizes are carried in 32 byte blocks.
const BLOCK: usize = 32;

/// Largest Ethernet frame carried through the tunnel.
pub(crate) const MAX_EOE_FRAME: usize = 1518;

/// IP parameter flags for the init (set IP) request.
mod param {
    pub const MAC: u8 = 0x01;
    pub const IP: u8 = 0x02;
    pub const SUBNET: u8 = 0x04;
    pub const GATEWAY: u8 = 0x08;
    pub const DNS_IP: u8 = 0x10;
    pub const DNS_NAME: u8 = 0x20;
}

/// The EoE header: two little endian words.
///
/// Word 0: frame type (0..=3), port (4..=7), last fragment (8), time appended
/// (9), time requested (10). Word 1: fragment number (0..=5), offset or
/// total size in 32 byte blocks (6..=11), frame number (12..=15).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct EoeHeader {
    frame_type: u8,
    port: u8,
    last_fragment: bool,
    fragment: u8,
    offset_or_size: u8,
    frame_number: u8,
}

impl EoeHeader {
    fn pack(&self) -> [u8; 4] {
        let word0 = u16::from(self.frame_type & 0x0f)
            | u16::from(self.port & 0x0f) << 4
            | u16::from(self.last_fragment) << 8;

        let word1 = u16::from(self.fragment & 0x3f)
            | u16::from(self.offset_or_size & 0x3f) << 6
            | u16::from(self.frame_number & 0x0f) << 12;

        let mut buf = [0u8; 4];

        buf[0..2].copy_from_slice(&word0.to_le_bytes());
        buf[2..4].copy_from_slice(&word1.to_le_bytes());

        buf
    }

    fn unpack(buf: &[u8]) -> Result<Self, Error> {
        let word0 = u16::unpack_from_slice(buf)?;
        let word1 = u16::unpack_from_slice(&buf[2..])?;

        Ok(Self {
            frame_type: (word0 & 0x0f) as u8,
            port: (word0 >> 4 & 0x0f) as u8,
            last_fragment: word0 >> 8 & 0x01 == 0x01,
            fragment: (word1 & 0x3f) as u8,
            offset_or_size: (word1 >> 6 & 0x3f) as u8,
            frame_number: (word1 >> 12 & 0x0f) as u8,
        })
    }
}

/// Network parameters for a slave's virtual Ethernet port.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EthernetSettings {
    /// MAC address, or `None` to leave unset.
    pub mac: Option<[u8; 6]>,
    /// IPv4 address.
    pub ip: Option<[u8; 4]>,
    /// Subnet mask.
    pub subnet: Option<[u8; 4]>,
    /// Default gateway.
    pub gateway: Option<[u8; 4]>,
    /// DNS server address.
    pub dns_ip: Option<[u8; 4]>,
    /// DNS name, up to 32 bytes.
    pub dns_name: Option<heapless::String<32>>,
}

/// Reassembles tunnelled Ethernet frames from mailbox fragments.
///
/// Feed each received EoE mailbox payload to [`push`](Self::push); a frame is
/// complete when `push` returns its length.
#[derive(Debug, Default)]
pub struct EoeReassembler {
    expected_fragment: u8,
    expected_offset: usize,
    frame_number: u8,
    frame_size: usize,
    in_progress: bool,
}

impl EoeReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially assembled frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Process one EoE mailbox payload (starting at the EoE header).
    ///
    /// Returns `Ok(Some(len))` when `out` holds a complete Ethernet frame of
    /// `len` bytes, `Ok(None)` while fragments are still outstanding.
    pub fn push(&mut self, payload: &[u8], out: &mut [u8]) -> Result<Option<usize>, Error> {
        let header = EoeHeader::unpack(payload)?;

        if header.frame_type != TYPE_FRAGMENT {
            return Err(Error::Pdu(crate::error::PduError::Decode));
        }

        let data = &payload[EOE_HEADER_LEN..];

        if header.fragment == 0 {
            // First fragment: the offset field carries the total frame size
            self.frame_size = usize::from(header.offset_or_size) * BLOCK;
            self.expected_fragment = 0;
            self.expected_offset = 0;
            self.frame_number = header.frame_number;
            self.in_progress = true;
        } else if !self.in_progress
            || header.fragment != self.expected_fragment
            || header.frame_number != self.frame_number
            || usize::from(header.offset_or_size) * BLOCK != self.expected_offset
        {
            // Out of sequence; drop the frame under assembly
            self.reset();

            return Ok(None);
        }

        if self.expected_offset + data.len() > out.len() {
            self.reset();

            return Err(Error::Pdu(crate::error::PduError::TooLong));
        }

        out[self.expected_offset..self.expected_offset + data.len()].copy_from_slice(data);

        self.expected_offset += data.len();
        self.expected_fragment += 1;

        if header.last_fragment {
            let len = self.expected_offset;

            self.reset();

            return Ok(Some(len));
        }

        Ok(None)
    }
}

impl<L: Link> Master<L> {
    fn require_eoe(&self, slave: u16) -> Result<usize, Error> {
        let rec = self.slave(slave)?;

        // Whole 32 byte blocks that fit after the mailbox and EoE headers
        let max_data = usize::from(rec.mailbox_write_len)
            .saturating_sub(MBX_HEADER_LEN + EOE_HEADER_LEN)
            / BLOCK
            * BLOCK;

        if max_data == 0 || !rec.mailbox_protocols().contains(MailboxProtocols::EOE) {
            return Err(Error::Mailbox(crate::error::MailboxError::NoMailbox));
        }

        Ok(max_data)
    }

    /// Send one Ethernet frame through the slave's EoE tunnel, splitting it
    /// into as many fragments as the mailbox requires.
    pub fn eoe_send(
        &self,
        slave: u16,
        port: u8,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let max_data = self.require_eoe(slave)?;

        if frame.len() > MAX_EOE_FRAME {
            return Err(Error::Pdu(crate::error::PduError::TooLong));
        }

        let total_blocks = frame.len().div_ceil(BLOCK);
        let frame_number = (self.port_frame_number(slave)) & 0x0f;

        let mut offset = 0usize;
        let mut fragment = 0u8;

        while offset < frame.len() || fragment == 0 {
            let remaining = frame.len() - offset;
            let chunk = remaining.min(max_data);
            let last = chunk == remaining;

            let header = EoeHeader {
                frame_type: TYPE_FRAGMENT,
                port,
                last_fragment: last,
                fragment,
                offset_or_size: if fragment == 0 {
                    total_blocks as u8
                } else {
                    (offset / BLOCK) as u8
                },
                frame_number,
            };

            let mut request = [0u8; MAX_MBX];

            let counter = self.slave(slave)?.next_mailbox_counter();

            MailboxHeader::new(MailboxType::Eoe, (EOE_HEADER_LEN + chunk) as u16, counter)
                .pack_to_slice_unchecked(&mut request);
            request[6..10].copy_from_slice(&header.pack());
            request[10..10 + chunk].copy_from_slice(&frame[offset..offset + chunk]);

            self.mailbox_send(
                slave,
                &request[..MBX_HEADER_LEN + EOE_HEADER_LEN + chunk],
                timeout,
            )?;

            offset += chunk;
            fragment += 1;

            if last {
                break;
            }
        }

        Ok(())
    }

    /// Receive one tunnelled Ethernet frame, blocking until a complete frame
    /// has been reassembled or `timeout` expires per mailbox cycle.
    ///
    /// Returns the frame length.
    pub fn eoe_receive(
        &self,
        slave: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.require_eoe(slave)?;

        let mut reassembler = EoeReassembler::new();

        loop {
            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let header = MailboxHeader::unpack_from_slice(&response)?;

            if header.mailbox_type != MailboxType::Eoe {
                self.push_error(ErrorItem {
                    slave,
                    index: 0,
                    sub_index: 0,
                    kind: ErrorKind::Eoe,
                    code: 0,
                });

                continue;
            }

            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            if let Some(len) = reassembler.push(payload, out)? {
                return Ok(len);
            }
        }
    }

    /// Configure the slave's virtual Ethernet port parameters.
    pub fn eoe_set_ip(
        &self,
        slave: u16,
        port: u8,
        settings: &EthernetSettings,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.require_eoe(slave)?;
        self.mailbox_flush(slave)?;

        let mut flags = 0u8;
        let mut body = [0u8; 6 + 4 + 4 + 4 + 4 + 32];
        let mut len = 0usize;

        if let Some(mac) = settings.mac {
            flags |= param::MAC;
            body[len..len + 6].copy_from_slice(&mac);
            len += 6;
        }

        if let Some(ip) = settings.ip {
            flags |= param::IP;
            body[len..len + 4].copy_from_slice(&ip);
            len += 4;
        }

        if let Some(subnet) = settings.subnet {
            flags |= param::SUBNET;
            body[len..len + 4].copy_from_slice(&subnet);
            len += 4;
        }

        if let Some(gateway) = settings.gateway {
            flags |= param::GATEWAY;
            body[len..len + 4].copy_from_slice(&gateway);
            len += 4;
        }

        if let Some(dns_ip) = settings.dns_ip {
            flags |= param::DNS_IP;
            body[len..len + 4].copy_from_slice(&dns_ip);
            len += 4;
        }

        if let Some(dns_name) = &settings.dns_name {
            flags |= param::DNS_NAME;

            let bytes = dns_name.as_bytes();

            body[len..len + bytes.len()].copy_from_slice(bytes);
            len += 32;
        }

        let header = EoeHeader {
            frame_type: TYPE_INIT_REQ,
            port,
            last_fragment: true,
            fragment: 0,
            offset_or_size: 0,
            frame_number: 0,
        };

        let mut request = [0u8; MAX_MBX];

        let counter = self.slave(slave)?.next_mailbox_counter();

        MailboxHeader::new(MailboxType::Eoe, (EOE_HEADER_LEN + 1 + len) as u16, counter)
            .pack_to_slice_unchecked(&mut request);
        request[6..10].copy_from_slice(&header.pack());
        request[10] = flags;
        request[11..11 + len].copy_from_slice(&body[..len]);

        self.mailbox_send(
            slave,
            &request[..MBX_HEADER_LEN + EOE_HEADER_LEN + 1 + len],
            self.timeouts.mailbox_echo,
        )?;

        self.eoe_expect_response(slave, TYPE_INIT_RESP, timeout)
            .map(|_| ())
    }

    /// Read back the slave's virtual Ethernet port parameters.
    pub fn eoe_get_ip(
        &self,
        slave: u16,
        port: u8,
        timeout: Duration,
    ) -> Result<EthernetSettings, Error> {
        self.require_eoe(slave)?;
        self.mailbox_flush(slave)?;

        let header = EoeHeader {
            frame_type: TYPE_GET_IP_REQ,
            port,
            last_fragment: true,
            fragment: 0,
            offset_or_size: 0,
            frame_number: 0,
        };

        let mut request = [0u8; MBX_HEADER_LEN + EOE_HEADER_LEN];

        let counter = self.slave(slave)?.next_mailbox_counter();

        MailboxHeader::new(MailboxType::Eoe, EOE_HEADER_LEN as u16, counter)
            .pack_to_slice_unchecked(&mut request);
        request[6..10].copy_from_slice(&header.pack());

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let payload = self.eoe_expect_response(slave, TYPE_GET_IP_RESP, timeout)?;

        let mut settings = EthernetSettings::default();
        let flags = payload.first().copied().unwrap_or(0);
        let mut at = 1usize;

        let body = &payload[..];

        if flags & param::MAC != 0 && at + 6 <= body.len() {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&body[at..at + 6]);
            settings.mac = Some(mac);
            at += 6;
        }

        for (bit, target) in [
            (param::IP, 0usize),
            (param::SUBNET, 1),
            (param::GATEWAY, 2),
            (param::DNS_IP, 3),
        ] {
            if flags & bit != 0 && at + 4 <= body.len() {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&body[at..at + 4]);

                match target {
                    0 => settings.ip = Some(addr),
                    1 => settings.subnet = Some(addr),
                    2 => settings.gateway = Some(addr),
                    _ => settings.dns_ip = Some(addr),
                }

                at += 4;
            }
        }

        if flags & param::DNS_NAME != 0 && at < body.len() {
            let mut name = heapless::String::new();

            for byte in body[at..].iter().take(32) {
                if *byte == 0 {
                    break;
                }

                if byte.is_ascii() && !byte.is_ascii_control() {
                    let _ = name.push(*byte as char);
                }
            }

            settings.dns_name = Some(name);
        }

        Ok(settings)
    }

    fn eoe_expect_response(
        &self,
        slave: u16,
        expected_type: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
        let header = MailboxHeader::unpack_from_slice(&response)?;

        if header.mailbox_type != MailboxType::Eoe {
            return Err(Error::Pdu(crate::error::PduError::Decode));
        }

        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];
        let eoe = EoeHeader::unpack(payload)?;

        if eoe.frame_type != expected_type {
            self.push_error(ErrorItem {
                slave,
                index: 0,
                sub_index: 0,
                kind: ErrorKind::Eoe,
                code: u32::from(eoe.offset_or_size),
            });

            return Err(Error::Pdu(crate::error::PduError::Decode));
        }

        Ok(payload[EOE_HEADER_LEN..].to_vec())
    }

    /// Per-slave outgoing EoE frame number. The low four bits of the mailbox
    /// counter serve; frames only need to differ from their predecessor.
    fn port_frame_number(&self, slave: u16) -> u8 {
        self.slave(slave)
            .map(|rec| {
                rec.mailbox_counter
                    .load(std::sync::atomic::Ordering::Relaxed)
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EoeHeader {
            frame_type: TYPE_FRAGMENT,
            port: 1,
            last_fragment: true,
            fragment: 5,
            offset_or_size: 12,
            frame_number: 3,
        };

        let packed = header.pack();

        assert_eq!(EoeHeader::unpack(&packed).unwrap(), header);
    }

    #[test]
    fn reassembly_in_order() {
        let mut reassembler = EoeReassembler::new();
        let mut out = [0u8; 128];

        // 64 byte frame in two 32 byte fragments
        let mut first = vec![0u8; 4 + 32];

        first[0..4].copy_from_slice(
            &EoeHeader {
                frame_type: TYPE_FRAGMENT,
                port: 0,
                last_fragment: false,
                fragment: 0,
                offset_or_size: 2,
                frame_number: 7,
            }
            .pack(),
        );
        first[4..].fill(0xaa);

        assert_eq!(reassembler.push(&first, &mut out).unwrap(), None);

        let mut second = vec![0u8; 4 + 32];

        second[0..4].copy_from_slice(
            &EoeHeader {
                frame_type: TYPE_FRAGMENT,
                port: 0,
                last_fragment: true,
                fragment: 1,
                offset_or_size: 1,
                frame_number: 7,
            }
            .pack(),
        );
        second[4..].fill(0xbb);

        assert_eq!(reassembler.push(&second, &mut out).unwrap(), Some(64));
        assert!(out[..32].iter().all(|b| *b == 0xaa));
        assert!(out[32..64].iter().all(|b| *b == 0xbb));
    }

    #[test]
    fn out_of_sequence_fragment_drops_frame() {
        let mut reassembler = EoeReassembler::new();
        let mut out = [0u8; 128];

        let mut fragment = vec![0u8; 4 + 32];

        fragment[0..4].copy_from_slice(
            &EoeHeader {
                frame_type: TYPE_FRAGMENT,
                port: 0,
                last_fragment: true,
                fragment: 2,
                offset_or_size: 2,
                frame_number: 1,
            }
            .pack(),
        );

        // No first fragment seen: dropped, not an error
        assert_eq!(reassembler.push(&fragment, &mut out).unwrap(), None);
        assert!(!reassembler.in_progress);
    }
}
