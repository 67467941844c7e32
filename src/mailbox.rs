//! Mailbox transport over sync managers 0 and 1.

use crate::{
    error::{Error, ErrorItem, ErrorKind, MailboxError},
    link::Link,
    master::Master,
    register::RegisterAddress,
    sync_manager::status,
    wire::{WireError, WireRead, WireReadSized, WireWrite},
};
use core::time::Duration;
use std::sync::atomic::Ordering;

/// Maximum mailbox payload carried in one datagram.
pub(crate) const MAX_MBX: usize = crate::MAX_LRW_DATA;

/// Length of the mailbox header.
pub(crate) const MBX_HEADER_LEN: usize = 6;

/// Mailbox protocol discriminant, low nibble of the type byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub(crate) enum MailboxType {
    /// Error reply from the slave.
    Err = 0x00,
    /// ADS over EtherCAT.
    Aoe = 0x01,
    /// Ethernet over EtherCAT.
    Eoe = 0x02,
    /// CANopen over EtherCAT.
    Coe = 0x03,
    /// File access over EtherCAT.
    Foe = 0x04,
    /// Servo profile over EtherCAT.
    Soe = 0x05,
    /// Vendor specific.
    VendorSpecific = 0x0f,
}

impl MailboxType {
    fn from_nibble(raw: u8) -> Result<Self, WireError> {
        match raw & 0x0f {
            0x00 => Ok(Self::Err),
            0x01 => Ok(Self::Aoe),
            0x02 => Ok(Self::Eoe),
            0x03 => Ok(Self::Coe),
            0x04 => Ok(Self::Foe),
            0x05 => Ok(Self::Soe),
            0x0f => Ok(Self::VendorSpecific),
            _ => Err(WireError::InvalidValue),
        }
    }
}

/// Mailbox header.
///
/// Defined in ETG1000.6 as `MbxHeader`, e.g. Table 29 – CoE Elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct MailboxHeader {
    /// Payload length following this header.
    pub length: u16,
    /// Station address of the originator; zero from the master.
    pub address: u16,
    /// Channel (unused) and priority bits; always zero here.
    pub priority: u8,
    /// Protocol carried in the payload.
    pub mailbox_type: MailboxType,
    /// Rolling counter 1..=7. Zero is reserved.
    pub counter: u8,
}

impl MailboxHeader {
    pub fn new(mailbox_type: MailboxType, length: u16, counter: u8) -> Self {
        Self {
            length,
            address: 0,
            priority: 0,
            mailbox_type,
            counter,
        }
    }
}

impl WireWrite for MailboxHeader {
    fn packed_len(&self) -> usize {
        MBX_HEADER_LEN
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..MBX_HEADER_LEN];

        buf[0..2].copy_from_slice(&self.length.to_le_bytes());
        buf[2..4].copy_from_slice(&self.address.to_le_bytes());
        buf[4] = self.priority;
        buf[5] = (self.mailbox_type as u8) | (self.counter << 4);

        buf
    }
}

impl WireRead for MailboxHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let buf = buf
            .get(0..MBX_HEADER_LEN)
            .ok_or(WireError::ReadBufferTooShort)?;

        Ok(Self {
            length: u16::from_le_bytes([buf[0], buf[1]]),
            address: u16::from_le_bytes([buf[2], buf[3]]),
            priority: buf[4],
            mailbox_type: MailboxType::from_nibble(buf[5])?,
            counter: buf[5] >> 4,
        })
    }
}

impl WireReadSized for MailboxHeader {
    const PACKED_LEN: usize = MBX_HEADER_LEN;
}

impl<L: Link> Master<L> {
    /// Wait until the slave's write mailbox (SM0) is empty.
    fn mailbox_wait_empty(&self, slave: u16, timeout: Duration) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();
        let deadline = std::time::Instant::now() + timeout;

        loop {
            let (sm_status, wkc) = self.fprd::<u8>(
                configured_address,
                RegisterAddress::sync_manager_status(0),
                self.timeouts.pdu3(),
            )?;

            if wkc > 0 && sm_status & status::MAILBOX_FULL == 0 {
                return Ok(());
            }

            if std::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            std::thread::sleep(self.timeouts.wait_loop_delay);
        }
    }

    /// Whether the slave's read mailbox (SM1) has a message waiting.
    fn mailbox_full(&self, slave: u16) -> Result<bool, Error> {
        let configured_address = self.slave(slave)?.configured_address();

        let (sm_status, wkc) = self.fprd::<u8>(
            configured_address,
            RegisterAddress::sync_manager_status(1),
            self.timeouts.pdu3(),
        )?;

        Ok(wkc > 0 && sm_status & status::MAILBOX_FULL != 0)
    }

    /// Write one mailbox message to the slave.
    ///
    /// `message` must start with a packed [`MailboxHeader`]; the write covers
    /// the slave's whole mailbox buffer, so `message` is padded up to the
    /// configured mailbox length.
    pub(crate) fn mailbox_send(
        &self,
        slave: u16,
        message: &[u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        let (configured_address, offset, len) = {
            let rec = self.slave(slave)?;

            if !rec.has_mailbox() {
                return Err(Error::Mailbox(MailboxError::NoMailbox));
            }

            (
                rec.configured_address(),
                rec.mailbox_write_offset,
                usize::from(rec.mailbox_write_len).min(MAX_MBX),
            )
        };

        if message.len() > len {
            return Err(Error::Mailbox(MailboxError::TooLong {
                address: 0,
                sub_index: 0,
            }));
        }

        self.mailbox_wait_empty(slave, timeout)?;

        let mut buf = [0u8; MAX_MBX];
        let buf = &mut buf[..len];

        buf[..message.len()].copy_from_slice(message);

        let wkc = self.port.fpwr(configured_address, offset, buf, self.timeouts.pdu3())?;

        Master::<L>::require_wkc(wkc, 1)
    }

    /// Read one mailbox message from the slave into `out`.
    ///
    /// CoE emergencies are intercepted: they are pushed onto the error ring
    /// and the wait continues for the next message. Retransmissions (repeated
    /// rolling counter) are ignored the same way. A zero `timeout` performs a
    /// single poll.
    ///
    /// Returns the number of payload bytes after the mailbox header.
    pub(crate) fn mailbox_receive(
        &self,
        slave: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if !self.mailbox_full(slave)? {
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }

                std::thread::sleep(self.timeouts.wait_loop_delay);

                continue;
            }

            let (configured_address, offset, len) = {
                let rec = self.slave(slave)?;

                if rec.mailbox_read_len == 0 {
                    return Err(Error::Mailbox(MailboxError::NoMailbox));
                }

                (
                    rec.configured_address(),
                    rec.mailbox_read_offset,
                    usize::from(rec.mailbox_read_len).min(MAX_MBX),
                )
            };

            let mut buf = [0u8; MAX_MBX];
            let buf = &mut buf[..len];

            let wkc = self
                .port
                .fprd(configured_address, offset, buf, self.timeouts.pdu3())?;

            if wkc == 0 {
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }

                continue;
            }

            let header = MailboxHeader::unpack_from_slice(buf)?;

            if !self.slave(slave)?.accept_mailbox_counter(header.counter) {
                log::trace!("Slave {} mailbox retransmission ignored", slave);

                if std::time::Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }

                continue;
            }

            let payload_len = usize::from(header.length).min(len - MBX_HEADER_LEN);
            let payload = &buf[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            match header.mailbox_type {
                MailboxType::Err => {
                    let detail = u16::unpack_from_slice(payload.get(2..4).unwrap_or(&[0, 0]))
                        .unwrap_or(0);

                    self.push_error(ErrorItem {
                        slave,
                        index: 0,
                        sub_index: 0,
                        kind: ErrorKind::Mailbox,
                        code: u32::from(detail),
                    });

                    return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                        address: 0,
                        sub_index: 0,
                    }));
                }
                MailboxType::Coe if is_emergency(payload) => {
                    self.record_emergency(slave, payload);

                    continue;
                }
                _ => (),
            }

            if out.len() < MBX_HEADER_LEN + payload_len {
                return Err(Error::Mailbox(MailboxError::TooLong {
                    address: 0,
                    sub_index: 0,
                }));
            }

            out[..MBX_HEADER_LEN + payload_len]
                .copy_from_slice(&buf[..MBX_HEADER_LEN + payload_len]);

            return Ok(payload_len);
        }
    }

    /// Drain any message waiting in `slave`'s read mailbox, without blocking.
    ///
    /// Used internally to flush stale responses before starting a new
    /// transaction.
    pub(crate) fn mailbox_flush(&self, slave: u16) -> Result<(), Error> {
        let mut scratch = [0u8; MAX_MBX];

        match self.mailbox_receive(slave, &mut scratch, Duration::ZERO) {
            Ok(_) | Err(Error::Timeout) => Ok(()),
            Err(Error::Mailbox(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cyclic mailbox handler: drain pending messages for every slave marked
    /// for cyclic dispatch.
    ///
    /// EoE payloads are handed to the registered EoE hook; emergencies land
    /// on the error ring; anything else is recorded as an unexpected packet.
    pub fn mailbox_handler(&self) -> Result<(), Error> {
        for index in 1..=self.slave_count() {
            let slave = index as u16;

            if !self.slave(slave)?.cyclic_mailbox.load(Ordering::Relaxed) {
                continue;
            }

            while self.mailbox_full(slave)? {
                let mut buf = [0u8; MAX_MBX];

                let payload_len = match self.mailbox_receive(slave, &mut buf, Duration::ZERO) {
                    Ok(len) => len,
                    Err(Error::Timeout) => break,
                    Err(_) => break,
                };

                let header = MailboxHeader::unpack_from_slice(&buf)?;
                let payload = &buf[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

                match header.mailbox_type {
                    MailboxType::Eoe => {
                        if let Some(hook) = &self.eoe_hook {
                            hook(slave, payload);
                        }
                    }
                    MailboxType::Coe => {
                        // Emergencies are already filtered by mailbox_receive;
                        // anything else arriving unrequested is noise.
                        self.push_error(ErrorItem {
                            slave,
                            index: 0,
                            sub_index: 0,
                            kind: ErrorKind::Packet,
                            code: 0,
                        });
                    }
                    _ => {
                        self.push_error(ErrorItem {
                            slave,
                            index: 0,
                            sub_index: 0,
                            kind: ErrorKind::Packet,
                            code: 0,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    fn record_emergency(&self, slave: u16, payload: &[u8]) {
        // CoE header (2) + error code (2) + error register (1) + data
        let error_code = payload
            .get(2..4)
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
            .unwrap_or(0);
        let error_register = payload.get(4).copied().unwrap_or(0);

        log::warn!(
            "Slave {} emergency: code {:#06x} register {:#04x}",
            slave,
            error_code,
            error_register
        );

        self.push_error(ErrorItem {
            slave,
            index: error_code,
            sub_index: error_register,
            kind: ErrorKind::Emergency,
            code: u32::from(error_code),
        });
    }

    /// Mark or unmark a slave for the cyclic mailbox handler.
    pub fn set_cyclic_mailbox(&self, slave: u16, enabled: bool) -> Result<(), Error> {
        self.slave(slave)?
            .cyclic_mailbox
            .store(enabled, Ordering::Relaxed);

        Ok(())
    }
}

/// Whether a CoE payload is an emergency message (service nibble 1).
fn is_emergency(payload: &[u8]) -> bool {
    payload
        .get(1)
        .map(|hi| hi >> 4 == crate::coe::CoeService::Emergency as u8)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_header() {
        // From a wireshark capture
        let expected = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33];

        let mut buf = [0u8; 6];

        MailboxHeader::new(MailboxType::Coe, 10, 3).pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, expected);
    }

    #[test]
    fn decode_header() {
        // From capture "soem-slaveinfo-akd.pcapng", packet #296
        let raw = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x23];

        let parsed = MailboxHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            parsed,
            MailboxHeader {
                length: 10,
                address: 0x0000,
                priority: 0,
                mailbox_type: MailboxType::Coe,
                counter: 2,
            }
        );
    }

    #[test]
    fn emergency_detection() {
        // CoE header word with service = 1 in the top nibble
        let payload = [0x00, 0x10, 0x30, 0x81, 0x11];

        assert!(is_emergency(&payload));

        let sdo_response = [0x00, 0x30, 0x43, 0x18, 0x10];

        assert!(!is_emergency(&sdo_response));
    }
}
