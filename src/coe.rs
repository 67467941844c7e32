//! CANopen over EtherCAT: SDO transfers, PDO map discovery and the SDO
//! information service.

use crate::{
    error::{Error, ErrorItem, ErrorKind, MailboxError},
    link::Link,
    mailbox::{MailboxHeader, MailboxType, MAX_MBX, MBX_HEADER_LEN},
    master::Master,
    slave::MailboxProtocols,
    sync_manager::SmType,
    wire::{WireRead, WireWrite},
    MAX_NAME_LEN, MAX_SM,
};
use core::time::Duration;
use num_enum::FromPrimitive;

/// CoE service discriminant, top nibble of the CoE header word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CoeService {
    /// Emergency message.
    Emergency = 0x01,
    /// SDO request.
    SdoRequest = 0x02,
    /// SDO response.
    SdoResponse = 0x03,
    /// TxPDO transfer.
    TxPdo = 0x04,
    /// RxPDO transfer.
    RxPdo = 0x05,
    /// SDO information service.
    SdoInformation = 0x08,
}

// SDO command specifiers, as transmitted in the byte following the CoE
// header.
const SDO_DOWN_INIT: u8 = 0x21;
const SDO_DOWN_INIT_CA: u8 = 0x31;
const SDO_DOWN_EXP: u8 = 0x23;
const SDO_UP_REQ: u8 = 0x40;
const SDO_UP_REQ_CA: u8 = 0x50;
const SDO_SEG_UP_REQ: u8 = 0x60;
const SDO_ABORT: u8 = 0x80;
const SDO_TOGGLE: u8 = 0x10;

/// Sync manager communication type object.
const SM_COMM_TYPE: u16 = 0x1c00;
/// First PDO assign object; SM `n` uses `0x1c10 + n`.
const PDO_ASSIGN_BASE: u16 = 0x1c10;

/// CoE detail bits from the SII general category.
#[allow(dead_code)]
pub(crate) mod details {
    pub const SDO: u8 = 0x01;
    pub const SDO_INFO: u8 = 0x02;
    pub const PDO_ASSIGN: u8 = 0x04;
    pub const PDO_CONFIG: u8 = 0x08;
    pub const UPLOAD: u8 = 0x10;
    /// SDO complete access supported.
    pub const SDO_CA: u8 = 0x20;
}

/// Maximum entries returned by an object description list read.
pub const MAX_OD_LIST: usize = 1024;

/// SDO abort code.
///
/// Defined in ETG1000.6 Table 41.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u32)]
pub enum CoeAbortCode {
    /// Toggle bit not alternated.
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out.
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown.
    InvalidCommand = 0x0504_0001,
    /// Out of memory.
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object.
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object.
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object.
    ReadOnly = 0x0601_0002,
    /// Subindex cannot be written, SI0 must be 0 for write access.
    SubIndexCannotBeWritten = 0x0601_0003,
    /// SDO complete access not supported for variable length objects.
    CompleteAccessUnsupported = 0x0601_0004,
    /// Object length exceeds mailbox size.
    ObjectTooLong = 0x0601_0005,
    /// Object mapped to RxPDO, SDO download blocked.
    MappedToRxPdo = 0x0601_0006,
    /// The object does not exist in the object directory.
    NotFound = 0x0602_0000,
    /// The object cannot be mapped into the PDO.
    CannotMap = 0x0604_0041,
    /// The number and length of the objects to be mapped would exceed the PDO
    /// length.
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility reason.
    ParameterIncompatibility = 0x0604_0043,
    /// General internal incompatibility in the device.
    DeviceIncompatibility = 0x0604_0047,
    /// Access failed due to a hardware error.
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match.
    LengthMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high.
    TooLong = 0x0607_0012,
    /// Data type does not match, length of service parameter too low.
    TooShort = 0x0607_0013,
    /// Subindex does not exist.
    SubIndexNotFound = 0x0609_0011,
    /// Value range of parameter exceeded.
    ValueOutOfRange = 0x0609_0030,
    /// Value of parameter written too high.
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low.
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value.
    MaxLessThanMin = 0x0609_0036,
    /// General error.
    General = 0x0800_0000,
    /// Data cannot be transferred or stored to the application.
    TransferFailed = 0x0800_0020,
    /// Data cannot be transferred because of local control.
    LocalControl = 0x0800_0021,
    /// Data cannot be transferred in the current device state.
    InvalidDeviceState = 0x0800_0022,
    /// Object dictionary dynamic generation failed or no object dictionary
    /// present.
    NoObjectDictionary = 0x0800_0023,
    /// An unstandardised code was returned.
    #[num_enum(catch_all)]
    Unknown(u32),
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::ToggleNotAlternated => "toggle bit not alternated",
            Self::SdoTimeout => "SDO protocol timed out",
            Self::InvalidCommand => "command specifier not valid",
            Self::OutOfMemory => "out of memory",
            Self::UnsupportedAccess => "unsupported access to object",
            Self::WriteOnly => "object is write only",
            Self::ReadOnly => "object is read only",
            Self::SubIndexCannotBeWritten => "subindex cannot be written",
            Self::CompleteAccessUnsupported => "complete access not supported",
            Self::ObjectTooLong => "object length exceeds mailbox size",
            Self::MappedToRxPdo => "object mapped to RxPDO",
            Self::NotFound => "object does not exist",
            Self::CannotMap => "object cannot be mapped into PDO",
            Self::PdoTooLong => "mapping would exceed PDO length",
            Self::ParameterIncompatibility => "parameter incompatibility",
            Self::DeviceIncompatibility => "internal device incompatibility",
            Self::HardwareError => "hardware error",
            Self::LengthMismatch => "parameter length does not match",
            Self::TooLong => "parameter too long",
            Self::TooShort => "parameter too short",
            Self::SubIndexNotFound => "subindex does not exist",
            Self::ValueOutOfRange => "value out of range",
            Self::ValueTooHigh => "value too high",
            Self::ValueTooLow => "value too low",
            Self::MaxLessThanMin => "maximum less than minimum",
            Self::General => "general error",
            Self::TransferFailed => "transfer failed",
            Self::LocalControl => "blocked by local control",
            Self::InvalidDeviceState => "invalid device state",
            Self::NoObjectDictionary => "no object dictionary",
            Self::Unknown(code) => return write!(f, "abort code {:#010x}", code),
        };

        f.write_str(s)
    }
}

/// One entry of an object description list.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    /// Object index.
    pub index: u16,
    /// CoE data type code.
    pub data_type: u16,
    /// Highest subindex.
    pub max_sub_index: u8,
    /// Object code (variable, array, record).
    pub object_code: u8,
}

/// The indices present in a slave's object dictionary.
#[derive(Debug)]
pub struct ObjectDescriptionList {
    /// Slave the list was read from.
    pub slave: u16,
    /// Object indices.
    pub indices: heapless::Vec<u16, MAX_OD_LIST>,
}

/// Description of one object entry (subindex).
#[derive(Debug, Default, Clone)]
pub struct ObjectEntryInfo {
    /// Value info bits requested/returned.
    pub value_info: u8,
    /// CoE data type code.
    pub data_type: u16,
    /// Entry length in bits.
    pub bit_length: u16,
    /// Access rights bits.
    pub access: u16,
    /// Entry name.
    pub name: heapless::String<MAX_NAME_LEN>,
}

/// Result of PDO map discovery.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PdoMapSizes {
    pub output_bits: u32,
    pub input_bits: u32,
}

fn coe_header(service: CoeService) -> [u8; 2] {
    ((service as u16) << 12).to_le_bytes()
}

fn parse_service(payload_byte: u8) -> u8 {
    payload_byte >> 4
}

impl<L: Link> Master<L> {
    fn require_coe(&self, slave: u16) -> Result<(), Error> {
        let rec = self.slave(slave)?;

        if rec.has_mailbox() && rec.mailbox_protocols().contains(MailboxProtocols::COE) {
            Ok(())
        } else {
            Err(Error::Mailbox(MailboxError::NoMailbox))
        }
    }

    fn sdo_abort(&self, slave: u16, index: u16, sub_index: u8, raw: &[u8]) -> Error {
        let code = raw
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);

        self.push_error(ErrorItem {
            slave,
            index,
            sub_index,
            kind: ErrorKind::Sdo,
            code,
        });

        Error::Mailbox(MailboxError::Aborted {
            code: CoeAbortCode::from(code),
            address: index,
            sub_index,
        })
    }

    /// Read an SDO from the slave's object dictionary into `out`.
    ///
    /// Expedited, normal and segmented transfers are handled transparently;
    /// `complete_access` reads the whole object starting at `sub_index`.
    ///
    /// Returns the number of bytes read.
    pub fn sdo_read(
        &self,
        slave: u16,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + 10];

        MailboxHeader::new(MailboxType::Coe, 0x000a, counter)
            .pack_to_slice_unchecked(&mut request);
        request[6..8].copy_from_slice(&coe_header(CoeService::SdoRequest));
        request[8] = if complete_access {
            SDO_UP_REQ_CA
        } else {
            SDO_UP_REQ
        };
        request[9..11].copy_from_slice(&index.to_le_bytes());
        request[11] = sub_index;

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;

        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

        self.parse_sdo_upload(slave, index, sub_index, payload, out, timeout)
    }

    fn parse_sdo_upload(
        &self,
        slave: u16,
        index: u16,
        sub_index: u8,
        payload: &[u8],
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let invalid = || {
            Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: index,
                sub_index,
            })
        };

        if payload.len() < 10 || parse_service(payload[1]) != CoeService::SdoResponse as u8 {
            if payload.len() >= 10 && payload[2] == SDO_ABORT {
                return Err(self.sdo_abort(slave, index, sub_index, payload.get(6..10).unwrap_or(&[])));
            }

            return Err(invalid());
        }

        let command = payload[2];
        let r_index = u16::from_le_bytes([payload[3], payload[4]]);

        if command == SDO_ABORT {
            return Err(self.sdo_abort(slave, index, sub_index, &payload[6..10]));
        }

        if r_index != index {
            return Err(invalid());
        }

        if command & 0x02 != 0 {
            // Expedited transfer: up to 4 bytes in the header itself
            let size = if command & 0x01 != 0 {
                4 - usize::from((command >> 2) & 0x03)
            } else {
                4
            };

            if out.len() < size {
                return Err(Error::Mailbox(MailboxError::TooLong {
                    address: index,
                    sub_index,
                }));
            }

            out[..size].copy_from_slice(&payload[6..6 + size]);

            return Ok(size);
        }

        // Normal transfer: complete size followed by the first chunk
        let complete_size =
            u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]) as usize;

        if out.len() < complete_size {
            return Err(Error::Mailbox(MailboxError::TooLong {
                address: index,
                sub_index,
            }));
        }

        let first_chunk = (payload.len() - 10).min(complete_size);

        out[..first_chunk].copy_from_slice(&payload[10..10 + first_chunk]);

        let mut received = first_chunk;
        let mut toggle = 0x00u8;

        while received < complete_size {
            let counter = self.slave(slave)?.next_mailbox_counter();

            let mut request = [0u8; MBX_HEADER_LEN + 10];

            MailboxHeader::new(MailboxType::Coe, 0x000a, counter)
                .pack_to_slice_unchecked(&mut request);
            request[6..8].copy_from_slice(&coe_header(CoeService::SdoRequest));
            request[8] = SDO_SEG_UP_REQ | toggle;

            self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let header = MailboxHeader::unpack_from_slice(&response)?;
            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            if payload.len() < 3 || parse_service(payload[1]) != CoeService::SdoResponse as u8 {
                return Err(invalid());
            }

            let seg_command = payload[2];

            if seg_command == SDO_ABORT {
                return Err(self.sdo_abort(slave, index, sub_index, payload.get(6..10).unwrap_or(&[])));
            }

            // Segment payload follows the command byte directly. Short
            // segments keep a 7 byte field; the unused byte count lives in
            // bits 1..=3.
            let mut seg_size = usize::from(header.length).saturating_sub(3);

            if seg_size == 7 {
                seg_size = 7 - usize::from((seg_command >> 1) & 0x07);
            }

            let seg_size = seg_size
                .min(complete_size - received)
                .min(payload.len() - 3);

            out[received..received + seg_size].copy_from_slice(&payload[3..3 + seg_size]);

            received += seg_size;

            // Bit 0 set means this was the last segment
            if seg_command & 0x01 != 0 {
                break;
            }

            toggle ^= SDO_TOGGLE;
        }

        Ok(received)
    }

    /// Write an SDO to the slave's object dictionary.
    ///
    /// Writes of up to 4 bytes use an expedited transfer; larger writes are
    /// sent as a normal download, segmented when the object exceeds the
    /// slave's mailbox.
    pub fn sdo_write(
        &self,
        slave: u16,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let mailbox_len = usize::from(self.slave(slave)?.mailbox_write_len);

        let invalid = || {
            Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: index,
                sub_index,
            })
        };

        if data.len() <= 4 && !complete_access {
            // Expedited download
            let counter = self.slave(slave)?.next_mailbox_counter();

            let mut request = [0u8; MBX_HEADER_LEN + 10];

            MailboxHeader::new(MailboxType::Coe, 0x000a, counter)
                .pack_to_slice_unchecked(&mut request);
            request[6..8].copy_from_slice(&coe_header(CoeService::SdoRequest));
            request[8] = SDO_DOWN_EXP | (((4 - data.len() as u8) << 2) & 0x0c);
            request[9..11].copy_from_slice(&index.to_le_bytes());
            request[11] = sub_index;
            request[12..12 + data.len()].copy_from_slice(data);

            self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            return self.check_download_response(slave, index, sub_index, payload, 0x60);
        }

        // Normal download: as much as fits after the 16 byte preamble
        let max_first = mailbox_len.saturating_sub(16);

        if max_first == 0 {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        let first_chunk = data.len().min(max_first);

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MAX_MBX];

        MailboxHeader::new(
            MailboxType::Coe,
            (0x0a + first_chunk) as u16,
            counter,
        )
        .pack_to_slice_unchecked(&mut request);
        request[6..8].copy_from_slice(&coe_header(CoeService::SdoRequest));
        request[8] = if complete_access {
            SDO_DOWN_INIT_CA
        } else {
            SDO_DOWN_INIT
        };
        request[9..11].copy_from_slice(&index.to_le_bytes());
        request[11] = sub_index;
        request[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        request[16..16 + first_chunk].copy_from_slice(&data[..first_chunk]);

        self.mailbox_send(
            slave,
            &request[..MBX_HEADER_LEN + 10 + first_chunk],
            self.timeouts.mailbox_echo,
        )?;

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

        self.check_download_response(slave, index, sub_index, payload, 0x60)?;

        // Segmented remainder
        let mut sent = first_chunk;
        let mut toggle = 0x00u8;

        while sent < data.len() {
            let max_segment = mailbox_len - MBX_HEADER_LEN - 3;
            let remaining = data.len() - sent;
            let chunk = remaining.min(max_segment);
            let last = chunk == remaining;

            let counter = self.slave(slave)?.next_mailbox_counter();

            let mut request = [0u8; MAX_MBX];

            let body_len = (3 + chunk.max(7)) as u16;

            MailboxHeader::new(MailboxType::Coe, body_len, counter)
                .pack_to_slice_unchecked(&mut request);
            request[6..8].copy_from_slice(&coe_header(CoeService::SdoRequest));

            let mut command = toggle;

            if last {
                command |= 0x01;
            }

            if chunk < 7 {
                command |= ((7 - chunk) as u8) << 1;
            }

            request[8] = command;
            request[9..9 + chunk].copy_from_slice(&data[sent..sent + chunk]);

            self.mailbox_send(
                slave,
                &request[..MBX_HEADER_LEN + usize::from(body_len)],
                self.timeouts.mailbox_echo,
            )?;

            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            if payload.len() < 3 || parse_service(payload[1]) != CoeService::SdoResponse as u8 {
                return Err(invalid());
            }

            if payload[2] == SDO_ABORT {
                return Err(self.sdo_abort(slave, index, sub_index, payload.get(6..10).unwrap_or(&[])));
            }

            // Download segment response has scs = 1
            if payload[2] & 0xe0 != 0x20 {
                return Err(invalid());
            }

            sent += chunk;
            toggle ^= SDO_TOGGLE;
        }

        Ok(())
    }

    fn check_download_response(
        &self,
        slave: u16,
        index: u16,
        sub_index: u8,
        payload: &[u8],
        expected_command: u8,
    ) -> Result<(), Error> {
        let invalid = || {
            Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: index,
                sub_index,
            })
        };

        if payload.len() < 6 || parse_service(payload[1]) != CoeService::SdoResponse as u8 {
            return Err(invalid());
        }

        if payload[2] == SDO_ABORT {
            return Err(self.sdo_abort(slave, index, sub_index, payload.get(6..10).unwrap_or(&[])));
        }

        let r_index = u16::from_le_bytes([payload[3], payload[4]]);

        if payload[2] & 0xe0 != expected_command & 0xe0 || r_index != index {
            return Err(invalid());
        }

        Ok(())
    }

    fn sdo_read_u8(&self, slave: u16, index: u16, sub_index: u8) -> Result<u8, Error> {
        let mut buf = [0u8; 4];

        self.sdo_read(
            slave,
            index,
            sub_index,
            false,
            &mut buf,
            self.timeouts.mailbox_response,
        )?;

        Ok(buf[0])
    }

    fn sdo_read_u16(&self, slave: u16, index: u16, sub_index: u8) -> Result<u16, Error> {
        let mut buf = [0u8; 4];

        self.sdo_read(
            slave,
            index,
            sub_index,
            false,
            &mut buf,
            self.timeouts.mailbox_response,
        )?;

        Ok(u16::from_le_bytes([buf[0], buf[1]]))
    }

    fn sdo_read_u32(&self, slave: u16, index: u16, sub_index: u8) -> Result<u32, Error> {
        let mut buf = [0u8; 4];

        self.sdo_read(
            slave,
            index,
            sub_index,
            false,
            &mut buf,
            self.timeouts.mailbox_response,
        )?;

        Ok(u32::from_le_bytes(buf))
    }

    /// Transfer output process data to a slave through an RxPDO mailbox
    /// transfer, outside the cyclic exchange.
    pub fn rx_pdo(&self, slave: u16, pdo_number: u16, data: &[u8]) -> Result<(), Error> {
        self.require_coe(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MAX_MBX];

        MailboxHeader::new(MailboxType::Coe, (2 + data.len()) as u16, counter)
            .pack_to_slice_unchecked(&mut request);

        let coe = ((CoeService::RxPdo as u16) << 12) | (pdo_number & 0x01ff);

        request[6..8].copy_from_slice(&coe.to_le_bytes());
        request[8..8 + data.len()].copy_from_slice(data);

        self.mailbox_send(
            slave,
            &request[..MBX_HEADER_LEN + 2 + data.len()],
            self.timeouts.mailbox_echo,
        )?;

        Ok(())
    }

    /// Request and receive input process data from a slave through a TxPDO
    /// remote request.
    pub fn tx_pdo(
        &self,
        slave: u16,
        pdo_number: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + 2];

        MailboxHeader::new(MailboxType::Coe, 2, counter).pack_to_slice_unchecked(&mut request);

        let coe = ((CoeService::TxPdo as u16 + 2) << 12) | (pdo_number & 0x01ff);

        request[6..8].copy_from_slice(&coe.to_le_bytes());

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;

        let data_len = payload_len.saturating_sub(2);

        if out.len() < data_len {
            return Err(Error::Mailbox(MailboxError::TooLong {
                address: pdo_number,
                sub_index: 0,
            }));
        }

        out[..data_len]
            .copy_from_slice(&response[MBX_HEADER_LEN + 2..MBX_HEADER_LEN + 2 + data_len]);

        Ok(data_len)
    }

    /// Discover the PDO mapping of a slave through CoE object dictionary
    /// reads, one subindex at a time.
    ///
    /// Also records the resulting byte size into the slave's SM records.
    pub(crate) fn read_pdo_map(&mut self, slave: u16) -> Result<PdoMapSizes, Error> {
        let sm_count = self.sdo_read_u8(slave, SM_COMM_TYPE, 0x00)?;

        let mut sizes = PdoMapSizes::default();
        let mut sm_lengths = [0u32; MAX_SM];
        let mut sm_types = [0u8; MAX_SM];

        let sm_count = usize::from(sm_count).min(MAX_SM);

        for sm in 2..sm_count {
            let mut sm_type = self.sdo_read_u8(slave, SM_COMM_TYPE, (sm + 1) as u8)?;

            // Some slaves report SM2 as unused even though it carries outputs
            if sm == 2 && sm_type == 0 {
                sm_type = 3;
            }

            sm_types[sm] = sm_type;

            if sm_type != 3 && sm_type != 4 {
                continue;
            }

            let assign_index = PDO_ASSIGN_BASE + sm as u16;
            let pdo_count = self.sdo_read_u8(slave, assign_index, 0x00)?;

            let mut bits = 0u32;

            for pdo_position in 1..=pdo_count {
                let pdo_index = self.sdo_read_u16(slave, assign_index, pdo_position)?;

                if pdo_index == 0 {
                    continue;
                }

                let entry_count = self.sdo_read_u8(slave, pdo_index, 0x00)?;

                for entry in 1..=entry_count {
                    let mapping = self.sdo_read_u32(slave, pdo_index, entry)?;

                    bits += u32::from(mapping as u8);
                }
            }

            sm_lengths[sm] = bits;

            if sm_type == 3 {
                sizes.output_bits += bits;
            } else {
                sizes.input_bits += bits;
            }
        }

        self.apply_pdo_map(slave, &sm_lengths, &sm_types)?;

        Ok(sizes)
    }

    /// PDO map discovery using SDO complete access, reading each assignment
    /// and mapping object in one transfer.
    pub(crate) fn read_pdo_map_ca(&mut self, slave: u16) -> Result<PdoMapSizes, Error> {
        let mut buf = [0u8; 512];

        // 0x1C00 complete: count word followed by one type byte per SM
        let len = self.sdo_read(
            slave,
            SM_COMM_TYPE,
            0x00,
            true,
            &mut buf,
            self.timeouts.mailbox_response,
        )?;

        if len < 2 {
            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: SM_COMM_TYPE,
                sub_index: 0,
            }));
        }

        let sm_count = usize::from(u16::from_le_bytes([buf[0], buf[1]])).min(MAX_SM);

        let mut sm_types = [0u8; MAX_SM];

        for sm in 0..sm_count {
            if 2 + sm < len {
                sm_types[sm] = buf[2 + sm];
            }
        }

        if sm_count > 2 && sm_types[2] == 0 {
            sm_types[2] = 3;
        }

        let mut sizes = PdoMapSizes::default();
        let mut sm_lengths = [0u32; MAX_SM];

        for sm in 2..sm_count {
            let sm_type = sm_types[sm];

            if sm_type != 3 && sm_type != 4 {
                continue;
            }

            let assign_index = PDO_ASSIGN_BASE + sm as u16;

            let mut assign = [0u8; 512];

            let assign_len = self.sdo_read(
                slave,
                assign_index,
                0x00,
                true,
                &mut assign,
                self.timeouts.mailbox_response,
            )?;

            let pdo_count = usize::from(u16::from_le_bytes([assign[0], assign[1]]));

            let mut bits = 0u32;

            for position in 0..pdo_count {
                let at = 2 + position * 2;

                if at + 2 > assign_len {
                    break;
                }

                let pdo_index = u16::from_le_bytes([assign[at], assign[at + 1]]);

                if pdo_index == 0 {
                    continue;
                }

                let mut mapping = [0u8; 512];

                let mapping_len = self.sdo_read(
                    slave,
                    pdo_index,
                    0x00,
                    true,
                    &mut mapping,
                    self.timeouts.mailbox_response,
                )?;

                let entry_count = usize::from(u16::from_le_bytes([mapping[0], mapping[1]]));

                for entry in 0..entry_count {
                    let at = 2 + entry * 4;

                    if at + 4 > mapping_len {
                        break;
                    }

                    bits += u32::from(mapping[at]);
                }
            }

            sm_lengths[sm] = bits;

            if sm_type == 3 {
                sizes.output_bits += bits;
            } else {
                sizes.input_bits += bits;
            }
        }

        self.apply_pdo_map(slave, &sm_lengths, &sm_types)?;

        Ok(sizes)
    }

    fn apply_pdo_map(
        &mut self,
        slave: u16,
        sm_lengths: &[u32; MAX_SM],
        sm_types: &[u8; MAX_SM],
    ) -> Result<(), Error> {
        let rec = self.slave_mut(slave)?;

        for sm in 2..MAX_SM {
            if sm_types[sm] == 3 || sm_types[sm] == 4 {
                rec.sm[sm].length_bytes = crate::bytes_for_bits(sm_lengths[sm] as u16);
                rec.sm_type[sm] = SmType::from(sm_types[sm]);
            }
        }

        Ok(())
    }

    /// Read the list of object indices present in the slave's dictionary.
    pub fn read_od_list(&self, slave: u16, timeout: Duration) -> Result<ObjectDescriptionList, Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + 8];

        MailboxHeader::new(MailboxType::Coe, 8, counter).pack_to_slice_unchecked(&mut request);
        request[6..8].copy_from_slice(&coe_header(CoeService::SdoInformation));
        // Opcode 1: object description list request
        request[8] = 0x01;
        // List type 1: all objects
        request[12..14].copy_from_slice(&0x0001u16.to_le_bytes());

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut list = ObjectDescriptionList {
            slave,
            indices: heapless::Vec::new(),
        };

        let mut first = true;

        loop {
            let mut response = [0u8; MAX_MBX];

            let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
            let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

            if payload.len() < 6 || parse_service(payload[1]) != CoeService::SdoInformation as u8 {
                return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                    address: 0,
                    sub_index: 0,
                }));
            }

            let op_code = payload[2] & 0x7f;

            if op_code == 0x07 {
                // Info error response
                let code = payload
                    .get(6..10)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);

                self.push_error(ErrorItem {
                    slave,
                    index: 0,
                    sub_index: 0,
                    kind: ErrorKind::SdoInfo,
                    code,
                });

                return Err(Error::Mailbox(MailboxError::Aborted {
                    code: CoeAbortCode::from(code),
                    address: 0,
                    sub_index: 0,
                }));
            }

            if op_code != 0x02 {
                return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                    address: 0,
                    sub_index: 0,
                }));
            }

            let fragments_left = u16::from_le_bytes([payload[4], payload[5]]);

            // The first fragment carries the list type word before the indices
            let data_start = if first { 8 } else { 6 };

            first = false;

            for chunk in payload[data_start..].chunks_exact(2) {
                if list.indices.push(u16::from_le_bytes([chunk[0], chunk[1]])).is_err() {
                    return Err(Error::Capacity(crate::error::Item::Pdo));
                }
            }

            if fragments_left == 0 {
                break;
            }
        }

        Ok(list)
    }

    /// Read the description of one object.
    pub fn read_od_description(
        &self,
        slave: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<ObjectDescription, Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + 8];

        MailboxHeader::new(MailboxType::Coe, 8, counter).pack_to_slice_unchecked(&mut request);
        request[6..8].copy_from_slice(&coe_header(CoeService::SdoInformation));
        // Opcode 3: object description request
        request[8] = 0x03;
        request[12..14].copy_from_slice(&index.to_le_bytes());

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

        if payload.len() < 12
            || parse_service(payload[1]) != CoeService::SdoInformation as u8
            || payload[2] & 0x7f != 0x04
        {
            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: index,
                sub_index: 0,
            }));
        }

        Ok(ObjectDescription {
            index: u16::from_le_bytes([payload[6], payload[7]]),
            data_type: u16::from_le_bytes([payload[8], payload[9]]),
            max_sub_index: payload[10],
            object_code: payload[11],
        })
    }

    /// Read the description of one object entry (subindex).
    pub fn read_oe(
        &self,
        slave: u16,
        index: u16,
        sub_index: u8,
        timeout: Duration,
    ) -> Result<ObjectEntryInfo, Error> {
        self.require_coe(slave)?;
        self.mailbox_flush(slave)?;

        let counter = self.slave(slave)?.next_mailbox_counter();

        let mut request = [0u8; MBX_HEADER_LEN + 10];

        MailboxHeader::new(MailboxType::Coe, 10, counter).pack_to_slice_unchecked(&mut request);
        request[6..8].copy_from_slice(&coe_header(CoeService::SdoInformation));
        // Opcode 5: entry description request
        request[8] = 0x05;
        request[12..14].copy_from_slice(&index.to_le_bytes());
        request[14] = sub_index;
        // Value info: everything
        request[15] = 0x7f;

        self.mailbox_send(slave, &request, self.timeouts.mailbox_echo)?;

        let mut response = [0u8; MAX_MBX];

        let payload_len = self.mailbox_receive(slave, &mut response, timeout)?;
        let payload = &response[MBX_HEADER_LEN..MBX_HEADER_LEN + payload_len];

        if payload.len() < 16
            || parse_service(payload[1]) != CoeService::SdoInformation as u8
            || payload[2] & 0x7f != 0x06
        {
            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: index,
                sub_index,
            }));
        }

        let mut info = ObjectEntryInfo {
            value_info: payload[9],
            data_type: u16::from_le_bytes([payload[10], payload[11]]),
            bit_length: u16::from_le_bytes([payload[12], payload[13]]),
            access: u16::from_le_bytes([payload[14], payload[15]]),
            name: heapless::String::new(),
        };

        for byte in payload.get(16..).unwrap_or(&[]) {
            if byte.is_ascii() && !byte.is_ascii_control() {
                let _ = info.name.push(*byte as char);
            }
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_codes_decode() {
        assert_eq!(CoeAbortCode::from(0x0602_0000), CoeAbortCode::NotFound);
        assert_eq!(CoeAbortCode::from(0x0601_0002), CoeAbortCode::ReadOnly);
        assert_eq!(
            CoeAbortCode::from(0xdead_beef),
            CoeAbortCode::Unknown(0xdead_beef)
        );
    }

    #[test]
    fn coe_header_packs_service_nibble() {
        assert_eq!(coe_header(CoeService::SdoRequest), [0x00, 0x20]);
        assert_eq!(coe_header(CoeService::SdoResponse), [0x00, 0x30]);

        assert_eq!(parse_service(0x30), CoeService::SdoResponse as u8);
    }
}
