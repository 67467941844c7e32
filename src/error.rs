//! Error types.

pub use crate::coe::CoeAbortCode;
use crate::{command::Command, slave_state::SlaveState, wire::WireError, AlStatusCode};

/// Top level error type.
///
/// Operations never panic and never abort the process; every failure mode of
/// the master maps onto one of these variants. Failures a caller may want to
/// inspect retrospectively (SDO aborts, emergencies, protocol errors) are
/// additionally pushed onto the bounded error ring held by the
/// [`Master`](crate::Master).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Error {
    /// A low level error occurred when producing or consuming a datagram.
    Pdu(PduError),
    /// A working counter (WKC) shortfall was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// No matching frame arrived before the timeout elapsed.
    NoFrame,
    /// An EEPROM (SII) error was encountered.
    Eeprom(EepromError),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// A File over EtherCAT transfer failed.
    Foe(FoeError),
    /// A Servo over EtherCAT operation failed.
    Soe(SoeError),
    /// A distributed clock error occurred.
    DistributedClock(DistributedClockError),
    /// An error occurred encoding or decoding an item.
    Wire(WireError),
    /// A fixed size list was not large enough to hold a given item type.
    Capacity(Item),
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,
        /// An index into a list of items.
        index: Option<usize>,
    },
    /// More slaves were discovered than the compiled-in maximum.
    SlaveCountExceeded,
    /// A slave is in an unexpected state.
    InvalidState {
        /// The desired state.
        expected: SlaveState,
        /// The actual state.
        actual: SlaveState,
        /// Slave configured station address.
        configured_address: u16,
    },
    /// One or more slaves failed to transition to the requested state.
    StateTransition,
    /// A slave stopped responding and is marked lost.
    SlaveLost(u16),
    /// A slave reported an AL status code.
    Slave(AlStatusCode),
    /// There is a problem with the discovered EtherCAT topology.
    Topology,
    /// Failed to send a frame over the network interface.
    SendFrame,
    /// Failed to receive a frame properly.
    ReceiveFrame,
    /// A frame was only partially sent.
    PartialSend {
        /// Frame length in bytes.
        len: usize,
        /// The number of bytes sent.
        sent: usize,
    },
    /// The provided IO map is too small for the mapped process image.
    IoMapTooSmall {
        /// Bytes required by the group's process image.
        required: usize,
        /// Bytes provided by the caller.
        provided: usize,
    },
    /// A value could not be converted into a target integer type.
    IntegerTypeConversion,
    /// An internal error. This indicates a bug in the master itself.
    Internal,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::NoFrame => f.write_str("no frame received"),
            Error::Eeprom(e) => write!(f, "eeprom: {}", e),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Foe(e) => write!(f, "foe: {}", e),
            Error::Soe(e) => write!(f, "soe: {}", e),
            Error::DistributedClock(e) => write!(f, "distributed clock: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::SlaveCountExceeded => f.write_str("too many slaves on network"),
            Error::InvalidState {
                expected,
                actual,
                configured_address,
            } => write!(
                f,
                "slave {:#06x} state is invalid: {}, expected {}",
                configured_address, actual, expected
            ),
            Error::StateTransition => f.write_str("a slave failed to transition to a new state"),
            Error::SlaveLost(slave) => write!(f, "slave {} is lost", slave),
            Error::Slave(code) => write!(f, "slave error: {}", code),
            Error::Topology => f.write_str("topology"),
            Error::SendFrame => f.write_str("failed to send EtherCAT frame"),
            Error::ReceiveFrame => f.write_str("failed to receive an EtherCAT frame"),
            Error::PartialSend { len, sent } => {
                write!(f, "frame of {} bytes only had {} bytes sent", len, sent)
            }
            Error::IoMapTooSmall { required, provided } => write!(
                f,
                "IO map of {} bytes is too small for process image of {} bytes",
                provided, required
            ),
            Error::IntegerTypeConversion => f.write_str("failed to convert between integer types"),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item being looked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Item {
    /// An EtherCAT slave device.
    Slave,
    /// A slave group.
    Group,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// Sync manager.
    SyncManager,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// A logical address segment.
    IoSegment,
    /// A datagram index.
    Index,
    /// An SII string.
    String,
}

/// Low-level PDU (datagram) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// PDU data is too long to fit in the frame.
    TooLong,
    /// A frame index was given that does not point to an in-flight frame.
    InvalidIndex(u8),
    /// A received PDU failed validation against the sent one.
    Validation(PduValidationError),
    /// All 256 datagram indices are in flight.
    IndexExhausted,
    /// Something went wrong encoding/decoding the raw Ethernet II frame.
    Ethernet,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::TooLong => f.write_str("data is too long to fit in frame"),
            PduError::InvalidIndex(index) => write!(f, "invalid PDU index {}", index),
            PduError::Validation(e) => write!(f, "received PDU validation failed: {}", e),
            PduError::IndexExhausted => f.write_str("no free datagram index"),
            PduError::Ethernet => f.write_str("network"),
        }
    }
}

/// A received PDU does not match the request it was issued for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduValidationError {
    /// The index of the received PDU does not match that of the sent one.
    IndexMismatch {
        /// Sent index.
        sent: u8,
        /// Received index.
        received: u8,
    },
    /// The received command does not match the one sent.
    CommandMismatch {
        /// Sent command.
        sent: Command,
        /// Received command.
        received: Command,
    },
}

impl core::fmt::Display for PduValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IndexMismatch { sent, received } => {
                write!(f, "PDU index mismatch: sent {}, received {}", sent, received)
            }
            Self::CommandMismatch { sent, received } => {
                write!(
                    f,
                    "PDU command mismatch: sent {}, received {}",
                    sent, received
                )
            }
        }
    }
}

/// Mailbox error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MailboxError {
    /// A slave has no mailbox but one is required for the given action.
    NoMailbox,
    /// The mailbox operation was aborted.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given buffer.
    TooLong {
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The response to a mailbox action is invalid.
    SdoResponseInvalid {
        /// The object index used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The received counter value repeats the previous message.
    InvalidCount,
    /// The slave sent an emergency message.
    Emergency {
        /// Error code.
        error_code: u16,
        /// Error register.
        error_register: u8,
    },
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::Aborted {
                code,
                address,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", address, sub_index, code),
            MailboxError::TooLong { address, sub_index } => {
                write!(f, "{:#06x}:{} returned data is too long", address, sub_index)
            }
            MailboxError::SdoResponseInvalid { address, sub_index } => write!(
                f,
                "{:#06x}:{} invalid response from device",
                address, sub_index
            ),
            MailboxError::InvalidCount => f.write_str("repeated mailbox count value"),
            MailboxError::Emergency {
                error_code,
                error_register,
            } => write!(
                f,
                "emergency: code {:#06x}, register {:#04x}",
                error_code, error_register
            ),
        }
    }
}

/// EEPROM (SII) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum EepromError {
    /// The EEPROM interface stayed busy past the allowed retries.
    Busy,
    /// The EEPROM interface reported a command or acknowledge error.
    Command,
    /// Failed to decode data read from the EEPROM.
    Decode,
    /// The given category does not exist in the slave's EEPROM.
    NoCategory,
    /// A category is too large to fit in the SII cache.
    SectionOverrun,
}

impl core::fmt::Display for EepromError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EepromError::Busy => f.write_str("EEPROM busy past timeout"),
            EepromError::Command => f.write_str("EEPROM command error"),
            EepromError::Decode => f.write_str("failed to decode EEPROM data"),
            EepromError::NoCategory => f.write_str("category not found"),
            EepromError::SectionOverrun => f.write_str("section too large to fit in cache"),
        }
    }
}

/// File over EtherCAT error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FoeError {
    /// The slave reported error 0x8001: file not found.
    FileNotFound,
    /// The receive buffer is too small for the incoming file.
    BufferTooSmall,
    /// A data or ack packet number did not follow the expected sequence.
    PacketNumber {
        /// Packet number the window expected.
        expected: u32,
        /// Packet number actually received.
        received: u32,
    },
    /// The slave reported an FoE error code.
    Error(u32),
    /// An unexpected mailbox or opcode arrived mid-transfer.
    UnexpectedPacket,
}

impl core::fmt::Display for FoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FoeError::FileNotFound => f.write_str("file not found"),
            FoeError::BufferTooSmall => f.write_str("buffer too small for file"),
            FoeError::PacketNumber { expected, received } => write!(
                f,
                "packet number mismatch: expected {}, received {}",
                expected, received
            ),
            FoeError::Error(code) => write!(f, "error code {:#06x}", code),
            FoeError::UnexpectedPacket => f.write_str("unexpected packet"),
        }
    }
}

/// Servo over EtherCAT error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SoeError {
    /// The slave returned an SoE error code for the requested IDN.
    Error {
        /// IDN the request addressed.
        idn: u16,
        /// SoE error code.
        code: u16,
    },
    /// The response opcode or drive number did not match the request.
    InvalidResponse,
    /// A fragmented response overflowed the provided buffer.
    BufferTooSmall,
}

impl core::fmt::Display for SoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SoeError::Error { idn, code } => {
                write!(f, "IDN {:#06x} error code {:#06x}", idn, code)
            }
            SoeError::InvalidResponse => f.write_str("invalid response from drive"),
            SoeError::BufferTooSmall => f.write_str("buffer too small for IDN data"),
        }
    }
}

/// Distributed clock error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DistributedClockError {
    /// No DC capable slave was found to act as the reference clock.
    NoReference,
}

impl core::fmt::Display for DistributedClockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoReference => f.write_str("no DC reference slave found"),
        }
    }
}

/// The protocol a ring entry originated from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ErrorKind {
    /// SDO abort.
    Sdo,
    /// CoE emergency message.
    Emergency,
    /// SDO information service error.
    SdoInfo,
    /// File over EtherCAT.
    Foe,
    /// Ethernet over EtherCAT.
    Eoe,
    /// Servo over EtherCAT.
    Soe,
    /// Mailbox transport.
    Mailbox,
    /// Malformed or unexpected packet.
    Packet,
}

/// An entry in the bounded error ring.
///
/// The ring records failures a supervisor may want to read back after the
/// fact, identified by `(slave, index, sub_index)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ErrorItem {
    /// Slave number the error originated from.
    pub slave: u16,
    /// Object index, IDN or protocol specific identifier.
    pub index: u16,
    /// Subindex, or zero where not applicable.
    pub sub_index: u8,
    /// Which protocol produced this entry.
    pub kind: ErrorKind,
    /// Abort or error code, protocol specific.
    pub code: u32,
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<PduValidationError> for PduError {
    fn from(e: PduValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<EepromError> for Error {
    fn from(e: EepromError) -> Self {
        Self::Eeprom(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<FoeError> for Error {
    fn from(e: FoeError) -> Self {
        Self::Foe(e)
    }
}

impl From<SoeError> for Error {
    fn from(e: SoeError) -> Self {
        Self::Soe(e)
    }
}

impl From<DistributedClockError> for Error {
    fn from(e: DistributedClockError) -> Self {
        Self::DistributedClock(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(_e: core::num::TryFromIntError) -> Self {
        Self::IntegerTypeConversion
    }
}
