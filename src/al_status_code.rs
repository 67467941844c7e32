//! AL status codes, reported by slaves in register `0x0134` when a state
//! transition fails or an error flag is raised.

use num_enum::{FromPrimitive, IntoPrimitive};

/// AL status code.
///
/// Defined in ETG1000.6 Table 11.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u16)]
pub enum AlStatusCode {
    /// No error.
    NoError = 0x0000,
    /// Unspecified error.
    UnspecifiedError = 0x0001,
    /// No memory.
    NoMemory = 0x0002,
    /// Invalid requested state change.
    InvalidRequestedStateChange = 0x0011,
    /// Unknown requested state.
    UnknownRequestedState = 0x0012,
    /// Bootstrap not supported.
    BootstrapNotSupported = 0x0013,
    /// No valid firmware.
    NoValidFirmware = 0x0014,
    /// Invalid mailbox configuration (BOOT state).
    InvalidBootMailboxConfiguration = 0x0015,
    /// Invalid mailbox configuration (PRE-OP state).
    InvalidMailboxConfiguration = 0x0016,
    /// Invalid sync manager configuration.
    InvalidSyncManagerConfiguration = 0x0017,
    /// No valid inputs available.
    NoValidInputsAvailable = 0x0018,
    /// No valid outputs.
    NoValidOutputs = 0x0019,
    /// Synchronization error.
    SynchronizationError = 0x001A,
    /// Sync manager watchdog.
    SyncManagerWatchdog = 0x001B,
    /// Invalid sync manager types.
    InvalidSyncManagerTypes = 0x001C,
    /// Invalid output configuration.
    InvalidOutputConfiguration = 0x001D,
    /// Invalid input configuration.
    InvalidInputConfiguration = 0x001E,
    /// Invalid watchdog configuration.
    InvalidWatchdogConfiguration = 0x001F,
    /// Slave needs cold start.
    SlaveNeedsColdStart = 0x0020,
    /// Slave needs INIT.
    SlaveNeedsInit = 0x0021,
    /// Slave needs PRE-OP.
    SlaveNeedsPreop = 0x0022,
    /// Slave needs SAFE-OP.
    SlaveNeedsSafeop = 0x0023,
    /// Invalid input mapping.
    InvalidInputMapping = 0x0024,
    /// Invalid output mapping.
    InvalidOutputMapping = 0x0025,
    /// Inconsistent settings.
    InconsistentSettings = 0x0026,
    /// Freerun not supported.
    FreerunNotSupported = 0x0027,
    /// Synchronization not supported.
    SynchronizationNotSupported = 0x0028,
    /// Freerun needs 3 buffer mode.
    FreerunNeedsThreeBufferMode = 0x0029,
    /// Background watchdog.
    BackgroundWatchdog = 0x002A,
    /// No valid inputs and outputs.
    NoValidInputsAndOutputs = 0x002B,
    /// Fatal sync error.
    FatalSyncError = 0x002C,
    /// No sync error.
    NoSyncError = 0x002D,
    /// Invalid DC SYNC configuration.
    InvalidDcSyncConfiguration = 0x0030,
    /// Invalid DC latch configuration.
    InvalidDcLatchConfiguration = 0x0031,
    /// PLL error.
    PllError = 0x0032,
    /// DC sync IO error.
    DcSyncIoError = 0x0033,
    /// DC sync timeout error.
    DcSyncTimeoutError = 0x0034,
    /// DC invalid sync cycle time.
    DcInvalidSyncCycleTime = 0x0035,
    /// DC SYNC0 cycle time error.
    DcSync0CycleTime = 0x0036,
    /// DC SYNC1 cycle time error.
    DcSync1CycleTime = 0x0037,
    /// Mailbox error: AoE.
    MbxAoe = 0x0041,
    /// Mailbox error: EoE.
    MbxEoe = 0x0042,
    /// Mailbox error: CoE.
    MbxCoe = 0x0043,
    /// Mailbox error: FoE.
    MbxFoe = 0x0044,
    /// Mailbox error: SoE.
    MbxSoe = 0x0045,
    /// Mailbox error: VoE.
    MbxVoe = 0x004F,
    /// EEPROM no access.
    EepromNoAccess = 0x0050,
    /// EEPROM error.
    EepromError = 0x0051,
    /// Slave restarted locally.
    SlaveRestartedLocally = 0x0060,
    /// Device identification value updated.
    DeviceIdentificationValueUpdated = 0x0061,
    /// Application controller available.
    ApplicationControllerAvailable = 0x00F0,
    /// An unknown code was read back.
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl Default for AlStatusCode {
    fn default() -> Self {
        Self::NoError
    }
}

impl core::fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::NoError => "No error",
            Self::UnspecifiedError => "Unspecified error",
            Self::NoMemory => "No memory",
            Self::InvalidRequestedStateChange => "Invalid requested state change",
            Self::UnknownRequestedState => "Unknown requested state",
            Self::BootstrapNotSupported => "Bootstrap not supported",
            Self::NoValidFirmware => "No valid firmware",
            Self::InvalidBootMailboxConfiguration => "Invalid mailbox configuration (BOOT)",
            Self::InvalidMailboxConfiguration => "Invalid mailbox configuration (PRE-OP)",
            Self::InvalidSyncManagerConfiguration => "Invalid sync manager configuration",
            Self::NoValidInputsAvailable => "No valid inputs available",
            Self::NoValidOutputs => "No valid outputs",
            Self::SynchronizationError => "Synchronization error",
            Self::SyncManagerWatchdog => "Sync manager watchdog",
            Self::InvalidSyncManagerTypes => "Invalid sync manager types",
            Self::InvalidOutputConfiguration => "Invalid output configuration",
            Self::InvalidInputConfiguration => "Invalid input configuration",
            Self::InvalidWatchdogConfiguration => "Invalid watchdog configuration",
            Self::SlaveNeedsColdStart => "Slave needs cold start",
            Self::SlaveNeedsInit => "Slave needs INIT",
            Self::SlaveNeedsPreop => "Slave needs PRE-OP",
            Self::SlaveNeedsSafeop => "Slave needs SAFE-OP",
            Self::InvalidInputMapping => "Invalid input mapping",
            Self::InvalidOutputMapping => "Invalid output mapping",
            Self::InconsistentSettings => "Inconsistent settings",
            Self::FreerunNotSupported => "Freerun not supported",
            Self::SynchronizationNotSupported => "Synchronization not supported",
            Self::FreerunNeedsThreeBufferMode => "Freerun needs 3 buffer mode",
            Self::BackgroundWatchdog => "Background watchdog",
            Self::NoValidInputsAndOutputs => "No valid inputs and outputs",
            Self::FatalSyncError => "Fatal sync error",
            Self::NoSyncError => "No sync error",
            Self::InvalidDcSyncConfiguration => "Invalid DC SYNC configuration",
            Self::InvalidDcLatchConfiguration => "Invalid DC latch configuration",
            Self::PllError => "PLL error",
            Self::DcSyncIoError => "DC sync IO error",
            Self::DcSyncTimeoutError => "DC sync timeout error",
            Self::DcInvalidSyncCycleTime => "DC invalid sync cycle time",
            Self::DcSync0CycleTime => "DC SYNC0 cycle time error",
            Self::DcSync1CycleTime => "DC SYNC1 cycle time error",
            Self::MbxAoe => "Mailbox error: AoE",
            Self::MbxEoe => "Mailbox error: EoE",
            Self::MbxCoe => "Mailbox error: CoE",
            Self::MbxFoe => "Mailbox error: FoE",
            Self::MbxSoe => "Mailbox error: SoE",
            Self::MbxVoe => "Mailbox error: VoE",
            Self::EepromNoAccess => "EEPROM no access",
            Self::EepromError => "EEPROM error",
            Self::SlaveRestartedLocally => "Slave restarted locally",
            Self::DeviceIdentificationValueUpdated => "Device identification value updated",
            Self::ApplicationControllerAvailable => "Application controller available",
            Self::Unknown(code) => return write!(f, "Unknown code {:#06x}", code),
        };

        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw() {
        assert_eq!(AlStatusCode::from(0x0011), AlStatusCode::InvalidRequestedStateChange);
        assert_eq!(AlStatusCode::from(0x9999), AlStatusCode::Unknown(0x9999));
    }
}
