//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, etc.

use crate::{
    error::{Error, PduError},
    wire::{WireRead, WireWrite},
};

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0a;
const LWR: u8 = 0x0b;
const LRW: u8 = 0x0c;
const ARMW: u8 = 0x0d;
const FRMW: u8 = 0x0e;

/// Read-only commands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Reads {
    /// APRD: auto increment physical read.
    Aprd {
        /// Auto increment counter.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// FPRD: configured address physical read.
    Fprd {
        /// Configured station address.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// BRD: broadcast read.
    Brd {
        /// Autoincremented by each slave visited.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// LRD: logical read.
    Lrd {
        /// Logical address.
        address: u32,
    },
    /// FRMW: configured address read, multiple write.
    ///
    /// Reads from one slave and writes the value into all others in the same
    /// frame pass; used for distributed clock distribution.
    Frmw {
        /// Configured station address.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// ARMW: auto increment read, multiple write.
    Armw {
        /// Auto increment counter.
        address: u16,
        /// Register address.
        register: u16,
    },
}

/// Write or read-write commands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Writes {
    /// BWR: broadcast write.
    Bwr {
        /// Autoincremented by each slave visited.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// APWR: auto increment physical write.
    Apwr {
        /// Auto increment counter.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// FPWR: configured address physical write.
    Fpwr {
        /// Configured station address.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// APRW: auto increment physical read-write.
    Aprw {
        /// Auto increment counter.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// FPRW: configured address physical read-write.
    Fprw {
        /// Configured station address.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// BRW: broadcast read-write.
    Brw {
        /// Autoincremented by each slave visited.
        address: u16,
        /// Register address.
        register: u16,
    },
    /// LWR: logical write.
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// LRW: logical read-write.
    Lrw {
        /// Logical address.
        address: u32,
    },
}

/// Datagram command.
///
/// A command addresses slaves by position (`AP*`), configured station address
/// (`FP*`), broadcast (`B*`) or logical memory (`L*`). The working counter
/// semantics follow from the command kind: reads and writes count `+1` per
/// servicing slave, read-writes count `+2`.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Command {
    /// No operation.
    #[default]
    Nop,
    /// Read commands.
    Read(Reads),
    /// Write and read-write commands.
    Write(Writes),
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),

            Command::Read(read) => match read {
                Reads::Aprd { address, register } => {
                    write!(f, "APRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Fprd { address, register } => {
                    write!(f, "FPRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Brd { address, register } => {
                    write!(f, "BRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
                Reads::Frmw { address, register } => {
                    write!(f, "FRMW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Armw { address, register } => {
                    write!(f, "ARMW(addr {:#06x}, reg {:#06x})", address, register)
                }
            },

            Command::Write(write) => match write {
                Writes::Bwr { address, register } => {
                    write!(f, "BWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Apwr { address, register } => {
                    write!(f, "APWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fpwr { address, register } => {
                    write!(f, "FPWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Aprw { address, register } => {
                    write!(f, "APRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fprw { address, register } => {
                    write!(f, "FPRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Brw { address, register } => {
                    write!(f, "BRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
                Writes::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
            },
        }
    }
}

impl Command {
    /// Create a broadcast read (BRD) command to the given register address.
    ///
    /// The address field is always zero when transmitted from the master.
    pub fn brd(register: u16) -> Self {
        Self::Read(Reads::Brd {
            address: 0,
            register,
        })
    }

    /// Create a broadcast write (BWR) command to the given register address.
    pub fn bwr(register: u16) -> Self {
        Self::Write(Writes::Bwr {
            address: 0,
            register,
        })
    }

    /// Create a broadcast read-write (BRW) command.
    pub fn brw(register: u16) -> Self {
        Self::Write(Writes::Brw {
            address: 0,
            register,
        })
    }

    /// FPRD.
    pub fn fprd(address: u16, register: u16) -> Self {
        Self::Read(Reads::Fprd { address, register })
    }

    /// FPWR.
    pub fn fpwr(address: u16, register: u16) -> Self {
        Self::Write(Writes::Fpwr { address, register })
    }

    /// FPRW.
    pub fn fprw(address: u16, register: u16) -> Self {
        Self::Write(Writes::Fprw { address, register })
    }

    /// APRD addressed by position in the chain, counted from zero.
    pub fn aprd(position: u16, register: u16) -> Self {
        Self::Read(Reads::Aprd {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// APWR addressed by position in the chain, counted from zero.
    pub fn apwr(position: u16, register: u16) -> Self {
        Self::Write(Writes::Apwr {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// APRW addressed by position in the chain, counted from zero.
    pub fn aprw(position: u16, register: u16) -> Self {
        Self::Write(Writes::Aprw {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// Configured address read, multiple write (FRMW).
    pub fn frmw(address: u16, register: u16) -> Self {
        Self::Read(Reads::Frmw { address, register })
    }

    /// Auto increment read, multiple write (ARMW).
    pub fn armw(position: u16, register: u16) -> Self {
        Self::Read(Reads::Armw {
            address: 0u16.wrapping_sub(position),
            register,
        })
    }

    /// Logical read (LRD).
    pub fn lrd(address: u32) -> Self {
        Self::Read(Reads::Lrd { address })
    }

    /// Logical write (LWR).
    pub fn lwr(address: u32) -> Self {
        Self::Write(Writes::Lwr { address })
    }

    /// Logical read-write (LRW), the cyclic process data workhorse.
    pub fn lrw(address: u32) -> Self {
        Self::Write(Writes::Lrw { address })
    }

    /// Get just the command code for a command.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,

            Self::Read(read) => match read {
                Reads::Aprd { .. } => APRD,
                Reads::Fprd { .. } => FPRD,
                Reads::Brd { .. } => BRD,
                Reads::Lrd { .. } => LRD,
                Reads::Frmw { .. } => FRMW,
                Reads::Armw { .. } => ARMW,
            },

            Self::Write(write) => match write {
                Writes::Bwr { .. } => BWR,
                Writes::Apwr { .. } => APWR,
                Writes::Fpwr { .. } => FPWR,
                Writes::Aprw { .. } => APRW,
                Writes::Fprw { .. } => FPRW,
                Writes::Brw { .. } => BRW,
                Writes::Lwr { .. } => LWR,
                Writes::Lrw { .. } => LRW,
            },
        }
    }

    /// The raw 4 byte ADP+ADO (or 32 bit logical) address field.
    pub(crate) fn address_bytes(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        match *self {
            Command::Nop => (),

            Command::Read(Reads::Aprd { address, register })
            | Command::Read(Reads::Fprd { address, register })
            | Command::Read(Reads::Brd { address, register })
            | Command::Read(Reads::Frmw { address, register })
            | Command::Read(Reads::Armw { address, register })
            | Command::Write(Writes::Bwr { address, register })
            | Command::Write(Writes::Apwr { address, register })
            | Command::Write(Writes::Fpwr { address, register })
            | Command::Write(Writes::Aprw { address, register })
            | Command::Write(Writes::Fprw { address, register })
            | Command::Write(Writes::Brw { address, register }) => {
                address.pack_to_slice_unchecked(&mut buf[0..2]);
                register.pack_to_slice_unchecked(&mut buf[2..4]);
            }

            Command::Read(Reads::Lrd { address })
            | Command::Write(Writes::Lwr { address })
            | Command::Write(Writes::Lrw { address }) => {
                address.pack_to_slice_unchecked(&mut buf[0..4]);
            }
        }

        buf
    }

    /// Reconstruct a command from its code and raw address bytes.
    pub(crate) fn parse(code: u8, raw: [u8; 4]) -> Result<Command, Error> {
        let words = |raw: [u8; 4]| -> (u16, u16) {
            (
                u16::unpack_from_slice(&raw[0..2]).unwrap_or(0),
                u16::unpack_from_slice(&raw[2..4]).unwrap_or(0),
            )
        };

        match code {
            NOP => Ok(Command::Nop),

            APRD => {
                let (address, register) = words(raw);
                Ok(Command::Read(Reads::Aprd { address, register }))
            }
            FPRD => {
                let (address, register) = words(raw);
                Ok(Command::Read(Reads::Fprd { address, register }))
            }
            BRD => {
                let (address, register) = words(raw);
                Ok(Command::Read(Reads::Brd { address, register }))
            }
            FRMW => {
                let (address, register) = words(raw);
                Ok(Command::Read(Reads::Frmw { address, register }))
            }
            ARMW => {
                let (address, register) = words(raw);
                Ok(Command::Read(Reads::Armw { address, register }))
            }
            LRD => Ok(Command::Read(Reads::Lrd {
                address: u32::from_le_bytes(raw),
            })),

            BWR => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Bwr { address, register }))
            }
            APWR => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Apwr { address, register }))
            }
            FPWR => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Fpwr { address, register }))
            }
            APRW => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Aprw { address, register }))
            }
            FPRW => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Fprw { address, register }))
            }
            BRW => {
                let (address, register) = words(raw);
                Ok(Command::Write(Writes::Brw { address, register }))
            }
            LWR => Ok(Command::Write(Writes::Lwr {
                address: u32::from_le_bytes(raw),
            })),
            LRW => Ok(Command::Write(Writes::Lrw {
                address: u32::from_le_bytes(raw),
            })),

            other => {
                log::error!("Invalid command code {:#04x}", other);

                Err(Error::Pdu(PduError::Decode))
            }
        }
    }
}

impl From<Reads> for Command {
    fn from(value: Reads) -> Self {
        Self::Read(value)
    }
}

impl From<Writes> for Command {
    fn from(value: Writes) -> Self {
        Self::Write(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_specification() {
        assert_eq!(Command::Nop.code(), 0);
        assert_eq!(Command::aprd(0, 0).code(), 1);
        assert_eq!(Command::apwr(0, 0).code(), 2);
        assert_eq!(Command::aprw(0, 0).code(), 3);
        assert_eq!(Command::fprd(0, 0).code(), 4);
        assert_eq!(Command::fpwr(0, 0).code(), 5);
        assert_eq!(Command::fprw(0, 0).code(), 6);
        assert_eq!(Command::brd(0).code(), 7);
        assert_eq!(Command::bwr(0).code(), 8);
        assert_eq!(Command::brw(0).code(), 9);
        assert_eq!(Command::lrd(0).code(), 10);
        assert_eq!(Command::lwr(0).code(), 11);
        assert_eq!(Command::lrw(0).code(), 12);
        assert_eq!(Command::armw(0, 0).code(), 13);
        assert_eq!(Command::frmw(0, 0).code(), 14);
    }

    #[test]
    fn position_addressing_negates() {
        // Third slave in the chain sits at position 2, so the wire ADP starts
        // at -2 and reaches zero when the datagram arrives.
        let cmd = Command::aprd(2, 0x0010);

        assert_eq!(
            cmd,
            Command::Read(Reads::Aprd {
                address: 0xfffe,
                register: 0x0010
            })
        );

        assert_eq!(cmd.address_bytes(), [0xfe, 0xff, 0x10, 0x00]);
    }

    #[test]
    fn parse_round_trips() {
        for cmd in [
            Command::brd(0x0130),
            Command::fpwr(0x1001, 0x0120),
            Command::lrw(0x0001_0000),
            Command::frmw(0x1001, 0x0910),
        ] {
            assert_eq!(Command::parse(cmd.code(), cmd.address_bytes()), Ok(cmd));
        }
    }

}
