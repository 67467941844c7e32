//! Slave Information Interface (SII): EEPROM access through the ESC EEPROM
//! interface registers, a per-context byte cache and the category parsers.

use crate::{
    error::{EepromError, Error},
    link::Link,
    master::Master,
    port::Port,
    register::RegisterAddress,
    Timeouts, MAX_EEP_BUF, MAX_FMMU, MAX_NAME_LEN, MAX_SM,
};
use core::time::Duration;

/// EEPROM interface control register bits (`0x0502`).
const SII_BUSY: u16 = 0x8000;
const SII_ERROR_MASK: u16 = 0x7800;
const SII_NACK: u16 = 0x2000;
/// The interface reads 8 bytes per operation instead of 4.
pub(crate) const SII_READ64: u16 = 0x0040;

const CMD_NOP: u16 = 0x0000;
const CMD_READ: u16 = 0x0100;
const CMD_WRITE: u16 = 0x0201;

const DEFAULT_RETRIES: usize = 5;

/// Well-known SII word addresses. Defined in ETG1000.6 Table 16.
#[allow(dead_code)]
pub(crate) mod word {
    pub const VENDOR_ID: u16 = 0x0008;
    pub const PRODUCT_CODE: u16 = 0x000a;
    pub const REVISION: u16 = 0x000c;
    pub const SERIAL: u16 = 0x000e;
    pub const BOOT_RX_MAILBOX: u16 = 0x0014;
    pub const BOOT_TX_MAILBOX: u16 = 0x0016;
    pub const STD_RX_MAILBOX: u16 = 0x0018;
    pub const STD_TX_MAILBOX: u16 = 0x001a;
    pub const MAILBOX_PROTOCOL: u16 = 0x001c;
    /// First category header.
    pub const FIRST_CATEGORY: u16 = 0x0040;
}

/// SII category types. Defined in ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u16)]
pub enum SiiCategory {
    /// Indexed device strings.
    Strings = 10,
    /// Data type definitions.
    DataTypes = 20,
    /// General device information.
    General = 30,
    /// FMMU usage assignments.
    Fmmu = 40,
    /// Sync manager definitions.
    SyncManager = 41,
    /// TxPDO definitions (slave transmits: master inputs).
    TxPdo = 50,
    /// RxPDO definitions (slave receives: master outputs).
    RxPdo = 51,
}

/// Byte offsets into the general category data. Defined in ETG1000.6 Table
/// 21.
mod general {
    pub const NAME_STRING_INDEX: usize = 0x03;
    pub const COE_DETAILS: usize = 0x05;
    pub const FOE_DETAILS: usize = 0x06;
    pub const EOE_DETAILS: usize = 0x07;
    pub const SOE_CHANNELS: usize = 0x08;
    pub const FLAGS: usize = 0x0b;
    pub const EBUS_CURRENT: usize = 0x0c;
}

/// Bit in the general category flags byte: the slave cannot service LRW.
const GENERAL_FLAG_NOT_LRW: u8 = 0x02;

/// One sync manager definition from the SII SM category (8 bytes each).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SiiSyncManager {
    pub physical_start: u16,
    pub length: u16,
    pub control: u8,
    pub activate: u8,
}

impl SiiSyncManager {
    /// The packed configuration word programmed into the SM register.
    pub fn flags(&self) -> u32 {
        u32::from(self.control) | u32::from(self.activate) << 16
    }
}

/// Fields parsed from the SII general category.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct SiiGeneral {
    pub name_string_index: u8,
    pub coe_details: u8,
    pub foe_details: u8,
    pub eoe_details: u8,
    pub soe_details: u8,
    pub block_lrw: bool,
    pub ebus_current: i16,
}

/// Per sync manager bit totals from a PDO category walk.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct SiiPdoSummary {
    pub total_bits: u32,
    pub sm_bits: [u16; MAX_SM],
}

/// The per-context SII byte cache: one slave's EEPROM image at a time, with a
/// validity bitmap so only missing chunks are fetched.
pub(crate) struct SiiCache {
    slave: u16,
    data: Box<[u8]>,
    valid: Box<[u8]>,
}

impl SiiCache {
    pub fn new() -> Self {
        Self {
            slave: 0,
            data: vec![0u8; MAX_EEP_BUF].into_boxed_slice(),
            valid: vec![0u8; MAX_EEP_BUF / 8].into_boxed_slice(),
        }
    }

    pub fn reset(&mut self) {
        self.slave = 0;
        self.valid.fill(0);
    }

    fn retarget(&mut self, slave: u16) {
        if self.slave != slave {
            self.valid.fill(0);
            self.slave = slave;
        }
    }

    fn get(&self, address: usize) -> Option<u8> {
        if self.valid[address / 8] & (1 << (address % 8)) != 0 {
            Some(self.data[address])
        } else {
            None
        }
    }

    fn insert(&mut self, address: usize, byte: u8) {
        self.data[address] = byte;
        self.valid[address / 8] |= 1 << (address % 8);
    }
}

fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

/// Poll the EEPROM interface until the busy bit clears. Returns the final
/// status word.
pub(crate) fn eeprom_wait<L: Link>(
    port: &Port<L>,
    timeouts: &Timeouts,
    configured_address: u16,
    timeout: Duration,
) -> Result<u16, Error> {
    let deadline = std::time::Instant::now() + timeout;

    loop {
        let mut raw = [0u8; 2];

        let wkc = port.fprd(
            configured_address,
            RegisterAddress::SiiControl.into(),
            &mut raw,
            timeouts.pdu3(),
        )?;

        let status = u16::from_le_bytes(raw);

        if wkc > 0 && status & SII_BUSY == 0 {
            return Ok(status);
        }

        if std::time::Instant::now() >= deadline {
            return Err(Error::Eeprom(EepromError::Busy));
        }

        sleep(timeouts.wait_loop_delay);
    }
}

/// Issue a read command for `word` without waiting for the result.
pub(crate) fn eeprom_request<L: Link>(
    port: &Port<L>,
    timeouts: &Timeouts,
    configured_address: u16,
    word: u16,
) -> Result<(), Error> {
    let status = eeprom_wait(port, timeouts, configured_address, timeouts.eeprom)?;

    if status & SII_ERROR_MASK != 0 {
        let mut clear = CMD_NOP.to_le_bytes();

        port.fpwr(
            configured_address,
            RegisterAddress::SiiControl.into(),
            &mut clear,
            timeouts.pdu3(),
        )?;
    }

    let mut request = [0u8; 4];

    request[0..2].copy_from_slice(&CMD_READ.to_le_bytes());
    request[2..4].copy_from_slice(&word.to_le_bytes());

    port.fpwr(
        configured_address,
        RegisterAddress::SiiControl.into(),
        &mut request,
        timeouts.pdu3(),
    )?;

    Ok(())
}

/// Collect the 4 byte result of a previously issued read command.
pub(crate) fn eeprom_collect<L: Link>(
    port: &Port<L>,
    timeouts: &Timeouts,
    configured_address: u16,
    timeout: Duration,
) -> Result<u32, Error> {
    let status = eeprom_wait(port, timeouts, configured_address, timeout)?;

    if status & SII_NACK != 0 {
        return Err(Error::Eeprom(EepromError::Command));
    }

    let mut data = [0u8; 4];

    port.fprd(
        configured_address,
        RegisterAddress::SiiData.into(),
        &mut data,
        timeouts.pdu3(),
    )?;

    Ok(u32::from_le_bytes(data))
}

/// Blocking EEPROM read of 4 (or 8, when supported) bytes at `word`.
pub(crate) fn eeprom_read_raw<L: Link>(
    port: &Port<L>,
    timeouts: &Timeouts,
    configured_address: u16,
    read_8_bytes: bool,
    word: u16,
    timeout: Duration,
) -> Result<u64, Error> {
    let mut retries = DEFAULT_RETRIES;

    loop {
        eeprom_request(port, timeouts, configured_address, word)?;

        let status = eeprom_wait(port, timeouts, configured_address, timeout)?;

        if status & SII_NACK != 0 {
            retries -= 1;

            if retries == 0 {
                return Err(Error::Eeprom(EepromError::Command));
            }

            sleep(timeouts.wait_loop_delay);

            continue;
        }

        let mut data = [0u8; 8];
        let len = if read_8_bytes { 8 } else { 4 };

        port.fprd(
            configured_address,
            RegisterAddress::SiiData.into(),
            &mut data[..len],
            timeouts.pdu3(),
        )?;

        return Ok(u64::from_le_bytes(data));
    }
}

/// Blocking EEPROM write of one word.
pub(crate) fn eeprom_write_raw<L: Link>(
    port: &Port<L>,
    timeouts: &Timeouts,
    configured_address: u16,
    word: u16,
    value: u16,
    timeout: Duration,
) -> Result<(), Error> {
    let status = eeprom_wait(port, timeouts, configured_address, timeout)?;

    if status & SII_ERROR_MASK != 0 {
        let mut clear = CMD_NOP.to_le_bytes();

        port.fpwr(
            configured_address,
            RegisterAddress::SiiControl.into(),
            &mut clear,
            timeouts.pdu3(),
        )?;
    }

    let mut data = value.to_le_bytes();

    port.fpwr(
        configured_address,
        RegisterAddress::SiiData.into(),
        &mut data,
        timeouts.pdu3(),
    )?;

    let mut request = [0u8; 4];

    request[0..2].copy_from_slice(&CMD_WRITE.to_le_bytes());
    request[2..4].copy_from_slice(&word.to_le_bytes());

    port.fpwr(
        configured_address,
        RegisterAddress::SiiControl.into(),
        &mut request,
        timeouts.pdu3(),
    )?;

    let status = eeprom_wait(port, timeouts, configured_address, timeout)?;

    if status & (SII_ERROR_MASK | SII_NACK) != 0 {
        return Err(Error::Eeprom(EepromError::Command));
    }

    Ok(())
}

impl<L: Link> Master<L> {
    /// Read 4 bytes (8 when the slave supports it) from the slave's EEPROM at
    /// word address `word`, bypassing the SII cache.
    pub fn eeprom_read(&self, slave: u16, word: u16, timeout: Duration) -> Result<u64, Error> {
        let rec = self.slave(slave)?;

        eeprom_read_raw(
            &self.port,
            &self.timeouts,
            rec.configured_address(),
            rec.eeprom_8byte,
            word,
            timeout,
        )
    }

    /// Write one word to the slave's EEPROM.
    pub fn eeprom_write(
        &self,
        slave: u16,
        word: u16,
        value: u16,
        timeout: Duration,
    ) -> Result<(), Error> {
        let rec = self.slave(slave)?;

        eeprom_write_raw(
            &self.port,
            &self.timeouts,
            rec.configured_address(),
            word,
            value,
            timeout,
        )
    }

    /// Hand EEPROM interface ownership to the master.
    pub(crate) fn eeprom_to_master(&self, slave: u16) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();

        // Force release from PDI first, then claim
        let mut force = [0x02u8];
        self.port.fpwr(
            configured_address,
            RegisterAddress::SiiConfig.into(),
            &mut force,
            self.timeouts.pdu3(),
        )?;

        let mut claim = [0x00u8];
        self.port.fpwr(
            configured_address,
            RegisterAddress::SiiConfig.into(),
            &mut claim,
            self.timeouts.pdu3(),
        )?;

        Ok(())
    }

    /// Hand EEPROM interface ownership to the PDI.
    pub(crate) fn eeprom_to_pdi(&self, slave: u16) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();

        let mut claim = [0x01u8];
        self.port.fpwr(
            configured_address,
            RegisterAddress::SiiConfig.into(),
            &mut claim,
            self.timeouts.pdu3(),
        )?;

        Ok(())
    }

    /// Get one byte of the slave's SII image, from cache when valid.
    ///
    /// A cache miss fetches the smallest aligned chunk covering `address` and
    /// marks it valid.
    pub(crate) fn sii_get_byte(&mut self, slave: u16, address: usize) -> Result<u8, Error> {
        if address >= MAX_EEP_BUF {
            return Err(Error::Eeprom(EepromError::SectionOverrun));
        }

        let (configured_address, read_8_bytes) = {
            let rec = self.slave(slave)?;

            (rec.configured_address(), rec.eeprom_8byte)
        };

        self.sii.retarget(slave);

        if let Some(byte) = self.sii.get(address) {
            return Ok(byte);
        }

        let base = address & !0x01;

        let value = eeprom_read_raw(
            &self.port,
            &self.timeouts,
            configured_address,
            read_8_bytes,
            (base >> 1) as u16,
            self.timeouts.eeprom,
        )?;

        let count = if read_8_bytes { 8 } else { 4 };

        for (offset, byte) in value.to_le_bytes().iter().take(count).enumerate() {
            if base + offset < MAX_EEP_BUF {
                self.sii.insert(base + offset, *byte);
            }
        }

        self.sii.get(address).ok_or(Error::Internal)
    }

    fn sii_get_word(&mut self, slave: u16, address: usize) -> Result<u16, Error> {
        let lo = self.sii_get_byte(slave, address)?;
        let hi = self.sii_get_byte(slave, address + 1)?;

        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Scan the category headers for `category`.
    ///
    /// Returns the byte address of the category data, or `None` when the
    /// EEPROM does not carry the category.
    pub(crate) fn sii_find(
        &mut self,
        slave: u16,
        category: SiiCategory,
    ) -> Result<Option<(usize, usize)>, Error> {
        let mut address = usize::from(word::FIRST_CATEGORY) << 1;

        loop {
            let category_type = self.sii_get_word(slave, address)?;

            if category_type == 0xffff {
                return Ok(None);
            }

            let len_words = usize::from(self.sii_get_word(slave, address + 2)?);

            if category_type == category as u16 {
                return Ok(Some((address + 4, len_words * 2)));
            }

            address += 4 + len_words * 2;

            if address >= MAX_EEP_BUF {
                return Ok(None);
            }
        }
    }

    /// Read the indexed device string `index` (1 based) from the strings
    /// category.
    pub(crate) fn sii_string(
        &mut self,
        slave: u16,
        index: u8,
    ) -> Result<heapless::String<MAX_NAME_LEN>, Error> {
        let mut name = heapless::String::new();

        let Some((start, _len)) = self.sii_find(slave, SiiCategory::Strings)? else {
            return Err(Error::Eeprom(EepromError::NoCategory));
        };

        let count = self.sii_get_byte(slave, start)?;

        if index == 0 || index > count {
            return Err(Error::NotFound {
                item: crate::error::Item::String,
                index: Some(usize::from(index)),
            });
        }

        let mut address = start + 1;

        for _ in 1..index {
            let len = usize::from(self.sii_get_byte(slave, address)?);

            address += 1 + len;
        }

        let len = usize::from(self.sii_get_byte(slave, address)?);

        address += 1;

        for offset in 0..len.min(MAX_NAME_LEN) {
            let byte = self.sii_get_byte(slave, address + offset)?;

            // Strings are specified as ASCII; anything else becomes '?'
            let ch = if byte.is_ascii() && !byte.is_ascii_control() {
                byte as char
            } else {
                '?'
            };

            let _ = name.push(ch);
        }

        Ok(name)
    }

    /// Parse the general category.
    pub(crate) fn sii_general(&mut self, slave: u16) -> Result<Option<SiiGeneral>, Error> {
        let Some((start, _len)) = self.sii_find(slave, SiiCategory::General)? else {
            return Ok(None);
        };

        let ebus_lo = self.sii_get_byte(slave, start + general::EBUS_CURRENT)?;
        let ebus_hi = self.sii_get_byte(slave, start + general::EBUS_CURRENT + 1)?;

        Ok(Some(SiiGeneral {
            name_string_index: self.sii_get_byte(slave, start + general::NAME_STRING_INDEX)?,
            coe_details: self.sii_get_byte(slave, start + general::COE_DETAILS)?,
            foe_details: self.sii_get_byte(slave, start + general::FOE_DETAILS)?,
            eoe_details: self.sii_get_byte(slave, start + general::EOE_DETAILS)?,
            soe_details: self.sii_get_byte(slave, start + general::SOE_CHANNELS)?,
            block_lrw: self.sii_get_byte(slave, start + general::FLAGS)? & GENERAL_FLAG_NOT_LRW
                != 0,
            ebus_current: i16::from_le_bytes([ebus_lo, ebus_hi]),
        }))
    }

    /// Parse the sync manager category.
    pub(crate) fn sii_sm(
        &mut self,
        slave: u16,
    ) -> Result<heapless::Vec<SiiSyncManager, MAX_SM>, Error> {
        let mut managers = heapless::Vec::new();

        let Some((start, len)) = self.sii_find(slave, SiiCategory::SyncManager)? else {
            return Ok(managers);
        };

        let count = (len / 8).min(MAX_SM);

        for index in 0..count {
            let base = start + index * 8;

            // Byte 5 is the default status register value; it is not carried
            // into the programmed configuration word.
            let entry = SiiSyncManager {
                physical_start: self.sii_get_word(slave, base)?,
                length: self.sii_get_word(slave, base + 2)?,
                control: self.sii_get_byte(slave, base + 4)?,
                activate: self.sii_get_byte(slave, base + 6)?,
            };

            // Capacity is MAX_SM, count is clamped above
            let _ = managers.push(entry);
        }

        Ok(managers)
    }

    /// Parse the FMMU usage category: one function code per FMMU slot.
    pub(crate) fn sii_fmmu(&mut self, slave: u16) -> Result<[u8; MAX_FMMU], Error> {
        let mut usages = [0xffu8; MAX_FMMU];

        let Some((start, len)) = self.sii_find(slave, SiiCategory::Fmmu)? else {
            return Ok(usages);
        };

        for (index, usage) in usages.iter_mut().enumerate().take(len.min(MAX_FMMU)) {
            *usage = self.sii_get_byte(slave, start + index)?;
        }

        Ok(usages)
    }

    /// Walk a PDO category, summing mapped bit lengths per sync manager.
    ///
    /// `outputs` selects the RxPDO category (master outputs); otherwise TxPDO
    /// (master inputs) is walked.
    pub(crate) fn sii_pdo(&mut self, slave: u16, outputs: bool) -> Result<SiiPdoSummary, Error> {
        let mut summary = SiiPdoSummary::default();

        let category = if outputs {
            SiiCategory::RxPdo
        } else {
            SiiCategory::TxPdo
        };

        let Some((start, len)) = self.sii_find(slave, category)? else {
            return Ok(summary);
        };

        let end = start + len;
        let mut address = start;

        // PDO header: index u16, entry count u8, sync manager u8, sync unit
        // u8, name index u8, flags u16. Entries are 8 bytes with the bit
        // length at offset 5.
        while address + 8 <= end {
            let _pdo_index = self.sii_get_word(slave, address)?;
            let entries = usize::from(self.sii_get_byte(slave, address + 2)?);
            let sync_manager = usize::from(self.sii_get_byte(slave, address + 3)?);

            address += 8;

            let mut bits = 0u32;

            for _ in 0..entries {
                if address + 8 > end {
                    break;
                }

                bits += u32::from(self.sii_get_byte(slave, address + 5)?);

                address += 8;
            }

            if sync_manager < MAX_SM {
                summary.sm_bits[sync_manager] += bits as u16;
                summary.total_bits += bits;
            }
        }

        Ok(summary)
    }
}
