//! Slave enumeration and initial configuration.

mod mapping;

use crate::{
    error::Error,
    fmmu::FmmuFunction,
    link::Link,
    master::Master,
    register::RegisterAddress,
    sii::{self, SII_READ64},
    slave::{MailboxProtocols, Slave},
    slave_state::{AlControl, SlaveState},
    sync_manager::{
        SmType, SyncManagerChannel, DEFAULT_DO_SM0_FLAGS, DEFAULT_MBX_SM0_FLAGS,
        DEFAULT_MBX_SM1_FLAGS,
    },
    wire::WireWrite,
    MAX_SLAVES, MAX_SM, NODE_OFFSET,
};
use core::fmt::Write as _;

/// Default mailbox geometry used when the EEPROM is silent.
const FALLBACK_MBX_WRITE: u16 = 0x1000;
const FALLBACK_MBX_READ: u16 = 0x1080;
const FALLBACK_MBX_LEN: u16 = 0x0080;

impl<L: Link> Master<L> {
    /// Enumerate the segment and bring every slave to PRE-OP with its
    /// identity, mailbox and SII derived configuration loaded.
    ///
    /// With `use_table` set, slaves found in the configured
    /// [`config_table`](crate::MasterConfig::config_table) are set up from
    /// the table instead of their EEPROM.
    ///
    /// Returns the number of slaves found. An empty segment returns 0 without
    /// error.
    pub fn config_init(&mut self, use_table: bool) -> Result<usize, Error> {
        log::debug!("config_init, use_table: {}", use_table);

        self.init_context();

        let count = self.detect_slaves()?;

        if count == 0 {
            log::warn!("No slaves detected; check wiring and interface");

            return Ok(0);
        }

        log::debug!("{} slaves detected", count);

        self.set_slaves_to_default()?;

        // Slave 0 is the master pseudo-slave
        for index in 0..=count {
            let mut rec = Slave::default();

            rec.index = index as u16;

            self.slaves.push(rec).map_err(|_| Error::SlaveCountExceeded)?;
        }

        // The enumeration runs in interleaved passes so that each slave's
        // slow EEPROM reads overlap the bus traffic of the others.

        // Pass 1: addresses, interface type, EEPROM capabilities
        for slave in 1..=count as u16 {
            let position = slave - 1;

            let (interface_type, _) = self.aprd::<u16>(
                position,
                RegisterAddress::PdiControl.into(),
                self.timeouts.pdu3(),
            )?;

            // A node offset keeps configured addresses readable in captures;
            // wrap around is harmless
            self.apwr(
                position,
                RegisterAddress::ConfiguredStationAddress.into(),
                slave + NODE_OFFSET,
                self.timeouts.pdu3(),
            )?;

            // The first slave drops non-EtherCAT traffic; the rest forward
            let dl_control: u8 = if slave == 1 { 1 } else { 0 };

            self.apwr(
                position,
                RegisterAddress::DlControl.into(),
                dl_control,
                self.timeouts.pdu3(),
            )?;

            let (configured_address, _) = self.aprd::<u16>(
                position,
                RegisterAddress::ConfiguredStationAddress.into(),
                self.timeouts.pdu3(),
            )?;

            let (alias, _) = self.fprd::<u16>(
                configured_address,
                RegisterAddress::ConfiguredStationAlias.into(),
                self.timeouts.pdu3(),
            )?;

            let (eeprom_status, _) = self.fprd::<u16>(
                configured_address,
                RegisterAddress::SiiControl.into(),
                self.timeouts.pdu3(),
            )?;

            let rec = self.slave_mut(slave)?;

            rec.interface_type = interface_type;
            rec.set_configured_address(configured_address);
            rec.alias_address = alias;
            rec.eeprom_8byte = eeprom_status & SII_READ64 != 0;

            sii::eeprom_request(
                &self.port,
                &self.timeouts,
                configured_address,
                sii::word::VENDOR_ID,
            )?;
        }

        // Passes 2-4: identity words, pipelined
        self.collect_eeprom_pass(count, sii::word::PRODUCT_CODE, |rec, value| {
            rec.vendor_id = value;
        })?;
        self.collect_eeprom_pass(count, sii::word::REVISION, |rec, value| {
            rec.product_code = value;
        })?;
        self.collect_eeprom_pass(count, sii::word::SERIAL, |rec, value| {
            rec.revision = value;
        })?;
        self.collect_eeprom_pass(count, sii::word::STD_RX_MAILBOX, |rec, value| {
            rec.serial = value;
        })?;

        // Pass 5: write mailbox geometry, then read mailbox geometry
        for slave in 1..=count as u16 {
            let configured_address = self.slave(slave)?.configured_address();

            let value = sii::eeprom_collect(
                &self.port,
                &self.timeouts,
                configured_address,
                self.timeouts.eeprom,
            )?;

            let rec = self.slave_mut(slave)?;

            rec.mailbox_write_offset = value as u16;
            rec.mailbox_write_len = (value >> 16) as u16;

            if rec.mailbox_write_len > 0 {
                sii::eeprom_request(
                    &self.port,
                    &self.timeouts,
                    configured_address,
                    sii::word::STD_TX_MAILBOX,
                )?;
            }
        }

        for slave in 1..=count as u16 {
            let configured_address = self.slave(slave)?.configured_address();
            let has_mailbox = self.slave(slave)?.mailbox_write_len > 0;

            if has_mailbox {
                let value = sii::eeprom_collect(
                    &self.port,
                    &self.timeouts,
                    configured_address,
                    self.timeouts.eeprom,
                )?;

                let write_len = self.slave(slave)?.mailbox_write_len;
                let rec = self.slave_mut(slave)?;

                rec.mailbox_read_offset = value as u16;
                rec.mailbox_read_len = (value >> 16) as u16;

                if rec.mailbox_read_len == 0 {
                    rec.mailbox_read_len = write_len;
                }

                sii::eeprom_request(
                    &self.port,
                    &self.timeouts,
                    configured_address,
                    sii::word::MAILBOX_PROTOCOL,
                )?;
            }

            self.configure_slave_topology(slave)?;

            // Let the slave settle in INIT before poking its mailbox setup
            let _ = self.state_check(slave, SlaveState::Init, self.timeouts.state_transition)?;

            self.configure_slave_mailbox(slave)?;

            let from_table = if use_table {
                self.config_from_table(slave)
            } else {
                0
            };

            if from_table == 0 && !self.copy_sii_from_twin(slave) {
                self.parse_slave_sii(slave)?;
            }

            self.program_mailbox_sms(slave)?;

            // Some slaves need EEPROM access from the PDI side for the
            // INIT to PRE-OP transition
            self.eeprom_to_pdi(slave)?;

            if !self.config.manual_state_change {
                let configured_address = self.slave(slave)?.configured_address();

                self.fpwr(
                    configured_address,
                    RegisterAddress::AlControl.into(),
                    AlControl::acknowledging(SlaveState::PreOp),
                    self.timeouts.pdu3(),
                )?;
            }
        }

        Ok(count)
    }

    fn init_context(&mut self) {
        self.slaves.clear();
        self.sii.reset();
        self.po2so_hooks.truncate(0);

        for (index, group) in self.groups.iter_mut().enumerate() {
            group.reset_mapping();
            group.logical_start_address = (index as u32) << crate::LOG_GROUP_OFFSET;
        }

        self.dc_reference.store(0, std::sync::atomic::Ordering::Relaxed);
    }

    /// Count slaves with a broadcast read, after forcing everything back to
    /// INIT.
    fn detect_slaves(&mut self) -> Result<usize, Error> {
        // Pre-init writes: clear aliases and reset to INIT twice; some older
        // devices miss the first request while their port is settling
        let _ = self.bwr::<u8>(RegisterAddress::DlAlias.into(), 0, self.timeouts.pdu3());

        let reset = AlControl::reset();

        let _ = self.bwr(RegisterAddress::AlControl.into(), reset, self.timeouts.pdu3());
        let _ = self.bwr(RegisterAddress::AlControl.into(), reset, self.timeouts.pdu3());

        let (_, wkc) = self.brd::<u16>(RegisterAddress::Type.into(), self.timeouts.safe)?;

        // Strictly less than: index 0 belongs to the master pseudo-slave
        if usize::from(wkc) >= MAX_SLAVES {
            log::error!("Too many slaves: {} >= {}", wkc, MAX_SLAVES);

            return Err(Error::SlaveCountExceeded);
        }

        Ok(usize::from(wkc))
    }

    /// The broadcast "set to default" sequence issued before enumeration.
    fn set_slaves_to_default(&mut self) -> Result<(), Error> {
        let t = self.timeouts.pdu3();

        // Deactivate manual loop control
        let _ = self.bwr::<u8>(RegisterAddress::DlPort.into(), 0, t);
        // IRQ mask
        let _ = self.bwr::<u16>(RegisterAddress::IrqMask.into(), 0x0004, t);
        // Reset CRC counters
        let _ = self.bwr::<[u8; 8]>(RegisterAddress::RxErrorCounter.into(), [0; 8], t);
        // Reset FMMUs
        let _ = self.bwr::<[u8; 48]>(RegisterAddress::Fmmu0.into(), [0; 48], t);
        // Reset sync managers
        let _ = self.bwr::<[u8; 32]>(RegisterAddress::Sm0.into(), [0; 32], t);
        // Reset DC activation and system time
        let _ = self.bwr::<u8>(RegisterAddress::DcSyncActive.into(), 0, t);
        let _ = self.bwr::<[u8; 4]>(RegisterAddress::DcSystemTime.into(), [0; 4], t);
        // DC speed start and filter defaults
        let _ = self.bwr::<u16>(RegisterAddress::DcSpeedCounterStart.into(), 0x1000, t);
        let _ = self.bwr::<u16>(RegisterAddress::DcTimeFilter.into(), 0x0c00, t);
        // Ignore alias registers
        let _ = self.bwr::<u8>(RegisterAddress::DlAlias.into(), 0, t);
        // Reset to INIT with acknowledge once more
        let _ = self.bwr(RegisterAddress::AlControl.into(), AlControl::reset(), t);
        // Pry the EEPROM away from the PDI, then hand it to the master
        let _ = self.bwr::<u8>(RegisterAddress::SiiConfig.into(), 2, t);
        let _ = self.bwr::<u8>(RegisterAddress::SiiConfig.into(), 0, t);

        Ok(())
    }

    /// One interleaved EEPROM pass: collect the previously requested word for
    /// every slave and immediately request the next one.
    fn collect_eeprom_pass(
        &mut self,
        count: usize,
        next_word: u16,
        apply: impl Fn(&mut Slave, u32),
    ) -> Result<(), Error> {
        for slave in 1..=count as u16 {
            let configured_address = self.slave(slave)?.configured_address();

            let value = sii::eeprom_collect(
                &self.port,
                &self.timeouts,
                configured_address,
                self.timeouts.eeprom,
            )?;

            apply(self.slave_mut(slave)?, value);

            sii::eeprom_request(&self.port, &self.timeouts, configured_address, next_word)?;
        }

        Ok(())
    }

    /// Derive DC support, port topology and the parent from the DL status
    /// and support registers.
    fn configure_slave_topology(&mut self, slave: u16) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();

        let (support, _) = self.fprd::<u16>(
            configured_address,
            RegisterAddress::SupportFlags.into(),
            self.timeouts.pdu3(),
        )?;

        let (dl_status, _) = self.fprd::<u16>(
            configured_address,
            RegisterAddress::DlStatus.into(),
            self.timeouts.pdu3(),
        )?;

        let (descriptors, _) = self.fprd::<u8>(
            configured_address,
            RegisterAddress::PortDescriptors.into(),
            self.timeouts.pdu3(),
        )?;

        // A port counts as connected when it is open with communication
        // established
        let mut open_ports = 0u8;
        let mut active = 0u8;

        for (port, (mask, want)) in [
            (0x0300u16, 0x0200u16),
            (0x0c00, 0x0800),
            (0x3000, 0x2000),
            (0xc000, 0x8000),
        ]
        .iter()
        .enumerate()
        .map(|(i, m)| (i as u8, *m))
        {
            if dl_status & mask == want {
                open_ports += 1;
                active |= 1 << port;
            }
        }

        let parent = find_parent(&self.slaves, usize::from(slave));

        let rec = self.slave_mut(slave)?;

        rec.has_dc = support & 0x0004 != 0;
        rec.open_ports = open_ports;
        rec.active_ports = active;
        rec.port_descriptors = descriptors;
        rec.parent = parent;

        log::debug!(
            "Slave {}: {} open ports, parent {}, dc: {}",
            slave,
            open_ports,
            parent,
            rec.has_dc
        );

        Ok(())
    }

    /// Apply the default mailbox sync manager setup for mailbox slaves and
    /// collect the supported protocol word.
    fn configure_slave_mailbox(&mut self, slave: u16) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();
        let has_mailbox = self.slave(slave)?.mailbox_write_len > 0;

        if !has_mailbox {
            return Ok(());
        }

        {
            let rec = self.slave_mut(slave)?;

            rec.sm_type[0] = SmType::MailboxOut;
            rec.sm_type[1] = SmType::MailboxIn;
            rec.sm_type[2] = SmType::Outputs;
            rec.sm_type[3] = SmType::Inputs;

            rec.sm[0] = SyncManagerChannel::from_flags(
                rec.mailbox_write_offset,
                rec.mailbox_write_len,
                DEFAULT_MBX_SM0_FLAGS,
            );
            rec.sm[1] = SyncManagerChannel::from_flags(
                rec.mailbox_read_offset,
                rec.mailbox_read_len,
                DEFAULT_MBX_SM1_FLAGS,
            );
        }

        let protocols = sii::eeprom_collect(
            &self.port,
            &self.timeouts,
            configured_address,
            self.timeouts.eeprom,
        )?;

        self.slave_mut(slave)?.mailbox_protocols =
            MailboxProtocols::from_bits_truncate(protocols as u16);

        Ok(())
    }

    /// Set up a slave from the compiled-in configuration table. Returns the
    /// 1-based table index, or 0 when the slave is not listed.
    fn config_from_table(&mut self, slave: u16) -> usize {
        let Ok(rec) = self.slave(slave) else { return 0 };

        let (vendor_id, product_code) = (rec.vendor_id, rec.product_code);

        let Some((table_index, entry)) = self
            .config
            .config_table
            .iter()
            .enumerate()
            .find(|(_, entry)| {
                entry.vendor_id == vendor_id && entry.product_code == product_code
            })
        else {
            return 0;
        };

        let entry = *entry;

        let Ok(rec) = self.slave_mut(slave) else {
            return 0;
        };

        rec.config_index = table_index + 1;
        rec.name.clear();
        let _ = rec.name.push_str(&entry.name[..entry.name.len().min(crate::MAX_NAME_LEN)]);
        rec.output_bits = entry.output_bits;
        rec.input_bits = entry.input_bits;

        if entry.output_bits > 0 {
            rec.fmmu_function[0] = FmmuFunction::Outputs;
        }

        if entry.input_bits > 0 {
            rec.fmmu_function[1] = FmmuFunction::Inputs;
        }

        rec.sm[2] =
            SyncManagerChannel::from_flags(entry.sm2_address, 0, entry.sm2_flags);

        if entry.output_bits > 0 && entry.sm2_address == 0 {
            // Simple digital output slave without a mailbox
            rec.sm[0] = SyncManagerChannel::from_flags(
                0x0f00,
                crate::bytes_for_bits(entry.output_bits),
                DEFAULT_DO_SM0_FLAGS,
            );
            rec.sm_type[0] = SmType::Outputs;
        } else {
            rec.sm[2].length_bytes = crate::bytes_for_bits(entry.output_bits);
            rec.sm_type[2] = SmType::Outputs;
        }

        rec.sm[3] =
            SyncManagerChannel::from_flags(entry.sm3_address, 0, entry.sm3_flags);

        if entry.input_bits > 0 && entry.sm3_address == 0 {
            rec.sm[1] = SyncManagerChannel::from_flags(
                0x1000,
                crate::bytes_for_bits(entry.input_bits),
                0,
            );
            rec.sm_type[1] = SmType::Inputs;
        } else {
            rec.sm[3].length_bytes = crate::bytes_for_bits(entry.input_bits);
            rec.sm_type[3] = SmType::Inputs;
        }

        rec.config_index
    }

    /// SII of identical devices is identical: copy the parsed fields from a
    /// lower-numbered slave with the same identity instead of re-reading the
    /// EEPROM.
    fn copy_sii_from_twin(&mut self, slave: u16) -> bool {
        if slave <= 1 {
            return false;
        }

        let Ok(rec) = self.slave(slave) else {
            return false;
        };

        let identity = (rec.vendor_id, rec.product_code, rec.revision);

        let twin = (1..slave).find(|&candidate| {
            self.slave(candidate)
                .map(|c| (c.vendor_id, c.product_code, c.revision) == identity)
                .unwrap_or(false)
        });

        let Some(twin) = twin else { return false };

        let (details, block_lrw, ebus, name, sm, fmmu_function) = {
            let t = &self.slaves[usize::from(twin)];

            (
                (t.coe_details, t.foe_details, t.eoe_details, t.soe_details),
                t.block_lrw,
                t.ebus_current,
                t.name.clone(),
                t.sm,
                t.fmmu_function,
            )
        };

        let rec = &mut self.slaves[usize::from(slave)];

        rec.coe_details = details.0;
        rec.foe_details = details.1;
        rec.eoe_details = details.2;
        rec.soe_details = details.3;
        rec.block_lrw = block_lrw;
        rec.ebus_current = ebus;
        rec.name = name;
        rec.fmmu_function = fmmu_function;

        // Identical devices have identical SM shapes, mailbox channels
        // included
        for index in 0..MAX_SM {
            rec.sm[index].physical_start_address = sm[index].physical_start_address;
            rec.sm[index].length_bytes = sm[index].length_bytes;
            rec.sm[index].control = sm[index].control;
            rec.sm[index].status = sm[index].status;
            rec.sm[index].enable = sm[index].enable;
        }

        log::debug!("Copied SII of slave {} from twin {}", slave, twin);

        true
    }

    /// Parse the general, strings, SM and FMMU categories out of the slave's
    /// EEPROM.
    fn parse_slave_sii(&mut self, slave: u16) -> Result<(), Error> {
        let general = self.sii_general(slave)?;

        if let Some(general) = general {
            let rec = self.slave_mut(slave)?;

            rec.coe_details = general.coe_details;
            rec.foe_details = general.foe_details;
            rec.eoe_details = general.eoe_details;
            rec.soe_details = general.soe_details;
            rec.block_lrw = general.block_lrw;
            rec.ebus_current = general.ebus_current;
        }

        let name_index = general.map(|g| g.name_string_index).unwrap_or(1).max(1);

        match self.sii_string(slave, name_index) {
            Ok(name) => self.slave_mut(slave)?.name = name,
            Err(_) => {
                let (vendor_id, product_code) = {
                    let rec = self.slave(slave)?;

                    (rec.vendor_id, rec.product_code)
                };

                let rec = self.slave_mut(slave)?;

                rec.name.clear();
                let _ = write!(rec.name, "? M:{:08x} I:{:08x}", vendor_id, product_code);
            }
        }

        let managers = self.sii_sm(slave)?;

        {
            let rec = self.slave_mut(slave)?;

            for (index, manager) in managers.iter().enumerate() {
                rec.sm[index] = SyncManagerChannel::from_flags(
                    manager.physical_start,
                    manager.length,
                    manager.flags(),
                );
            }
        }

        let usages = self.sii_fmmu(slave)?;

        {
            let rec = self.slave_mut(slave)?;

            for (index, usage) in usages.iter().enumerate() {
                if *usage != 0xff {
                    rec.fmmu_function[index] = FmmuFunction::from_sii(*usage);
                }
            }
        }

        Ok(())
    }

    /// Program SM0 and SM1 for mailbox slaves, falling back to the standard
    /// geometry when the EEPROM carried none.
    fn program_mailbox_sms(&mut self, slave: u16) -> Result<(), Error> {
        let has_mailbox = self.slave(slave)?.mailbox_write_len > 0;

        if !has_mailbox {
            return Ok(());
        }

        {
            let rec = self.slave_mut(slave)?;

            if rec.sm[0].physical_start_address == 0 {
                log::warn!("Slave {} has no write mailbox configuration, using default", slave);

                rec.sm[0] = SyncManagerChannel::from_flags(
                    FALLBACK_MBX_WRITE,
                    FALLBACK_MBX_LEN,
                    DEFAULT_MBX_SM0_FLAGS,
                );
                rec.sm_type[0] = SmType::MailboxOut;
                rec.mailbox_write_offset = FALLBACK_MBX_WRITE;
                rec.mailbox_write_len = FALLBACK_MBX_LEN;
            }

            if rec.sm[1].physical_start_address == 0 {
                log::warn!("Slave {} has no read mailbox configuration, using default", slave);

                rec.sm[1] = SyncManagerChannel::from_flags(
                    FALLBACK_MBX_READ,
                    FALLBACK_MBX_LEN,
                    DEFAULT_MBX_SM1_FLAGS,
                );
                rec.sm_type[1] = SmType::MailboxIn;
                rec.mailbox_read_offset = FALLBACK_MBX_READ;
                rec.mailbox_read_len = FALLBACK_MBX_LEN;
            }
        }

        // One write covers both channels; programming them separately upsets
        // some older ESCs
        let (configured_address, sm0, sm1) = {
            let rec = self.slave(slave)?;

            (rec.configured_address(), rec.sm[0], rec.sm[1])
        };

        let mut image = [0u8; 16];

        sm0.pack_to_slice_unchecked(&mut image[0..8]);
        sm1.pack_to_slice_unchecked(&mut image[8..16]);

        self.port.fpwr(
            configured_address,
            RegisterAddress::Sm0.into(),
            &mut image,
            self.timeouts.pdu3(),
        )?;

        Ok(())
    }
}

/// Walk backwards from the previous slave, balancing branch entries and
/// exits, to find the slave this one hangs off.
///
/// Endpoints close a branch (−1), forks open one (+1), crosses open two
/// (+2); the first non-endpoint slave seen with the balance restored is the
/// parent. Index 0 (the master) is the parent of the first slave.
fn find_parent(slaves: &[Slave], slave: usize) -> u16 {
    if slave <= 1 {
        return 0;
    }

    let mut balance: i32 = 0;

    for candidate in (1..slave).rev() {
        let open_ports = i32::from(slaves[candidate].open_ports);

        match open_ports {
            1 => balance -= 1,
            3 => balance += 1,
            4 => balance += 2,
            _ => (),
        }

        if (balance >= 0 && open_ports > 1) || candidate == 1 {
            return candidate as u16;
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave_with_ports(index: u16, open_ports: u8) -> Slave {
        let mut rec = Slave::default();

        rec.index = index;
        rec.open_ports = open_ports;

        rec
    }

    #[test]
    fn linear_chain_parents() {
        // master - s1 - s2 - s3
        let slaves = vec![
            slave_with_ports(0, 0),
            slave_with_ports(1, 2),
            slave_with_ports(2, 2),
            slave_with_ports(3, 1),
        ];

        assert_eq!(find_parent(&slaves, 1), 0);
        assert_eq!(find_parent(&slaves, 2), 1);
        assert_eq!(find_parent(&slaves, 3), 2);
    }

    #[test]
    fn fork_rejoins_at_junction() {
        // s1 is a coupler (fork); s2 and s3 terminate a branch each, so s4's
        // parent is the fork, not its linear predecessor.
        let slaves = vec![
            slave_with_ports(0, 0),
            slave_with_ports(1, 3),
            slave_with_ports(2, 1),
            slave_with_ports(3, 1),
            slave_with_ports(4, 2),
        ];

        assert_eq!(find_parent(&slaves, 2), 1);
        assert_eq!(find_parent(&slaves, 3), 1);
        // Both branch ends drop the balance below zero; only the fork
        // restores it
        assert_eq!(find_parent(&slaves, 4), 1);
    }
}
