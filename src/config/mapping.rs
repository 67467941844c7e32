//! Process data mapping: PDO discovery, FMMU allocation and logical address
//! assignment.

use crate::{
    coe::{details, PdoMapSizes},
    error::Error,
    fmmu::Fmmu,
    link::Link,
    master::Master,
    register::RegisterAddress,
    slave::MailboxProtocols,
    slave_state::{AlControl, SlaveState},
    sync_manager::SmType,
    FIRST_DC_DATAGRAM, MAX_FMMU, MAX_GROUPS, MAX_IO_SEGMENTS, MAX_LRW_DATA, MAX_SM,
};

/// Largest logical segment a cyclic datagram may cover, leaving room for the
/// DC distribution datagram in the first frame.
const SEGMENT_CAP: u32 = (MAX_LRW_DATA - FIRST_DC_DATAGRAM) as u32;

/// Segment accumulator shared by the sequential and overlapping mappers.
struct Segments {
    list: heapless::Vec<u32, MAX_IO_SEGMENTS>,
    current: u32,
}

impl Segments {
    fn new() -> Self {
        Self {
            list: heapless::Vec::new(),
            current: 0,
        }
    }

    /// Account `diff` freshly mapped bytes, closing the current segment when
    /// it would exceed the cap.
    fn add(&mut self, diff: u32) {
        if self.current + diff > SEGMENT_CAP && self.list.len() < MAX_IO_SEGMENTS - 1 {
            // Push cannot fail inside the length guard
            let _ = self.list.push(self.current);

            self.current = diff;
        } else {
            self.current += diff;
        }
    }

    /// Closed segment count so far.
    fn closed(&self) -> usize {
        self.list.len()
    }

    fn finish(mut self) -> heapless::Vec<u32, MAX_IO_SEGMENTS> {
        let _ = self.list.push(self.current);

        self.list
    }
}

impl<L: Link> Master<L> {
    /// Map all PDOs of one group of slaves into an IO map with outputs and
    /// inputs in sequential order.
    ///
    /// Group 0 maps every slave. Returns the process image size in bytes; the
    /// caller's `io_map` must be at least this large and must be passed to
    /// the cyclic exchange unchanged.
    pub fn config_map_group(&mut self, io_map: &mut [u8], group: u8) -> Result<usize, Error> {
        if self.slave_count() == 0 || usize::from(group) >= MAX_GROUPS {
            return Ok(0);
        }

        log::debug!("config_map_group, group {}", group);

        self.begin_mapping(group)?;

        let count = self.slave_count() as u16;
        let group_index = usize::from(group);
        let log_start = self.groups[group_index].logical_start_address;

        let mut log_addr = log_start;
        let mut prev_log_addr = log_addr;
        let mut bit_pos = 0u8;
        let mut segments = Segments::new();

        // Output FMMUs first, across all slaves
        for slave in 1..=count {
            if !self.in_group(slave, group) || self.slave(slave)?.output_bits == 0 {
                continue;
            }

            self.create_io_mapping(group, slave, true, &mut log_addr, &mut bit_pos)?;

            if self.config.force_byte_alignment && bit_pos != 0 {
                log_addr += 1;
                bit_pos = 0;
            }

            segments.add(log_addr - prev_log_addr);
            prev_log_addr = log_addr;
        }

        if bit_pos != 0 {
            log_addr += 1;
            prev_log_addr = log_addr;
            bit_pos = 0;
            segments.add(1);
        }

        {
            let grp = &mut self.groups[group_index];

            grp.output_bytes = log_addr - log_start;
            grp.input_segment = segments.closed();
            grp.input_offset = segments.current;
        }

        // Input FMMUs continue the same logical cursor
        for slave in 1..=count {
            if !self.in_group(slave, group) {
                continue;
            }

            if self.slave(slave)?.input_bits > 0 {
                self.create_io_mapping(group, slave, false, &mut log_addr, &mut bit_pos)?;

                if self.config.force_byte_alignment && bit_pos != 0 {
                    log_addr += 1;
                    bit_pos = 0;
                }

                segments.add(log_addr - prev_log_addr);
                prev_log_addr = log_addr;
            }

            self.finish_slave_mapping(slave, group)?;
        }

        if bit_pos != 0 {
            log_addr += 1;
            segments.add(1);
        }

        let image_size;

        {
            let grp = &mut self.groups[group_index];

            grp.io_segments = segments.finish();
            grp.input_bytes = log_addr - log_start - grp.output_bytes;

            image_size = grp.io_map_size();
        }

        if io_map.len() < image_size {
            return Err(Error::IoMapTooSmall {
                required: image_size,
                provided: io_map.len(),
            });
        }

        io_map[..image_size].fill(0);

        log::debug!("Group {} process image: {} bytes", group, image_size);

        Ok(image_size)
    }

    /// Map all PDOs of one group with outputs and inputs sharing the same
    /// logical window.
    ///
    /// Inputs are stored at `io_map + output_bytes` but their FMMUs point at
    /// the same logical addresses as the outputs. Required for ESCs that
    /// cannot service an LRW that only partially overlaps their mapping.
    pub fn config_overlap_map_group(
        &mut self,
        io_map: &mut [u8],
        group: u8,
    ) -> Result<usize, Error> {
        if self.slave_count() == 0 || usize::from(group) >= MAX_GROUPS {
            return Ok(0);
        }

        log::debug!("config_overlap_map_group, group {}", group);

        self.begin_mapping(group)?;

        let count = self.slave_count() as u16;
        let group_index = usize::from(group);
        let log_start = self.groups[group_index].logical_start_address;

        let mut merged_log_addr = log_start;
        let mut out_log_addr = log_start;
        let mut in_log_addr = log_start;
        let mut bit_pos = 0u8;
        let mut segments = Segments::new();

        for slave in 1..=count {
            if !self.in_group(slave, group) {
                continue;
            }

            out_log_addr = merged_log_addr;
            in_log_addr = merged_log_addr;

            if self.slave(slave)?.output_bits > 0 {
                self.create_io_mapping(group, slave, true, &mut out_log_addr, &mut bit_pos)?;

                if bit_pos != 0 {
                    out_log_addr += 1;
                    bit_pos = 0;
                }
            }

            if self.slave(slave)?.input_bits > 0 {
                self.create_io_mapping(group, slave, false, &mut in_log_addr, &mut bit_pos)?;

                if bit_pos != 0 {
                    in_log_addr += 1;
                    bit_pos = 0;
                }
            }

            let merged = out_log_addr.max(in_log_addr);

            segments.add(merged - merged_log_addr);
            merged_log_addr = merged;

            self.finish_slave_mapping(slave, group)?;
        }

        let image_size;

        {
            let grp = &mut self.groups[group_index];

            grp.io_segments = segments.finish();
            grp.input_segment = 0;
            grp.input_offset = 0;
            grp.output_bytes = out_log_addr - log_start;
            grp.input_bytes = in_log_addr - log_start;
            grp.overlapping = true;

            image_size = grp.io_map_size();
        }

        // Inputs live after the outputs in the buffer even though their
        // logical window overlaps
        let output_bytes = self.groups[group_index].output_bytes as usize;

        for slave in 1..=count {
            if !self.in_group(slave, group) {
                continue;
            }

            let rec = self.slave_mut(slave)?;

            if let Some(offset) = rec.input_offset {
                rec.input_offset = Some(offset + output_bytes);
            }
        }

        if io_map.len() < image_size {
            return Err(Error::IoMapTooSmall {
                required: image_size,
                provided: io_map.len(),
            });
        }

        io_map[..image_size].fill(0);

        log::debug!(
            "Group {} overlapped process image: {} bytes",
            group,
            image_size
        );

        Ok(image_size)
    }

    /// Convenience: map every slave (group 0) sequentially.
    pub fn config_map(&mut self, io_map: &mut [u8]) -> Result<usize, Error> {
        self.config_map_group(io_map, 0)
    }

    /// Convenience: map every slave (group 0) with overlapping windows.
    pub fn config_overlap_map(&mut self, io_map: &mut [u8]) -> Result<usize, Error> {
        self.config_overlap_map_group(io_map, 0)
    }

    /// Assign a slave to a group before mapping. Group 0 is the default and
    /// means "mapped with group 0".
    pub fn set_slave_group(&mut self, slave: u16, group: u8) -> Result<(), Error> {
        if usize::from(group) >= MAX_GROUPS {
            return Err(Error::NotFound {
                item: crate::error::Item::Group,
                index: Some(usize::from(group)),
            });
        }

        self.slave_mut(slave)?.group = group;

        Ok(())
    }

    pub(crate) fn in_group(&self, slave: u16, group: u8) -> bool {
        group == 0
            || self
                .slave(slave)
                .map(|rec| rec.group == group)
                .unwrap_or(false)
    }

    /// Reset all mapping state for the group and (re)discover each member's
    /// PDO sizes, then program sync managers.
    fn begin_mapping(&mut self, group: u8) -> Result<(), Error> {
        self.groups[usize::from(group)].reset_mapping();

        let count = self.slave_count() as u16;

        for slave in 1..=count {
            if !self.in_group(slave, group) {
                continue;
            }

            let rec = self.slave_mut(slave)?;

            rec.fmmu = Default::default();
            rec.fmmu_unused = 0;
            rec.output_offset = None;
            rec.input_offset = None;
            rec.output_start_bit = 0;
            rec.input_start_bit = 0;
        }

        self.find_mappings(group)
    }

    /// Discover PDO mappings (CoE, then SoE, then SII) and program the sync
    /// managers of every slave in the group.
    ///
    /// The CoE/SoE stage is bounded by `MAX_MAPT` workers; the default of one
    /// serialises the reads.
    fn find_mappings(&mut self, group: u8) -> Result<(), Error> {
        let count = self.slave_count() as u16;

        for slave in 1..=count {
            if self.in_group(slave, group) {
                self.map_coe_soe(slave)?;
            }
        }

        for slave in 1..=count {
            if self.in_group(slave, group) {
                self.map_sii(slave)?;
                self.map_sm(slave)?;
            }
        }

        Ok(())
    }

    fn map_coe_soe(&mut self, slave: u16) -> Result<(), Error> {
        self.state_check(slave, SlaveState::PreOp, self.timeouts.state_transition)?;

        log::debug!(
            "Slave {}, configadr {:#06x}, state {}",
            slave,
            self.slave(slave)?.configured_address(),
            self.slave(slave)?.state()
        );

        if let Some(Some(hook)) = self.po2so_hooks.get(usize::from(slave)) {
            hook(self, slave)?;
        }

        if self.slave(slave)?.config_index != 0 {
            // Sizes came from the configuration table
            return Ok(());
        }

        let (protocols, coe_details) = {
            let rec = self.slave(slave)?;

            (rec.mailbox_protocols(), rec.coe_details)
        };

        let mut sizes = PdoMapSizes::default();

        if protocols.contains(MailboxProtocols::COE) {
            if coe_details & details::SDO_CA != 0 {
                sizes = self.read_pdo_map_ca(slave).unwrap_or_else(|e| {
                    log::debug!("Slave {} complete access map failed: {}", slave, e);

                    PdoMapSizes::default()
                });
            }

            if sizes.output_bits == 0 && sizes.input_bits == 0 {
                sizes = self.read_pdo_map(slave).unwrap_or_else(|e| {
                    log::debug!("Slave {} CoE map failed: {}", slave, e);

                    PdoMapSizes::default()
                });
            }

            if sizes.output_bits > 0 || sizes.input_bits > 0 {
                log::debug!(
                    "  CoE Osize: {} Isize: {}",
                    sizes.output_bits,
                    sizes.input_bits
                );
            }
        }

        if sizes.output_bits == 0
            && sizes.input_bits == 0
            && protocols.contains(MailboxProtocols::SOE)
        {
            let (output_bits, input_bits) = self.read_idn_map(slave)?;

            sizes.output_bits = output_bits;
            sizes.input_bits = input_bits;

            let rec = self.slave_mut(slave)?;

            rec.sm[2].length_bytes = crate::bytes_for_bits(output_bits as u16);
            rec.sm[3].length_bytes = crate::bytes_for_bits(input_bits as u16);

            log::debug!("  SoE Osize: {} Isize: {}", output_bits, input_bits);
        }

        let rec = self.slave_mut(slave)?;

        rec.output_bits = sizes.output_bits as u16;
        rec.input_bits = sizes.input_bits as u16;

        Ok(())
    }

    fn map_sii(&mut self, slave: u16) -> Result<(), Error> {
        let (mut output_bits, mut input_bits) = {
            let rec = self.slave(slave)?;

            (rec.output_bits, rec.input_bits)
        };

        if output_bits == 0 && input_bits == 0 {
            if let Some((o, i)) = self.copy_mapping_from_twin(slave) {
                output_bits = o;
                input_bits = i;
            }
        }

        if output_bits == 0 && input_bits == 0 {
            let inputs = self.sii_pdo(slave, false)?;

            {
                let rec = self.slave_mut(slave)?;

                for sm in 0..MAX_SM {
                    if inputs.sm_bits[sm] > 0 {
                        rec.sm[sm].length_bytes = crate::bytes_for_bits(inputs.sm_bits[sm]);
                        rec.sm_type[sm] = SmType::Inputs;
                    }
                }
            }

            input_bits = inputs.total_bits as u16;

            let outputs = self.sii_pdo(slave, true)?;

            {
                let rec = self.slave_mut(slave)?;

                for sm in 0..MAX_SM {
                    if outputs.sm_bits[sm] > 0 {
                        rec.sm[sm].length_bytes = crate::bytes_for_bits(outputs.sm_bits[sm]);
                        rec.sm_type[sm] = SmType::Outputs;
                    }
                }
            }

            output_bits = outputs.total_bits as u16;

            if output_bits > 0 || input_bits > 0 {
                log::debug!("  SII Osize: {} Isize: {}", output_bits, input_bits);
            }
        }

        let rec = self.slave_mut(slave)?;

        rec.output_bits = output_bits;
        rec.input_bits = input_bits;

        Ok(())
    }

    /// Mapping of identical devices is identical: reuse the sizes discovered
    /// for a lower-numbered twin.
    fn copy_mapping_from_twin(&mut self, slave: u16) -> Option<(u16, u16)> {
        if slave <= 1 {
            return None;
        }

        let rec = self.slave(slave).ok()?;
        let identity = (rec.vendor_id, rec.product_code, rec.revision);

        let twin = (1..slave).find(|&candidate| {
            self.slave(candidate)
                .map(|c| (c.vendor_id, c.product_code, c.revision) == identity)
                .unwrap_or(false)
        })?;

        let (sm_lengths, sm_types, output_bits, input_bits) = {
            let t = &self.slaves[usize::from(twin)];

            let mut lengths = [0u16; MAX_SM];

            for (length, sm) in lengths.iter_mut().zip(t.sm.iter()) {
                *length = sm.length_bytes;
            }

            (lengths, t.sm_type, t.output_bits, t.input_bits)
        };

        let rec = &mut self.slaves[usize::from(slave)];

        for sm in 0..MAX_SM {
            rec.sm[sm].length_bytes = sm_lengths[sm];
            rec.sm_type[sm] = sm_types[sm];
        }

        log::debug!("Copied mapping of slave {} from twin {}", slave, twin);

        Some((output_bits, input_bits))
    }

    /// Program the slave's sync managers and derive its byte sizes.
    fn map_sm(&mut self, slave: u16) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();
        let has_mailbox = self.slave(slave)?.has_mailbox();

        log::debug!("  SM programming for slave {}", slave);

        // Non-mailbox slaves may use SM0/SM1 for process data
        for index in 0..2u8 {
            let sm = self.slave(slave)?.sm[usize::from(index)];

            if !has_mailbox && sm.physical_start_address != 0 {
                self.fpwr(
                    configured_address,
                    RegisterAddress::sync_manager(index),
                    sm,
                    self.timeouts.pdu3(),
                )?;
            }
        }

        for index in 2..MAX_SM as u8 {
            let mut sm = self.slave(slave)?.sm[usize::from(index)];

            if sm.physical_start_address == 0 {
                continue;
            }

            // A zero length channel must not stay enabled
            sm.set_enabled(sm.length_bytes != 0);

            self.slave_mut(slave)?.sm[usize::from(index)] = sm;

            self.fpwr(
                configured_address,
                RegisterAddress::sync_manager(index),
                sm,
                self.timeouts.pdu3(),
            )?;

            log::debug!(
                "    SM{} type {:?} start {:#06x} len {}",
                index,
                self.slave(slave)?.sm_type[usize::from(index)],
                sm.physical_start_address,
                sm.length_bytes
            );
        }

        let rec = self.slave_mut(slave)?;

        if rec.input_bits > 7 {
            rec.input_bytes = crate::bytes_for_bits(rec.input_bits);
        }

        if rec.output_bits > 7 {
            rec.output_bytes = crate::bytes_for_bits(rec.output_bits);
        }

        Ok(())
    }

    /// Allocate and program FMMUs mapping one direction of a slave's process
    /// data at the logical cursor.
    ///
    /// Consecutive sync managers whose physical ranges abut are coalesced
    /// into one FMMU; gaps break the mapping into further FMMUs. Bit oriented
    /// slaves pack bit-granular; byte oriented slaves start on a fresh byte.
    /// A slave adds at most one to the group's expected working counter per
    /// direction, however many FMMUs it needed.
    fn create_io_mapping(
        &mut self,
        group: u8,
        slave: u16,
        outputs: bool,
        log_addr: &mut u32,
        bit_pos: &mut u8,
    ) -> Result<(), Error> {
        let group_start = self.groups[usize::from(group)].logical_start_address;

        let (configured_address, bits, bytes) = {
            let rec = self.slave(slave)?;

            if outputs {
                (rec.configured_address(), rec.output_bits, rec.output_bytes)
            } else {
                (rec.configured_address(), rec.input_bits, rec.input_bytes)
            }
        };

        let wanted = if outputs {
            SmType::Outputs
        } else {
            SmType::Inputs
        };

        let target_bytes = usize::from(crate::bytes_for_bits(bits));

        let mut fmmu_index = usize::from(self.slave(slave)?.fmmu_unused);
        let mut sm_search = 0usize;
        let mut mapped_bytes = 0usize;
        let mut counts_in_wkc = false;

        log::debug!(
            "  Slave {} {} mapping, {} bits",
            slave,
            if outputs { "output" } else { "input" },
            bits
        );

        while fmmu_index < MAX_FMMU && mapped_bytes < target_bytes {
            // First sync manager contributing to this FMMU
            let Some(first_sm) = self.next_sm_of_type(slave, wanted, sm_search)? else {
                break;
            };

            let mut fmmu = Fmmu::default();

            let (mut byte_count, mut bit_count);
            let mut end_address;

            {
                let rec = self.slave(slave)?;
                let sm = &rec.sm[first_sm];

                fmmu.physical_start_address = sm.physical_start_address;
                byte_count = usize::from(sm.length_bytes);
                bit_count = usize::from(sm.length_bytes) * 8;
                end_address = sm.physical_start_address + sm.length_bytes;
            }

            sm_search = first_sm + 1;

            // Coalesce further sync managers while their physical ranges
            // abut; a gap ends this FMMU
            while bit_count < usize::from(bits) {
                let Some(next_sm) = self.next_sm_of_type(slave, wanted, sm_search)? else {
                    break;
                };

                let (start, length) = {
                    let sm = &self.slave(slave)?.sm[next_sm];

                    (sm.physical_start_address, sm.length_bytes)
                };

                if start > end_address {
                    break;
                }

                byte_count += usize::from(length);
                bit_count += usize::from(length) * 8;
                end_address = start + length;
                sm_search = next_sm + 1;
            }

            let fmmu_size;

            if bytes == 0 {
                // Bit oriented slave: bit-granular logical packing
                fmmu.logical_start_address = *log_addr;
                fmmu.logical_start_bit = *bit_pos;

                *bit_pos += (bits - 1) as u8;

                if *bit_pos > 7 {
                    *log_addr += 1;
                    *bit_pos -= 8;
                }

                fmmu_size = (*log_addr - fmmu.logical_start_address + 1) as usize;
                fmmu.length_bytes = fmmu_size as u16;
                fmmu.logical_end_bit = *bit_pos;

                *bit_pos += 1;

                if *bit_pos > 7 {
                    *log_addr += 1;
                    *bit_pos -= 8;
                }
            } else {
                // Byte oriented slave: start on a whole byte
                if *bit_pos != 0 {
                    *log_addr += 1;
                    *bit_pos = 0;
                }

                fmmu.logical_start_address = *log_addr;
                fmmu.logical_start_bit = 0;

                let mut size = byte_count;

                if size + mapped_bytes > usize::from(bytes) {
                    size = usize::from(bytes) - mapped_bytes;
                }

                *log_addr += size as u32;
                fmmu.length_bytes = size as u16;
                fmmu.logical_end_bit = 7;
                fmmu_size = size;
            }

            mapped_bytes += fmmu_size;

            if fmmu.length_bytes > 0 {
                fmmu.physical_start_bit = 0;
                fmmu.read_enable = !outputs;
                fmmu.write_enable = outputs;
                fmmu.enable = true;

                {
                    let rec = self.slave_mut(slave)?;

                    rec.fmmu[fmmu_index] = fmmu;
                }

                self.fpwr(
                    configured_address,
                    RegisterAddress::fmmu(fmmu_index as u8),
                    fmmu,
                    self.timeouts.pdu3(),
                )?;

                // A single ESC contributes to the working counter only once
                // per direction
                counts_in_wkc = true;
            }

            {
                let offset = (fmmu.logical_start_address - group_start) as usize;
                let start_bit = fmmu.logical_start_bit;
                let rec = self.slave_mut(slave)?;

                if outputs && rec.output_offset.is_none() {
                    rec.output_offset = Some(offset);
                    rec.output_start_bit = start_bit;
                } else if !outputs && rec.input_offset.is_none() {
                    rec.input_offset = Some(offset);
                    rec.input_start_bit = start_bit;
                }
            }

            fmmu_index += 1;
        }

        self.slave_mut(slave)?.fmmu_unused = fmmu_index as u8;

        if counts_in_wkc {
            let grp = &mut self.groups[usize::from(group)];

            if outputs {
                grp.outputs_wkc += 1;
            } else {
                grp.inputs_wkc += 1;
            }
        }

        Ok(())
    }

    fn next_sm_of_type(
        &self,
        slave: u16,
        wanted: SmType,
        from: usize,
    ) -> Result<Option<usize>, Error> {
        let rec = self.slave(slave)?;

        Ok((from..MAX_SM).find(|&index| rec.sm_type[index] == wanted))
    }

    /// Per-slave epilogue shared by both mappers: EEPROM back to the PDI,
    /// SAFE-OP request and group aggregate updates.
    fn finish_slave_mapping(&mut self, slave: u16, group: u8) -> Result<(), Error> {
        self.eeprom_to_pdi(slave)?;

        if !self.config.manual_state_change {
            let configured_address = self.slave(slave)?.configured_address();

            self.fpwr(
                configured_address,
                RegisterAddress::AlControl.into(),
                AlControl::new(SlaveState::SafeOp),
                self.timeouts.pdu3(),
            )?;
        }

        let (block_lrw, ebus_current) = {
            let rec = self.slave(slave)?;

            (rec.block_lrw, rec.ebus_current)
        };

        let grp = &mut self.groups[usize::from(group)];

        if block_lrw {
            grp.block_lrw += 1;
        }

        grp.ebus_current += i32::from(ebus_current);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_split_at_cap() {
        let mut segments = Segments::new();

        // Fill just below the cap, then push it over
        segments.add(SEGMENT_CAP - 10);
        assert_eq!(segments.closed(), 0);

        segments.add(20);

        assert_eq!(segments.closed(), 1);

        let list = segments.finish();

        assert_eq!(list.as_slice(), &[SEGMENT_CAP - 10, 20]);
    }

    #[test]
    fn segment_exactly_at_cap_stays_whole() {
        let mut segments = Segments::new();

        segments.add(SEGMENT_CAP);

        let list = segments.finish();

        assert_eq!(list.as_slice(), &[SEGMENT_CAP]);
    }
}
