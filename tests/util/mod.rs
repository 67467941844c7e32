#![allow(dead_code)]

//! A deterministic in-memory EtherCAT segment.
//!
//! Implements [`Link`] by emulating a chain of slaves at the register level:
//! datagrams are processed in chain order, working counters accumulate per
//! the command kind, the EEPROM interface serves a synthetic SII image and
//! mailbox slaves answer CoE and FoE requests. The emulation is driven by
//! exactly the register contracts the master programs (sync managers, FMMUs,
//! AL control), so the whole configuration pipeline is exercised end to end.

use catenary::error::Error;
use catenary::Link;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ETH_HEADER: usize = 14;
const ECAT_HEADER: usize = 2;
const PDU_HEADER: usize = 10;

/// Static description of one emulated slave.
#[derive(Clone)]
pub struct SimSlaveConfig {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    pub name: &'static str,
    pub has_dc: bool,
    /// `(write_offset, write_len, read_offset, read_len, protocols)`
    pub mailbox: Option<(u16, u16, u16, u16, u16)>,
    /// SII SM category entries: `(start, len, control, activate)`
    pub sm_category: Vec<(u16, u16, u8, u8)>,
    /// SII FMMU category usage codes.
    pub fmmu_category: Vec<u8>,
    /// RxPDO (output) entry bit lengths and their sync manager.
    pub rx_pdo_bits: Vec<u8>,
    pub rx_pdo_sm: u8,
    /// TxPDO (input) entry bit lengths and their sync manager.
    pub tx_pdo_bits: Vec<u8>,
    pub tx_pdo_sm: u8,
    /// CoE object dictionary.
    pub od: Vec<((u16, u8), Vec<u8>)>,
    /// SII general category CoE details byte.
    pub coe_details: u8,
}

impl SimSlaveConfig {
    /// An EK1100-style coupler: DC capable, no process data, no mailbox.
    pub fn ek1100() -> Self {
        Self {
            vendor: 0x2,
            product: 0x044c_2c52,
            revision: 0x0011_0000,
            serial: 0,
            name: "EK1100",
            has_dc: true,
            mailbox: None,
            sm_category: Vec::new(),
            fmmu_category: Vec::new(),
            rx_pdo_bits: Vec::new(),
            rx_pdo_sm: 0,
            tx_pdo_bits: Vec::new(),
            tx_pdo_sm: 0,
            od: Vec::new(),
            coe_details: 0,
        }
    }

    /// An EL2008-style terminal: 8 output bits, configured purely from SII.
    pub fn el2008() -> Self {
        Self {
            vendor: 0x2,
            product: 0x07d8_3052,
            revision: 0x0010_0000,
            serial: 0,
            name: "EL2008",
            has_dc: false,
            mailbox: None,
            sm_category: vec![(0x0f00, 1, 0x44, 1)],
            fmmu_category: vec![1],
            rx_pdo_bits: vec![1; 8],
            rx_pdo_sm: 0,
            tx_pdo_bits: Vec::new(),
            tx_pdo_sm: 0,
            od: Vec::new(),
            coe_details: 0,
        }
    }

    /// A mailbox device speaking CoE (and FoE), with `out_bits` outputs and
    /// `in_bits` inputs discovered through the object dictionary.
    pub fn coe_io(out_bits: u16, in_bits: u16) -> Self {
        let mut od: Vec<((u16, u8), Vec<u8>)> = Vec::new();

        od.push(((0x1018, 0x00), vec![4]));
        od.push(((0x1018, 0x01), 0x2u32.to_le_bytes().to_vec()));
        od.push(((0x1018, 0x02), 0x07d8_3052u32.to_le_bytes().to_vec()));
        od.push(((0x1018, 0x03), 0x0010_0000u32.to_le_bytes().to_vec()));
        od.push(((0x1008, 0x00), b"SIMIO".to_vec()));

        // Sync manager communication types
        od.push(((0x1c00, 0x00), vec![4]));
        od.push(((0x1c00, 0x01), vec![1]));
        od.push(((0x1c00, 0x02), vec![2]));
        od.push(((0x1c00, 0x03), vec![3]));
        od.push(((0x1c00, 0x04), vec![4]));

        // Output assignment and mapping
        let out_entries = (out_bits / 8).max(if out_bits > 0 { 1 } else { 0 });

        od.push((
            (0x1c12, 0x00),
            vec![if out_entries > 0 { 1 } else { 0 }],
        ));

        if out_entries > 0 {
            od.push(((0x1c12, 0x01), 0x1600u16.to_le_bytes().to_vec()));
            od.push(((0x1600, 0x00), vec![out_entries as u8]));

            for entry in 1..=out_entries as u8 {
                od.push((
                    (0x1600, entry),
                    (0x7000_0008u32 | u32::from(entry) << 8).to_le_bytes().to_vec(),
                ));
            }
        }

        // Input assignment and mapping
        let in_entries = (in_bits / 8).max(if in_bits > 0 { 1 } else { 0 });

        od.push((
            (0x1c13, 0x00),
            vec![if in_entries > 0 { 1 } else { 0 }],
        ));

        if in_entries > 0 {
            od.push(((0x1c13, 0x01), 0x1a00u16.to_le_bytes().to_vec()));
            od.push(((0x1a00, 0x00), vec![in_entries as u8]));

            for entry in 1..=in_entries as u8 {
                od.push((
                    (0x1a00, entry),
                    (0x6000_0008u32 | u32::from(entry) << 8).to_le_bytes().to_vec(),
                ));
            }
        }

        Self {
            vendor: 0x2,
            product: 0x07d8_3052,
            revision: 0x0012_0000,
            serial: 0xdead_0001,
            name: "SIMIO",
            has_dc: true,
            // 136 byte mailboxes leave 124 bytes of FoE data per packet
            mailbox: Some((0x1000, 136, 0x1088, 136, 0x000c)),
            sm_category: vec![
                (0x1000, 136, 0x26, 1),
                (0x1088, 136, 0x22, 1),
                (0x1100, 0, 0x64, 1),
                (0x1180, 0, 0x20, 1),
            ],
            fmmu_category: vec![1, 2],
            rx_pdo_bits: Vec::new(),
            rx_pdo_sm: 0,
            tx_pdo_bits: Vec::new(),
            tx_pdo_sm: 0,
            od,
            coe_details: 0x01,
        }
    }
}

/// FoE transfer bookkeeping exposed to tests.
#[derive(Debug, Default, Clone)]
pub struct FoeStats {
    pub data_packets: Vec<(u32, usize)>,
    pub received_bytes: usize,
    pub write_requests: usize,
}

struct SimSlave {
    config: SimSlaveConfig,
    eeprom: Vec<u8>,
    mem: Vec<u8>,
    al_state: u8,
    al_error: bool,
    al_code: u16,
    sm1_full: bool,
    mailbox_counter: u8,
    offline: bool,
    dl_status: u16,
    od: BTreeMap<(u16, u8), Vec<u8>>,
    foe: FoeStats,
    foe_file: Vec<u8>,
}

impl SimSlave {
    fn new(config: SimSlaveConfig) -> Self {
        let eeprom = build_eeprom(&config);
        let od = config.od.iter().cloned().collect();

        let mut slave = Self {
            config,
            eeprom,
            mem: vec![0u8; 0x10000],
            al_state: 0x01,
            al_error: false,
            al_code: 0,
            sm1_full: false,
            mailbox_counter: 0,
            offline: false,
            dl_status: 0,
            od,
            foe: FoeStats::default(),
            foe_file: Vec::new(),
        };

        slave.reset_registers();

        slave
    }

    fn reset_registers(&mut self) {
        // ESC identity corner
        self.mem[0x0000] = 0x11;

        let support: u16 = if self.config.has_dc { 0x0004 } else { 0x0000 };

        self.mem[0x0008..0x000a].copy_from_slice(&support.to_le_bytes());

        // PDI control: digital I/O style interface
        self.mem[0x0140] = 0x04;
    }

    fn mem16(&self, addr: usize) -> u16 {
        u16::from_le_bytes([self.mem[addr], self.mem[addr + 1]])
    }

    /// Power cycle: lose the station address and all volatile configuration.
    fn power_cycle(&mut self) {
        self.mem.fill(0);
        self.reset_registers();
        self.al_state = 0x01;
        self.al_error = false;
        self.al_code = 0;
        self.sm1_full = false;
        self.mailbox_counter = 0;
    }

    /// Serve a register read, synthesising the live registers.
    fn read(&mut self, addr: usize, out: &mut [u8]) {
        for (offset, byte) in out.iter_mut().enumerate() {
            let at = addr + offset;

            *byte = match at {
                0x0110 => self.dl_status as u8,
                0x0111 => (self.dl_status >> 8) as u8,
                0x0130 => self.al_state | if self.al_error { 0x10 } else { 0x00 },
                0x0131 => 0,
                0x0134 => self.al_code as u8,
                0x0135 => (self.al_code >> 8) as u8,
                // EEPROM status: never busy, no errors
                0x0502 => 0x00,
                0x0503 => 0x00,
                // SM0 status: write mailbox always drained instantly
                0x0805 => 0x00,
                // SM1 status: read mailbox full flag
                0x080d => {
                    if self.sm1_full {
                        0x08
                    } else {
                        0x00
                    }
                }
                _ => *self.mem.get(at).unwrap_or(&0),
            };
        }

        // Reading the full response mailbox consumes the message
        if let Some((_, _, rd_off, rd_len, _)) = self.config.mailbox {
            if addr == usize::from(rd_off) && out.len() >= usize::from(rd_len) {
                self.sm1_full = false;
            }
        }
    }

    /// Serve a register write with its side effects.
    fn write(&mut self, addr: usize, data: &[u8]) {
        if addr + data.len() <= self.mem.len() {
            self.mem[addr..addr + data.len()].copy_from_slice(data);
        }

        // AL control
        if addr <= 0x0120 && addr + data.len() > 0x0120 {
            let raw = u16::from(self.mem[0x0120]) | u16::from(self.mem[0x0121]) << 8;

            self.request_state(raw);
        }

        // EEPROM command
        if addr == 0x0502 && data.len() >= 4 {
            let command = self.mem16(0x0502);
            let word = usize::from(self.mem16(0x0504));

            if command & 0x0100 != 0 {
                // Read 4 bytes into the data register
                for i in 0..4 {
                    self.mem[0x0508 + i] = *self.eeprom.get(word * 2 + i).unwrap_or(&0xff);
                }
            } else if command & 0x0201 == 0x0201 {
                let value = [self.mem[0x0508], self.mem[0x0509]];

                if word * 2 + 1 < self.eeprom.len() {
                    self.eeprom[word * 2..word * 2 + 2].copy_from_slice(&value);
                }
            }
        }

        // Mailbox write
        if let Some((wr_off, wr_len, _, _, _)) = self.config.mailbox {
            if addr == usize::from(wr_off) && data.len() >= usize::from(wr_len).min(6) {
                let request = data.to_vec();

                self.handle_mailbox(&request);
            }
        }
    }

    fn request_state(&mut self, raw: u16) {
        let ack = raw & 0x10 != 0;
        let target = (raw & 0x0f) as u8;

        if ack {
            self.al_error = false;
            self.al_code = 0;
        }

        if self.al_error {
            // Transitions are refused until the error is acknowledged
            return;
        }

        let legal = matches!(
            (self.al_state, target),
            (_, 0x01)
                | (0x01, 0x02)
                | (0x02, 0x02)
                | (0x02, 0x03)
                | (0x03, 0x02)
                | (0x02, 0x04)
                | (0x04, 0x04)
                | (0x04, 0x02)
                | (0x04, 0x08)
                | (0x08, 0x08)
                | (0x08, 0x04)
                | (0x08, 0x02)
        );

        if legal {
            self.al_state = target;
        } else {
            self.al_error = true;
            self.al_code = 0x0011;
        }
    }

    fn place_mailbox_response(&mut self, payload: &[u8], mailbox_type: u8) {
        let Some((_, _, rd_off, rd_len, _)) = self.config.mailbox else {
            return;
        };

        self.mailbox_counter = if self.mailbox_counter >= 7 {
            1
        } else {
            self.mailbox_counter + 1
        };

        let rd_off = usize::from(rd_off);
        let rd_len = usize::from(rd_len);

        self.mem[rd_off..rd_off + rd_len].fill(0);

        let len = payload.len() as u16;

        self.mem[rd_off..rd_off + 2].copy_from_slice(&len.to_le_bytes());
        self.mem[rd_off + 2..rd_off + 4].copy_from_slice(&0u16.to_le_bytes());
        self.mem[rd_off + 4] = 0;
        self.mem[rd_off + 5] = mailbox_type | (self.mailbox_counter << 4);
        self.mem[rd_off + 6..rd_off + 6 + payload.len()].copy_from_slice(payload);

        self.sm1_full = true;
    }

    fn handle_mailbox(&mut self, request: &[u8]) {
        if request.len() < 6 {
            return;
        }

        let length = usize::from(u16::from_le_bytes([request[0], request[1]]));
        let mailbox_type = request[5] & 0x0f;

        let Some(payload) = request.get(6..6 + length) else {
            return;
        };

        match mailbox_type {
            0x03 => self.handle_coe(&payload.to_vec()),
            0x04 => self.handle_foe(&payload.to_vec()),
            _ => (),
        }
    }

    fn handle_coe(&mut self, payload: &[u8]) {
        if payload.len() < 8 {
            return;
        }

        let service = payload[1] >> 4;

        // Only SDO requests are served
        if service != 0x02 {
            return;
        }

        let command = payload[2];
        let index = u16::from_le_bytes([payload[3], payload[4]]);
        let sub_index = payload[5];

        if command & 0xe0 == 0x40 {
            // Upload request
            let Some(value) = self.od.get(&(index, sub_index)).cloned() else {
                let mut abort = [0u8; 10];

                abort[1] = 0x20;
                abort[2] = 0x80;
                abort[3..5].copy_from_slice(&index.to_le_bytes());
                abort[5] = sub_index;
                abort[6..10].copy_from_slice(&0x0602_0000u32.to_le_bytes());

                self.place_mailbox_response(&abort, 0x03);

                return;
            };

            let mut response = vec![0u8; 10];

            response[1] = 0x30;
            response[3..5].copy_from_slice(&index.to_le_bytes());
            response[5] = sub_index;

            if value.len() <= 4 {
                response[2] = 0x43 | (((4 - value.len() as u8) << 2) & 0x0c);
                response[6..6 + value.len()].copy_from_slice(&value);
            } else {
                // Normal (unsegmented) upload
                response[2] = 0x41;
                response[6..10].copy_from_slice(&(value.len() as u32).to_le_bytes());
                response.extend_from_slice(&value);
            }

            self.place_mailbox_response(&response, 0x03);
        } else if command & 0xe0 == 0x20 {
            // Download request (expedited or normal)
            let value = if command & 0x02 != 0 {
                let size = if command & 0x01 != 0 {
                    4 - usize::from((command >> 2) & 0x03)
                } else {
                    4
                };

                payload[6..6 + size].to_vec()
            } else {
                let size = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]])
                    as usize;

                payload[10..10 + size.min(payload.len() - 10)].to_vec()
            };

            self.od.insert((index, sub_index), value);

            let mut response = [0u8; 10];

            response[1] = 0x30;
            response[2] = 0x60;
            response[3..5].copy_from_slice(&index.to_le_bytes());
            response[5] = sub_index;

            self.place_mailbox_response(&response, 0x03);
        }
    }

    fn handle_foe(&mut self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }

        let op_code = payload[0];
        let value = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);

        match op_code {
            // WRITE request: open the transfer, ack packet 0
            0x02 => {
                self.foe.write_requests += 1;
                self.foe.data_packets.clear();
                self.foe.received_bytes = 0;
                self.foe_file.clear();

                let mut ack = [0u8; 6];

                ack[0] = 0x04;

                self.place_mailbox_response(&ack, 0x04);
            }
            // DATA: record and ack by number
            0x03 => {
                let data = &payload[6..];

                self.foe.data_packets.push((value, data.len()));
                self.foe.received_bytes += data.len();
                self.foe_file.extend_from_slice(data);

                let mut ack = [0u8; 6];

                ack[0] = 0x04;
                ack[2..6].copy_from_slice(&value.to_le_bytes());

                self.place_mailbox_response(&ack, 0x04);
            }
            // READ request: serve the stored file
            0x01 => {
                let chunk_len = self.foe_file.len().min(124);
                let chunk = self.foe_file[..chunk_len].to_vec();

                let mut data = vec![0u8; 6 + chunk.len()];

                data[0] = 0x03;
                data[2..6].copy_from_slice(&1u32.to_le_bytes());
                data[6..].copy_from_slice(&chunk);

                self.place_mailbox_response(&data, 0x04);
            }
            _ => (),
        }
    }

    /// Apply an FMMU mapped logical access. Returns `(read_hit, write_hit)`.
    fn logical_access(
        &mut self,
        logical_start: u32,
        payload: &mut [u8],
        do_read: bool,
        do_write: bool,
    ) -> (bool, bool) {
        let window_end = logical_start + payload.len() as u32;

        let mut read_hit = false;
        let mut write_hit = false;

        for fmmu in 0..4usize {
            let base = 0x0600 + fmmu * 16;

            if self.mem[base + 12] & 0x01 == 0 {
                continue;
            }

            let log_start = u32::from_le_bytes([
                self.mem[base],
                self.mem[base + 1],
                self.mem[base + 2],
                self.mem[base + 3],
            ]);
            let len = u32::from(self.mem16(base + 4));
            let phys = usize::from(self.mem16(base + 8));
            let flags = self.mem[base + 11];

            let log_end = log_start + len;

            let start = log_start.max(logical_start);
            let end = log_end.min(window_end);

            if start >= end {
                continue;
            }

            let count = (end - start) as usize;
            let payload_at = (start - logical_start) as usize;
            let phys_at = phys + (start - log_start) as usize;

            if do_read && flags & 0x01 != 0 {
                payload[payload_at..payload_at + count]
                    .copy_from_slice(&self.mem[phys_at..phys_at + count]);

                read_hit = true;
            }

            if do_write && flags & 0x02 != 0 {
                self.mem[phys_at..phys_at + count]
                    .copy_from_slice(&payload[payload_at..payload_at + count]);

                write_hit = true;
            }
        }

        (read_hit, write_hit)
    }
}

fn set_word(eeprom: &mut Vec<u8>, word: usize, value: u16) {
    if eeprom.len() < (word + 1) * 2 {
        eeprom.resize((word + 1) * 2, 0xff);
    }

    eeprom[word * 2..word * 2 + 2].copy_from_slice(&value.to_le_bytes());
}

fn push_category(eeprom: &mut Vec<u8>, next_word: &mut usize, category: u16, data: &[u8]) {
    let words = data.len().div_ceil(2);

    set_word(eeprom, *next_word, category);
    set_word(eeprom, *next_word + 1, words as u16);

    *next_word += 2;

    for chunk in data.chunks(2) {
        let value = u16::from(chunk[0]) | u16::from(*chunk.get(1).unwrap_or(&0)) << 8;

        set_word(eeprom, *next_word, value);

        *next_word += 1;
    }
}

fn pdo_category(pdo_index: u16, sync_manager: u8, entry_bits: &[u8], entry_base: u16) -> Vec<u8> {
    let mut data = Vec::new();

    if entry_bits.is_empty() {
        return data;
    }

    // PDO header: index, entry count, SM, sync unit, name index, flags
    data.extend_from_slice(&pdo_index.to_le_bytes());
    data.push(entry_bits.len() as u8);
    data.push(sync_manager);
    data.push(0);
    data.push(0);
    data.extend_from_slice(&0u16.to_le_bytes());

    for (position, bits) in entry_bits.iter().enumerate() {
        // Entry: index, subindex, name index, data type, bit length, flags
        data.extend_from_slice(&entry_base.to_le_bytes());
        data.push(position as u8 + 1);
        data.push(0);
        data.push(0x01);
        data.push(*bits);
        data.extend_from_slice(&0u16.to_le_bytes());
    }

    data
}

fn build_eeprom(config: &SimSlaveConfig) -> Vec<u8> {
    let mut eeprom = vec![0xffu8; 0x100];

    set_word(&mut eeprom, 0x08, config.vendor as u16);
    set_word(&mut eeprom, 0x09, (config.vendor >> 16) as u16);
    set_word(&mut eeprom, 0x0a, config.product as u16);
    set_word(&mut eeprom, 0x0b, (config.product >> 16) as u16);
    set_word(&mut eeprom, 0x0c, config.revision as u16);
    set_word(&mut eeprom, 0x0d, (config.revision >> 16) as u16);
    set_word(&mut eeprom, 0x0e, config.serial as u16);
    set_word(&mut eeprom, 0x0f, (config.serial >> 16) as u16);

    if let Some((wr_off, wr_len, rd_off, rd_len, protocols)) = config.mailbox {
        set_word(&mut eeprom, 0x18, wr_off);
        set_word(&mut eeprom, 0x19, wr_len);
        set_word(&mut eeprom, 0x1a, rd_off);
        set_word(&mut eeprom, 0x1b, rd_len);
        set_word(&mut eeprom, 0x1c, protocols);
    } else {
        set_word(&mut eeprom, 0x18, 0);
        set_word(&mut eeprom, 0x19, 0);
        set_word(&mut eeprom, 0x1a, 0);
        set_word(&mut eeprom, 0x1b, 0);
        set_word(&mut eeprom, 0x1c, 0);
    }

    let mut next_word = 0x40usize;

    // Strings category: one string, the device name
    let mut strings = vec![1u8, config.name.len() as u8];

    strings.extend_from_slice(config.name.as_bytes());

    push_category(&mut eeprom, &mut next_word, 10, &strings);

    // General category
    let mut general = vec![0u8; 32];

    general[0x03] = 1; // name string index
    general[0x05] = config.coe_details;
    general[0x06] = if config.mailbox.map(|m| m.4 & 0x08 != 0).unwrap_or(false) {
        0x01
    } else {
        0x00
    };

    push_category(&mut eeprom, &mut next_word, 30, &general);

    if !config.fmmu_category.is_empty() {
        push_category(&mut eeprom, &mut next_word, 40, &config.fmmu_category);
    }

    if !config.sm_category.is_empty() {
        let mut data = Vec::new();

        for (start, len, control, activate) in &config.sm_category {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.push(*control);
            data.push(0);
            data.push(*activate);
            data.push(0);
        }

        push_category(&mut eeprom, &mut next_word, 41, &data);
    }

    if !config.tx_pdo_bits.is_empty() {
        let data = pdo_category(0x1a00, config.tx_pdo_sm, &config.tx_pdo_bits, 0x6000);

        push_category(&mut eeprom, &mut next_word, 50, &data);
    }

    if !config.rx_pdo_bits.is_empty() {
        let data = pdo_category(0x1600, config.rx_pdo_sm, &config.rx_pdo_bits, 0x7000);

        push_category(&mut eeprom, &mut next_word, 51, &data);
    }

    // End marker
    set_word(&mut eeprom, next_word, 0xffff);

    eeprom
}

pub struct SimBus {
    slaves: Vec<SimSlave>,
    queue: VecDeque<Vec<u8>>,
    /// Frames processed since creation.
    pub frames: u64,
}

impl SimBus {
    fn new(configs: Vec<SimSlaveConfig>) -> Self {
        Self {
            slaves: configs.into_iter().map(SimSlave::new).collect(),
            queue: VecDeque::new(),
            frames: 0,
        }
    }

    fn online_count(&self) -> usize {
        self.slaves.iter().filter(|s| !s.offline).count()
    }

    fn process_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut response = frame.to_vec();

        self.frames += 1;

        // Refresh DL status: port 0 towards the master, port 1 open when a
        // further slave is connected downstream
        let online: Vec<usize> = (0..self.slaves.len())
            .filter(|&i| !self.slaves[i].offline)
            .collect();

        for (rank, &i) in online.iter().enumerate() {
            let mut status = 0x0200u16;

            if rank + 1 < online.len() {
                status |= 0x0800;
            }

            self.slaves[i].dl_status = status;
        }

        let mut offset = ETH_HEADER + ECAT_HEADER;

        loop {
            if offset + PDU_HEADER + 2 > response.len() {
                break;
            }

            let command = response[offset];
            let flags = u16::from_le_bytes([response[offset + 6], response[offset + 7]]);
            let data_len = usize::from(flags & 0x07ff);

            let payload_at = offset + PDU_HEADER;
            let wkc_at = payload_at + data_len;

            let more = flags & 0x8000 != 0;

            self.process_datagram(command, offset, payload_at, data_len, &mut response);

            if !more {
                break;
            }

            offset = wkc_at + 2;
        }

        response
    }

    fn process_datagram(
        &mut self,
        command: u8,
        header_at: usize,
        payload_at: usize,
        data_len: usize,
        frame: &mut Vec<u8>,
    ) {
        let adp = u16::from_le_bytes([frame[header_at + 2], frame[header_at + 3]]);
        let ado = usize::from(u16::from_le_bytes([frame[header_at + 4], frame[header_at + 5]]));
        let logical = u32::from_le_bytes([
            frame[header_at + 2],
            frame[header_at + 3],
            frame[header_at + 4],
            frame[header_at + 5],
        ]);

        let wkc_at = payload_at + data_len;

        let mut wkc = u16::from_le_bytes([frame[wkc_at], frame[wkc_at + 1]]);

        let mut payload = frame[payload_at..payload_at + data_len].to_vec();

        let mut position_counter = adp;
        let mut adp_increments = 0u16;

        for (chain_position, slave) in self.slaves.iter_mut().enumerate() {
            let _ = chain_position;

            if slave.offline {
                continue;
            }

            match command {
                // NOP
                0x00 => (),

                // APRD / APWR / APRW
                0x01 | 0x02 | 0x03 => {
                    if position_counter == 0 {
                        match command {
                            0x01 => {
                                slave.read(ado, &mut payload);
                                wkc += 1;
                            }
                            0x02 => {
                                slave.write(ado, &payload);
                                wkc += 1;
                            }
                            _ => {
                                let mut old = payload.clone();

                                slave.read(ado, &mut old);
                                slave.write(ado, &payload);
                                payload = old;
                                wkc += 3;
                            }
                        }
                    }

                    position_counter = position_counter.wrapping_add(1);
                    adp_increments += 1;
                }

                // FPRD / FPWR / FPRW
                0x04 | 0x05 | 0x06 => {
                    if slave.mem16(0x0010) == adp {
                        match command {
                            0x04 => {
                                slave.read(ado, &mut payload);
                                wkc += 1;
                            }
                            0x05 => {
                                slave.write(ado, &payload);
                                wkc += 1;
                            }
                            _ => {
                                let mut old = payload.clone();

                                slave.read(ado, &mut old);
                                slave.write(ado, &payload);
                                payload = old;
                                wkc += 3;
                            }
                        }
                    }
                }

                // BRD / BWR / BRW
                0x07 | 0x08 | 0x09 => {
                    match command {
                        0x07 => {
                            let mut local = vec![0u8; payload.len()];

                            slave.read(ado, &mut local);

                            for (dst, src) in payload.iter_mut().zip(local.iter()) {
                                *dst |= *src;
                            }

                            wkc += 1;
                        }
                        0x08 => {
                            slave.write(ado, &payload);
                            wkc += 1;
                        }
                        _ => {
                            slave.write(ado, &payload);
                            wkc += 3;
                        }
                    }

                    adp_increments += 1;
                }

                // LRD / LWR / LRW
                0x0a | 0x0b | 0x0c => {
                    let do_read = command != 0x0b;
                    let do_write = command != 0x0a;

                    let (read_hit, write_hit) =
                        slave.logical_access(logical, &mut payload, do_read, do_write);

                    if command == 0x0c {
                        // LRW: reads count once, writes twice
                        wkc += u16::from(read_hit) + 2 * u16::from(write_hit);
                    } else {
                        wkc += u16::from(read_hit || write_hit);
                    }
                }

                // ARMW / FRMW
                0x0d | 0x0e => {
                    let matches = if command == 0x0d {
                        let hit = position_counter == 0;

                        position_counter = position_counter.wrapping_add(1);
                        adp_increments += 1;

                        hit
                    } else {
                        slave.mem16(0x0010) == adp
                    };

                    if matches {
                        slave.read(ado, &mut payload);
                    } else {
                        slave.write(ado, &payload);
                    }

                    wkc += 1;
                }

                _ => (),
            }
        }

        frame[payload_at..payload_at + data_len].copy_from_slice(&payload);
        frame[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());

        // Position addressed commands pass through every slave's counter
        if adp_increments > 0 && matches!(command, 0x01 | 0x02 | 0x03 | 0x07 | 0x08 | 0x09 | 0x0d)
        {
            let new_adp = adp.wrapping_add(adp_increments);

            frame[header_at + 2..header_at + 4].copy_from_slice(&new_adp.to_le_bytes());
        }
    }
}

/// Shared handle to inspect and perturb the emulated segment from tests.
#[derive(Clone)]
pub struct SimHandle {
    bus: Arc<Mutex<SimBus>>,
}

#[allow(dead_code)]
impl SimHandle {
    /// Raw slave memory, e.g. to observe process outputs landing.
    pub fn slave_mem(&self, slave: usize, addr: usize, len: usize) -> Vec<u8> {
        let bus = self.bus.lock().unwrap();

        bus.slaves[slave].mem[addr..addr + len].to_vec()
    }

    /// Write raw slave memory, e.g. to present input process data.
    pub fn set_slave_mem(&self, slave: usize, addr: usize, data: &[u8]) {
        let mut bus = self.bus.lock().unwrap();

        bus.slaves[slave].mem[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Force a SAFE-OP + ERROR condition with the given AL status code.
    pub fn inject_error(&self, slave: usize, code: u16) {
        let mut bus = self.bus.lock().unwrap();

        bus.slaves[slave].al_state = 0x04;
        bus.slaves[slave].al_error = true;
        bus.slaves[slave].al_code = code;
    }

    /// Current AL state byte.
    pub fn al_state(&self, slave: usize) -> u8 {
        self.bus.lock().unwrap().slaves[slave].al_state
    }

    /// Unplug or replug a slave.
    pub fn set_offline(&self, slave: usize, offline: bool) {
        self.bus.lock().unwrap().slaves[slave].offline = offline;
    }

    /// Simulate a power cycle: volatile configuration and the station
    /// address are lost.
    pub fn power_cycle(&self, slave: usize) {
        self.bus.lock().unwrap().slaves[slave].power_cycle();
    }

    /// Replace the identity a slave reports from its EEPROM, emulating a
    /// different device appearing at the same chain position.
    pub fn swap_identity(&self, slave: usize, vendor: u32, product: u32) {
        let mut bus = self.bus.lock().unwrap();
        let eeprom = &mut bus.slaves[slave].eeprom;

        eeprom[0x10..0x12].copy_from_slice(&(vendor as u16).to_le_bytes());
        eeprom[0x12..0x14].copy_from_slice(&((vendor >> 16) as u16).to_le_bytes());
        eeprom[0x14..0x16].copy_from_slice(&(product as u16).to_le_bytes());
        eeprom[0x16..0x18].copy_from_slice(&((product >> 16) as u16).to_le_bytes());
    }

    /// FoE statistics of a slave.
    pub fn foe_stats(&self, slave: usize) -> FoeStats {
        self.bus.lock().unwrap().slaves[slave].foe.clone()
    }

    /// Bytes of the last file written through FoE.
    pub fn foe_file(&self, slave: usize) -> Vec<u8> {
        self.bus.lock().unwrap().slaves[slave].foe_file.clone()
    }

    /// Frames the bus has processed.
    pub fn frame_count(&self) -> u64 {
        self.bus.lock().unwrap().frames
    }

    /// Number of slaves currently answering.
    pub fn online_count(&self) -> usize {
        self.bus.lock().unwrap().online_count()
    }
}

/// The [`Link`] side of the emulated segment.
pub struct SimLink {
    bus: Arc<Mutex<SimBus>>,
}

impl Link for SimLink {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        let mut bus = self.bus.lock().unwrap();

        let response = bus.process_frame(frame);

        bus.queue.push_back(response);

        Ok(())
    }

    fn receive(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
        let mut bus = self.bus.lock().unwrap();

        if let Some(frame) = bus.queue.pop_front() {
            let len = frame.len().min(buf.len());

            buf[..len].copy_from_slice(&frame[..len]);

            Ok(len)
        } else {
            Err(Error::Timeout)
        }
    }
}

/// Build an emulated segment from slave descriptions.
pub fn sim_segment(configs: Vec<SimSlaveConfig>) -> (SimLink, SimHandle) {
    let bus = Arc::new(Mutex::new(SimBus::new(configs)));

    (
        SimLink { bus: bus.clone() },
        SimHandle { bus },
    )
}
