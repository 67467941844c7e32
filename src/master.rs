//! The master context: the one value owning every piece of per-segment state.

use crate::{
    error::{Error, ErrorItem, Item},
    group::SlaveGroup,
    link::Link,
    port::Port,
    process_data::PendingFrames,
    sii::SiiCache,
    slave::Slave,
    wire::{WireReadSized, WireWrite},
    Timeouts, MAX_ERROR_ITEMS, MAX_GROUPS, MAX_SLAVES,
};
use core::time::Duration;
use std::sync::{
    atomic::{AtomicI64, AtomicU16, Ordering},
    Mutex,
};

/// A compiled-in slave configuration table entry, matched on vendor id and
/// product code during [`config_init`](crate::Master::config_init).
///
/// Used for slaves whose EEPROM carries no usable sync manager or PDO
/// description.
#[derive(Debug, Copy, Clone)]
pub struct SlaveConfigEntry {
    /// SII vendor id to match.
    pub vendor_id: u32,
    /// SII product code to match.
    pub product_code: u32,
    /// Human readable device name.
    pub name: &'static str,
    /// Output process image bits.
    pub output_bits: u16,
    /// Input process image bits.
    pub input_bits: u16,
    /// SM2 physical start address; zero for simple (mailbox-less) slaves.
    pub sm2_address: u16,
    /// SM2 configuration word.
    pub sm2_flags: u32,
    /// SM3 physical start address; zero for simple slaves.
    pub sm3_address: u16,
    /// SM3 configuration word.
    pub sm3_flags: u32,
    /// Activate FMMU slot 0.
    pub fmmu0_active: bool,
    /// Activate FMMU slot 1.
    pub fmmu1_active: bool,
}

/// Master behaviour configuration.
#[derive(Default, Copy, Clone)]
pub struct MasterConfig {
    /// Do not request any automatic state transitions during configuration;
    /// the application sequences INIT → PRE-OP → SAFE-OP itself.
    pub manual_state_change: bool,
    /// Pad every slave's process image to a whole byte boundary even for bit
    /// oriented slaves.
    pub force_byte_alignment: bool,
    /// Compiled-in slave configuration table consulted by
    /// [`config_init`](crate::Master::config_init) when enabled.
    pub config_table: &'static [SlaveConfigEntry],
}

impl core::fmt::Debug for MasterConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MasterConfig")
            .field("manual_state_change", &self.manual_state_change)
            .field("force_byte_alignment", &self.force_byte_alignment)
            .field("config_table", &self.config_table.len())
            .finish()
    }
}

/// A per-slave configuration hook run between PRE-OP and SAFE-OP, typically
/// used for SDO based startup parameters.
pub(crate) type SlaveHook<L> =
    Box<dyn Fn(&Master<L>, u16) -> Result<(), Error> + Send + Sync>;

/// Progress hook for FoE transfers: `(slave, packet_number, bytes_so_far)`.
pub(crate) type FoeHook = Box<dyn Fn(u16, u32, usize) + Send + Sync>;

/// Receive hook for EoE payloads drained by the cyclic mailbox handler:
/// `(slave, raw mailbox payload)`.
pub(crate) type EoeHook = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

/// The EtherCAT master.
///
/// One `Master` owns one segment: the port and its in-flight table, the slave
/// and group lists, the SII cache and the error ring. A process may hold any
/// number of masters; there is no global state.
///
/// Configuration flows (`config_init`, `config_map_group`, `config_dc`) take
/// `&mut self` and must complete before the cyclic exchange starts. Runtime
/// operations (process data, mailbox protocols, state management, recovery)
/// take `&self` so a pinned cyclic thread and a supervisor thread can share
/// the master by reference.
pub struct Master<L> {
    pub(crate) port: Port<L>,
    pub(crate) timeouts: Timeouts,
    pub(crate) config: MasterConfig,
    /// Index 0 is the master pseudo-slave holding segment wide aggregates.
    pub(crate) slaves: heapless::Vec<Slave, MAX_SLAVES>,
    pub(crate) groups: [SlaveGroup; MAX_GROUPS],
    pub(crate) sii: SiiCache,
    pub(crate) error_ring: Mutex<heapless::Deque<ErrorItem, MAX_ERROR_ITEMS>>,
    /// Configured address of the DC reference clock; zero when DC is not
    /// configured.
    pub(crate) dc_reference: AtomicU16,
    /// Reference clock system time captured by the last cyclic exchange.
    pub(crate) dc_time: AtomicI64,
    /// Cyclic frames transmitted but not yet matched to responses.
    pub(crate) cyclic_pending: Mutex<PendingFrames>,
    pub(crate) po2so_hooks: Vec<Option<SlaveHook<L>>>,
    pub(crate) foe_hook: Option<FoeHook>,
    pub(crate) eoe_hook: Option<EoeHook>,
}

impl<L: Link> Master<L> {
    /// Create a new master bound to `link`.
    ///
    /// All buffer pools (frame slots, SII cache, error ring) are sized here;
    /// the cyclic path performs no further allocation.
    pub fn new(link: L, timeouts: Timeouts, config: MasterConfig) -> Self {
        let mut groups: [SlaveGroup; MAX_GROUPS] = Default::default();

        for (index, group) in groups.iter_mut().enumerate() {
            group.logical_start_address = (index as u32) << crate::LOG_GROUP_OFFSET;
        }

        Self {
            port: Port::new(link),
            timeouts,
            config,
            slaves: heapless::Vec::new(),
            groups,
            sii: SiiCache::new(),
            error_ring: Mutex::new(heapless::Deque::new()),
            dc_reference: AtomicU16::new(0),
            dc_time: AtomicI64::new(0),
            cyclic_pending: Mutex::new(heapless::Vec::new()),
            po2so_hooks: Vec::new(),
            foe_hook: None,
            eoe_hook: None,
        }
    }

    /// Number of real slaves discovered by the last `config_init`.
    pub fn slave_count(&self) -> usize {
        self.slaves.len().saturating_sub(1)
    }

    /// The discovered slaves, excluding the master pseudo-slave.
    pub fn slaves(&self) -> &[Slave] {
        self.slaves.get(1..).unwrap_or(&[])
    }

    /// Borrow the slave at 1 based index `slave`.
    pub fn slave(&self, slave: u16) -> Result<&Slave, Error> {
        if slave == 0 {
            return Err(Error::NotFound {
                item: Item::Slave,
                index: Some(0),
            });
        }

        self.slaves.get(usize::from(slave)).ok_or(Error::NotFound {
            item: Item::Slave,
            index: Some(usize::from(slave)),
        })
    }

    pub(crate) fn slave_mut(&mut self, slave: u16) -> Result<&mut Slave, Error> {
        self.slaves
            .get_mut(usize::from(slave))
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(usize::from(slave)),
            })
    }

    /// Borrow a group record.
    ///
    /// # Panics
    ///
    /// Panics if `group >= MAX_GROUPS`.
    pub fn group(&self, group: u8) -> &SlaveGroup {
        &self.groups[usize::from(group)]
    }

    /// Register a per-slave hook run between PRE-OP and SAFE-OP, before the
    /// process data mapping of that slave is read.
    pub fn set_po2so_hook(
        &mut self,
        slave: u16,
        hook: impl Fn(&Master<L>, u16) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        let index = usize::from(slave);

        if self.po2so_hooks.len() <= index {
            self.po2so_hooks.resize_with(index + 1, || None);
        }

        self.po2so_hooks[index] = Some(Box::new(hook));
    }

    /// Register a progress hook for FoE transfers.
    pub fn set_foe_hook(&mut self, hook: impl Fn(u16, u32, usize) + Send + Sync + 'static) {
        self.foe_hook = Some(Box::new(hook));
    }

    /// Register a receive hook for EoE payloads drained by the cyclic mailbox
    /// handler.
    pub fn set_eoe_hook(&mut self, hook: impl Fn(u16, &[u8]) + Send + Sync + 'static) {
        self.eoe_hook = Some(Box::new(hook));
    }

    /// The reference clock system time captured by the last cyclic exchange.
    pub fn dc_time(&self) -> i64 {
        self.dc_time.load(Ordering::Relaxed)
    }

    /// Configured address of the elected DC reference clock, if any.
    pub fn dc_reference(&self) -> Option<u16> {
        match self.dc_reference.load(Ordering::Relaxed) {
            0 => None,
            address => Some(address),
        }
    }

    /// Frames sent and received since the master was created.
    pub fn frame_counters(&self) -> (u64, u64) {
        self.port.counters()
    }

    /// Append an entry to the error ring, dropping the oldest entry when
    /// full.
    pub(crate) fn push_error(&self, item: ErrorItem) {
        let mut ring = self.error_ring.lock().unwrap();

        if ring.is_full() {
            let _ = ring.pop_front();
        }

        // Cannot fail; an entry was just popped if the ring was full
        let _ = ring.push_back(item);
    }

    /// Pop the oldest recorded error, if any.
    pub fn pop_error(&self) -> Option<ErrorItem> {
        self.error_ring.lock().unwrap().pop_front()
    }

    /// Whether any errors are waiting in the ring.
    pub fn has_errors(&self) -> bool {
        !self.error_ring.lock().unwrap().is_empty()
    }

    /// Issue one raw datagram and wait for its response.
    ///
    /// This is the low level escape hatch: any primitive (`BRD`, `APWR`,
    /// `LRW`, `FPRW`, ...) can be built with the [`Command`](crate::Command)
    /// constructors. `data` supplies the transmitted payload and receives the
    /// response payload; the working counter is returned.
    pub fn datagram(
        &self,
        command: crate::Command,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.port.transceive(command, data, timeout)
    }

    /// Issue an LRW with a piggy-backed read of the DC reference clock
    /// (`LRWDC`).
    ///
    /// Returns the working counter of the logical exchange and the reference
    /// clock system time. Fails with
    /// [`DistributedClockError::NoReference`](crate::error::DistributedClockError)
    /// when distributed clocks have not been configured.
    pub fn datagram_dc(
        &self,
        logical_address: u32,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(u16, i64), Error> {
        let reference = self
            .dc_reference()
            .ok_or(Error::DistributedClock(
                crate::error::DistributedClockError::NoReference,
            ))?;

        let (wkc, dc_time) = self.port.lrwdc(logical_address, data, reference, timeout)?;

        self.dc_time.store(dc_time, Ordering::Relaxed);

        Ok((wkc, dc_time))
    }

    // Typed register access helpers used by every layer above the port.

    pub(crate) fn fprd<T: WireReadSized>(
        &self,
        address: u16,
        register: u16,
        timeout: Duration,
    ) -> Result<(T, u16), Error> {
        let mut buf = [0u8; 64];
        let data = &mut buf[..T::PACKED_LEN];

        let wkc = self.port.fprd(address, register, data, timeout)?;

        Ok((T::unpack_from_slice(data)?, wkc))
    }

    pub(crate) fn fpwr<T: WireWrite>(
        &self,
        address: u16,
        register: u16,
        value: T,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let mut buf = [0u8; 64];
        let len = value.packed_len();

        value.pack_to_slice(&mut buf)?;

        self.port.fpwr(address, register, &mut buf[..len], timeout)
    }

    pub(crate) fn aprd<T: WireReadSized>(
        &self,
        position: u16,
        register: u16,
        timeout: Duration,
    ) -> Result<(T, u16), Error> {
        let mut buf = [0u8; 64];
        let data = &mut buf[..T::PACKED_LEN];

        let wkc = self.port.aprd(position, register, data, timeout)?;

        Ok((T::unpack_from_slice(data)?, wkc))
    }

    pub(crate) fn apwr<T: WireWrite>(
        &self,
        position: u16,
        register: u16,
        value: T,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let mut buf = [0u8; 64];
        let len = value.packed_len();

        value.pack_to_slice(&mut buf)?;

        self.port.apwr(position, register, &mut buf[..len], timeout)
    }

    pub(crate) fn brd<T: WireReadSized>(
        &self,
        register: u16,
        timeout: Duration,
    ) -> Result<(T, u16), Error> {
        let mut buf = [0u8; 64];
        let data = &mut buf[..T::PACKED_LEN];

        let wkc = self.port.brd(register, data, timeout)?;

        Ok((T::unpack_from_slice(data)?, wkc))
    }

    pub(crate) fn bwr<T: WireWrite>(
        &self,
        register: u16,
        value: T,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let mut buf = [0u8; 64];
        let len = value.packed_len();

        value.pack_to_slice(&mut buf)?;

        self.port.bwr(register, &mut buf[..len], timeout)
    }

    /// Require a non-zero working counter, mapping zero to a working counter
    /// error.
    pub(crate) fn require_wkc(wkc: u16, expected: u16) -> Result<u16, Error> {
        if wkc >= expected {
            Ok(wkc)
        } else {
            Err(Error::WorkingCounter {
                expected,
                received: wkc,
            })
        }
    }
}
