//! The datagram engine: index allocation, frame transmission and response
//! matching.
//!
//! Each transmitted frame borrows one index from a 256 entry free list; the
//! index byte is stamped into every datagram of the frame and responses are
//! matched on `(index, command)`. Any thread waiting for a response may become
//! the receiver for the whole port: it pulls frames off the link, files them
//! into the in-flight table and wakes the other waiters. This keeps all
//! blocking confined to the link receive call with a caller supplied timeout.

use crate::{
    command::Command,
    error::{Error, PduError},
    frame::{self, PduIter, ETHERNET_HEADER_LEN, FRAME_HEADER_LEN, MIN_FRAME_LEN, PDU_OVERHEAD},
    link::Link,
    register::RegisterAddress,
    MAX_FRAME_LEN,
};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const INDEX_COUNT: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    /// Not in flight; the index is on the free list.
    Free,
    /// A frame with this index has been transmitted and not yet answered.
    InFlight,
    /// A response has been filed and is waiting for its owner to collect it.
    Received,
}

#[derive(Debug, Copy, Clone)]
struct Slot {
    state: SlotState,
    /// Command code of the first datagram, used to reject stale responses.
    command_code: u8,
    /// Length of the received frame.
    len: usize,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            state: SlotState::Free,
            command_code: 0,
            len: 0,
        }
    }
}

struct PortInner {
    /// Free list of datagram indices. Acquiring an index is the
    /// synchronisation point between the cyclic and acyclic threads.
    free: heapless::Vec<u8, INDEX_COUNT>,
    slots: [Slot; INDEX_COUNT],
    /// Received frame bytes, `MAX_FRAME_LEN` per slot, allocated once.
    frames: Vec<u8>,
    /// Set while some thread is blocked in the link receive call.
    rx_claimed: bool,
    /// Frames sent/received since the port was created.
    tx_count: u64,
    rx_count: u64,
}

impl PortInner {
    /// File a received frame into the slot its index names.
    fn dispatch(&mut self, raw: &[u8]) {
        // cmd and idx of the first datagram sit straight after the headers
        let Some(&[command_code, index]) =
            raw.get(ETHERNET_HEADER_LEN + FRAME_HEADER_LEN..ETHERNET_HEADER_LEN + FRAME_HEADER_LEN + 2)
        else {
            return;
        };

        if raw.get(12..14) != Some(&crate::ETHERCAT_ETHERTYPE.to_be_bytes()[..]) {
            // Not EtherCAT. The link driver is meant to filter these out but
            // a promiscuous socket will hand us anything.
            return;
        }

        let slot = &mut self.slots[usize::from(index)];

        match slot.state {
            SlotState::InFlight if slot.command_code == command_code => {
                let len = raw.len().min(MAX_FRAME_LEN);

                let start = usize::from(index) * MAX_FRAME_LEN;

                self.frames[start..start + len].copy_from_slice(&raw[..len]);

                slot.len = len;
                slot.state = SlotState::Received;
                self.rx_count += 1;
            }
            SlotState::InFlight => {
                log::trace!(
                    "Index {} response command {:#04x} does not match sent {:#04x}, discarding",
                    index,
                    command_code,
                    slot.command_code
                );
            }
            SlotState::Received => {
                log::trace!("Duplicate response for index {}, discarding", index);
            }
            SlotState::Free => {
                log::trace!("Stale response for free index {}, discarding", index);
            }
        }
    }
}

/// One datagram of a frame level operation.
pub(crate) struct FramePdu<'a> {
    pub command: Command,
    /// Payload sent with the datagram; overwritten with the response payload.
    pub data: &'a mut [u8],
    /// Working counter of the response, filled in on completion.
    pub wkc: u16,
}

impl<'a> FramePdu<'a> {
    pub fn new(command: Command, data: &'a mut [u8]) -> Self {
        Self {
            command,
            data,
            wkc: 0,
        }
    }
}

/// The link binding: an index stack, an in-flight table and the blocking
/// send/receive machinery shared by every protocol layer above it.
pub(crate) struct Port<L> {
    link: L,
    inner: Mutex<PortInner>,
    cond: Condvar,
}

impl<L: Link> Port<L> {
    pub fn new(link: L) -> Self {
        let mut free = heapless::Vec::new();

        for idx in 0..INDEX_COUNT {
            // Capacity is exactly INDEX_COUNT
            let _ = free.push(idx as u8);
        }

        Self {
            link,
            inner: Mutex::new(PortInner {
                free,
                slots: [Slot::empty(); INDEX_COUNT],
                frames: vec![0u8; INDEX_COUNT * MAX_FRAME_LEN],
                rx_claimed: false,
                tx_count: 0,
                rx_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Frames sent and received since the port was created.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();

        (inner.tx_count, inner.rx_count)
    }

    /// Borrow an index from the free list, blocking until one frees or the
    /// deadline passes.
    fn acquire_index(&self, command_code: u8, deadline: Instant) -> Result<u8, Error> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(index) = inner.free.pop() {
                let slot = &mut inner.slots[usize::from(index)];

                slot.state = SlotState::InFlight;
                slot.command_code = command_code;
                slot.len = 0;

                return Ok(index);
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(Error::Pdu(PduError::IndexExhausted));
            }

            let (guard, _timeout) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .map_err(|_| Error::Internal)?;

            inner = guard;
        }
    }

    /// Return an index to the free list.
    fn release_index(&self, index: u8) {
        let mut inner = self.inner.lock().unwrap();

        inner.slots[usize::from(index)].state = SlotState::Free;

        // Capacity equals index space so this cannot fail
        let _ = inner.free.push(index);

        drop(inner);

        self.cond.notify_all();
    }

    /// Wait until the response frame for `index` has been filed, receiving on
    /// behalf of the whole port when no other thread is doing so.
    ///
    /// On success the frame is copied into `out` and its length returned.
    fn wait_response(&self, index: u8, out: &mut [u8], deadline: Instant) -> Result<usize, Error> {
        let mut scratch = [0u8; MAX_FRAME_LEN];
        let mut inner = self.inner.lock().unwrap();

        loop {
            {
                let slot = &mut inner.slots[usize::from(index)];

                if slot.state == SlotState::Received {
                    let len = slot.len;
                    let start = usize::from(index) * MAX_FRAME_LEN;

                    out[..len].copy_from_slice(&inner.frames[start..start + len]);

                    return Ok(len);
                }
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(Error::NoFrame);
            }

            let remaining = deadline - now;

            if inner.rx_claimed {
                let (guard, _timeout) = self
                    .cond
                    .wait_timeout(inner, remaining)
                    .map_err(|_| Error::Internal)?;

                inner = guard;
            } else {
                inner.rx_claimed = true;

                drop(inner);

                let received = self.link.receive(&mut scratch, remaining);

                inner = self.inner.lock().unwrap();
                inner.rx_claimed = false;

                match received {
                    Ok(len) => inner.dispatch(&scratch[..len]),
                    Err(Error::Timeout) => (),
                    Err(e) => {
                        drop(inner);

                        self.cond.notify_all();

                        return Err(e);
                    }
                }

                // Wake both response waiters and threads queueing for the
                // receiver role.
                self.cond.notify_all();
            }
        }
    }

    /// Send a frame of one or more datagrams and wait for the matching
    /// response, copying response payloads and working counters back into
    /// `pdus`.
    pub fn transceive_frame(&self, pdus: &mut [FramePdu<'_>], timeout: Duration) -> Result<(), Error> {
        let Some(first) = pdus.first() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;

        let index = self.acquire_index(first.command.code(), deadline)?;

        let result = self.transceive_frame_inner(index, pdus, deadline);

        self.release_index(index);

        result
    }

    fn transceive_frame_inner(
        &self,
        index: u8,
        pdus: &mut [FramePdu<'_>],
        deadline: Instant,
    ) -> Result<(), Error> {
        let mut tx = [0u8; MAX_FRAME_LEN];

        let mut len = frame::setup_datagram(&mut tx, pdus[0].command, index, pdus[0].data)?;

        for pdu in pdus[1..].iter() {
            len = frame::add_datagram(&mut tx, len, pdu.command, index, pdu.data)?;
        }

        // Pad to the Ethernet minimum; the buffer was zeroed at creation but
        // may hold stale bytes from frame assembly bookkeeping.
        if len < MIN_FRAME_LEN {
            tx[len..MIN_FRAME_LEN].fill(0);
            len = MIN_FRAME_LEN;
        }

        self.link.send(&tx[..len])?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.tx_count += 1;
        }

        let mut rx = [0u8; MAX_FRAME_LEN];

        let rx_len = self.wait_response(index, &mut rx, deadline)?;

        let mut parsed = 0;

        for (pdu, received) in pdus.iter_mut().zip(PduIter::new(&rx[..rx_len])?) {
            let received = received?;

            if received.command_code != pdu.command.code() {
                return Err(Error::Pdu(PduError::Validation(
                    crate::error::PduValidationError::CommandMismatch {
                        sent: pdu.command,
                        received: received.command()?,
                    },
                )));
            }

            if received.data.len() != pdu.data.len() {
                return Err(Error::Pdu(PduError::Decode));
            }

            pdu.data.copy_from_slice(received.data);
            pdu.wkc = received.working_counter;

            parsed += 1;
        }

        if parsed != pdus.len() {
            return Err(Error::Pdu(PduError::Decode));
        }

        Ok(())
    }

    /// Build and transmit a frame without waiting for the response.
    ///
    /// Returns the borrowed frame index; the caller must hand it back through
    /// [`receive_frame_into`](Self::receive_frame_into), which also releases
    /// it on timeout. Used by the cyclic path to keep several frames in
    /// flight.
    pub fn send_frame(
        &self,
        pdus: &[(Command, &[u8])],
        timeout: Duration,
    ) -> Result<u8, Error> {
        let Some((first_command, _)) = pdus.first() else {
            return Err(Error::Internal);
        };

        let deadline = Instant::now() + timeout;

        let index = self.acquire_index(first_command.code(), deadline)?;

        let result = (|| {
            let mut tx = [0u8; MAX_FRAME_LEN];

            let mut len = frame::setup_datagram(&mut tx, pdus[0].0, index, pdus[0].1)?;

            for (command, data) in pdus[1..].iter() {
                len = frame::add_datagram(&mut tx, len, *command, index, data)?;
            }

            if len < MIN_FRAME_LEN {
                tx[len..MIN_FRAME_LEN].fill(0);
                len = MIN_FRAME_LEN;
            }

            self.link.send(&tx[..len])?;

            let mut inner = self.inner.lock().unwrap();
            inner.tx_count += 1;

            Ok(())
        })();

        match result {
            Ok(()) => Ok(index),
            Err(e) => {
                self.release_index(index);

                Err(e)
            }
        }
    }

    /// Wait for the response to a frame sent with [`send_frame`](Self::send_frame)
    /// and copy the raw Ethernet frame into `out`.
    ///
    /// The index is returned to the free list whether or not a response
    /// arrived.
    pub fn receive_frame_into(
        &self,
        index: u8,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;

        let result = self.wait_response(index, out, deadline);

        self.release_index(index);

        result
    }

    /// Send a single datagram and wait for its response.
    ///
    /// `data` supplies the transmitted payload and receives the response
    /// payload; the working counter is returned.
    pub fn transceive(
        &self,
        command: Command,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        let mut pdus = [FramePdu::new(command, data)];

        self.transceive_frame(&mut pdus, timeout)?;

        Ok(pdus[0].wkc)
    }

    /// Broadcast read.
    pub fn brd(&self, register: u16, data: &mut [u8], timeout: Duration) -> Result<u16, Error> {
        self.transceive(Command::brd(register), data, timeout)
    }

    /// Broadcast write.
    pub fn bwr(&self, register: u16, data: &mut [u8], timeout: Duration) -> Result<u16, Error> {
        self.transceive(Command::bwr(register), data, timeout)
    }

    /// Auto increment read from the slave at `position` (0 based).
    pub fn aprd(
        &self,
        position: u16,
        register: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.transceive(Command::aprd(position, register), data, timeout)
    }

    /// Auto increment write to the slave at `position` (0 based).
    pub fn apwr(
        &self,
        position: u16,
        register: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.transceive(Command::apwr(position, register), data, timeout)
    }

    /// Configured address read.
    pub fn fprd(
        &self,
        address: u16,
        register: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.transceive(Command::fprd(address, register), data, timeout)
    }

    /// Configured address write.
    pub fn fpwr(
        &self,
        address: u16,
        register: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.transceive(Command::fpwr(address, register), data, timeout)
    }

    /// Configured address read, multiple write.
    pub fn frmw(
        &self,
        address: u16,
        register: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        self.transceive(Command::frmw(address, register), data, timeout)
    }

    /// Logical read-write with a piggy-backed FRMW distributing the reference
    /// clock's system time to all slaves.
    ///
    /// Returns the LRW working counter and the reference clock time.
    pub fn lrwdc(
        &self,
        address: u32,
        data: &mut [u8],
        dc_ref_address: u16,
        timeout: Duration,
    ) -> Result<(u16, i64), Error> {
        let mut dc_time = [0u8; 8];
        let wkc;

        {
            let mut pdus = [
                FramePdu::new(Command::lrw(address), data),
                FramePdu::new(
                    Command::frmw(dc_ref_address, RegisterAddress::DcSystemTime.into()),
                    &mut dc_time,
                ),
            ];

            self.transceive_frame(&mut pdus, timeout)?;

            wkc = pdus[0].wkc;
        }

        Ok((wkc, i64::from_le_bytes(dc_time)))
    }

    /// Frame capacity check for callers packing several PDUs into one frame.
    pub fn fits_in_frame(payload_lengths: impl Iterator<Item = usize>) -> bool {
        let total: usize = payload_lengths.map(|len| len + PDU_OVERHEAD).sum();

        ETHERNET_HEADER_LEN + FRAME_HEADER_LEN + total <= MAX_FRAME_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A link that loops every sent frame straight back, bumping the working
    /// counter of each datagram by a fixed amount.
    struct LoopbackLink {
        queue: StdMutex<Vec<Vec<u8>>>,
        wkc_bump: u16,
    }

    impl LoopbackLink {
        fn new(wkc_bump: u16) -> Self {
            Self {
                queue: StdMutex::new(Vec::new()),
                wkc_bump,
            }
        }
    }

    impl Link for LoopbackLink {
        fn send(&self, frame: &[u8]) -> Result<(), Error> {
            let mut frame = frame.to_vec();

            // Walk the datagrams, bumping each WKC.
            let mut offset = ETHERNET_HEADER_LEN + FRAME_HEADER_LEN;

            loop {
                let flags = u16::from_le_bytes([frame[offset + 6], frame[offset + 7]]);
                let len = usize::from(flags & 0x07ff);
                let wkc_at = offset + 10 + len;

                let wkc = u16::from_le_bytes([frame[wkc_at], frame[wkc_at + 1]]) + self.wkc_bump;

                frame[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());

                if flags & 0x8000 == 0 {
                    break;
                }

                offset = wkc_at + 2;
            }

            self.queue.lock().unwrap().push(frame);

            Ok(())
        }

        fn receive(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
            let mut queue = self.queue.lock().unwrap();

            if let Some(frame) = queue.pop() {
                buf[..frame.len()].copy_from_slice(&frame);

                Ok(frame.len())
            } else {
                Err(Error::Timeout)
            }
        }
    }

    /// A link that never responds.
    struct DeafLink;

    impl Link for DeafLink {
        fn send(&self, _frame: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        fn receive(&self, _buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));

            Err(Error::Timeout)
        }
    }

    #[test]
    fn single_transceive_returns_wkc() {
        let port = Port::new(LoopbackLink::new(2));

        let mut data = [0u8; 2];

        let wkc = port
            .brd(0x0000, &mut data, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 2);
    }

    #[test]
    fn multi_pdu_frame_fills_all_wkcs() {
        let port = Port::new(LoopbackLink::new(1));

        let mut a = [0u8; 4];
        let mut b = [0u8; 8];

        let mut pdus = [
            FramePdu::new(Command::lrw(0), &mut a),
            FramePdu::new(Command::frmw(0x1001, 0x0910), &mut b),
        ];

        port.transceive_frame(&mut pdus, Duration::from_millis(10))
            .unwrap();

        assert_eq!(pdus[0].wkc, 1);
        assert_eq!(pdus[1].wkc, 1);
    }

    #[test]
    fn timeout_returns_no_frame_and_frees_index() {
        let port = Port::new(DeafLink);

        let mut data = [0u8; 2];

        assert_eq!(
            port.brd(0x0000, &mut data, Duration::from_millis(2)),
            Err(Error::NoFrame)
        );

        // All indices should be back on the free list.
        let inner = port.inner.lock().unwrap();

        assert_eq!(inner.free.len(), INDEX_COUNT);
        assert!(inner.slots.iter().all(|s| s.state == SlotState::Free));
    }

    #[test]
    fn indices_are_unique_while_in_flight() {
        let port = Port::new(DeafLink);

        let deadline = Instant::now() + Duration::from_millis(5);

        let mut taken = Vec::new();

        for _ in 0..INDEX_COUNT {
            taken.push(port.acquire_index(0x07, deadline).unwrap());
        }

        let mut sorted = taken.clone();
        sorted.sort_unstable();
        sorted.dedup();

        assert_eq!(sorted.len(), INDEX_COUNT);

        // Exhausted now
        assert_eq!(
            port.acquire_index(0x07, Instant::now() + Duration::from_millis(2)),
            Err(Error::Pdu(PduError::IndexExhausted))
        );

        // Freeing one unblocks acquisition
        port.release_index(taken[0]);

        assert!(port
            .acquire_index(0x07, Instant::now() + Duration::from_millis(2))
            .is_ok());
    }
}
