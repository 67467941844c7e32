//! The cyclic process data exchange.
//!
//! `send_process_data` builds one logical datagram per mapped segment (an
//! LRW, or an LWR/LRD pair for groups containing LRW-blocked slaves), packs
//! segments into as few frames as possible and transmits without waiting.
//! `receive_process_data` matches the responses, copies read data back into
//! the IO map without disturbing the output region, accumulates the working
//! counter and captures the reference clock time from the piggy-backed
//! distribution datagram.

use crate::{
    command::Command,
    error::Error,
    frame::PduIter,
    link::Link,
    master::Master,
    register::RegisterAddress,
    MAX_FRAME_LEN, MAX_GROUPS,
};
use core::time::Duration;
use std::sync::atomic::Ordering;

/// Maximum datagrams packed into one cyclic frame.
const MAX_PDUS_PER_FRAME: usize = 8;
/// Maximum cyclic frames in flight per master.
const MAX_PENDING: usize = 128;

/// One cyclic datagram awaiting its response.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct PendingPdu {
    /// Offset of the covered logical window from the group's start.
    logical_offset: u32,
    /// Bytes covered.
    len: u32,
    /// The trailing DC distribution datagram rather than process data.
    is_dc_tail: bool,
    /// An LWR carrying outputs only; its response holds no input data.
    is_write_only: bool,
}

/// One cyclic frame awaiting its response.
#[derive(Debug, Default)]
pub(crate) struct PendingFrame {
    index: u8,
    group: u8,
    pdus: heapless::Vec<PendingPdu, MAX_PDUS_PER_FRAME>,
}

pub(crate) type PendingFrames = heapless::Vec<PendingFrame, MAX_PENDING>;

impl<L: Link> Master<L> {
    /// Send the cyclic output data of group 0.
    pub fn send_process_data(&self, io_map: &mut [u8]) -> Result<(), Error> {
        self.send_process_data_group(io_map, 0)
    }

    /// Receive the cyclic input data of group 0, returning the summed
    /// working counter.
    pub fn receive_process_data(&self, io_map: &mut [u8], timeout: Duration) -> Result<u16, Error> {
        self.receive_process_data_group(io_map, 0, timeout)
    }

    /// Send the cyclic output data of a group.
    ///
    /// `io_map` must be the buffer mapped by
    /// [`config_map_group`](Self::config_map_group) for this group. The call
    /// does not block on responses; pair it with
    /// [`receive_process_data_group`](Self::receive_process_data_group).
    pub fn send_process_data_group(&self, io_map: &mut [u8], group: u8) -> Result<(), Error> {
        if usize::from(group) >= MAX_GROUPS {
            return Ok(());
        }

        let grp = &self.groups[usize::from(group)];
        let image_size = grp.io_map_size();

        if image_size == 0 {
            return Ok(());
        }

        if io_map.len() < image_size {
            return Err(Error::IoMapTooSmall {
                required: image_size,
                provided: io_map.len(),
            });
        }

        let log_start = grp.logical_start_address;

        // The DC distribution datagram rides in the first frame when a
        // reference clock is configured for this group
        let mut dc_reference = if grp.has_dc { self.dc_reference() } else { None };

        let dc_image = [0u8; 8];

        if grp.block_lrw > 0 {
            // Split exchange: outputs via LWR, inputs via LRD
            let output_bytes = grp.output_bytes as usize;
            let input_bytes = grp.input_bytes as usize;

            let mut offset = 0usize;

            while offset < output_bytes {
                let chunk = (output_bytes - offset).min(crate::MAX_LRW_DATA);

                let command = Command::lwr(log_start + offset as u32);

                self.send_cyclic_frame(
                    group,
                    &[(command, &io_map[offset..offset + chunk])],
                    &[PendingPdu {
                        logical_offset: offset as u32,
                        len: chunk as u32,
                        is_dc_tail: false,
                        is_write_only: true,
                    }],
                )?;

                offset += chunk;
            }

            let mut offset = 0usize;

            while offset < input_bytes || (offset == 0 && dc_reference.is_some()) {
                let chunk = (input_bytes - offset).min(crate::MAX_LRW_DATA);

                let logical = grp.output_bytes + offset as u32;
                let command = Command::lrd(log_start + logical);

                let zeros = [0u8; crate::MAX_LRW_DATA];

                let mut commands: heapless::Vec<(Command, &[u8]), 2> = heapless::Vec::new();
                let mut pdus: heapless::Vec<PendingPdu, 2> = heapless::Vec::new();

                let _ = commands.push((command, &zeros[..chunk]));
                let _ = pdus.push(PendingPdu {
                    logical_offset: logical,
                    len: chunk as u32,
                    is_dc_tail: false,
                    is_write_only: false,
                });

                if let Some(reference) = dc_reference.take() {
                    let _ = commands.push((
                        Command::frmw(reference, RegisterAddress::DcSystemTime.into()),
                        &dc_image,
                    ));
                    let _ = pdus.push(PendingPdu {
                        logical_offset: 0,
                        len: 8,
                        is_dc_tail: true,
                        is_write_only: false,
                    });
                }

                self.send_cyclic_frame(group, &commands, &pdus)?;

                offset += chunk;

                if input_bytes == 0 {
                    break;
                }
            }

            return Ok(());
        }

        // LRW exchange: one datagram per mapped segment, several segments
        // per frame where they fit
        let mut commands: heapless::Vec<(Command, &[u8]), MAX_PDUS_PER_FRAME> =
            heapless::Vec::new();
        let mut pdus: heapless::Vec<PendingPdu, MAX_PDUS_PER_FRAME> = heapless::Vec::new();

        let mut offset = 0usize;

        for (segment_no, segment) in grp.io_segments.iter().enumerate() {
            let len = *segment as usize;

            // In sequential mode the buffer offset equals the logical offset;
            // the overlap window never exceeds the buffer because inputs are
            // stored behind the outputs
            let payload = &io_map[offset..offset + len];

            let fits = pdus.len() < MAX_PDUS_PER_FRAME - 1
                && crate::port::Port::<L>::fits_in_frame(
                    pdus.iter()
                        .map(|p| p.len as usize)
                        .chain([len])
                        .chain(dc_reference.map(|_| 8)),
                );

            if !fits && !pdus.is_empty() {
                self.send_cyclic_frame(group, &commands, &pdus)?;

                commands.clear();
                pdus.clear();
            }

            let command = Command::lrw(log_start + offset as u32);

            let _ = commands.push((command, payload));
            let _ = pdus.push(PendingPdu {
                logical_offset: offset as u32,
                len: len as u32,
                is_dc_tail: false,
                is_write_only: false,
            });

            // The distribution datagram joins the first frame
            if segment_no == 0 {
                if let Some(reference) = dc_reference.take() {
                    let _ = commands.push((
                        Command::frmw(reference, RegisterAddress::DcSystemTime.into()),
                        &dc_image,
                    ));
                    let _ = pdus.push(PendingPdu {
                        logical_offset: 0,
                        len: 8,
                        is_dc_tail: true,
                        is_write_only: false,
                    });
                }
            }

            offset += len;
        }

        if !pdus.is_empty() {
            self.send_cyclic_frame(group, &commands, &pdus)?;
        }

        Ok(())
    }

    fn send_cyclic_frame(
        &self,
        group: u8,
        commands: &[(Command, &[u8])],
        pdus: &[PendingPdu],
    ) -> Result<(), Error> {
        let index = self.port.send_frame(commands, self.timeouts.pdu)?;

        let mut entry = PendingFrame {
            index,
            group,
            pdus: heapless::Vec::new(),
        };

        for pdu in pdus {
            let _ = entry.pdus.push(*pdu);
        }

        let mut pending = self.cyclic_pending.lock().unwrap();

        if pending.push(entry).is_err() {
            // Should not happen: segment count is bounded well below the
            // pending capacity
            return Err(Error::Internal);
        }

        Ok(())
    }

    /// Receive the cyclic input data of a group.
    ///
    /// Copies read data into the IO map's input region, leaving outputs
    /// untouched, captures the DC reference time and returns the summed
    /// working counter of all process datagrams. A missing response abandons
    /// the remaining frames of the group and returns
    /// [`Error::NoFrame`](crate::error::Error::NoFrame).
    pub fn receive_process_data_group(
        &self,
        io_map: &mut [u8],
        group: u8,
        timeout: Duration,
    ) -> Result<u16, Error> {
        if usize::from(group) >= MAX_GROUPS {
            return Ok(0);
        }

        let grp = &self.groups[usize::from(group)];

        // Drain this group's pending frames
        let mut frames: PendingFrames = heapless::Vec::new();

        {
            let mut pending = self.cyclic_pending.lock().unwrap();

            let mut keep: PendingFrames = heapless::Vec::new();

            while let Some(entry) = pending.pop() {
                if entry.group == group {
                    let _ = frames.push(entry);
                } else {
                    let _ = keep.push(entry);
                }
            }

            *pending = keep;
        }

        if frames.is_empty() {
            return Ok(0);
        }

        let mut wkc_sum = 0u16;
        let mut missed = false;

        for entry in frames.iter() {
            let mut raw = [0u8; MAX_FRAME_LEN];

            let len = match self.port.receive_frame_into(entry.index, &mut raw, timeout) {
                Ok(len) => len,
                Err(Error::NoFrame) | Err(Error::Timeout) => {
                    missed = true;

                    continue;
                }
                Err(e) => return Err(e),
            };

            for (pdu, received) in entry.pdus.iter().zip(PduIter::new(&raw[..len])?) {
                let received = received?;

                if pdu.is_dc_tail {
                    if let Ok(time) = <[u8; 8]>::try_from(received.data) {
                        self.dc_time.store(i64::from_le_bytes(time), Ordering::Relaxed);
                    }

                    continue;
                }

                wkc_sum = wkc_sum.saturating_add(received.working_counter);

                if pdu.is_write_only {
                    continue;
                }

                self.copy_back_inputs(io_map, group, pdu, received.data);
            }
        }

        if missed {
            grp.flag_state_check();

            return Err(Error::NoFrame);
        }

        if wkc_sum < grp.expected_wkc() {
            grp.flag_state_check();
        }

        Ok(wkc_sum)
    }

    /// Copy the input portion of one returned datagram into the IO map.
    fn copy_back_inputs(&self, io_map: &mut [u8], group: u8, pdu: &PendingPdu, data: &[u8]) {
        let grp = &self.groups[usize::from(group)];

        let window_start = pdu.logical_offset;
        let window_end = window_start + pdu.len;

        if grp.overlapping {
            // Inputs are stored behind the outputs; each slave's window maps
            // back through its recorded offsets
            let output_bytes = grp.output_bytes;

            for rec in self.slaves() {
                if !self.in_group(rec.index, group) {
                    continue;
                }

                let Some((buffer_offset, len)) = rec.inputs() else {
                    continue;
                };

                if len == 0 {
                    continue;
                }

                let logical = buffer_offset as u32 - output_bytes;
                let logical_end = logical + len as u32;

                let copy_start = logical.max(window_start);
                let copy_end = logical_end.min(window_end);

                if copy_start >= copy_end {
                    continue;
                }

                let from = (copy_start - window_start) as usize;
                let count = (copy_end - copy_start) as usize;
                let to = buffer_offset + (copy_start - logical) as usize;

                if let (Some(dst), Some(src)) = (
                    io_map.get_mut(to..to + count),
                    data.get(from..from + count),
                ) {
                    dst.copy_from_slice(src);
                }
            }
        } else {
            // Sequential: the input region simply starts after the outputs;
            // never copy below it so user written outputs survive
            let input_start = grp.output_bytes;
            let input_end = grp.output_bytes + grp.input_bytes;

            let copy_start = window_start.max(input_start);
            let copy_end = window_end.min(input_end);

            if copy_start >= copy_end {
                return;
            }

            let from = (copy_start - window_start) as usize;
            let count = (copy_end - copy_start) as usize;
            let to = copy_start as usize;

            if let (Some(dst), Some(src)) = (
                io_map.get_mut(to..to + count),
                data.get(from..from + count),
            ) {
                dst.copy_from_slice(src);
            }
        }
    }
}
