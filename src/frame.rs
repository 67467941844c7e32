//! EtherCAT frame layout: Ethernet II framing, the EtherCAT frame header and
//! datagram (PDU) headers, plus in-place frame assembly.

use crate::{
    command::Command,
    error::{Error, PduError},
    wire::{WireError, WireRead, WireReadSized, WireWrite},
    BROADCAST_ADDR, ETHERCAT_ETHERTYPE, LEN_MASK, MASTER_ADDR,
};

/// Length of an Ethernet II header: two MACs plus the EtherType.
pub(crate) const ETHERNET_HEADER_LEN: usize = 14;
/// Length of the EtherCAT frame header.
pub(crate) const FRAME_HEADER_LEN: usize = 2;
/// Length of a datagram header: cmd, idx, 4 address bytes, len/flags, IRQ.
pub(crate) const PDU_HEADER_LEN: usize = 10;
/// Length of the trailing working counter.
pub(crate) const WKC_LEN: usize = 2;
/// Fixed per-datagram overhead.
pub(crate) const PDU_OVERHEAD: usize = PDU_HEADER_LEN + WKC_LEN;
/// Minimum Ethernet frame length on the wire (excluding FCS).
pub(crate) const MIN_FRAME_LEN: usize = 60;

/// First payload byte of the first datagram in a frame.
pub(crate) const FIRST_PDU_PAYLOAD: usize =
    ETHERNET_HEADER_LEN + FRAME_HEADER_LEN + PDU_HEADER_LEN;

/// The EtherCAT frame header: 11 bits of payload length, a reserved bit and a
/// 4 bit protocol type.
///
/// Only protocol type 1 (DL PDUs) is produced or accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub payload_len: u16,
}

const PROTOCOL_DL_PDU: u16 = 0x01;

impl WireWrite for FrameHeader {
    fn packed_len(&self) -> usize {
        FRAME_HEADER_LEN
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.payload_len & LEN_MASK) | (PROTOCOL_DL_PDU << 12);

        raw.pack_to_slice_unchecked(buf)
    }
}

impl WireRead for FrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        if raw >> 12 != PROTOCOL_DL_PDU {
            return Err(WireError::InvalidValue);
        }

        Ok(Self {
            payload_len: raw & LEN_MASK,
        })
    }
}

/// PDU `LEN`, `C` (circulating) and `NEXT` (more follows) fields.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PduFlags {
    /// Data length of this PDU.
    pub length: u16,
    /// The frame has circulated once already.
    pub circulated: bool,
    /// Another PDU follows this one in the same frame.
    pub more_follows: bool,
}

impl PduFlags {
    pub const fn with_len(length: u16) -> Self {
        Self {
            length,
            circulated: false,
            more_follows: false,
        }
    }
}

impl WireWrite for PduFlags {
    fn packed_len(&self) -> usize {
        2
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.length & LEN_MASK)
            | (self.circulated as u16) << 14
            | (self.more_follows as u16) << 15;

        raw.pack_to_slice_unchecked(buf)
    }
}

impl WireRead for PduFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: raw >> 14 & 0x01 == 0x01,
            more_follows: raw >> 15 & 0x01 == 0x01,
        })
    }
}

impl WireReadSized for PduFlags {
    const PACKED_LEN: usize = 2;
}

/// Write the fixed Ethernet II header: broadcast destination, the master's
/// source MAC and the EtherCAT EtherType (big endian, unlike everything after
/// it).
fn write_ethernet_header(buf: &mut [u8]) {
    buf[0..6].copy_from_slice(&BROADCAST_ADDR);
    buf[6..12].copy_from_slice(&MASTER_ADDR);
    buf[12..14].copy_from_slice(&ETHERCAT_ETHERTYPE.to_be_bytes());
}

/// Initialise `buf` with a frame containing exactly one datagram.
///
/// Returns the total frame length in bytes, before padding to
/// [`MIN_FRAME_LEN`].
pub(crate) fn setup_datagram(
    buf: &mut [u8],
    command: Command,
    index: u8,
    data: &[u8],
) -> Result<usize, Error> {
    if data.len() > crate::MAX_LRW_DATA {
        return Err(Error::Pdu(PduError::TooLong));
    }

    let total = FIRST_PDU_PAYLOAD + data.len() + WKC_LEN;

    if buf.len() < total {
        return Err(Error::Pdu(PduError::TooLong));
    }

    write_ethernet_header(buf);

    FrameHeader {
        payload_len: (PDU_OVERHEAD + data.len()) as u16,
    }
    .pack_to_slice_unchecked(&mut buf[ETHERNET_HEADER_LEN..]);

    write_pdu(
        &mut buf[ETHERNET_HEADER_LEN + FRAME_HEADER_LEN..],
        command,
        index,
        false,
        data,
    );

    Ok(total)
}

/// Append a datagram to a frame previously created with [`setup_datagram`],
/// setting the more-follows flag on the previous datagram.
///
/// `len` is the current frame length as returned by the previous assembly
/// call. Returns the new total frame length.
pub(crate) fn add_datagram(
    buf: &mut [u8],
    len: usize,
    command: Command,
    index: u8,
    data: &[u8],
) -> Result<usize, Error> {
    if data.len() > crate::MAX_LRW_DATA {
        return Err(Error::Pdu(PduError::TooLong));
    }

    let added = PDU_OVERHEAD + data.len();
    let total = len + added;

    // The EtherCAT header length field is 11 bits; anything longer than the
    // Ethernet MTU can't be represented, let alone sent.
    if buf.len() < total || (total - ETHERNET_HEADER_LEN - FRAME_HEADER_LEN) > LEN_MASK as usize {
        return Err(Error::Pdu(PduError::TooLong));
    }

    // Flag the current last datagram as "more follows"
    let last = last_pdu_offset(buf, len)?;
    let flags_at = last + 6;
    let mut flags = PduFlags::unpack_from_slice(&buf[flags_at..flags_at + 2])?;
    flags.more_follows = true;
    flags.pack_to_slice_unchecked(&mut buf[flags_at..]);

    write_pdu(&mut buf[len..], command, index, false, data);

    let header_at = ETHERNET_HEADER_LEN;
    let header = FrameHeader::unpack_from_slice(&buf[header_at..])?;

    FrameHeader {
        payload_len: header.payload_len + added as u16,
    }
    .pack_to_slice_unchecked(&mut buf[header_at..]);

    Ok(total)
}

/// Offset of the header of the last datagram currently in the frame.
fn last_pdu_offset(buf: &[u8], len: usize) -> Result<usize, Error> {
    let mut offset = ETHERNET_HEADER_LEN + FRAME_HEADER_LEN;

    loop {
        let flags = PduFlags::unpack_from_slice(
            buf.get(offset + 6..offset + 8)
                .ok_or(Error::Pdu(PduError::Decode))?,
        )?;

        let next = offset + PDU_OVERHEAD + usize::from(flags.length);

        if next >= len {
            return Ok(offset);
        }

        offset = next;
    }
}

fn write_pdu(buf: &mut [u8], command: Command, index: u8, more_follows: bool, data: &[u8]) {
    buf[0] = command.code();
    buf[1] = index;
    buf[2..6].copy_from_slice(&command.address_bytes());

    PduFlags {
        length: data.len() as u16,
        circulated: false,
        more_follows,
    }
    .pack_to_slice_unchecked(&mut buf[6..8]);

    // IRQ
    buf[8..10].fill(0);

    buf[PDU_HEADER_LEN..PDU_HEADER_LEN + data.len()].copy_from_slice(data);

    // WKC starts at zero
    buf[PDU_HEADER_LEN + data.len()..PDU_HEADER_LEN + data.len() + WKC_LEN].fill(0);
}

/// One datagram parsed out of a received frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReceivedPdu<'frame> {
    pub command_code: u8,
    pub index: u8,
    pub address: [u8; 4],
    pub flags: PduFlags,
    pub data: &'frame [u8],
    pub working_counter: u16,
}

impl<'frame> ReceivedPdu<'frame> {
    /// The command this response was generated from.
    pub fn command(&self) -> Result<Command, Error> {
        Command::parse(self.command_code, self.address)
    }
}

/// Iterator over the datagrams of a received EtherCAT frame.
pub(crate) struct PduIter<'frame> {
    payload: &'frame [u8],
    offset: usize,
    done: bool,
}

impl<'frame> PduIter<'frame> {
    /// Parse the headers of a whole Ethernet frame.
    ///
    /// Fails if the frame is not EtherCAT or is malformed.
    pub fn new(frame: &'frame [u8]) -> Result<Self, Error> {
        let ethertype = frame
            .get(12..14)
            .ok_or(Error::Pdu(PduError::Ethernet))?;

        if ethertype != ETHERCAT_ETHERTYPE.to_be_bytes() {
            return Err(Error::Pdu(PduError::Ethernet));
        }

        let header = FrameHeader::unpack_from_slice(&frame[ETHERNET_HEADER_LEN..])
            .map_err(|_| Error::Pdu(PduError::Decode))?;

        let payload = frame
            .get(
                ETHERNET_HEADER_LEN + FRAME_HEADER_LEN
                    ..ETHERNET_HEADER_LEN + FRAME_HEADER_LEN + usize::from(header.payload_len),
            )
            .ok_or(Error::Pdu(PduError::Decode))?;

        Ok(Self {
            payload,
            offset: 0,
            done: false,
        })
    }
}

impl<'frame> Iterator for PduIter<'frame> {
    type Item = Result<ReceivedPdu<'frame>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let rest = self.payload.get(self.offset..)?;

        if rest.len() < PDU_OVERHEAD {
            return None;
        }

        let command_code = rest[0];
        let index = rest[1];

        let mut address = [0u8; 4];
        address.copy_from_slice(&rest[2..6]);

        let flags = match PduFlags::unpack_from_slice(&rest[6..8]) {
            Ok(flags) => flags,
            Err(e) => return Some(Err(e.into())),
        };

        let data_len = usize::from(flags.length);

        let data = match rest.get(PDU_HEADER_LEN..PDU_HEADER_LEN + data_len) {
            Some(data) => data,
            None => return Some(Err(Error::Pdu(PduError::Decode))),
        };

        let working_counter =
            match u16::unpack_from_slice(&rest[PDU_HEADER_LEN + data_len..]) {
                Ok(wkc) => wkc,
                Err(e) => return Some(Err(e.into())),
            };

        self.offset += PDU_OVERHEAD + data_len;
        self.done = !flags.more_follows;

        Some(Ok(ReceivedPdu {
            command_code,
            index,
            address,
            flags,
            data,
            working_counter,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_LRW_DATA;

    #[test]
    fn frame_header_packs() {
        let mut buf = [0u8; 2];

        FrameHeader { payload_len: 0x28 }.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, 0b0001_0000_0010_1000u16.to_le_bytes());
    }

    #[test]
    fn frame_header_parse() {
        // Header from packet #39, soem-slaveinfo-ek1100-only.pcapng
        let raw = [0x3cu8, 0x10];

        let header = FrameHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(header.payload_len, 0x3c);
    }

    #[test]
    fn pdu_flags_round_trip() {
        let flags = PduFlags {
            length: 0x110,
            circulated: false,
            more_follows: true,
        };

        let mut buf = [0u8; 2];

        flags.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x10, 0x81]);

        assert_eq!(PduFlags::unpack_from_slice(&buf).unwrap(), flags);
    }

    #[test]
    fn single_datagram_frame() {
        let mut buf = [0u8; 1518];

        let len =
            setup_datagram(&mut buf, Command::brd(0x0000), 0x12, &[0x00, 0x00]).unwrap();

        // 14 eth + 2 ecat + 10 header + 2 data + 2 wkc
        assert_eq!(len, 30);

        assert_eq!(&buf[0..6], &[0xff; 6]);
        assert_eq!(&buf[12..14], &[0x88, 0xa4]);
        // EtherCAT header: 14 byte payload, type 1
        assert_eq!(&buf[14..16], &[0x0e, 0x10]);
        // BRD, index 0x12, ADP 0, ADO 0, len 2, no flags, IRQ 0
        assert_eq!(
            &buf[16..30],
            &[0x07, 0x12, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn append_sets_more_flag() {
        let mut buf = [0u8; 1518];

        let len = setup_datagram(&mut buf, Command::brd(0x0000), 0, &[0u8; 2]).unwrap();
        let len = add_datagram(&mut buf, len, Command::brd(0x0110), 1, &[0u8; 2]).unwrap();

        assert_eq!(len, 30 + 14);

        let pdus = PduIter::new(&buf)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(pdus.len(), 2);
        assert!(pdus[0].flags.more_follows);
        assert!(!pdus[1].flags.more_follows);
        assert_eq!(pdus[1].index, 1);
    }

    #[test]
    fn max_payload_is_accepted_but_no_more() {
        let mut buf = [0u8; 1518];
        let data = [0u8; MAX_LRW_DATA];

        assert!(setup_datagram(&mut buf, Command::lrw(0), 0, &data).is_ok());

        let long = [0u8; MAX_LRW_DATA + 1];

        assert_eq!(
            setup_datagram(&mut buf, Command::lrw(0), 0, &long),
            Err(Error::Pdu(PduError::TooLong))
        );

        let len = setup_datagram(&mut buf, Command::lrw(0), 0, &[0u8; 4]).unwrap();

        assert_eq!(
            add_datagram(&mut buf, len, Command::lrw(0), 1, &long),
            Err(Error::Pdu(PduError::TooLong))
        );
    }

    #[test]
    fn received_frame_iterates() {
        let mut buf = [0u8; 1518];

        let len = setup_datagram(&mut buf, Command::fprd(0x1001, 0x0130), 7, &[0u8; 2]).unwrap();

        // Emulate a slave filling in data and bumping the WKC.
        buf[len - 4..len - 2].copy_from_slice(&0x0008u16.to_le_bytes());
        buf[len - 2..len].copy_from_slice(&1u16.to_le_bytes());

        let pdu = PduIter::new(&buf).unwrap().next().unwrap().unwrap();

        assert_eq!(pdu.index, 7);
        assert_eq!(pdu.command_code, 0x04);
        assert_eq!(pdu.data, &[0x08, 0x00]);
        assert_eq!(pdu.working_counter, 1);
    }
}
