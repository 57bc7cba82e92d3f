use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// hard ceiling for a complete frame, trailer included
pub const MAX_FRAME_SIZE: usize = 255;
/// operation + sequence + address/result + payload length
pub const HEADER_SIZE: usize = 4;
/// what is left of a maximum frame after header and CRC trailer
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE - 1;

/// The request / response kind, living in the frame's first byte. `Event` is
///  special: it is initiated by the endpoint (or fired-and-forgotten by the
///  host) and never correlated to an outstanding request.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Operation {
    Reset = 0x01,
    Allocate = 0x02,
    Free = 0x03,
    Key = 0x04,
    Settings = 0x05,
    State = 0x06,
    Event = 0x80,
}

/// Application-level result carried in byte 2 of a response. Orthogonal to
///  transport and integrity errors: a structurally valid, CRC-correct response
///  can still report a failure here.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ResultCode {
    Ok = 0x00,
    NotConnected = 0x01,
    NotAvailable = 0x02,
    TransmitFailed = 0x03,
    CrcInvalid = 0x04,
    OperationInvalid = 0x05,
}

/// CRC8 as the endpoint computes it: poly 0x31, seed 0xFF, MSB first, no
///  reflection, no final XOR. That is CRC-8/NRSC-5 (check value 0xF7).
pub fn crc8(data: &[u8]) -> u8 {
    let hasher = Crc::<u8>::new(&crc::CRC_8_NRSC_5);
    let mut digest = hasher.digest();
    digest.update(data);
    digest.finalize()
}

/// One protocol frame, request or response, assembled in place in a fixed
///  buffer.
///
/// `size` is the highest byte index written plus one - not necessarily the
///  final frame length while the frame is being built. Field setters extend it
///  ("growth on write"), and since [Frame::clear] zeroes the whole buffer up
///  front, any gap a setter skips over is implicitly zero-filled: writing the
///  payload length before the operation still yields a correct frame once all
///  header fields are in place.
///
/// `offset` is the outbound read cursor, advanced by [Frame::serialize] and
///  reset by [Frame::finalize].
#[derive(Clone)]
pub struct Frame {
    buffer: [u8; MAX_FRAME_SIZE],
    size: usize,
    offset: usize,
}

impl Frame {
    pub fn new() -> Frame {
        Frame {
            buffer: [0; MAX_FRAME_SIZE],
            size: 0,
            offset: 0,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0);
        self.size = 0;
        self.offset = 0;
    }

    /// growth on write: a setter that wrote up to (exclusive) `end` makes
    ///  everything before it part of the frame, the pre-cleared buffer
    ///  supplying zeros for any gap
    fn mark_written(&mut self, end: usize) {
        if self.size < end {
            self.size = end;
        }
    }

    /// Feeds inbound bytes into the frame: first up to the header (so the
    ///  payload length becomes known), then up to the declared end of the
    ///  frame. Returns how many bytes were consumed - less than `data.len()`
    ///  if the frame completes early, in which case the caller must feed the
    ///  remainder into a fresh frame.
    ///
    /// Never writes past the 255 byte buffer. A header declaring a payload
    ///  longer than [MAX_PAYLOAD_SIZE] can therefore never complete; once the
    ///  buffer is exhausted this returns 0 and the caller has to discard the
    ///  frame to make progress.
    pub fn deserialize(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;

        if self.size < HEADER_SIZE {
            let n = usize::min(data.len(), HEADER_SIZE - self.size);
            self.buffer[self.size..self.size + n].copy_from_slice(&data[..n]);
            self.size += n;
            consumed = n;
        }

        if self.size >= HEADER_SIZE && consumed < data.len() {
            let frame_len = usize::min(
                HEADER_SIZE + self.payload_length() as usize + 1,
                MAX_FRAME_SIZE,
            );
            let n = usize::min(data.len() - consumed, frame_len.saturating_sub(self.size));
            self.buffer[self.size..self.size + n].copy_from_slice(&data[consumed..consumed + n]);
            self.size += n;
            consumed += n;
        }

        consumed
    }

    /// Emits outbound bytes starting at the read cursor, advancing it. Returns
    ///  how many bytes were written into `out`; 0 means the frame is fully
    ///  sent. Must only be called on a finalized frame.
    pub fn serialize(&mut self, out: &mut [u8]) -> usize {
        debug_assert!(self.is_complete(), "serialize called on an unfinalized frame");

        let n = usize::min(out.len(), self.size - self.offset);
        if n > 0 {
            out[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
            self.offset += n;
        }
        n
    }

    pub fn is_complete(&self) -> bool {
        self.size > HEADER_SIZE && self.size >= HEADER_SIZE + self.payload_length() as usize + 1
    }

    pub fn is_valid(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let end = HEADER_SIZE + self.payload_length() as usize;
        crc8(&self.buffer[..end]) == self.buffer[end]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    pub fn operation(&self) -> anyhow::Result<Operation> {
        Ok(Operation::try_from(self.buffer[0])?)
    }

    /// raw operation byte, for correlation against frames that may carry a
    ///  value outside the [Operation] enum
    pub fn operation_byte(&self) -> u8 {
        self.buffer[0]
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.buffer[0] = operation.into();
        self.mark_written(1);
    }

    pub fn sequence(&self) -> u8 {
        self.buffer[1]
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.buffer[1] = sequence;
        self.mark_written(2);
    }

    /// byte 2 of a request: the addressed peripheral, 0 being the endpoint
    ///  itself
    pub fn address(&self) -> u8 {
        self.buffer[2]
    }

    pub fn set_address(&mut self, address: u8) {
        self.buffer[2] = address;
        self.mark_written(3);
    }

    /// byte 2 of a response: the application result code
    pub fn result(&self) -> anyhow::Result<ResultCode> {
        Ok(ResultCode::try_from(self.buffer[2])?)
    }

    pub fn set_result(&mut self, result: ResultCode) {
        self.buffer[2] = result.into();
        self.mark_written(3);
    }

    pub fn payload_length(&self) -> u8 {
        self.buffer[3]
    }

    pub fn set_payload_length(&mut self, length: u8) {
        self.buffer[3] = length;
        self.mark_written(HEADER_SIZE);
    }

    /// the declared payload, clamped to the buffer for frames whose length
    ///  byte overstates what can ever fit
    pub fn payload(&self) -> &[u8] {
        let end = usize::min(HEADER_SIZE + self.payload_length() as usize, MAX_FRAME_SIZE);
        &self.buffer[HEADER_SIZE..end]
    }

    /// copies the payload into the frame and sets the length byte accordingly
    pub fn set_payload(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(anyhow!(
                "payload of {} bytes exceeds the maximum of {}",
                data.len(),
                MAX_PAYLOAD_SIZE
            ));
        }
        self.buffer[3] = data.len() as u8;
        self.buffer[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
        self.mark_written(HEADER_SIZE + data.len());
        Ok(())
    }

    /// Computes the CRC over header and payload, stores it in the trailer,
    ///  sets `size` to the exact frame length and rewinds the read cursor,
    ///  making the frame ready to serialize. Requires the header and the
    ///  declared payload to be written; does nothing but rewind otherwise.
    ///  Returns the computed CRC for diagnostics.
    pub fn finalize(&mut self) -> u8 {
        let mut crc = 0;
        let payload_len = self.payload_length() as usize;

        if payload_len <= MAX_PAYLOAD_SIZE
            && self.size >= HEADER_SIZE
            && self.size >= HEADER_SIZE + payload_len
        {
            crc = crc8(&self.buffer[..HEADER_SIZE + payload_len]);
            self.buffer[HEADER_SIZE + payload_len] = crc;
            self.size = HEADER_SIZE + payload_len + 1;
        }

        self.offset = 0;
        crc
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}
impl Eq for Frame {}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame{{op:{:#04x} seq:{} addr:{:#04x} len:{} size:{} complete:{} valid:{}}}",
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.size,
            self.is_complete(),
            self.is_valid(),
        )
    }
}
