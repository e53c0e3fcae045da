//! Wire framing for Feetech-style half-duplex servo buses.
//!
//! Every packet, instruction or status, has the same layout:
//!
//! ```text
//! +------+------+----+-----+-------------+--------+----------+
//! | 0xFF | 0xFF | id | len | instr/error | params | checksum |
//! +------+------+----+-----+-------------+--------+----------+
//! ```
//!
//! `len` counts the instruction byte, the params and the checksum
//! (`params.len() + 2`). The checksum is the bitwise NOT of the byte sum
//! from `id` through the last param.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BusError;
use crate::joint::ServoId;

pub const HEADER: u8 = 0xFF;
pub const BROADCAST_ID: ServoId = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_SYNC_READ: u8 = 0x82;
pub const INST_SYNC_WRITE: u8 = 0x83;

/// Largest `params` section a single length byte can describe.
pub const MAX_PARAMS: usize = 253;

const MIN_LENGTH: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read { address: u8, length: u8 },
    Write { address: u8, data: Vec<u8> },
    SyncRead { address: u8, length: u8, ids: Vec<ServoId> },
    SyncWrite {
        address: u8,
        length: u8,
        writes: Vec<(ServoId, Vec<u8>)>,
    },
}

impl Instruction {
    pub fn code(&self) -> u8 {
        match self {
            Instruction::Ping => INST_PING,
            Instruction::Read { .. } => INST_READ,
            Instruction::Write { .. } => INST_WRITE,
            Instruction::SyncRead { .. } => INST_SYNC_READ,
            Instruction::SyncWrite { .. } => INST_SYNC_WRITE,
        }
    }

    fn params(&self) -> Result<Vec<u8>, BusError> {
        let params = match self {
            Instruction::Ping => Vec::new(),
            Instruction::Read { address, length } => vec![*address, *length],
            Instruction::Write { address, data } => {
                let mut params = Vec::with_capacity(1 + data.len());
                params.push(*address);
                params.extend_from_slice(data);
                params
            }
            Instruction::SyncRead {
                address,
                length,
                ids,
            } => {
                let mut params = Vec::with_capacity(2 + ids.len());
                params.push(*address);
                params.push(*length);
                params.extend_from_slice(ids);
                params
            }
            Instruction::SyncWrite {
                address,
                length,
                writes,
            } => {
                let mut params = Vec::with_capacity(2 + writes.len() * (*length as usize + 1));
                params.push(*address);
                params.push(*length);
                for (id, data) in writes {
                    if data.len() != *length as usize {
                        return Err(BusError::InvalidRequest("sync-write entry length mismatch"));
                    }
                    params.push(*id);
                    params.extend_from_slice(data);
                }
                params
            }
        };
        if params.len() > MAX_PARAMS {
            return Err(BusError::InvalidRequest("payload too large for one frame"));
        }
        Ok(params)
    }

    /// Parse the instruction carried by a received packet.
    pub fn from_packet(packet: &Packet) -> Result<Self, BusError> {
        let p = &packet.params;
        let instruction = match packet.code {
            INST_PING => Instruction::Ping,
            INST_READ => {
                if p.len() != 2 {
                    return Err(BusError::Corrupt);
                }
                Instruction::Read {
                    address: p[0],
                    length: p[1],
                }
            }
            INST_WRITE => {
                if p.is_empty() {
                    return Err(BusError::Corrupt);
                }
                Instruction::Write {
                    address: p[0],
                    data: p[1..].to_vec(),
                }
            }
            INST_SYNC_READ => {
                if p.len() < 2 {
                    return Err(BusError::Corrupt);
                }
                Instruction::SyncRead {
                    address: p[0],
                    length: p[1],
                    ids: p[2..].to_vec(),
                }
            }
            INST_SYNC_WRITE => {
                if p.len() < 2 {
                    return Err(BusError::Corrupt);
                }
                let (address, length) = (p[0], p[1]);
                let chunk = length as usize + 1;
                let tail = &p[2..];
                if tail.len() % chunk != 0 {
                    return Err(BusError::Corrupt);
                }
                let writes = tail
                    .chunks(chunk)
                    .map(|c| (c[0], c[1..].to_vec()))
                    .collect();
                Instruction::SyncWrite {
                    address,
                    length,
                    writes,
                }
            }
            _ => return Err(BusError::InvalidRequest("unsupported instruction")),
        };
        Ok(instruction)
    }
}

/// A decoded packet. `code` is the instruction byte on requests and the
/// status (error) byte on responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub id: ServoId,
    pub code: u8,
    pub params: Vec<u8>,
}

pub fn checksum(id: ServoId, length: u8, code: u8, params: &[u8]) -> u8 {
    let sum = params
        .iter()
        .fold(id as u32 + length as u32 + code as u32, |acc, b| acc + *b as u32);
    !(sum as u8)
}

fn encode_raw(id: ServoId, code: u8, params: &[u8]) -> Bytes {
    let length = (params.len() + 2) as u8;
    let mut frame = BytesMut::with_capacity(6 + params.len());
    frame.put_u8(HEADER);
    frame.put_u8(HEADER);
    frame.put_u8(id);
    frame.put_u8(length);
    frame.put_u8(code);
    frame.put_slice(params);
    frame.put_u8(checksum(id, length, code, params));
    frame.freeze()
}

/// Encode an instruction frame addressed to `id`.
pub fn encode_instruction(id: ServoId, instruction: &Instruction) -> Result<Bytes, BusError> {
    let params = instruction.params()?;
    Ok(encode_raw(id, instruction.code(), &params))
}

/// Encode a status frame, as a servo would send it.
pub fn encode_status(id: ServoId, error: u8, params: &[u8]) -> Result<Bytes, BusError> {
    if params.len() > MAX_PARAMS {
        return Err(BusError::InvalidRequest("payload too large for one frame"));
    }
    Ok(encode_raw(id, error, params))
}

/// Incremental frame extractor over a byte stream.
///
/// Bytes before a `FF FF` header are skipped. A frame whose checksum does
/// not match is consumed and reported as [`BusError::Corrupt`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, BusError> {
        loop {
            // Resync on the header.
            match self.buf.windows(2).position(|w| w == [HEADER, HEADER]) {
                Some(0) => {}
                Some(skip) => {
                    tracing::trace!("Skipping {} bytes of line noise", skip);
                    self.buf.advance(skip);
                }
                None => {
                    // Keep a trailing 0xFF, it may start the next header.
                    let keep = usize::from(self.buf.last() == Some(&HEADER));
                    let drop = self.buf.len() - keep;
                    self.buf.advance(drop);
                    return Ok(None);
                }
            }

            if self.buf.len() < 4 {
                return Ok(None);
            }
            let id = self.buf[2];
            let length = self.buf[3];
            // "FF FF FF id ..." is a header followed by a stray 0xFF.
            if id == HEADER || length < MIN_LENGTH {
                self.buf.advance(1);
                continue;
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                return Ok(None);
            }

            let frame = self.buf.split_to(total);
            let code = frame[4];
            let params = &frame[5..total - 1];
            if checksum(id, length, code, params) != frame[total - 1] {
                return Err(BusError::Corrupt);
            }
            return Ok(Some(Packet {
                id,
                code,
                params: params.to_vec(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_read_frame() {
        let frame = encode_instruction(1, &Instruction::Read { address: 56, length: 2 }).unwrap();
        // len = 2 params + 2, checksum = !(1 + 4 + 2 + 56 + 2)
        assert_eq!(&frame[..], &[0xFF, 0xFF, 0x01, 0x04, 0x02, 0x38, 0x02, !65u8]);
    }

    #[test]
    fn test_sync_write_layout() {
        let instruction = Instruction::SyncWrite {
            address: 42,
            length: 2,
            writes: vec![(1, vec![0x00, 0x08]), (2, vec![0xFF, 0x0F])],
        };
        let frame = encode_instruction(BROADCAST_ID, &instruction).unwrap();
        assert_eq!(frame[2], BROADCAST_ID);
        assert_eq!(frame[3], 10);
        assert_eq!(frame[4], INST_SYNC_WRITE);
        assert_eq!(&frame[5..13], &[42, 2, 1, 0x00, 0x08, 2, 0xFF, 0x0F]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let packet = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Instruction::from_packet(&packet).unwrap(), instruction);
    }

    #[test]
    fn test_sync_write_rejects_ragged_entries() {
        let instruction = Instruction::SyncWrite {
            address: 42,
            length: 2,
            writes: vec![(1, vec![0x00])],
        };
        assert!(matches!(
            encode_instruction(BROADCAST_ID, &instruction),
            Err(BusError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_decoder_skips_noise_and_waits_for_more() {
        let status = encode_status(3, 0, &[0x00, 0x08]).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x12, 0x34, 0xFF]);
        decoder.extend(&status[..4]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&status[4..]);
        let packet = decoder.next_frame().unwrap().unwrap();
        assert_eq!(packet.id, 3);
        assert_eq!(packet.code, 0);
        assert_eq!(packet.params, vec![0x00, 0x08]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_reports_checksum_failure() {
        let mut bad = encode_status(3, 0, &[0x10]).unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let good = encode_status(4, 0, &[]).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&good);
        assert!(matches!(decoder.next_frame(), Err(BusError::Corrupt)));
        // The corrupt frame was consumed; the next one still decodes.
        assert_eq!(decoder.next_frame().unwrap().unwrap().id, 4);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let instruction = Instruction::Write {
            address: 0,
            data: vec![0; MAX_PARAMS],
        };
        assert!(encode_instruction(1, &instruction).is_err());
    }
}
