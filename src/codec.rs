//! RFC 6455 frame codec.
//!
//! The encoder always produces client frames: FIN set, masked with a fresh random key.
//! The decoder accepts unmasked server frames and tolerates masked ones, which servers
//! must never send, by logging a warning and unmasking them.

use rand::{Rng, SeedableRng};
use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};

use crate::errors::WebsocketCodecError;

const FIN_MASK: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASKBIT_MASK: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const CONTROL_MASK: u8 = 0x08;

pub(crate) const LENGTH_IS_16BIT: u8 = 126;
pub(crate) const LENGTH_IS_64BIT: u8 = 127;
pub(crate) const MASKING_KEY_LEN: usize = 4;
// Upper bound on buffer growth for a frame that has not fully arrived.
const MAX_RESERVE: usize = 64 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any opcode RFC 6455 leaves reserved (0x3-0x7, 0xB-0xF).
    Reserved(u8),
}

impl Opcode {
    /// Control frames are identified by the most significant opcode bit (RFC 6455 §5.5).
    pub fn is_control(self) -> bool {
        u8::from(self) & CONTROL_MASK != 0
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            x => Self::Reserved(x),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(x) => x & OPCODE_MASK,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WebsocketFrame {
    pub(crate) fin: bool,
    pub(crate) rsv: u8,
    pub(crate) opcode: Opcode,
    pub(crate) payload: Vec<u8>,
}

impl WebsocketFrame {
    /// A complete, extension-free frame.
    pub(crate) fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            payload,
        }
    }
}

/// XOR `payload` in place with `key`, cycling through the key bytes.
///
/// Masking and unmasking are the same operation.
pub(crate) fn apply_mask(payload: &mut [u8], key: [u8; MASKING_KEY_LEN]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % MASKING_KEY_LEN];
    }
}

#[derive(Debug)]
pub struct WebsocketCodec {
    max_length: usize,
    rng: rand::rngs::StdRng,
}

impl WebsocketCodec {
    /// Create a new client codec.
    ///
    /// `max_length` is the largest payload accepted on inbound frames. Frames announcing
    /// more fail with `MessageTooBig` before their payload is buffered.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            rng: rand::rngs::StdRng::from_os_rng(),
        }
    }

    fn masking_key(&mut self) -> [u8; MASKING_KEY_LEN] {
        self.rng.random()
    }
}

impl tokio_util::codec::Decoder for WebsocketCodec {
    type Item = WebsocketFrame;
    type Error = WebsocketCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & FIN_MASK != 0;
        if !fin {
            return Err(WebsocketCodecError::FragmentationUnsupported);
        }
        let rsv = (src[0] & RSV_MASK) >> 4;
        if rsv != 0 {
            return Err(WebsocketCodecError::ProtocolViolation(
                "One or more RSV flag(s) set",
            ));
        }
        let opcode = Opcode::from(src[0]);
        let masked = src[1] & MASKBIT_MASK != 0;

        let (header_len, payload_len) = match src[1] & LENGTH_MASK {
            LENGTH_IS_16BIT => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (4, u64::from(u16::from_be_bytes([src[2], src[3]])))
            }
            LENGTH_IS_64BIT => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
                ]);
                if len & (1 << 63) != 0 {
                    return Err(WebsocketCodecError::ProtocolViolation(
                        "MSB of 64-bit length set",
                    ));
                }
                (10, len)
            }
            len => (2, u64::from(len)),
        };

        if payload_len > u64::try_from(self.max_length).unwrap_or(u64::MAX) {
            return Err(WebsocketCodecError::MessageTooBig(payload_len));
        }
        let announced = payload_len;
        let payload_len = usize::try_from(announced)
            .map_err(|_| WebsocketCodecError::MessageTooBig(announced))?;

        let mask_len = if masked { MASKING_KEY_LEN } else { 0 };
        let total_len = (header_len + mask_len)
            .checked_add(payload_len)
            .ok_or(WebsocketCodecError::MessageTooBig(announced))?;
        if src.len() < total_len {
            src.reserve((total_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(header_len);

        let masking_key = if masked {
            let key = src.split_to(MASKING_KEY_LEN);
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let mut payload = src.split_to(payload_len).to_vec();

        if let Some(key) = masking_key {
            tracing::warn!(
                ?opcode,
                len = payload_len,
                "masked frame received from server; this should never happen"
            );
            apply_mask(&mut payload, key);
        }

        tracing::trace!(?opcode, len = payload_len, "frame decoded");

        Ok(Some(WebsocketFrame {
            fin,
            rsv,
            opcode,
            payload,
        }))
    }
}

impl tokio_util::codec::Encoder<WebsocketFrame> for WebsocketCodec {
    type Error = WebsocketCodecError;

    fn encode(&mut self, item: WebsocketFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        let wire_len =
            u64::try_from(len).map_err(|_| WebsocketCodecError::UnsupportedPayloadSize(len))?;

        let mut first = u8::from(item.opcode) | ((item.rsv << 4) & RSV_MASK);
        if item.fin {
            first |= FIN_MASK;
        }

        dst.reserve(2 + 8 + MASKING_KEY_LEN + len);
        dst.put_u8(first);

        #[allow(
            clippy::cast_possible_truncation,
            reason = "Each arm bounds the length to the width it is written with"
        )]
        match wire_len {
            0..=125 => dst.put_u8(MASKBIT_MASK | wire_len as u8),
            126..=0xFFFF => {
                dst.put_u8(MASKBIT_MASK | LENGTH_IS_16BIT);
                dst.put_u16(wire_len as u16);
            }
            _ => {
                dst.put_u8(MASKBIT_MASK | LENGTH_IS_64BIT);
                dst.put_u64(wire_len);
            }
        }

        let key = self.masking_key();
        dst.extend_from_slice(&key);

        let mut payload = item.payload;
        apply_mask(&mut payload, key);
        dst.extend_from_slice(&payload);

        tracing::trace!(opcode = ?item.opcode, len, "frame encoded");

        Ok(())
    }
}
