//! Meshtastic serial stream framing: `0x94 0xC3 len_hi len_lo <protobuf>`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_START1: u8 = 0x94;
pub const FRAME_START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
pub const MAX_FRAME: usize = 512;

/// Splits the radio byte stream into protobuf frames.
///
/// Bytes outside a frame (firmware debug console output) are discarded. A
/// header announcing more than [`MAX_FRAME`] bytes is treated as noise.
#[derive(Debug, Default, Clone, Copy)]
pub struct RadioFrameCodec {
    skipped: usize,
}

impl RadioFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded as noise so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn discard(&mut self, src: &mut BytesMut, count: usize) {
        let _ = src.split_to(count);
        self.skipped += count;
    }
}

impl Decoder for RadioFrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|b| *b == FRAME_START1) {
                Some(0) => {}
                Some(pos) => self.discard(src, pos),
                None => {
                    let len = src.len();
                    self.discard(src, len);
                    return Ok(None);
                }
            }

            if src.len() < 2 {
                return Ok(None);
            }
            if src[1] != FRAME_START2 {
                self.discard(src, 1);
                continue;
            }
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u16::from_be_bytes([src[2], src[3]]) as usize;
            if len > MAX_FRAME {
                self.discard(src, 1);
                continue;
            }
            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            let _ = src.split_to(HEADER_LEN);
            return Ok(Some(src.split_to(len).freeze()));
        }
    }
}

impl Encoder<Vec<u8>> for RadioFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("radio frame of {} bytes exceeds {}", item.len(), MAX_FRAME),
            ));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u8(FRAME_START1);
        dst.put_u8(FRAME_START2);
        dst.put_u16(item.len() as u16);
        dst.put_slice(&item);
        Ok(())
    }
}
