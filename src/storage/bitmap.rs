use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// OffsetBitmap records which offsets within a segment the state machine has
/// marked clean. Offsets are dense and small (bounded by the segment's
/// max_entries), so a word vector is enough.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OffsetBitmap {
    words: Vec<u64>,
}

impl OffsetBitmap {
    pub fn new() -> Self {
        OffsetBitmap { words: Vec::new() }
    }

    /// Marks `offset` set. Returns false if it was already set.
    pub fn set(&mut self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let previously_set = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !previously_set
    }

    pub fn get(&self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.words.get(word).map_or(false, |w| w & (1 << bit) != 0)
    }

    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.words.len() as u32);
        for word in &self.words {
            out.put_u64(*word);
        }
    }

    pub(crate) fn encoded_len(&self) -> u64 {
        4 + self.words.len() as u64 * 8
    }

    pub(crate) fn decode(buf: &mut Bytes) -> io::Result<OffsetBitmap> {
        if buf.remaining() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated bitmap"));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len * 8 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated bitmap"));
        }
        let mut words = Vec::with_capacity(len);
        for _ in 0..len {
            words.push(buf.get_u64());
        }
        Ok(OffsetBitmap { words })
    }
}
