use std::sync::Arc;

// A chunk is a view into shared bytes. Splitting a chunk clones the Arc,
// not the bytes, which is what lets fragmentation share one allocation
// across every fragment of a message.

/// One piece of a [`Message`](super::Message): a range over shared bytes.
#[derive(Debug, Clone)]
pub struct Chunk {
    start: usize,
    end: usize,
    bytes: Arc<Vec<u8>>,
}

impl Chunk {
    /// Wraps the given bytes in a chunk.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            start: 0,
            end: bytes.len(),
            bytes: Arc::new(bytes),
        }
    }

    /// The accessible bytes of the chunk.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// The number of accessible bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Splits off the first `len` bytes into a new chunk sharing the same
    /// backing storage. `self` keeps the remainder.
    pub(super) fn split_front(&mut self, len: usize) -> Chunk {
        debug_assert!(len <= self.len());
        let front = Chunk {
            start: self.start,
            end: self.start + len,
            bytes: Arc::clone(&self.bytes),
        };
        self.start += len;
        front
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(vector: Vec<u8>) -> Self {
        Self::new(vector)
    }
}

impl From<&[u8]> for Chunk {
    fn from(slice: &[u8]) -> Self {
        Self::new(slice.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Chunk {
    fn from(array: [u8; N]) -> Self {
        Self::new(array.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(array: &[u8; N]) -> Self {
        Self::new(array.to_vec())
    }
}

impl From<&str> for Chunk {
    fn from(string: &str) -> Self {
        Self::new(string.as_bytes().to_vec())
    }
}
