//! Byte collections with cheap header and fragmentation operations.

use std::collections::VecDeque;

mod chunk;
pub use chunk::Chunk;

/// A byte container built for protocol work.
///
/// Sends arrive as a gather-list of buffers and leave as wire frames;
/// prepending a header or carving off the next fragment should not copy
/// the payload. A message is a queue of shared chunks with a cached
/// length, so [`Message::header`], [`Message::concatenate`], and
/// [`Message::cut`] all run without touching the payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Message {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Message {
    /// Creates a message holding the given bytes.
    pub fn new(body: impl Into<Chunk>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut chunks = VecDeque::with_capacity(1);
        chunks.push_back(body);
        Self { chunks, len }
    }

    /// Prepends the given bytes to the front of the message.
    pub fn header(&mut self, header: impl Into<Chunk>) {
        let header = header.into();
        self.len += header.len();
        self.chunks.push_front(header);
    }

    /// Appends another message, forming a gather-list without copying.
    pub fn concatenate(&mut self, other: Message) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Removes the first `len` bytes and returns them as a new message.
    ///
    /// The byte at the split point may end up shared between the two
    /// messages' backing chunks; neither side can observe the other.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the message length.
    pub fn cut(&mut self, len: usize) -> Self {
        assert!(len <= self.len);
        self.len -= len;

        let mut cut = VecDeque::new();
        let mut remaining = len;
        while remaining > 0 {
            // The assert above guarantees a front chunk exists here.
            let mut head = match self.chunks.pop_front() {
                Some(head) => head,
                None => break,
            };
            if head.len() <= remaining {
                remaining -= head.len();
                cut.push_back(head);
            } else {
                cut.push_back(head.split_front(remaining));
                remaining = 0;
                self.chunks.push_front(head);
            }
        }

        Self { chunks: cut, len }
    }

    /// The number of bytes in the message.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over every byte of the message in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.as_slice().iter().copied())
    }

    /// Copies the message out into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        out
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::new(value)
    }
}

impl From<&[u8]> for Message {
    fn from(value: &[u8]) -> Self {
        Message::new(value)
    }
}

impl<const N: usize> From<[u8; N]> for Message {
    fn from(value: [u8; N]) -> Self {
        Message::new(value.as_slice())
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::new(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        let message = Message::new(b"body".as_slice());
        assert_eq!(message.len(), 4);
        assert_eq!(message.to_vec(), b"body");
    }

    #[test]
    fn header_then_iter() {
        let mut message = Message::new(b"body".as_slice());
        message.header(b"head".as_slice());
        assert_eq!(message.len(), 8);
        assert!(message.iter().eq(b"headbody".iter().copied()));
    }

    #[test]
    fn concatenate_gather_list() {
        let mut message = Message::new(b"one ".as_slice());
        message.concatenate(Message::new(b"two ".as_slice()));
        message.concatenate(Message::new(b"three".as_slice()));
        assert_eq!(message.to_vec(), b"one two three");
    }

    #[test]
    fn cut_within_chunk() {
        let mut rest = Message::new(b"Hello, world".as_slice());
        let front = rest.cut(5);
        assert_eq!(front.to_vec(), b"Hello");
        assert_eq!(rest.to_vec(), b", world");
    }

    #[test]
    fn cut_across_chunks() {
        let mut rest = Message::new(b"fragments".as_slice());
        rest.header(b"many ".as_slice());
        let front = rest.cut(7);
        assert_eq!(front.to_vec(), b"many fr");
        assert_eq!(rest.to_vec(), b"agments");
    }

    #[test]
    fn cut_everything() {
        let mut rest = Message::new(b"all".as_slice());
        let front = rest.cut(3);
        assert_eq!(front.to_vec(), b"all");
        assert!(rest.is_empty());
    }

    #[test]
    fn cut_nothing() {
        let mut rest = Message::new(b"all".as_slice());
        let front = rest.cut(0);
        assert!(front.is_empty());
        assert_eq!(rest.to_vec(), b"all");
    }

    #[test]
    fn empty_message() {
        let message = Message::new(Vec::new());
        assert!(message.is_empty());
        assert_eq!(message.to_vec(), Vec::<u8>::new());
    }

    #[test]
    fn repeated_cut_as_fragmentation() {
        let body: Vec<u8> = (0u16..1000).map(|i| i as u8).collect();
        let mut rest = Message::new(body.clone());
        let mut rebuilt = Vec::new();
        while !rest.is_empty() {
            let take = rest.len().min(300);
            rebuilt.extend(rest.cut(take).to_vec());
        }
        assert_eq!(rebuilt, body);
    }
}
