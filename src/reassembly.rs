//! Reassembly of fragmented incoming messages.
//!
//! Each pipe keeps a small fixed set of slots, one per message currently
//! in flight. A slot tracks the fragmentation geometry announced by the
//! first fragment seen, a bitmap of fragments still missing, and the
//! partially-filled message buffer. Stale slots are garbage-collected
//! lazily and the oldest incomplete slot is evicted silently when a new
//! message needs room; tolerating late stragglers is not a goal.

mod bitvec;
use bitvec::MissingMap;

use crate::frame::{DataHeader, ErrorCode};
use crate::message::Message;

/// How many messages a pipe will reassemble concurrently.
pub(crate) const RECV_SLOTS: usize = 2;

/// How long a partial message may sit without progress before its slot is
/// reclaimed, in milliseconds.
pub(crate) const STALE_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct Slot {
    /// Arrival time of the fragment that opened the slot; 0 with
    /// `msg_id == 0` means the slot is empty.
    arrived_ms: u64,
    /// Message id being assembled; 0 marks an empty slot.
    msg_id: u16,
    ready: bool,
    frag_size: u16,
    nfrags: u16,
    missing: MissingMap,
    buffer: Vec<u8>,
}

impl Slot {
    fn reset(&mut self) {
        *self = Slot::default();
    }

    fn is_empty(&self) -> bool {
        self.msg_id == 0
    }
}

/// What became of one delivered fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentOutcome {
    /// A message completed; [`Reassembly::take_ready`] will yield it.
    Completed,
    /// The fragment was stored; the message is still incomplete.
    Buffered,
    /// Duplicate or unplaceable fragment, dropped without comment.
    Dropped,
    /// The fragment violated the protocol or the receive ceiling. The
    /// offending slot has been reset and the peer should be told.
    Reject(ErrorCode),
}

#[derive(Debug)]
pub(crate) struct Reassembly {
    slots: Vec<Slot>,
}

impl Reassembly {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(RECV_SLOTS);
        slots.resize_with(RECV_SLOTS, Slot::default);
        Self { slots }
    }

    /// Drops partial messages that have seen no first fragment recently.
    /// Ready slots are never collected; only delivery or close clears
    /// them.
    fn collect_stale(&mut self, now_ms: u64) {
        for slot in &mut self.slots {
            if !slot.is_empty() && !slot.ready && slot.arrived_ms + STALE_MS < now_ms {
                slot.reset();
            }
        }
    }

    /// Picks the slot for a message id: a matching slot if one exists,
    /// otherwise an empty one, otherwise the oldest incomplete slot
    /// (evicted silently). When every slot holds a completed message
    /// there is nothing to evict and the fragment has nowhere to go.
    fn choose(&mut self, msg_id: u16) -> Option<&mut Slot> {
        if let Some(index) = self.slots.iter().position(|s| s.msg_id == msg_id) {
            return self.slots.get_mut(index);
        }
        if let Some(index) = self.slots.iter().position(|s| s.is_empty()) {
            return self.slots.get_mut(index);
        }
        self.slots
            .iter_mut()
            .filter(|s| !s.ready)
            .min_by_key(|s| s.arrived_ms)
    }

    /// Files one fragment. The codec has already checked the per-frame
    /// rules (index within bounds, non-final fragments full-sized), so
    /// what remains is consistency with the slot and the receive ceiling.
    pub fn deliver(
        &mut self,
        now_ms: u64,
        recv_max: u32,
        head: &DataHeader,
        payload: &[u8],
    ) -> FragmentOutcome {
        self.collect_stale(now_ms);

        // Refuse a message that cannot fit under the ceiling before
        // allocating room for it: even with a short final fragment it
        // will span at least (nfrags - 1) full fragments.
        let floor = u64::from(head.nfrags - 1) * u64::from(head.frag_size);
        if recv_max != 0 && floor > u64::from(recv_max) {
            return FragmentOutcome::Reject(ErrorCode::MsgSize);
        }

        let Some(slot) = self.choose(head.msg_id) else {
            return FragmentOutcome::Dropped;
        };

        if slot.msg_id != head.msg_id {
            slot.reset();
            slot.arrived_ms = now_ms;
            slot.msg_id = head.msg_id;
            slot.frag_size = head.frag_size;
            slot.nfrags = head.nfrags;
            slot.missing = MissingMap::all_missing(head.nfrags);
            slot.buffer = vec![0; usize::from(head.nfrags) * usize::from(head.frag_size)];
        } else if slot.frag_size != head.frag_size || slot.nfrags != head.nfrags {
            // The peer changed the geometry mid-message; the whole
            // message is unrecoverable.
            slot.reset();
            return FragmentOutcome::Reject(ErrorCode::Proto);
        }

        if slot.ready || !slot.missing.contains(head.frag_no) {
            return FragmentOutcome::Dropped;
        }

        let offset = usize::from(head.frag_no) * usize::from(head.frag_size);
        slot.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        slot.missing.clear(head.frag_no);

        let last = head.frag_no + 1 == head.nfrags;
        if last {
            // Trim the allocation down to the true message length.
            let length = offset + payload.len();
            slot.buffer.truncate(length);
            if recv_max != 0 && length > recv_max as usize {
                slot.reset();
                return FragmentOutcome::Reject(ErrorCode::MsgSize);
            }
        }

        if slot.missing.is_drained() {
            slot.ready = true;
            FragmentOutcome::Completed
        } else {
            FragmentOutcome::Buffered
        }
    }

    /// Takes the first completed message, if any, freeing its slot.
    pub fn take_ready(&mut self) -> Option<Message> {
        let slot = self.slots.iter_mut().find(|s| s.ready)?;
        let message = Message::new(std::mem::take(&mut slot.buffer));
        slot.reset();
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(msg_id: u16, frag_size: u16, frag_no: u16, nfrags: u16) -> DataHeader {
        DataHeader {
            msg_id,
            frag_size,
            frag_no,
            nfrags,
        }
    }

    fn deliver_all(r: &mut Reassembly, msg_id: u16, body: &[u8], frag_size: u16, order: &[u16]) {
        let nfrags = ((body.len() + usize::from(frag_size) - 1) / usize::from(frag_size)).max(1);
        for &no in order {
            let start = usize::from(no) * usize::from(frag_size);
            let end = (start + usize::from(frag_size)).min(body.len());
            r.deliver(
                0,
                0,
                &head(msg_id, frag_size, no, nfrags as u16),
                &body[start..end],
            );
        }
    }

    #[test]
    fn single_fragment_message() {
        let mut r = Reassembly::new();
        let outcome = r.deliver(0, 0, &head(1, 100, 0, 1), b"hello");
        assert_eq!(outcome, FragmentOutcome::Completed);
        assert_eq!(r.take_ready().unwrap().to_vec(), b"hello");
        assert!(r.take_ready().is_none());
    }

    #[test]
    fn empty_message() {
        let mut r = Reassembly::new();
        assert_eq!(r.deliver(0, 0, &head(1, 100, 0, 1), b""), FragmentOutcome::Completed);
        assert!(r.take_ready().unwrap().is_empty());
    }

    #[test]
    fn any_permutation_reassembles() {
        let body: Vec<u8> = (0u16..250).map(|i| i as u8).collect();
        for order in [[0u16, 1, 2], [2, 0, 1], [1, 2, 0], [2, 1, 0]] {
            let mut r = Reassembly::new();
            deliver_all(&mut r, 9, &body, 100, &order);
            assert_eq!(r.take_ready().unwrap().to_vec(), body, "order {order:?}");
        }
    }

    #[test]
    fn duplicates_are_harmless() {
        let body: Vec<u8> = (0u16..250).map(|i| i as u8).collect();
        let mut r = Reassembly::new();
        deliver_all(&mut r, 9, &body, 100, &[0, 1, 1, 0, 2]);
        assert_eq!(r.take_ready().unwrap().to_vec(), body);
        // A duplicate arriving after completion is also dropped.
        assert_eq!(
            r.deliver(0, 0, &head(9, 100, 1, 3), &body[100..200]),
            FragmentOutcome::Buffered // fresh slot: same id restarts a new message
        );
    }

    #[test]
    fn geometry_change_rejects_message() {
        let mut r = Reassembly::new();
        assert_eq!(
            r.deliver(0, 0, &head(5, 100, 0, 3), &[0u8; 100]),
            FragmentOutcome::Buffered
        );
        assert_eq!(
            r.deliver(0, 0, &head(5, 50, 1, 3), &[0u8; 50]),
            FragmentOutcome::Reject(ErrorCode::Proto)
        );
        // The slot was reset; the message never completes.
        assert!(r.take_ready().is_none());
    }

    #[test]
    fn stale_slots_are_collected() {
        let mut r = Reassembly::new();
        r.deliver(0, 0, &head(5, 100, 0, 2), &[0u8; 100]);
        // Past the staleness window the slot is reclaimed, so the second
        // fragment starts a fresh (incomplete) message.
        assert_eq!(
            r.deliver(STALE_MS + 1, 0, &head(5, 100, 1, 2), &[0u8; 40]),
            FragmentOutcome::Buffered
        );
        assert!(r.take_ready().is_none());
    }

    #[test]
    fn oldest_incomplete_slot_is_evicted() {
        let mut r = Reassembly::new();
        r.deliver(10, 0, &head(1, 100, 0, 2), &[0u8; 100]);
        r.deliver(20, 0, &head(2, 100, 0, 2), &[0u8; 100]);
        // With both slots occupied, a third message evicts message 1
        // (the oldest).
        r.deliver(30, 0, &head(3, 100, 0, 2), &[0u8; 100]);
        // Messages 2 and 3 kept their slots and still complete.
        assert_eq!(
            r.deliver(31, 0, &head(2, 100, 1, 2), &[0u8; 100]),
            FragmentOutcome::Completed
        );
        assert_eq!(
            r.deliver(31, 0, &head(3, 100, 1, 2), &[0u8; 100]),
            FragmentOutcome::Completed
        );
        // Message 1's straggler now has to start over from scratch.
        assert_eq!(
            r.deliver(32, 0, &head(1, 100, 1, 2), &[0u8; 100]),
            FragmentOutcome::Buffered
        );
    }

    #[test]
    fn ready_slot_survives_until_taken() {
        let mut r = Reassembly::new();
        assert_eq!(
            r.deliver(0, 0, &head(1, 10, 0, 1), b"keep"),
            FragmentOutcome::Completed
        );
        // Long after staleness, the completed message is still there.
        r.deliver(STALE_MS * 5, 0, &head(2, 10, 0, 2), &[0u8; 10]);
        assert_eq!(r.take_ready().unwrap().to_vec(), b"keep");
    }

    #[test]
    fn receive_ceiling_enforced_at_completion() {
        let mut r = Reassembly::new();
        // 3 x 500 = 1500 bytes against a 1024 ceiling: the floor check
        // passes (1000 <= 1024) but the assembled length does not.
        assert_eq!(
            r.deliver(0, 1024, &head(1, 500, 0, 3), &[0u8; 500]),
            FragmentOutcome::Buffered
        );
        assert_eq!(
            r.deliver(0, 1024, &head(1, 500, 1, 3), &[0u8; 500]),
            FragmentOutcome::Buffered
        );
        assert_eq!(
            r.deliver(0, 1024, &head(1, 500, 2, 3), &[0u8; 500]),
            FragmentOutcome::Reject(ErrorCode::MsgSize)
        );
        assert!(r.take_ready().is_none());
    }

    #[test]
    fn receive_ceiling_enforced_before_allocation() {
        let mut r = Reassembly::new();
        assert_eq!(
            r.deliver(0, 1024, &head(1, 600, 0, 3), &[0u8; 600]),
            FragmentOutcome::Reject(ErrorCode::MsgSize)
        );
    }

    #[test]
    fn exactly_at_ceiling_is_delivered() {
        let mut r = Reassembly::new();
        assert_eq!(
            r.deliver(0, 1024, &head(1, 1024, 0, 1), &[7u8; 1024]),
            FragmentOutcome::Completed
        );
        assert_eq!(r.take_ready().unwrap().len(), 1024);

        assert_eq!(
            r.deliver(0, 1024, &head(2, 1025, 0, 1), &[7u8; 1025]),
            FragmentOutcome::Reject(ErrorCode::MsgSize)
        );
    }
}
