use std::collections::VecDeque;

use conduit_protocol::Event;

/// Per-connection replay buffer keyed by `seq`. Bounded to `ring_size`
/// entries; entries with `seq <= last_ack` are released first so the
/// buffer spends its budget on un-acknowledged history.
pub struct HistoryRing {
    entries: VecDeque<Event>,
    ring_size: usize,
    last_ack: u64,
}

impl HistoryRing {
    pub fn new(ring_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(ring_size.min(4096)),
            ring_size,
            last_ack: 0,
        }
    }

    pub fn push(&mut self, evt: Event) {
        self.entries.push_back(evt);
        self.trim_to_ring_size();
    }

    /// Release acknowledged entries, then enforce the hard ring size cap.
    pub fn ack(&mut self, last_seq: u64) {
        if last_seq > self.last_ack {
            self.last_ack = last_seq;
        }
        while self
        .entries
        .front()
        .and_then(|e| e.seq)
        .is_some_and(|seq| seq <= self.last_ack)
        {
            self.entries.pop_front();
        }
    }

    fn trim_to_ring_size(&mut self) {
        while self.entries.len() > self.ring_size {
            self.entries.pop_front();
        }
    }

    /// The contiguous suffix with `seq > from_seq`, capped at `cap`
    /// entries. Returns `(events, truncated)` where `truncated` is true
    /// when more matching events existed than `cap` allowed through.
    pub fn replay_from(&self, from_seq: u64, cap: usize) -> (Vec<Event>, bool) {
        let matching: Vec<&Event> = self
        .entries
        .iter()
        .filter(|e| e.seq.is_some_and(|s| s > from_seq))
        .collect();
        let truncated = matching.len() > cap;
        let events = matching.into_iter().take(cap).cloned().collect();
        (events, truncated)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
