use std::collections::BTreeMap;

use crate::Message;

/// Tracks published messages awaiting broker confirmation.
///
/// Each logged message is stamped with a sequence number. When the
/// connection drops, [`reset`](Self::reset) hands every unconfirmed message
/// back, in publish order, so the exchange can republish them.
#[derive(Debug, Default)]
pub struct PublishLog {
    // ---
    messages: BTreeMap<u64, Message>,
    next_sequence: u64,
}

impl PublishLog {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Log a message and return its sequence number.
    ///
    /// A message that already carries a sequence number is not logged again;
    /// its existing number is returned.
    pub fn add(&mut self, message: &mut Message) -> u64 {
        // ---
        if let Some(sequence) = message.sequence_no {
            return sequence;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        message.sequence_no = Some(sequence);
        self.messages.insert(sequence, message.clone());
        sequence
    }

    /// Drop a confirmed (or abandoned) message.
    ///
    /// Returns true if the sequence number was logged.
    pub fn remove(&mut self, sequence: u64) -> bool {
        self.messages.remove(&sequence).is_some()
    }

    /// Number of unconfirmed messages.
    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Logged sequence numbers, oldest first.
    pub fn sequences(&self) -> Vec<u64> {
        self.messages.keys().copied().collect()
    }

    /// Drain every logged message and restart numbering at zero.
    ///
    /// Returned messages no longer carry a sequence number, so publishing
    /// them again logs them afresh.
    pub fn reset(&mut self) -> Vec<Message> {
        // ---
        self.next_sequence = 0;
        std::mem::take(&mut self.messages)
            .into_values()
            .map(|mut message| {
                message.sequence_no = None;
                message
            })
            .collect()
    }
}
