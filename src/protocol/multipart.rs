//! Fragmentation of outbound payloads and reassembly of inbound fragments.
//!
//! The service caps text frames at [`MAX_MESSAGE_SIZE`] bytes of escaped
//! payload. Larger messages are split into numbered parts sharing one
//! message id; the peer buffers inbound parts per id until the set is
//! complete.

use std::collections::HashMap;

/// Maximum escaped payload bytes per WebSocket frame.
pub(crate) const MAX_MESSAGE_SIZE: usize = 800;

/// Splits an escaped payload into chunks of at most [`MAX_MESSAGE_SIZE`]
/// bytes. Chunks never split a `char`, so each one stays a valid string.
pub(crate) fn fragment(escaped: &str) -> Vec<&str> {
    let mut chunks = Vec::with_capacity(escaped.len() / MAX_MESSAGE_SIZE + 1);
    let mut rest = escaped;
    while rest.len() > MAX_MESSAGE_SIZE {
        let mut cut = MAX_MESSAGE_SIZE;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

/// One buffered fragment of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessagePart {
    part: u32,
    content: String,
}

/// Reassembly buffer for inbound multi-part messages, keyed by message id.
///
/// Parts may arrive out of order and ids interleave freely; each slot is
/// independent. Slots are dropped on delivery and cleared wholesale when the
/// connection goes away.
#[derive(Debug, Default)]
pub(crate) struct MultiPartBuffer {
    slots: HashMap<String, Vec<MessagePart>>,
}

impl MultiPartBuffer {
    /// Buffers one part. Returns the reassembled message once the final part
    /// of the set has arrived. Duplicate part indices are ignored.
    pub(crate) fn insert(
        &mut self,
        message_id: &str,
        part: u32,
        total: u32,
        content: String,
    ) -> Option<String> {
        let slot = self.slots.entry(message_id.to_string()).or_default();
        if slot.iter().any(|existing| existing.part == part) {
            return None;
        }
        slot.push(MessagePart { part, content });
        if (slot.len() as u32) < total {
            return None;
        }

        let mut parts = self.slots.remove(message_id).unwrap_or_default();
        parts.sort_by_key(|p| p.part);
        let mut full = String::with_capacity(parts.iter().map(|p| p.content.len()).sum());
        for p in &parts {
            full.push_str(&p.content);
        }
        Some(full)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Removes the service's triple-backslash escape artifact from a message
/// before it is delivered.
pub(crate) fn strip_escape_artifacts(message: &str) -> String {
    message.replace("\\\\\\", "")
}
