//! The canonical message timeline for one room view.

use std::collections::HashMap;

use shared::{domain::MessageId, protocol::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestSource {
    History,
    Live,
    Optimistic,
}

/// Placeholders live in their own key space, so a client-local id can never
/// shadow or merge with a server-assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Confirmed(MessageId),
    Placeholder(MessageId),
}

impl EntryKey {
    fn for_source(id: &MessageId, source: IngestSource) -> Self {
        match source {
            IngestSource::History | IngestSource::Live => Self::Confirmed(id.clone()),
            IngestSource::Optimistic => Self::Placeholder(id.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: Message,
    arrival: u64,
    source: IngestSource,
}

#[derive(Debug, Default)]
pub struct MessageReconciler {
    entries: HashMap<EntryKey, Entry>,
    next_arrival: u64,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many keys were new. Overwrites keep their arrival slot.
    pub fn ingest(
        &mut self,
        records: impl IntoIterator<Item = Message>,
        source: IngestSource,
    ) -> usize {
        let mut added = 0;
        for mut record in records {
            record.pending = source == IngestSource::Optimistic;
            let key = EntryKey::for_source(&record.id, source);
            if self.upsert(key, record, source) {
                added += 1;
            }
        }
        added
    }

    /// Replaces a placeholder with its confirmed record in one step. Returns
    /// whether the placeholder was still present.
    pub fn supersede(&mut self, placeholder_id: &MessageId, mut confirmed: Message) -> bool {
        let removed = self
            .entries
            .remove(&EntryKey::Placeholder(placeholder_id.clone()))
            .is_some();
        confirmed.pending = false;
        let key = EntryKey::Confirmed(confirmed.id.clone());
        self.upsert(key, confirmed, IngestSource::Live);
        removed
    }

    pub fn discard_placeholder(&mut self, placeholder_id: &MessageId) -> bool {
        self.entries
            .remove(&EntryKey::Placeholder(placeholder_id.clone()))
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        let mut entries = self.entries.values().collect::<Vec<_>>();
        entries.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then(a.arrival.cmp(&b.arrival))
        });
        entries.into_iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn contains_confirmed(&self, id: &MessageId) -> bool {
        self.entries.contains_key(&EntryKey::Confirmed(id.clone()))
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.source == IngestSource::Optimistic)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_arrival = 0;
    }

    fn upsert(&mut self, key: EntryKey, record: Message, source: IngestSource) -> bool {
        if let Some(existing) = self.entries.get_mut(&key) {
            existing.record = record;
            existing.source = source;
            return false;
        }
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.insert(
            key,
            Entry {
                record,
                arrival,
                source,
            },
        );
        true
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
