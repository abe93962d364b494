use cifrachat_proto::EnvelopeRecord;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Maximum number of envelopes replayed to a freshly admitted connection.
pub const MAX_HISTORY: usize = 500;

/// Bounded in-memory replay buffer of relayed envelopes, oldest first.
pub struct HistoryBuffer {
    entries: Mutex<VecDeque<EnvelopeRecord>>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends a record, evicting the oldest entries once the buffer is full.
    pub async fn append(&self, record: EnvelopeRecord) {
        let mut entries = self.entries.lock().await;
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Clones the buffered records in arrival order.
    pub async fn snapshot(&self) -> Vec<EnvelopeRecord> {
        let entries = self.entries.lock().await;
        entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cifrachat_proto::EncryptedPayload;

    fn record(id: &str) -> EnvelopeRecord {
        EnvelopeRecord {
            id: id.to_string(),
            username: "ana".to_string(),
            payload: EncryptedPayload {
                encrypted: "AAECAw==".to_string(),
                iv: "AAAAAAAAAAAAAAAA".to_string(),
                auth_tag: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
            },
            at: "2024-05-17T10:20:30.456Z".to_string(),
        }
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let buffer = HistoryBuffer::new(3);
        for id in ["a", "b", "c", "d"] {
            buffer.append(record(id)).await;
        }
        let snapshot = buffer.snapshot().await;
        let ids = snapshot.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn holds_at_most_the_replay_limit() {
        let buffer = HistoryBuffer::new(MAX_HISTORY);
        for n in 0..=MAX_HISTORY {
            buffer.append(record(&format!("m{}", n))).await;
        }
        let snapshot = buffer.snapshot().await;
        assert_eq!(snapshot.len(), MAX_HISTORY);
        let last = format!("m{}", MAX_HISTORY);
        assert_eq!(snapshot.first().map(|r| r.id.as_str()), Some("m1"));
        assert_eq!(snapshot.last().map(|r| r.id.as_str()), Some(last.as_str()));
    }

    #[tokio::test]
    async fn snapshot_preserves_arrival_order() {
        let buffer = HistoryBuffer::new(MAX_HISTORY);
        for id in ["uno", "dos", "tres"] {
            buffer.append(record(id)).await;
        }
        let snapshot = buffer.snapshot().await;
        let ids = snapshot.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["uno", "dos", "tres"]);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_appends() {
        let buffer = HistoryBuffer::new(MAX_HISTORY);
        buffer.append(record("uno")).await;
        let snapshot = buffer.snapshot().await;
        buffer.append(record("dos")).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.snapshot().await.len(), 2);
    }
}
