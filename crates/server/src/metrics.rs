use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    messages_ingress: AtomicU64,
    messages_egress: AtomicU64,
    messages_rejected: AtomicU64,
    auth_failures: AtomicU64,
    store_failures: AtomicU64,
    send_queue_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn mark_ingress(&self) {
        self.messages_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.messages_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn messages_egress(&self) -> u64 {
        self.messages_egress.load(Ordering::SeqCst)
    }

    pub fn mark_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_queue_dropped(&self) {
        self.send_queue_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE cifrachat_connections_active gauge\ncifrachat_connections_active {}\n# TYPE cifrachat_messages_ingress counter\ncifrachat_messages_ingress {}\n# TYPE cifrachat_messages_egress counter\ncifrachat_messages_egress {}\n# TYPE cifrachat_messages_rejected counter\ncifrachat_messages_rejected {}\n# TYPE cifrachat_auth_failures counter\ncifrachat_auth_failures {}\n# TYPE cifrachat_store_failures counter\ncifrachat_store_failures {}\n# TYPE cifrachat_send_queue_dropped counter\ncifrachat_send_queue_dropped {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.messages_ingress.load(Ordering::SeqCst),
            self.messages_egress.load(Ordering::SeqCst),
            self.messages_rejected.load(Ordering::SeqCst),
            self.auth_failures.load(Ordering::SeqCst),
            self.store_failures.load(Ordering::SeqCst),
            self.send_queue_dropped.load(Ordering::SeqCst)
        )
    }
}
