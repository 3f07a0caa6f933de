use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    envelopes_relayed: AtomicU64,
    envelopes_dropped: AtomicU64,
    slow_consumer_evictions: AtomicU64,
    matches_made: AtomicU64,
    codes_issued: AtomicU64,
    http_rate_limited: AtomicU64,
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

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relayed(&self) {
        self.envelopes_relayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_dropped(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_slow_consumer(&self) {
        self.slow_consumer_evictions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_match(&self) {
        self.matches_made.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_code_issued(&self) {
        self.codes_issued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_http_rate_limited(&self) {
        self.http_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE sotto_connections_active gauge\nsotto_connections_active {}\n# TYPE sotto_frames_ingress counter\nsotto_frames_ingress {}\n# TYPE sotto_frames_egress counter\nsotto_frames_egress {}\n# TYPE sotto_envelopes_relayed counter\nsotto_envelopes_relayed {}\n# TYPE sotto_envelopes_dropped counter\nsotto_envelopes_dropped {}\n# TYPE sotto_slow_consumer_evictions counter\nsotto_slow_consumer_evictions {}\n# TYPE sotto_matches_made counter\nsotto_matches_made {}\n# TYPE sotto_codes_issued counter\nsotto_codes_issued {}\n# TYPE sotto_http_rate_limited counter\nsotto_http_rate_limited {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.envelopes_relayed.load(Ordering::SeqCst),
            self.envelopes_dropped.load(Ordering::SeqCst),
            self.slow_consumer_evictions.load(Ordering::SeqCst),
            self.matches_made.load(Ordering::SeqCst),
            self.codes_issued.load(Ordering::SeqCst),
            self.http_rate_limited.load(Ordering::SeqCst)
        )
    }
}
