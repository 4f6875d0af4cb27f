use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    states_built: Arc<AtomicU64>,
    states_applied: Arc<AtomicU64>,
    chunks_written: Arc<AtomicU64>,
    chunks_received: Arc<AtomicU64>,
    chunks_rejected: Arc<AtomicU64>,
    chunks_served: Arc<AtomicU64>,
    confirmations_seen: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_states_built(&self) {
        self.states_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_states_applied(&self) {
        self.states_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunks_written(&self, n: u64) {
        self.chunks_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_chunks_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_rejected(&self) {
        self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_served(&self) {
        self.chunks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_confirmations_seen(&self) {
        self.confirmations_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) {
        tracing::info!(
            "Metrics: built={} applied={} chunks_written={} received={} rejected={} served={} confirmations={}",
            self.states_built.load(Ordering::Relaxed),
            self.states_applied.load(Ordering::Relaxed),
            self.chunks_written.load(Ordering::Relaxed),
            self.chunks_received.load(Ordering::Relaxed),
            self.chunks_rejected.load(Ordering::Relaxed),
            self.chunks_served.load(Ordering::Relaxed),
            self.confirmations_seen.load(Ordering::Relaxed),
        );
    }
}
