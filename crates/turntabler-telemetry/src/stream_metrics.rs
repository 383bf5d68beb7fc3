use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared metrics for cross-thread pipeline monitoring.
///
/// One instance is cloned into the capture session, the jitter buffer and
/// every stream connection; all fields are atomics so no lock is held on
/// the audio path.
#[derive(Clone)]
pub struct StreamMetrics {
    // Producer side
    pub chunks_captured: Arc<AtomicU64>,
    pub driver_overruns: Arc<AtomicU64>,

    // Jitter buffer
    pub chunks_dropped: Arc<AtomicU64>, // overflow-drop policy
    pub pop_timeouts: Arc<AtomicU64>,   // consumer stalls
    pub buffer_depth: Arc<AtomicUsize>,
    pub buffer_capacity: Arc<AtomicUsize>,
    pub prefill_shortfalls: Arc<AtomicU64>,

    // Consumer side
    pub chunks_streamed: Arc<AtomicU64>,
    pub bytes_streamed: Arc<AtomicU64>,
    pub active_connections: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicU64>,

    pub last_chunk_time: Arc<RwLock<Option<Instant>>>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self {
            chunks_captured: Arc::new(AtomicU64::new(0)),
            driver_overruns: Arc::new(AtomicU64::new(0)),
            chunks_dropped: Arc::new(AtomicU64::new(0)),
            pop_timeouts: Arc::new(AtomicU64::new(0)),
            buffer_depth: Arc::new(AtomicUsize::new(0)),
            buffer_capacity: Arc::new(AtomicUsize::new(0)),
            prefill_shortfalls: Arc::new(AtomicU64::new(0)),
            chunks_streamed: Arc::new(AtomicU64::new(0)),
            bytes_streamed: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicU64::new(0)),
            last_chunk_time: Arc::new(RwLock::new(None)),
        }
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk_captured(&self) {
        self.chunks_captured.fetch_add(1, Ordering::Relaxed);
        *self.last_chunk_time.write() = Some(Instant::now());
    }

    pub fn record_overrun(&self, samples: usize) {
        self.driver_overruns.fetch_add(1, Ordering::Relaxed);
        let _ = samples; // sample count is logged at the call site
    }

    pub fn record_chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pop_timeout(&self) {
        self.pop_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_buffer_depth(&self, depth: usize) {
        self.buffer_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_buffer_capacity(&self, capacity: usize) {
        self.buffer_capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn record_prefill_shortfall(&self) {
        self.prefill_shortfalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_streamed(&self, bytes: usize) {
        self.chunks_streamed.fetch_add(1, Ordering::Relaxed);
        self.bytes_streamed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Age of the most recent captured chunk; `None` before first capture.
    pub fn seconds_since_last_chunk(&self) -> Option<f64> {
        self.last_chunk_time
            .read()
            .map(|t| t.elapsed().as_secs_f64())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            driver_overruns: self.driver_overruns.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            pop_timeouts: self.pop_timeouts.load(Ordering::Relaxed),
            buffer_depth: self.buffer_depth.load(Ordering::Relaxed),
            buffer_capacity: self.buffer_capacity.load(Ordering::Relaxed),
            prefill_shortfalls: self.prefill_shortfalls.load(Ordering::Relaxed),
            chunks_streamed: self.chunks_streamed.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters, for logging and the info endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub chunks_captured: u64,
    pub driver_overruns: u64,
    pub chunks_dropped: u64,
    pub pop_timeouts: u64,
    pub buffer_depth: usize,
    pub buffer_capacity: usize,
    pub prefill_shortfalls: u64,
    pub chunks_streamed: u64,
    pub bytes_streamed: u64,
    pub active_connections: usize,
    pub disconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = StreamMetrics::new();
        m.record_chunk_captured();
        m.record_chunk_captured();
        m.record_chunk_dropped();
        m.record_chunk_streamed(4096);
        m.update_buffer_depth(7);

        let snap = m.snapshot();
        assert_eq!(snap.chunks_captured, 2);
        assert_eq!(snap.chunks_dropped, 1);
        assert_eq!(snap.chunks_streamed, 1);
        assert_eq!(snap.bytes_streamed, 4096);
        assert_eq!(snap.buffer_depth, 7);
    }

    #[test]
    fn clones_share_state() {
        let m = StreamMetrics::new();
        let m2 = m.clone();
        m2.record_pop_timeout();
        assert_eq!(m.snapshot().pop_timeouts, 1);
    }

    #[test]
    fn connection_lifecycle() {
        let m = StreamMetrics::new();
        m.connection_opened();
        assert_eq!(m.snapshot().active_connections, 1);
        m.connection_closed();
        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.disconnects, 1);
    }
}
