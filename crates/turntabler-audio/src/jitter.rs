use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use turntabler_foundation::AudioError;
use turntabler_telemetry::StreamMetrics;

use crate::source::CaptureSource;

/// What to do when the producer has a chunk ready and the buffer is full.
///
/// `DropOldest` favors freshness over completeness: losing the oldest queued
/// audio is audible but rare, whereas blocking a live-hardware producer risks
/// a driver-level overrun that loses the same data less predictably.
/// `Block` back-pressures the producer and only makes sense for file or
/// synthetic sources, which have no hardware to overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    Block,
}

/// Outcome of a single `pop`. `Empty` means no data arrived within the
/// timeout but more may come; `Closed` means the session ended and the
/// queue is drained, so no data will ever come.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Chunk(Vec<u8>),
    Empty,
    Closed,
}

struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    data_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
    overflow: OverflowPolicy,
    metrics: StreamMetrics,
}

/// Bounded FIFO absorbing timing variance between the fixed-cadence capture
/// thread and the network-paced consumer.
///
/// The producer thread exclusively appends, the per-connection drain
/// exclusively removes from the front; occupancy stays in [0, capacity]
/// and chunks are delivered in exact capture order.
#[derive(Clone)]
pub struct JitterBuffer {
    shared: Arc<Shared>,
}

impl JitterBuffer {
    pub fn new(capacity: usize, overflow: OverflowPolicy, metrics: StreamMetrics) -> Self {
        assert!(capacity > 0, "jitter buffer capacity must be non-zero");
        metrics.set_buffer_capacity(capacity);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    chunks: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                data_ready: Condvar::new(),
                space_ready: Condvar::new(),
                capacity,
                overflow,
                metrics,
            }),
        }
    }

    /// Appends a chunk, applying the overflow policy when full.
    /// Returns false once the buffer is closed.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        let mut state = self.shared.state.lock();

        if self.shared.overflow == OverflowPolicy::Block {
            while state.chunks.len() >= self.shared.capacity && !state.closed {
                self.shared.space_ready.wait(&mut state);
            }
        }
        if state.closed {
            return false;
        }

        if state.chunks.len() >= self.shared.capacity {
            // DropOldest: evict the front so the newest audio keeps flowing.
            state.chunks.pop_front();
            self.shared.metrics.record_chunk_dropped();
            tracing::warn!(
                "Jitter buffer full ({} chunks), dropped oldest chunk",
                self.shared.capacity
            );
        }

        state.chunks.push_back(chunk);
        self.shared.metrics.update_buffer_depth(state.chunks.len());
        self.shared.data_ready.notify_one();
        true
    }

    /// Removes and returns the oldest chunk, blocking up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                self.shared.metrics.update_buffer_depth(state.chunks.len());
                self.shared.space_ready.notify_one();
                return Pop::Chunk(chunk);
            }
            if state.closed {
                return Pop::Closed;
            }
            if Instant::now() >= deadline {
                self.shared.metrics.record_pop_timeout();
                return Pop::Empty;
            }
            self.shared.data_ready.wait_until(&mut state, deadline);
        }
    }

    /// Blocks the caller (never the producer) until the buffer holds at
    /// least `target` chunks or the timeout elapses. Returns whether the
    /// target was reached; a shortfall is degraded startup, not an error.
    pub fn prefill(&self, target: usize, timeout: Duration) -> bool {
        let target = target.min(self.shared.capacity);
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        while state.chunks.len() < target && !state.closed {
            if Instant::now() >= deadline {
                break;
            }
            self.shared.data_ready.wait_until(&mut state, deadline);
        }

        let reached = state.chunks.len() >= target;
        if !reached {
            self.shared.metrics.record_prefill_shortfall();
            tracing::warn!(
                "Prefill reached {}/{} chunks before timeout, starting degraded",
                state.chunks.len(),
                target
            );
        }
        reached
    }

    /// Marks the session as ended. Queued chunks remain poppable; once
    /// drained, `pop` reports `Closed`. Wakes all waiters, including a
    /// producer blocked on a full buffer.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            self.shared.data_ready.notify_all();
            self.shared.space_ready.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn depth(&self) -> usize {
        self.shared.state.lock().chunks.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Lifecycle of one capture run: a dedicated producer thread looping
/// blocking reads into the jitter buffer. The thread owns the source
/// exclusively; the consumer side only ever sees the buffer.
pub struct CaptureSession {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    buffer: JitterBuffer,
}

impl CaptureSession {
    pub fn start(
        mut source: Box<dyn CaptureSource>,
        buffer: JitterBuffer,
        chunk_frames: usize,
        metrics: StreamMetrics,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_buffer = buffer.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                tracing::info!("Capture producer thread started");

                while thread_running.load(Ordering::SeqCst) {
                    match source.read_chunk(chunk_frames) {
                        Ok(Some(chunk)) => {
                            metrics.record_chunk_captured();
                            if !thread_buffer.push(chunk) {
                                tracing::info!("Jitter buffer closed, capture stopping");
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::info!("Capture source signalled end of stream");
                            break;
                        }
                        Err(AudioError::Overrun { samples }) => {
                            metrics.record_overrun(samples);
                            tracing::warn!(
                                "Driver overrun, lost {} samples, continuing",
                                samples
                            );
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!("Transient capture error, continuing: {}", e);
                        }
                        Err(e) => {
                            tracing::error!("Fatal capture error, ending session: {}", e);
                            break;
                        }
                    }
                }

                source.close();
                thread_buffer.close();
                tracing::info!("Capture producer thread exited");
            })
            .map_err(|e| AudioError::Fatal(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
            running,
            buffer,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.buffer.is_closed()
    }

    /// Signals the producer to exit after its current blocking read and
    /// joins it. Hardware reads return within one period, so the join is
    /// bounded in practice; closing the buffer first also frees a producer
    /// blocked by the Block overflow policy.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.buffer.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::source::SyntheticSource;
    use turntabler_foundation::AudioError;

    fn buffer(capacity: usize, overflow: OverflowPolicy) -> (JitterBuffer, StreamMetrics) {
        let metrics = StreamMetrics::new();
        (
            JitterBuffer::new(capacity, overflow, metrics.clone()),
            metrics,
        )
    }

    fn chunk(seq: u8) -> Vec<u8> {
        vec![seq; 8]
    }

    #[test]
    fn strict_fifo_order() {
        let (buf, _) = buffer(16, OverflowPolicy::DropOldest);
        for seq in 0..10 {
            assert!(buf.push(chunk(seq)));
        }
        for seq in 0..10 {
            assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Chunk(chunk(seq)));
        }
    }

    #[test]
    fn occupancy_is_bounded_and_drop_oldest_evicts_front() {
        let (buf, metrics) = buffer(4, OverflowPolicy::DropOldest);
        for seq in 0..7 {
            assert!(buf.push(chunk(seq)));
            assert!(buf.depth() <= 4);
        }
        assert_eq!(metrics.snapshot().chunks_dropped, 3);
        // Chunks 0..3 were evicted; the freshest four remain in order.
        for seq in 3..7 {
            assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Chunk(chunk(seq)));
        }
    }

    #[test]
    fn pop_times_out_rather_than_fabricating_data() {
        let (buf, metrics) = buffer(4, OverflowPolicy::DropOldest);
        let start = Instant::now();
        assert_eq!(buf.pop(Duration::from_millis(50)), Pop::Empty);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(metrics.snapshot().pop_timeouts, 1);
    }

    #[test]
    fn pop_distinguishes_closed_from_empty() {
        let (buf, _) = buffer(4, OverflowPolicy::DropOldest);
        buf.push(chunk(1));
        buf.close();
        // Queued data is still drained after close, then Closed is final.
        assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Chunk(chunk(1)));
        assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Closed);
        assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Closed);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let (buf, _) = buffer(4, OverflowPolicy::DropOldest);
        buf.close();
        assert!(!buf.push(chunk(1)));
    }

    #[test]
    fn block_policy_backpressures_producer() {
        let (buf, metrics) = buffer(2, OverflowPolicy::Block);
        buf.push(chunk(0));
        buf.push(chunk(1));

        let pusher = {
            let buf = buf.clone();
            thread::spawn(move || {
                let start = Instant::now();
                assert!(buf.push(chunk(2)));
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Chunk(chunk(0)));
        let blocked_for = pusher.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(40));
        assert_eq!(metrics.snapshot().chunks_dropped, 0);
    }

    #[test]
    fn close_frees_blocked_producer() {
        let (buf, _) = buffer(1, OverflowPolicy::Block);
        buf.push(chunk(0));
        let pusher = {
            let buf = buf.clone();
            thread::spawn(move || buf.push(chunk(1)))
        };
        thread::sleep(Duration::from_millis(30));
        buf.close();
        assert!(!pusher.join().unwrap());
    }

    #[test]
    fn prefill_reaches_target_with_live_producer() {
        let (buf, _) = buffer(64, OverflowPolicy::DropOldest);
        let metrics = StreamMetrics::new();
        let source = SyntheticSource::unpaced(AudioFormat::default(), 440.0, 0.5).unwrap();
        let session =
            CaptureSession::start(Box::new(source), buf.clone(), 256, metrics).unwrap();

        assert!(buf.prefill(24, Duration::from_secs(2)));
        assert!(buf.depth() >= 24);
        session.stop();
    }

    #[test]
    fn prefill_shortfall_is_reported_not_fatal() {
        let (buf, metrics) = buffer(64, OverflowPolicy::DropOldest);
        buf.push(chunk(0));
        assert!(!buf.prefill(10, Duration::from_millis(50)));
        assert_eq!(metrics.snapshot().prefill_shortfalls, 1);
        // Streaming proceeds regardless.
        assert_eq!(buf.pop(Duration::from_millis(10)), Pop::Chunk(chunk(0)));
    }

    #[test]
    fn stop_joins_producer_and_closes_buffer() {
        let (buf, _) = buffer(32, OverflowPolicy::DropOldest);
        let metrics = StreamMetrics::new();
        let source = SyntheticSource::unpaced(AudioFormat::default(), 440.0, 0.5).unwrap();
        let session =
            CaptureSession::start(Box::new(source), buf.clone(), 256, metrics).unwrap();
        assert!(session.is_alive());
        session.stop();
        assert!(buf.is_closed());
    }

    /// Source that fails fatally on a scripted read.
    struct FailingSource {
        reads: usize,
        fail_on: usize,
    }

    impl CaptureSource for FailingSource {
        fn format(&self) -> AudioFormat {
            AudioFormat::default()
        }

        fn read_chunk(&mut self, _frames: usize) -> Result<Option<Vec<u8>>, AudioError> {
            self.reads += 1;
            if self.reads >= self.fail_on {
                Err(AudioError::DeviceDisconnected)
            } else {
                Ok(Some(vec![self.reads as u8; 8]))
            }
        }

        fn close(&mut self) {}
    }

    #[test]
    fn fatal_source_error_closes_buffer_for_consumer() {
        let (buf, _) = buffer(32, OverflowPolicy::DropOldest);
        let metrics = StreamMetrics::new();
        let source = FailingSource { reads: 0, fail_on: 3 };
        let session =
            CaptureSession::start(Box::new(source), buf.clone(), 256, metrics).unwrap();

        // The two good chunks arrive in order, then the consumer observes
        // end-of-session instead of hanging.
        assert_eq!(buf.pop(Duration::from_millis(500)), Pop::Chunk(vec![1u8; 8]));
        assert_eq!(buf.pop(Duration::from_millis(500)), Pop::Chunk(vec![2u8; 8]));
        let mut outcome = buf.pop(Duration::from_millis(500));
        while outcome == Pop::Empty {
            outcome = buf.pop(Duration::from_millis(500));
        }
        assert_eq!(outcome, Pop::Closed);
        assert!(!session.is_alive());
        session.stop();
    }

    /// Source that reports a driver overrun on one scripted read and stamps
    /// each chunk with a sequence number. Emits a bounded run so the test
    /// buffer never overflows.
    struct OverrunSource {
        reads: usize,
        overrun_on: usize,
        last_read: usize,
        seq: u8,
    }

    impl CaptureSource for OverrunSource {
        fn format(&self) -> AudioFormat {
            AudioFormat::default()
        }

        fn read_chunk(&mut self, _frames: usize) -> Result<Option<Vec<u8>>, AudioError> {
            self.reads += 1;
            if self.reads > self.last_read {
                return Ok(None);
            }
            if self.reads == self.overrun_on {
                return Err(AudioError::Overrun { samples: 1024 });
            }
            self.seq += 1;
            Ok(Some(vec![self.seq; 8]))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn overrun_is_logged_and_capture_continues_in_order() {
        let (buf, _) = buffer(64, OverflowPolicy::DropOldest);
        let metrics = StreamMetrics::new();
        let source = OverrunSource {
            reads: 0,
            overrun_on: 5,
            last_read: 20,
            seq: 0,
        };
        let session =
            CaptureSession::start(Box::new(source), buf.clone(), 256, metrics.clone()).unwrap();

        // Reads 1-4 produce chunks 1-4, read 5 overruns, reads 6+ resume
        // with chunk 5: no gap in the emitted sequence beyond the lost
        // samples themselves.
        for seq in 1..=8u8 {
            let mut outcome = buf.pop(Duration::from_millis(500));
            while outcome == Pop::Empty {
                outcome = buf.pop(Duration::from_millis(500));
            }
            assert_eq!(outcome, Pop::Chunk(vec![seq; 8]));
        }
        assert_eq!(metrics.snapshot().driver_overruns, 1);
        assert!(session.is_alive());
        session.stop();
    }
}
