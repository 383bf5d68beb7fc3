use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use actix_web::http::header;
use actix_web::web::Bytes;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use turntabler_audio::{AudioFormat, JitterBuffer, Pop};
use turntabler_foundation::AppError;
use turntabler_telemetry::StreamMetrics;

use crate::wav::infinite_wav_header;

/// Short relative to the buffer depth so a stalled consumer is detected
/// quickly without spinning.
pub const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-connection channel depth between the drain thread and the HTTP
/// response; small so network backpressure reaches the jitter buffer.
const DRAIN_CHANNEL_CHUNKS: usize = 4;

#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub host: String,
    pub port: u16,
    pub stream_name: String,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5901,
            stream_name: "TurnTabler".to_string(),
        }
    }
}

/// Shared per-process stream state handed to every request handler. The
/// handlers only ever touch the jitter buffer through push/pop, never its
/// internals, and never the capture session.
pub struct StreamState {
    buffer: JitterBuffer,
    format: AudioFormat,
    metrics: StreamMetrics,
    stream_name: String,
    // One logical stream, at most one active consumer.
    consumer_active: Arc<AtomicBool>,
}

impl StreamState {
    pub fn new(
        buffer: JitterBuffer,
        format: AudioFormat,
        metrics: StreamMetrics,
        stream_name: String,
    ) -> Self {
        Self {
            buffer,
            format,
            metrics,
            stream_name,
            consumer_active: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Builds the HTTP server without starting it; bind failures surface
/// synchronously as startup errors. Signal handling stays with the
/// orchestrator.
pub fn build_server(
    config: &StreamServerConfig,
    buffer: JitterBuffer,
    format: AudioFormat,
    metrics: StreamMetrics,
) -> Result<actix_web::dev::Server, AppError> {
    let state = web::Data::new(StreamState::new(
        buffer,
        format,
        metrics,
        config.stream_name.clone(),
    ));

    tracing::info!(
        "Streaming server on {}:{} ({}Hz, {}ch, {}-bit, {:.2} Mbps)",
        config.host,
        config.port,
        format.sample_rate,
        format.channels,
        format.bits_per_sample,
        format.bandwidth_mbps(),
    );

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(info))
            .route("/stream.wav", web::get().to(stream_wav))
    })
    .disable_signals()
    .bind((config.host.as_str(), config.port))
    .map_err(|e| AppError::Http(format!("Failed to bind {}:{}: {}", config.host, config.port, e)))?
    .run();

    Ok(server)
}

/// Server info endpoint, including a telemetry snapshot.
async fn info(state: web::Data<StreamState>) -> HttpResponse {
    let format = state.format;
    let snap = state.metrics.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "TurnTabler WAV Streaming Server",
        "stream_url": "/stream.wav",
        "stream_name": state.stream_name,
        "format": {
            "sample_rate": format.sample_rate,
            "channels": format.channels,
            "bits_per_sample": format.bits_per_sample,
            "bandwidth_mbps": (format.bandwidth_mbps() * 100.0).round() / 100.0,
        },
        "telemetry": {
            "chunks_captured": snap.chunks_captured,
            "chunks_streamed": snap.chunks_streamed,
            "chunks_dropped": snap.chunks_dropped,
            "driver_overruns": snap.driver_overruns,
            "pop_timeouts": snap.pop_timeouts,
            "buffer_depth": snap.buffer_depth,
            "buffer_capacity": snap.buffer_capacity,
            "bytes_streamed": snap.bytes_streamed,
            "active_connections": snap.active_connections,
            "seconds_since_last_chunk": state.metrics.seconds_since_last_chunk(),
        },
    }))
}

/// WAV streaming endpoint: 44-byte unbounded header, then raw PCM chunks
/// until the client disconnects or the capture session ends.
async fn stream_wav(req: HttpRequest, state: web::Data<StreamState>) -> HttpResponse {
    // Range probes are unsupported on a perpetual stream; reject rather
    // than silently mishandle.
    if req.headers().contains_key(header::RANGE) {
        return HttpResponse::RangeNotSatisfiable()
            .insert_header((header::ACCEPT_RANGES, "none"))
            .finish();
    }

    let slot = match ConsumerSlot::acquire(Arc::clone(&state.consumer_active)) {
        Some(slot) => slot,
        None => {
            tracing::warn!("Rejected concurrent stream request; a consumer is already connected");
            return HttpResponse::Conflict().body("stream already has an active consumer");
        }
    };

    let peer = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!("Stream request from {}", peer);

    let body = spawn_drain_with_guard(
        state.buffer.clone(),
        state.format,
        state.metrics.clone(),
        slot,
    );

    HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(("icy-name", state.stream_name.clone()))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store"))
        .insert_header((header::ACCEPT_RANGES, "none"))
        .streaming(body)
}

/// Marker for the single active consumer; released when the drain thread
/// exits, so a reconnecting client can claim the stream again.
struct ConsumerSlot(Arc<AtomicBool>);

impl ConsumerSlot {
    fn acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Spawns the per-connection drain thread and returns the response body
/// stream. The thread suspends only in `pop`; a failed send means the
/// client is gone and terminates this connection without touching the
/// jitter buffer or the capture session.
pub fn spawn_drain(
    buffer: JitterBuffer,
    format: AudioFormat,
    metrics: StreamMetrics,
) -> ReceiverStream<Result<Bytes, io::Error>> {
    spawn_drain_with_guard(buffer, format, metrics, ())
}

fn spawn_drain_with_guard<G: Send + 'static>(
    buffer: JitterBuffer,
    format: AudioFormat,
    metrics: StreamMetrics,
    guard: G,
) -> ReceiverStream<Result<Bytes, io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(DRAIN_CHANNEL_CHUNKS);

    let spawned = thread::Builder::new()
        .name("stream-drain".to_string())
        .spawn(move || {
            let _guard = guard;
            metrics.connection_opened();

            let header = infinite_wav_header(format);
            let mut chunks_sent = 0u64;

            if tx.blocking_send(Ok(Bytes::copy_from_slice(&header))).is_ok() {
                tracing::debug!("WAV header sent (unbounded size)");
                loop {
                    match buffer.pop(POP_TIMEOUT) {
                        Pop::Chunk(chunk) => {
                            let len = chunk.len();
                            if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                                tracing::info!("Client disconnected after {} chunks", chunks_sent);
                                break;
                            }
                            metrics.record_chunk_streamed(len);
                            chunks_sent += 1;
                            if chunks_sent % 1000 == 0 {
                                tracing::debug!(
                                    "Streamed {} chunks ({:.1} MB)",
                                    chunks_sent,
                                    metrics.snapshot().bytes_streamed as f64 / 1_000_000.0
                                );
                            }
                        }
                        Pop::Empty => {
                            // Timeout already counted by the buffer; keep
                            // waiting rather than fabricating silence.
                            tracing::debug!("No audio within {:?}", POP_TIMEOUT);
                        }
                        Pop::Closed => {
                            tracing::info!(
                                "Capture session ended, closing stream after {} chunks",
                                chunks_sent
                            );
                            break;
                        }
                    }
                }
            }

            metrics.connection_closed();
        });

    if let Err(e) = spawned {
        tracing::error!("Failed to spawn stream drain thread: {}", e);
    }

    ReceiverStream::new(rx)
}
