use std::time::Duration;

use turntabler_audio::{
    CaptureConfig, CaptureSession, CaptureSource, CpalSource, FileSource, JitterBuffer,
    SyntheticSource,
};
use turntabler_foundation::{AppError, AppState, ShutdownHandler, StateManager};
use turntabler_stream::build_server;
use turntabler_telemetry::StreamMetrics;

use crate::config::{Config, SourceKind};

/// Opens the configured capture source. All failures here are startup
/// failures and surface synchronously.
pub fn build_source(config: &Config) -> Result<Box<dyn CaptureSource>, AppError> {
    let format = config.format()?;
    let source: Box<dyn CaptureSource> = match config.audio.source {
        SourceKind::Live => Box::new(CpalSource::open(CaptureConfig {
            device: config.audio.device.clone(),
            format,
            period_frames: config.audio.chunk_frames,
            periods: 3,
        })?),
        SourceKind::Synthetic => Box::new(SyntheticSource::new(
            format,
            config.audio.tone_hz,
            config.audio.tone_amplitude,
        )?),
        SourceKind::File => {
            let path = config.audio.file.as_ref().ok_or_else(|| {
                AppError::Config("file source selected but no file path given".to_string())
            })?;
            Box::new(FileSource::open(path, format)?)
        }
    };
    Ok(source)
}

/// Wires up capture, jitter buffer and HTTP server, then supervises them
/// until a shutdown signal or a session-fatal capture failure.
pub async fn run(config: Config) -> Result<(), AppError> {
    let state = StateManager::new();
    let metrics = StreamMetrics::new();
    let format = config.format()?;

    let capacity = config.capacity_chunks(format);
    let buffer = JitterBuffer::new(capacity, config.overflow_policy(), metrics.clone());
    tracing::info!(
        "Jitter buffer: {} chunks of {} frames ({} ms depth, {:?} on overflow)",
        capacity,
        config.audio.chunk_frames,
        config.buffer.depth_ms,
        config.overflow_policy(),
    );

    let source = build_source(&config)?;
    let session = CaptureSession::start(
        source,
        buffer.clone(),
        config.audio.chunk_frames,
        metrics.clone(),
    )?;

    // Prefill blocks, so it runs off the async runtime. A shortfall starts
    // the service degraded rather than failing it.
    let prefill_target = config.prefill_chunks(format);
    let reached = {
        let buffer = buffer.clone();
        let timeout = config.prefill_timeout();
        tokio::task::spawn_blocking(move || buffer.prefill(prefill_target, timeout))
            .await
            .map_err(|e| AppError::Fatal(format!("Prefill task panicked: {}", e)))?
    };
    if reached {
        state.transition(AppState::Running)?;
    } else {
        state.transition(AppState::Degraded {
            reason: format!("prefill reached {}/{} chunks", buffer.depth(), prefill_target),
        })?;
    }

    // A failed bind must not leave the producer thread running detached.
    let server = match build_server(&config.server_config(), buffer.clone(), format, metrics.clone())
    {
        Ok(server) => server,
        Err(e) => {
            session.stop();
            return Err(e);
        }
    };
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let shutdown = ShutdownHandler::new().install().await;

    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    let mut stats = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!("Shutdown requested");
                break;
            }
            _ = liveness.tick() => {
                if !session.is_alive() {
                    tracing::error!("Capture session ended, shutting down");
                    break;
                }
                if matches!(state.current(), AppState::Degraded { .. })
                    && buffer.depth() >= prefill_target
                {
                    state.transition(AppState::Running)?;
                }
            }
            _ = stats.tick() => {
                let s = metrics.snapshot();
                tracing::info!(
                    "captured={} streamed={} dropped={} overruns={} pop_timeouts={} depth={}/{} connections={}",
                    s.chunks_captured,
                    s.chunks_streamed,
                    s.chunks_dropped,
                    s.driver_overruns,
                    s.pop_timeouts,
                    s.buffer_depth,
                    s.buffer_capacity,
                    s.active_connections,
                );
            }
        }
    }

    state.transition(AppState::Stopping)?;
    // Stop the producer first; drains observe Closed and end their
    // responses before the server is asked to stop.
    session.stop();
    server_handle.stop(true).await;
    let _ = server_task.await;
    state.transition(AppState::Stopped)?;

    let s = metrics.snapshot();
    tracing::info!(
        "Final totals: {} chunks captured, {} streamed ({} bytes), {} dropped, {} overruns, {} disconnects",
        s.chunks_captured,
        s.chunks_streamed,
        s.bytes_streamed,
        s.chunks_dropped,
        s.driver_overruns,
        s.disconnects,
    );
    tracing::info!("Shutdown complete");

    Ok(())
}
