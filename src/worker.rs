use crate::config::Hls;
use crate::packet::is_audio_only;
use crate::registry::Registry;
use crate::rtsp::{DialOptions, RtspSignal, SessionFactory};
use crate::segmenter::SegmentAccumulator;
use anyhow::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a session loop ended. Decides between reconnect and termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExitReason {
    #[error("stream exit on demand no viewer")]
    NoViewer,
    #[error("stream exit no video on stream")]
    NoVideoOnStream,
    #[error("stream exit rtsp disconnect")]
    RtspDisconnect,
    #[error("stream stop core signal")]
    Shutdown,
}

/// Per-stream ingest worker. Drives one RTSP session at a time, feeds the
/// segmenter and the viewer fan-out, and reconnects on upstream failure.
///
/// Exactly one worker may run per stream; the registry's run lock gates the
/// spawn and is always released on the way out.
pub struct RtspWorker {
    registry: Registry,
    stream_id: String,
    url: String,
    on_demand: bool,
    factory: Arc<dyn SessionFactory>,
    shutdown: CancellationToken,
    timing: Hls,
}

impl RtspWorker {
    pub fn new(
        registry: Registry,
        stream_id: String,
        url: String,
        on_demand: bool,
        factory: Arc<dyn SessionFactory>,
        shutdown: CancellationToken,
        timing: Hls,
    ) -> Self {
        Self {
            registry,
            stream_id,
            url,
            on_demand,
            factory,
            shutdown,
            timing,
        }
    }

    /// Spawns an ingest worker for the stream iff none is running. Returns
    /// true when a worker was started.
    pub async fn ensure_running(
        registry: &Registry,
        factory: &Arc<dyn SessionFactory>,
        shutdown: &CancellationToken,
        timing: &Hls,
        stream_id: &str,
    ) -> bool {
        if !registry.run_if_not_running(stream_id).await {
            return false;
        }

        let info = match registry.get_stream(stream_id).await {
            Ok(info) => info,
            Err(_) => {
                // Stream vanished between the lock and the lookup.
                registry.set_run_lock(stream_id, false).await;
                return false;
            }
        };

        let worker = RtspWorker::new(
            registry.clone(),
            stream_id.to_string(),
            info.url,
            info.on_demand,
            factory.clone(),
            shutdown.clone(),
            timing.clone(),
        );
        tokio::spawn(worker.run());
        true
    }

    pub async fn run(self) {
        loop {
            log::info!("[{}] Stream trying to connect", self.stream_id);

            let outcome = AssertUnwindSafe(self.process_stream()).catch_unwind().await;
            let reconnect = match outcome {
                Ok(Ok(reason)) => {
                    log::info!("[{}] Session ended: {}", self.stream_id, reason);
                    matches!(
                        reason,
                        ExitReason::NoVideoOnStream | ExitReason::RtspDisconnect
                    )
                }
                Ok(Err(err)) => {
                    log::error!("[{}] Stream error: {:#}", self.stream_id, err);
                    true
                }
                Err(_) => {
                    log::error!("[{}] Ingest worker panicked, terminating", self.stream_id);
                    false
                }
            };

            if !reconnect {
                break;
            }
            if self.on_demand && !self.registry.has_viewer(&self.stream_id).await {
                log::info!("[{}] Stream stopped: no viewers", self.stream_id);
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.timing.reconnect_wait()) => {}
            }
        }

        self.registry.set_run_lock(&self.stream_id, false).await;
        log::info!("[{}] Ingest worker stopped", self.stream_id);
    }

    async fn process_stream(&self) -> Result<ExitReason> {
        let mut session = self
            .factory
            .dial(DialOptions {
                url: self.url.clone(),
                dial_timeout: self.timing.dial_timeout(),
                read_write_timeout: self.timing.dial_timeout(),
            })
            .await?;

        if !session.codecs.is_empty() {
            self.registry
                .update_codecs(&self.stream_id, session.codecs.clone())
                .await;
        }
        let mut accumulator = SegmentAccumulator::new(is_audio_only(&session.codecs));

        let keyframe_timeout = self.timing.keyframe_timeout();
        let keyframe_deadline = tokio::time::sleep(keyframe_timeout);
        tokio::pin!(keyframe_deadline);

        // interval() fires immediately; the first viewer check belongs one
        // full period out.
        let mut viewer_check = tokio::time::interval_at(
            Instant::now() + self.timing.viewer_check(),
            self.timing.viewer_check(),
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(ExitReason::Shutdown);
                }

                _ = viewer_check.tick() => {
                    if self.on_demand && !self.registry.has_viewer(&self.stream_id).await {
                        return Ok(ExitReason::NoViewer);
                    }
                }

                _ = &mut keyframe_deadline => {
                    return Ok(ExitReason::NoVideoOnStream);
                }

                signal = session.signals.recv() => {
                    match signal {
                        Some(RtspSignal::CodecUpdate(codecs)) => {
                            accumulator.set_audio_only(is_audio_only(&codecs));
                            self.registry.update_codecs(&self.stream_id, codecs).await;
                        }
                        Some(RtspSignal::RtpStop) | None => {
                            return Ok(ExitReason::RtspDisconnect);
                        }
                    }
                }

                packet = session.packets.recv() => {
                    let packet = match packet {
                        Some(packet) => packet,
                        None => return Ok(ExitReason::RtspDisconnect),
                    };

                    if accumulator.is_boundary(&packet) {
                        keyframe_deadline
                            .as_mut()
                            .reset(Instant::now() + keyframe_timeout);
                    }

                    if let Some(segment) = accumulator.push(&packet) {
                        if let Err(err) = self
                            .registry
                            .add_hls_segment(&self.stream_id, segment.packets, segment.duration)
                            .await
                        {
                            log::error!("[{}] Error adding HLS segment: {}", self.stream_id, err);
                        }
                    }

                    self.registry.broadcast_packet(&self.stream_id, &packet).await;
                }
            }
        }
    }
}
