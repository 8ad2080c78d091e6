//! End-to-end scenarios: HTTP handler, registry and ingest worker wired
//! together with scripted camera registries and RTSP sessions.

use anyhow::anyhow;
use async_trait::async_trait;
use hyper::{Body, Method, Request, StatusCode};
use rtspgate::config::Settings;
use rtspgate::errors::{Result as GatewayResult, StreamingError};
use rtspgate::http::{handle_connection, AppContext};
use rtspgate::packet::{CodecData, CodecKind, MediaPacket};
use rtspgate::rtsp::{DialOptions, RtspSession, RtspSignal, SessionFactory};
use rtspgate::{CameraRegistry, MpegTsFactory, Registry, RtspWorker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct StaticCameras(HashMap<String, String>);

impl StaticCameras {
    fn single(id: &str, url: &str) -> Self {
        let mut map = HashMap::new();
        map.insert(id.to_string(), url.to_string());
        Self(map)
    }
}

#[async_trait]
impl CameraRegistry for StaticCameras {
    async fn resolve_url(&self, camera_id: &str) -> GatewayResult<String> {
        self.0
            .get(camera_id)
            .cloned()
            .ok_or_else(|| StreamingError::CameraNotFound {
                camera_id: camera_id.to_string(),
            })
    }
}

/// Session behaviour dealt out per dial.
#[derive(Clone, Copy)]
enum SessionScript {
    /// Keyframes every two seconds, forever.
    Keyframes,
    /// Connects but never produces a packet.
    Silent,
}

struct ScriptedFactory {
    script: SessionScript,
    dials: AtomicUsize,
}

impl ScriptedFactory {
    fn new(script: SessionScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            dials: AtomicUsize::new(0),
        })
    }

    fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn dial(&self, _options: DialOptions) -> anyhow::Result<RtspSession> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let (signal_sender, signals) = mpsc::channel::<RtspSignal>(8);
        let (packet_sender, packets) = mpsc::channel(256);
        let stop = CancellationToken::new();

        match self.script {
            SessionScript::Keyframes => {
                let stop = stop.clone();
                tokio::spawn(async move {
                    let _signals = signal_sender; // held open for the session's life
                    let mut secs = 0u64;
                    loop {
                        let packet = MediaPacket::new_video(
                            Duration::from_secs(secs),
                            true,
                            vec![0xA0; 64],
                        );
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            result = packet_sender.send(packet) => {
                                if result.is_err() {
                                    break;
                                }
                            }
                        }
                        secs += 2;
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                });
            }
            SessionScript::Silent => {
                let stop = stop.clone();
                tokio::spawn(async move {
                    let _signals = signal_sender;
                    let _packets = packet_sender;
                    stop.cancelled().await;
                });
            }
        }

        Ok(RtspSession::new(
            vec![CodecData::new(CodecKind::H264, vec![1u8, 2, 3])],
            signals,
            packets,
            stop,
        ))
    }
}

fn context(cameras: StaticCameras, factory: Arc<ScriptedFactory>) -> Arc<AppContext> {
    Arc::new(AppContext {
        registry: Registry::new(),
        cameras: Arc::new(cameras),
        sessions: factory,
        muxer: Arc::new(MpegTsFactory::new()),
        settings: Settings::default(),
        shutdown: CancellationToken::new(),
    })
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn cold_start_serves_playlist_from_live_ingest() {
    let factory = ScriptedFactory::new(SessionScript::Keyframes);
    let ctx = context(
        StaticCameras::single("cam1", "rtsp://upstream/cam1"),
        factory.clone(),
    );

    let response = handle_connection(ctx.clone(), get("/play/hls/cam1/index.m3u8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let playlist = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(playlist.starts_with("#EXTM3U\r\n"));
    assert!(playlist.matches("#EXTINF:2.0,").count() >= 2);

    assert_eq!(factory.dial_count(), 1);
    ctx.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn cold_start_segment_is_fetchable_as_ts() {
    let factory = ScriptedFactory::new(SessionScript::Keyframes);
    let ctx = context(
        StaticCameras::single("cam1", "rtsp://upstream/cam1"),
        factory,
    );

    let response = handle_connection(ctx.clone(), get("/play/hls/cam1/index.m3u8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = handle_connection(ctx.clone(), get("/play/hls/cam1/segment/1/file.ts"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(bytes.len() % 188, 0);
    assert_eq!(bytes[0], 0x47);

    // Scenario: fetch far beyond the live window.
    let response = handle_connection(ctx.clone(), get("/play/hls/cam1/segment/999999/file.ts"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    ctx.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn unknown_camera_is_rejected_quickly() {
    let factory = ScriptedFactory::new(SessionScript::Keyframes);
    let ctx = context(StaticCameras(HashMap::new()), factory.clone());

    let started = tokio::time::Instant::now();
    let response = handle_connection(ctx, get("/play/hls/ghost/index.m3u8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(factory.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_on_demand_worker_stops_but_stream_survives() {
    let factory = ScriptedFactory::new(SessionScript::Keyframes);
    let ctx = context(
        StaticCameras::single("cam1", "rtsp://upstream/cam1"),
        factory.clone(),
    );

    let response = handle_connection(ctx.clone(), get("/play/hls/cam1/index.m3u8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // No viewers attach; the 20 s viewer check retires the worker.
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(ctx.registry.stream_exists("cam1").await);
    assert_eq!(factory.dial_count(), 1);

    // The run lock was released, so the stream is restartable.
    assert!(ctx.registry.run_if_not_running("cam1").await);
    ctx.registry.set_run_lock("cam1", false).await;
    ctx.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn silent_upstream_triggers_reconnect_cycle() {
    let factory = ScriptedFactory::new(SessionScript::Silent);
    let ctx = context(
        StaticCameras::single("cam1", "rtsp://upstream/cam1"),
        factory.clone(),
    );

    // Register as always-on so the no-viewer check cannot retire the worker.
    ctx.registry
        .add_stream("cam1", "rtsp://upstream/cam1", false)
        .await
        .unwrap();
    assert!(
        RtspWorker::ensure_running(
            &ctx.registry,
            &ctx.sessions,
            &ctx.shutdown,
            &ctx.settings.hls,
            "cam1",
        )
        .await
    );

    // 20 s keyframe watchdog, 5 s backoff, then a fresh dial; give it two
    // full cycles.
    tokio::time::sleep(Duration::from_secs(55)).await;
    assert!(factory.dial_count() >= 2);

    ctx.shutdown.cancel();
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn delete_closes_viewer_channels() {
    let factory = ScriptedFactory::new(SessionScript::Keyframes);
    let ctx = context(StaticCameras(HashMap::new()), factory);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/streams/cam2")
        .body(Body::from(
            r#"{"url":"rtsp://upstream/cam2","on_demand":true}"#,
        ))
        .unwrap();
    let response = handle_connection(ctx.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let (_client_id, mut viewer) = ctx.registry.add_client("cam2").await.unwrap();

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/streams/cam2")
        .body(Body::empty())
        .unwrap();
    let response = handle_connection(ctx.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(matches!(
        viewer.recv().await,
        None
    ));

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/streams/cam2")
        .body(Body::empty())
        .unwrap();
    let response = handle_connection(ctx, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
