use crate::camera::CameraRegistry;
use crate::config::Settings;
use crate::errors::{ErrorHandler, StreamingError};
use crate::mux::{self, MuxerFactory};
use crate::registry::Registry;
use crate::rtsp::SessionFactory;
use crate::worker::RtspWorker;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the HTTP handlers need, constructed once in `main` and shared.
/// No process-wide singletons.
pub struct AppContext {
    pub registry: Registry,
    pub cameras: Arc<dyn CameraRegistry>,
    pub sessions: Arc<dyn SessionFactory>,
    pub muxer: Arc<dyn MuxerFactory>,
    pub settings: Settings,
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct CreateStreamRequest {
    url: String,
    #[serde(default)]
    on_demand: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
}

#[derive(Serialize)]
struct CreateStreamResponse {
    status: String,
    id: String,
}

#[derive(Serialize)]
struct ListStreamsResponse {
    status: String,
    streams: Vec<String>,
}

pub async fn handle_connection(
    ctx: Arc<AppContext>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let origin = resolve_origin(&ctx.settings, req.headers());

    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        response
            .headers_mut()
            .insert("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS".parse().unwrap());
        response
            .headers_mut()
            .insert("Access-Control-Allow-Headers", "Content-Type".parse().unwrap());
        response
            .headers_mut()
            .insert("Access-Control-Max-Age", "86400".parse().unwrap());
        apply_origin(&mut response, origin.as_deref());
        return Ok(response);
    }

    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    log::debug!("{} {}", req.method(), path);

    let method = req.method().as_str().to_string();
    let mut response = match (method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => ErrorHandler::handle_success(
            StatusCode::OK,
            StatusResponse {
                status: "ok".to_string(),
            },
        ),

        ("GET", ["play", "hls", id, "index.m3u8"]) => play_hls(&ctx, id).await,

        ("GET", ["play", "hls", id, "segment", seq, "file.ts"]) => {
            play_hls_ts(&ctx, id, seq).await
        }

        ("GET", ["api", "streams"]) => {
            let streams = ctx.registry.list_streams().await;
            ErrorHandler::handle_success(
                StatusCode::OK,
                ListStreamsResponse {
                    status: "success".to_string(),
                    streams,
                },
            )
        }

        ("POST", ["api", "streams", id]) => {
            let id = id.to_string();
            create_stream(&ctx, &id, req).await
        }

        ("DELETE", ["api", "streams", id]) => delete_stream(&ctx, id).await,

        _ => not_found(),
    };

    apply_origin(&mut response, origin.as_deref());
    Ok(response)
}

/// Resolves the stream (lazily registering it from the camera registry),
/// makes sure an ingest worker is running and waits for the playlist window
/// to fill before answering.
async fn play_hls(ctx: &Arc<AppContext>, id: &str) -> Response<Body> {
    if !ctx.registry.stream_exists(id).await {
        let url = match ctx.cameras.resolve_url(id).await {
            Ok(url) => url,
            Err(err) => {
                log::warn!("Failed to resolve camera {}: {}", id, err);
                return ErrorHandler::handle_error(&err);
            }
        };

        // A concurrent request may have won the registration race; that is
        // fine, the run lock below still admits a single worker.
        if let Err(err) = ctx.registry.add_stream(id, &url, true).await {
            if !matches!(err, StreamingError::StreamAlreadyExists { .. }) {
                return ErrorHandler::handle_error(&err);
            }
        }
    }

    RtspWorker::ensure_running(
        &ctx.registry,
        &ctx.sessions,
        &ctx.shutdown,
        &ctx.settings.hls,
        id,
    )
    .await;

    let attempts = ctx.settings.hls.playlist_wait_attempts;
    for attempt in 0..attempts {
        match ctx.registry.get_hls_m3u8(id).await {
            Ok((playlist, count)) if count >= ctx.settings.hls.min_playlist_segments => {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/vnd.apple.mpegurl")
                    .header("Cache-Control", "no-cache")
                    .body(Body::from(playlist))
                    .unwrap();
            }
            Ok(_) => {
                if attempt == 0 || attempt == attempts / 2 {
                    log::info!("Waiting for HLS segments on {} ({}/{})", id, attempt + 1, attempts);
                }
                tokio::time::sleep(ctx.settings.hls.playlist_wait_interval()).await;
            }
            Err(err) => return ErrorHandler::handle_error(&err),
        }
    }

    Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .body(Body::from("Timeout waiting for stream to initialize"))
        .unwrap()
}

async fn play_hls_ts(ctx: &Arc<AppContext>, id: &str, seq: &str) -> Response<Body> {
    let seq: u64 = match seq.parse() {
        Ok(seq) => seq,
        Err(_) => {
            return ErrorHandler::handle_error(&StreamingError::InvalidRequest {
                message: format!("Invalid segment number: {}", seq),
            });
        }
    };

    // Blocks up to 5 s while the ingest worker publishes codec data.
    let codecs = match ctx.registry.get_codecs(id).await {
        Ok(codecs) => codecs,
        Err(err) => return ErrorHandler::handle_error(&err),
    };

    let packets = match ctx.registry.get_hls_segment(id, seq).await {
        Ok(packets) => packets,
        Err(err) => return ErrorHandler::handle_error(&err),
    };
    if packets.is_empty() {
        return ErrorHandler::handle_error(&StreamingError::SegmentNotFound {
            stream_id: id.to_string(),
            seq,
        });
    }

    match mux::mux_segment(ctx.muxer.as_ref(), &codecs, &packets) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "video/mp2t")
            .header("Cache-Control", "no-cache")
            .body(Body::from(bytes))
            .unwrap(),
        Err(err) => ErrorHandler::handle_error(&err),
    }
}

async fn create_stream(ctx: &Arc<AppContext>, id: &str, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            return ErrorHandler::handle_error(&StreamingError::InvalidRequest {
                message: format!("Failed to read request body: {}", e),
            });
        }
    };

    let request: CreateStreamRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ErrorHandler::handle_error(&StreamingError::InvalidRequest {
                message: format!("Invalid request body: {}", e),
            });
        }
    };

    match ctx
        .registry
        .add_stream(id, &request.url, request.on_demand)
        .await
    {
        Ok(()) => ErrorHandler::handle_success(
            StatusCode::CREATED,
            CreateStreamResponse {
                status: "success".to_string(),
                id: id.to_string(),
            },
        ),
        Err(err) => ErrorHandler::handle_error(&err),
    }
}

async fn delete_stream(ctx: &Arc<AppContext>, id: &str) -> Response<Body> {
    if ctx.registry.remove_stream(id).await {
        ErrorHandler::handle_success(
            StatusCode::OK,
            StatusResponse {
                status: "success".to_string(),
            },
        )
    } else {
        ErrorHandler::handle_error(&StreamingError::StreamNotFound {
            stream_id: id.to_string(),
        })
    }
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not Found"))
        .unwrap()
}

fn resolve_origin(settings: &Settings, headers: &HeaderMap) -> Option<String> {
    let origins = settings.origins();
    if origins.iter().any(|o| o == "*") {
        return Some("*".to_string());
    }
    let request_origin = headers.get("origin")?.to_str().ok()?;
    origins
        .iter()
        .find(|o| o.as_str() == request_origin)
        .cloned()
}

fn apply_origin(response: &mut Response<Body>, origin: Option<&str>) {
    if let Some(origin) = origin {
        if let Ok(value) = origin.parse() {
            response
                .headers_mut()
                .insert("Access-Control-Allow-Origin", value);
        }
    }
}

/// The HTTP front: binds the configured address and serves until the
/// shutdown token fires.
pub struct Service {
    ctx: Arc<AppContext>,
}

impl Service {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self) -> crate::errors::Result<()> {
        let listen_address = format!(
            "{}:{}",
            self.ctx.settings.app_host, self.ctx.settings.app_port
        );
        let sock_addr = listen_address
            .parse()
            .map_err(|e| StreamingError::ConfigError {
                message: format!("Invalid listen address {}: {}", listen_address, e),
            })?;

        let ctx = self.ctx.clone();
        let new_service = make_service_fn(move |_| {
            let ctx = ctx.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_connection(ctx.clone(), req)))
            }
        });

        let shutdown = self.ctx.shutdown.clone();
        let server = Server::bind(&sock_addr)
            .serve(new_service)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        log::info!("HLS gateway listening on http://{}", sock_addr);

        server.await.map_err(|e| StreamingError::InternalError {
            message: format!("HTTP server failed: {}", e),
        })
    }
}
