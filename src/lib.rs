pub mod camera;
pub mod config;
pub mod errors;
pub mod http;
pub mod mux;
pub mod packet;
pub mod registry;
pub mod rtsp;
pub mod segmenter;
pub mod worker;

/// Logical camera identifier used as the stream key everywhere.
pub type StreamId = String;

pub use self::{
    camera::{CameraRegistry, PgCameraRegistry},
    mux::{MpegTsFactory, MuxerFactory},
    registry::Registry,
    rtsp::{RetinaFactory, RtspSession, RtspSignal, SessionFactory},
    worker::{ExitReason, RtspWorker},
};
