use crate::errors::{Result, StreamingError};
use crate::packet::{CodecData, MediaPacket};
use crate::segmenter;
use crate::StreamId;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as FmtWrite;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Most recent segments kept per stream. Older entries are evicted.
pub const MAX_SEGMENTS: usize = 6;

/// Capacity of each viewer packet queue. Full queues drop packets.
pub const VIEWER_QUEUE_CAPACITY: usize = 100;

const CODEC_WAIT_ATTEMPTS: u32 = 100;
const CODEC_WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// A cached HLS segment: a keyframe-aligned run of packets.
#[derive(Debug, Clone)]
pub struct Segment {
    pub duration: Duration,
    pub packets: Vec<MediaPacket>,
}

/// A connected live viewer, keyed by an opaque client id.
struct Viewer {
    sender: mpsc::Sender<MediaPacket>,
}

struct StreamState {
    url: String,
    on_demand: bool,
    run_lock: bool,
    codecs: Vec<CodecData>,
    ring: BTreeMap<u64, Segment>,
    next_seq: u64,
    viewers: HashMap<String, Viewer>,
}

impl StreamState {
    fn new(url: String, on_demand: bool) -> Self {
        Self {
            url,
            on_demand,
            run_lock: false,
            codecs: Vec::new(),
            ring: BTreeMap::new(),
            next_seq: 0,
            viewers: HashMap::new(),
        }
    }
}

/// Read-only stream attributes handed out to callers.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub url: String,
    pub on_demand: bool,
}

/// Thread-safe store of per-stream state. One readers-writer lock guards the
/// whole map; no operation holds it across I/O or sleeps.
#[derive(Clone)]
pub struct Registry {
    streams: Arc<RwLock<HashMap<StreamId, StreamState>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_stream(&self, id: &str, url: &str, on_demand: bool) -> Result<()> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(id) {
            return Err(StreamingError::StreamAlreadyExists {
                stream_id: id.to_string(),
            });
        }
        streams.insert(id.to_string(), StreamState::new(url.to_string(), on_demand));
        log::info!("Registered stream {} ({})", id, url);
        Ok(())
    }

    /// Drops the stream and all its viewer senders. Dropping a sender closes
    /// that viewer's channel. Idempotent.
    pub async fn remove_stream(&self, id: &str) -> bool {
        let mut streams = self.streams.write().await;
        if streams.remove(id).is_some() {
            log::info!("Removed stream {}", id);
            true
        } else {
            false
        }
    }

    pub async fn get_stream(&self, id: &str) -> Result<StreamInfo> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;
        Ok(StreamInfo {
            url: stream.url.clone(),
            on_demand: stream.on_demand,
        })
    }

    pub async fn stream_exists(&self, id: &str) -> bool {
        self.streams.read().await.contains_key(id)
    }

    /// Atomically tests `run_lock == false` and sets it. Returns true iff
    /// the caller acquired the lock and must start the ingest worker.
    pub async fn run_if_not_running(&self, id: &str) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get_mut(id) {
            Some(stream) if !stream.run_lock => {
                stream.run_lock = true;
                true
            }
            _ => false,
        }
    }

    pub async fn set_run_lock(&self, id: &str, lock: bool) {
        let mut streams = self.streams.write().await;
        if let Some(stream) = streams.get_mut(id) {
            stream.run_lock = lock;
        }
    }

    pub async fn has_viewer(&self, id: &str) -> bool {
        let streams = self.streams.read().await;
        streams
            .get(id)
            .map(|s| !s.viewers.is_empty())
            .unwrap_or(false)
    }

    /// Non-blocking fan-out to every viewer queue. A full queue drops the
    /// packet for that viewer; the ingest loop is never blocked.
    pub async fn broadcast_packet(&self, id: &str, packet: &MediaPacket) {
        let streams = self.streams.read().await;
        let stream = match streams.get(id) {
            Some(stream) => stream,
            None => return,
        };

        for (client_id, viewer) in &stream.viewers {
            if let Err(mpsc::error::TrySendError::Full(_)) = viewer.sender.try_send(packet.clone())
            {
                log::debug!("Viewer {} queue full on stream {}, packet dropped", client_id, id);
            }
        }
    }

    pub async fn update_codecs(&self, id: &str, codecs: Vec<CodecData>) {
        let mut streams = self.streams.write().await;
        if let Some(stream) = streams.get_mut(id) {
            stream.codecs = codecs;
        }
    }

    /// Waits for the ingest worker to publish codec data. Polls with the
    /// lock released between attempts so writers are never starved; gives up
    /// with `CodecNotReady` after ~5 s.
    pub async fn get_codecs(&self, id: &str) -> Result<Vec<CodecData>> {
        for _ in 0..CODEC_WAIT_ATTEMPTS {
            {
                let streams = self.streams.read().await;
                let stream = streams
                    .get(id)
                    .ok_or_else(|| StreamingError::StreamNotFound {
                        stream_id: id.to_string(),
                    })?;
                if !stream.codecs.is_empty() {
                    return Ok(stream.codecs.clone());
                }
            }
            tokio::time::sleep(CODEC_WAIT_INTERVAL).await;
        }

        Err(StreamingError::CodecNotReady {
            stream_id: id.to_string(),
        })
    }

    pub async fn add_client(&self, id: &str) -> Result<(String, mpsc::Receiver<MediaPacket>)> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;

        let client_id = generate_client_id();
        let (sender, receiver) = mpsc::channel(VIEWER_QUEUE_CAPACITY);
        stream.viewers.insert(client_id.clone(), Viewer { sender });

        Ok((client_id, receiver))
    }

    /// Removes the viewer, dropping its sender. Idempotent.
    pub async fn remove_client(&self, stream_id: &str, client_id: &str) {
        let mut streams = self.streams.write().await;
        if let Some(stream) = streams.get_mut(stream_id) {
            stream.viewers.remove(client_id);
        }
    }

    pub async fn list_streams(&self) -> Vec<String> {
        let streams = self.streams.read().await;
        let mut result: Vec<String> = streams.keys().cloned().collect();
        result.sort();
        result
    }

    /// Commits a finished segment: assigns the next sequence number, inserts
    /// into the ring and evicts the lowest-numbered entries past the cap.
    pub async fn add_hls_segment(
        &self,
        id: &str,
        packets: Vec<MediaPacket>,
        duration: Duration,
    ) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;

        stream.next_seq += 1;
        stream.ring.insert(stream.next_seq, Segment { duration, packets });

        while stream.ring.len() > MAX_SEGMENTS {
            stream.ring.pop_first();
        }

        Ok(())
    }

    /// Renders the sliding-window playlist. Also returns the number of
    /// segments rendered so callers can wait for the window to fill.
    pub async fn get_hls_m3u8(&self, id: &str) -> Result<(String, usize)> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;

        Ok(segmenter::render_playlist(stream.next_seq, &stream.ring))
    }

    pub async fn get_hls_segment(&self, id: &str, seq: u64) -> Result<Vec<MediaPacket>> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;

        let segment = stream
            .ring
            .get(&seq)
            .ok_or(StreamingError::SegmentNotFound {
                stream_id: id.to_string(),
                seq,
            })?;

        Ok(segment.packets.clone())
    }

    /// Administrative reset: clears the ring and restarts sequence numbering.
    pub async fn flush_hls_segments(&self, id: &str) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(id)
            .ok_or_else(|| StreamingError::StreamNotFound {
                stream_id: id.to_string(),
            })?;

        stream.ring.clear();
        stream.next_seq = 0;
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque 128-bit random client id, formatted as uppercase hex groups
/// 4-2-2-2-6.
fn generate_client_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);

    let hex = |out: &mut String, range: &[u8]| {
        for b in range {
            write!(out, "{:02X}", b).expect("writing to a String cannot fail");
        }
    };

    let mut id = String::with_capacity(36);
    hex(&mut id, &bytes[0..4]);
    id.push('-');
    hex(&mut id, &bytes[4..6]);
    id.push('-');
    hex(&mut id, &bytes[6..8]);
    id.push('-');
    hex(&mut id, &bytes[8..10]);
    id.push('-');
    hex(&mut id, &bytes[10..16]);
    id
}
