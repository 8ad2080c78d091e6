use crate::packet::MediaPacket;
use crate::registry::Segment;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::time::Duration;

/// Groups incoming packets into keyframe-aligned segments.
///
/// One accumulator lives inside each ingest worker session; its state is
/// ephemeral and resets on reconnect while the registry's sequence numbering
/// persists.
pub struct SegmentAccumulator {
    buffer: Vec<MediaPacket>,
    prev_key_ts: Duration,
    audio_only: bool,
}

/// A finished segment ready to be committed to the ring.
pub struct PendingSegment {
    pub packets: Vec<MediaPacket>,
    pub duration: Duration,
}

impl SegmentAccumulator {
    pub fn new(audio_only: bool) -> Self {
        Self {
            buffer: Vec::new(),
            prev_key_ts: Duration::ZERO,
            audio_only,
        }
    }

    /// True iff this packet starts a new segment: a keyframe, or any packet
    /// on an audio-only stream.
    pub fn is_boundary(&self, packet: &MediaPacket) -> bool {
        packet.is_keyframe || self.audio_only
    }

    /// Feeds one packet. Returns the completed segment when this packet
    /// closes one; the packet itself always becomes part of the next segment.
    ///
    /// The first boundary seen only arms `prev_key_ts`. A segment whose
    /// computed duration is not positive is discarded: that indicates clock
    /// skew or packet reordering upstream.
    pub fn push(&mut self, packet: &MediaPacket) -> Option<PendingSegment> {
        let mut finished = None;

        if self.is_boundary(packet) {
            if self.prev_key_ts > Duration::ZERO && !self.buffer.is_empty() {
                if packet.time > self.prev_key_ts {
                    finished = Some(PendingSegment {
                        packets: std::mem::take(&mut self.buffer),
                        duration: packet.time - self.prev_key_ts,
                    });
                } else {
                    log::warn!(
                        "Dropping segment with non-positive duration ({:?} -> {:?})",
                        self.prev_key_ts,
                        packet.time
                    );
                    self.buffer.clear();
                }
            }
            self.prev_key_ts = packet.time;
        }

        self.buffer.push(packet.clone());
        finished
    }

    /// Discards buffered state. Called on reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.prev_key_ts = Duration::ZERO;
    }

    pub fn set_audio_only(&mut self, audio_only: bool) {
        self.audio_only = audio_only;
    }
}

/// Renders the m3u8 playlist for the current ring with CRLF line endings.
/// Returns the playlist and the number of segments rendered.
///
/// The media sequence is the sequence number of the oldest segment still in
/// the window, or 0 while the ring is empty.
pub fn render_playlist(next_seq: u64, ring: &BTreeMap<u64, Segment>) -> (String, usize) {
    let media_seq = if ring.is_empty() {
        0
    } else {
        next_seq - ring.len() as u64 + 1
    };

    let mut playlist = String::with_capacity(256);
    playlist.push_str("#EXTM3U\r\n");
    playlist.push_str("#EXT-X-TARGETDURATION:4\r\n");
    playlist.push_str("#EXT-X-VERSION:4\r\n");
    write!(playlist, "#EXT-X-MEDIA-SEQUENCE:{}\r\n", media_seq)
        .expect("writing to a String cannot fail");

    let mut count = 0;
    for (seq, segment) in ring {
        count += 1;
        write!(
            playlist,
            "#EXTINF:{:.1},\r\nsegment/{}/file.ts\r\n",
            segment.duration.as_secs_f64(),
            seq
        )
        .expect("writing to a String cannot fail");
    }

    (playlist, count)
}
