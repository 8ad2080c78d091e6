use bytes::Bytes;
use std::time::Duration;

/// Kind of media carried by a [`MediaPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
}

/// One demultiplexed media packet as received from the RTSP session.
///
/// Payloads are reference-counted [`Bytes`]: cloning a packet into the
/// segment buffer or a viewer queue is cheap, and the payload is immutable
/// once handed off.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: PacketKind,
    /// Presentation time measured from the start of the session.
    pub time: Duration,
    pub is_keyframe: bool,
    /// PTS-DTS offset in milliseconds; zero means "PTS only".
    pub composition_time: u32,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn new<B>(kind: PacketKind, time: Duration, is_keyframe: bool, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            kind,
            time,
            is_keyframe,
            composition_time: 0,
            payload: payload.into(),
        }
    }

    pub fn new_video<B>(time: Duration, is_keyframe: bool, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self::new(PacketKind::Video, time, is_keyframe, payload)
    }

    pub fn new_audio<B>(time: Duration, payload: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self::new(PacketKind::Audio, time, false, payload)
    }
}

impl AsRef<[u8]> for MediaPacket {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

/// Codec identifier for a single track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    H264,
    H265,
    Aac,
    Opus,
    Pcmu,
    Pcma,
}

impl CodecKind {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecKind::H264 | CodecKind::H265)
    }

    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }
}

/// Codec description for one track, parsed out of the RTSP SDP.
#[derive(Debug, Clone)]
pub struct CodecData {
    pub kind: CodecKind,
    /// Codec-specific configuration (e.g. AVC decoder configuration record,
    /// AAC AudioSpecificConfig). May be empty for codecs configured in-band.
    pub extra: Bytes,
}

impl CodecData {
    pub fn new<B>(kind: CodecKind, extra: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            kind,
            extra: extra.into(),
        }
    }
}

/// True iff the codec set describes an audio-only stream: exactly one track
/// and it is audio. Segmentation then treats every packet as a boundary.
pub fn is_audio_only(codecs: &[CodecData]) -> bool {
    codecs.len() == 1 && codecs[0].kind.is_audio()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_only_detection() {
        assert!(is_audio_only(&[CodecData::new(CodecKind::Aac, Bytes::new())]));
        assert!(!is_audio_only(&[CodecData::new(
            CodecKind::H264,
            Bytes::new()
        )]));
        assert!(!is_audio_only(&[
            CodecData::new(CodecKind::H264, Bytes::new()),
            CodecData::new(CodecKind::Aac, Bytes::new()),
        ]));
        assert!(!is_audio_only(&[]));
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let packet = MediaPacket::new_video(Duration::from_secs(1), true, vec![1u8, 2, 3]);
        let copy = packet.clone();
        assert_eq!(packet.payload.as_ptr(), copy.payload.as_ptr());
    }
}
