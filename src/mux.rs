use crate::errors::{Result, StreamingError};
use crate::packet::{CodecData, CodecKind, MediaPacket, PacketKind};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;
const STREAM_ID_PADDING: u8 = 0xBE;

/// Serializes one HLS segment to MPEG-TS wire format.
pub trait TsMuxer: Send {
    fn write_header(&mut self, codecs: &[CodecData]) -> Result<()>;
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()>;
    fn write_trailer(&mut self) -> Result<()>;
    fn into_bytes(self: Box<Self>) -> Bytes;
}

/// Creates one muxer per rendered segment.
pub trait MuxerFactory: Send + Sync {
    fn create(&self) -> Box<dyn TsMuxer>;
}

/// Renders a segment: header from the stream's codecs, every packet as a
/// defensive copy with `composition_time` forced to 1, then the trailer.
pub fn mux_segment(
    factory: &dyn MuxerFactory,
    codecs: &[CodecData],
    packets: &[MediaPacket],
) -> Result<Bytes> {
    let mut muxer = factory.create();
    muxer.write_header(codecs)?;
    for packet in packets {
        let mut packet = packet.clone();
        packet.composition_time = 1;
        muxer.write_packet(&packet)?;
    }
    muxer.write_trailer()?;
    Ok(muxer.into_bytes())
}

/// Factory for the built-in transport-stream muxer.
pub struct MpegTsFactory {
    padding_to_make_counter_cont: bool,
}

impl MpegTsFactory {
    pub fn new() -> Self {
        Self {
            padding_to_make_counter_cont: true,
        }
    }
}

impl Default for MpegTsFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxerFactory for MpegTsFactory {
    fn create(&self) -> Box<dyn TsMuxer> {
        Box::new(MpegTsMuxer::new(self.padding_to_make_counter_cont))
    }
}

struct EsTrack {
    pid: u16,
    stream_type: u8,
}

/// Minimal single-program MPEG-TS muxer: one PAT, one PMT, one elementary
/// stream per media kind. PCR rides the video PID (audio PID when the
/// program has no video).
pub struct MpegTsMuxer {
    out: BytesMut,
    counters: HashMap<u16, u8>,
    tracks: Vec<EsTrack>,
    padding_to_make_counter_cont: bool,
    header_written: bool,
}

impl MpegTsMuxer {
    fn new(padding_to_make_counter_cont: bool) -> Self {
        Self {
            out: BytesMut::with_capacity(64 * 1024),
            counters: HashMap::new(),
            tracks: Vec::new(),
            padding_to_make_counter_cont,
            header_written: false,
        }
    }

    fn bump_counter(&mut self, pid: u16) -> u8 {
        let counter = self.counters.entry(pid).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x0F;
        current
    }

    fn pcr_pid(&self) -> u16 {
        self.tracks
            .iter()
            .find(|t| t.pid == VIDEO_PID)
            .or_else(|| self.tracks.first())
            .map(|t| t.pid)
            .unwrap_or(VIDEO_PID)
    }

    /// Writes one 188-byte cell. The adaptation field is stuffed so the
    /// payload always ends the cell exactly.
    fn write_cell(
        &mut self,
        pid: u16,
        unit_start: bool,
        pcr: Option<u64>,
        random_access: bool,
        payload: &[u8],
    ) -> usize {
        // Adaptation field body (everything after its length byte).
        let mut adaptation: Vec<u8> = Vec::new();
        if unit_start && (pcr.is_some() || random_access) {
            let mut flags = 0u8;
            if random_access {
                flags |= 0x40;
            }
            if pcr.is_some() {
                flags |= 0x10;
            }
            adaptation.push(flags);
            if let Some(base) = pcr {
                adaptation.push((base >> 25) as u8);
                adaptation.push((base >> 17) as u8);
                adaptation.push((base >> 9) as u8);
                adaptation.push((base >> 1) as u8);
                adaptation.push((((base & 1) as u8) << 7) | 0x7E);
                adaptation.push(0x00);
            }
        }

        let mut has_adaptation = !adaptation.is_empty();
        let overhead = 4 + if has_adaptation {
            1 + adaptation.len()
        } else {
            0
        };
        let capacity = TS_PACKET_SIZE - overhead;
        if payload.len() < capacity {
            // Stuff the adaptation field so the payload ends the cell.
            let deficit = capacity - payload.len();
            if !has_adaptation {
                has_adaptation = true;
                if deficit >= 2 {
                    adaptation.push(0x00); // flags, nothing set
                    adaptation.resize(deficit - 1, 0xFF);
                }
                // deficit == 1: the bare length byte (length 0) is enough.
            } else {
                adaptation.resize(adaptation.len() + deficit, 0xFF);
            }
        }

        let counter = self.bump_counter(pid);
        let written = payload.len().min(capacity);

        self.out.put_u8(SYNC_BYTE);
        self.out
            .put_u8((if unit_start { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F));
        self.out.put_u8(pid as u8);
        self.out
            .put_u8((if has_adaptation { 0x30 } else { 0x10 }) | counter);
        if has_adaptation {
            self.out.put_u8(adaptation.len() as u8);
            self.out.put_slice(&adaptation);
        }
        self.out.put_slice(&payload[..written]);

        debug_assert_eq!(self.out.len() % TS_PACKET_SIZE, 0);
        written
    }

    fn write_payload(&mut self, pid: u16, pcr: Option<u64>, random_access: bool, payload: &[u8]) {
        let mut remaining = payload;
        let mut first = true;
        while first || !remaining.is_empty() {
            let written = self.write_cell(pid, first, pcr.filter(|_| first), random_access && first, remaining);
            remaining = &remaining[written..];
            first = false;
        }
    }

    fn write_psi(&mut self, pid: u16, table: &[u8]) {
        let mut payload = Vec::with_capacity(table.len() + 5);
        payload.push(0x00); // pointer field
        payload.extend_from_slice(table);
        let crc = crc32_mpeg(table);
        payload.extend_from_slice(&crc.to_be_bytes());
        self.write_payload(pid, None, false, &payload);
    }

    fn build_pat() -> Vec<u8> {
        let mut table = Vec::with_capacity(12);
        table.push(0x00); // table_id: PAT
        // section_syntax_indicator, section_length = 13 (through CRC)
        table.push(0xB0);
        table.push(13);
        table.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
        table.push(0xC1); // version 0, current_next
        table.push(0x00);
        table.push(0x00);
        table.extend_from_slice(&[0x00, 0x01]); // program_number
        table.push(0xE0 | ((PMT_PID >> 8) as u8 & 0x1F));
        table.push(PMT_PID as u8);
        table
    }

    fn build_pmt(&self) -> Vec<u8> {
        let section_length = 9 + 5 * self.tracks.len() + 4;
        let pcr_pid = self.pcr_pid();

        let mut table = Vec::with_capacity(section_length + 3);
        table.push(0x02); // table_id: PMT
        table.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
        table.push(section_length as u8);
        table.extend_from_slice(&[0x00, 0x01]); // program_number
        table.push(0xC1);
        table.push(0x00);
        table.push(0x00);
        table.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
        table.push(pcr_pid as u8);
        table.extend_from_slice(&[0xF0, 0x00]); // program_info_length 0
        for track in &self.tracks {
            table.push(track.stream_type);
            table.push(0xE0 | ((track.pid >> 8) as u8 & 0x1F));
            table.push(track.pid as u8);
            table.extend_from_slice(&[0xF0, 0x00]); // ES_info_length 0
        }
        table
    }

    fn track_pid(&self, kind: PacketKind) -> Option<u16> {
        let want = match kind {
            PacketKind::Video => VIDEO_PID,
            PacketKind::Audio => AUDIO_PID,
        };
        self.tracks.iter().find(|t| t.pid == want).map(|t| t.pid)
    }
}

impl TsMuxer for MpegTsMuxer {
    fn write_header(&mut self, codecs: &[CodecData]) -> Result<()> {
        if self.header_written {
            return Err(StreamingError::MuxError {
                message: "Header already written".to_string(),
            });
        }
        if codecs.is_empty() {
            return Err(StreamingError::MuxError {
                message: "No codecs to mux".to_string(),
            });
        }

        for codec in codecs {
            let (pid, stream_type) = match codec.kind {
                CodecKind::H264 => (VIDEO_PID, 0x1B),
                CodecKind::H265 => (VIDEO_PID, 0x24),
                CodecKind::Aac => (AUDIO_PID, 0x0F),
                // Private data stream types for codecs MPEG-TS has no
                // registered id for.
                CodecKind::Opus | CodecKind::Pcmu | CodecKind::Pcma => (AUDIO_PID, 0x06),
            };
            if self.tracks.iter().any(|t| t.pid == pid) {
                continue; // one track per media kind
            }
            self.tracks.push(EsTrack { pid, stream_type });
        }

        self.write_psi(PAT_PID, &Self::build_pat());
        let pmt = self.build_pmt();
        self.write_psi(PMT_PID, &pmt);
        self.header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        if !self.header_written {
            return Err(StreamingError::MuxError {
                message: "Packet written before header".to_string(),
            });
        }
        let pid = self
            .track_pid(packet.kind)
            .ok_or_else(|| StreamingError::MuxError {
                message: "Packet kind has no declared track".to_string(),
            })?;

        let dts = (packet.time.as_secs_f64() * 90_000.0) as u64;
        let pts = dts + u64::from(packet.composition_time) * 90;

        let stream_id = match packet.kind {
            PacketKind::Video => STREAM_ID_VIDEO,
            PacketKind::Audio => STREAM_ID_AUDIO,
        };

        let pes = if packet.composition_time != 0 {
            build_pes(stream_id, pts, Some(dts), &packet.payload)
        } else {
            build_pes(stream_id, pts, None, &packet.payload)
        };

        let pcr = if pid == self.pcr_pid() {
            Some(dts)
        } else {
            None
        };
        self.write_payload(pid, pcr, packet.is_keyframe, &pes);
        Ok(())
    }

    /// Pads each elementary PID with PES padding packets until its
    /// continuity counter wraps to zero, so independently muxed segments
    /// play back with continuous counters.
    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(StreamingError::MuxError {
                message: "Trailer written before header".to_string(),
            });
        }
        if !self.padding_to_make_counter_cont {
            return Ok(());
        }

        let pids: Vec<u16> = self.tracks.iter().map(|t| t.pid).collect();
        for pid in pids {
            while self.counters.get(&pid).copied().unwrap_or(0) != 0 {
                // One whole-cell padding PES: 6-byte header + 0xFF fill.
                let fill = TS_PACKET_SIZE - 4 - 6;
                let mut pes = Vec::with_capacity(TS_PACKET_SIZE - 4);
                pes.extend_from_slice(&[0x00, 0x00, 0x01, STREAM_ID_PADDING]);
                pes.extend_from_slice(&(fill as u16).to_be_bytes());
                pes.resize(6 + fill, 0xFF);
                self.write_cell(pid, true, None, false, &pes);
            }
        }
        Ok(())
    }

    fn into_bytes(self: Box<Self>) -> Bytes {
        self.out.freeze()
    }
}

fn build_pes(stream_id: u8, pts: u64, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let mut header_data = Vec::with_capacity(10);
    match dts {
        None => put_timestamp(&mut header_data, 0b0010, pts),
        Some(dts) => {
            put_timestamp(&mut header_data, 0b0011, pts);
            put_timestamp(&mut header_data, 0b0001, dts);
        }
    }

    let mut pes = Vec::with_capacity(9 + header_data.len() + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let length = 3 + header_data.len() + payload.len();
    // A zero length is only allowed for video elementary streams.
    let length = if length > 0xFFFF { 0 } else { length };
    pes.extend_from_slice(&(length as u16).to_be_bytes());
    pes.push(0x80); // marker bits, no scrambling
    pes.push(if dts.is_some() { 0xC0 } else { 0x80 });
    pes.push(header_data.len() as u8);
    pes.extend_from_slice(&header_data);
    pes.extend_from_slice(payload);
    pes
}

/// Encodes a 33-bit PTS/DTS with the 4-bit prefix marker.
fn put_timestamp(out: &mut Vec<u8>, prefix: u8, ts: u64) {
    out.push((prefix << 4) | (((ts >> 29) as u8) & 0x0E) | 0x01);
    out.push((ts >> 22) as u8);
    out.push((((ts >> 14) as u8) & 0xFE) | 0x01);
    out.push((ts >> 7) as u8);
    out.push(((ts << 1) as u8) | 0x01);
}

fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
