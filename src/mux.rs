//! Container assembly.
//!
//! A muxed file is laid out as:
//!
//! ```text
//! CRID info chunk (one sector)
//! @SFV header | header end | metadata | metadata end (pads to a sector)
//! @SFV stream chunks ... | contents end
//! ```
//!
//! Stream chunks are packed first into a scratch file so the keyframe
//! offsets are known before the seek table is built.

use crate::chunk::{
    alignment_padding, metadata_padding, sector_padding, wrap_chunk, ChunkSpec, PayloadType,
    CHUNK_HEADER_SIZE, CONTENTS_END_PAYLOAD, CRID_SIGNATURE, HEADER_END_PAYLOAD,
    METADATA_END_PAYLOAD, SECTOR_SIZE, VIDEO_SIGNATURE,
};
use crate::error::{IoStage, Result, Stage, UsmError};
use crate::pipeline::cipher::encrypt_video;
use crate::pipeline::frames::FrameDescriptor;
use crate::pipeline::keys::VIDEO_KEY_SIZE;
use crate::probe::ProbeInfo;
use crate::table::{pack_pages, Page, Value};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, info, trace};

/// Format version of the container CRID page
pub const CONTAINER_FORMAT_VERSION: i32 = 16_777_984;

/// `@SFV` as a big-endian integer
const VIDEO_STREAM_ID: i32 = 0x4053_4656;

/// Stream chunks are padded to this boundary
const STREAM_ALIGNMENT: usize = 0x20;

const HEADER_CHUNK_PADDING: usize = 0x18;

/// Frame rate written into header and metadata chunks
const SECTION_FRAME_RATE: i32 = 30;

/// Frame-time step between consecutive stream chunks
const FRAME_TIME_STEP: f64 = 99.9;

/// Decoder buffer estimate relative to the largest packet
const MINBUF_FACTOR: f64 = 1.98746;

const MAX_LAYOUT_PASSES: usize = 4;

const CRID_PAGE: &str = "CRIUSF_DIR_STREAM";
const HEADER_PAGE: &str = "VIDEO_HDRINFO";
const SEEK_PAGE: &str = "VIDEO_SEEKINFO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp9,
    H264,
}

/// Codec-dependent header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSettings {
    pub codec: VideoCodec,
    pub crid_format_version: i32,
    pub mpeg_codec: i8,
    pub mpeg_dcprec: i8,
}

impl VideoCodec {
    pub fn settings(self) -> CodecSettings {
        match self {
            VideoCodec::Vp9 => CodecSettings {
                codec: self,
                crid_format_version: 16_777_984,
                mpeg_codec: 9,
                mpeg_dcprec: 0,
            },
            VideoCodec::H264 => CodecSettings {
                codec: self,
                crid_format_version: 0,
                mpeg_codec: 5,
                mpeg_dcprec: 11,
            },
        }
    }
}

/// H264 sources wrapped in a container must be remuxed to Annex-B first
pub fn needs_annex_b_remux(probe: &ProbeInfo) -> bool {
    probe.is_codec("h264") && !probe.format_contains("h264")
}

/// Check the codec/container pairing and pick the header settings
pub fn resolve_codec_settings(probe: &ProbeInfo) -> Result<CodecSettings> {
    let unsupported = |reason: &str| UsmError::UnsupportedCodec {
        codec: probe.codec_name.clone(),
        format: probe.format_name.clone(),
        reason: reason.to_string(),
    };

    if probe.is_codec("vp9") {
        if !probe.format_contains("ivf") {
            return Err(unsupported("VP9 input must be in an IVF container"));
        }
        Ok(VideoCodec::Vp9.settings())
    } else if probe.is_codec("h264") {
        if !probe.format_contains("h264") {
            return Err(unsupported("H264 input must be a raw Annex-B stream"));
        }
        Ok(VideoCodec::H264.settings())
    } else {
        Err(unsupported("supported codecs are vp9 (ivf) and h264 (raw)"))
    }
}

fn to_i32(value: impl TryInto<i32>, stage: Stage, field: &str) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| UsmError::overflow(stage, field))
}

fn normalize_filename(name: &str) -> String {
    name.replace('\\', "/")
}

/// Per-stream directory entry for the info chunk
pub fn stream_crid_page(
    filename: &str,
    source_size: u64,
    max_frame_size: usize,
    settings: &CodecSettings,
    bitrate: i32,
) -> Result<Page> {
    let stage = Stage::BuildMetadata;
    Ok(Page::new(CRID_PAGE)
        .with("fmtver", Value::I32(settings.crid_format_version))
        .with("filename", Value::String(normalize_filename(filename)))
        .with("filesize", Value::I32(to_i32(source_size, stage, "filesize")?))
        .with("datasize", Value::I32(0))
        .with("stmid", Value::I32(VIDEO_STREAM_ID))
        .with("chno", Value::I16(0))
        .with("minchk", Value::I16(3))
        .with("minbuf", Value::I32(to_i32(max_frame_size, stage, "minbuf")?))
        .with("avbps", Value::I32(bitrate)))
}

/// Whole-container directory entry for the info chunk
pub fn container_crid_page(
    filename: &str,
    size_after_crid: i32,
    max_packet_size: usize,
    bitrate: i32,
) -> Result<Page> {
    let stage = Stage::BuildMetadata;
    let filesize = (SECTOR_SIZE as i32)
        .checked_add(size_after_crid)
        .ok_or_else(|| UsmError::overflow(stage, "filesize"))?;

    let estimate = (max_packet_size as f64 * MINBUF_FACTOR).round_ties_even();
    if estimate > i32::MAX as f64 {
        return Err(UsmError::overflow(stage, "minbuf"));
    }
    let estimate = estimate as usize;
    let minbuf = to_i32(estimate + alignment_padding(estimate, 0x10), stage, "minbuf")?;

    Ok(Page::new(CRID_PAGE)
        .with("fmtver", Value::I32(CONTAINER_FORMAT_VERSION))
        .with("filename", Value::String(normalize_filename(filename)))
        .with("filesize", Value::I32(filesize))
        .with("datasize", Value::I32(0))
        .with("stmid", Value::I32(0))
        .with("chno", Value::I16(-1))
        .with("minchk", Value::I16(1))
        .with("minbuf", Value::I32(minbuf))
        .with("avbps", Value::I32(bitrate)))
}

/// Size of the largest stream chunk after its 8-byte preamble, given
/// the largest frame
pub fn max_packed_size(max_frame_size: usize) -> usize {
    CHUNK_HEADER_SIZE - 8 + max_frame_size + alignment_padding(max_frame_size, STREAM_ALIGNMENT)
}

/// Video stream properties
pub fn video_header_page(
    probe: &ProbeInfo,
    settings: &CodecSettings,
    frames: &[FrameDescriptor],
) -> Result<Page> {
    let stage = Stage::BuildMetadata;
    let keyframes = frames.iter().filter(|f| f.keyframe).count();
    let max_frame = frames.iter().map(|f| f.size).max().unwrap_or(0);

    let framerate_n = (probe.frame_rate * 1000.0).trunc();
    if !(0.0..=i32::MAX as f64).contains(&framerate_n) {
        return Err(UsmError::overflow(stage, "framerate_n"));
    }

    Ok(Page::new(HEADER_PAGE)
        .with("width", Value::I32(probe.width))
        .with("height", Value::I32(probe.height))
        .with("mat_width", Value::I32(probe.width))
        .with("mat_height", Value::I32(probe.height))
        .with("disp_width", Value::I32(probe.width))
        .with("disp_height", Value::I32(probe.height))
        .with("scrn_width", Value::I32(0))
        .with("mpeg_dcprec", Value::I8(settings.mpeg_dcprec))
        .with("mpeg_codec", Value::I8(settings.mpeg_codec))
        .with("alpha_type", Value::I32(0))
        .with("total_frames", Value::I32(to_i32(frames.len(), stage, "total_frames")?))
        .with("framerate_n", Value::I32(framerate_n as i32))
        .with("framerate_d", Value::I32(1000))
        .with("metadata_count", Value::I32(1))
        .with("metadata_size", Value::I32(to_i32(keyframes, stage, "metadata_size")?))
        .with("ixsize", Value::I32(to_i32(max_packed_size(max_frame), stage, "ixsize")?))
        .with("pre_padding", Value::I32(0))
        .with("max_picture_size", Value::I32(0))
        .with("color_space", Value::I32(0))
        .with("picture_type", Value::I32(0)))
}

/// Position of a keyframe's chunk within the packed stream section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeOffset {
    pub frame: u32,
    pub offset: u64,
}

/// Seek table entries, with every offset moved forward by `shift`
pub fn seek_pages(keyframes: &[KeyframeOffset], shift: u64) -> Result<Vec<Page>> {
    keyframes
        .iter()
        .map(|k| {
            let offset = k
                .offset
                .checked_add(shift)
                .and_then(|o| i64::try_from(o).ok())
                .ok_or_else(|| UsmError::overflow(Stage::BuildMetadata, "ofs_byte"))?;
            Ok(Page::new(SEEK_PAGE)
                .with("ofs_byte", Value::I64(offset))
                .with("ofs_frmid", Value::U32(k.frame))
                .with("num_skip", Value::U16(0))
                .with("resv", Value::U16(0)))
        })
        .collect()
}

/// Outcome of packing the stream section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPackResult {
    /// Bytes written, contents-end chunk included
    pub stream_size: u64,
    /// Largest chunk written
    pub max_packet_size: usize,
    pub keyframes: Vec<KeyframeOffset>,
}

/// Encrypt every frame of `source` into one stream chunk each, followed
/// by a contents-end chunk.
pub fn pack_video_stream<R, W>(
    source: &mut R,
    frames: &[FrameDescriptor],
    frame_rate: f64,
    key: &[u8; VIDEO_KEY_SIZE],
    out: &mut W,
) -> Result<StreamPackResult>
where
    R: Read + Seek,
    W: Write,
{
    let stage = Stage::PackStream;
    let rate = (frame_rate * 100.0).trunc();
    if !(0.0..=i32::MAX as f64).contains(&rate) {
        return Err(UsmError::overflow(stage, "frame rate"));
    }
    let rate = rate as i32;

    let mut written = 0u64;
    let mut max_packet_size = 1;
    let mut keyframes = Vec::new();
    let mut buf = Vec::new();

    for frame in frames {
        buf.resize(frame.size, 0);
        source.seek(SeekFrom::Start(frame.offset)).in_stage(stage)?;
        source.read_exact(&mut buf).map_err(|e| UsmError::Io {
            stage,
            source: io::Error::new(e.kind(), format!("frame {}: {e}", frame.index)),
        })?;
        encrypt_video(&mut buf, key);

        if frame.keyframe {
            keyframes.push(KeyframeOffset {
                frame: u32::try_from(frame.index)
                    .map_err(|_| UsmError::overflow(stage, "ofs_frmid"))?,
                offset: written,
            });
        }

        let frame_time = (frame.index as f64 * FRAME_TIME_STEP).trunc();
        if frame_time > i32::MAX as f64 {
            return Err(UsmError::overflow(stage, "frame time"));
        }
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream)
            .timing(rate, frame_time as i32)
            .padding(alignment_padding(buf.len(), STREAM_ALIGNMENT));
        let chunk = wrap_chunk(&spec, &buf, stage)?;
        trace!(frame = frame.index, size = frame.size, keyframe = frame.keyframe, "packed frame");

        max_packet_size = max_packet_size.max(chunk.len());
        out.write_all(&chunk).in_stage(stage)?;
        written += chunk.len() as u64;
    }

    if !frames.is_empty() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::SectionEnd).timing(rate, 0);
        let chunk = wrap_chunk(&spec, CONTENTS_END_PAYLOAD, stage)?;
        max_packet_size = max_packet_size.max(chunk.len());
        out.write_all(&chunk).in_stage(stage)?;
        written += chunk.len() as u64;
    }
    out.flush().in_stage(stage)?;

    debug!(
        frames = frames.len(),
        keyframes = keyframes.len(),
        bytes = written,
        max_packet_size,
        "stream section packed"
    );
    Ok(StreamPackResult {
        stream_size: written,
        max_packet_size,
        keyframes,
    })
}

/// Inputs for the chunks that precede the stream section
#[derive(Debug)]
pub struct PrestreamLayout<'a> {
    pub stream_page: &'a Page,
    pub header_page: &'a Page,
    pub stream: &'a StreamPackResult,
    pub container_filename: &'a str,
    pub bitrate: i32,
}

/// Build the info, header and metadata chunks in file order.
///
/// The seek table holds absolute file offsets, which depend on the size of
/// the metadata section holding them; packing repeats until that size
/// settles. The metadata-end chunk is padded so the stream section starts
/// on a sector boundary.
pub fn build_prestream_chunks(layout: &PrestreamLayout<'_>) -> Result<Vec<Vec<u8>>> {
    let stage = Stage::BuildMetadata;
    let section = |payload_type| {
        ChunkSpec::new(VIDEO_SIGNATURE, payload_type).timing(SECTION_FRAME_RATE, 0)
    };

    let header_payload = pack_pages(std::slice::from_ref(layout.header_page))?;
    let header_chunk = wrap_chunk(
        &section(PayloadType::Header).padding(HEADER_CHUNK_PADDING),
        &header_payload,
        stage,
    )?;
    let header_end_chunk = wrap_chunk(&section(PayloadType::SectionEnd), HEADER_END_PAYLOAD, stage)?;
    let header_section = header_chunk.len() + header_end_chunk.len();

    let mut metadata_section = 0usize;
    let mut settled = None;
    for pass in 0..MAX_LAYOUT_PASSES {
        let shift = (SECTOR_SIZE + header_section + metadata_section) as u64;
        let payload = pack_pages(&seek_pages(&layout.stream.keyframes, shift)?)?;
        let metadata_spec = section(PayloadType::Metadata)
            .padding(metadata_padding(CHUNK_HEADER_SIZE + payload.len()));
        let metadata_chunk = wrap_chunk(&metadata_spec, &payload, stage)?;

        let end_position = SECTOR_SIZE + header_section + metadata_chunk.len();
        let end_spec = section(PayloadType::SectionEnd).padding(sector_padding(
            end_position,
            CHUNK_HEADER_SIZE + METADATA_END_PAYLOAD.len(),
        ));
        let metadata_end_chunk = wrap_chunk(&end_spec, METADATA_END_PAYLOAD, stage)?;

        let size = metadata_chunk.len() + metadata_end_chunk.len();
        trace!(pass, size, "metadata layout pass");
        if size == metadata_section {
            settled = Some((metadata_chunk, metadata_end_chunk));
            break;
        }
        metadata_section = size;
    }
    let (metadata_chunk, metadata_end_chunk) =
        settled.ok_or_else(|| UsmError::overflow(stage, "metadata section size did not settle"))?;

    let size_after_crid = (SECTOR_SIZE + header_section + metadata_section) as u64
        + layout.stream.stream_size;
    let container_page = container_crid_page(
        layout.container_filename,
        to_i32(size_after_crid, stage, "filesize")?,
        layout.stream.max_packet_size,
        layout.bitrate,
    )?;

    let info_payload = pack_pages(&[container_page, layout.stream_page.clone()])?;
    let info_len = CHUNK_HEADER_SIZE + info_payload.len();
    if info_len > SECTOR_SIZE {
        return Err(UsmError::overflow(stage, "info chunk exceeds one sector"));
    }
    let info_chunk = wrap_chunk(
        &ChunkSpec::new(CRID_SIGNATURE, PayloadType::Header)
            .timing(SECTION_FRAME_RATE, 0)
            .padding(sector_padding(0, info_len)),
        &info_payload,
        stage,
    )?;

    info!(
        header_bytes = header_section,
        metadata_bytes = metadata_section,
        seek_entries = layout.stream.keyframes.len(),
        "metadata built"
    );
    Ok(vec![
        info_chunk,
        header_chunk,
        header_end_chunk,
        metadata_chunk,
        metadata_end_chunk,
    ])
}

/// Write the prestream chunks followed by the packed stream section,
/// returning the total bytes written.
pub fn assemble<S, W>(prestream: &[Vec<u8>], scratch: &mut S, out: &mut W) -> Result<u64>
where
    S: Read + Seek,
    W: Write,
{
    let stage = Stage::Assemble;
    let mut total = 0u64;
    for chunk in prestream {
        out.write_all(chunk).in_stage(stage)?;
        total += chunk.len() as u64;
    }
    scratch.seek(SeekFrom::Start(0)).in_stage(stage)?;
    total += io::copy(scratch, out).in_stage(stage)?;
    out.flush().in_stage(stage)?;
    Ok(total)
}
