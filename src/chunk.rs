//! Chunk framing.
//!
//! Every chunk starts with a fixed 0x20-byte header:
//!
//! ```text
//! 0x00 signature[4]   0x04 size:u32 (bytes after this field)
//! 0x08 0x00           0x09 payload_offset:u8 (from 0x08, normally 0x18)
//! 0x0A padding:u16    0x0C channel:u8   0x0D 0x00 0x00
//! 0x0F payload_type   0x10 frame_time:i32   0x14 frame_rate:i32
//! 0x18 reserved[8]
//! ```
//!
//! followed by the payload and `padding` zero bytes.

use crate::error::{IoStage, Result, Stage, UsmError};
use std::io::{self, Read};

pub const CHUNK_HEADER_SIZE: usize = 0x20;

/// Default payload offset, counted from byte 0x08
const BASE_PAYLOAD_OFFSET: usize = 0x18;

pub const SECTOR_SIZE: usize = 0x800;

pub const CRID_SIGNATURE: [u8; 4] = *b"CRID";
pub const VIDEO_SIGNATURE: [u8; 4] = *b"@SFV";
pub const AUDIO_SIGNATURE: [u8; 4] = *b"@SFA";

pub const HEADER_END_PAYLOAD: &[u8; 32] = b"#HEADER END     ===============\0";
pub const METADATA_END_PAYLOAD: &[u8; 32] = b"#METADATA END   ===============\0";
pub const CONTENTS_END_PAYLOAD: &[u8; 32] = b"#CONTENTS END   ===============\0";

/// What a chunk's payload holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PayloadType {
    Stream = 0,
    Header = 1,
    SectionEnd = 2,
    Metadata = 3,
}

impl PayloadType {
    /// Only the low two bits are significant
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Stream,
            1 => Self::Header,
            2 => Self::SectionEnd,
            _ => Self::Metadata,
        }
    }
}

/// Everything in a chunk header except the sizes
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpec {
    pub signature: [u8; 4],
    pub payload_type: PayloadType,
    pub frame_rate: i32,
    pub frame_time: i32,
    pub padding: usize,
    pub channel: u8,
}

impl ChunkSpec {
    pub fn new(signature: [u8; 4], payload_type: PayloadType) -> Self {
        Self {
            signature,
            payload_type,
            frame_rate: 30,
            frame_time: 0,
            padding: 0,
            channel: 0,
        }
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn timing(mut self, frame_rate: i32, frame_time: i32) -> Self {
        self.frame_rate = frame_rate;
        self.frame_time = frame_time;
        self
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Total bytes [`wrap_chunk`] will emit for `payload_len`
    pub fn framed_len(&self, payload_len: usize) -> usize {
        CHUNK_HEADER_SIZE + payload_len + self.padding
    }
}

/// Frame `payload` as one chunk, padding included
pub fn wrap_chunk(spec: &ChunkSpec, payload: &[u8], stage: Stage) -> Result<Vec<u8>> {
    let size = u32::try_from(BASE_PAYLOAD_OFFSET + payload.len() + spec.padding)
        .map_err(|_| UsmError::overflow(stage, "chunk size"))?;
    let padding =
        u16::try_from(spec.padding).map_err(|_| UsmError::overflow(stage, "chunk padding"))?;

    let mut chunk = Vec::with_capacity(spec.framed_len(payload.len()));
    chunk.extend_from_slice(&spec.signature);
    chunk.extend_from_slice(&size.to_be_bytes());
    chunk.push(0);
    chunk.push(BASE_PAYLOAD_OFFSET as u8);
    chunk.extend_from_slice(&padding.to_be_bytes());
    chunk.push(spec.channel);
    chunk.extend_from_slice(&[0, 0]);
    chunk.push(spec.payload_type as u8);
    chunk.extend_from_slice(&spec.frame_time.to_be_bytes());
    chunk.extend_from_slice(&spec.frame_rate.to_be_bytes());
    chunk.extend_from_slice(&[0u8; 8]);
    chunk.extend_from_slice(payload);
    chunk.resize(chunk.len() + spec.padding, 0);
    Ok(chunk)
}

/// Padding that brings `size` up to a multiple of `alignment`
pub fn alignment_padding(size: usize, alignment: usize) -> usize {
    match size % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

/// Padding for a metadata chunk of `chunk_size` bytes: at least 0xF0
/// bytes total, then 8-byte aligned
pub fn metadata_padding(chunk_size: usize) -> usize {
    if chunk_size <= 0xF0 {
        0xF0 - chunk_size
    } else {
        alignment_padding(chunk_size, 8)
    }
}

/// Padding that ends a chunk starting at `position` on a sector boundary
pub fn sector_padding(position: usize, chunk_size: usize) -> usize {
    alignment_padding(position + chunk_size, SECTOR_SIZE)
}

/// A chunk read back from a container
#[derive(Debug, Clone)]
pub struct Chunk {
    pub signature: [u8; 4],
    pub payload_type: PayloadType,
    pub channel: u8,
    pub frame_time: i32,
    pub frame_rate: i32,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn signature_str(&self) -> String {
        String::from_utf8_lossy(&self.signature).into_owned()
    }
}

/// Sequential chunk reader over a container stream
pub struct ChunkReader<R> {
    inner: R,
    index: usize,
    position: u64,
    stage: Stage,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, stage: Stage) -> Self {
        Self {
            inner,
            index: 0,
            position: 0,
            stage,
        }
    }

    /// Index of the next chunk to be read
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the next chunk to be read
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next chunk, or `None` at a clean end of input
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let start = self.position;
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        let filled = self.fill(&mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < CHUNK_HEADER_SIZE {
            return Err(self.truncated(start, format!("chunk header cut off after {filled} bytes")));
        }

        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let payload_offset = header[9] as usize;
        let padding = u16::from_be_bytes([header[10], header[11]]) as usize;
        let channel = header[12];
        let payload_type = PayloadType::from_u8(header[15]);
        let frame_time = i32::from_be_bytes([header[16], header[17], header[18], header[19]]);
        let frame_rate = i32::from_be_bytes([header[20], header[21], header[22], header[23]]);

        let payload_len = size
            .checked_sub(payload_offset)
            .and_then(|rest| rest.checked_sub(padding))
            .ok_or_else(|| UsmError::MalformedChunk {
                stage: self.stage,
                chunk: self.index,
                offset: start,
                message: format!(
                    "size {size:#x} smaller than payload offset {payload_offset:#x} plus padding {padding:#x}"
                ),
            })?;

        // Header extension between the fixed header and the payload
        let extension = payload_offset.saturating_sub(BASE_PAYLOAD_OFFSET);
        self.skip(extension, start, "header extension")?;

        let mut payload = vec![0u8; payload_len];
        let read = self.fill(&mut payload)?;
        if read < payload_len {
            return Err(self.truncated(
                start,
                format!("payload declares {payload_len} bytes, {read} available"),
            ));
        }
        self.skip(padding, start, "padding")?;

        self.index += 1;
        Ok(Some(Chunk {
            signature: [header[0], header[1], header[2], header[3]],
            payload_type,
            channel,
            frame_time,
            frame_rate,
            payload,
        }))
    }

    /// Read until `buf` is full or input ends, returning bytes read
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(UsmError::Io {
                        stage: self.stage,
                        source,
                    })
                }
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }

    fn skip(&mut self, count: usize, start: u64, what: &str) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.inner).take(count as u64), &mut io::sink())
            .in_stage(self.stage)?;
        self.position += skipped;
        if skipped < count as u64 {
            return Err(self.truncated(
                start,
                format!("{what} declares {count} bytes, {skipped} available"),
            ));
        }
        Ok(())
    }

    fn truncated(&self, offset: u64, message: String) -> UsmError {
        UsmError::TruncatedStream {
            stage: self.stage,
            chunk: self.index,
            offset,
            message,
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_wrap_layout() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream)
            .timing(2997, 100)
            .padding(4)
            .channel(2);
        let chunk = wrap_chunk(&spec, &[0xAA; 12], Stage::PackStream).unwrap();

        assert_eq!(chunk.len(), 0x20 + 12 + 4);
        assert_eq!(&chunk[..4], b"@SFV");
        assert_eq!(u32::from_be_bytes(chunk[4..8].try_into().unwrap()), 0x18 + 12 + 4);
        assert_eq!(chunk[8], 0);
        assert_eq!(chunk[9], 0x18);
        assert_eq!(u16::from_be_bytes([chunk[10], chunk[11]]), 4);
        assert_eq!(chunk[12], 2);
        assert_eq!(chunk[15], 0);
        assert_eq!(i32::from_be_bytes(chunk[16..20].try_into().unwrap()), 100);
        assert_eq!(i32::from_be_bytes(chunk[20..24].try_into().unwrap()), 2997);
        assert_eq!(&chunk[24..32], &[0u8; 8]);
        assert_eq!(&chunk[32..44], &[0xAA; 12]);
        assert_eq!(&chunk[44..], &[0u8; 4]);
    }

    #[test]
    fn test_wrap_rejects_oversized_padding() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream).padding(0x1_0000);
        let err = wrap_chunk(&spec, b"x", Stage::PackStream).unwrap_err();
        assert!(matches!(err, UsmError::FormatOverflow { .. }));
    }

    #[test]
    fn test_read_back_sequence() {
        let mut data = Vec::new();
        let header = ChunkSpec::new(CRID_SIGNATURE, PayloadType::Header).padding(7);
        data.extend(wrap_chunk(&header, b"table", Stage::Assemble).unwrap());
        let stream = ChunkSpec::new(AUDIO_SIGNATURE, PayloadType::Stream).channel(1);
        data.extend(wrap_chunk(&stream, b"sound", Stage::Assemble).unwrap());

        let mut reader = ChunkReader::new(Cursor::new(data), Stage::Demux);
        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!(first.signature_str(), "CRID");
        assert_eq!(first.payload_type, PayloadType::Header);
        assert_eq!(first.payload, b"table");

        let second = reader.next_chunk().unwrap().unwrap();
        assert_eq!(second.signature, AUDIO_SIGNATURE);
        assert_eq!(second.channel, 1);
        assert_eq!(second.payload, b"sound");

        assert!(reader.next_chunk().unwrap().is_none());
        assert_eq!(reader.index(), 2);
    }

    #[test]
    fn test_header_extension_is_skipped() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream);
        let mut chunk = wrap_chunk(&spec, b"payload!", Stage::Demux).unwrap();
        // Grow the payload offset by 4 and insert the extension bytes
        chunk[9] = 0x1C;
        let size = u32::from_be_bytes(chunk[4..8].try_into().unwrap()) + 4;
        chunk[4..8].copy_from_slice(&size.to_be_bytes());
        chunk.splice(0x20..0x20, [0xEE; 4]);

        let mut reader = ChunkReader::new(Cursor::new(chunk), Stage::Demux);
        assert_eq!(reader.next_chunk().unwrap().unwrap().payload, b"payload!");
    }

    #[test]
    fn test_truncated_payload_is_fatal() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream);
        let chunk = wrap_chunk(&spec, &[1u8; 64], Stage::Demux).unwrap();
        let cut = &chunk[..0x20 + 10];

        let err = ChunkReader::new(Cursor::new(cut), Stage::Demux)
            .next_chunk()
            .unwrap_err();
        assert!(matches!(err, UsmError::TruncatedStream { chunk: 0, .. }));
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let err = ChunkReader::new(Cursor::new(b"@SFV\0\0".to_vec()), Stage::Demux)
            .next_chunk()
            .unwrap_err();
        assert!(matches!(err, UsmError::TruncatedStream { .. }));
    }

    #[test]
    fn test_inconsistent_sizes_are_malformed() {
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream);
        let mut chunk = wrap_chunk(&spec, b"abc", Stage::Demux).unwrap();
        chunk[10..12].copy_from_slice(&0x100u16.to_be_bytes());
        let err = ChunkReader::new(Cursor::new(chunk), Stage::Demux)
            .next_chunk()
            .unwrap_err();
        assert!(matches!(
            err,
            UsmError::MalformedChunk {
                stage: Stage::Demux,
                ..
            }
        ));
    }

    #[test]
    fn test_padding_rules() {
        assert_eq!(alignment_padding(0x40, 0x20), 0);
        assert_eq!(alignment_padding(0x41, 0x20), 0x1F);
        assert_eq!(metadata_padding(0x20), 0xD0);
        assert_eq!(metadata_padding(0xF0), 0);
        assert_eq!(metadata_padding(0xF1), 7);
        assert_eq!(sector_padding(0, 0x20 + 0x123), 0x800 - 0x143);
        assert_eq!(sector_padding(0x7F0, 0x10), 0);
    }

    #[test]
    fn test_payload_type_masks_high_bits() {
        assert_eq!(PayloadType::from_u8(0x41), PayloadType::Header);
        assert_eq!(PayloadType::from_u8(3), PayloadType::Metadata);
    }
}
