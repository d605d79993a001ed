use crate::chunk::{ChunkReader, PayloadType};
use crate::error::{IoStage, Result, Stage, UsmError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Chunk census of a USM container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub size: u64,
    pub chunks: usize,
    /// Chunk counts keyed by signature and payload type
    pub census: BTreeMap<(String, PayloadType), usize>,
    /// Stream payload bytes keyed by signature and channel
    pub streams: BTreeMap<(String, u8), u64>,
}

/// Walk every chunk of `path` without decrypting anything
pub fn scan_container(path: &Path) -> Result<ContainerInfo> {
    if !path.is_file() {
        return Err(UsmError::FileNotFound(path.to_path_buf()));
    }
    let file = File::open(path).in_stage(Stage::Info)?;
    let mut reader = ChunkReader::new(BufReader::new(file), Stage::Info);

    let mut info = ContainerInfo::default();
    while let Some(chunk) = reader.next_chunk()? {
        let signature = chunk.signature_str();
        *info
            .census
            .entry((signature.clone(), chunk.payload_type))
            .or_default() += 1;
        if chunk.payload_type == PayloadType::Stream {
            *info.streams.entry((signature, chunk.channel)).or_default() +=
                chunk.payload.len() as u64;
        }
    }
    info.chunks = reader.index();
    info.size = reader.position();
    Ok(info)
}

/// Display information about a USM file
pub fn show_info(path: &Path) -> Result<String> {
    let info = scan_container(path)?;
    let mut output = String::new();

    output.push_str("USM Container Information\n");
    output.push_str("=========================\n\n");
    output.push_str(&format!("File: {}\n", path.display()));
    output.push_str(&format!("Size: {}\n", format_size(info.size)));
    output.push_str(&format!("Chunks: {}\n\n", info.chunks));

    output.push_str("Chunks by type:\n");
    for ((signature, payload_type), count) in &info.census {
        output.push_str(&format!(
            "  {signature} {:<10} {count}\n",
            type_name(*payload_type)
        ));
    }

    output.push_str("\nStreams:\n");
    if info.streams.is_empty() {
        output.push_str("  (none)\n");
    }
    for ((signature, channel), bytes) in &info.streams {
        output.push_str(&format!(
            "  {signature} channel {channel}: {}\n",
            format_size(*bytes)
        ));
    }

    Ok(output)
}

fn type_name(payload_type: PayloadType) -> &'static str {
    match payload_type {
        PayloadType::Stream => "stream",
        PayloadType::Header => "header",
        PayloadType::SectionEnd => "end",
        PayloadType::Metadata => "metadata",
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{wrap_chunk, ChunkSpec, AUDIO_SIGNATURE, CRID_SIGNATURE, VIDEO_SIGNATURE};
    use tempfile::tempdir;

    #[test]
    fn test_show_info() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.usm");

        let mut data = Vec::new();
        for (signature, payload_type, channel, len) in [
            (CRID_SIGNATURE, PayloadType::Header, 0, 40),
            (VIDEO_SIGNATURE, PayloadType::Stream, 0, 100),
            (VIDEO_SIGNATURE, PayloadType::Stream, 0, 28),
            (AUDIO_SIGNATURE, PayloadType::Stream, 1, 64),
            (VIDEO_SIGNATURE, PayloadType::SectionEnd, 0, 32),
        ] {
            let spec = ChunkSpec::new(signature, payload_type).channel(channel);
            data.extend(wrap_chunk(&spec, &vec![0u8; len], Stage::Assemble).unwrap());
        }
        std::fs::write(&path, &data).unwrap();

        let info = scan_container(&path).unwrap();
        assert_eq!(info.chunks, 5);
        assert_eq!(info.size, data.len() as u64);
        assert_eq!(info.census[&("@SFV".to_string(), PayloadType::Stream)], 2);
        assert_eq!(info.streams[&("@SFV".to_string(), 0)], 128);
        assert_eq!(info.streams[&("@SFA".to_string(), 1)], 64);

        let text = show_info(&path).unwrap();
        assert!(text.contains("Chunks: 5"));
        assert!(text.contains("@SFA channel 1: 64 B"));
        assert!(text.contains("CRID header"));
    }

    #[test]
    fn test_truncated_file_reports_info_stage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.usm");

        // Header declares a 0x40-byte chunk but only 3 payload bytes follow
        let spec = ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream);
        let chunk = wrap_chunk(&spec, &[0u8; 0x20], Stage::Assemble).unwrap();
        std::fs::write(&path, &chunk[..0x23]).unwrap();

        let err = scan_container(&path).unwrap_err();
        assert!(matches!(err, UsmError::TruncatedStream { chunk: 0, .. }));
        assert_eq!(err.stage(), Some(Stage::Info));
        assert!(err.to_string().contains("during info"));
    }

    #[test]
    fn test_show_info_missing_file() {
        let err = show_info(Path::new("/nonexistent/movie.usm")).unwrap_err();
        assert!(matches!(err, UsmError::FileNotFound(_)));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1048576), "1.0 MB");
    }
}
