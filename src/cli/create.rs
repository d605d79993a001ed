use crate::config::{ToolPaths, DEFAULT_KEY};
use crate::error::{IoStage, Result, Stage, UsmError};
use crate::mux::{
    assemble, build_prestream_chunks, needs_annex_b_remux, pack_video_stream,
    resolve_codec_settings, stream_crid_page, video_header_page, PrestreamLayout,
};
use crate::pipeline::frames::build_frame_table;
use crate::pipeline::keys::derive_keys;
use crate::probe::{FfmpegTool, MediaTool};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

/// Options for the create command
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub key: u64,
    /// Defaults to the source path with a `.usm` extension
    pub output: Option<PathBuf>,
    pub tools: ToolPaths,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY,
            output: None,
            tools: ToolPaths::default(),
        }
    }
}

pub fn default_output_path(source: &Path) -> PathBuf {
    source.with_extension("usm")
}

/// Mux a VP9/IVF or H264 video into a USM container using ffprobe/ffmpeg.
/// Returns the path written.
pub fn create_container(source: &Path, options: &CreateOptions) -> Result<PathBuf> {
    let tool = FfmpegTool::from_paths(&options.tools);
    create_container_with(&tool, source, options)
}

/// [`create_container`] with an explicit probe tool
pub fn create_container_with(
    tool: &dyn MediaTool,
    source: &Path,
    options: &CreateOptions,
) -> Result<PathBuf> {
    if !source.is_file() {
        return Err(UsmError::FileNotFound(source.to_path_buf()));
    }
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(source));

    let workspace = tempfile::Builder::new()
        .prefix("usmkit-")
        .tempdir()
        .in_stage(Stage::Probe)?;
    let result = mux(tool, source, &output, options.key, workspace.path());
    close_workspace(workspace);
    result.map(|()| output)
}

fn close_workspace(workspace: TempDir) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        warn!(path = %path.display(), error = %e, "failed to remove workspace");
    }
}

fn mux(
    tool: &dyn MediaTool,
    source: &Path,
    output: &Path,
    key: u64,
    workspace: &Path,
) -> Result<()> {
    info!(source = %source.display(), "probing");
    let mut probe = tool.probe(source)?;
    let mut stream_path = source.to_path_buf();
    if needs_annex_b_remux(&probe) {
        let remuxed = workspace.join("stream.h264");
        info!(format = %probe.format_name, "remuxing H264 to an Annex-B stream");
        tool.remux_to_annex_b(source, &remuxed)?;
        probe = tool.probe(&remuxed)?;
        stream_path = remuxed;
    }

    let settings = resolve_codec_settings(&probe)?;
    let source_size = fs::metadata(&stream_path).in_stage(Stage::Validate)?.len();
    let frames = build_frame_table(&probe.packet_offsets(), &probe.keyframe_flags(), source_size)?;
    let keyframes = frames.iter().filter(|f| f.keyframe).count();
    let max_frame = frames.iter().map(|f| f.size).max().unwrap_or(0);
    info!(
        codec = ?settings.codec,
        width = probe.width,
        height = probe.height,
        frame_rate = probe.frame_rate,
        frames = frames.len(),
        keyframes,
        "validated source"
    );

    debug!("deriving keys from seed {key:#018x}");
    let keys = derive_keys(key);

    let mut scratch = tempfile::tempfile_in(workspace).in_stage(Stage::PackStream)?;
    let mut input = File::open(&stream_path).in_stage(Stage::PackStream)?;
    let stream = pack_video_stream(
        &mut input,
        &frames,
        probe.frame_rate,
        &keys.video,
        &mut BufWriter::new(&mut scratch),
    )?;
    info!(bytes = stream.stream_size, "packed stream section");

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "movie".to_string());
    let container_name = Path::new(&file_name)
        .with_extension("usm")
        .to_string_lossy()
        .into_owned();
    let stream_page =
        stream_crid_page(&file_name, source_size, max_frame, &settings, probe.bitrate)?;
    let header_page = video_header_page(&probe, &settings, &frames)?;
    let prestream = build_prestream_chunks(&PrestreamLayout {
        stream_page: &stream_page,
        header_page: &header_page,
        stream: &stream,
        container_filename: &container_name,
        bitrate: probe.bitrate,
    })?;

    // Stage next to the destination so the final rename stays on one filesystem
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).in_stage(Stage::Assemble)?;
    let mut staged = NamedTempFile::new_in(parent).in_stage(Stage::Assemble)?;
    let written = assemble(
        &prestream,
        &mut scratch,
        &mut BufWriter::new(staged.as_file_mut()),
    )?;
    staged.persist(output).map_err(|e| UsmError::Io {
        stage: Stage::Assemble,
        source: e.error,
    })?;

    info!(output = %output.display(), bytes = written, "container written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Packet, ProbeInfo};
    use tempfile::tempdir;

    struct FixedProbe(ProbeInfo);

    impl MediaTool for FixedProbe {
        fn probe(&self, _path: &Path) -> Result<ProbeInfo> {
            Ok(self.0.clone())
        }

        fn remux_to_annex_b(&self, _source: &Path, _dest: &Path) -> Result<()> {
            panic!("remux not expected");
        }
    }

    fn probe(codec: &str, format: &str, offsets: &[u64]) -> ProbeInfo {
        ProbeInfo {
            codec_name: codec.into(),
            format_name: format.into(),
            width: 320,
            height: 240,
            frame_rate: 30.0,
            bitrate: 0,
            packets: offsets
                .iter()
                .map(|&offset| Packet {
                    offset,
                    keyframe: offset == offsets[0],
                })
                .collect(),
        }
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/clip.ivf")),
            PathBuf::from("/tmp/clip.usm")
        );
    }

    #[test]
    fn test_missing_source() {
        let dir = tempdir().unwrap();
        let tool = FixedProbe(probe("vp9", "ivf", &[0]));
        let err =
            create_container_with(&tool, &dir.path().join("absent.ivf"), &CreateOptions::default())
                .unwrap_err();
        assert!(matches!(err, UsmError::FileNotFound(_)));
    }

    #[test]
    fn test_failed_mux_leaves_no_output() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("clip.webm");
        fs::write(&source, vec![0u8; 256]).unwrap();

        let tool = FixedProbe(probe("vp9", "matroska,webm", &[0, 128]));
        let err = create_container_with(&tool, &source, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, UsmError::UnsupportedCodec { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_packet_table() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("clip.ivf");
        fs::write(&source, vec![0u8; 100]).unwrap();

        let tool = FixedProbe(probe("vp9", "ivf", &[32, 20]));
        let err = create_container_with(&tool, &source, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, UsmError::CorruptFrameTable { frame: 0, .. }));
        assert!(!dir.path().join("clip.usm").exists());
    }

    #[test]
    fn test_writes_default_output() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("clip.ivf");
        let mut data = b"DKIF".to_vec();
        data.resize(0x900, 0x5A);
        fs::write(&source, &data).unwrap();

        let tool = FixedProbe(probe("vp9", "ivf", &[32, 0x400]));
        let written = create_container_with(&tool, &source, &CreateOptions::default()).unwrap();
        assert_eq!(written, dir.path().join("clip.usm"));

        let container = fs::read(&written).unwrap();
        assert_eq!(&container[..4], b"CRID");
        assert_eq!(container.len() % 0x20, 0);
    }
}
