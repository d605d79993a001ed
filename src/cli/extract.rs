use crate::chunk::{ChunkReader, PayloadType, AUDIO_SIGNATURE, VIDEO_SIGNATURE};
use crate::config::DEFAULT_KEY;
use crate::error::{IoStage, Result, Stage, UsmError};
use crate::pipeline::cipher::{decrypt_audio, decrypt_video};
use crate::pipeline::keys::derive_keys;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, trace, warn};

pub const VIDEOS_DIR: &str = "videos";
pub const AUDIOS_DIR: &str = "audios";

/// Options for the extract command
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub key: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { key: DEFAULT_KEY }
    }
}

/// What an extraction produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub chunks: usize,
    pub videos: Vec<PathBuf>,
    pub audios: Vec<PathBuf>,
}

/// Extension for a video stream, sniffed from its first payload
pub fn video_extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"DKIF") {
        "ivf"
    } else if data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1]) {
        "h264"
    } else {
        "bin"
    }
}

/// Extension for an audio stream, sniffed from its first payload
pub fn audio_extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"HCA\0") {
        "hca"
    } else {
        "bin"
    }
}

struct ChannelOutput {
    file_name: String,
    writer: BufWriter<File>,
}

#[derive(Clone, Copy)]
enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn dir(self) -> &'static str {
        match self {
            StreamKind::Video => VIDEOS_DIR,
            StreamKind::Audio => AUDIOS_DIR,
        }
    }

    fn file_name(self, channel: u8, first_payload: &[u8]) -> String {
        match self {
            StreamKind::Video => format!("video_{channel:02}.{}", video_extension(first_payload)),
            StreamKind::Audio => format!("audio_{channel:02}.{}", audio_extension(first_payload)),
        }
    }
}

/// Per-channel output files, opened on the first payload of each channel
struct ChannelWriters {
    root: PathBuf,
    kind: StreamKind,
    channels: BTreeMap<u8, ChannelOutput>,
}

impl ChannelWriters {
    fn new(root: &Path, kind: StreamKind) -> Self {
        Self {
            root: root.join(kind.dir()),
            kind,
            channels: BTreeMap::new(),
        }
    }

    fn write(&mut self, channel: u8, payload: &[u8]) -> Result<()> {
        let output = match self.channels.entry(channel) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let file_name = self.kind.file_name(channel, payload);
                let file = File::create(self.root.join(&file_name)).in_stage(Stage::Demux)?;
                debug!(channel, file = %file_name, "opened channel output");
                entry.insert(ChannelOutput {
                    file_name,
                    writer: BufWriter::new(file),
                })
            }
        };
        output.writer.write_all(payload).in_stage(Stage::Demux)
    }

    /// Flush every channel, returning where each file sits and where it goes
    fn flush(self, dest: &Path) -> Result<Vec<StagedFile>> {
        let target_dir = dest.join(self.kind.dir());
        let mut staged = Vec::with_capacity(self.channels.len());
        for output in self.channels.into_values() {
            let file = output
                .writer
                .into_inner()
                .map_err(|e| e.into_error())
                .in_stage(Stage::Demux)?;
            file.sync_all().in_stage(Stage::Demux)?;
            drop(file);

            staged.push(StagedFile {
                staged: self.root.join(&output.file_name),
                target: target_dir.join(&output.file_name),
            });
        }
        Ok(staged)
    }
}

struct StagedFile {
    staged: PathBuf,
    target: PathBuf,
}

/// Move every staged file into place. A failed move puts back the files
/// already moved.
fn publish(files: &[StagedFile]) -> Result<()> {
    for (moved, file) in files.iter().enumerate() {
        if let Err(source) = fs::rename(&file.staged, &file.target) {
            for done in &files[..moved] {
                if let Err(e) = fs::rename(&done.target, &done.staged) {
                    warn!(path = %done.target.display(), error = %e, "failed to roll back extracted file");
                }
            }
            return Err(UsmError::Io {
                stage: Stage::Demux,
                source,
            });
        }
    }
    Ok(())
}

/// Split a USM container into per-channel elementary streams under
/// `output_dir/videos` and `output_dir/audios`.
///
/// Nothing is written to those directories unless the whole container
/// demuxes cleanly.
pub fn extract_container(
    source: &Path,
    output_dir: &Path,
    options: &ExtractOptions,
) -> Result<ExtractSummary> {
    if !source.is_file() {
        return Err(UsmError::FileNotFound(source.to_path_buf()));
    }
    fs::create_dir_all(output_dir).in_stage(Stage::Demux)?;

    let staging = tempfile::Builder::new()
        .prefix(".usmkit-")
        .tempdir_in(output_dir)
        .in_stage(Stage::Demux)?;
    let result = demux(source, output_dir, staging.path(), options.key);
    close_staging(staging);
    result
}

fn close_staging(staging: TempDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        warn!(path = %path.display(), error = %e, "failed to remove staging directory");
    }
}

fn demux(source: &Path, output_dir: &Path, staging: &Path, key: u64) -> Result<ExtractSummary> {
    info!(source = %source.display(), "demuxing");
    let keys = derive_keys(key);

    let mut videos = ChannelWriters::new(staging, StreamKind::Video);
    let mut audios = ChannelWriters::new(staging, StreamKind::Audio);
    fs::create_dir_all(&videos.root).in_stage(Stage::Demux)?;
    fs::create_dir_all(&audios.root).in_stage(Stage::Demux)?;

    let file = File::open(source).in_stage(Stage::Demux)?;
    let mut reader = ChunkReader::new(BufReader::new(file), Stage::Demux);
    while let Some(mut chunk) = reader.next_chunk()? {
        if chunk.payload_type != PayloadType::Stream || chunk.payload.is_empty() {
            continue;
        }
        match chunk.signature {
            VIDEO_SIGNATURE => {
                decrypt_video(&mut chunk.payload, &keys.video);
                videos.write(chunk.channel, &chunk.payload)?;
            }
            AUDIO_SIGNATURE => {
                decrypt_audio(&mut chunk.payload, &keys.audio);
                audios.write(chunk.channel, &chunk.payload)?;
            }
            _ => trace!(signature = %chunk.signature_str(), "skipping stream chunk"),
        }
    }

    let mut staged = videos.flush(output_dir)?;
    let video_count = staged.len();
    staged.extend(audios.flush(output_dir)?);

    for dir in [VIDEOS_DIR, AUDIOS_DIR] {
        fs::create_dir_all(output_dir.join(dir)).in_stage(Stage::Demux)?;
    }
    publish(&staged)?;

    let mut targets: Vec<PathBuf> = staged.into_iter().map(|file| file.target).collect();
    let audios = targets.split_off(video_count);
    let summary = ExtractSummary {
        chunks: reader.index(),
        videos: targets,
        audios,
    };
    info!(
        chunks = summary.chunks,
        videos = summary.videos.len(),
        audios = summary.audios.len(),
        "demux complete"
    );
    Ok(summary)
}
