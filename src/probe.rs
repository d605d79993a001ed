//! Media probing through ffprobe.
//!
//! The mux pipeline only sees the [`MediaTool`] trait, so tests can hand it
//! synthetic probe results instead of shelling out.

use crate::config::ToolPaths;
use crate::error::{Result, Stage, UsmError};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// Frame rate used when ffprobe reports none (or nonsense)
pub const FALLBACK_FRAME_RATE: f64 = 30.0;

/// One demuxable packet of the source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub offset: u64,
    pub keyframe: bool,
}

/// What the mux pipeline needs to know about a source file
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub codec_name: String,
    /// Comma-separated container tags, e.g. `mov,mp4,m4a`
    pub format_name: String,
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    pub bitrate: i32,
    pub packets: Vec<Packet>,
}

impl ProbeInfo {
    /// Whether the container tag list names `format` (case-insensitive)
    pub fn format_contains(&self, format: &str) -> bool {
        self.format_name
            .split(',')
            .any(|tag| tag.trim().eq_ignore_ascii_case(format))
    }

    pub fn is_codec(&self, codec: &str) -> bool {
        self.codec_name.eq_ignore_ascii_case(codec)
    }

    pub fn packet_offsets(&self) -> Vec<u64> {
        self.packets.iter().map(|p| p.offset).collect()
    }

    pub fn keyframe_flags(&self) -> Vec<bool> {
        self.packets.iter().map(|p| p.keyframe).collect()
    }
}

/// External probe/transcode tool
pub trait MediaTool {
    fn probe(&self, path: &Path) -> Result<ProbeInfo>;

    /// Rewrite the first video stream of `source` as a raw Annex-B H264
    /// elementary stream at `dest`.
    fn remux_to_annex_b(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// [`MediaTool`] backed by the ffprobe and ffmpeg binaries
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffprobe: PathBuf, ffmpeg: PathBuf) -> Self {
        Self { ffprobe, ffmpeg }
    }

    pub fn from_paths(paths: &ToolPaths) -> Self {
        Self::new(paths.resolve_ffprobe(), paths.resolve_ffmpeg())
    }

    fn run(&self, program: &Path, mut cmd: Command, subject: &Path) -> Result<Output> {
        debug!(tool = %program.display(), file = %subject.display(), "running");
        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UsmError::probe_failed(
                    subject,
                    format!("{} not found", program.display()),
                ))
            }
            Err(source) => {
                return Err(UsmError::Io {
                    stage: Stage::Probe,
                    source,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UsmError::probe_failed(
                subject,
                format!(
                    "{} exited with {}: {}",
                    program.display(),
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(output)
    }
}

impl MediaTool for FfmpegTool {
    fn probe(&self, path: &Path) -> Result<ProbeInfo> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "packet=pos,flags",
            "-show_entries",
            "stream=codec_name,width,height,r_frame_rate,bit_rate",
            "-show_entries",
            "format=format_name,bit_rate",
            "-of",
            "json",
        ])
        .arg(path);

        let output = self.run(&self.ffprobe, cmd, path)?;
        parse_ffprobe_output(path, &String::from_utf8_lossy(&output.stdout))
    }

    fn remux_to_annex_b(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error", "-y", "-i"])
            .arg(source)
            .args([
                "-map",
                "0:v:0",
                "-c:v",
                "copy",
                "-an",
                "-sn",
                "-dn",
                "-bsf:v",
                "h264_mp4toannexb",
                "-f",
                "h264",
            ])
            .arg(dest);

        self.run(&self.ffmpeg, cmd, source)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    packets: Vec<FfprobePacket>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobePacket {
    pos: Option<String>,
    flags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    bit_rate: Option<String>,
}

/// Map ffprobe's JSON output onto [`ProbeInfo`]
pub fn parse_ffprobe_output(path: &Path, json: &str) -> Result<ProbeInfo> {
    let ff: FfprobeOutput = serde_json::from_str(json)?;

    let stream = ff
        .streams
        .iter()
        .find(|s| s.width.is_some())
        .or_else(|| ff.streams.first())
        .ok_or_else(|| UsmError::probe_failed(path, "no video stream"))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width <= 0 || height <= 0 || width > i32::MAX as i64 || height > i32::MAX as i64 {
        return Err(UsmError::probe_failed(
            path,
            format!("invalid video dimensions {width}x{height}"),
        ));
    }

    let format = ff.format.as_ref();
    let bitrate = match parse_int(stream.bit_rate.as_deref()) {
        0 => parse_int(format.and_then(|f| f.bit_rate.as_deref())),
        rate => rate,
    };

    // Packets without a usable position cannot be located in the file
    let packets: Vec<Packet> = ff
        .packets
        .iter()
        .filter_map(|p| {
            let offset = p.pos.as_deref()?.trim().parse::<u64>().ok()?;
            let keyframe = p.flags.as_deref().is_some_and(|f| f.contains('K'));
            Some(Packet { offset, keyframe })
        })
        .collect();
    if packets.is_empty() {
        return Err(UsmError::probe_failed(path, "no packet offsets reported"));
    }

    Ok(ProbeInfo {
        codec_name: stream.codec_name.clone().unwrap_or_default(),
        format_name: format
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        width: width as i32,
        height: height as i32,
        frame_rate: parse_fraction(stream.r_frame_rate.as_deref()),
        bitrate,
        packets,
    })
}

/// Parse `num/den`, falling back to [`FALLBACK_FRAME_RATE`]
pub fn parse_fraction(value: Option<&str>) -> f64 {
    let Some((num, den)) = value.and_then(|v| v.trim().split_once('/')) else {
        return FALLBACK_FRAME_RATE;
    };
    match (num.trim().parse::<f64>(), den.trim().parse::<f64>()) {
        (Ok(num), Ok(den)) if den.abs() > f64::EPSILON && (num / den).is_finite() => num / den,
        _ => FALLBACK_FRAME_RATE,
    }
}

fn parse_int(value: Option<&str>) -> i32 {
    value
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(0)
}
