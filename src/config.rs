use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub use crate::pipeline::keys::DEFAULT_KEY;

/// Environment variable overriding the ffprobe location
pub const FFPROBE_ENV: &str = "USMKIT_FFPROBE";

/// Environment variable overriding the ffmpeg location
pub const FFMPEG_ENV: &str = "USMKIT_FFMPEG";

/// Locations of the external media tools.
///
/// Unset entries are resolved from the environment, then `PATH`, and
/// finally left as the bare program name for the OS to find.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub ffprobe: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
}

impl ToolPaths {
    pub fn resolve_ffprobe(&self) -> PathBuf {
        resolve_tool(
            self.ffprobe.as_deref(),
            std::env::var_os(FFPROBE_ENV),
            "ffprobe",
        )
    }

    pub fn resolve_ffmpeg(&self) -> PathBuf {
        resolve_tool(
            self.ffmpeg.as_deref(),
            std::env::var_os(FFMPEG_ENV),
            "ffmpeg",
        )
    }
}

fn resolve_tool(explicit: Option<&Path>, env_value: Option<OsString>, program: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return PathBuf::from(value);
    }
    which::which(program).unwrap_or_else(|_| PathBuf::from(program))
}
