use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;
use usmkit::chunk::{wrap_chunk, ChunkSpec, PayloadType, CRID_SIGNATURE, VIDEO_SIGNATURE};
use usmkit::pipeline::{derive_keys, encrypt_video};
use usmkit::Stage;

fn usmkit_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_usmkit"))
}

fn run(args: &[&str]) -> Result<Output, Box<dyn Error>> {
    Ok(usmkit_command().args(args).output()?)
}

/// A minimal container: an info chunk and one encrypted video frame
fn write_container(path: &Path, seed: u64, frame: &[u8]) -> Result<(), Box<dyn Error>> {
    let keys = derive_keys(seed);
    let mut payload = frame.to_vec();
    encrypt_video(&mut payload, &keys.video);

    let mut data = wrap_chunk(
        &ChunkSpec::new(CRID_SIGNATURE, PayloadType::Header),
        b"info",
        Stage::Assemble,
    )?;
    data.extend(wrap_chunk(
        &ChunkSpec::new(VIDEO_SIGNATURE, PayloadType::Stream),
        &payload,
        Stage::Assemble,
    )?);
    fs::write(path, data)?;
    Ok(())
}

#[test]
fn version_flag() -> Result<(), Box<dyn Error>> {
    let output = run(&["--version"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.starts_with("usmkit "));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn no_command_prints_help() -> Result<(), Box<dyn Error>> {
    let output = run(&[])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("create"));
    assert!(stdout.contains("extract"));
    assert!(stdout.contains("info"));
    Ok(())
}

#[test]
fn invalid_key_is_rejected_before_io() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let out = dir.path().join("out");
    let output = run(&[
        "extract",
        "--key",
        "0xNOTHEX",
        "missing.usm",
        out.to_str().unwrap(),
    ])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid key"));
    assert!(!out.exists(), "no output directory for a rejected key");
    Ok(())
}

#[test]
fn extract_and_info_flow() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let container = dir.path().join("movie.usm");
    let out = dir.path().join("out");

    let mut frame = b"DKIF".to_vec();
    frame.resize(0x280, 0x42);
    write_container(&container, 0xABCD, &frame)?;

    let info = run(&["info", container.to_str().unwrap()])?;
    assert!(info.status.success());
    let info_stdout = String::from_utf8(info.stdout)?;
    assert!(info_stdout.contains("Chunks: 2"));
    assert!(info_stdout.contains("@SFV channel 0: 640 B"));

    let extract = run(&[
        "extract",
        "--key",
        "abcd",
        container.to_str().unwrap(),
        out.to_str().unwrap(),
    ])?;
    assert!(
        extract.status.success(),
        "extract command failed: {}",
        String::from_utf8_lossy(&extract.stderr)
    );
    assert!(String::from_utf8(extract.stdout)?.contains("video_00.ivf"));
    assert_eq!(fs::read(out.join("videos").join("video_00.ivf"))?, frame);
    Ok(())
}

#[test]
fn create_fails_cleanly_without_ffprobe() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let source = dir.path().join("clip.ivf");
    fs::write(&source, b"DKIF not really a video")?;

    let output = run(&[
        "create",
        source.to_str().unwrap(),
        "--ffprobe",
        "/nonexistent/ffprobe",
    ])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error: Probe failed"));
    assert!(!dir.path().join("clip.usm").exists());
    Ok(())
}

#[test]
fn create_missing_source() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let source = dir.path().join("absent.ivf");
    let output = run(&["create", source.to_str().unwrap()])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("File not found"));
    Ok(())
}
