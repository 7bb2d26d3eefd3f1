//! External process helpers.
use crate::log::ProgressLogger;
use anyhow::{Context, anyhow, ensure};
use log::debug;
use std::{
    borrow::Cow,
    ffi::OsStr,
    io,
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};
use time::macros::format_description;
use tokio::process::Command;
use tokio_process_stream::{Item, ProcessChunkStream};
use tokio_stream::{Stream, StreamExt};

/// Stderr tail kept for error messages & score parsing.
const CHUNKS_MAX_BYTES: usize = 64 * 1024;

pub fn ensure_success(name: &str, out: &Output) -> anyhow::Result<()> {
    ensure!(
        out.status.success(),
        "{name} exit code {:?}\n{}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr).trim(),
    );
    Ok(())
}

/// Convert exit code result into simple result, including the stderr tail on failure.
pub fn exit_ok_stderr(
    name: &str,
    done: io::Result<ExitStatus>,
    cmd_str: &str,
    chunks: &Chunks,
) -> anyhow::Result<()> {
    let code = done.with_context(|| format!("{name}: {cmd_str}"))?;
    if code.success() {
        return Ok(());
    }
    Err(cmd_err(
        format!("{name} exit code {:?}", code.code()),
        cmd_str,
        chunks,
    ))
}

pub fn cmd_err(msg: impl std::fmt::Display, cmd_str: &str, chunks: &Chunks) -> anyhow::Error {
    anyhow!("{msg}\n----cmd-----\n{cmd_str}\n---stderr---\n{}", chunks.tail(20))
}

/// Rolling buffer of process output.
#[derive(Debug, Default)]
pub struct Chunks {
    data: Vec<u8>,
}

impl Chunks {
    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        if self.data.len() > CHUNKS_MAX_BYTES {
            let mut cut = self.data.len() - CHUNKS_MAX_BYTES;
            if let Some(nl) = self.data[cut..].iter().position(|b| *b == b'\n') {
                cut += nl + 1;
            }
            self.data.drain(..cut);
        }
    }

    fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Last non-empty line, ffmpeg `\r` progress updates count as lines.
    pub fn last_line(&self) -> String {
        self.text()
            .split(['\n', '\r'])
            .rfind(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .to_owned()
    }

    /// Search lines from the end, returning the first `f` maps to `Some`.
    pub fn rfind_line_map<T>(&self, f: impl Fn(&str) -> Option<T>) -> Option<T> {
        self.text().split(['\n', '\r']).rev().find_map(f)
    }

    /// The last `n` lines joined.
    pub fn tail(&self, n: usize) -> String {
        let text = self.text();
        let lines: Vec<_> = text
            .split(['\n', '\r'])
            .filter(|l| !l.trim().is_empty())
            .collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

#[derive(Debug, PartialEq)]
pub struct FfmpegProgress {
    pub frame: u64,
    pub fps: f32,
    pub time: Duration,
}

impl FfmpegProgress {
    pub fn try_parse(out: &str) -> Option<Self> {
        let out = out.trim();
        if !out.starts_with("frame=") {
            return None;
        }
        let frame: u64 = parse_label_substr("frame=", out)?.parse().ok()?;
        let fps: f32 = parse_label_substr("fps=", out)?.parse().ok()?;
        let (h, m, s, ns) = time::Time::parse(
            parse_label_substr("time=", out)?,
            &format_description!("[hour]:[minute]:[second].[subsecond]"),
        )
        .ok()?
        .as_hms_nano();
        Some(Self {
            frame,
            fps,
            time: Duration::new(h as u64 * 60 * 60 + m as u64 * 60 + s as u64, ns),
        })
    }
}

/// Parse a ffmpeg `label=  value ` type substring.
fn parse_label_substr<'a>(label: &str, line: &'a str) -> Option<&'a str> {
    let line = &line[line.find(label)? + label.len()..];
    let val_start = line.char_indices().find(|(_, c)| !c.is_whitespace())?.0;
    let val_end = val_start
        + line[val_start..]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(idx, _)| idx)
            .unwrap_or_else(|| line[val_start..].len());

    Some(&line[val_start..val_end])
}

#[derive(Debug)]
pub enum FfmpegOut {
    Progress(FfmpegProgress),
    /// Process exited, `Ok` with the stderr tail if successful.
    Done(anyhow::Result<Chunks>),
}

/// Spawn an ffmpeg-style command streaming parsed progress then a final [`FfmpegOut::Done`].
pub fn ffmpeg_stream(
    mut cmd: Command,
    name: &'static str,
) -> anyhow::Result<impl Stream<Item = FfmpegOut>> {
    cmd.kill_on_drop(true).stdin(Stdio::null());
    let cmd_str = cmd.to_cmd_str();
    debug!("cmd `{cmd_str}`");
    let mut proc = ProcessChunkStream::try_from(cmd).with_context(|| format!("{name}: {cmd_str}"))?;

    Ok(async_stream::stream! {
        let mut chunks = Chunks::default();
        while let Some(next) = proc.next().await {
            match next {
                Item::Stderr(chunk) => {
                    chunks.push(&chunk);
                    if let Some(progress) = FfmpegProgress::try_parse(&chunks.last_line()) {
                        yield FfmpegOut::Progress(progress);
                    }
                }
                Item::Stdout(_) => {}
                Item::Done(code) => {
                    let result = exit_ok_stderr(name, code, &cmd_str, &chunks);
                    yield FfmpegOut::Done(result.map(|_| std::mem::take(&mut chunks)));
                    return;
                }
            }
        }
    })
}

/// Run an [`ffmpeg_stream`] to completion, logging progress against `total` if known.
pub async fn ffmpeg_run(
    cmd: Command,
    name: &'static str,
    total: Option<Duration>,
) -> anyhow::Result<Chunks> {
    let mut out = std::pin::pin!(ffmpeg_stream(cmd, name)?);
    let mut logger = ProgressLogger::new(name, std::time::Instant::now());
    while let Some(next) = out.next().await {
        match next {
            FfmpegOut::Progress(FfmpegProgress { time, fps, .. }) => {
                if let Some(total) = total {
                    logger.update(total, time, fps);
                }
            }
            FfmpegOut::Done(result) => return result,
        }
    }
    Err(anyhow!("{name} exited without status"))
}

pub trait CommandExt {
    /// Adds two arguments.
    fn arg2(&mut self, a: impl AsRef<OsStr>, b: impl AsRef<OsStr>) -> &mut Self;

    /// Convert to readable shell-like string.
    fn to_cmd_str(&self) -> String;
}
impl CommandExt for Command {
    fn arg2(&mut self, a: impl AsRef<OsStr>, b: impl AsRef<OsStr>) -> &mut Self {
        self.arg(a).arg(b)
    }

    fn to_cmd_str(&self) -> String {
        let cmd = self.as_std();
        cmd.get_args().fold(
            cmd.get_program().to_string_lossy().to_string(),
            |mut out, a| {
                out += " ";
                out += shell_escape::escape(a.to_string_lossy()).as_ref();
                out
            },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_ffmpeg_progress() {
        let out = "frame=  288 fps= 94 q=-0.0 size=N/A time=01:23:12.34 bitrate=N/A speed=3.94x    \r";
        assert_eq!(
            FfmpegProgress::try_parse(out),
            Some(FfmpegProgress {
                frame: 288,
                fps: 94.0,
                time: Duration::new(60 * 60 + 23 * 60 + 12, 340_000_000),
            })
        );
    }

    #[test]
    fn parse_ffmpeg_progress_na_time() {
        let out = "frame=    0 fps=0.0 q=0.0 size=N/A time=N/A bitrate=N/A speed=N/A";
        assert_eq!(FfmpegProgress::try_parse(out), None);
    }

    #[test]
    fn chunks_split_lines() {
        let mut chunks = Chunks::default();
        chunks.push(b"first line\nframe=  1 fps=0.0 time=00:00:00.04\r");
        chunks.push(b"frame=  2 fps=0.0 time=00:00:00.08\r\n");
        assert_eq!(chunks.last_line(), "frame=  2 fps=0.0 time=00:00:00.08");
        assert_eq!(
            chunks.rfind_line_map(|l| l.strip_prefix("first ").map(str::to_owned)),
            Some("line".to_owned())
        );
        assert!(chunks.tail(1).starts_with("frame=  2"));
    }

    #[test]
    fn chunks_bounded() {
        let mut chunks = Chunks::default();
        for n in 0..20_000 {
            chunks.push(format!("line {n}\n").as_bytes());
        }
        assert!(chunks.data.len() <= CHUNKS_MAX_BYTES);
        assert_eq!(chunks.last_line(), "line 19999");
    }

    #[test]
    fn cmd_str_escapes() {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg2("-i", "my video.mp4");
        assert_eq!(cmd.to_cmd_str(), "ffmpeg -i 'my video.mp4'");
    }
}
