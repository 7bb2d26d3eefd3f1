//! ffprobe logic
use anyhow::{Context, anyhow};
use std::{fmt, path::Path, time::Duration};

/// Container metadata of a video input.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    /// Duration of video.
    pub duration: Result<Duration, ProbeError>,
    /// Video frame rate.
    pub fps: Result<f64, ProbeError>,
    pub resolution: Option<(u32, u32)>,
    /// Frame count as reported by the container, if any.
    pub nb_frames: Option<u64>,
}

impl Ffprobe {
    /// Nothing known, every lookup reports `reason`.
    pub fn unavailable(reason: String) -> Self {
        Self {
            duration: Err(ProbeError(reason.clone())),
            fps: Err(ProbeError(reason)),
            resolution: None,
            nb_frames: None,
        }
    }

    /// Frame count, from the container or estimated with `duration * fps`.
    pub fn frame_count(&self) -> Option<u64> {
        self.nb_frames.or_else(|| {
            let duration = self.duration.as_ref().ok()?;
            let fps = self.fps.as_ref().ok()?;
            Some((duration.as_secs_f64() * fps).round() as u64)
        })
    }
}

/// Try to ffprobe the given input.
pub fn probe(input: &Path) -> Ffprobe {
    let probe = match ffprobe::ffprobe(input) {
        Ok(p) => p,
        Err(err) => return Ffprobe::unavailable(format!("ffprobe: {err}")),
    };

    let fps = read_fps(&probe);
    let duration = read_duration(&probe);

    let vstream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let resolution = vstream.and_then(|s| {
        let w = s.width.and_then(|w| u32::try_from(w).ok())?;
        let h = s.height.and_then(|h| u32::try_from(h).ok())?;
        Some((w, h))
    });
    let nb_frames = vstream
        .and_then(|s| s.nb_frames.as_deref())
        .and_then(|n| n.parse().ok());

    Ffprobe {
        duration: duration.map_err(ProbeError::from),
        fps: fps.map_err(ProbeError::from),
        resolution,
        nb_frames,
    }
}

fn read_duration(probe: &ffprobe::FfProbe) -> anyhow::Result<Duration> {
    match probe.format.duration.as_deref() {
        Some(duration_s) => {
            let duration_f = duration_s
                .parse::<f64>()
                .with_context(|| format!("invalid ffprobe video duration: {duration_s:?}"))?;
            Duration::try_from_secs_f64(duration_f)
                .map_err(|e| anyhow!("{e}: ffprobe video duration: {duration_s:?}"))
        }
        None => Ok(Duration::ZERO),
    }
}

fn read_fps(probe: &ffprobe::FfProbe) -> anyhow::Result<f64> {
    let vstream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .context("no video stream found")?;

    parse_frame_rate(&vstream.avg_frame_rate)
        .or_else(|| parse_frame_rate(&vstream.r_frame_rate))
        .context("invalid ffprobe video frame rate")
}

/// parse "x/y" or float strings.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    if let Some((x, y)) = rate.split_once('/') {
        let x: f64 = x.parse().ok()?;
        let y: f64 = y.parse().ok()?;
        if x <= 0.0 || y <= 0.0 {
            return None;
        }
        Some(x / y)
    } else {
        rate.parse()
            .ok()
            .filter(|f: &f64| f.is_finite() && *f > 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError(String);

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<anyhow::Error> for ProbeError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err}"))
    }
}

impl std::error::Error for ProbeError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_rates() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.001);
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("N/A"), None);
    }

    #[test]
    fn estimated_frame_count() {
        let probe = Ffprobe {
            duration: Ok(Duration::from_secs(10)),
            fps: Ok(24.0),
            resolution: Some((1920, 1080)),
            nb_frames: None,
        };
        assert_eq!(probe.frame_count(), Some(240));

        let probe = Ffprobe {
            nb_frames: Some(239),
            ..probe
        };
        assert_eq!(probe.frame_count(), Some(239));
    }
}
