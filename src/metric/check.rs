//! Container property comparison.
use crate::{
    ffprobe::Ffprobe,
    result::{Score, Scores},
    scorer::{Job, Normalized, ScoreError, Scorer},
};
use anyhow::Context;
use futures_util::{FutureExt, future::LocalBoxFuture};

const FPS_TOLERANCE: f64 = 0.001;

pub static CHECK: Check = Check;

/// Compares resolution, frame count & frame rate of distorted & reference.
#[derive(Debug)]
pub struct Check;

impl Scorer for Check {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let reference = job.reference()?;
            Ok(compare(job.distorted.info().await, reference.info().await)?)
        }
        .boxed_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Properties {
    width: u32,
    height: u32,
    frames: u64,
    fps: f64,
}

impl Properties {
    fn of(info: &Ffprobe) -> anyhow::Result<Self> {
        let (width, height) = info.resolution.context("no video resolution")?;
        let fps = info.fps.clone()?;
        let frames = info.frame_count().context("no video frame count")?;
        Ok(Self {
            width,
            height,
            frames,
            fps,
        })
    }
}

fn compare(distorted: &Ffprobe, reference: &Ffprobe) -> anyhow::Result<Normalized> {
    let dist = Properties::of(distorted).context("distorted")?;
    let refr = Properties::of(reference).context("reference")?;

    let fps_delta = dist.fps - refr.fps;
    let properties_match = dist.width == refr.width
        && dist.height == refr.height
        && dist.frames == refr.frames
        && fps_delta.abs() <= FPS_TOLERANCE;

    let delta = |a: f64, b: f64| Score::Value(a - b);
    let scores = Scores::from([
        ("width_delta".to_owned(), delta(dist.width.into(), refr.width.into())),
        ("height_delta".to_owned(), delta(dist.height.into(), refr.height.into())),
        ("frame_count_delta".to_owned(), delta(dist.frames as f64, refr.frames as f64)),
        ("fps_delta".to_owned(), Score::Value(fps_delta)),
    ]);
    Ok(Normalized {
        scores,
        lossless_match: None,
        properties_match: Some(properties_match),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn probe(resolution: (u32, u32), nb_frames: u64, fps: f64) -> Ffprobe {
        Ffprobe {
            duration: Ok(Duration::from_secs(10)),
            fps: Ok(fps),
            resolution: Some(resolution),
            nb_frames: Some(nb_frames),
        }
    }

    #[test]
    fn matching_properties() {
        let out = compare(
            &probe((1920, 1080), 250, 25.0),
            &probe((1920, 1080), 250, 25.0005),
        )
        .unwrap();
        assert_eq!(out.properties_match, Some(true));
        assert_eq!(out.scores["width_delta"], Score::Value(0.0));
    }

    #[test]
    fn mismatched_properties() {
        let out = compare(
            &probe((1280, 720), 249, 25.0),
            &probe((1920, 1080), 250, 25.0),
        )
        .unwrap();
        assert_eq!(out.properties_match, Some(false));
        assert_eq!(out.scores["width_delta"], Score::Value(-640.0));
        assert_eq!(out.scores["height_delta"], Score::Value(-360.0));
        assert_eq!(out.scores["frame_count_delta"], Score::Value(-1.0));
    }

    #[test]
    fn unprobeable_is_error() {
        let broken = Ffprobe {
            resolution: None,
            ..probe((0, 0), 0, 25.0)
        };
        assert!(compare(&broken, &probe((1920, 1080), 250, 25.0)).is_err());
    }
}
