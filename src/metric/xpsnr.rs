//! xpsnr logic
use super::ffmpeg_compare;
use crate::{
    process::cmd_err,
    result::{Score, Scores},
    scorer::{Job, Normalized, ScoreError, Scorer},
};
use futures_util::{FutureExt, future::LocalBoxFuture};

pub static XPSNR: Xpsnr = Xpsnr;

/// ffmpeg `xpsnr` filter, scored as the minimum of the component averages.
#[derive(Debug)]
pub struct Xpsnr;

impl Scorer for Xpsnr {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let reference = job.reference()?;
            let stderr = ffmpeg_compare(job, reference, "xpsnr", "ffmpeg xpsnr").await?;
            let score = stderr
                .rfind_line_map(score_from_line)
                .ok_or_else(|| cmd_err("could not parse ffmpeg xpsnr score", "ffmpeg xpsnr", &stderr))?;
            Ok(Scores::from([("xpsnr".to_owned(), Score::Value(score))]).into())
        }
        .boxed_local()
    }
}

// E.g. "[Parsed_xpsnr_0 @ 0x711494004cc0] XPSNR  y: 33.6547  u: 41.8741  v: 42.2571  (minimum: 33.6547)"
fn score_from_line(line: &str) -> Option<f64> {
    const MIN_PREFIX: &str = "minimum: ";

    if !line.contains("XPSNR") {
        return None;
    }

    let yidx = line.find(MIN_PREFIX)?;
    let tail = &line[yidx + MIN_PREFIX.len()..];
    let end_idx = tail
        .char_indices()
        .take_while(|(_, c)| *c == '.' || c.is_numeric())
        .last()?
        .0;
    tail[..=end_idx].parse().ok()
}
