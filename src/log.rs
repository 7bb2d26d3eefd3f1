use indicatif::HumanDuration;
use log::{Level, info, log_enabled};
use std::{
    io::IsTerminal,
    time::{Duration, Instant},
};

/// Struct that info logs progress messages on a stream action like a metric run.
///
/// Only logs when stderr is not a terminal, interactive runs show a progress bar instead.
#[derive(Debug)]
pub struct ProgressLogger {
    target: &'static str,
    start: Instant,
    log_count: u32,
    enabled: bool,
}

impl ProgressLogger {
    pub fn new(target: &'static str, start: Instant) -> Self {
        Self {
            target,
            start,
            log_count: 0,
            enabled: !std::io::stderr().is_terminal(),
        }
    }

    /// Update and potentially log progress on a stream action.
    /// * `total` total duration of the stream
    /// * `complete` the duration that has been completed at this time
    /// * `fps` frames per second
    pub fn update(&mut self, total: Duration, completed: Duration, fps: f32) {
        if self.enabled && log_enabled!(Level::Info) && completed > Duration::ZERO {
            let done = (completed.as_secs_f64() / total.as_secs_f64()).min(1.0);

            let elapsed = self.start.elapsed();
            if !self.should_log(elapsed) {
                return;
            }

            let eta = Duration::from_secs_f64(elapsed.as_secs_f64() / done).saturating_sub(elapsed);
            info!(
                target: self.target,
                "{:.0}%, {fps} fps, eta {}",
                done * 100.0,
                HumanDuration(eta)
            );
        }
    }

    fn should_log(&mut self, elapsed: Duration) -> bool {
        let before_count = self.log_count;
        while elapsed > self.next_log() {
            self.log_count += 1;
        }
        before_count != self.log_count
    }

    /// First log after >=16s, then >=32s etc
    fn next_log(&self) -> Duration {
        Duration::from_secs(2_u64.pow(self.log_count + 4))
    }
}

#[test]
fn exponential_log_interval() {
    let mut logger = ProgressLogger::new("test", Instant::now());
    assert!(!logger.should_log(Duration::from_secs(10)));
    // 40s elapsed passes both the 16s & 32s marks
    assert!(logger.should_log(Duration::from_secs(40)));
    assert_eq!(logger.log_count, 2);
    assert!(!logger.should_log(Duration::from_secs(41)));
}
