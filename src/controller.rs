//! Runs (pairing, mode) items with per-item failure isolation.
use crate::{
    device::DeviceChoice,
    matcher::ReferencePairing,
    registry::{Kind, Registry, UnknownMode},
    result::{self, MetricResult},
    scorer::{ScoreError, ScorerAdapter},
};
use anyhow::{Context, anyhow, ensure};
use futures_util::{StreamExt, stream};
use log::debug;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Where results are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// One json line per result.
    Stdout,
    /// Next to each distorted file.
    Alongside,
    Dir(PathBuf),
}

impl OutputTarget {
    pub fn path(&self, pairing: &ReferencePairing, mode: &str) -> Option<PathBuf> {
        let name = result::file_name(&pairing.distorted.base_name, mode);
        match self {
            Self::Stdout => None,
            Self::Alongside => Some(
                pairing
                    .distorted
                    .path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(name),
            ),
            Self::Dir(dir) => Some(dir.join(name)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output: OutputTarget,
    /// Max pairings processed concurrently.
    pub jobs: usize,
    pub timeout: Option<Duration>,
    /// Don't rerun items with an existing valid result file.
    pub skip_existing: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output: OutputTarget::Stdout,
            jobs: 1,
            timeout: None,
            skip_existing: false,
        }
    }
}

#[derive(Debug)]
pub enum Written {
    File(PathBuf),
    Stdout,
    /// Existing result kept.
    Skipped(PathBuf),
}

#[derive(Debug)]
pub struct Completed {
    pub written: Written,
    /// `None` if skipped.
    pub result: Option<MetricResult>,
}

#[derive(Debug)]
pub struct ItemOutcome {
    pub distorted: PathBuf,
    pub mode: &'static str,
    pub status: Result<Completed, ScoreError>,
}

#[derive(Debug)]
pub struct Failure {
    /// `None` for failures not tied to an input, e.g. unknown modes.
    pub distorted: Option<PathBuf>,
    pub mode: String,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<Failure>,
    pub lossless: usize,
    pub lossless_checked: usize,
    pub properties_matched: usize,
    pub properties_checked: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome.status {
            Ok(Completed { written, result }) => {
                self.succeeded += 1;
                if matches!(written, Written::Skipped(_)) {
                    self.skipped += 1;
                }
                if let Some(r) = result {
                    if let Some(lossless) = r.lossless_match {
                        self.lossless_checked += 1;
                        self.lossless += usize::from(lossless);
                    }
                    if let Some(matched) = r.properties_match {
                        self.properties_checked += 1;
                        self.properties_matched += usize::from(matched);
                    }
                }
            }
            Err(err) => self.failures.push(Failure {
                distorted: Some(outcome.distorted),
                mode: outcome.mode.to_owned(),
                kind: err.kind(),
                reason: err.to_string(),
            }),
        }
    }

    /// Record requested modes that were dropped as unknown.
    pub fn record_unknown(&mut self, unknown: impl IntoIterator<Item = UnknownMode>) {
        for UnknownMode(mode) in unknown {
            let err = ScoreError::UnknownMode(mode.clone());
            self.failures.push(Failure {
                distorted: None,
                mode,
                kind: err.kind(),
                reason: err.to_string(),
            });
        }
    }
}

/// Fails if two items would write the same result file.
pub fn ensure_distinct_outputs(
    pairings: &[ReferencePairing],
    modes: &[&'static str],
    output: &OutputTarget,
) -> anyhow::Result<()> {
    let mut seen = HashMap::new();
    for pairing in pairings {
        for mode in modes {
            let Some(path) = output.path(pairing, mode) else {
                continue;
            };
            if let Some(other) = seen.insert(path.clone(), &pairing.distorted.path) {
                return Err(anyhow!(
                    "{} and {} would both write {}",
                    other.display(),
                    pairing.distorted.path.display(),
                    path.display()
                ));
            }
        }
    }
    Ok(())
}

/// Score every pairing with every mode.
///
/// Pairings run concurrently up to `config.jobs`, a pairing's modes run sequentially in
/// the requested order. Each outcome is passed to `on_item` as it completes.
pub async fn run(
    adapter: &ScorerAdapter<'_>,
    pairings: &[ReferencePairing],
    modes: &[&'static str],
    device: &DeviceChoice,
    config: &RunConfig,
    on_item: &dyn Fn(&ItemOutcome),
) -> RunSummary {
    let mut outcomes = stream::iter(pairings)
        .map(|pairing| run_pairing(adapter, pairing, modes, device, config, on_item))
        .buffer_unordered(config.jobs.max(1));

    let mut summary = RunSummary::default();
    while let Some(pairing_outcomes) = outcomes.next().await {
        for outcome in pairing_outcomes {
            summary.record(outcome);
        }
    }
    summary
}

async fn run_pairing(
    adapter: &ScorerAdapter<'_>,
    pairing: &ReferencePairing,
    modes: &[&'static str],
    device: &DeviceChoice,
    config: &RunConfig,
    on_item: &dyn Fn(&ItemOutcome),
) -> Vec<ItemOutcome> {
    let mut outcomes = Vec::with_capacity(modes.len());
    for &mode in modes {
        let status = run_item(adapter, pairing, mode, device, config).await;
        let outcome = ItemOutcome {
            distorted: pairing.distorted.path.clone(),
            mode,
            status,
        };
        on_item(&outcome);
        outcomes.push(outcome);
    }
    outcomes
}

async fn run_item(
    adapter: &ScorerAdapter<'_>,
    pairing: &ReferencePairing,
    mode: &'static str,
    device: &DeviceChoice,
    config: &RunConfig,
) -> Result<Completed, ScoreError> {
    let path = config.output.path(pairing, mode);
    if config.skip_existing {
        if let Some(path) = &path {
            if MetricResult::read(path).await.is_ok() {
                debug!("{} exists, skipping", path.display());
                return Ok(Completed {
                    written: Written::Skipped(path.clone()),
                    result: None,
                });
            }
        }
    }

    // no-reference modes never see a reference, even if one was matched
    let no_reference;
    let pairing = match adapter.registry().describe(mode).map(|d| d.kind) {
        Ok(Kind::Nr) if pairing.reference.is_some() => {
            no_reference = pairing.without_reference();
            &no_reference
        }
        _ => pairing,
    };

    let score = adapter.score(pairing, mode, device);
    let result = match config.timeout {
        Some(limit) => tokio::time::timeout(limit, score).await.map_err(|_| {
            ScoreError::Computation(anyhow!(
                "timed out after {}",
                humantime::format_duration(limit)
            ))
        })??,
        None => score.await?,
    };

    let written = match path {
        Some(path) => {
            result
                .write(&path)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            Written::File(path)
        }
        None => {
            let line = serde_json::to_string(&result).context("serializing result")?;
            println!("{line}");
            Written::Stdout
        }
    };
    Ok(Completed {
        written,
        result: Some(result),
    })
}

/// Requested modes split into known, deduplicated in request order, and unknown.
/// Fails if no known mode remains.
pub fn known_modes(
    registry: &Registry,
    requested: &[String],
) -> anyhow::Result<(Vec<&'static str>, Vec<UnknownMode>)> {
    let mut modes = Vec::with_capacity(requested.len());
    let mut unknown = vec![];
    for mode in requested {
        match registry.describe(mode) {
            Ok(d) if !modes.contains(&d.mode) => modes.push(d.mode),
            Ok(_) => {}
            Err(err) => unknown.push(err),
        }
    }
    ensure!(!modes.is_empty(), "no valid mode remaining");
    Ok((modes, unknown))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        matcher::VideoAsset,
        provision::{Provision, Provisioner},
        registry::{MetricDescriptor, Output},
        result::{Score, Scores},
        scorer::{Job, Normalized, Scorer},
    };
    use futures_util::{FutureExt, future::LocalBoxFuture};
    use std::{
        cell::RefCell,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    /// Fails for distorted files named "clip_002", otherwise scores 1.0
    #[derive(Debug, Default)]
    struct FailsSecond {
        calls: AtomicUsize,
    }

    impl Scorer for FailsSecond {
        fn score<'a>(
            &'a self,
            job: &'a Job<'a>,
        ) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if job.distorted.base_name == "clip_002" {
                    return Err(ScoreError::Computation(anyhow!("decode error")));
                }
                let mut out = Normalized::from(Scores::from([(
                    "psnr".to_owned(),
                    Score::Value(1.0),
                )]));
                out.lossless_match = Some(job.reference.is_some());
                Ok(out)
            }
            .boxed_local()
        }
    }

    #[derive(Debug)]
    struct Slow;

    impl Scorer for Slow {
        fn score<'a>(&'a self, _: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Normalized::default())
            }
            .boxed_local()
        }
    }

    fn descriptor(mode: &'static str, kind: Kind, scorer: &'static dyn Scorer) -> MetricDescriptor {
        MetricDescriptor {
            mode,
            kind,
            output: Output::Scalar,
            accelerated: false,
            unsupported: &[],
            provision: Provision::None,
            scorer,
        }
    }

    fn pairings(dir: &Path, names: &[&str]) -> Vec<ReferencePairing> {
        names
            .iter()
            .map(|name| ReferencePairing {
                distorted: Arc::new(VideoAsset::new(
                    dir.join(format!("{name}.mp4")),
                    (*name).to_owned(),
                )),
                reference: Some(Arc::new(VideoAsset::new(
                    dir.join(format!("{name}_ref.mp4")),
                    format!("{name}_ref"),
                ))),
            })
            .collect()
    }

    fn adapter<'r>(registry: &'r Registry, dir: &Path) -> ScorerAdapter<'r> {
        let provisioner = Provisioner::new(dir.join("toolkit"), true);
        ScorerAdapter::new(registry, provisioner, dir.to_path_buf())
    }

    #[tokio::test]
    async fn failed_item_does_not_stop_batch() {
        let scorer: &'static FailsSecond = Box::leak(Box::new(FailsSecond::default()));
        let registry = Registry::from_descriptors([descriptor("fake", Kind::Fr, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let config = RunConfig {
            output: OutputTarget::Dir(out_dir.clone()),
            ..<_>::default()
        };
        let seen = RefCell::new(vec![]);

        let summary = run(
            &adapter(&registry, dir.path()),
            &pairings(dir.path(), &["clip_001", "clip_002", "clip_003"]),
            &["fake"],
            &DeviceChoice::cpu(),
            &config,
            &|outcome| seen.borrow_mut().push(outcome.status.is_ok()),
        )
        .await;

        assert_eq!(scorer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.borrow(), [true, false, true]);
        assert!(out_dir.join("clip_001.fake.json").exists());
        assert!(!out_dir.join("clip_002.fake.json").exists());
        assert!(out_dir.join("clip_003.fake.json").exists());

        assert!(!summary.is_success());
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, "computation");
        assert_eq!(summary.lossless, 2);
    }

    #[tokio::test]
    async fn no_reference_modes_drop_reference() {
        let scorer: &'static FailsSecond = Box::leak(Box::new(FailsSecond::default()));
        let registry = Registry::from_descriptors([descriptor("fake-nr", Kind::Nr, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output: OutputTarget::Alongside,
            ..<_>::default()
        };

        let summary = run(
            &adapter(&registry, dir.path()),
            &pairings(dir.path(), &["clip_001"]),
            &["fake-nr"],
            &DeviceChoice::cpu(),
            &config,
            &|_| {},
        )
        .await;
        assert!(summary.is_success());
        assert_eq!(summary.lossless_checked, 1);
        assert_eq!(summary.lossless, 0);

        let written = MetricResult::read(&dir.path().join("clip_001.fake-nr.json"))
            .await
            .unwrap();
        assert_eq!(written.reference, None);
    }

    #[tokio::test]
    async fn skip_existing_results() {
        let scorer: &'static FailsSecond = Box::leak(Box::new(FailsSecond::default()));
        let registry = Registry::from_descriptors([descriptor("fake", Kind::Fr, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output: OutputTarget::Dir(dir.path().join("out")),
            skip_existing: true,
            ..<_>::default()
        };
        let adapter = adapter(&registry, dir.path());
        let pairings = pairings(dir.path(), &["clip_001"]);

        for _ in 0..2 {
            let summary = run(&adapter, &pairings, &["fake"], &DeviceChoice::cpu(), &config, &|_| {})
                .await;
            assert!(summary.is_success());
        }
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_computation_error() {
        let registry = Registry::from_descriptors([descriptor("slow", Kind::Fr, &Slow)]);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output: OutputTarget::Dir(dir.path().join("out")),
            timeout: Some(Duration::from_secs(1)),
            ..<_>::default()
        };

        let summary = run(
            &adapter(&registry, dir.path()),
            &pairings(dir.path(), &["clip_001"]),
            &["slow"],
            &DeviceChoice::cpu(),
            &config,
            &|_| {},
        )
        .await;
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, "computation");
        assert!(summary.failures[0].reason.contains("timed out"));
    }

    #[test]
    fn duplicate_outputs_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut all = pairings(dir.path(), &["clip_001"]);
        all.extend(pairings(&dir.path().join("sub"), &["clip_001"]));

        let out = OutputTarget::Dir(dir.path().join("out"));
        assert!(ensure_distinct_outputs(&all, &["psnr"], &out).is_err());
        assert!(ensure_distinct_outputs(&all, &["psnr"], &OutputTarget::Alongside).is_ok());
    }

    #[test]
    fn unknown_modes_dropped() {
        let registry = Registry::from_descriptors([descriptor("slow", Kind::Fr, &Slow)]);
        let requested = ["slow".to_owned(), "nope".to_owned(), "slow".to_owned()];
        let (modes, unknown) = known_modes(&registry, &requested).unwrap();
        assert_eq!(modes, ["slow"]);
        assert_eq!(unknown, [UnknownMode("nope".into())]);

        assert!(known_modes(&registry, &["nope".to_owned()]).is_err());
    }

    #[tokio::test]
    async fn unknown_modes_fail_the_run() {
        let scorer: &'static FailsSecond = Box::leak(Box::new(FailsSecond::default()));
        let registry = Registry::from_descriptors([descriptor("psnr", Kind::Fr, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let requested = ["psnr".to_owned(), "vmaff".to_owned()];
        let (modes, unknown) = known_modes(&registry, &requested).unwrap();

        let mut summary = run(
            &adapter(&registry, dir.path()),
            &pairings(dir.path(), &["clip_001"]),
            &modes,
            &DeviceChoice::cpu(),
            &RunConfig::default(),
            &|_| {},
        )
        .await;
        assert!(summary.is_success());

        summary.record_unknown(unknown);
        assert!(!summary.is_success());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, "unknown mode");
        assert_eq!(summary.failures[0].mode, "vmaff");
        assert_eq!(summary.failures[0].distorted, None);
    }

    /// Psnr shaped output: a `psnr` mean, per-frame values & a lossless flag.
    #[derive(Debug)]
    struct FakePsnr;

    impl Scorer for FakePsnr {
        fn score<'a>(
            &'a self,
            job: &'a Job<'a>,
        ) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
            async move {
                job.reference()?;
                let mut out = Normalized::from(Scores::from([
                    ("psnr".to_owned(), Score::Value(41.5)),
                    ("psnr_frames".to_owned(), Score::Series(vec![41.0, 42.0])),
                ]));
                out.lossless_match = Some(false);
                Ok(out)
            }
            .boxed_local()
        }
    }

    #[tokio::test]
    async fn psnr_batch_writes_a_result_per_clip() {
        let registry = Registry::from_descriptors([descriptor("psnr", Kind::Fr, &FakePsnr)]);
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("results");
        let config = RunConfig {
            output: OutputTarget::Dir(out_dir.clone()),
            ..<_>::default()
        };

        let summary = run(
            &adapter(&registry, dir.path()),
            &pairings(dir.path(), &["clip_001", "clip_002"]),
            &["psnr"],
            &DeviceChoice::cpu(),
            &config,
            &|_| {},
        )
        .await;
        assert!(summary.is_success());
        assert_eq!(summary.lossless_checked, 2);

        for clip in ["clip_001", "clip_002"] {
            let data = std::fs::read(out_dir.join(format!("{clip}.psnr.json"))).unwrap();
            let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
            assert_eq!(json["method"], "psnr");
            assert!(json["scores"]["psnr"].is_number());
            assert!(json["lossless_match"].is_boolean());
            assert!(
                json["reference"]
                    .as_str()
                    .unwrap()
                    .ends_with(&format!("{clip}_ref.mp4"))
            );
        }
    }
}
