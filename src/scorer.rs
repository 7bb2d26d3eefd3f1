//! Uniform scoring contract over heterogeneous metric implementations.
use crate::{
    device::{Backend, DeviceChoice},
    matcher::{ReferencePairing, VideoAsset},
    metric::ffmpeg::VmafFilters,
    provision::Provisioner,
    registry::{Kind, MetricDescriptor, Registry, UnknownMode},
    result::{MetricResult, Score, Scores},
};
use futures_util::future::LocalBoxFuture;
use log::{debug, warn};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Per-item scoring failure. None of these abort a batch.
#[derive(Debug)]
pub enum ScoreError {
    UnknownMode(String),
    /// Mode kind does not fit the pairing, e.g. full-reference without a reference.
    InvalidPairing(String),
    Provisioning {
        mode: String,
        source: anyhow::Error,
    },
    /// The selected backend cannot run the metric.
    BackendUnavailable {
        backend: Backend,
        reason: String,
    },
    /// Native scorer failure, including timeouts.
    Computation(anyhow::Error),
}

impl ScoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownMode(_) => "unknown mode",
            Self::InvalidPairing(_) => "invalid pairing",
            Self::Provisioning { .. } => "provisioning",
            Self::BackendUnavailable { .. } => "backend unavailable",
            Self::Computation(_) => "computation",
        }
    }

    pub fn ensure_computation(condition: bool, reason: impl fmt::Display) -> Result<(), Self> {
        if !condition {
            return Err(Self::Computation(anyhow::anyhow!("{reason}")));
        }
        Ok(())
    }
}

impl From<anyhow::Error> for ScoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Computation(err)
    }
}

impl From<UnknownMode> for ScoreError {
    fn from(UnknownMode(mode): UnknownMode) -> Self {
        Self::UnknownMode(mode)
    }
}

impl fmt::Display for ScoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMode(mode) => write!(f, "unknown mode `{mode}`"),
            Self::InvalidPairing(reason) => reason.fmt(f),
            Self::Provisioning { mode, source } => write!(f, "{mode} provisioning failed: {source}"),
            Self::BackendUnavailable { backend, reason } => {
                write!(f, "{backend} unavailable: {reason}")
            }
            Self::Computation(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ScoreError {}

/// A single metric execution.
#[derive(Debug)]
pub struct Job<'a> {
    pub mode: &'static str,
    pub distorted: &'a VideoAsset,
    pub reference: Option<&'a VideoAsset>,
    pub device: Backend,
    /// Frames per second to sample, `None` means every frame.
    pub sample_fps: Option<f32>,
    pub vmaf: VmafFilters,
    pub toolkit: &'a Path,
    /// Scratch dir for intermediate files.
    pub temp_dir: &'a Path,
}

impl<'a> Job<'a> {
    pub fn reference(&self) -> Result<&'a VideoAsset, ScoreError> {
        self.reference
            .ok_or_else(|| ScoreError::InvalidPairing(format!("{} requires a reference", self.mode)))
    }

    /// Unique scratch file path for this job.
    pub fn temp_file(&self, ext: &str) -> PathBuf {
        self.temp_dir
            .join(format!("{}.{}.{ext}", self.mode, fastrand::u32(..)))
    }
}

/// Scorer output translated into result schema terms.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Normalized {
    pub scores: Scores,
    pub lossless_match: Option<bool>,
    pub properties_match: Option<bool>,
}

impl From<Scores> for Normalized {
    fn from(scores: Scores) -> Self {
        Self {
            scores,
            ..<_>::default()
        }
    }
}

/// A native metric implementation.
pub trait Scorer: fmt::Debug + Send + Sync {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>>;
}

/// Mean of a per-frame series.
pub fn mean(values: &[f64]) -> Option<f64> {
    match values.len() {
        0 => None,
        n => Some(values.iter().sum::<f64>() / n as f64),
    }
}

/// Runs modes against pairings through their registered scorers.
pub struct ScorerAdapter<'r> {
    registry: &'r Registry,
    provisioner: Provisioner,
    temp_dir: PathBuf,
    sample_fps: Option<f32>,
    vmaf: VmafFilters,
}

impl<'r> ScorerAdapter<'r> {
    pub fn new(registry: &'r Registry, provisioner: Provisioner, temp_dir: PathBuf) -> Self {
        Self {
            registry,
            provisioner,
            temp_dir,
            sample_fps: None,
            vmaf: VmafFilters::default(),
        }
    }

    /// Override per-frame sampling rates of all modes.
    pub fn with_sample_fps(mut self, sample_fps: Option<f32>) -> Self {
        self.sample_fps = sample_fps;
        self
    }

    pub fn with_vmaf_filters(mut self, vmaf: VmafFilters) -> Self {
        self.vmaf = vmaf;
        self
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub async fn score(
        &self,
        pairing: &ReferencePairing,
        mode: &str,
        device: &DeviceChoice,
    ) -> Result<MetricResult, ScoreError> {
        let descriptor = self.registry.describe(mode)?;
        validate_pairing(descriptor, pairing)?;

        self.provisioner
            .ensure_ready(descriptor.mode, &descriptor.provision)
            .await?;

        let device = match descriptor.accelerated {
            true => device.narrowed(descriptor.unsupported).preferred(),
            false => Backend::Cpu,
        };
        let mut job = Job {
            mode: descriptor.mode,
            distorted: &pairing.distorted,
            reference: pairing.reference.as_deref(),
            device,
            sample_fps: descriptor.output.sample_fps(self.sample_fps),
            vmaf: self.vmaf,
            toolkit: self.provisioner.toolkit(),
            temp_dir: &self.temp_dir,
        };
        debug!(
            "{} {} on {device}",
            descriptor.mode,
            pairing.distorted.path.display()
        );

        let first = descriptor.scorer.score(&job).await;
        let out = match first {
            Err(ScoreError::BackendUnavailable { backend, reason }) if backend != Backend::Cpu => {
                warn!("{}: {backend} unavailable ({reason}), retrying on cpu", descriptor.mode);
                job.device = Backend::Cpu;
                descriptor.scorer.score(&job).await?
            }
            other => other?,
        };
        ensure_finite(&out.scores)?;

        Ok(MetricResult {
            method: descriptor.mode.into(),
            distorted: pairing.distorted.path.clone(),
            reference: job.reference.map(|r| r.path.clone()),
            scores: out.scores,
            lossless_match: out.lossless_match,
            properties_match: out.properties_match,
            sample_fps: job.sample_fps,
            device: descriptor.accelerated.then_some(job.device),
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        })
    }
}

fn validate_pairing(
    descriptor: &MetricDescriptor,
    pairing: &ReferencePairing,
) -> Result<(), ScoreError> {
    match (descriptor.kind, &pairing.reference) {
        (Kind::Fr, None) => Err(ScoreError::InvalidPairing(format!(
            "{} requires a reference, none found for {}",
            descriptor.mode,
            pairing.distorted.path.display()
        ))),
        (Kind::Nr, Some(reference)) => Err(ScoreError::InvalidPairing(format!(
            "{} is no-reference, got reference {}",
            descriptor.mode,
            reference.path.display()
        ))),
        _ => Ok(()),
    }
}

fn ensure_finite(scores: &Scores) -> Result<(), ScoreError> {
    for (name, score) in scores {
        let finite = match score {
            Score::Value(v) => v.is_finite(),
            Score::Series(vs) => vs.iter().all(|v| v.is_finite()),
        };
        ScoreError::ensure_computation(finite, format_args!("non-finite `{name}` score"))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        device::Backend,
        provision::{Provision, Provisioner},
        registry::{MetricDescriptor, Output},
    };
    use futures_util::FutureExt;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Fails with `BackendUnavailable` on anything but cpu.
    #[derive(Debug, Default)]
    struct CpuOnly {
        calls: AtomicUsize,
    }

    impl Scorer for CpuOnly {
        fn score<'a>(
            &'a self,
            job: &'a Job<'a>,
        ) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if job.device != Backend::Cpu {
                    return Err(ScoreError::BackendUnavailable {
                        backend: job.device,
                        reason: "out of memory".into(),
                    });
                }
                Ok(Scores::from([("score".to_owned(), Score::Value(4.2))]).into())
            }
            .boxed_local()
        }
    }

    #[derive(Debug)]
    struct Fixed(f64);

    impl Scorer for Fixed {
        fn score<'a>(&'a self, _: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
            let v = self.0;
            async move { Ok(Scores::from([("psnr".to_owned(), Score::Value(v))]).into()) }
                .boxed_local()
        }
    }

    fn descriptor(
        mode: &'static str,
        kind: Kind,
        accelerated: bool,
        scorer: &'static dyn Scorer,
    ) -> MetricDescriptor {
        MetricDescriptor {
            mode,
            kind,
            output: Output::Scalar,
            accelerated,
            unsupported: &[],
            provision: Provision::None,
            scorer,
        }
    }

    fn adapter<'a>(registry: &'a Registry, dir: &Path) -> ScorerAdapter<'a> {
        let provisioner = Provisioner::new(dir.join("toolkit"), true);
        ScorerAdapter::new(registry, provisioner, dir.to_path_buf())
    }

    fn pairing(reference: bool) -> ReferencePairing {
        ReferencePairing {
            distorted: Arc::new(VideoAsset::new("/videos/clip_001.mp4".into(), "clip_001".into())),
            reference: reference.then(|| {
                Arc::new(VideoAsset::new(
                    "/refs/clip_001_ref.mp4".into(),
                    "clip_001_ref".into(),
                ))
            }),
        }
    }

    #[tokio::test]
    async fn full_reference_without_reference_never_scores() {
        let scorer: &'static CpuOnly = Box::leak(Box::new(CpuOnly::default()));
        let registry = Registry::from_descriptors([descriptor("fake-fr", Kind::Fr, false, scorer)]);
        let dir = tempfile::tempdir().unwrap();

        let err = adapter(&registry, dir.path())
            .score(&pairing(false), "fake-fr", &DeviceChoice::cpu())
            .await
            .unwrap_err();
        assert!(matches!(err, ScoreError::InvalidPairing(_)), "{err}");
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_mode() {
        let registry = Registry::from_descriptors([]);
        let dir = tempfile::tempdir().unwrap();
        let err = adapter(&registry, dir.path())
            .score(&pairing(true), "nope", &DeviceChoice::cpu())
            .await
            .unwrap_err();
        assert!(matches!(err, ScoreError::UnknownMode(m) if m == "nope"));
    }

    #[tokio::test]
    async fn backend_unavailable_retries_on_cpu() {
        let scorer: &'static CpuOnly = Box::leak(Box::new(CpuOnly::default()));
        let registry = Registry::from_descriptors([descriptor("fake-nr", Kind::Nr, true, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let device = crate::device::resolve(&[Backend::Cuda], &AllUsable);

        let result = adapter(&registry, dir.path())
            .score(&pairing(false), "fake-nr", &device)
            .await
            .unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.device, Some(Backend::Cpu));
        assert_eq!(result.scores["score"], Score::Value(4.2));
        assert_eq!(result.reference, None);
    }

    #[tokio::test]
    async fn non_accelerated_runs_on_cpu() {
        let scorer: &'static CpuOnly = Box::leak(Box::new(CpuOnly::default()));
        let registry = Registry::from_descriptors([descriptor("fake-nr", Kind::Nr, false, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let device = crate::device::resolve(&[Backend::Cuda], &AllUsable);

        let result = adapter(&registry, dir.path())
            .score(&pairing(false), "fake-nr", &device)
            .await
            .unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.device, None);
    }

    #[tokio::test]
    async fn non_finite_score_is_computation_error() {
        let scorer: &'static Fixed = Box::leak(Box::new(Fixed(f64::INFINITY)));
        let registry = Registry::from_descriptors([descriptor("fake-fr", Kind::Fr, false, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let err = adapter(&registry, dir.path())
            .score(&pairing(true), "fake-fr", &DeviceChoice::cpu())
            .await
            .unwrap_err();
        assert!(matches!(err, ScoreError::Computation(_)), "{err}");
    }

    #[tokio::test]
    async fn result_identity() {
        let scorer: &'static Fixed = Box::leak(Box::new(Fixed(41.5)));
        let registry = Registry::from_descriptors([descriptor("fake-fr", Kind::Fr, false, scorer)]);
        let dir = tempfile::tempdir().unwrap();
        let result = adapter(&registry, dir.path())
            .score(&pairing(true), "fake-fr", &DeviceChoice::cpu())
            .await
            .unwrap();
        assert_eq!(result.method, "fake-fr");
        assert_eq!(result.distorted, Path::new("/videos/clip_001.mp4"));
        assert_eq!(
            result.reference.as_deref(),
            Some(Path::new("/refs/clip_001_ref.mp4"))
        );
        assert_eq!(result.scores["psnr"], Score::Value(41.5));
        assert!(result.timestamp.is_some());
    }

    struct AllUsable;

    impl crate::device::Probe for AllUsable {
        fn probe(&self, _: Backend) -> crate::device::Availability {
            crate::device::Availability::Usable
        }
    }
}
