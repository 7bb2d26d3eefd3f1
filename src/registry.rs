//! Static mode → metric mapping.
use crate::{
    device::Backend,
    metric::{check, ffmpeg, jpegxl, model, xpsnr},
    provision::{Provision, ToolCheck},
    scorer::Scorer,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::LazyLock,
};

/// Built-in metrics, read-only after first use.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::builtin);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Kind {
    /// Full-reference, compares distorted against a reference.
    Fr,
    /// No-reference, scores the distorted video alone.
    Nr,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fr => "FR".fmt(f),
            Self::Nr => "NR".fmt(f),
        }
    }
}

/// Output cardinality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Output {
    Scalar,
    /// Series of per-frame scores plus a summary, `sample_fps: None` scores every frame.
    PerFrame { sample_fps: Option<f32> },
    /// Multiple named scores.
    Multi,
}

impl Output {
    /// Effective sampling rate with an optional per-run override.
    pub fn sample_fps(&self, run_override: Option<f32>) -> Option<f32> {
        match self {
            Self::PerFrame { sample_fps } => run_override.or(*sample_fps),
            _ => None,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => "scalar".fmt(f),
            Self::PerFrame { .. } => "per-frame".fmt(f),
            Self::Multi => "multi".fmt(f),
        }
    }
}

#[derive(Debug)]
pub struct MetricDescriptor {
    pub mode: &'static str,
    pub kind: Kind,
    pub output: Output,
    /// Benefits from a gpu backend.
    pub accelerated: bool,
    /// Accelerators the metric cannot run on.
    pub unsupported: &'static [Backend],
    pub provision: Provision,
    pub scorer: &'static dyn Scorer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mode `{}`", self.0)
    }
}

impl std::error::Error for UnknownMode {}

#[derive(Debug)]
pub struct Registry {
    modes: BTreeMap<&'static str, MetricDescriptor>,
}

impl Registry {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = MetricDescriptor>) -> Self {
        Self {
            modes: descriptors.into_iter().map(|d| (d.mode, d)).collect(),
        }
    }

    pub fn describe(&self, mode: &str) -> Result<&MetricDescriptor, UnknownMode> {
        self.modes
            .get(mode)
            .ok_or_else(|| UnknownMode(mode.to_owned()))
    }

    pub fn modes_for_kind(&self, kind: Kind) -> BTreeSet<&'static str> {
        self.modes
            .values()
            .filter(|d| d.kind == kind)
            .map(|d| d.mode)
            .collect()
    }

    pub fn contains(&self, mode: &str) -> bool {
        self.modes.contains_key(mode)
    }

    /// All descriptors ordered by mode.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.modes.values()
    }

    fn builtin() -> Self {
        use Kind::*;
        use Output::*;

        Self::from_descriptors([
            native("check", Fr, Multi, FFPROBE, &check::CHECK),
            native("psnr", Fr, Multi, FFMPEG_PSNR, &ffmpeg::PSNR),
            native("xpsnr", Fr, Scalar, FFMPEG_XPSNR, &xpsnr::XPSNR),
            native("vmaf", Fr, Multi, FFMPEG_LIBVMAF, &ffmpeg::VMAF),
            native("vmaf4k", Fr, Multi, FFMPEG_LIBVMAF, &ffmpeg::VMAF_4K),
            native("vmaf-full", Fr, Multi, FFMPEG_LIBVMAF, &ffmpeg::VMAF_FULL),
            native("vmaf4k-full", Fr, Multi, FFMPEG_LIBVMAF, &ffmpeg::VMAF_4K_FULL),
            native(
                "ssimulacra2",
                Fr,
                PerFrame { sample_fps: Some(jpegxl::SAMPLE_FPS) },
                SSIMULACRA2,
                &jpegxl::SSIMULACRA2,
            ),
            native(
                "butteraugli",
                Fr,
                PerFrame { sample_fps: Some(jpegxl::SAMPLE_FPS) },
                BUTTERAUGLI,
                &jpegxl::BUTTERAUGLI,
            ),
            accelerated("lpips", Fr, PerFrame { sample_fps: None }, &model::LPIPS),
            accelerated("cvqa-fr", Fr, Scalar, &model::CVQA_FR),
            accelerated("cvqa-fr-ms", Fr, Scalar, &model::CVQA_FR_MS),
            accelerated("cvqa-nr", Nr, Scalar, &model::CVQA_NR),
            accelerated("cvqa-nr-ms", Nr, Scalar, &model::CVQA_NR_MS),
            accelerated("dover", Nr, Multi, &model::DOVER),
            MetricDescriptor {
                unsupported: &[Backend::Mps],
                ..accelerated("fastvqa", Nr, Scalar, &model::FASTVQA)
            },
            MetricDescriptor {
                unsupported: &[Backend::Mps],
                ..accelerated("fastervqa", Nr, Scalar, &model::FASTERVQA)
            },
            accelerated("musiq", Nr, PerFrame { sample_fps: None }, &model::MUSIQ),
            MetricDescriptor {
                unsupported: &[Backend::Mps],
                ..accelerated("cover", Nr, Multi, &model::COVER)
            },
            MetricDescriptor {
                accelerated: false,
                ..accelerated("uvq", Nr, Multi, &model::UVQ)
            },
            MetricDescriptor {
                accelerated: false,
                ..accelerated("maxvqa", Nr, Multi, &model::MAXVQA)
            },
            MetricDescriptor {
                unsupported: &[Backend::Mps],
                ..accelerated("qalign", Nr, Scalar, &model::QALIGN)
            },
            MetricDescriptor {
                unsupported: CUDA_ONLY,
                ..accelerated("cvvdp", Fr, Scalar, &model::CVVDP)
            },
            MetricDescriptor {
                unsupported: CUDA_ONLY,
                ..accelerated("cvvdp-fhd", Fr, Scalar, &model::CVVDP_FHD)
            },
            accelerated("mdtvsfa", Nr, Scalar, &model::MDTVSFA),
        ])
    }
}

const CUDA_ONLY: &[Backend] = &[Backend::Mps, Backend::Vulkan];

const FFPROBE: ToolCheck = ToolCheck {
    program: "ffprobe",
    args: &["-version"],
    expect: "ffprobe version",
};
const FFMPEG_PSNR: ToolCheck = ffmpeg_filter("psnr");
const FFMPEG_XPSNR: ToolCheck = ffmpeg_filter("xpsnr");
const FFMPEG_LIBVMAF: ToolCheck = ffmpeg_filter("libvmaf");
const SSIMULACRA2: ToolCheck = ToolCheck {
    program: "ssimulacra2",
    args: &[],
    expect: "Usage",
};
const BUTTERAUGLI: ToolCheck = ToolCheck {
    program: "butteraugli_main",
    args: &[],
    expect: "Usage",
};

const fn ffmpeg_filter(filter: &'static str) -> ToolCheck {
    ToolCheck {
        program: "ffmpeg",
        args: &["-hide_banner", "-filters"],
        expect: filter,
    }
}

/// Metric computed by a locally installed tool on cpu.
fn native(
    mode: &'static str,
    kind: Kind,
    output: Output,
    tool: ToolCheck,
    scorer: &'static dyn Scorer,
) -> MetricDescriptor {
    MetricDescriptor {
        mode,
        kind,
        output,
        accelerated: false,
        unsupported: &[],
        provision: Provision::Tool(tool),
        scorer,
    }
}

/// Model based metric run in its provisioned environment.
fn accelerated(
    mode: &'static str,
    kind: Kind,
    output: Output,
    scorer: &'static model::Model,
) -> MetricDescriptor {
    MetricDescriptor {
        mode,
        kind,
        output,
        accelerated: true,
        unsupported: &[],
        provision: Provision::Model(scorer.recipe),
        scorer,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn describe_unknown() {
        assert_eq!(
            REGISTRY.describe("vmaf5k").unwrap_err(),
            UnknownMode("vmaf5k".into())
        );
    }

    #[test]
    fn kinds_partition_modes() {
        let fr = REGISTRY.modes_for_kind(Kind::Fr);
        let nr = REGISTRY.modes_for_kind(Kind::Nr);
        assert!(fr.is_disjoint(&nr));
        assert_eq!(fr.len() + nr.len(), REGISTRY.iter().count());
        assert!(fr.contains("psnr"));
        assert!(fr.contains("vmaf4k-full"));
        assert!(nr.contains("dover"));
        assert!(nr.contains("cvqa-nr-ms"));
    }

    #[test]
    fn descriptor_keys_match_modes() {
        for d in REGISTRY.iter() {
            assert_eq!(REGISTRY.describe(d.mode).unwrap().mode, d.mode);
        }
    }

    #[test]
    fn sample_fps_override() {
        let ssimu = REGISTRY.describe("ssimulacra2").unwrap();
        assert_eq!(ssimu.output.sample_fps(None), Some(2.0));
        assert_eq!(ssimu.output.sample_fps(Some(5.0)), Some(5.0));

        let psnr = REGISTRY.describe("psnr").unwrap();
        assert_eq!(psnr.output.sample_fps(Some(5.0)), None);
    }

    #[test]
    fn fastvqa_excludes_mps() {
        let d = REGISTRY.describe("fastervqa").unwrap();
        assert!(d.accelerated);
        assert_eq!(d.unsupported, [Backend::Mps]);
        assert!(!REGISTRY.describe("vmaf").unwrap().accelerated);
    }

    #[test]
    fn learned_modes() {
        let nr = REGISTRY.modes_for_kind(Kind::Nr);
        for mode in ["cover", "uvq", "maxvqa", "qalign", "mdtvsfa"] {
            assert!(nr.contains(mode), "{mode}");
            assert!(matches!(
                REGISTRY.describe(mode).unwrap().provision,
                Provision::Model(_)
            ));
        }
        let cvvdp = REGISTRY.describe("cvvdp-fhd").unwrap();
        assert_eq!(cvvdp.kind, Kind::Fr);
        assert_eq!(cvvdp.unsupported, CUDA_ONLY);
        assert!(!REGISTRY.describe("maxvqa").unwrap().accelerated);
    }
}
