//! Learned metrics run by python runners inside provisioned model environments.
//!
//! vqcheck runners print their scores on stdout as a single `VQCHECK_RESULT:<json object>`
//! line. Upstream CLIs run directly are parsed from their own output lines.
use crate::{
    device::Backend,
    process::{CommandExt, ensure_success},
    provision::{ModelRecipe, Patch, Runner},
    result::{Score, Scores},
    scorer::{Job, Normalized, ScoreError, Scorer, mean},
};
use anyhow::{Context, anyhow};
use futures_util::{FutureExt, future::LocalBoxFuture};
use log::{debug, info};
use std::{ffi::OsString, process::Stdio};
use tokio::process::Command;

pub const RESULT_MARKER: &str = "VQCHECK_RESULT:";

/// Env var holding the torch device for patched upstream scripts.
const DEVICE_ENV: &str = "VQCHECK_TORCH_DEVICE";

/// Python expression reading [`DEVICE_ENV`].
macro_rules! torch_env_device {
    () => {
        r#"torch.device(__import__("os").environ.get("VQCHECK_TORCH_DEVICE", "cpu"))"#
    };
}

/// Stderr fragments meaning the selected backend cannot be used.
const DEVICE_ERRORS: &[&str] = &[
    "cuda out of memory",
    "no cuda gpus",
    "cuda is not available",
    "not compiled with cuda",
    "cuda error",
    "mps backend",
    "mps is not available",
    "vulkan",
];

macro_rules! runner {
    ($file:literal) => {
        Runner {
            file: $file,
            source: include_str!(concat!("model/runners/", $file)),
        }
    };
}

static DOVER_RECIPE: ModelRecipe = ModelRecipe {
    name: "dover",
    repo: Some("https://github.com/QualityAssessment/DOVER"),
    weights: &[
        (
            "pretrained_weights/DOVER.pth",
            "https://github.com/QualityAssessment/DOVER/releases/download/v0.1.0/DOVER.pth",
        ),
        (
            "pretrained_weights/DOVER-Mobile.pth",
            "https://github.com/QualityAssessment/DOVER/releases/download/v0.5.0/DOVER-Mobile.pth",
        ),
    ],
    python: "python3.8",
    requirements: &["requirements.txt"],
    packages: &["decord"],
    editable: &["."],
    runners: &[runner!("vqcheck_dover.py")],
    required: &["evaluate_one_video.py"],
    ..ModelRecipe::EMPTY
};

static FAST_VQA_RECIPE: ModelRecipe = ModelRecipe {
    name: "fast-vqa",
    repo: Some("https://github.com/VQAssessment/FAST-VQA-and-FasterVQA"),
    weights: &[
        (
            "pretrained_weights/FAST_VQA_B_1_4.pth",
            "https://github.com/TimothyHTimothy/FAST-VQA/releases/download/v2.0.0/FAST_VQA_B_1_4.pth",
        ),
        (
            "pretrained_weights/FAST_VQA_3D_1_1.pth",
            "https://github.com/TimothyHTimothy/FAST-VQA/releases/download/v2.0.0/FAST_VQA_3D_1_1.pth",
        ),
    ],
    requirements: &["requirements.txt"],
    required: &["vqa.py"],
    ..ModelRecipe::EMPTY
};

static CVQA_RECIPE: ModelRecipe = ModelRecipe {
    name: "cvqa",
    repo: Some("https://github.com/sunwei925/CompressedVQA"),
    weights: &[
        (
            "ckpts/UGCVQA_FR_model.pth",
            "https://drive.google.com/uc?export=download&id=1ohKNe_r0bXBg7qp4vQj0mDT3CwJPHVMM",
        ),
        (
            "ckpts/UGCVQA_NR_model.pth",
            "https://drive.google.com/uc?export=download&id=1K73padYMgq70zVWVVLIODs9SyIhdgqkT",
        ),
    ],
    packages: &["torch", "torchvision", "opencv-python", "scipy"],
    runners: &[runner!("vqcheck_cvqa_fr.py"), runner!("vqcheck_cvqa_nr.py")],
    required: &["UGCVQA_FR_model.py", "UGCVQA_NR_model.py"],
    ..ModelRecipe::EMPTY
};

static LPIPS_RECIPE: ModelRecipe = ModelRecipe {
    name: "lpips",
    packages: &["torch", "lpips"],
    runners: &[runner!("vqcheck_lpips.py")],
    ..ModelRecipe::EMPTY
};

static PYIQA_RECIPE: ModelRecipe = ModelRecipe {
    name: "pyiqa",
    packages: &["pyiqa", "opencv-python"],
    runners: &[runner!("vqcheck_pyiqa.py")],
    ..ModelRecipe::EMPTY
};

static COVER_RECIPE: ModelRecipe = ModelRecipe {
    name: "cover",
    repo: Some("https://github.com/taco-group/COVER"),
    patches: &[
        Patch::first(
            "evaluate_one_video.py",
            "import torch\n",
            "import torch\nimport random\nimport numpy as np\n\
             torch.manual_seed(42)\nnp.random.seed(42)\nrandom.seed(42)\n",
        ),
        Patch::all("evaluate_one_video.py", "torch.cuda.current_device()", ""),
        Patch::first(
            "evaluate_one_video.py",
            r#"torch.device("cuda" if torch.cuda.is_available() else "cpu")"#,
            torch_env_device!(),
        ),
        Patch::first(
            "cover/datasets/cover_datasets.py",
            r#"elif video_path.endswith(".mp4"):"#,
            r#"elif video_path.endswith((".mp4", ".mkv", ".mov")):"#,
        ),
    ],
    weights: &[(
        "pretrained_weights/COVER.pth",
        "https://github.com/vztu/COVER/raw/release/Model/COVER.pth",
    )],
    python: "python3.8",
    requirements: &["requirements.txt"],
    packages: &["pyiqa", "decord"],
    editable: &["."],
    required: &["evaluate_one_video.py"],
    ..ModelRecipe::EMPTY
};

static UVQ_RECIPE: ModelRecipe = ModelRecipe {
    name: "uvq",
    repo: Some("https://github.com/google/uvq"),
    python: "python3.12",
    requirements: &["requirements.txt"],
    runners: &[runner!("vqcheck_uvq.py")],
    required: &["uvq_main.py", "models"],
    ..ModelRecipe::EMPTY
};

static MAXVQA_RECIPE: ModelRecipe = ModelRecipe {
    name: "maxvqa",
    repo: Some("https://github.com/VQAssessment/ExplainableVQA"),
    extra_repos: &[
        ("open_clip", "https://github.com/mlfoundations/open_clip"),
        ("DOVER", "https://github.com/QualityAssessment/DOVER"),
    ],
    patches: &[
        Patch::all("demo_maxvqa.py", r#""cuda""#, r#""cpu""#),
        Patch::all("demo_maxvqa.py", ".cuda()", ".to(device)"),
        Patch::all("demo_maxvqa.py", "../DOVER/", "DOVER/"),
        Patch::first(
            "demo_maxvqa.py",
            r#"torch.load("DOVER/pretrained_weights/DOVER.pth")"#,
            r#"torch.load("DOVER/pretrained_weights/DOVER.pth", map_location=torch.device(device))"#,
        ),
        Patch::first(
            "demo_maxvqa.py",
            r#"torch.load("maxvqa_maxwell.pt")"#,
            r#"torch.load("maxvqa_maxwell.pt", map_location=torch.device(device))"#,
        ),
        Patch::first("model/maxvqa.py", r#"self.device = "cuda""#, r#"self.device = "cpu""#),
        Patch::all("model/maxvqa.py", ".cuda()", ".cpu()"),
        Patch::first(
            "model/maxvqa.py",
            "x = x.permute(1, 0, 2)  # NLD -> LND",
            "# x = x.permute(1, 0, 2) # NLD -> LND",
        ),
        Patch::first(
            "model/maxvqa.py",
            "x = x.permute(1, 0, 2)  # LND -> NLD",
            "# x = x.permute(1, 0, 2) # LND -> NLD",
        ),
        Patch::all("open_clip/src/open_clip/modified_resnet.py", "return x[0]", "return x"),
    ],
    weights: &[(
        "DOVER/pretrained_weights/DOVER.pth",
        "https://github.com/QualityAssessment/DOVER/releases/download/v0.1.0/DOVER.pth",
    )],
    python: "python3.10",
    packages: &[
        "torch",
        "torchvision",
        "decord",
        "pyyaml",
        "scipy",
        "scikit-learn",
        "numpy==1.24.3",
        "opencv-python",
    ],
    editable: &["open_clip", "DOVER"],
    runners: &[runner!("vqcheck_maxvqa.py")],
    required: &["demo_maxvqa.py", "maxvqa_maxwell.pt"],
    ..ModelRecipe::EMPTY
};

static QALIGN_RECIPE: ModelRecipe = ModelRecipe {
    name: "qalign",
    repo: Some("https://github.com/q-future/q-align"),
    patches: &[
        // fp16 only off cpu
        Patch::first(
            "q_align/evaluate/scorer.py",
            "self.weight_tensor = torch.Tensor([1,0.75,0.5,0.25,0.]).half().to(model.device)",
            "self.weight_tensor = torch.Tensor([1,0.75,0.5,0.25,0.]).to(model.device) \
             if device == \"cpu\" else torch.Tensor([1,0.75,0.5,0.25,0.]).half().to(model.device)",
        ),
        Patch::first(
            "q_align/evaluate/scorer.py",
            r#"video_tensors = [self.image_processor.preprocess(vid, return_tensors="pt")["pixel_values"].half().to(self.model.device) for vid in video]"#,
            r#"video_tensors = [self.image_processor.preprocess(vid, return_tensors="pt")["pixel_values"].to(self.model.device) if self.model.device.type == "cpu" else self.image_processor.preprocess(vid, return_tensors="pt")["pixel_values"].half().to(self.model.device) for vid in video]"#,
        ),
        Patch::first(
            "q_align/model/builder.py",
            "kwargs['torch_dtype'] = torch.float16",
            "kwargs['torch_dtype'] = torch.float16 if device != 'cpu' else torch.float32",
        ),
    ],
    python: "python3.8",
    packages: &["decord", "numpy==1.24.3", "protobuf"],
    editable: &["."],
    required: &["q_align/evaluate/scorer.py"],
    ..ModelRecipe::EMPTY
};

static CVVDP_RECIPE: ModelRecipe = ModelRecipe {
    name: "cvvdp",
    packages: &["cvvdp"],
    runners: &[runner!("vqcheck_cvvdp.py")],
    ..ModelRecipe::EMPTY
};

static MDTVSFA_RECIPE: ModelRecipe = ModelRecipe {
    name: "mdtvsfa",
    repo: Some("https://github.com/lidq92/MDTVSFA"),
    patches: &[
        Patch::first(
            "test_demo.py",
            r#"torch.device("cuda" if torch.cuda.is_available() else "cpu")"#,
            torch_env_device!(),
        ),
        Patch::first(
            "test_demo.py",
            "model.load_state_dict(torch.load(args.model_path))",
            "model.load_state_dict(torch.load(args.model_path, map_location=device))",
        ),
    ],
    python: "python3.8",
    packages: &[
        "torch==2.4.1",
        "torchvision==0.19.1",
        "scikit-video==1.1.11",
        "h5py==3.11.0",
        "numpy==1.23.5",
    ],
    required: &["test_demo.py", "models/MDTVSFA.pt"],
    ..ModelRecipe::EMPTY
};

use Arg::*;

/// Runner args common to the vqcheck runner scripts.
const RUNNER_FR_ARGS: &[Arg] = &[
    Lit("--device"),
    Device,
    Lit("--distorted"),
    Distorted,
    Lit("--reference"),
    Reference,
    SampleFps,
];
const RUNNER_NR_ARGS: &[Arg] = &[Lit("--device"), Device, Lit("--distorted"), Distorted, SampleFps];

pub static LPIPS: Model = Model {
    recipe: &LPIPS_RECIPE,
    entry: "vqcheck_lpips.py",
    args: RUNNER_FR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[
        Field::mean("distances", "lpips"),
        Field::new("distances", "lpips_frames"),
    ],
};
pub static CVQA_FR: Model = Model {
    recipe: &CVQA_RECIPE,
    entry: "vqcheck_cvqa_fr.py",
    args: RUNNER_FR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("score", "cvqa-fr")],
};
pub static CVQA_FR_MS: Model = Model {
    recipe: &CVQA_RECIPE,
    entry: "vqcheck_cvqa_fr.py",
    args: &[
        Lit("--device"),
        Device,
        Lit("--distorted"),
        Distorted,
        Lit("--reference"),
        Reference,
        Lit("--multiscale"),
    ],
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("score", "cvqa-fr-ms")],
};
pub static CVQA_NR: Model = Model {
    recipe: &CVQA_RECIPE,
    entry: "vqcheck_cvqa_nr.py",
    args: RUNNER_NR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("score", "cvqa-nr")],
};
pub static CVQA_NR_MS: Model = Model {
    recipe: &CVQA_RECIPE,
    entry: "vqcheck_cvqa_nr.py",
    args: &[
        Lit("--device"),
        Device,
        Lit("--distorted"),
        Distorted,
        Lit("--multiscale"),
    ],
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("score", "cvqa-nr-ms")],
};
pub static DOVER: Model = Model {
    recipe: &DOVER_RECIPE,
    entry: "vqcheck_dover.py",
    args: RUNNER_NR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[
        Field::new("technical_score", "technical"),
        Field::new("aesthetic_score", "aesthetic"),
        Field::new("fused_score", "fused"),
    ],
};
pub static FASTVQA: Model = Model {
    recipe: &FAST_VQA_RECIPE,
    entry: "vqa.py",
    args: &[
        Lit("-m"),
        Lit("FAST-VQA"),
        Lit("-v"),
        Distorted,
        Lit("-d"),
        Device,
    ],
    output: RunnerOutput::QualityScoreText("fastvqa"),
    fields: &[],
};
pub static FASTERVQA: Model = Model {
    recipe: &FAST_VQA_RECIPE,
    entry: "vqa.py",
    args: &[
        Lit("-m"),
        Lit("FasterVQA"),
        Lit("-v"),
        Distorted,
        Lit("-d"),
        Device,
    ],
    output: RunnerOutput::QualityScoreText("fastervqa"),
    fields: &[],
};
pub static MUSIQ: Model = Model {
    recipe: &PYIQA_RECIPE,
    entry: "vqcheck_pyiqa.py",
    args: &[
        Lit("--metric"),
        Lit("musiq"),
        Lit("--device"),
        Device,
        Lit("--distorted"),
        Distorted,
        SampleFps,
    ],
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[
        Field::mean("frames", "musiq"),
        Field::new("frames", "musiq_frames"),
    ],
};
pub static COVER: Model = Model {
    recipe: &COVER_RECIPE,
    entry: "evaluate_one_video.py",
    args: &[Lit("-v"), Distorted],
    // path,semantic score,technical score,aesthetic score,overall/final score
    output: RunnerOutput::CsvRow(&["semantic", "technical", "aesthetic", "cover"]),
    fields: &[],
};
pub static UVQ: Model = Model {
    recipe: &UVQ_RECIPE,
    entry: "vqcheck_uvq.py",
    args: RUNNER_NR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[],
};
pub static MAXVQA: Model = Model {
    recipe: &MAXVQA_RECIPE,
    entry: "vqcheck_maxvqa.py",
    args: RUNNER_NR_ARGS,
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[],
};
pub static QALIGN: Model = Model {
    recipe: &QALIGN_RECIPE,
    entry: "q_align/evaluate/scorer.py",
    args: &[
        Lit("--device"),
        Device,
        Lit("--img_path"),
        Distorted,
        Lit("--video"),
        Lit("--model-path"),
        Lit("q-future/one-align"),
    ],
    output: RunnerOutput::Bracketed("qalign"),
    fields: &[],
};
pub static CVVDP: Model = Model {
    recipe: &CVVDP_RECIPE,
    entry: "vqcheck_cvvdp.py",
    args: &[
        Lit("--device"),
        Device,
        Lit("--distorted"),
        Distorted,
        Lit("--reference"),
        Reference,
        Lit("--display"),
        Lit("standard_4k"),
    ],
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("cvvdp", "cvvdp")],
};
pub static CVVDP_FHD: Model = Model {
    recipe: &CVVDP_RECIPE,
    entry: "vqcheck_cvvdp.py",
    args: &[
        Lit("--device"),
        Device,
        Lit("--distorted"),
        Distorted,
        Lit("--reference"),
        Reference,
        Lit("--display"),
        Lit("standard_fhd"),
    ],
    output: RunnerOutput::Json(RESULT_MARKER),
    fields: &[Field::new("cvvdp", "cvvdp-fhd")],
};
pub static MDTVSFA: Model = Model {
    recipe: &MDTVSFA_RECIPE,
    entry: "test_demo.py",
    args: &[
        Lit("--model_path"),
        Lit("models/MDTVSFA.pt"),
        Lit("--video_path"),
        Distorted,
        Lit("--frame_batch_size"),
        Lit("1"),
    ],
    output: RunnerOutput::Labelled {
        label: "Predicted perceptual quality:",
        name: "mdtvsfa",
    },
    fields: &[],
};

#[derive(Debug, Clone, Copy)]
pub enum Arg {
    Lit(&'static str),
    Device,
    Distorted,
    Reference,
    /// `--sample-fps <fps>` when sampling, otherwise nothing.
    SampleFps,
}

#[derive(Debug, Clone, Copy)]
pub enum RunnerOutput {
    /// `<marker><json object>` line.
    Json(&'static str),
    /// `... quality score ... is <float>` line, recorded under the given name.
    QualityScoreText(&'static str),
    /// `<path>,<float>,...` csv row, floats recorded under the given names in order.
    CsvRow(&'static [&'static str]),
    /// `[<float>]` line.
    Bracketed(&'static str),
    /// `<label> <float>` line, the float optionally in brackets.
    Labelled {
        label: &'static str,
        name: &'static str,
    },
}

/// Maps a runner json key to a score name.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    key: &'static str,
    name: &'static str,
    /// Record the mean of a series instead of the series.
    mean: bool,
}

impl Field {
    const fn new(key: &'static str, name: &'static str) -> Self {
        Self {
            key,
            name,
            mean: false,
        }
    }

    const fn mean(key: &'static str, name: &'static str) -> Self {
        Self {
            key,
            name,
            mean: true,
        }
    }
}

#[derive(Debug)]
pub struct Model {
    pub recipe: &'static ModelRecipe,
    /// Runner script relative to the model install dir.
    entry: &'static str,
    args: &'static [Arg],
    output: RunnerOutput,
    fields: &'static [Field],
}

impl Scorer for Model {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let dir = self.recipe.install_dir(job.toolkit);
            let entry = dir.join(self.entry);
            if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                return Err(ScoreError::Provisioning {
                    mode: job.mode.into(),
                    source: anyhow!("runner {} missing", entry.display()),
                });
            }

            let mut cmd = Command::new(self.recipe.python_bin(job.toolkit));
            cmd.kill_on_drop(true)
                .stdin(Stdio::null())
                .current_dir(&dir)
                .env(DEVICE_ENV, job.device.as_str())
                .arg(&entry)
                .args(self.runner_args(job)?);
            info!("{} {} on {}", job.mode, job.distorted.path.display(), job.device);
            debug!("cmd `{}`", cmd.to_cmd_str());

            let out = cmd.output().await.with_context(|| format!("{} runner", job.mode))?;
            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr).to_lowercase();
                if job.device != Backend::Cpu && DEVICE_ERRORS.iter().any(|e| stderr.contains(e)) {
                    let reason = stderr.lines().rfind(|l| !l.trim().is_empty()).unwrap_or_default();
                    return Err(ScoreError::BackendUnavailable {
                        backend: job.device,
                        reason: reason.trim().to_owned(),
                    });
                }
            }
            ensure_success(job.mode, &out)?;

            let stdout = String::from_utf8_lossy(&out.stdout);
            Ok(self.parse(&stdout)?.into())
        }
        .boxed_local()
    }
}

impl Model {
    fn runner_args(&self, job: &Job<'_>) -> Result<Vec<OsString>, ScoreError> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        for arg in self.args {
            match arg {
                Lit(s) => args.push((*s).into()),
                Device => args.push(job.device.as_str().into()),
                Distorted => args.push(job.distorted.path.clone().into()),
                Reference => args.push(job.reference()?.path.clone().into()),
                SampleFps => {
                    if let Some(fps) = job.sample_fps {
                        args.push("--sample-fps".into());
                        args.push(fps.to_string().into());
                    }
                }
            }
        }
        Ok(args)
    }

    fn parse(&self, stdout: &str) -> anyhow::Result<Scores> {
        match self.output {
            RunnerOutput::Json(marker) => {
                let json = stdout
                    .lines()
                    .rev()
                    .find_map(|l| l.trim().strip_prefix(marker))
                    .with_context(|| format!("runner output missing `{marker}` line"))?;
                let json: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(json).context("invalid runner json")?;
                self.extract(&json)
            }
            RunnerOutput::QualityScoreText(name) => {
                let score = stdout
                    .lines()
                    .rev()
                    .find_map(quality_score)
                    .context("runner output missing quality score")?;
                Ok(Scores::from([(name.to_owned(), Score::Value(score))]))
            }
            RunnerOutput::CsvRow(names) => stdout
                .lines()
                .rev()
                .find_map(|l| csv_scores(l, names))
                .context("runner output missing score row"),
            RunnerOutput::Bracketed(name) => {
                let score = stdout
                    .lines()
                    .rev()
                    .find_map(|l| l.trim().strip_prefix('[')?.strip_suffix(']')?.trim().parse::<f64>().ok())
                    .context("runner output missing `[score]` line")?;
                Ok(Scores::from([(name.to_owned(), Score::Value(score))]))
            }
            RunnerOutput::Labelled { label, name } => {
                let score = stdout
                    .lines()
                    .rev()
                    .find_map(|l| labelled_score(l, label))
                    .with_context(|| format!("runner output missing `{label}` line"))?;
                Ok(Scores::from([(name.to_owned(), Score::Value(score))]))
            }
        }
    }

    /// Scores named by `fields`, or every json entry when there are none.
    fn extract(&self, json: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<Scores> {
        if self.fields.is_empty() {
            let mut scores = Scores::new();
            for (key, value) in json {
                let score: Score = serde_json::from_value(value.clone())
                    .with_context(|| format!("runner json `{key}` not a number or series"))?;
                scores.insert(key.clone(), score);
            }
            anyhow::ensure!(!scores.is_empty(), "runner json has no scores");
            return Ok(scores);
        }

        let mut scores = Scores::new();
        for field in self.fields {
            let value = json
                .get(field.key)
                .with_context(|| format!("runner json missing `{}`", field.key))?;
            let score: Score = serde_json::from_value(value.clone())
                .with_context(|| format!("runner json `{}` not a number or series", field.key))?;
            let score = match (score, field.mean) {
                (Score::Series(frames), true) => Score::Value(
                    mean(&frames).with_context(|| format!("runner json `{}` empty", field.key))?,
                ),
                (score, _) => score,
            };
            scores.insert(field.name.to_owned(), score);
        }
        Ok(scores)
    }
}

/// Parse a `path,f1,f2,..` row with a float per name.
fn csv_scores(line: &str, names: &[&str]) -> Option<Scores> {
    let mut cols = line.trim().split(',').skip(1);
    let mut scores = Scores::new();
    for name in names {
        let score = cols.next()?.trim().parse().ok()?;
        scores.insert((*name).to_owned(), Score::Value(score));
    }
    Some(scores)
}

/// Parse e.g. "Predicted perceptual quality: [0.6550506]" or "cvvdp=6.5130 [JOD]".
fn labelled_score(line: &str, label: &str) -> Option<f64> {
    let (_, tail) = line.split_once(label)?;
    let tail = tail.trim_start();
    let tail = tail.strip_prefix('[').unwrap_or(tail);
    tail.split([']', ' ', '\t'])
        .next()?
        .parse()
        .ok()
}

/// Parse e.g. "The quality score of the video (range [0,1]) is 0.42573."
fn quality_score(line: &str) -> Option<f64> {
    if !line.to_lowercase().contains("quality score") {
        return None;
    }
    let (_, tail) = line.rsplit_once(" is ")?;
    tail.split_whitespace()
        .next()?
        .trim_end_matches(['.', ','])
        .parse()
        .ok()
}
