//! Distorted → reference file discovery & pairing.
use crate::{
    ffprobe::{self, Ffprobe},
    registry::REGISTRY,
};
use anyhow::{Context, ensure};
use log::{debug, warn};
use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::OnceCell;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi", "y4m", "ts", "m4v"];

pub const DEFAULT_REF_SUFFIXES: &[&str] = &[
    "_ref",
    "-ref",
    ".ref",
    "_reference",
    "_src",
    "_source",
    "_orig",
    "_original",
];

/// A video input, container metadata is probed on first use.
#[derive(Debug)]
pub struct VideoAsset {
    /// Absolute path.
    pub path: PathBuf,
    /// File name without extension & metric suffixes.
    pub base_name: String,
    info: OnceCell<Ffprobe>,
}

impl VideoAsset {
    pub fn new(path: PathBuf, base_name: String) -> Self {
        Self {
            path,
            base_name,
            info: OnceCell::new(),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("resolving {}", path.display()))?;
        let base_name = base_name(&path);
        Ok(Self::new(path, base_name))
    }

    /// Probed once, off the async runtime.
    pub async fn info(&self) -> &Ffprobe {
        self.info
            .get_or_init(|| async {
                let path = self.path.clone();
                tokio::task::spawn_blocking(move || ffprobe::probe(&path))
                    .await
                    .unwrap_or_else(|err| Ffprobe::unavailable(format!("ffprobe: {err}")))
            })
            .await
    }
}

/// File stem with any trailing `.<mode>` removed.
pub fn base_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    match stem.rsplit_once('.') {
        Some((base, mode)) if !base.is_empty() && REGISTRY.contains(mode) => base.to_owned(),
        _ => stem.into_owned(),
    }
}

/// A distorted video & at most one reference.
#[derive(Debug, Clone)]
pub struct ReferencePairing {
    pub distorted: Arc<VideoAsset>,
    pub reference: Option<Arc<VideoAsset>>,
}

impl ReferencePairing {
    /// Pairing for no-reference methods.
    pub fn without_reference(&self) -> Self {
        Self {
            distorted: self.distorted.clone(),
            reference: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub recursive: bool,
    /// Max edit distance normalised by the longer name, unlimited if `None`.
    pub max_distance: Option<f64>,
    pub ref_suffixes: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            max_distance: None,
            ref_suffixes: DEFAULT_REF_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Resolve distorted input(s) to pairings in stable path order.
pub fn pair(
    distorted: &Path,
    reference: Option<&Path>,
    config: &MatchConfig,
) -> anyhow::Result<Vec<ReferencePairing>> {
    let distorted_files = match distorted.is_dir() {
        true => video_files(distorted, config.recursive)?,
        false => {
            ensure!(distorted.exists(), "{} not found", distorted.display());
            vec![distorted.to_path_buf()]
        }
    };
    ensure!(
        !distorted_files.is_empty(),
        "no video files found in {}",
        distorted.display()
    );

    let references = match reference {
        None => References::None,
        Some(r) if r.is_dir() => {
            let candidates = video_files(r, config.recursive)?
                .into_iter()
                .map(|path| Candidate::new(&path, config))
                .collect::<anyhow::Result<_>>()?;
            References::Dir(candidates)
        }
        Some(r) => {
            ensure!(r.exists(), "{} not found", r.display());
            References::File(Arc::new(VideoAsset::from_path(r)?))
        }
    };

    let mut pairings = Vec::with_capacity(distorted_files.len());
    for path in distorted_files {
        let distorted = Arc::new(VideoAsset::from_path(&path)?);
        let reference = match &references {
            References::None => None,
            References::File(r) => Some(r.clone()).filter(|r| r.path != distorted.path),
            References::Dir(candidates) => {
                let found = closest(&distorted, candidates, config.max_distance);
                if found.is_none() {
                    warn!("no reference found for {}", distorted.path.display());
                }
                found.map(|c| c.asset.clone())
            }
        };
        if let Some(r) = &reference {
            debug!("{} -> {}", distorted.path.display(), r.path.display());
        }
        pairings.push(ReferencePairing {
            distorted,
            reference,
        });
    }
    Ok(pairings)
}

enum References {
    None,
    File(Arc<VideoAsset>),
    Dir(Vec<Candidate>),
}

#[derive(Debug)]
struct Candidate {
    asset: Arc<VideoAsset>,
    key: Vec<char>,
    file_name: String,
}

impl Candidate {
    fn new(path: &Path, config: &MatchConfig) -> anyhow::Result<Self> {
        let asset = VideoAsset::from_path(path)?;
        let key = name_key(&asset.base_name, &config.ref_suffixes)
            .chars()
            .collect();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            asset: Arc::new(asset),
            key,
            file_name,
        })
    }
}

/// Lowercased name with a trailing reference suffix stripped.
pub fn name_key(base_name: &str, ref_suffixes: &[String]) -> String {
    let lower = base_name.to_lowercase();
    ref_suffixes
        .iter()
        .find_map(|suffix| {
            lower
                .strip_suffix(&suffix.to_lowercase())
                .filter(|rest| !rest.is_empty())
        })
        .unwrap_or(lower.as_str())
        .to_owned()
}

/// Normalised distance as an exact fraction `edits / longer_len`.
#[derive(Debug, Clone, Copy)]
struct Distance {
    edits: usize,
    len: usize,
}

impl Distance {
    fn between(a: &[char], b: &[char]) -> Self {
        Self {
            edits: levenshtein(a, b),
            len: a.len().max(b.len()),
        }
    }

    fn within(self, max: Option<f64>) -> bool {
        match max {
            None => true,
            Some(max) => self.len == 0 || self.edits as f64 <= max * self.len as f64,
        }
    }

    fn cmp_exact(self, other: Self) -> Ordering {
        // edits/len compared without rounding, empty names count as identical
        let lhs = self.edits * other.len.max(1);
        let rhs = other.edits * self.len.max(1);
        lhs.cmp(&rhs)
    }
}

/// Closest candidate by name, ties broken by shorter then lexicographically
/// smaller file name. Candidates must share the first character of the name.
fn closest<'a>(
    distorted: &VideoAsset,
    candidates: &'a [Candidate],
    max_distance: Option<f64>,
) -> Option<&'a Candidate> {
    let key: Vec<char> = distorted.base_name.to_lowercase().chars().collect();
    candidates
        .iter()
        .filter(|c| c.asset.path != distorted.path)
        .filter(|c| key.first().is_some_and(|k| c.key.first() == Some(k)))
        .map(|c| (Distance::between(&key, &c.key), c))
        .filter(|(d, _)| d.within(max_distance))
        .min_by(|(da, a), (db, b)| {
            da.cmp_exact(*db)
                .then_with(|| a.file_name.chars().count().cmp(&b.file_name.chars().count()))
                .then_with(|| a.file_name.cmp(&b.file_name))
                .then_with(|| a.asset.path.cmp(&b.asset.path))
        })
        .map(|(_, c)| c)
}

pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            row[j + 1] = sub.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Video files in `dir` sorted by path.
pub fn video_files(dir: &Path, recursive: bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    collect_videos(dir, recursive, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_videos(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            if recursive {
                collect_videos(&path, recursive, out)?;
            }
        } else if is_video(&path) {
            out.push(path);
        }
    }
    Ok(())
}
