//! Merging result files into a consolidated report.
use crate::result::{self, MetricResult, write_atomic};
use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

type Payload = serde_json::Map<String, serde_json::Value>;

/// base name -> method -> result payload without `method`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsolidatedReport(pub BTreeMap<String, BTreeMap<String, Payload>>);

impl ConsolidatedReport {
    /// Load an existing report, starting empty if it's missing or unreadable.
    pub async fn load_or_empty(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(report) => report,
            Err(err) => {
                warn!("{err:#}, starting with an empty report");
                Self::default()
            }
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write pretty json with sorted keys.
    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json).await
    }

    /// Insert or replace one (video, method) entry.
    fn insert(&mut self, entry: Entry) -> Change {
        let Entry {
            base_name,
            method,
            payload,
        } = entry;
        let methods = self.0.entry(base_name).or_default();
        if methods.get(&method) == Some(&payload) {
            return Change::Unchanged;
        }
        let new_video = methods.is_empty();
        methods.insert(method, payload);
        match new_video {
            true => Change::NewVideo,
            false => Change::Updated,
        }
    }

    /// All methods present for any video.
    pub fn methods(&self) -> BTreeSet<&str> {
        self.0
            .values()
            .flat_map(|m| m.keys())
            .map(String::as_str)
            .collect()
    }

    /// Per video, methods present for other videos but not this one.
    pub fn missing_methods(&self) -> BTreeMap<&str, Vec<&str>> {
        let all = self.methods();
        self.0
            .iter()
            .filter_map(|(video, methods)| {
                let missing: Vec<_> = all
                    .iter()
                    .copied()
                    .filter(|m| !methods.contains_key(*m))
                    .collect();
                (!missing.is_empty()).then_some((video.as_str(), missing))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    NewVideo,
    Updated,
    Unchanged,
}

/// A result file that could not be read as a result.
#[derive(Debug)]
pub struct MalformedResult {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for MalformedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed result {}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for MalformedResult {}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    base_name: String,
    method: String,
    payload: Payload,
}

impl Entry {
    async fn read(path: &Path) -> Result<Self, MalformedResult> {
        let malformed = |reason: String| MalformedResult {
            path: path.to_owned(),
            reason,
        };
        let (base_name, method) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(result::parse_file_name)
            .ok_or_else(|| malformed("not named <base>.<method>.json".into()))?;
        let (base_name, method) = (base_name.to_owned(), method.to_owned());

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| malformed(e.to_string()))?;
        let value: serde_json::Value =
            serde_json::from_slice(&data).map_err(|e| malformed(e.to_string()))?;
        MetricResult::deserialize(&value).map_err(|e| malformed(format!("not a result: {e}")))?;
        let serde_json::Value::Object(mut payload) = value else {
            return Err(malformed("not a json object".into()));
        };
        payload.remove("method");
        Ok(Self {
            base_name,
            method,
            payload,
        })
    }
}

/// Outcome of one aggregation.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub report: ConsolidatedReport,
    pub found: usize,
    pub loaded: usize,
    pub malformed: Vec<MalformedResult>,
    pub new_videos: BTreeSet<String>,
    pub updated_videos: BTreeSet<String>,
}

/// Merge result `files` into `existing`. New (video, method) entries replace prior ones,
/// everything else in `existing` is kept as is. Malformed files are skipped.
pub async fn aggregate(existing: ConsolidatedReport, files: &[PathBuf]) -> Aggregation {
    let mut agg = Aggregation {
        report: existing,
        found: files.len(),
        ..<_>::default()
    };
    for path in files {
        let entry = match Entry::read(path).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!("{err}");
                agg.malformed.push(err);
                continue;
            }
        };
        agg.loaded += 1;
        let video = entry.base_name.clone();
        match agg.report.insert(entry) {
            Change::NewVideo => {
                agg.new_videos.insert(video);
            }
            Change::Updated if !agg.new_videos.contains(&video) => {
                agg.updated_videos.insert(video);
            }
            _ => {}
        }
    }
    agg
}

/// Recursively find candidate result files under `dir`, sorted by path.
pub async fn discover(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    let mut dirs = vec![dir.to_owned()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(result::parse_file_name)
                .is_some()
            {
                files.push(path);
            } else {
                debug!("ignoring {}", path.display());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::result::{MetricResult, Score, Scores};
    use serde_json::json;

    async fn write_result(dir: &Path, base: &str, method: &str, score: f64) -> PathBuf {
        let result = MetricResult {
            method: method.into(),
            distorted: format!("/v/{base}.mp4").into(),
            reference: None,
            scores: Scores::from([(method.to_owned(), Score::Value(score))]),
            lossless_match: None,
            properties_match: None,
            sample_fps: None,
            device: None,
            timestamp: None,
        };
        let path = dir.join(result::file_name(base, method));
        result.write(&path).await.unwrap();
        path
    }

    #[tokio::test]
    async fn aggregate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_result(dir.path(), "clip_001", "psnr", 40.0).await;
        write_result(dir.path(), "clip_001", "dover", 0.7).await;
        write_result(&dir.path().join("sub"), "clip_002", "psnr", 35.0).await;
        let files = discover(dir.path()).await.unwrap();
        assert_eq!(files.len(), 3);

        let once = aggregate(<_>::default(), &files).await;
        assert_eq!(once.loaded, 3);
        assert_eq!(once.new_videos.len(), 2);

        let twice = aggregate(once.report.clone(), &files).await;
        assert_eq!(twice.report, once.report);
        assert!(twice.new_videos.is_empty());
        assert!(twice.updated_videos.is_empty());
    }

    #[tokio::test]
    async fn unrelated_entries_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let existing: ConsolidatedReport = serde_json::from_value(json!({
            "old_clip": { "vmaf": { "scores": { "vmaf": 93.1 } } },
            "clip_001": { "psnr": { "scores": { "psnr": 10.0 } } },
        }))
        .unwrap();
        let files = [write_result(dir.path(), "clip_001", "psnr", 40.0).await];

        let agg = aggregate(existing, &files).await;
        let report = serde_json::to_value(&agg.report).unwrap();
        assert_eq!(report["old_clip"]["vmaf"]["scores"]["vmaf"], 93.1);
        assert_eq!(report["clip_001"]["psnr"]["scores"]["psnr"], 40.0);
        assert!(report["clip_001"]["psnr"].get("method").is_none());
        assert_eq!(agg.updated_videos, BTreeSet::from(["clip_001".to_owned()]));
    }

    #[tokio::test]
    async fn written_result_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let files = [write_result(dir.path(), "clip_001", "psnr", 42.5).await];
        let out = dir.path().join("report.json");

        aggregate(<_>::default(), &files).await.report.write(&out).await.unwrap();
        let report = ConsolidatedReport::load(&out).await.unwrap();
        assert_eq!(report.0["clip_001"]["psnr"]["scores"]["psnr"], json!(42.5));
        assert_eq!(
            report.0["clip_001"]["psnr"]["distorted"],
            json!("/v/clip_001.mp4")
        );
    }

    #[tokio::test]
    async fn malformed_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_result(dir.path(), "clip_001", "psnr", 42.5).await;
        let bad = dir.path().join("clip_002.psnr.json");
        tokio::fs::write(&bad, "{ not json").await.unwrap();
        let array = dir.path().join("clip_003.psnr.json");
        tokio::fs::write(&array, "[1, 2]").await.unwrap();

        let agg = aggregate(<_>::default(), &[good, bad, array]).await;
        assert_eq!(agg.found, 3);
        assert_eq!(agg.loaded, 1);
        assert_eq!(agg.malformed.len(), 2);
        assert_eq!(agg.report.0.len(), 1);
    }

    #[tokio::test]
    async fn objects_without_result_fields_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("clip_001.psnr.json");
        tokio::fs::write(&other, r#"{"hello": "world"}"#).await.unwrap();
        let bad_scores = dir.path().join("clip_002.psnr.json");
        tokio::fs::write(
            &bad_scores,
            r#"{"method": "psnr", "distorted": "/v/clip_002.mp4", "reference": null, "scores": {"psnr": "high"}}"#,
        )
        .await
        .unwrap();

        let agg = aggregate(<_>::default(), &[other, bad_scores]).await;
        assert_eq!(agg.loaded, 0);
        assert_eq!(agg.malformed.len(), 2);
        assert!(agg.report.0.is_empty());
    }

    #[tokio::test]
    async fn chained_batches_match_one_batch() {
        let s1 = tempfile::tempdir().unwrap();
        let s2 = tempfile::tempdir().unwrap();
        let existing: ConsolidatedReport = serde_json::from_value(json!({
            "old_clip": { "vmaf": { "scores": { "vmaf": 93.1 } } },
        }))
        .unwrap();
        let batch1 = [
            write_result(s1.path(), "clip_001", "psnr", 30.0).await,
            write_result(s1.path(), "clip_002", "psnr", 31.0).await,
        ];
        let batch2 = [
            write_result(s2.path(), "clip_001", "psnr", 40.0).await,
            write_result(s2.path(), "clip_003", "dover", 0.5).await,
        ];

        let first = aggregate(existing.clone(), &batch1).await.report;
        let chained = aggregate(first, &batch2).await.report;

        let union: Vec<_> = batch1.iter().chain(&batch2).cloned().collect();
        let combined = aggregate(existing, &union).await.report;
        assert_eq!(chained, combined);
        assert_eq!(chained.0["clip_001"]["psnr"]["scores"]["psnr"], json!(40.0));
        assert_eq!(chained.0["clip_002"]["psnr"]["scores"]["psnr"], json!(31.0));
        assert!(chained.0.contains_key("old_clip"));
        assert!(chained.0.contains_key("clip_003"));
    }

    #[tokio::test]
    async fn missing_or_broken_existing_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        assert_eq!(
            ConsolidatedReport::load_or_empty(&path).await,
            ConsolidatedReport::default()
        );
        tokio::fs::write(&path, "nope").await.unwrap();
        assert_eq!(
            ConsolidatedReport::load_or_empty(&path).await,
            ConsolidatedReport::default()
        );
    }

    #[test]
    fn missing_methods() {
        let report: ConsolidatedReport = serde_json::from_value(json!({
            "a": { "psnr": {}, "vmaf": {} },
            "b": { "psnr": {} },
        }))
        .unwrap();
        assert_eq!(report.methods(), BTreeSet::from(["psnr", "vmaf"]));
        assert_eq!(report.missing_methods(), BTreeMap::from([("b", vec!["vmaf"])]));
    }
}
