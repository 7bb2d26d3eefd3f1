//! Persisted per-(video, method) result schema.
use crate::{device::Backend, temporary};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// A named score, either a single number or an ordered frame aligned series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Value(f64),
    Series(Vec<f64>),
}

pub type Scores = BTreeMap<String, Score>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub method: String,
    pub distorted: PathBuf,
    /// Always serialized, `null` for no-reference methods.
    pub reference: Option<PathBuf>,
    pub scores: Scores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lossless_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_fps: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Backend>,
    /// RFC 3339 time the scores were computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MetricResult {
    /// Single number summary of the method, if any.
    pub fn headline(&self) -> Option<f64> {
        let by_method = self.scores.get(&self.method);
        let first_value = || {
            self.scores.values().find_map(|s| match s {
                Score::Value(v) => Some(v),
                Score::Series(_) => None,
            })
        };
        match by_method {
            Some(Score::Value(v)) => Some(*v),
            _ => first_value().copied(),
        }
    }

    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(path, &json).await
    }

    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }
}

/// `<base_name>.<method>.json`
pub fn file_name(base_name: &str, method: &str) -> String {
    format!("{base_name}.{method}.json")
}

/// Split a result file name into `(base_name, method)`.
pub fn parse_file_name(name: &str) -> Option<(&str, &str)> {
    let stem = name.strip_suffix(".json")?;
    let (base, method) = stem.rsplit_once('.')?;
    match base.is_empty() || method.is_empty() {
        true => None,
        false => Some((base, method)),
    }
}

/// Write via a sibling temp file & rename so readers never see partial files.
pub async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", fastrand::u32(..)));
    let tmp = PathBuf::from(tmp);

    temporary::add(&tmp);
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming to {}", path.display()))?;
    temporary::unadd(&tmp);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn psnr_result() -> MetricResult {
        MetricResult {
            method: "psnr".into(),
            distorted: "/v/clip_001.mp4".into(),
            reference: Some("/r/clip_001_ref.mp4".into()),
            scores: Scores::from([
                ("psnr".to_owned(), Score::Value(42.25)),
                ("psnr_frames".to_owned(), Score::Series(vec![42.0, 42.5])),
            ]),
            lossless_match: Some(false),
            properties_match: None,
            sample_fps: None,
            device: None,
            timestamp: None,
        }
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(psnr_result()).unwrap();
        assert_eq!(json["method"], "psnr");
        assert_eq!(json["scores"]["psnr"], 42.25);
        assert_eq!(json["scores"]["psnr_frames"][1], 42.5);
        assert_eq!(json["lossless_match"], false);
        assert!(json.get("device").is_none());

        let nr = MetricResult {
            reference: None,
            lossless_match: None,
            ..psnr_result()
        };
        let json = serde_json::to_value(nr).unwrap();
        assert!(json["reference"].is_null());
        assert!(json.get("lossless_match").is_none());
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name("clip_001", "psnr"), "clip_001.psnr.json");
        assert_eq!(
            parse_file_name("clip.v2.vmaf4k-full.json"),
            Some(("clip.v2", "vmaf4k-full"))
        );
        assert_eq!(parse_file_name("clip.json"), None);
        assert_eq!(parse_file_name(".psnr.json"), None);
        assert_eq!(parse_file_name("clip.psnr.txt"), None);
    }

    #[test]
    fn headline_prefers_method_score() {
        assert_eq!(psnr_result().headline(), Some(42.25));
        let dover = MetricResult {
            method: "dover".into(),
            scores: Scores::from([
                ("aesthetic".to_owned(), Score::Value(0.4)),
                ("technical".to_owned(), Score::Value(0.6)),
            ]),
            ..psnr_result()
        };
        assert_eq!(dover.headline(), Some(0.4));
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("clip_001.psnr.json");
        let result = psnr_result();
        result.write(&path).await.unwrap();
        assert_eq!(MetricResult::read(&path).await.unwrap(), result);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
