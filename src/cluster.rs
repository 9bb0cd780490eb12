use std::collections::BTreeMap;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::{CandidateSequence, file_name_of, file_stem, is_image_path, order_key};
use crate::error::CurateError;

static SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}_\d{2}_\d{2}_\d{2}_\d{2}_\d{2}_\w+?)DN\w+(__+)(\d+)\.(.+)$").unwrap()
});

static CAPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}_\d{2}_\d{2}_\d{2}_\d{2}_\d{2}_[\w.]+?)DN\w+(_[^_]+(?:__[^_]+)*?)_(\d+)\.(.+)$",
    )
    .unwrap()
});

static NUMERIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d+)\.(.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// `<timestamp>_<account>DN<session id>__<n>.<ext>`, grouped by timestamp and account.
    SessionId,
    /// `<timestamp>_<account>DN<id>_<caption>_<n>.<ext>`, grouped by prefix and caption.
    Caption,
    /// Anything ending in `_<digits>.<ext>`, grouped by what precedes the suffix.
    NumericSuffix,
    /// No numeric suffix: the stem is its own key.
    Stem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterKey {
    pub key: String,
    pub kind: PatternKind,
}

type Matcher = fn(&str) -> Option<String>;

const MATCHERS: &[(PatternKind, Matcher)] = &[
    (PatternKind::SessionId, match_session_id),
    (PatternKind::Caption, match_caption),
    (PatternKind::NumericSuffix, match_numeric_suffix),
];

fn match_session_id(file_name: &str) -> Option<String> {
    SESSION_ID
        .captures(file_name)
        .map(|caps| format!("{}DN_series", &caps[1]))
}

fn match_caption(file_name: &str) -> Option<String> {
    CAPTION
        .captures(file_name)
        .map(|caps| format!("{}DN_{}", &caps[1], &caps[2]))
}

fn match_numeric_suffix(file_name: &str) -> Option<String> {
    NUMERIC_SUFFIX
        .captures(file_name)
        .map(|caps| caps[1].to_string())
}

/// Runs the matcher cascade; the first pattern that matches decides the key.
pub fn cluster_key(file_name: &str) -> ClusterKey {
    for (kind, matcher) in MATCHERS {
        if let Some(key) = matcher(file_name) {
            return ClusterKey { key, kind: *kind };
        }
    }
    ClusterKey {
        key: file_stem(file_name).to_string(),
        kind: PatternKind::Stem,
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub total_images: usize,
    pub clusters: BTreeMap<String, CandidateSequence>,
}

impl Discovery {
    /// Candidates largest first; equal sizes keep key order.
    pub fn by_size(&self) -> Vec<&CandidateSequence> {
        let mut candidates = self.clusters.values().collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.len().cmp(&a.len()));
        candidates
    }
}

pub struct FilenameClusterer;

impl FilenameClusterer {
    pub fn discover(root: &Utf8Path) -> Result<Discovery, CurateError> {
        let images = Self::scan(root)?;
        let clusters = Self::cluster(&images);
        debug!(
            images = images.len(),
            clusters = clusters.len(),
            "clustered image listing"
        );
        Ok(Discovery {
            total_images: images.len(),
            clusters,
        })
    }

    /// Recursive listing of image files under `root`, sorted by path.
    pub fn scan(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CurateError> {
        if !root.is_dir() {
            return Err(CurateError::ScanRoot(root.as_std_path().to_path_buf()));
        }

        let mut images = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.into_path()) else {
                warn!("skipping non UTF-8 path under {root}");
                continue;
            };
            if is_image_path(&path) {
                images.push(path);
            }
        }
        images.sort();
        Ok(images)
    }

    /// Groups a listing into candidate sequences. The listing is sorted first,
    /// so the result does not depend on the order paths were supplied in.
    pub fn cluster(paths: &[Utf8PathBuf]) -> BTreeMap<String, CandidateSequence> {
        let mut listing = paths.to_vec();
        listing.sort();
        listing.dedup();

        let mut groups = BTreeMap::<String, Vec<Utf8PathBuf>>::new();
        for path in listing {
            let key = cluster_key(file_name_of(&path)).key;
            groups.entry(key).or_default().push(path);
        }

        groups
            .into_iter()
            .filter_map(|(key, mut members)| {
                // stable: equal numbers keep path order
                members.sort_by_key(|path| order_key(file_name_of(path)));
                CandidateSequence::new(key.clone(), members)
                    .ok()
                    .map(|candidate| (key, candidate))
            })
            .collect()
    }
}
