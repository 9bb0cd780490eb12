use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CurateError;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "webp"];

pub fn is_image_path(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// File name without its final extension.
pub fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file_name,
    }
}

/// Last `_`-separated segment of the stem that consists only of ASCII digits.
pub fn trailing_digits(file_name: &str) -> Option<&str> {
    file_stem(file_name)
        .rsplit('_')
        .find(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

pub fn trailing_number(file_name: &str) -> Option<u64> {
    file_stem(file_name)
        .rsplit('_')
        .filter(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
        .find_map(|segment| segment.parse().ok())
}

/// Sort key for members of a sequence; files without a numeric segment sort as 0.
pub fn order_key(file_name: &str) -> u64 {
    trailing_number(file_name).unwrap_or(0)
}

pub fn file_name_of(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or(path.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSequence {
    base_name: String,
    members: Vec<Utf8PathBuf>,
}

impl CandidateSequence {
    pub fn new(
        base_name: impl Into<String>,
        members: Vec<Utf8PathBuf>,
    ) -> Result<Self, CurateError> {
        let base_name = base_name.into();
        if members.len() < 2 {
            return Err(CurateError::InvalidCandidate {
                base_name,
                count: members.len(),
            });
        }
        Ok(Self { base_name, members })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn members(&self) -> &[Utf8PathBuf] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Directory of the first member; clusters may span subdirectories, so
    /// per-image paths are kept on the persisted series as well.
    pub fn source_directory(&self) -> Utf8PathBuf {
        self.members
            .first()
            .and_then(|path| path.parent())
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }

    pub fn resolve(&self, file_name: &str) -> Option<&Utf8Path> {
        self.members
            .iter()
            .find(|path| file_name_of(path) == file_name)
            .map(Utf8PathBuf::as_path)
    }
}

/// Request-local identifier handed to the classification service in place of a filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn from_file_name(file_name: &str, position: usize) -> Self {
        match trailing_digits(file_name) {
            Some(digits) => Self(format!("_{digits}")),
            None => Self::positional(position),
        }
    }

    pub fn positional(position: usize) -> Self {
        Self(format!("img_{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedImage {
    pub path: String,
    pub order: u32,
}

/// Normalized outcome of one classification call. Field names follow the
/// response schema the service is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_series: bool,
    #[serde(rename = "images", default)]
    pub included: Vec<IncludedImage>,
    #[serde(rename = "excluded_images", default)]
    pub excluded: Vec<String>,
    #[serde(rename = "series_caption", default)]
    pub caption: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

impl ClassificationResult {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_series: false,
            included: Vec::new(),
            excluded: Vec::new(),
            caption: String::new(),
            reason: reason.into(),
            confidence: 0.0,
        }
    }

    pub fn member_count(&self) -> usize {
        self.included.len()
    }

    pub fn is_included(&self, file_name: &str) -> bool {
        self.included.iter().any(|image| image.path == file_name)
    }

    pub fn included_in_order(&self) -> Vec<&IncludedImage> {
        let mut ordered = self.included.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|image| image.order);
        ordered
    }

    /// True when orders are exactly `1..=N` and no filename repeats.
    pub fn has_legal_order(&self) -> bool {
        let mut orders = self.included.iter().map(|image| image.order).collect::<Vec<_>>();
        orders.sort_unstable();
        let sequential = orders
            .iter()
            .enumerate()
            .all(|(index, order)| *order as usize == index + 1);
        let mut names = self.included.iter().map(|image| image.path.as_str()).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        sequential && names.len() == self.included.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub id: i64,
    pub base_name: String,
    pub source_directory: Utf8PathBuf,
    pub is_series: bool,
    pub raw_response: String,
    pub classification: ClassificationResult,
    pub caption: String,
    pub member_count: usize,
    pub candidate_count: usize,
    pub members: Vec<Utf8PathBuf>,
    pub token_usage: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Series {
    /// Full path for a filename of this series, falling back to the source directory.
    pub fn resolve_member(&self, file_name: &str) -> Utf8PathBuf {
        self.members
            .iter()
            .find(|path| file_name_of(path) == file_name)
            .cloned()
            .unwrap_or_else(|| self.source_directory.join(file_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesImage {
    pub id: i64,
    pub series_id: i64,
    pub image_path: Utf8PathBuf,
    pub order_in_series: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    pub id: i64,
    pub series_id: i64,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisLog {
    pub directory: String,
    pub total_images: usize,
    pub total_series: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn trailing_number_scans_segments_right_to_left() {
        assert_eq!(trailing_number("a_01.jpg"), Some(1));
        assert_eq!(trailing_number("2025_08_28_x_caption_12.jpg"), Some(12));
        assert_eq!(trailing_number("shot_07_final.png"), Some(7));
        assert_eq!(trailing_number("cover.jpg"), None);
        assert_eq!(order_key("cover.jpg"), 0);
    }

    #[test]
    fn image_id_prefers_suffix_digits() {
        assert_eq!(ImageId::from_file_name("post_02.jpg", 1).as_str(), "_02");
        assert_eq!(ImageId::from_file_name("cover.webp", 3).as_str(), "img_3");
    }

    #[test]
    fn singleton_candidate_is_rejected() {
        let err = CandidateSequence::new("a", vec![Utf8PathBuf::from("a_01.jpg")]).unwrap_err();
        assert_matches!(err, CurateError::InvalidCandidate { count: 1, .. });
    }

    #[test]
    fn image_extension_is_case_insensitive() {
        assert!(is_image_path(Utf8Path::new("dir/A_01.JPG")));
        assert!(is_image_path(Utf8Path::new("b.TiFf")));
        assert!(!is_image_path(Utf8Path::new("notes.txt")));
        assert!(!is_image_path(Utf8Path::new("jpg")));
    }

    #[test]
    fn legal_order_detects_gaps_and_duplicates() {
        let mut result = ClassificationResult::rejected("x");
        result.included = vec![
            IncludedImage { path: "a".into(), order: 2 },
            IncludedImage { path: "b".into(), order: 1 },
        ];
        assert!(result.has_legal_order());
        result.included[0].order = 3;
        assert!(!result.has_legal_order());
        result.included[0] = IncludedImage { path: "b".into(), order: 2 };
        assert!(!result.has_legal_order());
    }
}
