use std::fs;
use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{CandidateSequence, ImageId, file_name_of};
use crate::error::CurateError;

#[derive(Debug, Clone, Serialize)]
pub struct IdentifierEntry {
    pub position: usize,
    pub id: ImageId,
    pub file_name: String,
    pub path: Utf8PathBuf,
}

/// Position-to-identifier table of one request. Its order is the payload order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentifierTable {
    entries: Vec<IdentifierEntry>,
}

impl IdentifierTable {
    /// `member` is the 1-based place of the image in its candidate; positional
    /// fallback ids use it so they stay stable when earlier images are skipped.
    fn push(&mut self, file_name: &str, path: &Utf8Path, member: usize) -> &IdentifierEntry {
        let position = self.entries.len() + 1;
        let mut id = ImageId::from_file_name(file_name, member);
        if self.entries.iter().any(|entry| entry.id == id) {
            id = ImageId::positional(member);
        }
        self.entries.push(IdentifierEntry {
            position,
            id,
            file_name: file_name.to_string(),
            path: path.to_path_buf(),
        });
        &self.entries[position - 1]
    }

    pub fn entries(&self) -> &[IdentifierEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.id.as_str()).collect()
    }

    pub fn id_for(&self, file_name: &str) -> Option<&ImageId> {
        self.entries
            .iter()
            .find(|entry| entry.file_name == file_name)
            .map(|entry| &entry.id)
    }

    /// Maps a token returned by the service back to a filename. Identifiers are
    /// tried first; a verbatim filename from the table is accepted too.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        let token = token.trim();
        self.entries
            .iter()
            .find(|entry| entry.id.as_str() == token)
            .or_else(|| self.entries.iter().find(|entry| entry.file_name == token))
            .map(|entry| entry.file_name.as_str())
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("Image {}: ID {}", entry.position, entry.id))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime_type: &'static str,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub base_name: String,
    pub instructions: String,
    pub table: IdentifierTable,
    pub payloads: Vec<ImagePayload>,
    pub skipped: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    /// Smallest subset the service may accept as a series.
    pub min_subset: usize,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self { min_subset: 2 }
    }
}

pub struct RequestBuilder {
    policy: RequestPolicy,
}

impl RequestBuilder {
    pub fn new(policy: RequestPolicy) -> Self {
        Self { policy }
    }

    pub fn build(&self, candidate: &CandidateSequence) -> Result<ClassificationRequest, CurateError> {
        self.build_with(candidate, |path| fs::read(path))
    }

    /// Builds a request reading image bytes through `read`. Images that fail to
    /// read or are empty are skipped and get no identifier.
    pub fn build_with<F>(
        &self,
        candidate: &CandidateSequence,
        mut read: F,
    ) -> Result<ClassificationRequest, CurateError>
    where
        F: FnMut(&Utf8Path) -> io::Result<Vec<u8>>,
    {
        let mut table = IdentifierTable::default();
        let mut payloads = Vec::with_capacity(candidate.len());
        let mut skipped = Vec::new();

        for (index, path) in candidate.members().iter().enumerate() {
            let bytes = match read(path) {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    warn!("skipping empty image {path}");
                    skipped.push(path.clone());
                    continue;
                }
                Err(err) => {
                    warn!("skipping unreadable image {path}: {err}");
                    skipped.push(path.clone());
                    continue;
                }
            };
            let entry = table.push(file_name_of(path), path, index + 1);
            debug!("mapped {} -> {}", entry.id, entry.file_name);
            payloads.push(ImagePayload {
                mime_type: mime_type_for(path),
                data: STANDARD.encode(&bytes),
            });
        }

        if table.is_empty() {
            return Err(CurateError::NoValidImages(candidate.base_name().to_string()));
        }

        let instructions = render_instructions(&table, candidate.len(), self.policy);
        Ok(ClassificationRequest {
            base_name: candidate.base_name().to_string(),
            instructions,
            table,
            payloads,
            skipped,
        })
    }
}

pub fn mime_type_for(path: &Utf8Path) -> &'static str {
    match path
        .extension()
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        Some("tiff") => "image/tiff",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn render_instructions(table: &IdentifierTable, candidate_len: usize, policy: RequestPolicy) -> String {
    let ids = table.ids();
    let id_list = ids.join(", ");
    let first = ids.first().copied().unwrap_or("_01");
    let example_excluded = ids
        .iter()
        .skip(1)
        .take(2)
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You curate training data for an image-to-video model that learns to produce a coherent photo series as a very low frame rate video. The images below come from one scraped social media post ({candidate_len} files). Posts often mix unrelated content, so your job is to filter.

IMAGE IDENTIFICATION: {shown} images follow in this exact order:
{table}

Refer to images ONLY by these IDs: {id_list}

TASK: find the LARGEST coherent subset (at least {min_subset} images) that forms one photo session: the same subject, the same location and background, the same lighting, the same or very similar outfit, similar framing, and a natural progression of poses. It is fine to include only part of the post, and it is fine to find nothing.

ORDERING:
- If the session shows a person, the first image must show the main subject most clearly, closest to the camera and facing it.
- Shots without the subject (landscape, scenery) go last.
- Otherwise order for the most natural flow between poses.

REJECT when no coherent subset of {min_subset} or more images exists, or when subject, location or session keep changing. Be strict: a different background or a different person does not belong.

CAPTION: 10 to 35 words of natural language describing what happens across the selected images as a whole, usable as a video generation prompt. Mention "ending with landscape views" when scenery shots close the sequence.

Respond with exactly one JSON object in this format:
{{
    "is_series": true,
    "images": [{{"path": "{first}", "order": 1}}],
    "excluded_images": [{example_excluded}],
    "series_caption": "sequence of photos showing ...",
    "reason": "Found X of Y images forming a coherent sequence; excluded Z.",
    "confidence": 0.9
}}

Use ONLY these IDs: {id_list}"#,
        shown = table.len(),
        table = table.render(),
        min_subset = policy.min_subset,
    )
}
