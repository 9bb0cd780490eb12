use std::collections::{BTreeMap, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::classifier::ClassificationOutcome;
use crate::domain::{
    AnalysisLog, CandidateSequence, ClassificationResult, ImageReference, Series, SeriesImage,
    file_name_of,
};
use crate::error::CurateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesOrder {
    #[default]
    MemberCountDesc,
    NewestFirst,
    Id,
}

impl SeriesOrder {
    fn sql(self) -> &'static str {
        match self {
            SeriesOrder::MemberCountDesc => "member_count DESC, id ASC",
            SeriesOrder::NewestFirst => "created_at DESC, id DESC",
            SeriesOrder::Id => "id ASC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub id: Option<i64>,
    pub base_name: Option<String>,
    pub confirmed_only: bool,
    pub order: SeriesOrder,
    pub limit: Option<usize>,
}

impl SeriesFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn confirmed() -> Self {
        Self {
            confirmed_only: true,
            ..Self::default()
        }
    }

    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_base_name(base_name: impl Into<String>) -> Self {
        Self {
            base_name: Some(base_name.into()),
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: SeriesOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeBucket {
    pub member_count: usize,
    pub series: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total_series: usize,
    pub confirmed_series: usize,
    pub total_images: usize,
    pub average_images_per_series: Option<f64>,
    pub size_distribution: Vec<SizeBucket>,
}

/// Persistence boundary of the curation engine. Every mutating call is one
/// transaction: either all of its rows change or none do.
pub trait CurationStore {
    /// Inserts the series and, for a positive result, one row per included image.
    fn create_series(
        &mut self,
        candidate: &CandidateSequence,
        outcome: &ClassificationOutcome,
    ) -> Result<i64, CurateError>;

    fn load_series(&self, filter: &SeriesFilter) -> Result<Vec<Series>, CurateError>;

    /// Overwrites the stored result, recomputes `member_count` and rewrites the
    /// membership rows to match `result.included`.
    fn update_series_classification(
        &mut self,
        id: i64,
        result: &ClassificationResult,
    ) -> Result<(), CurateError>;

    fn delete_series(&mut self, id: i64) -> Result<(), CurateError>;

    fn list_image_references(&self) -> Result<Vec<ImageReference>, CurateError>;

    /// Removes one membership row and drops its file from the owning series'
    /// record. A series left with fewer than two images is no longer a series.
    fn delete_image_reference(&mut self, image_id: i64) -> Result<(), CurateError>;

    /// Removes positive series that no longer own any image rows.
    fn delete_empty_series(&mut self) -> Result<usize, CurateError>;

    fn series_images(&self, series_id: i64) -> Result<Vec<SeriesImage>, CurateError>;

    fn append_analysis_log(&mut self, log: &AnalysisLog) -> Result<(), CurateError>;

    fn known_base_names(&self) -> Result<HashSet<String>, CurateError>;

    fn statistics(&self) -> Result<StoreStatistics, CurateError>;

    fn load_series_by_id(&self, id: i64) -> Result<Series, CurateError> {
        self.load_series(&SeriesFilter::by_id(id))?
            .into_iter()
            .next()
            .ok_or(CurateError::SeriesNotFound(id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub missing: usize,
    pub removed: usize,
    pub empty_series_removed: usize,
}

/// Drops references to files that no longer exist. A series whose images are
/// all gone is deleted outright; one left with a single image stops being a
/// series. Each removal is its own transaction, so an interrupted sweep can
/// simply be run again.
pub fn sweep_missing_files<S, F>(store: &mut S, exists: F) -> Result<SweepReport, CurateError>
where
    S: CurationStore + ?Sized,
    F: Fn(&Utf8Path) -> bool,
{
    let mut report = SweepReport::default();
    let mut by_series: BTreeMap<i64, (usize, Vec<i64>)> = BTreeMap::new();
    for reference in store.list_image_references()? {
        report.checked += 1;
        let (total, missing) = by_series.entry(reference.series_id).or_default();
        *total += 1;
        if !exists(&reference.path) {
            missing.push(reference.id);
        }
    }

    for (series_id, (total, missing)) in by_series {
        if missing.is_empty() {
            continue;
        }
        report.missing += missing.len();
        if missing.len() == total {
            match store.delete_series(series_id) {
                Ok(()) => {
                    report.removed += missing.len();
                    report.empty_series_removed += 1;
                }
                Err(CurateError::SeriesNotFound(_)) => {}
                Err(err) => return Err(err),
            }
            continue;
        }
        for image_id in missing {
            match store.delete_image_reference(image_id) {
                Ok(()) => report.removed += 1,
                Err(CurateError::ImageReferenceNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }
    report.empty_series_removed += store.delete_empty_series()?;
    if report.missing > 0 || report.empty_series_removed > 0 {
        info!(
            "sweep removed {} missing image(s) and {} empty series",
            report.removed, report.empty_series_removed
        );
    }
    Ok(report)
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS series (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        base_name       TEXT NOT NULL,
        directory       TEXT NOT NULL,
        is_series       INTEGER NOT NULL,
        raw_response    TEXT NOT NULL DEFAULT '',
        classification  TEXT NOT NULL,
        caption         TEXT NOT NULL DEFAULT '',
        member_count    INTEGER NOT NULL DEFAULT 0,
        candidate_count INTEGER NOT NULL DEFAULT 0,
        members         TEXT NOT NULL DEFAULT '[]',
        token_usage     INTEGER,
        created_at      TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS series_images (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        series_id       INTEGER NOT NULL REFERENCES series(id) ON DELETE CASCADE,
        image_path      TEXT NOT NULL,
        order_in_series INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS analysis_log (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        directory       TEXT NOT NULL,
        total_images    INTEGER NOT NULL,
        total_series    INTEGER NOT NULL,
        processed_at    TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_series_images_series_id ON series_images(series_id);
    CREATE INDEX IF NOT EXISTS idx_series_base_name ON series(base_name);
";

const SERIES_COLUMNS: &str = "id, base_name, directory, is_series, raw_response, classification, \
     caption, member_count, candidate_count, members, token_usage, created_at";

/// SQLite-backed curation store.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates the database file.
    pub fn open(path: &Utf8Path) -> Result<Self, CurateError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| CurateError::Filesystem(format!("create {parent}: {err}")))?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Opens a database that must already exist (read-side commands).
    pub fn open_existing(path: &Utf8Path) -> Result<Self, CurateError> {
        if !path.exists() {
            return Err(CurateError::DatabaseNotFound(path.as_std_path().to_path_buf()));
        }
        Self::open(path)
    }

    pub fn open_in_memory() -> Result<Self, CurateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CurateError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

struct SeriesRow {
    id: i64,
    base_name: String,
    directory: String,
    is_series: bool,
    raw_response: String,
    classification: String,
    caption: String,
    member_count: i64,
    candidate_count: i64,
    members: String,
    token_usage: Option<i64>,
    created_at: String,
}

impl SeriesRow {
    fn into_series(self) -> Result<Series, CurateError> {
        let classification: ClassificationResult = serde_json::from_str(&self.classification)
            .map_err(|err| {
                CurateError::Store(format!("series {} has an unreadable classification: {err}", self.id))
            })?;
        let members: Vec<Utf8PathBuf> = serde_json::from_str(&self.members).map_err(|err| {
            CurateError::Store(format!("series {} has an unreadable member list: {err}", self.id))
        })?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|value| value.with_timezone(&Utc))
            .map_err(|err| CurateError::Store(format!("series {} timestamp: {err}", self.id)))?;
        Ok(Series {
            id: self.id,
            base_name: self.base_name,
            source_directory: Utf8PathBuf::from(self.directory),
            is_series: self.is_series,
            raw_response: self.raw_response,
            classification,
            caption: self.caption,
            member_count: self.member_count.max(0) as usize,
            candidate_count: self.candidate_count.max(0) as usize,
            members,
            token_usage: self.token_usage.map(|value| value.max(0) as u64),
            created_at,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CurateError> {
    serde_json::to_string(value).map_err(|err| CurateError::Serialization(err.to_string()))
}

/// Replaces the membership rows of a series with the included images of `result`.
fn write_membership(
    tx: &Transaction<'_>,
    series_id: i64,
    result: &ClassificationResult,
    resolve: impl Fn(&str) -> Utf8PathBuf,
) -> Result<(), CurateError> {
    tx.execute(
        "DELETE FROM series_images WHERE series_id = ?1",
        params![series_id],
    )?;
    if !result.is_series {
        return Ok(());
    }
    let mut insert = tx.prepare(
        "INSERT INTO series_images (series_id, image_path, order_in_series) VALUES (?1, ?2, ?3)",
    )?;
    for image in result.included_in_order() {
        let path = resolve(&image.path);
        insert.execute(params![series_id, path.as_str(), image.order])?;
    }
    Ok(())
}

impl CurationStore for SqliteStore {
    fn create_series(
        &mut self,
        candidate: &CandidateSequence,
        outcome: &ClassificationOutcome,
    ) -> Result<i64, CurateError> {
        let result = &outcome.result;
        let source_directory = candidate.source_directory();
        let classification = to_json(result)?;
        let members = to_json(&candidate.members())?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO series (base_name, directory, is_series, raw_response, classification,
                                 caption, member_count, candidate_count, members, token_usage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                candidate.base_name(),
                source_directory.as_str(),
                result.is_series,
                outcome.raw_response,
                classification,
                result.caption,
                result.member_count() as i64,
                candidate.len() as i64,
                members,
                outcome.usage.map(|usage| usage.total_tokens as i64),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let series_id = tx.last_insert_rowid();
        write_membership(&tx, series_id, result, |file_name| {
            candidate
                .resolve(file_name)
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| source_directory.join(file_name))
        })?;
        tx.commit()?;

        debug!("stored series {series_id} ({})", candidate.base_name());
        Ok(series_id)
    }

    fn load_series(&self, filter: &SeriesFilter) -> Result<Vec<Series>, CurateError> {
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series
             WHERE (?1 IS NULL OR id = ?1)
               AND (?2 IS NULL OR base_name = ?2)
               AND (?3 = 0 OR is_series = 1)
             ORDER BY {}
             LIMIT ?4",
            filter.order.sql()
        );
        let limit = filter.limit.map(|limit| limit as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.id, filter.base_name, filter.confirmed_only, limit],
                |row| {
                    Ok(SeriesRow {
                        id: row.get(0)?,
                        base_name: row.get(1)?,
                        directory: row.get(2)?,
                        is_series: row.get(3)?,
                        raw_response: row.get(4)?,
                        classification: row.get(5)?,
                        caption: row.get(6)?,
                        member_count: row.get(7)?,
                        candidate_count: row.get(8)?,
                        members: row.get(9)?,
                        token_usage: row.get(10)?,
                        created_at: row.get(11)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(SeriesRow::into_series).collect()
    }

    fn update_series_classification(
        &mut self,
        id: i64,
        result: &ClassificationResult,
    ) -> Result<(), CurateError> {
        let classification = to_json(result)?;
        let tx = self.conn.transaction()?;

        let located: Option<(String, String)> = tx
            .query_row(
                "SELECT directory, members FROM series WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (directory, members) = located.ok_or(CurateError::SeriesNotFound(id))?;
        let members: Vec<Utf8PathBuf> = serde_json::from_str(&members)
            .map_err(|err| CurateError::Store(format!("series {id} member list: {err}")))?;
        let directory = Utf8PathBuf::from(directory);

        tx.execute(
            "UPDATE series
             SET classification = ?1, is_series = ?2, caption = ?3, member_count = ?4
             WHERE id = ?5",
            params![
                classification,
                result.is_series,
                result.caption,
                result.member_count() as i64,
                id
            ],
        )?;
        write_membership(&tx, id, result, |file_name| {
            members
                .iter()
                .find(|path| file_name_of(path) == file_name)
                .cloned()
                .unwrap_or_else(|| directory.join(file_name))
        })?;
        tx.commit()?;

        debug!("updated classification of series {id}");
        Ok(())
    }

    fn delete_series(&mut self, id: i64) -> Result<(), CurateError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM series_images WHERE series_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM series WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(CurateError::SeriesNotFound(id));
        }
        tx.commit()?;
        debug!("deleted series {id}");
        Ok(())
    }

    fn list_image_references(&self) -> Result<Vec<ImageReference>, CurateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, series_id, image_path FROM series_images ORDER BY id")?;
        let references = stmt
            .query_map([], |row| {
                Ok(ImageReference {
                    id: row.get(0)?,
                    series_id: row.get(1)?,
                    path: Utf8PathBuf::from(row.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(references)
    }

    fn delete_image_reference(&mut self, image_id: i64) -> Result<(), CurateError> {
        let tx = self.conn.transaction()?;

        let located: Option<(i64, String)> = tx
            .query_row(
                "SELECT series_id, image_path FROM series_images WHERE id = ?1",
                params![image_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (series_id, image_path) = located.ok_or(CurateError::ImageReferenceNotFound(image_id))?;
        tx.execute("DELETE FROM series_images WHERE id = ?1", params![image_id])?;

        let stored: Option<(String, String)> = tx
            .query_row(
                "SELECT classification, members FROM series WHERE id = ?1",
                params![series_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((stored, members)) = stored {
            let mut result: ClassificationResult = serde_json::from_str(&stored)
                .map_err(|err| CurateError::Store(format!("series {series_id} classification: {err}")))?;
            let mut members: Vec<Utf8PathBuf> = serde_json::from_str(&members)
                .map_err(|err| CurateError::Store(format!("series {series_id} member list: {err}")))?;
            let removed = file_name_of(Utf8Path::new(&image_path)).to_string();
            result.included.retain(|image| image.path != removed);
            result.excluded.retain(|name| *name != removed);
            members.retain(|path| file_name_of(path) != removed);
            result.included.sort_by_key(|image| image.order);
            let renumbered: HashMap<String, u32> = result
                .included
                .iter_mut()
                .enumerate()
                .map(|(index, image)| {
                    image.order = index as u32 + 1;
                    (image.path.clone(), image.order)
                })
                .collect();

            if result.is_series && result.included.len() < 2 {
                result.is_series = false;
                result.reason = format!("{} (fewer than two images left on disk)", result.reason);
                tx.execute(
                    "DELETE FROM series_images WHERE series_id = ?1",
                    params![series_id],
                )?;
                info!("series {series_id} lost its second image; no longer a series");
            } else {
                let rows: Vec<(i64, String)> = {
                    let mut stmt =
                        tx.prepare("SELECT id, image_path FROM series_images WHERE series_id = ?1")?;
                    let rows = stmt
                        .query_map(params![series_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                for (row_id, path) in rows {
                    if let Some(order) = renumbered.get(file_name_of(Utf8Path::new(&path))) {
                        tx.execute(
                            "UPDATE series_images SET order_in_series = ?1 WHERE id = ?2",
                            params![order, row_id],
                        )?;
                    }
                }
            }

            tx.execute(
                "UPDATE series
                 SET classification = ?1, is_series = ?2, member_count = ?3, members = ?4
                 WHERE id = ?5",
                params![
                    to_json(&result)?,
                    result.is_series,
                    result.member_count() as i64,
                    to_json(&members)?,
                    series_id
                ],
            )?;
        }

        tx.commit()?;
        debug!("removed image reference {image_id} ({image_path})");
        Ok(())
    }

    fn delete_empty_series(&mut self) -> Result<usize, CurateError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM series
             WHERE is_series = 1
               AND id NOT IN (SELECT DISTINCT series_id FROM series_images)",
            [],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn series_images(&self, series_id: i64) -> Result<Vec<SeriesImage>, CurateError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, series_id, image_path, order_in_series
             FROM series_images
             WHERE series_id = ?1
             ORDER BY order_in_series, id",
        )?;
        let images = stmt
            .query_map(params![series_id], |row| {
                Ok(SeriesImage {
                    id: row.get(0)?,
                    series_id: row.get(1)?,
                    image_path: Utf8PathBuf::from(row.get::<_, String>(2)?),
                    order_in_series: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    fn append_analysis_log(&mut self, log: &AnalysisLog) -> Result<(), CurateError> {
        self.conn.execute(
            "INSERT INTO analysis_log (directory, total_images, total_series, processed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                log.directory,
                log.total_images as i64,
                log.total_series as i64,
                log.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn known_base_names(&self) -> Result<HashSet<String>, CurateError> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT base_name FROM series")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    fn statistics(&self) -> Result<StoreStatistics, CurateError> {
        let count = |sql: &str| -> Result<usize, CurateError> {
            let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value.max(0) as usize)
        };
        let total_series = count("SELECT COUNT(*) FROM series")?;
        let confirmed_series = count("SELECT COUNT(*) FROM series WHERE is_series = 1")?;
        let total_images = count("SELECT COUNT(*) FROM series_images")?;
        let average_images_per_series: Option<f64> = self.conn.query_row(
            "SELECT AVG(member_count) FROM series WHERE is_series = 1",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT member_count, COUNT(*) FROM series
             WHERE is_series = 1
             GROUP BY member_count
             ORDER BY member_count",
        )?;
        let size_distribution = stmt
            .query_map([], |row| {
                Ok(SizeBucket {
                    member_count: row.get::<_, i64>(0)?.max(0) as usize,
                    series: row.get::<_, i64>(1)?.max(0) as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStatistics {
            total_series,
            confirmed_series,
            total_images,
            average_images_per_series,
            size_distribution,
        })
    }
}
