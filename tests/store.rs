use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;

use series_curator::classifier::ClassificationOutcome;
use series_curator::domain::{
    AnalysisLog, CandidateSequence, ClassificationResult, IncludedImage, TokenUsage,
};
use series_curator::error::CurateError;
use series_curator::store::{
    CurationStore, SeriesFilter, SeriesOrder, SqliteStore, SweepReport, sweep_missing_files,
};

fn candidate_in(dir: &Utf8Path, base: &str, count: usize) -> CandidateSequence {
    let members = (1..=count)
        .map(|index| dir.join(format!("{base}_{index:02}.jpg")))
        .collect();
    CandidateSequence::new(base, members).unwrap()
}

fn outcome(included: &[(&str, u32)], excluded: &[&str]) -> ClassificationOutcome {
    let mut result = ClassificationResult::rejected("because");
    result.is_series = included.len() >= 2;
    result.included = included
        .iter()
        .map(|(path, order)| IncludedImage {
            path: path.to_string(),
            order: *order,
        })
        .collect();
    result.excluded = excluded.iter().map(|name| name.to_string()).collect();
    result.caption = "sequence of photos showing a test".to_string();
    result.confidence = 0.9;
    ClassificationOutcome {
        raw_response: "{\"is_series\": true}".to_string(),
        result,
        usage: Some(TokenUsage {
            prompt_tokens: Some(100),
            response_tokens: Some(20),
            total_tokens: 120,
        }),
        skipped_images: 0,
    }
}

fn rows(store: &SqliteStore, series_id: i64) -> Vec<(String, u32)> {
    store
        .series_images(series_id)
        .unwrap()
        .into_iter()
        .map(|image| (image.image_path.file_name().unwrap().to_string(), image.order_in_series))
        .collect()
}

#[test]
fn positive_result_persists_ordered_rows() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let candidate = candidate_in(Utf8Path::new("/p"), "a", 3);
    let id = store
        .create_series(&candidate, &outcome(&[("a_02.jpg", 1), ("a_01.jpg", 2)], &["a_03.jpg"]))
        .unwrap();

    assert_eq!(
        rows(&store, id),
        [("a_02.jpg".to_string(), 1), ("a_01.jpg".to_string(), 2)]
    );
    let images = store.series_images(id).unwrap();
    assert_eq!(images[0].image_path, Utf8PathBuf::from("/p/a_02.jpg"));

    let series = store.load_series_by_id(id).unwrap();
    assert!(series.is_series);
    assert_eq!(series.member_count, 2);
    assert_eq!(series.candidate_count, 3);
    assert_eq!(series.token_usage, Some(120));
    assert_eq!(series.classification.excluded, ["a_03.jpg"]);
    assert_eq!(series.source_directory, Utf8PathBuf::from("/p"));
    assert_eq!(series.resolve_member("a_03.jpg"), Utf8PathBuf::from("/p/a_03.jpg"));
}

#[test]
fn rejected_result_stores_no_rows() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let candidate = candidate_in(Utf8Path::new("/p"), "b", 2);
    let id = store.create_series(&candidate, &outcome(&[], &[])).unwrap();

    assert!(store.series_images(id).unwrap().is_empty());
    let series = store.load_series_by_id(id).unwrap();
    assert!(!series.is_series);
    assert_eq!(series.member_count, 0);
}

#[test]
fn update_rewrites_rows_and_member_count() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let candidate = candidate_in(Utf8Path::new("/p"), "a", 3);
    let id = store
        .create_series(&candidate, &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2)], &["a_03.jpg"]))
        .unwrap();

    let mut edited = store.load_series_by_id(id).unwrap().classification;
    edited.included = vec![
        IncludedImage { path: "a_03.jpg".into(), order: 1 },
        IncludedImage { path: "a_01.jpg".into(), order: 2 },
        IncludedImage { path: "a_02.jpg".into(), order: 3 },
    ];
    edited.excluded.clear();
    store.update_series_classification(id, &edited).unwrap();

    assert_eq!(
        rows(&store, id),
        [
            ("a_03.jpg".to_string(), 1),
            ("a_01.jpg".to_string(), 2),
            ("a_02.jpg".to_string(), 3)
        ]
    );
    let series = store.load_series_by_id(id).unwrap();
    assert_eq!(series.member_count, 3);
    assert_eq!(series.classification, edited);

    assert_matches!(
        store.update_series_classification(999, &edited),
        Err(CurateError::SeriesNotFound(999))
    );
}

#[test]
fn deleting_a_series_removes_its_images() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let first = store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "a", 2),
            &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2)], &[]),
        )
        .unwrap();
    let second = store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "b", 2),
            &outcome(&[("b_01.jpg", 1), ("b_02.jpg", 2)], &[]),
        )
        .unwrap();

    store.delete_series(first).unwrap();
    let references = store.list_image_references().unwrap();
    assert_eq!(references.len(), 2);
    assert!(references.iter().all(|reference| reference.series_id == second));
    assert_matches!(store.delete_series(first), Err(CurateError::SeriesNotFound(_)));
}

#[test]
fn removing_an_image_reference_updates_the_record() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let id = store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "a", 3),
            &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2), ("a_03.jpg", 3)], &[]),
        )
        .unwrap();
    let middle = store
        .series_images(id)
        .unwrap()
        .into_iter()
        .find(|image| image.order_in_series == 2)
        .unwrap();

    store.delete_image_reference(middle.id).unwrap();

    assert_eq!(
        rows(&store, id),
        [("a_01.jpg".to_string(), 1), ("a_03.jpg".to_string(), 2)]
    );
    let series = store.load_series_by_id(id).unwrap();
    assert_eq!(series.member_count, 2);
    assert!(!series.classification.is_included("a_02.jpg"));
    assert!(series.classification.has_legal_order());
    assert_matches!(
        store.delete_image_reference(middle.id),
        Err(CurateError::ImageReferenceNotFound(_))
    );
}

#[test]
fn empty_series_cleanup_only_touches_positive_series() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let mut hollow = outcome(&[], &[]);
    hollow.result.is_series = true;
    let positive = store
        .create_series(&candidate_in(Utf8Path::new("/p"), "a", 2), &hollow)
        .unwrap();
    let rejected = store
        .create_series(&candidate_in(Utf8Path::new("/p"), "b", 2), &outcome(&[], &[]))
        .unwrap();
    let kept = store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "c", 2),
            &outcome(&[("c_01.jpg", 1), ("c_02.jpg", 2)], &[]),
        )
        .unwrap();

    assert_eq!(store.delete_empty_series().unwrap(), 1);
    assert_matches!(store.load_series_by_id(positive), Err(CurateError::SeriesNotFound(_)));
    assert!(store.load_series_by_id(rejected).is_ok());
    assert!(store.load_series_by_id(kept).is_ok());
    assert_eq!(store.delete_empty_series().unwrap(), 0);
}

#[test]
fn losing_the_second_image_demotes_the_series() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let id = store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "a", 3),
            &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2)], &["a_03.jpg"]),
        )
        .unwrap();

    let report = sweep_missing_files(&mut store, |path| path.file_name() != Some("a_02.jpg")).unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.empty_series_removed, 0);

    let series = store.load_series_by_id(id).unwrap();
    assert!(!series.is_series);
    assert!(!series.classification.is_series);
    assert_eq!(series.member_count, 1);
    assert!(series.members.iter().all(|path| path.file_name() != Some("a_02.jpg")));
    assert!(rows(&store, id).is_empty());
    assert!(store.load_series(&SeriesFilter::confirmed()).unwrap().is_empty());

    let again = sweep_missing_files(&mut store, |path| path.file_name() != Some("a_02.jpg")).unwrap();
    assert_eq!(again, SweepReport::default());
    assert_eq!(store.load_series_by_id(id).unwrap(), series);
}

#[test]
fn sweep_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let kept = candidate_in(&dir, "keep", 2);
    let gone = candidate_in(&dir, "gone", 2);
    for path in kept.members().iter().chain(gone.members()) {
        fs::write(path, b"x").unwrap();
    }
    store
        .create_series(&kept, &outcome(&[("keep_01.jpg", 1), ("keep_02.jpg", 2)], &[]))
        .unwrap();
    store
        .create_series(&gone, &outcome(&[("gone_01.jpg", 1), ("gone_02.jpg", 2)], &[]))
        .unwrap();
    for path in gone.members() {
        fs::remove_file(path).unwrap();
    }

    let first = sweep_missing_files(&mut store, |path| path.exists()).unwrap();
    assert_eq!(first.checked, 4);
    assert_eq!(first.removed, 2);
    assert_eq!(first.empty_series_removed, 1);

    let second = sweep_missing_files(&mut store, |path| path.exists()).unwrap();
    assert_eq!(second.checked, 2);
    assert_eq!(second.removed, 0);
    assert_eq!(second.empty_series_removed, 0);
    assert_eq!(store.known_base_names().unwrap().len(), 1);
}

#[test]
fn filters_order_and_limit() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "small", 2),
            &outcome(&[("small_01.jpg", 1), ("small_02.jpg", 2)], &[]),
        )
        .unwrap();
    store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "big", 3),
            &outcome(&[("big_01.jpg", 1), ("big_02.jpg", 2), ("big_03.jpg", 3)], &[]),
        )
        .unwrap();
    store
        .create_series(&candidate_in(Utf8Path::new("/p"), "no", 2), &outcome(&[], &[]))
        .unwrap();

    let confirmed = store
        .load_series(&SeriesFilter::confirmed().with_order(SeriesOrder::MemberCountDesc))
        .unwrap();
    let names = confirmed.iter().map(|series| series.base_name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["big", "small"]);

    let all = store.load_series(&SeriesFilter::all().with_order(SeriesOrder::Id)).unwrap();
    assert_eq!(all.len(), 3);
    let limited = store.load_series(&SeriesFilter::all().with_limit(1)).unwrap();
    assert_eq!(limited.len(), 1);
    let named = store.load_series(&SeriesFilter::by_base_name("no")).unwrap();
    assert_eq!(named.len(), 1);
    assert!(!named[0].is_series);

    let known = store.known_base_names().unwrap();
    assert!(known.contains("big") && known.contains("small") && known.contains("no"));
}

#[test]
fn statistics_cover_confirmed_series() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "a", 2),
            &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2)], &[]),
        )
        .unwrap();
    store
        .create_series(
            &candidate_in(Utf8Path::new("/p"), "b", 4),
            &outcome(&[("b_01.jpg", 1), ("b_02.jpg", 2), ("b_03.jpg", 3), ("b_04.jpg", 4)], &[]),
        )
        .unwrap();
    store
        .create_series(&candidate_in(Utf8Path::new("/p"), "c", 2), &outcome(&[], &[]))
        .unwrap();
    store
        .append_analysis_log(&AnalysisLog {
            directory: "/p".to_string(),
            total_images: 8,
            total_series: 2,
            timestamp: Utc::now(),
        })
        .unwrap();

    let stats = store.statistics().unwrap();
    assert_eq!(stats.total_series, 3);
    assert_eq!(stats.confirmed_series, 2);
    assert_eq!(stats.total_images, 6);
    assert_eq!(stats.average_images_per_series, Some(3.0));
    assert_eq!(stats.size_distribution.len(), 2);
    assert_eq!(stats.size_distribution[0].member_count, 2);
}

#[test]
fn file_database_survives_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/series.db")).unwrap();

    assert_matches!(SqliteStore::open_existing(&path), Err(CurateError::DatabaseNotFound(_)));

    {
        let mut store = SqliteStore::open(&path).unwrap();
        store
            .create_series(
                &candidate_in(Utf8Path::new("/p"), "a", 2),
                &outcome(&[("a_01.jpg", 1), ("a_02.jpg", 2)], &[]),
            )
            .unwrap();
    }

    let store = SqliteStore::open_existing(&path).unwrap();
    assert_eq!(store.load_series(&SeriesFilter::all()).unwrap().len(), 1);
    assert_eq!(store.list_image_references().unwrap().len(), 2);
}
