use camino::{Utf8Path, Utf8PathBuf};

use series_curator::domain::{CandidateSequence, IncludedImage};
use series_curator::normalize::{NO_STRUCTURED_BLOCK, apply_caption_rule, normalize_response};
use series_curator::request::{ClassificationRequest, RequestBuilder, RequestPolicy};

fn request(names: &[&str]) -> ClassificationRequest {
    let candidate = CandidateSequence::new(
        "a",
        names.iter().map(|name| Utf8PathBuf::from(format!("/p/{name}"))).collect(),
    )
    .unwrap();
    RequestBuilder::new(RequestPolicy::default())
        .build_with(&candidate, |path: &Utf8Path| Ok(path.as_str().as_bytes().to_vec()))
        .unwrap()
}

fn included(pairs: &[(&str, u32)]) -> Vec<IncludedImage> {
    pairs
        .iter()
        .map(|(path, order)| IncludedImage {
            path: path.to_string(),
            order: *order,
        })
        .collect()
}

#[test]
fn example_response_translates_back_to_filenames() {
    let request = request(&["a_01.jpg", "a_02.jpg", "a_03.jpg"]);
    let raw = r#"Here you go:
```json
{
  "is_series": true,
  "images": [{"path": "_02", "order": 1}, {"path": "_01", "order": 2}],
  "excluded_images": ["_03"],
  "series_caption": "woman walking along the river",
  "reason": "Found 2 of 3 images",
  "confidence": 0.85
}
```"#;
    let result = normalize_response(raw, &request.table);
    assert!(result.is_series);
    assert_eq!(result.included, included(&[("a_02.jpg", 1), ("a_01.jpg", 2)]));
    assert_eq!(result.excluded, ["a_03.jpg"]);
    assert_eq!(
        result.caption,
        "sequence of photos showing woman walking along the river"
    );
    assert_eq!(result.confidence, 0.85);
}

#[test]
fn identifier_round_trip_for_every_split() {
    let names = ["s_01.jpg", "s_02.jpg", "s_03.jpg", "s_04.jpg"];
    let request = request(&names);
    let ids = request.table.ids();

    // every subset by bitmask, included ones in reverse to exercise ordering
    for mask in 0u32..16 {
        let chosen = (0..4).filter(|bit| mask & (1 << bit) != 0).collect::<Vec<_>>();
        let rest = (0..4).filter(|bit| mask & (1 << bit) == 0).collect::<Vec<_>>();
        let images = chosen
            .iter()
            .rev()
            .enumerate()
            .map(|(order, index)| format!(r#"{{"path": "{}", "order": {}}}"#, ids[*index], order + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let excluded = rest
            .iter()
            .map(|index| format!("\"{}\"", ids[*index]))
            .collect::<Vec<_>>()
            .join(", ");
        let raw = format!(
            r#"{{"is_series": false, "images": [{images}], "excluded_images": [{excluded}]}}"#
        );

        let result = normalize_response(&raw, &request.table);
        let expected_included = chosen.iter().rev().map(|index| names[*index]).collect::<Vec<_>>();
        let expected_excluded = rest.iter().map(|index| names[*index]).collect::<Vec<_>>();
        let got_included = result
            .included_in_order()
            .into_iter()
            .map(|image| image.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(got_included, expected_included, "mask {mask}");
        assert_eq!(result.excluded, expected_excluded, "mask {mask}");
        assert!(result.has_legal_order());
    }
}

#[test]
fn text_without_braces_is_a_rejection() {
    let request = request(&["a_01.jpg", "a_02.jpg"]);
    let result = normalize_response("These images are unrelated.", &request.table);
    assert!(!result.is_series);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.reason, NO_STRUCTURED_BLOCK);
    assert!(result.included.is_empty());
}

#[test]
fn missing_excluded_list_defaults_to_empty() {
    let request = request(&["a_01.jpg", "a_02.jpg", "a_03.jpg"]);
    let result = normalize_response(
        r#"{"is_series": true, "images": [{"path": "_01", "order": 1}, {"path": "_02", "order": 2}]}"#,
        &request.table,
    );
    assert!(result.is_series);
    assert!(result.excluded.is_empty());
}

#[test]
fn invalid_json_is_a_parse_error_rejection() {
    let request = request(&["a_01.jpg", "a_02.jpg"]);
    let result = normalize_response("{\"is_series\": true, \"images\": [}", &request.table);
    assert!(!result.is_series);
    assert!(result.reason.starts_with("parse error: "));
}

#[test]
fn orders_are_repaired_to_a_strict_sequence() {
    let request = request(&["a_01.jpg", "a_02.jpg", "a_03.jpg", "a_04.jpg"]);
    let result = normalize_response(
        r#"{"is_series": true,
            "images": [{"path": "_03", "order": 7}, {"path": "_01", "order": 2},
                       {"path": "_03", "order": 9}, {"path": "_04"}],
            "excluded_images": ["_01", "_02", "_02"]}"#,
        &request.table,
    );
    assert_eq!(
        result.included,
        included(&[("a_01.jpg", 1), ("a_04.jpg", 2), ("a_03.jpg", 3)])
    );
    assert_eq!(result.excluded, ["a_02.jpg"]);
    assert!(result.has_legal_order());
}

#[test]
fn unknown_identifiers_are_dropped_and_small_series_demoted() {
    let request = request(&["a_01.jpg", "a_02.jpg"]);
    let result = normalize_response(
        r#"{"is_series": true, "images": [{"path": "_01", "order": 1}, {"path": "_77", "order": 2}],
            "reason": "two images"}"#,
        &request.table,
    );
    assert!(!result.is_series);
    assert_eq!(result.included, included(&[("a_01.jpg", 1)]));
    assert!(result.reason.starts_with("two images"));
}

#[test]
fn caption_rule_is_idempotent() {
    for caption in [
        "woman in a red coat crossing the street",
        "Man jogging at sunrise",
        "city lights from a rooftop",
        "Sequence of close-ups of a cat",
        "the influencer unboxing a parcel",
    ] {
        let once = apply_caption_rule(caption);
        assert_eq!(apply_caption_rule(&once), once);
    }
}

#[test]
fn caption_untouched_for_rejections() {
    let request = request(&["a_01.jpg", "a_02.jpg"]);
    let result = normalize_response(
        r#"{"is_series": false, "series_caption": "woman at a desk"}"#,
        &request.table,
    );
    assert_eq!(result.caption, "woman at a desk");
}

#[test]
fn demoted_series_keeps_its_raw_caption() {
    let request = request(&["a_01.jpg", "a_02.jpg"]);
    let result = normalize_response(
        r#"{"is_series": true, "images": ["_01"], "series_caption": "city lights from a rooftop"}"#,
        &request.table,
    );
    assert!(!result.is_series);
    assert_eq!(result.caption, "city lights from a rooftop");
}
