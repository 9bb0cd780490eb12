use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use series_curator::config::{
    Config, ConfigLoader, DEFAULT_ENDPOINT, DEFAULT_MODEL, ResolvedConfig, api_key_from,
};
use series_curator::error::CurateError;

#[test]
fn config_file_overrides_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("curate.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "model": "gemini-2.5-pro",
            "database_path": "data/series.db",
            "max_images_for_series": 20,
            "request_timeout_secs": 30
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.model, "gemini-2.5-pro");
    assert_eq!(resolved.database_path, Utf8PathBuf::from("data/series.db"));
    assert_eq!(resolved.min_images_for_series, 2);
    assert_eq!(resolved.max_images_for_series, 20);
    assert_eq!(resolved.request_timeout, Duration::from_secs(30));
    assert_eq!(resolved.endpoint, DEFAULT_ENDPOINT);

    let settings = resolved.gemini_settings("key".to_string());
    assert_eq!(settings.model, "gemini-2.5-pro");
    assert_eq!(settings.max_retries, 2);
}

#[test]
fn defaults_match_documented_values() {
    let resolved = ResolvedConfig::default();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.model, DEFAULT_MODEL);
    assert_eq!(resolved.database_path, Utf8PathBuf::from("photo_series.db"));
    assert_eq!(resolved.min_images_for_series, 2);
    assert_eq!(resolved.max_images_for_series, 14);
    assert_eq!(resolved.request_timeout, Duration::from_secs(120));
}

#[test]
fn invalid_bounds_are_rejected() {
    let too_small = Config {
        min_images_for_series: Some(1),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(too_small),
        Err(CurateError::InvalidConfig(_))
    );

    let inverted = Config {
        min_images_for_series: Some(5),
        max_images_for_series: Some(4),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(inverted),
        Err(CurateError::InvalidConfig(_))
    );

    let no_timeout = Config {
        request_timeout_secs: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(no_timeout),
        Err(CurateError::InvalidConfig(_))
    );

    let future = Config {
        schema_version: Some(2),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(future),
        Err(CurateError::InvalidConfig(_))
    );
}

#[test]
fn unreadable_or_malformed_files_fail() {
    assert_matches!(
        ConfigLoader::resolve(Some("/no/such/curate.json")),
        Err(CurateError::ConfigRead(_))
    );

    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("curate.json");
    fs::write(&path, r#"{"modle": "typo"}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CurateError::ConfigParse(_))
    );
}

#[test]
fn api_key_precedence() {
    let env = |name: &str| match name {
        "GEMINI_API_KEY" => Some("gemini".to_string()),
        "GOOGLE_AI_API_KEY" => Some("google".to_string()),
        _ => None,
    };
    assert_eq!(api_key_from(Some("flag"), env).unwrap(), "flag");
    assert_eq!(api_key_from(None, env).unwrap(), "gemini");
    assert_eq!(
        api_key_from(None, |name: &str| (name == "GOOGLE_AI_API_KEY").then(|| "google".to_string()))
            .unwrap(),
        "google"
    );
    assert_matches!(api_key_from(None, |_: &str| None), Err(CurateError::MissingApiKey));
}
