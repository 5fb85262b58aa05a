use std::path::Path;

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
    assert_eq!(settings.storage.sqlite_path, Path::new("data/contextfit.db"));
    assert_eq!(settings.storage.pool_size.get(), 5);
    assert_eq!(
        settings.storage.postgres_similarity,
        PostgresSimilarity::Trigram
    );
    assert_eq!(settings.matching.resolutions, vec![64, 128, 256, 512, 1024]);
    assert_eq!(settings.matching.thresholds, Thresholds::default());
    assert_eq!(settings.matching.early_termination, 0.95);
    assert!(settings.matching.adaptive);
    assert_eq!(settings.matching.max_workers.get(), 4);
    assert_eq!(settings.cache, CacheConfig::default());
    assert_eq!(settings.learning.safety_margin, 1.2);
    assert_eq!(settings.learning.default_batch_size.get(), 32);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.storage.pool_size = Some(2);
    raw.logging.level = Some("info".to_string());

    let overrides = GlobalOverrides {
        pool_size: Some(9),
        log_level: Some("debug".to_string()),
        sqlite_path: Some(PathBuf::from("/tmp/override.db")),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.storage.pool_size.get(), 9);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.storage.sqlite_path, Path::new("/tmp/override.db"));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn postgres_backend_requires_url() {
    let mut raw = RawSettings::default();
    raw.storage.backend = Some("postgres".to_string());
    raw.storage.postgres_url = Some("   ".to_string());

    let err = Settings::from_raw(raw.clone()).expect_err("missing url");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "storage.postgres_url",
            ..
        }
    ));

    raw.storage.postgres_url = Some("postgres://localhost/contextfit".to_string());
    raw.storage.postgres_similarity = Some("bit_count".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.storage.backend, StorageBackend::Postgres);
    assert_eq!(
        settings.storage.postgres_similarity,
        PostgresSimilarity::BitCount
    );
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.storage.backend = Some("mongodb".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "storage.backend",
            ..
        })
    ));
}

#[test]
fn zero_pool_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.storage.pool_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn resolutions_are_sorted_and_deduplicated() {
    let mut raw = RawSettings::default();
    raw.matching.resolutions = Some(vec![256, 64, 128, 64]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.matching.resolutions, vec![64, 128, 256]);
    assert_eq!(
        settings.matching.fingerprint_options().resolutions,
        vec![64, 128, 256]
    );
}

#[test]
fn every_resolution_needs_a_threshold() {
    let mut raw = RawSettings::default();
    raw.matching.resolutions = Some(vec![64, 96]);
    let err = Settings::from_raw(raw.clone()).expect_err("96 has no threshold");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "matching.thresholds",
            ..
        }
    ));

    raw.matching.thresholds = Some(BTreeMap::from([("96".to_string(), 5)]));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.matching.thresholds.get(96).expect("threshold"), 5);
    assert_eq!(settings.matching.thresholds.get(64).expect("threshold"), 3);
}

#[test]
fn threshold_overrides_are_validated() {
    let mut raw = RawSettings::default();
    raw.matching.thresholds = Some(BTreeMap::from([("64".to_string(), 65)]));
    assert!(Settings::from_raw(raw.clone()).is_err());

    raw.matching.thresholds = Some(BTreeMap::from([("sixty-four".to_string(), 3)]));
    assert!(Settings::from_raw(raw.clone()).is_err());

    raw.matching.thresholds = Some(BTreeMap::from([("64".to_string(), 1)]));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.matching.thresholds.get(64).expect("threshold"), 1);
}

#[test]
fn early_termination_must_be_a_fraction() {
    for value in [0.0, -0.5, 1.5, f64::NAN] {
        let mut raw = RawSettings::default();
        raw.matching.early_termination = Some(value);
        assert!(Settings::from_raw(raw).is_err(), "{value} accepted");
    }

    let mut raw = RawSettings::default();
    raw.matching.early_termination = Some(1.0);
    assert!(Settings::from_raw(raw).is_ok());
}

#[test]
fn safety_margin_below_one_is_rejected() {
    let mut raw = RawSettings::default();
    raw.learning.safety_margin = Some(0.9);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "learning.safety_margin",
            ..
        })
    ));
}

#[test]
fn cache_policies_merge_with_defaults() {
    let mut raw = RawSettings::default();
    raw.cache.matches.max_size = Some(64);
    raw.cache.query.ttl_seconds = Some(5);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.matches, CachePolicy::new(64, 1800));
    assert_eq!(settings.cache.query, CachePolicy::new(200, 5));
    assert_eq!(settings.cache.tokenizer, CachePolicy::new(500, 3600));

    let mut raw = RawSettings::default();
    raw.cache.fingerprint.max_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cache_ttl_has_an_upper_bound() {
    let mut raw = RawSettings::default();
    raw.cache.query.ttl_seconds = Some(u64::MAX);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "cache.query.ttl_seconds"),
        other => panic!("expected invalid ttl, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.cache.query.ttl_seconds = Some(MAX_TTL_SECONDS);
    let settings = Settings::from_raw(raw).expect("a year is accepted");
    assert_eq!(settings.cache.query.ttl_seconds, MAX_TTL_SECONDS);
}

#[test]
fn file_layer_is_deserialized() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("contextfit.toml");
    std::fs::write(
        &path,
        r#"
[storage]
sqlite_path = "/var/lib/contextfit/templates.db"
pool_size = 3

[matching]
resolutions = [64, 128]
adaptive = false

[matching.thresholds]
128 = 5

[cache.match]
max_size = 10
"#,
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "contextfit",
        "--config-file",
        path.to_str().expect("utf-8 path"),
        "init",
    ]);
    let settings = load(&args).expect("valid settings");

    assert_eq!(
        settings.storage.sqlite_path,
        Path::new("/var/lib/contextfit/templates.db")
    );
    assert_eq!(settings.storage.pool_size.get(), 3);
    assert_eq!(settings.matching.resolutions, vec![64, 128]);
    assert!(!settings.matching.adaptive);
    assert_eq!(settings.matching.thresholds.get(128).expect("threshold"), 5);
    assert_eq!(settings.cache.matches.max_size, 10);
}

#[test]
fn parse_learn_arguments() {
    let args = CliArgs::parse_from([
        "contextfit",
        "learn",
        "summarize this",
        "--working-window",
        "2048",
        "--batch-size",
        "8",
        "--backend",
        "sqlite",
    ]);

    assert_eq!(args.overrides.backend.as_deref(), Some("sqlite"));
    match args.command {
        Command::Learn(learn) => {
            assert_eq!(learn.text, "summarize this");
            assert_eq!(learn.working_window, 2048);
            assert_eq!(learn.batch_size, Some(8));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_observe_arguments() {
    let args = CliArgs::parse_from([
        "contextfit",
        "--log-json=true",
        "observe",
        "-",
        "--prompt-tokens",
        "900",
        "--completion-tokens",
        "100",
    ]);

    assert_eq!(args.overrides.log_json, Some(true));
    match args.command {
        Command::Observe(observe) => {
            assert_eq!(observe.text, "-");
            assert_eq!(observe.prompt_tokens, 900);
            assert_eq!(observe.completion_tokens, 100);
            assert_eq!(observe.batch_size, None);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_reinforce_arguments() {
    let args = CliArgs::parse_from([
        "contextfit",
        "reinforce",
        "--template-id",
        "7",
        "--distance",
        "2",
        "--working-window",
        "1024",
    ]);

    match args.command {
        Command::Reinforce(reinforce) => {
            assert_eq!(reinforce.template_id, 7);
            assert_eq!(reinforce.distance, 2);
            assert_eq!(reinforce.working_window, 1024);
        }
        _ => panic!("wrong command parsed"),
    }
}
