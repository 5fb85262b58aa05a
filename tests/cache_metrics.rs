mod common;

use std::collections::HashSet;
use std::sync::Arc;

use contextfit::application::cached_store::CachedTemplateStore;
use contextfit::application::optimizer::{OptimizerOptions, TemplateOptimizer};
use contextfit::application::repos::TemplateStore;
use contextfit::cache::{CacheConfig, CachePolicy, EngineCaches};
use contextfit::fingerprint::DEFAULT_RESOLUTIONS;
use contextfit::infra::db::SqliteTemplateStore;
use metrics_util::debugging::DebuggingRecorder;

use common::{fox_base, fox_text, unrelated_text};

#[tokio::test]
async fn engine_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // One tokenizer slot forces evictions across resolutions.
    let config = CacheConfig {
        tokenizer: CachePolicy::new(1, 60),
        ..CacheConfig::default()
    };
    let caches = Arc::new(EngineCaches::new(&config));

    let dir = tempfile::tempdir().expect("temp dir");
    let raw = SqliteTemplateStore::open(&dir.path().join("metrics.db"), 2, &DEFAULT_RESOLUTIONS)
        .await
        .expect("store");
    let store: Arc<dyn TemplateStore> =
        Arc::new(CachedTemplateStore::new(Arc::new(raw), Arc::clone(&caches)));
    let optimizer = TemplateOptimizer::new(store, caches, OptimizerOptions::default());

    optimizer
        .learn_template(&fox_base(), 2048, None)
        .await
        .expect("learn");
    for text in [fox_text(), fox_text(), unrelated_text()] {
        optimizer
            .find_matching_template(&text)
            .await
            .expect("match");
    }
    optimizer.store().close().await;

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "contextfit_cache_hit_total",
        "contextfit_cache_miss_total",
        "contextfit_cache_evict_total",
        "contextfit_match_total",
        "contextfit_match_ms",
        "contextfit_fingerprint_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let outcomes: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == "contextfit_match_total")
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    for outcome in ["hit", "miss", "cached"] {
        assert!(outcomes.contains(outcome), "missing outcome: {outcome}");
    }

    let evicted_caches: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| {
            composite_key.key().name() == "contextfit_cache_evict_total"
        })
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "cache")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(evicted_caches.contains("tokenizer"));
}
