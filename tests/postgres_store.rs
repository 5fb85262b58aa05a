//! Store contract against a live Postgres.
//!
//! - Needs `CONTEXTFIT_TEST_DATABASE_URL` pointing at a database where the role may
//!   create the `pg_trgm` extension.
//! - Marked `#[ignore]`; run with `cargo test --test postgres_store -- --ignored`.
//! - Rows are left behind; every run uses a fresh hash prefix.

mod common;

use contextfit::application::repos::TemplateStore;
use contextfit::infra::db::{PostgresSimilarity, PostgresTemplateStore};
use time::OffsetDateTime;

use common::{RESOLUTIONS, exercise_contract, exercise_hamming_lookup, salt, save};

const DATABASE_URL_ENV: &str = "CONTEXTFIT_TEST_DATABASE_URL";

fn database_url() -> String {
    std::env::var(DATABASE_URL_ENV)
        .unwrap_or_else(|_| panic!("{DATABASE_URL_ENV} must be set for Postgres tests"))
}

fn unique_prefix(label: &str) -> String {
    format!("{label}-{}", OffsetDateTime::now_utc().unix_timestamp_nanos())
}

async fn connect(similarity: PostgresSimilarity) -> PostgresTemplateStore {
    PostgresTemplateStore::connect(&database_url(), 4, &RESOLUTIONS, similarity)
        .await
        .expect("connect to Postgres")
}

#[tokio::test]
#[ignore]
async fn bit_count_mode_satisfies_store_contract() {
    let store = connect(PostgresSimilarity::BitCount).await;
    let prefix = unique_prefix("pg-bits");
    exercise_contract(&store, &prefix).await;
    exercise_hamming_lookup(&store, &prefix).await;
    assert_eq!(store.backend(), "postgres");
    store.maintain().await.expect("analyze");
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn trigram_mode_satisfies_store_contract() {
    let store = connect(PostgresSimilarity::Trigram).await;
    let prefix = unique_prefix("pg-trgm");
    exercise_contract(&store, &prefix).await;
    exercise_hamming_lookup(&store, &prefix).await;
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn trigram_mode_finds_one_bit_neighbours() {
    let store = connect(PostgresSimilarity::Trigram).await;
    let prefix = unique_prefix("pg-trgm-bit");
    let stored = salt(&prefix).rotate_left(29);
    store
        .save_template(save(&format!("{prefix}-one-bit"), &[(64, stored)], 256))
        .await
        .expect("save");

    let flipped = stored ^ (1 << 40);
    let found = store
        .find_by_fingerprint(64, flipped, 1)
        .await
        .expect("lookup")
        .expect("one bit away is within threshold");
    assert_eq!(found.template_hash, format!("{prefix}-one-bit"));
    assert!(
        store
            .find_by_fingerprint(64, flipped, 0)
            .await
            .expect("lookup")
            .is_none(),
        "candidates are verified by exact distance"
    );
    store.close().await;
}

#[tokio::test]
#[ignore]
async fn schema_setup_tolerates_concurrent_connects() {
    let (first, second) = tokio::join!(
        connect(PostgresSimilarity::Trigram),
        connect(PostgresSimilarity::Trigram)
    );
    assert_eq!(first.resolutions(), second.resolutions());
    first.close().await;
    second.close().await;
}
