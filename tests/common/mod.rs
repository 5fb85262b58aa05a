#![allow(dead_code)]

use contextfit::application::repos::{
    RepoError, SaveTemplateParams, TemplateStore, UpdateTemplateParams,
};
use contextfit::domain::{Fingerprints, Resolution};

pub const RESOLUTIONS: [Resolution; 3] = [64, 128, 256];

/// Repeated pangram with one extra word inserted at token 100.
pub fn fox_text() -> String {
    let base = fox_base();
    let mut words: Vec<&str> = base.split_whitespace().collect();
    words.insert(100, "suddenly");
    words.join(" ")
}

pub fn fox_base() -> String {
    "the quick brown fox jumps over the lazy dog ".repeat(20)
}

pub fn unrelated_text() -> String {
    "invoice totals reconcile against quarterly ledger entries for audit ".repeat(20)
}

pub fn fingerprints(pairs: &[(Resolution, u64)]) -> Fingerprints {
    pairs.iter().copied().collect()
}

pub fn save(hash: &str, pairs: &[(Resolution, u64)], working_window: u32) -> SaveTemplateParams {
    SaveTemplateParams {
        template_hash: hash.to_string(),
        fingerprints: fingerprints(pairs),
        working_window,
        optimal_batch_size: 32,
    }
}

pub fn update(id: i64, observed_distance: u32, working_window: u32) -> UpdateTemplateParams {
    UpdateTemplateParams {
        id,
        observed_distance,
        working_window,
        optimal_batch_size: 16,
    }
}

/// FNV-1a of `prefix`, so fingerprints differ between runs sharing one database.
pub fn salt(prefix: &str) -> u64 {
    prefix.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Behaviour every backend must share. `prefix` keeps template hashes unique when the
/// database outlives the test.
pub async fn exercise_contract(store: &dyn TemplateStore, prefix: &str) {
    let hash = |name: &str| format!("{prefix}-{name}");
    let alpha_64 = salt(prefix);

    // Insert then read back.
    let id = store
        .save_template(save(&hash("alpha"), &[(64, alpha_64), (128, 0xfeed)], 2048))
        .await
        .expect("save alpha");
    let alpha = store
        .find_by_hash(&hash("alpha"))
        .await
        .expect("find alpha")
        .expect("alpha exists");
    assert_eq!(alpha.id, id);
    assert_eq!(alpha.working_window, 2048);
    assert_eq!(alpha.optimal_batch_size, 32);
    assert_eq!(alpha.observation_count, 0);
    assert_eq!(alpha.avg_distance, 0.0);
    assert_eq!(alpha.fingerprints.get(64), Some(alpha_64));
    assert_eq!(alpha.fingerprints.get(128), Some(0xfeed));
    assert!(!alpha.fingerprints.contains(256));

    // Upsert by hash keeps the id and fingerprints that were not resent.
    let again = store
        .save_template(save(&hash("alpha"), &[(256, 0xabc)], 4096))
        .await
        .expect("upsert alpha");
    assert_eq!(again, id);
    let alpha = store
        .find_by_hash(&hash("alpha"))
        .await
        .expect("find alpha")
        .expect("alpha exists");
    assert_eq!(alpha.working_window, 4096);
    assert_eq!(alpha.fingerprints.get(64), Some(alpha_64));
    assert_eq!(alpha.fingerprints.get(256), Some(0xabc));
    assert!(alpha.updated_at >= alpha.created_at);

    assert!(
        store
            .find_by_hash(&hash("missing"))
            .await
            .expect("lookup")
            .is_none()
    );

    // Reinforcement: missing ids are a no-op, existing ones average and gate the window.
    assert!(!store.update_template(update(i64::MAX, 1, 10)).await.expect("update"));
    assert!(store.update_template(update(id, 4, 4400)).await.expect("update"));
    assert!(store.update_template(update(id, 2, 6000)).await.expect("update"));
    let alpha = store
        .find_by_hash(&hash("alpha"))
        .await
        .expect("find alpha")
        .expect("alpha exists");
    assert_eq!(alpha.observation_count, 2);
    assert!((alpha.avg_distance - 3.0).abs() < 1e-9);
    assert_eq!(alpha.working_window, 6000, "46% change passes hysteresis");
    assert_eq!(alpha.optimal_batch_size, 16);

    assert!(store.update_template(update(id, 0, 6500)).await.expect("update"));
    let alpha = store
        .find_by_hash(&hash("alpha"))
        .await
        .expect("find alpha")
        .expect("alpha exists");
    assert_eq!(alpha.working_window, 6000, "8% change is held back");

    // Batches return ids in order and count only existing targets.
    let ids = store
        .batch_save_templates(vec![
            save(&hash("b1"), &[(64, 0x1)], 100),
            save(&hash("b2"), &[(64, 0x2)], 200),
            save(&hash("b3"), &[(128, 0x3)], 300),
        ])
        .await
        .expect("batch save");
    assert_eq!(ids.len(), 3);
    for (name, id) in ["b1", "b2", "b3"].iter().zip(&ids) {
        let template = store
            .find_by_hash(&hash(name))
            .await
            .expect("lookup")
            .expect("batch member exists");
        assert_eq!(template.id, *id);
    }
    let updated = store
        .batch_update_templates(vec![update(ids[0], 1, 100), update(i64::MAX, 1, 100)])
        .await
        .expect("batch update");
    assert_eq!(updated, 1);

    // One bad member rolls the whole batch back.
    let err = store
        .batch_save_templates(vec![
            save(&hash("r1"), &[(64, 0x10)], 100),
            save(&hash("r2"), &[(96, 0x11)], 100),
        ])
        .await
        .expect_err("96 has no column");
    assert!(matches!(err, RepoError::InvalidInput { .. }));
    assert!(
        store
            .find_by_hash(&hash("r1"))
            .await
            .expect("lookup")
            .is_none(),
        "partial batch must not persist"
    );

    // Listing skips templates with no fingerprints.
    store
        .save_template(save(&hash("bare"), &[], 100))
        .await
        .expect("save bare");
    let listed = store
        .get_all_with_fingerprints()
        .await
        .expect("listing");
    let listed_hashes: Vec<&str> = listed
        .iter()
        .map(|template| template.template_hash.as_str())
        .collect();
    assert!(listed_hashes.contains(&hash("alpha").as_str()));
    assert!(listed_hashes.contains(&hash("b3").as_str()));
    assert!(!listed_hashes.contains(&hash("bare").as_str()));

    // Exact fingerprint hits are found by every backend.
    let found = store
        .find_by_fingerprint(64, alpha_64, 3)
        .await
        .expect("lookup")
        .expect("exact hit");
    assert_eq!(found.id, id);

    let err = store
        .find_by_fingerprint(96, 0x1, 3)
        .await
        .expect_err("unknown resolution");
    assert!(matches!(err, RepoError::InvalidInput { .. }));
}

/// Near (non-identical) fingerprint lookups. Holds for exact-distance backends only.
pub async fn exercise_hamming_lookup(store: &dyn TemplateStore, prefix: &str) {
    let near_base = salt(prefix).rotate_left(17);
    store
        .save_template(save(&format!("{prefix}-near"), &[(128, near_base)], 512))
        .await
        .expect("save near");

    let two_bits_off = near_base ^ 0b101;
    let found = store
        .find_by_fingerprint(128, two_bits_off, 2)
        .await
        .expect("lookup")
        .expect("within threshold");
    assert_eq!(found.template_hash, format!("{prefix}-near"));

    assert!(
        store
            .find_by_fingerprint(128, two_bits_off, 1)
            .await
            .expect("lookup")
            .is_none(),
        "two bits away exceeds a threshold of one"
    );
}
