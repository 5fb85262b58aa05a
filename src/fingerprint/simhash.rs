//! Word shingling and 64-bit weighted-majority SimHash.

use once_cell::sync::Lazy;
use regex::Regex;
use xxhash_rust::xxh64::xxh64;

use crate::domain::FINGERPRINT_BITS;

/// Tokens per shingle.
pub const SHINGLE_SIZE: usize = 3;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word pattern is valid"));

/// Lowercased word tokens of `text`, at most `max_tokens` of them.
pub fn tokenize(text: &str, max_tokens: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    WORD.find_iter(&lowered)
        .take(max_tokens)
        .map(|token| token.as_str().to_string())
        .collect()
}

/// Overlapping [`SHINGLE_SIZE`]-token shingles over the first `max_tokens` tokens.
///
/// A text with one or two tokens yields a single shingle of all of them.
pub fn tokenize_and_shingle(text: &str, max_tokens: usize) -> Vec<String> {
    let tokens = tokenize(text, max_tokens);
    shingles(&tokens)
}

pub fn shingles(tokens: &[String]) -> Vec<String> {
    match tokens.len() {
        0 => Vec::new(),
        len if len < SHINGLE_SIZE => vec![tokens.join(" ")],
        _ => tokens
            .windows(SHINGLE_SIZE)
            .map(|window| window.join(" "))
            .collect(),
    }
}

/// Fold shingle hashes into one fingerprint of `bits` width (at most 64).
///
/// Bit `i` is set when at least as many shingles set it as clear it, so an empty shingle
/// list yields all ones within the width.
pub fn compute_fingerprint<S: AsRef<str>>(shingles: &[S], bits: u32) -> u64 {
    let bits = bits.clamp(1, FINGERPRINT_BITS) as usize;
    let mut votes = [0i32; FINGERPRINT_BITS as usize];

    for shingle in shingles {
        let hash = xxh64(shingle.as_ref().as_bytes(), 0);
        for (bit, vote) in votes.iter_mut().take(bits).enumerate() {
            if (hash >> bit) & 1 == 1 {
                *vote += 1;
            } else {
                *vote -= 1;
            }
        }
    }

    votes
        .iter()
        .take(bits)
        .enumerate()
        .filter(|(_, vote)| **vote >= 0)
        .fold(0u64, |fingerprint, (bit, _)| fingerprint | (1u64 << bit))
}

/// Number of differing bits.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `1 - distance / 64`, in `[0, 1]`.
pub fn similarity(a: u64, b: u64) -> f64 {
    score_for_distance(hamming_distance(a, b))
}

pub fn score_for_distance(distance: u32) -> f64 {
    1.0 - f64::from(distance.min(FINGERPRINT_BITS)) / f64::from(FINGERPRINT_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOX: &str = "the quick brown fox jumps over the lazy dog ";

    #[test]
    fn tokenizer_lowercases_and_truncates() {
        let tokens = tokenize("Hello, WORLD! foo_bar 42", 3);
        assert_eq!(tokens, vec!["hello", "world", "foo_bar"]);
    }

    #[test]
    fn shingles_overlap_by_two_tokens() {
        let shingles = tokenize_and_shingle("a b c d", 10);
        assert_eq!(shingles, vec!["a b c", "b c d"]);
    }

    #[test]
    fn short_text_forms_one_shingle() {
        assert_eq!(tokenize_and_shingle("Hi there", 64), vec!["hi there"]);
        assert_eq!(tokenize_and_shingle("hello", 64), vec!["hello"]);
        assert!(tokenize_and_shingle("  \n ", 64).is_empty());
    }

    #[test]
    fn hamming_is_zero_on_identity_and_symmetric() {
        for value in [0u64, 1, 0x1234, u64::MAX, 0xdead_beef_cafe_f00d] {
            assert_eq!(hamming_distance(value, value), 0);
            assert_eq!(similarity(value, value), 1.0);
        }
        assert_eq!(hamming_distance(0x1234, 0x1235), 1);
        assert_eq!(
            hamming_distance(0xff00, 0x0ff0),
            hamming_distance(0x0ff0, 0xff00)
        );
        assert_eq!(hamming_distance(0, u64::MAX), 64);
        assert_eq!(similarity(0, u64::MAX), 0.0);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let shingles = tokenize_and_shingle(&FOX.repeat(4), 128);
        assert_eq!(
            compute_fingerprint(&shingles, 64),
            compute_fingerprint(&shingles, 64)
        );
    }

    #[test]
    fn single_shingle_fingerprint_is_its_hash() {
        let fingerprint = compute_fingerprint(&["only one"], 64);
        assert_eq!(fingerprint, xxh64(b"only one", 0));
    }

    #[test]
    fn narrower_widths_stay_within_mask() {
        let shingles = tokenize_and_shingle(&FOX.repeat(2), 64);
        let fingerprint = compute_fingerprint(&shingles, 16);
        assert_eq!(fingerprint >> 16, 0);
    }

    #[test]
    fn one_inserted_word_stays_close() {
        let base = FOX.repeat(20);
        let mut words: Vec<&str> = base.split_whitespace().collect();
        words.insert(100, "suddenly");
        let edited = words.join(" ");

        let a = compute_fingerprint(&tokenize_and_shingle(&base, 128), 64);
        let b = compute_fingerprint(&tokenize_and_shingle(&edited, 128), 64);
        assert!(hamming_distance(a, b) <= 4, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn unrelated_texts_are_far_apart() {
        let a = compute_fingerprint(&tokenize_and_shingle(&FOX.repeat(20), 128), 64);
        let other = "select id from users where active order by created desc limit ten ";
        let b = compute_fingerprint(&tokenize_and_shingle(&other.repeat(15), 128), 64);
        assert!(hamming_distance(a, b) > 4, "distance {}", hamming_distance(a, b));
    }
}
