use rusqlite::Connection;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;

use crate::domain::Fingerprints;
use crate::fingerprint::hamming_distance;

/// Registers `hamming_distance(a, b)` over hex-encoded fingerprints.
///
/// Returns NULL when either argument is not hex text, so such rows never match a
/// `<= threshold` filter.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "hamming_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(hex_distance(text_arg(ctx, 0), text_arg(ctx, 1))),
    )
}

fn text_arg<'a>(ctx: &'a Context<'_>, index: usize) -> Option<&'a str> {
    match ctx.get_raw(index) {
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn hex_distance(a: Option<&str>, b: Option<&str>) -> Option<i64> {
    let a = Fingerprints::decode_hex(a?).ok()?;
    let b = Fingerprints::decode_hex(b?).ok()?;
    Some(i64::from(hamming_distance(a, b)))
}
