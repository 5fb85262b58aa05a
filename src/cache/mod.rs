//! In-process caches for the fingerprinting and matching pipeline.
//!
//! All specializations share [`TtlLruCache`]: a bounded LRU map with per-entry expiry
//! behind one mutex. Faults inside a cache degrade to misses and never reach callers.
//!
//! | cache         | key                     | default size / TTL |
//! |---------------|-------------------------|--------------------|
//! | `tokenizer`   | text digest + budget    | 500 / 1h           |
//! | `fingerprint` | text digest             | 1000 / 1h          |
//! | `match`       | text digest             | 512 / 30m          |
//! | `query`       | store query parameters  | 200 / 60s          |
//! | `complexity`  | text digest             | 256 / 5m           |

mod config;
mod keys;
mod lock;
mod registry;
mod store;

pub use config::{CacheConfig, CachePolicy, MAX_TTL_SECONDS};
pub use keys::{CachedQuery, QueryKey, ShingleKey};
pub(crate) use lock::mutex_lock;
pub use registry::{CacheStatsReport, EngineCaches};
pub use store::{CacheStats, TtlLruCache};
