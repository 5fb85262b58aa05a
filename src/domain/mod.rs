pub mod error;
pub mod template;
pub mod text;

pub use error::DomainError;
pub use template::{
    DEFAULT_BATCH_SIZE, FINGERPRINT_BITS, Fingerprints, LearnedStats, Resolution, Template,
    TemplateId,
};
pub use text::TextDigest;
