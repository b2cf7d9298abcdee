//! Envelope identifier generation.
//!
//! IDs are minted the first time an envelope is marshaled. The default generator
//! produces UUIDv7 strings (time-ordered, random tail), rendered without hyphens.
//!
//! The generator is a process-wide hook so tests can swap in a deterministic
//! sequence:
//!
//! ```ignore
//! eventline_core::set_generator(|| "evt-1".to_string());
//! assert_eq!(eventline_core::next_id(), "evt-1");
//! eventline_core::reset_generator();
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

/// A replaceable ID generator.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

static GENERATOR: RwLock<Option<IdGenerator>> = RwLock::new(None);

/// Return a new unique ID using the installed generator.
pub fn next_id() -> String {
    let custom = GENERATOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match custom {
        Some(generate) => generate(),
        None => default_id(),
    }
}

/// The built-in generator: UUIDv7 in its 32-character simple form.
pub fn default_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Install a process-wide generator, replacing any previous one.
pub fn set_generator(generator: impl Fn() -> String + Send + Sync + 'static) {
    let mut slot = GENERATOR.write().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(Arc::new(generator));
}

/// Restore the built-in generator.
pub fn reset_generator() {
    let mut slot = GENERATOR.write().unwrap_or_else(PoisonError::into_inner);
    *slot = None;
}
