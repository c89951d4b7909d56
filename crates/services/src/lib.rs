#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Process-wide services (timers, cache) injected into components at
//! construction rather than reached for as globals, so tests can stand up
//! isolated instances side by side.

pub mod cache;
pub mod timer;

use std::sync::Arc;

pub use cache::CacheService;
pub use timer::TimerService;

/// A cheaply-clonable handle bundling every runtime service a component may
/// depend on. Constructed once by the connector and cloned into each
/// component's construction context.
#[derive(Clone, Default)]
pub struct RuntimeServices {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    timers: TimerService,
    cache: CacheService,
}

impl RuntimeServices {
    /// Builds a fresh set of services backed by the default in-memory
    /// implementations.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared timer registry.
    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    /// The shared cache registry.
    pub fn cache(&self) -> &CacheService {
        &self.inner.cache
    }

    /// Releases every timer and cache entry registered by `owner`. Call when
    /// a component instance stops.
    pub fn purge(&self, owner: &str) {
        self.inner.timers.purge(owner);
        self.inner.cache.purge(owner);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn purge_reaches_both_services() {
        let services = RuntimeServices::new();
        services.cache().add_data("k", serde_yaml::Value::Bool(true), None, None, "comp-a");
        services.purge("comp-a");
        assert_eq!(services.cache().get_data("k"), None);
    }

    #[test]
    fn clone_shares_state() {
        let services = RuntimeServices::new();
        let clone = services.clone();
        clone.cache().add_data("k", serde_yaml::Value::Bool(true), None, None, "comp-a");
        assert_eq!(services.cache().get_data("k"), Some(serde_yaml::Value::Bool(true)));
    }
}
