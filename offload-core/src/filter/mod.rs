//! Composable file predicates: size/time/attribute checks and extension
//! routing, combined with short-circuiting `and`/`or`/`negate`.

mod basic;
mod suffix;

pub use basic::BasicFilter;
pub use suffix::{SuffixFilter, extension_of, preset_extensions};

use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;

use offload_config::SettingsRegistry;

/// A predicate over a path and its (symlink-aware) metadata.
pub trait FileFilter: Send + Sync {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool;
}

impl<F: FileFilter + ?Sized> FileFilter for Arc<F> {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        (**self).matches(path, meta)
    }
}

impl<F: FileFilter + ?Sized> FileFilter for Box<F> {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        (**self).matches(path, meta)
    }
}

/// Short-circuiting conjunction.
#[derive(Debug)]
pub struct And<A, B>(A, B);

impl<A: FileFilter, B: FileFilter> FileFilter for And<A, B> {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        self.0.matches(path, meta) && self.1.matches(path, meta)
    }
}

/// Short-circuiting disjunction.
#[derive(Debug)]
pub struct Or<A, B>(A, B);

impl<A: FileFilter, B: FileFilter> FileFilter for Or<A, B> {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        self.0.matches(path, meta) || self.1.matches(path, meta)
    }
}

/// Logical complement.
#[derive(Debug)]
pub struct Not<F>(F);

impl<F: FileFilter> FileFilter for Not<F> {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        !self.0.matches(path, meta)
    }
}

/// Combinators available on every filter.
pub trait FileFilterExt: FileFilter + Sized {
    fn and<B: FileFilter>(self, other: B) -> And<Self, B> {
        And(self, other)
    }

    fn or<B: FileFilter>(self, other: B) -> Or<Self, B> {
        Or(self, other)
    }

    fn negate(self) -> Not<Self> {
        Not(self)
    }
}

impl<F: FileFilter + Sized> FileFilterExt for F {}

/// The default discovery pipeline: basic attribute checks, then the suffix
/// router.
pub fn default_chain(settings: Arc<SettingsRegistry>) -> Arc<dyn FileFilter> {
    Arc::new(BasicFilter::new(settings.clone()).and(SuffixFilter::new(settings)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Filter with a fixed verdict, for combinator tests.
    pub struct Always(pub bool);

    impl FileFilter for Always {
        fn matches(&self, _: &Path, _: &Metadata) -> bool {
            self.0
        }
    }

    pub fn some_metadata() -> Metadata {
        std::fs::metadata(std::env::temp_dir()).unwrap()
    }
}
