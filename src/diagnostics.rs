use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, warn};

use crate::callgraph::CallSiteId;
use crate::classpath::is_platform_class;

/// Recoverable problem found while resolving a call site.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Diagnostic {
    /// The declared target names a type, or inherits through a type, absent from the model.
    PhantomReference {
        site: CallSiteId,
        declared: String,
        missing_type: String,
    },
    /// The hierarchy is complete but no method matches the declared signature.
    UnresolvedTarget { site: CallSiteId, declared: String },
    /// The invocation form is not classified by the builder.
    UnsupportedInvocation { site: CallSiteId, declared: String },
    /// The declared target resolved but no receiver type yields a concrete method.
    NoDispatchTarget { site: CallSiteId, declared: String },
}

impl Diagnostic {
    pub(crate) fn site(&self) -> &CallSiteId {
        match self {
            Diagnostic::PhantomReference { site, .. }
            | Diagnostic::UnresolvedTarget { site, .. }
            | Diagnostic::UnsupportedInvocation { site, .. }
            | Diagnostic::NoDispatchTarget { site, .. } => site,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::PhantomReference {
                site,
                declared,
                missing_type,
            } => write!(f, "{site}: phantom type {missing_type} while resolving {declared}"),
            Diagnostic::UnresolvedTarget { site, declared } => {
                write!(f, "{site}: no method matches {declared}")
            }
            Diagnostic::UnsupportedInvocation { site, declared } => {
                write!(f, "{site}: unsupported invocation of {declared}")
            }
            Diagnostic::NoDispatchTarget { site, declared } => {
                write!(f, "{site}: no dispatch target for {declared}")
            }
        }
    }
}

/// Warnings accumulated during a run, reported once at the end.
#[derive(Clone, Debug, Default)]
pub(crate) struct Diagnostics {
    entries: BTreeSet<Diagnostic>,
}

impl Diagnostics {
    pub(crate) fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.insert(diagnostic);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub(crate) fn mentions_site(&self, site: &CallSiteId) -> bool {
        self.entries.iter().any(|entry| entry.site() == site)
    }

    /// Missing types with the number of call sites that ran into each.
    pub(crate) fn phantom_types(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            if let Diagnostic::PhantomReference { missing_type, .. } = entry {
                *counts.entry(missing_type.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Log every warning once. Phantom platform types are summarized per type
    /// because they show up at most call sites when no JDK is on the classpath.
    pub(crate) fn report(&self) {
        if self.entries.is_empty() {
            return;
        }
        for (missing_type, count) in self.phantom_types() {
            if is_platform_class(missing_type) {
                warn!(missing_type, call_sites = count, "phantom platform type");
            }
        }
        for entry in self.iter() {
            match entry {
                Diagnostic::PhantomReference { missing_type, .. }
                    if is_platform_class(missing_type) =>
                {
                    debug!("{entry}");
                }
                _ => warn!("{entry}"),
            }
        }
        warn!(warnings = self.entries.len(), "call graph built with warnings");
    }
}
