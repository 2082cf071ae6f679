use std::path::PathBuf;

use thiserror::Error;

use crate::callgraph::{CallGraph, CallSiteId};
use crate::report::CallGraphReport;

/// Failures that abort call graph construction.
#[derive(Debug, Error)]
pub(crate) enum BuildError {
    /// `partial` holds the graph built up to the offending call site.
    #[error("phantom reference to {missing_type} at {site} while phantom references are disallowed")]
    PhantomReference {
        site: CallSiteId,
        missing_type: String,
        partial: Box<CallGraph>,
    },
    /// The wall-clock budget ran out; `partial` holds what was built so far.
    #[error("call graph construction exceeded its time budget after {elapsed_ms} ms")]
    Timeout {
        elapsed_ms: u128,
        partial: Box<CallGraph>,
    },
}

impl BuildError {
    /// The graph as far as construction got before aborting.
    pub(crate) fn partial(&self) -> &CallGraph {
        match self {
            BuildError::PhantomReference { partial, .. } | BuildError::Timeout { partial, .. } => {
                partial
            }
        }
    }
}

/// Failure to write a finished report. The report stays available to the caller.
#[derive(Debug, Error)]
#[error("failed to write call graph to {}", target.display())]
pub(crate) struct OutputError {
    pub(crate) target: PathBuf,
    pub(crate) report: Box<CallGraphReport>,
    #[source]
    pub(crate) source: std::io::Error,
}
