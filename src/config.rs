use std::time::Duration;

use clap::ValueEnum;

/// How the roots of the call graph are chosen.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum EntryMode {
    /// `main` and the static initializer of one class, by internal name.
    MainClass(String),
    /// Every public method and static initializer of every analysis-target type.
    Library,
}

impl EntryMode {
    /// Interpret the main-class argument: empty or `-` selects library mode, and
    /// dotted names are converted to internal form.
    pub(crate) fn from_argument(argument: &str) -> Self {
        let trimmed = argument.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return EntryMode::Library;
        }
        EntryMode::MainClass(trimmed.replace('.', "/"))
    }
}

/// What to do when a call site references a type missing from the model.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum PhantomPolicy {
    #[default]
    Allow,
    Fail,
}

/// Options for one analysis run.
#[derive(Clone, Debug)]
pub(crate) struct AnalysisConfig {
    pub(crate) strategy: String,
    pub(crate) entry_mode: EntryMode,
    pub(crate) phantom_policy: PhantomPolicy,
    pub(crate) time_budget: Option<Duration>,
}
