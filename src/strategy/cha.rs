use crate::register_strategy;
use crate::strategy::ResolutionStrategy;

/// Class-hierarchy analysis: every concrete subtype of the static receiver type
/// is a possible runtime type, whether or not it is ever constructed.
#[derive(Default)]
pub(crate) struct ChaStrategy;

impl ResolutionStrategy for ChaStrategy {
    fn name(&self) -> &'static str {
        "CHA"
    }

    fn admits(&self, _receiver: &str) -> bool {
        true
    }
}

register_strategy!(
    "CHA",
    "Class-hierarchy analysis over the full subtype closure",
    ChaStrategy
);
