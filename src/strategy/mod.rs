use anyhow::Result;

use crate::callgraph::MethodId;
use crate::classpath::ProgramModel;

pub(crate) mod cha;
pub(crate) mod rta;

/// Policy deciding which receiver types take part in virtual dispatch.
///
/// The builder owns the worklist; a strategy only observes reachable code and
/// filters the concrete subtypes the hierarchy offers for each virtual call.
pub(crate) trait ResolutionStrategy {
    fn name(&self) -> &'static str;

    /// Called once for each entry point before the worklist starts.
    fn on_entry_point(&mut self, _model: &ProgramModel, _entry: &MethodId) {}

    /// Called for every construction in reachable code: a `new` instruction or
    /// a reflective instantiation of a known class.
    fn on_instantiation(&mut self, _class_name: &str) {}

    /// Whether a concrete receiver type is a possible runtime type.
    fn admits(&self, receiver: &str) -> bool;

    /// Counter bumped whenever `admits` may return true for more types than before.
    fn generation(&self) -> u64 {
        0
    }
}

/// Registered constructor for a resolution strategy.
pub(crate) struct StrategyFactory {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) build: fn() -> Box<dyn ResolutionStrategy>,
}

inventory::collect!(StrategyFactory);

/// Register a strategy under a name for lookup from the command line.
///
/// Usage: `register_strategy!("CHA", "description", ChaStrategy);`
#[macro_export]
macro_rules! register_strategy {
    ($name:literal, $description:literal, $strategy:ty) => {
        inventory::submit! {
            $crate::strategy::StrategyFactory {
                name: $name,
                description: $description,
                build: || Box::new(<$strategy>::default()),
            }
        }
    };
}

/// Registered strategies sorted by name.
pub(crate) fn registered_strategies() -> Vec<&'static StrategyFactory> {
    let mut factories: Vec<&'static StrategyFactory> =
        inventory::iter::<StrategyFactory>.into_iter().collect();
    factories.sort_by_key(|factory| factory.name);
    factories
}

/// Instantiate a strategy by case-insensitive name.
pub(crate) fn create_strategy(name: &str) -> Result<Box<dyn ResolutionStrategy>> {
    let factories = registered_strategies();
    if let Some(factory) = factories
        .iter()
        .find(|factory| factory.name.eq_ignore_ascii_case(name))
    {
        return Ok((factory.build)());
    }
    let available: Vec<&str> = factories.iter().map(|factory| factory.name).collect();
    anyhow::bail!(
        "unsupported call graph algorithm: {name} (available: {})",
        available.join(", ")
    )
}
