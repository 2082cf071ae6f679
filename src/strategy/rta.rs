use std::collections::BTreeSet;

use tracing::trace;

use crate::callgraph::MethodId;
use crate::classpath::ProgramModel;
use crate::ir::Method;
use crate::register_strategy;
use crate::strategy::ResolutionStrategy;

/// Rapid-type analysis: only types with a reachable construction are possible
/// runtime types.
#[derive(Default)]
pub(crate) struct RtaStrategy {
    instantiated: BTreeSet<String>,
    generation: u64,
}

impl RtaStrategy {
    fn instantiate(&mut self, class_name: &str) {
        if self.instantiated.insert(class_name.to_string()) {
            trace!(class = class_name, "observed instantiation");
            self.generation += 1;
        }
    }
}

impl ResolutionStrategy for RtaStrategy {
    fn name(&self) -> &'static str {
        "RTA"
    }

    fn on_entry_point(&mut self, model: &ProgramModel, entry: &MethodId) {
        // A constructor used as a root is invoked by code outside the model.
        let is_constructor = model
            .method(&entry.class_name, &entry.name, &entry.descriptor)
            .is_some_and(Method::is_constructor);
        if is_constructor {
            self.instantiate(&entry.class_name);
        }
    }

    fn on_instantiation(&mut self, class_name: &str) {
        self.instantiate(class_name);
    }

    fn admits(&self, receiver: &str) -> bool {
        self.instantiated.contains(receiver)
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

register_strategy!(
    "RTA",
    "Rapid-type analysis restricted to constructed receiver types",
    RtaStrategy
);
