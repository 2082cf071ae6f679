use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::config::{EntryMode, PhantomPolicy};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::BuildError;
use crate::hierarchy::{Resolution, TypeHierarchy};
use crate::ir::{CallKind, InstructionKind, InvokeRef, Method};
use crate::reflection::{ConstructorChoice, ReflectionTracker, ReflectiveEffect};
use crate::strategy::ResolutionStrategy;

/// Unique identifier for a method in the program model.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct MethodId {
    pub(crate) class_name: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Invocation location: the containing method and the instruction offset.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct CallSiteId {
    pub(crate) caller: MethodId,
    pub(crate) offset: u32,
}

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.caller, self.offset)
    }
}

/// A scanned call site and the targets resolved for it.
#[derive(Clone, Debug)]
pub(crate) struct CallSiteEntry {
    pub(crate) declared: InvokeRef,
    pub(crate) line: Option<u32>,
    pub(crate) targets: BTreeSet<MethodId>,
}

/// Result of call graph construction.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallGraph {
    pub(crate) strategy: &'static str,
    pub(crate) reachable: BTreeSet<MethodId>,
    /// Reachable methods in the order they were discovered.
    pub(crate) discovery_order: Vec<MethodId>,
    pub(crate) call_sites: BTreeMap<CallSiteId, CallSiteEntry>,
    pub(crate) diagnostics: Diagnostics,
}

impl CallGraph {
    /// Number of (call site, target) edges.
    pub(crate) fn edge_count(&self) -> usize {
        self.call_sites
            .values()
            .map(|entry| entry.targets.len())
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn targets_of(&self, caller: &MethodId, offset: u32) -> Option<&BTreeSet<MethodId>> {
        let site = CallSiteId {
            caller: caller.clone(),
            offset,
        };
        self.call_sites.get(&site).map(|entry| &entry.targets)
    }
}

/// Knobs for one call graph construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BuildOptions {
    pub(crate) phantom_policy: PhantomPolicy,
    pub(crate) time_budget: Option<Duration>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            phantom_policy: PhantomPolicy::Allow,
            time_budget: None,
        }
    }
}

/// Methods assumed reachable unconditionally for the given entry mode.
pub(crate) fn entry_points(hierarchy: &TypeHierarchy<'_>, mode: &EntryMode) -> Result<Vec<MethodId>> {
    let model = hierarchy.model();
    let mut entries = Vec::new();
    match mode {
        EntryMode::MainClass(name) => {
            let class = model
                .class(name)
                .with_context(|| format!("main class not found: {name}"))?;
            let main = class
                .find_method("main", "([Ljava/lang/String;)V")
                .filter(|method| method.access.is_static)
                .with_context(|| format!("no static main method in {name}"))?;
            entries.push(method_id(name, main));
            if let Some(initializer) = class.find_method("<clinit>", "()V") {
                entries.push(method_id(name, initializer));
            }
        }
        EntryMode::Library => {
            let mut public_types = 0usize;
            for class in model.classes().filter(|class| class.is_target) {
                if class.access.is_public {
                    public_types += 1;
                }
                for method in &class.methods {
                    if method.access.is_public || method.is_static_initializer() {
                        entries.push(method_id(&class.name, method));
                    }
                }
            }
            debug!(public_types, roots = entries.len(), "library mode entry points");
        }
    }
    Ok(entries)
}

/// Build a call graph by worklist reachability from `entries`.
pub(crate) fn build_call_graph(
    hierarchy: &TypeHierarchy<'_>,
    entries: &[MethodId],
    strategy: &mut dyn ResolutionStrategy,
    options: BuildOptions,
) -> Result<CallGraph, BuildError> {
    let builder = Builder {
        hierarchy,
        strategy,
        options,
        started_at: Instant::now(),
        graph: CallGraph::default(),
        worklist: VecDeque::new(),
        virtual_sites: Vec::new(),
        initialized: BTreeSet::new(),
    };
    builder.run(entries)
}

/// Reasons the worklist loop stops early.
enum Interrupt {
    Phantom(CallSiteId, String),
    OutOfTime,
}

/// Single owner of the reachable set while the fixed point is computed.
struct Builder<'h, 'a, 's> {
    hierarchy: &'h TypeHierarchy<'a>,
    strategy: &'s mut dyn ResolutionStrategy,
    options: BuildOptions,
    started_at: Instant,
    graph: CallGraph,
    worklist: VecDeque<MethodId>,
    virtual_sites: Vec<CallSiteId>,
    initialized: BTreeSet<String>,
}

impl Builder<'_, '_, '_> {
    fn run(mut self, entries: &[MethodId]) -> Result<CallGraph, BuildError> {
        self.graph.strategy = self.strategy.name();
        let model = self.hierarchy.model();
        for entry in entries {
            self.strategy.on_entry_point(model, entry);
            self.enqueue(entry);
        }

        match self.fixed_point() {
            Ok(()) => {}
            Err(Interrupt::Phantom(site, missing_type)) => {
                return Err(BuildError::PhantomReference {
                    site,
                    missing_type,
                    partial: Box::new(self.finish()),
                });
            }
            Err(Interrupt::OutOfTime) => {
                let elapsed_ms = self.started_at.elapsed().as_millis();
                return Err(BuildError::Timeout {
                    elapsed_ms,
                    partial: Box::new(self.finish()),
                });
            }
        }
        Ok(self.finish())
    }

    /// Drain the worklist, then re-resolve virtual sites whenever the strategy
    /// admitted new receiver types since the last pass.
    fn fixed_point(&mut self) -> Result<(), Interrupt> {
        let mut resolved_at = self.strategy.generation();
        loop {
            while let Some(method) = self.worklist.pop_front() {
                self.check_budget()?;
                self.process(&method)?;
            }
            let generation = self.strategy.generation();
            if generation == resolved_at {
                return Ok(());
            }
            resolved_at = generation;
            debug!(
                generation,
                sites = self.virtual_sites.len(),
                "re-resolving virtual call sites"
            );
            let sites = self.virtual_sites.clone();
            for site in &sites {
                self.check_budget()?;
                self.resolve_virtual(site)?;
            }
        }
    }

    fn check_budget(&self) -> Result<(), Interrupt> {
        match self.options.time_budget {
            Some(budget) if self.started_at.elapsed() >= budget => Err(Interrupt::OutOfTime),
            _ => Ok(()),
        }
    }

    fn enqueue(&mut self, method: &MethodId) {
        if self.graph.reachable.insert(method.clone()) {
            trace!(%method, "reachable");
            self.graph.discovery_order.push(method.clone());
            self.worklist.push_back(method.clone());
        }
    }

    fn process(&mut self, id: &MethodId) -> Result<(), Interrupt> {
        let model = self.hierarchy.model();
        let Some(class) = model.class(&id.class_name) else {
            return Ok(());
        };
        let Some(method) = class.find_method(&id.name, &id.descriptor) else {
            return Ok(());
        };
        let Some(body) = &method.body else {
            return Ok(());
        };
        let mut reflection = ReflectionTracker::default();
        for instruction in &body.instructions {
            match &instruction.kind {
                InstructionKind::Invoke(invoke) => {
                    self.process_call(id, method, instruction.offset, invoke)?;
                }
                InstructionKind::New { class_name } => {
                    self.strategy.on_instantiation(class_name);
                    self.initialize(class_name);
                }
                InstructionKind::StaticField { owner } => self.initialize(owner),
                InstructionKind::ConstString { .. }
                | InstructionKind::ConstClass { .. }
                | InstructionKind::Other { .. } => {}
            }
            if let Some(effect) = reflection.observe(&instruction.kind) {
                let site = CallSiteId {
                    caller: id.clone(),
                    offset: instruction.offset,
                };
                self.apply_reflection(&site, effect);
            }
        }
        Ok(())
    }

    /// A reflective call with a constant class argument behaves like the
    /// direct code it stands for: initialization, or construction with an
    /// edge from the `newInstance` site to the constructors it may run.
    fn apply_reflection(&mut self, site: &CallSiteId, effect: ReflectiveEffect) {
        let model = self.hierarchy.model();
        match effect {
            ReflectiveEffect::Initialize(class_name) => {
                trace!(%site, class = class_name, "reflective class initialization");
                self.initialize(&class_name);
            }
            ReflectiveEffect::Instantiate {
                class_name,
                constructors,
            } => {
                let Some(class) = model.class(&class_name).filter(|class| class.is_concrete())
                else {
                    debug!(%site, class = class_name, "reflective instantiation of unknown type");
                    return;
                };
                trace!(%site, class = class_name, "reflective instantiation");
                self.strategy.on_instantiation(&class_name);
                self.initialize(&class_name);
                for constructor in class.methods.iter().filter(|method| {
                    method.is_constructor()
                        && (constructors == ConstructorChoice::Any || method.descriptor == "()V")
                }) {
                    self.add_edge(site, method_id(&class.name, constructor));
                }
            }
        }
    }

    fn process_call(
        &mut self,
        caller: &MethodId,
        method: &Method,
        offset: u32,
        invoke: &InvokeRef,
    ) -> Result<(), Interrupt> {
        let site = CallSiteId {
            caller: caller.clone(),
            offset,
        };
        self.graph.call_sites.insert(
            site.clone(),
            CallSiteEntry {
                declared: invoke.clone(),
                line: method.line_for_offset(offset),
                targets: BTreeSet::new(),
            },
        );
        match invoke.kind {
            CallKind::Static | CallKind::Special => self.resolve_direct(&site, invoke),
            // An array is its own runtime type; it has no overriding subtypes.
            CallKind::Virtual | CallKind::Interface if invoke.array_receiver => {
                self.resolve_direct(&site, invoke)
            }
            CallKind::Virtual | CallKind::Interface => {
                self.virtual_sites.push(site.clone());
                self.resolve_virtual(&site)
            }
            CallKind::Dynamic => {
                self.graph.diagnostics.push(Diagnostic::UnsupportedInvocation {
                    site,
                    declared: declared_name(invoke),
                });
                Ok(())
            }
        }
    }

    /// Static and special invocations bind to exactly one method.
    fn resolve_direct(&mut self, site: &CallSiteId, invoke: &InvokeRef) -> Result<(), Interrupt> {
        match self
            .hierarchy
            .resolve_method(&invoke.owner, &invoke.name, &invoke.descriptor)
        {
            Resolution::Resolved(target) => {
                if invoke.kind == CallKind::Static {
                    self.initialize(&target.class_name);
                }
                self.add_edge(site, target);
                Ok(())
            }
            Resolution::Phantom(missing_type) => self.phantom(site, invoke, missing_type),
            Resolution::NotFound => {
                self.unresolved(site, invoke);
                Ok(())
            }
        }
    }

    /// Virtual and interface invocations bind to every admitted dispatch target.
    fn resolve_virtual(&mut self, site: &CallSiteId) -> Result<(), Interrupt> {
        let Some(invoke) = self
            .graph
            .call_sites
            .get(site)
            .map(|entry| entry.declared.clone())
        else {
            return Ok(());
        };
        match self
            .hierarchy
            .resolve_method(&invoke.owner, &invoke.name, &invoke.descriptor)
        {
            Resolution::Resolved(target) => {
                let model = self.hierarchy.model();
                let is_private = model
                    .method(&target.class_name, &target.name, &target.descriptor)
                    .is_some_and(|method| method.access.is_private);
                if is_private {
                    self.add_edge(site, target);
                    return Ok(());
                }
            }
            // Subtypes present in the model still contribute partial targets.
            Resolution::Phantom(missing_type) => self.phantom(site, &invoke, missing_type)?,
            Resolution::NotFound => {
                self.unresolved(site, &invoke);
                return Ok(());
            }
        }

        let strategy = &*self.strategy;
        let targets = self.hierarchy.dispatch_candidates(
            &invoke.owner,
            &invoke.name,
            &invoke.descriptor,
            |receiver| strategy.admits(receiver),
        );
        for target in targets {
            self.add_edge(site, target);
        }
        Ok(())
    }

    fn add_edge(&mut self, site: &CallSiteId, target: MethodId) {
        self.enqueue(&target);
        if let Some(entry) = self.graph.call_sites.get_mut(site) {
            entry.targets.insert(target);
        }
    }

    fn phantom(
        &mut self,
        site: &CallSiteId,
        invoke: &InvokeRef,
        missing_type: String,
    ) -> Result<(), Interrupt> {
        self.graph.diagnostics.push(Diagnostic::PhantomReference {
            site: site.clone(),
            declared: declared_name(invoke),
            missing_type: missing_type.clone(),
        });
        if self.options.phantom_policy == PhantomPolicy::Fail {
            return Err(Interrupt::Phantom(site.clone(), missing_type));
        }
        Ok(())
    }

    fn unresolved(&mut self, site: &CallSiteId, invoke: &InvokeRef) {
        self.graph.diagnostics.push(Diagnostic::UnresolvedTarget {
            site: site.clone(),
            declared: declared_name(invoke),
        });
    }

    /// Mark the static initializers of a type and its superclasses reachable.
    fn initialize(&mut self, class_name: &str) {
        let model = self.hierarchy.model();
        let mut current = Some(class_name.to_string());
        while let Some(name) = current {
            if !self.initialized.insert(name.clone()) {
                return;
            }
            let Some(class) = model.class(&name) else {
                return;
            };
            if let Some(initializer) = class.find_method("<clinit>", "()V") {
                self.enqueue(&method_id(&class.name, initializer));
            }
            current = class.super_name.clone();
        }
    }

    fn finish(mut self) -> CallGraph {
        let empty_sites: Vec<(CallSiteId, String)> = self
            .graph
            .call_sites
            .iter()
            .filter(|(site, entry)| {
                entry.targets.is_empty() && !self.graph.diagnostics.mentions_site(site)
            })
            .map(|(site, entry)| (site.clone(), declared_name(&entry.declared)))
            .collect();
        for (site, declared) in empty_sites {
            self.graph
                .diagnostics
                .push(Diagnostic::NoDispatchTarget { site, declared });
        }
        debug!(
            strategy = self.graph.strategy,
            reachable = self.graph.reachable.len(),
            call_sites = self.graph.call_sites.len(),
            edges = self.graph.edge_count(),
            "call graph complete"
        );
        self.graph
    }
}

fn method_id(class_name: &str, method: &Method) -> MethodId {
    MethodId {
        class_name: class_name.to_string(),
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
    }
}

fn declared_name(invoke: &InvokeRef) -> String {
    format!("{}.{}{}", invoke.owner, invoke.name, invoke.descriptor)
}
