use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;

use crate::callgraph::MethodId;
use crate::classpath::ProgramModel;
use crate::ir::Class;

/// Type hierarchy materialized as adjacency lists over the program model.
pub(crate) struct TypeHierarchy<'a> {
    model: &'a ProgramModel,
    supertypes: BTreeMap<String, Vec<String>>,
    subtypes: BTreeMap<String, Vec<String>>,
}

/// Outcome of JVM method resolution against the model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Resolution {
    Resolved(MethodId),
    /// The search reached a type that is not in the model.
    Phantom(String),
    NotFound,
}

impl<'a> TypeHierarchy<'a> {
    /// Build super and subtype adjacency in one pass, rejecting cyclic hierarchies.
    pub(crate) fn build(model: &'a ProgramModel) -> Result<Self> {
        let mut supertypes = BTreeMap::new();
        let mut subtypes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for class in model.classes() {
            let direct: Vec<String> = class
                .super_name
                .iter()
                .chain(class.interfaces.iter())
                .cloned()
                .collect();
            for parent in &direct {
                subtypes
                    .entry(parent.clone())
                    .or_default()
                    .push(class.name.clone());
            }
            supertypes.insert(class.name.clone(), direct);
        }
        for children in subtypes.values_mut() {
            children.sort();
            children.dedup();
        }

        let hierarchy = Self {
            model,
            supertypes,
            subtypes,
        };
        hierarchy.check_acyclic()?;
        Ok(hierarchy)
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for root in self.supertypes.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            // Iterative DFS; the bool tracks whether the node's children were pushed.
            let mut stack = vec![(root.as_str(), false)];
            while let Some((name, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(name, Mark::Done);
                    continue;
                }
                match marks.get(name) {
                    Some(Mark::Done) => continue,
                    Some(Mark::InProgress) => {
                        anyhow::bail!("cyclic type hierarchy involving {name}")
                    }
                    None => {}
                }
                marks.insert(name, Mark::InProgress);
                stack.push((name, true));
                for parent in self.direct_supertypes(name) {
                    match marks.get(parent.as_str()) {
                        Some(Mark::InProgress) => {
                            anyhow::bail!("cyclic type hierarchy involving {parent}")
                        }
                        Some(Mark::Done) => {}
                        None => stack.push((parent.as_str(), false)),
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn model(&self) -> &'a ProgramModel {
        self.model
    }

    /// Direct superclass followed by direct interfaces.
    pub(crate) fn direct_supertypes(&self, name: &str) -> &[String] {
        self.supertypes
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn direct_subtypes(&self, name: &str) -> &[String] {
        self.subtypes
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The type itself plus every transitive subtype through `extends` and `implements`.
    pub(crate) fn subtype_closure(&self, name: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::new();
        closure.insert(name.to_string());
        queue.push_back(name.to_string());
        while let Some(current) = queue.pop_front() {
            for child in self.direct_subtypes(&current) {
                if closure.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        closure
    }

    /// Superclass chain starting at `name` itself, stopping at the first missing type.
    fn superclass_chain(&self, name: &str) -> (Vec<&'a Class>, Option<String>) {
        let mut chain = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(type_name) = current {
            let Some(class) = self.model.class(&type_name) else {
                return (chain, Some(type_name));
            };
            chain.push(class);
            current = class.super_name.clone();
        }
        (chain, None)
    }

    /// JVM method resolution: the owner and its superclasses, then superinterfaces.
    pub(crate) fn resolve_method(&self, owner: &str, name: &str, descriptor: &str) -> Resolution {
        let (chain, phantom) = self.superclass_chain(owner);
        for class in &chain {
            if class.find_method(name, descriptor).is_some() {
                return Resolution::Resolved(method_id(&class.name, name, descriptor));
            }
        }

        let mut missing_interface = None;
        let mut candidates = Vec::new();
        for class in &chain {
            for interface in self.interface_closure(class) {
                match self.model.class(&interface) {
                    Some(declaring) => {
                        if let Some(method) = declaring.find_method(name, descriptor) {
                            if !method.access.is_static && !method.access.is_private {
                                candidates.push(interface);
                            }
                        }
                    }
                    None => {
                        missing_interface.get_or_insert(interface);
                    }
                }
            }
        }
        // A single non-abstract maximally specific method wins; otherwise any
        // maximally specific one does.
        let survivors = self.maximally_specific(candidates);
        let defaults = self.non_abstract(&survivors, name, descriptor);
        let chosen = match defaults.as_slice() {
            [single] => Some(*single),
            _ => survivors.first(),
        };
        if let Some(interface) = chosen {
            return Resolution::Resolved(method_id(interface, name, descriptor));
        }

        match phantom.or(missing_interface) {
            Some(missing) => Resolution::Phantom(missing),
            None => Resolution::NotFound,
        }
    }

    /// Virtual dispatch for one runtime type.
    pub(crate) fn select(&self, runtime_type: &str, name: &str, descriptor: &str) -> Option<MethodId> {
        let (chain, _) = self.superclass_chain(runtime_type);
        for class in &chain {
            if let Some(method) = class.find_method(name, descriptor) {
                if !method.access.is_static && !method.access.is_abstract {
                    return Some(method_id(&class.name, name, descriptor));
                }
                if method.access.is_abstract {
                    // An abstract redeclaration hides inherited defaults.
                    return None;
                }
            }
        }

        let mut candidates = Vec::new();
        for class in &chain {
            for interface in self.interface_closure(class) {
                let Some(declaring) = self.model.class(&interface) else {
                    continue;
                };
                if let Some(method) = declaring.find_method(name, descriptor) {
                    if !method.access.is_static && !method.access.is_private {
                        candidates.push(interface);
                    }
                }
            }
        }
        let survivors = self.maximally_specific(candidates);
        match self.non_abstract(&survivors, name, descriptor).as_slice() {
            [selected] => Some(method_id(selected, name, descriptor)),
            _ => None,
        }
    }

    /// Dispatch targets for a virtual call on `static_type`: one concrete method per
    /// admitted concrete subtype, unique by method identity.
    pub(crate) fn dispatch_candidates<F>(
        &self,
        static_type: &str,
        name: &str,
        descriptor: &str,
        mut admit: F,
    ) -> BTreeSet<MethodId>
    where
        F: FnMut(&str) -> bool,
    {
        let mut targets = BTreeSet::new();
        for type_name in self.subtype_closure(static_type) {
            let Some(class) = self.model.class(&type_name) else {
                continue;
            };
            if !class.is_concrete() || !admit(&type_name) {
                continue;
            }
            if let Some(target) = self.select(&type_name, name, descriptor) {
                targets.insert(target);
            }
        }
        targets
    }

    /// All interfaces a class implements, directly or through superinterfaces.
    fn interface_closure(&self, class: &Class) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = class.interfaces.iter().cloned().collect();
        while let Some(interface) = queue.pop_front() {
            if !seen.insert(interface.clone()) {
                continue;
            }
            if let Some(declaring) = self.model.class(&interface) {
                queue.extend(declaring.interfaces.iter().cloned());
            }
        }
        seen
    }

    /// Drop candidates that are superinterfaces of another candidate. Survivors
    /// are sorted by name.
    fn maximally_specific(&self, candidates: Vec<String>) -> Vec<String> {
        let unique: BTreeSet<String> = candidates.into_iter().collect();
        unique
            .iter()
            .filter(|candidate| {
                !unique
                    .iter()
                    .any(|other| other != *candidate && self.is_subtype_of(other, candidate))
            })
            .cloned()
            .collect()
    }

    /// Interfaces among `declaring` whose declaration of the method has a body.
    fn non_abstract<'n>(
        &self,
        declaring: &'n [String],
        name: &str,
        descriptor: &str,
    ) -> Vec<&'n String> {
        declaring
            .iter()
            .filter(|interface| {
                self.model
                    .method(interface, name, descriptor)
                    .is_some_and(|method| !method.access.is_abstract)
            })
            .collect()
    }

    /// Whether `sub` reaches `sup` through supertype edges (reflexive).
    pub(crate) fn is_subtype_of(&self, sub: &str, sup: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![sub];
        while let Some(current) = stack.pop() {
            if current == sup {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.direct_supertypes(current).iter().map(String::as_str));
        }
        false
    }
}

fn method_id(class_name: &str, name: &str, descriptor: &str) -> MethodId {
    MethodId {
        class_name: class_name.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}
