use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::debug;

use crate::ir::{Class, Method};

/// Loaded program: every class from the target and the classpath, indexed by name.
pub(crate) struct ProgramModel {
    classes: Vec<Class>,
    index: BTreeMap<String, usize>,
    missing: BTreeSet<String>,
}

impl ProgramModel {
    /// Index the loaded classes, rejecting duplicate definitions.
    pub(crate) fn new(classes: Vec<Class>) -> Result<Self> {
        let mut class_map: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (position, class) in classes.iter().enumerate() {
            class_map.entry(&class.name).or_default().push(position);
        }

        let mut duplicates = Vec::new();
        for (name, positions) in &class_map {
            if positions.len() > 1 {
                duplicates.push(format!("{name} (defined {} times)", positions.len()));
            }
        }
        if !duplicates.is_empty() {
            anyhow::bail!("duplicate classes found: {}", duplicates.join(", "));
        }

        let index: BTreeMap<String, usize> = class_map
            .into_iter()
            .map(|(name, positions)| (name.to_string(), positions[0]))
            .collect();

        let mut missing = BTreeSet::new();
        for class in &classes {
            let supertypes = class.super_name.iter().chain(class.interfaces.iter());
            for reference in class.referenced_classes.iter().chain(supertypes) {
                if !index.contains_key(reference) {
                    missing.insert(reference.clone());
                }
            }
        }
        let platform_missing = missing.iter().filter(|name| is_platform_class(name)).count();
        debug!(
            classes = index.len(),
            missing = missing.len(),
            platform_missing,
            "indexed program model"
        );

        Ok(Self {
            classes,
            index,
            missing,
        })
    }

    pub(crate) fn class(&self, name: &str) -> Option<&Class> {
        self.index.get(name).map(|position| &self.classes[*position])
    }

    pub(crate) fn method(&self, class_name: &str, name: &str, descriptor: &str) -> Option<&Method> {
        self.class(class_name)?.find_method(name, descriptor)
    }

    /// Classes in lexicographic order of their names.
    pub(crate) fn classes(&self) -> impl Iterator<Item = &Class> {
        self.index.values().map(|position| &self.classes[*position])
    }

    pub(crate) fn class_count(&self) -> usize {
        self.index.len()
    }

    /// Referenced type names with no definition in the model.
    pub(crate) fn missing_references(&self) -> &BTreeSet<String> {
        &self.missing
    }
}

/// JDK types are phantom unless the runtime library is put on the classpath.
pub(crate) fn is_platform_class(name: &str) -> bool {
    const PREFIXES: [&str; 5] = ["java/", "javax/", "jdk/", "sun/", "com/sun/"];
    PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}
