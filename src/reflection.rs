//! Best-effort handling of reflective class loading with constant arguments.
//!
//! Only the shapes javac emits for literal names are followed:
//! `Class.forName("a.b.C")`, `C.class`, and a `newInstance` call on the class
//! they produce (directly, or through a no-argument `getConstructor`). A name
//! that is not a single unambiguous constant yields nothing.

use std::mem;

use crate::ir::{CallKind, InstructionKind, InvokeRef};

const CLASS: &str = "java/lang/Class";
const CONSTRUCTOR: &str = "java/lang/reflect/Constructor";
const FOR_NAME_DESCRIPTORS: [&str; 2] = [
    "(Ljava/lang/String;)Ljava/lang/Class;",
    "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;",
];

/// Effect of a reflective call whose class argument is known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReflectiveEffect {
    /// `Class.forName` loads and initializes the class.
    Initialize(String),
    /// `newInstance` constructs the class.
    Instantiate {
        class_name: String,
        constructors: ConstructorChoice,
    },
}

/// Constructors a reflective instantiation may run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ConstructorChoice {
    /// `Class.newInstance()` always runs `<init>()V`.
    NoArgument,
    /// `Constructor.newInstance(Object...)` with unknown arguments.
    Any,
}

/// One value slot of the tracker: empty, a single known constant, or
/// conflicting constants that must not be guessed between.
#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Known(String),
    Conflict,
}

impl Slot {
    fn put(&mut self, value: String) {
        *self = if matches!(self, Slot::Empty) {
            Slot::Known(value)
        } else {
            Slot::Conflict
        };
    }

    fn take(&mut self) -> Option<String> {
        match mem::take(self) {
            Slot::Known(value) => Some(value),
            _ => None,
        }
    }
}

/// Follows the constants of one method body in instruction order. Any call
/// other than the reflective ones clears what has been seen.
#[derive(Debug, Default)]
pub(crate) struct ReflectionTracker {
    name: Slot,
    class: Slot,
    constructor_of: Slot,
}

impl ReflectionTracker {
    pub(crate) fn observe(&mut self, kind: &InstructionKind) -> Option<ReflectiveEffect> {
        match kind {
            InstructionKind::ConstString { value } => {
                self.name.put(value.clone());
                None
            }
            InstructionKind::ConstClass { class_name } => {
                self.class.put(class_name.clone());
                None
            }
            InstructionKind::Invoke(invoke) => self.observe_call(invoke),
            InstructionKind::New { .. }
            | InstructionKind::StaticField { .. }
            | InstructionKind::Other { .. } => None,
        }
    }

    fn observe_call(&mut self, invoke: &InvokeRef) -> Option<ReflectiveEffect> {
        let owner = invoke.owner.as_str();
        let name = invoke.name.as_str();
        if owner == CLASS
            && name == "forName"
            && invoke.kind == CallKind::Static
            && FOR_NAME_DESCRIPTORS.contains(&invoke.descriptor.as_str())
        {
            let loaded = self.name.take().and_then(|name| internal_name(&name));
            self.reset();
            let loaded = loaded?;
            self.class.put(loaded.clone());
            return Some(ReflectiveEffect::Initialize(loaded));
        }
        if owner == CLASS && name == "newInstance" && invoke.descriptor == "()Ljava/lang/Object;" {
            let class_name = self.class.take();
            self.reset();
            return class_name.map(|class_name| ReflectiveEffect::Instantiate {
                class_name,
                constructors: ConstructorChoice::NoArgument,
            });
        }
        if owner == CLASS
            && matches!(name, "getConstructor" | "getDeclaredConstructor")
            && invoke.descriptor == "([Ljava/lang/Class;)Ljava/lang/reflect/Constructor;"
        {
            let class_name = self.class.take();
            self.reset();
            if let Some(class_name) = class_name {
                self.constructor_of.put(class_name);
            }
            return None;
        }
        if owner == CONSTRUCTOR
            && name == "newInstance"
            && invoke.descriptor == "([Ljava/lang/Object;)Ljava/lang/Object;"
        {
            let class_name = self.constructor_of.take();
            self.reset();
            return class_name.map(|class_name| ReflectiveEffect::Instantiate {
                class_name,
                constructors: ConstructorChoice::Any,
            });
        }
        self.reset();
        None
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `a.b.C` or `a.b.Outer$Inner` to an internal name; array names are skipped.
fn internal_name(binary_name: &str) -> Option<String> {
    if binary_name.is_empty() || binary_name.starts_with('[') {
        return None;
    }
    Some(binary_name.replace('.', "/"))
}
