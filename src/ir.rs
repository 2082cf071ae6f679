use serde::Deserialize;

/// Intermediate representation for a loaded JVM type.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) access: ClassAccess,
    #[serde(default)]
    pub(crate) referenced_classes: Vec<String>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
    /// Whether the class was loaded from the analysis target rather than the classpath.
    #[serde(default = "default_true")]
    pub(crate) is_target: bool,
}

impl Class {
    pub(crate) fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    /// Concrete classes are the only possible runtime receiver types.
    pub(crate) fn is_concrete(&self) -> bool {
        !self.access.is_interface && !self.access.is_abstract
    }
}

/// Class-level access flags needed for dispatch.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ClassAccess {
    pub(crate) is_public: bool,
    pub(crate) is_interface: bool,
    pub(crate) is_abstract: bool,
}

/// Intermediate representation for a method and its body.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access: MethodAccess,
    /// Absent for abstract and native methods.
    #[serde(default)]
    pub(crate) body: Option<MethodBody>,
}

impl Method {
    pub(crate) fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Source line covering a bytecode offset, if the body has a line table.
    pub(crate) fn line_for_offset(&self, offset: u32) -> Option<u32> {
        let body = self.body.as_ref()?;
        body.line_numbers
            .iter()
            .take_while(|entry| entry.start_pc <= offset)
            .last()
            .map(|entry| entry.line)
    }
}

/// Method-level access flags.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct MethodAccess {
    pub(crate) is_public: bool,
    pub(crate) is_private: bool,
    pub(crate) is_static: bool,
    pub(crate) is_abstract: bool,
}

/// Instructions and line table of a concrete method.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MethodBody {
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
    /// Sorted by `start_pc`.
    #[serde(default)]
    pub(crate) line_numbers: Vec<LineNumber>,
}

/// Line number table entry.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    #[serde(flatten)]
    pub(crate) kind: InstructionKind,
}

/// Instruction kinds needed for call graph construction.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub(crate) enum InstructionKind {
    Invoke(InvokeRef),
    #[serde(rename_all = "camelCase")]
    New {
        class_name: String,
    },
    /// `getstatic`/`putstatic`, which trigger class initialization.
    StaticField {
        owner: String,
    },
    /// `ldc` of a string constant.
    ConstString {
        value: String,
    },
    /// `ldc` of a class literal such as `Foo.class`.
    #[serde(rename_all = "camelCase")]
    ConstClass {
        class_name: String,
    },
    Other {
        opcode: u8,
    },
}

/// Method reference named by an invocation instruction.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InvokeRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    /// The receiver is an array; `owner` is then `java/lang/Object`.
    #[serde(default)]
    pub(crate) array_receiver: bool,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
    Dynamic,
}

fn default_true() -> bool {
    true
}
