use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::callgraph::{BuildOptions, CallGraph, build_call_graph, entry_points};
use crate::classpath::ProgramModel;
use crate::config::EntryMode;
use crate::hierarchy::TypeHierarchy;
use crate::ir::{
    CallKind, Class, ClassAccess, Instruction, InstructionKind, InvokeRef, Method, MethodAccess,
    MethodBody,
};
use crate::scan::scan_inputs;
use crate::strategy::create_strategy;

const VOID: &str = "()V";
const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Builder for in-memory classes. Instruction offsets equal their position in
/// the body and every method takes no arguments and returns void.
pub(crate) struct ClassSpec {
    class: Class,
}

impl ClassSpec {
    pub(crate) fn class(name: &str) -> Self {
        Self::with_access(
            name,
            ClassAccess {
                is_public: true,
                is_interface: false,
                is_abstract: false,
            },
        )
    }

    pub(crate) fn interface(name: &str) -> Self {
        Self::with_access(
            name,
            ClassAccess {
                is_public: true,
                is_interface: true,
                is_abstract: true,
            },
        )
    }

    pub(crate) fn abstract_class(name: &str) -> Self {
        Self::with_access(
            name,
            ClassAccess {
                is_public: true,
                is_interface: false,
                is_abstract: true,
            },
        )
    }

    fn with_access(name: &str, access: ClassAccess) -> Self {
        Self {
            class: Class {
                name: name.to_string(),
                super_name: None,
                interfaces: Vec::new(),
                access,
                referenced_classes: Vec::new(),
                methods: Vec::new(),
                is_target: true,
            },
        }
    }

    pub(crate) fn extends(mut self, super_name: &str) -> Self {
        self.class.super_name = Some(super_name.to_string());
        self
    }

    pub(crate) fn implements(mut self, interface: &str) -> Self {
        self.class.interfaces.push(interface.to_string());
        self
    }

    /// Public instance method with an empty body (a default method on interfaces).
    pub(crate) fn method(self, name: &str) -> Self {
        self.body(name, Vec::new())
    }

    pub(crate) fn body(self, name: &str, instructions: Vec<InstructionKind>) -> Self {
        self.push_method(name, VOID, public(), Some(instructions))
    }

    pub(crate) fn static_body(self, name: &str, instructions: Vec<InstructionKind>) -> Self {
        let access = MethodAccess {
            is_static: true,
            ..public()
        };
        self.push_method(name, VOID, access, Some(instructions))
    }

    pub(crate) fn static_method(self, name: &str) -> Self {
        self.static_body(name, Vec::new())
    }

    pub(crate) fn private_method(self, name: &str) -> Self {
        let access = MethodAccess {
            is_private: true,
            ..MethodAccess::default()
        };
        self.push_method(name, VOID, access, Some(Vec::new()))
    }

    pub(crate) fn abstract_method(self, name: &str) -> Self {
        let access = MethodAccess {
            is_abstract: true,
            ..public()
        };
        self.push_method(name, VOID, access, None)
    }

    pub(crate) fn constructor(self) -> Self {
        self.push_method("<init>", VOID, public(), Some(Vec::new()))
    }

    pub(crate) fn static_initializer(self) -> Self {
        let access = MethodAccess {
            is_static: true,
            ..MethodAccess::default()
        };
        self.push_method("<clinit>", VOID, access, Some(Vec::new()))
    }

    /// `public static void main(String[])` running `instructions`.
    pub(crate) fn main(self, instructions: Vec<InstructionKind>) -> Self {
        let access = MethodAccess {
            is_static: true,
            ..public()
        };
        self.push_method("main", MAIN_DESCRIPTOR, access, Some(instructions))
    }

    fn push_method(
        mut self,
        name: &str,
        descriptor: &str,
        access: MethodAccess,
        instructions: Option<Vec<InstructionKind>>,
    ) -> Self {
        let body = instructions.map(|kinds| MethodBody {
            instructions: kinds
                .into_iter()
                .enumerate()
                .map(|(offset, kind)| Instruction {
                    offset: offset as u32,
                    kind,
                })
                .collect(),
            line_numbers: Vec::new(),
        });
        self.class.methods.push(Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            body,
        });
        self
    }

    pub(crate) fn new_instance(class_name: &str) -> InstructionKind {
        InstructionKind::New {
            class_name: class_name.to_string(),
        }
    }

    pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(owner, name, descriptor, CallKind::Virtual)
    }

    pub(crate) fn invoke_interface(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(owner, name, descriptor, CallKind::Interface)
    }

    pub(crate) fn invoke_special(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(owner, name, descriptor, CallKind::Special)
    }

    pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
        invoke(owner, name, descriptor, CallKind::Static)
    }

    pub(crate) fn const_string(value: &str) -> InstructionKind {
        InstructionKind::ConstString {
            value: value.to_string(),
        }
    }

    pub(crate) fn const_class(class_name: &str) -> InstructionKind {
        InstructionKind::ConstClass {
            class_name: class_name.to_string(),
        }
    }

    pub(crate) fn invoke_dynamic(name: &str, descriptor: &str) -> InstructionKind {
        invoke("java/lang/invoke/CallSite", name, descriptor, CallKind::Dynamic)
    }

    /// Finish the class, recording the types its body refers to the way the
    /// class file loader does.
    fn build(mut self) -> Class {
        let mut referenced = BTreeSet::new();
        for body in self.class.methods.iter().filter_map(|method| method.body.as_ref()) {
            for instruction in &body.instructions {
                match &instruction.kind {
                    InstructionKind::Invoke(invoke) if invoke.kind != CallKind::Dynamic => {
                        referenced.insert(invoke.owner.clone());
                    }
                    InstructionKind::New { class_name }
                    | InstructionKind::ConstClass { class_name } => {
                        referenced.insert(class_name.clone());
                    }
                    InstructionKind::StaticField { owner } => {
                        referenced.insert(owner.clone());
                    }
                    _ => {}
                }
            }
        }
        referenced.remove(&self.class.name);
        self.class.referenced_classes = referenced.into_iter().collect();
        self.class
    }
}

fn public() -> MethodAccess {
    MethodAccess {
        is_public: true,
        ..MethodAccess::default()
    }
}

fn invoke(owner: &str, name: &str, descriptor: &str, kind: CallKind) -> InstructionKind {
    InstructionKind::Invoke(InvokeRef {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        kind,
        array_receiver: false,
    })
}

pub(crate) fn model_of(specs: Vec<ClassSpec>) -> ProgramModel {
    let classes = specs.into_iter().map(ClassSpec::build).collect();
    ProgramModel::new(classes).expect("test model")
}

/// Minimal class file writer for loader tests.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    methods: Vec<MethodSpec>,
    code_index: u16,
    line_table_index: u16,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            access_flags: 0x0021,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            methods: Vec::new(),
            code_index: 0,
            line_table_index: 0,
        };
        builder.code_index = builder.add_utf8("Code");
        builder.line_table_index = builder.add_utf8("LineNumberTable");
        builder.this_class = builder.add_class(class_name);
        if let Some(super_name) = super_name {
            builder.super_class = builder.add_class(super_name);
        }
        builder
    }

    pub(crate) fn add_interface(&mut self, name: &str) {
        let index = self.add_class(name);
        self.interfaces.push(index);
    }

    fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_string(&mut self, value: &str) -> u16 {
        let string_index = self.add_utf8(value);
        self.cp.push(CpEntry::String(string_index));
        self.cp.len() as u16
    }

    fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp.push(CpEntry::NameAndType(name_index, descriptor_index));
        self.cp.len() as u16
    }

    fn add_member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.cp.push(CpEntry::MemberRef(tag, class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add_member_ref(10, class, name, descriptor)
    }

    pub(crate) fn add_interface_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        self.add_member_ref(11, class, name, descriptor)
    }

    pub(crate) fn add_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add_member_ref(9, class, name, descriptor)
    }

    /// Add a method with a `Code` attribute; `lines` pairs are `(start_pc, line)`.
    pub(crate) fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        lines: &[(u16, u16)],
    ) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access_flags,
            name_index,
            descriptor_index,
            code: Some(code),
            lines: lines.to_vec(),
        });
    }

    pub(crate) fn add_abstract_method(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access_flags,
            name_index,
            descriptor_index,
            code: None,
            lines: Vec::new(),
        });
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, self.access_flags);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            write_u16(&mut bytes, *interface);
        }
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, method.access_flags);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            let Some(code) = &method.code else {
                write_u16(&mut bytes, 0);
                continue;
            };
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, self.code_index);
            let line_table_len = if method.lines.is_empty() {
                0
            } else {
                8 + 4 * method.lines.len() as u32
            };
            write_u32(&mut bytes, 12 + code.len() as u32 + line_table_len);
            write_u16(&mut bytes, 4);
            write_u16(&mut bytes, 4);
            write_u32(&mut bytes, code.len() as u32);
            bytes.extend_from_slice(code);
            write_u16(&mut bytes, 0);
            if method.lines.is_empty() {
                write_u16(&mut bytes, 0);
                continue;
            }
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, self.line_table_index);
            write_u32(&mut bytes, 2 + 4 * method.lines.len() as u32);
            write_u16(&mut bytes, method.lines.len() as u16);
            for (start_pc, line) in &method.lines {
                write_u16(&mut bytes, *start_pc);
                write_u16(&mut bytes, *line);
            }
        }
        write_u16(&mut bytes, 0);
        bytes
    }
}

/// Method definition for generated class files.
struct MethodSpec {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    code: Option<Vec<u8>>,
    lines: Vec<(u16, u16)>,
}

/// Constant pool entries needed by generated class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    /// Field, method or interface method reference, by tag.
    MemberRef(u8, u16, u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::String(string_index) => {
                bytes.push(8);
                write_u16(bytes, *string_index);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::MemberRef(tag, class_index, name_and_type) => {
                bytes.push(*tag);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
        }
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

/// Golden case: a JSON program model plus the edges each algorithm must find.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoldenCase {
    /// Empty or absent selects library mode.
    #[serde(default)]
    main_class: String,
    /// Algorithm name to expected `caller@line -> target` edges.
    expected: BTreeMap<String, BTreeSet<String>>,
}

pub(crate) fn golden_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("golden")
}

/// Run every algorithm a golden case names and compare the edge sets.
pub(crate) fn check_golden(name: &str) -> Result<()> {
    let model_path = golden_dir().join(format!("{name}.json"));
    let expected_path = golden_dir().join(format!("{name}.expected.json"));
    let case: GoldenCase = serde_json::from_str(
        &fs::read_to_string(&expected_path)
            .with_context(|| format!("read {}", expected_path.display()))?,
    )
    .with_context(|| format!("parse {}", expected_path.display()))?;

    for (algorithm, expected) in &case.expected {
        let graph = analyze(&model_path, &EntryMode::from_argument(&case.main_class), algorithm)?;
        let actual = edge_lines(&graph);
        let missing: Vec<&String> = expected.difference(&actual).collect();
        let unexpected: Vec<&String> = actual.difference(expected).collect();
        anyhow::ensure!(
            missing.is_empty() && unexpected.is_empty(),
            "{name} with {algorithm}: missing edges {missing:?}, unexpected edges {unexpected:?}"
        );
    }
    Ok(())
}

pub(crate) fn analyze(model_path: &Path, mode: &EntryMode, algorithm: &str) -> Result<CallGraph> {
    let scan = scan_inputs(model_path, &[], None)?;
    let model = ProgramModel::new(scan.classes)?;
    let hierarchy = TypeHierarchy::build(&model)?;
    let entries = entry_points(&hierarchy, mode)?;
    let mut strategy = create_strategy(algorithm)?;
    let graph = build_call_graph(&hierarchy, &entries, strategy.as_mut(), BuildOptions::default())?;
    Ok(graph)
}

/// Edges keyed by caller and source line, independent of bytecode offsets.
fn edge_lines(graph: &CallGraph) -> BTreeSet<String> {
    graph
        .call_sites
        .iter()
        .flat_map(|(site, entry)| {
            let line = entry.line.map(i64::from).unwrap_or(-1);
            entry
                .targets
                .iter()
                .map(move |target| format!("{}@{} -> {}", site.caller, line, target))
        })
        .collect()
}
