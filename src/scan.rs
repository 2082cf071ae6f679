use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::attributes::Attribute;
use jclassfile::class_file::{self, ClassFlags};
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::{MethodFlags, MethodInfo};
use opentelemetry::KeyValue;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::debug;
use zip::ZipArchive;

use crate::ir::{
    CallKind, Class, ClassAccess, Instruction, InstructionKind, InvokeRef, LineNumber, Method,
    MethodAccess, MethodBody,
};
use crate::opcodes;
use crate::telemetry::{Telemetry, with_span};

/// Declaring type recorded for `invokedynamic` sites, which name no owner class.
const DYNAMIC_CALL_OWNER: &str = "java/lang/invoke/CallSite";

const ARRAY_METHOD_OWNER: &str = "java/lang/Object";

/// Snapshot of parsed classes and the artifacts they came from.
pub(crate) struct ScanOutput {
    pub(crate) artifacts: Vec<PathBuf>,
    pub(crate) class_count: usize,
    pub(crate) classes: Vec<Class>,
}

/// JSON program model: the same class structure the bytecode loader produces.
#[derive(Deserialize)]
struct ModelDocument {
    classes: Vec<Class>,
}

/// Load the analysis target and every classpath entry. Classes from the
/// classpath are never analysis targets.
pub(crate) fn scan_inputs(
    input: &Path,
    classpath: &[PathBuf],
    telemetry: Option<&Telemetry>,
) -> Result<ScanOutput> {
    let mut scan = Scan {
        telemetry,
        output: ScanOutput {
            artifacts: Vec::new(),
            class_count: 0,
            classes: Vec::new(),
        },
    };

    scan.scan_path(input, true, true)?;

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by_key(|path| path_key(path));
    if is_jar_path(input) {
        classpath_entries.extend(manifest_classpath(input)?);
    }

    for entry in expand_classpath(classpath_entries)? {
        if entry == input {
            continue;
        }
        scan.scan_path(&entry, false, true)?;
    }

    debug!(
        classes = scan.output.class_count,
        artifacts = scan.output.artifacts.len(),
        "scanned inputs"
    );
    Ok(scan.output)
}

struct Scan<'t> {
    telemetry: Option<&'t Telemetry>,
    output: ScanOutput,
}

impl Scan<'_> {
    fn scan_path(&mut self, path: &Path, is_target: bool, strict: bool) -> Result<()> {
        if path.is_dir() {
            return self.scan_dir(path, is_target);
        }

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        match extension {
            "class" => self.scan_class_file(path, is_target),
            "jar" => self.scan_jar_file(path, is_target),
            "json" if strict => self.scan_model_file(path, is_target),
            _ => {
                if strict {
                    anyhow::bail!("unsupported input file: {}", path.display())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn scan_dir(&mut self, path: &Path, is_target: bool) -> Result<()> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
            entries.push(entry.path());
        }
        entries.sort_by_key(|path| path_key(path));

        for entry in entries {
            if entry.is_dir() {
                self.scan_dir(&entry, is_target)?;
            } else {
                self.scan_path(&entry, is_target, false)?;
            }
        }
        Ok(())
    }

    fn scan_class_file(&mut self, path: &Path, is_target: bool) -> Result<()> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let class = parse_class_bytes(&data, is_target)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        self.output.artifacts.push(path.to_path_buf());
        self.push(class);
        Ok(())
    }

    fn scan_jar_file(&mut self, path: &Path, is_target: bool) -> Result<()> {
        let attributes = [KeyValue::new(
            "jcallgraph.jar_path",
            path.display().to_string(),
        )];
        let classes = with_span(self.telemetry, "jar.scan", &attributes, || {
            let entries = read_jar_classes(path)?;
            // Archive reads are sequential; parsing is independent per entry.
            entries
                .par_iter()
                .map(|(name, data)| {
                    parse_class_bytes(data, is_target)
                        .with_context(|| format!("failed to parse {}:{}", path.display(), name))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.output.artifacts.push(path.to_path_buf());
        for class in classes {
            self.push(class);
        }
        Ok(())
    }

    fn scan_model_file(&mut self, path: &Path, is_target: bool) -> Result<()> {
        let file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
        let document: ModelDocument = serde_path_to_error::deserialize(&mut deserializer)
            .with_context(|| format!("failed to parse program model {}", path.display()))?;
        self.output.artifacts.push(path.to_path_buf());
        for mut class in document.classes {
            class.is_target &= is_target;
            for body in class.methods.iter_mut().filter_map(|method| method.body.as_mut()) {
                body.line_numbers.sort_by_key(|entry| entry.start_pc);
            }
            self.push(class);
        }
        Ok(())
    }

    fn push(&mut self, class: Class) {
        self.output.class_count += 1;
        self.output.classes.push(class);
    }
}

/// Read every class entry of a jar, sorted by entry name.
fn read_jar_classes(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        // Multi-release overlays would duplicate the base entries.
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    let mut entries = Vec::with_capacity(entry_names.len());
    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        entries.push((name, data));
    }
    Ok(entries)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn expand_classpath(initial: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut queue: VecDeque<PathBuf> = initial.into_iter().collect();
    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    while let Some(entry) = queue.pop_front() {
        if !seen.insert(path_key(&entry)) {
            continue;
        }
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
        if is_jar_path(&entry) {
            let mut referenced = manifest_classpath(&entry)?;
            referenced.sort_by_key(|path| path_key(path));
            queue.extend(referenced);
        }
        result.push(entry);
    }
    Ok(result)
}

fn manifest_classpath(path: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let Ok(mut entry) = archive.by_name("META-INF/MANIFEST.MF") else {
        return Ok(Vec::new());
    };
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read manifest of {}", path.display()))?;
    Ok(parse_manifest_classpath(path, &content))
}

/// Extract `Class-Path` entries, joining continuation lines, relative to the jar.
fn parse_manifest_classpath(jar_path: &Path, content: &str) -> Vec<PathBuf> {
    let mut class_path = None;
    let mut current_key: Option<String> = None;
    let mut current_value = String::new();

    let mut finish = |key: Option<String>, value: &mut String| {
        if key.as_deref() == Some("Class-Path") {
            class_path = Some(value.clone());
        }
        value.clear();
    };

    for raw_line in content.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(continuation) = line.strip_prefix(' ') {
            if current_key.is_some() {
                current_value.push_str(continuation);
            }
            continue;
        }
        finish(current_key.take(), &mut current_value);
        if let Some((key, value)) = line.split_once(':') {
            current_key = Some(key.trim().to_string());
            current_value.push_str(value.trim_start());
        }
    }
    finish(current_key.take(), &mut current_value);

    let Some(class_path) = class_path else {
        return Vec::new();
    };
    let base_dir = jar_path.parent().unwrap_or_else(|| Path::new(""));
    class_path
        .split_whitespace()
        .map(|entry| {
            let entry_path = PathBuf::from(entry);
            if entry_path.is_absolute() {
                entry_path
            } else {
                base_dir.join(entry_path)
            }
        })
        .collect()
}

fn is_jar_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
}

/// Decode one class file into the analysis representation.
pub(crate) fn parse_class_bytes(data: &[u8], is_target: bool) -> Result<Class> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(
            resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        )
    };
    let mut interfaces = Vec::new();
    for interface in class_file.interfaces() {
        interfaces
            .push(resolve_class_name(constant_pool, *interface).context("resolve interface name")?);
    }

    let mut referenced = BTreeSet::new();
    for entry in constant_pool {
        if let ConstantPool::Class { name_index } = entry {
            let raw = resolve_utf8(constant_pool, *name_index)
                .context("resolve referenced class name")?;
            if let Some(normalized) = normalize_class_name(&raw) {
                referenced.insert(normalized);
            }
        }
    }
    referenced.remove(&name);

    let flags = class_file.access_flags();
    let access = ClassAccess {
        is_public: flags.contains(ClassFlags::ACC_PUBLIC),
        is_interface: flags.contains(ClassFlags::ACC_INTERFACE),
        is_abstract: flags.contains(ClassFlags::ACC_ABSTRACT),
    };
    let methods = class_file
        .methods()
        .iter()
        .map(|method| parse_method(constant_pool, method))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("parse methods of {name}"))?;

    Ok(Class {
        name,
        super_name,
        interfaces,
        access,
        referenced_classes: referenced.into_iter().collect(),
        methods,
        is_target,
    })
}

fn parse_method(constant_pool: &[ConstantPool], method: &MethodInfo) -> Result<Method> {
    let name = resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
    let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
        .context("resolve method descriptor")?;
    let flags = method.access_flags();
    let access = MethodAccess {
        is_public: flags.contains(MethodFlags::ACC_PUBLIC),
        is_private: flags.contains(MethodFlags::ACC_PRIVATE),
        is_static: flags.contains(MethodFlags::ACC_STATIC),
        is_abstract: flags.contains(MethodFlags::ACC_ABSTRACT),
    };
    let code = method
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::Code {
                code, attributes, ..
            } => Some((code, attributes)),
            _ => None,
        });
    let body = match code {
        Some((code, code_attributes)) => Some(MethodBody {
            instructions: parse_bytecode(code, constant_pool)
                .with_context(|| format!("parse bytecode of {name}{descriptor}"))?,
            line_numbers: parse_line_numbers(code_attributes),
        }),
        None => None,
    };
    Ok(Method {
        name,
        descriptor,
        access,
        body,
    })
}

fn parse_line_numbers(attributes: &[Attribute]) -> Vec<LineNumber> {
    let mut entries = Vec::new();
    for attribute in attributes {
        let Attribute::LineNumberTable { line_number_table } = attribute else {
            continue;
        };
        for record in line_number_table {
            entries.push(LineNumber {
                start_pc: record.start_pc() as u32,
                line: record.line_number() as u32,
            });
        }
    }
    entries.sort_by_key(|entry| entry.start_pc);
    entries
}

fn parse_bytecode(code: &[u8], constant_pool: &[ConstantPool]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcodes::instruction_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let index = opcodes::read_u16(code, offset + 1)?;
                let kind = match opcode {
                    opcodes::INVOKEVIRTUAL => CallKind::Virtual,
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    _ => CallKind::Interface,
                };
                InstructionKind::Invoke(
                    resolve_method_ref(constant_pool, index, kind)
                        .with_context(|| format!("resolve method ref at offset {offset}"))?,
                )
            }
            opcodes::INVOKEDYNAMIC => {
                let index = opcodes::read_u16(code, offset + 1)?;
                InstructionKind::Invoke(
                    resolve_dynamic_ref(constant_pool, index)
                        .with_context(|| format!("resolve call site at offset {offset}"))?,
                )
            }
            opcodes::NEW => {
                let index = opcodes::read_u16(code, offset + 1)?;
                InstructionKind::New {
                    class_name: resolve_class_name(constant_pool, index)
                        .context("resolve instantiated class")?,
                }
            }
            opcodes::LDC => {
                let index = code.get(offset + 1).copied().context("ldc index")? as u16;
                resolve_loaded_constant(constant_pool, index)?
                    .unwrap_or(InstructionKind::Other { opcode })
            }
            opcodes::LDC_W => {
                let index = opcodes::read_u16(code, offset + 1)?;
                resolve_loaded_constant(constant_pool, index)?
                    .unwrap_or(InstructionKind::Other { opcode })
            }
            opcodes::GETSTATIC | opcodes::PUTSTATIC => {
                let index = opcodes::read_u16(code, offset + 1)?;
                InstructionKind::StaticField {
                    owner: resolve_field_owner(constant_pool, index)
                        .context("resolve static field owner")?,
                }
            }
            _ => InstructionKind::Other { opcode },
        };
        instructions.push(Instruction {
            offset: offset as u32,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

fn resolve_method_ref(constant_pool: &[ConstantPool], index: u16, kind: CallKind) -> Result<InvokeRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing method ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected method ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name, descriptor) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    // Methods invoked on any array type (`[I`, `[Lapp/Foo;`) are the ones arrays
    // inherit from `Object`.
    let array_receiver = owner.starts_with('[');
    Ok(InvokeRef {
        owner: if array_receiver {
            ARRAY_METHOD_OWNER.to_string()
        } else {
            owner
        },
        name,
        descriptor,
        kind,
        array_receiver,
    })
}

/// String and class constants pushed by `ldc`; other constant kinds are not tracked.
fn resolve_loaded_constant(
    constant_pool: &[ConstantPool],
    index: u16,
) -> Result<Option<InstructionKind>> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing ldc constant entry")?;
    match entry {
        ConstantPool::String { string_index } => Ok(Some(InstructionKind::ConstString {
            value: resolve_utf8(constant_pool, *string_index).context("resolve string constant")?,
        })),
        ConstantPool::Class { name_index } => {
            let class_name =
                resolve_utf8(constant_pool, *name_index).context("resolve class constant")?;
            if class_name.starts_with('[') {
                return Ok(None);
            }
            Ok(Some(InstructionKind::ConstClass { class_name }))
        }
        _ => Ok(None),
    }
}

fn resolve_dynamic_ref(constant_pool: &[ConstantPool], index: u16) -> Result<InvokeRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing invokedynamic entry")?;
    let ConstantPool::InvokeDynamic {
        name_and_type_index,
        ..
    } = entry
    else {
        anyhow::bail!("unexpected invokedynamic entry");
    };
    let (name, descriptor) = resolve_name_and_type(constant_pool, *name_and_type_index)?;
    Ok(InvokeRef {
        owner: DYNAMIC_CALL_OWNER.to_string(),
        name,
        descriptor,
        kind: CallKind::Dynamic,
        array_receiver: false,
    })
}

fn resolve_field_owner(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing field ref entry")?;
    match entry {
        ConstantPool::Fieldref { class_index, .. } => resolve_class_name(constant_pool, *class_index),
        _ => anyhow::bail!("unexpected field ref entry"),
    }
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((
            resolve_utf8(constant_pool, *name_index).context("resolve member name")?,
            resolve_utf8(constant_pool, *descriptor_index).context("resolve member descriptor")?,
        )),
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

/// Strip array dimensions from a class constant; primitive arrays have no class.
fn normalize_class_name(raw: &str) -> Option<String> {
    if !raw.starts_with('[') {
        return Some(raw.to_string());
    }
    let element = raw.trim_start_matches('[');
    element
        .strip_prefix('L')
        .and_then(|name| name.strip_suffix(';'))
        .map(str::to_string)
}
