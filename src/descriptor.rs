use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Parameter and return types of a method descriptor in canonical descriptor form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSignature {
    pub(crate) parameter_types: Vec<String>,
    pub(crate) return_type: String,
}

/// Split a JVM method descriptor such as `(I[Ljava/lang/String;)V`.
pub(crate) fn method_signature(descriptor: &str) -> Result<MethodSignature> {
    let parsed = MethodDescriptor::from_str(descriptor)
        .with_context(|| format!("parse method descriptor {descriptor}"))?;
    Ok(MethodSignature {
        parameter_types: parsed.parameter_types().iter().map(type_descriptor).collect(),
        return_type: type_descriptor(parsed.return_type()),
    })
}

/// Canonical descriptor for a type that is named by its internal class name.
pub(crate) fn class_descriptor(internal_name: &str) -> String {
    if internal_name.starts_with('[') {
        return internal_name.to_string();
    }
    format!("L{internal_name};")
}

fn type_descriptor(ty: &TypeDescriptor) -> String {
    match ty {
        TypeDescriptor::Byte => "B".to_string(),
        TypeDescriptor::Char => "C".to_string(),
        TypeDescriptor::Double => "D".to_string(),
        TypeDescriptor::Float => "F".to_string(),
        TypeDescriptor::Integer => "I".to_string(),
        TypeDescriptor::Long => "J".to_string(),
        TypeDescriptor::Short => "S".to_string(),
        TypeDescriptor::Boolean => "Z".to_string(),
        TypeDescriptor::Void => "V".to_string(),
        TypeDescriptor::Object(class_name) => class_descriptor(class_name),
        TypeDescriptor::Array(element, dimensions) => {
            format!("{}{}", "[".repeat(usize::from(*dimensions)), type_descriptor(element))
        }
    }
}
