use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;

use crate::callgraph::{CallGraph, CallSiteEntry, CallSiteId, MethodId};
use crate::descriptor::{class_descriptor, method_signature};
use crate::error::OutputError;

/// Serialized call graph: one record per scanned call site.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallGraphDocument {
    pub(crate) call_sites: Vec<CallSiteRecord>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallSiteRecord {
    pub(crate) declared_target: MethodRecord,
    /// Source line, or -1 when the method has no line table.
    pub(crate) line: i64,
    pub(crate) method: MethodRecord,
    pub(crate) targets: Vec<MethodRecord>,
}

/// Method identity in canonical descriptor form, independent of load order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MethodRecord {
    pub(crate) name: String,
    pub(crate) declaring_type: String,
    pub(crate) return_type: String,
    pub(crate) parameter_types: Vec<String>,
}

impl MethodRecord {
    fn new(class_name: &str, name: &str, descriptor: &str) -> Result<Self> {
        let signature = method_signature(descriptor)
            .with_context(|| format!("describe {class_name}.{name}{descriptor}"))?;
        Ok(Self {
            name: name.to_string(),
            declaring_type: class_descriptor(class_name),
            return_type: signature.return_type,
            parameter_types: signature.parameter_types,
        })
    }

    fn from_id(id: &MethodId) -> Result<Self> {
        Self::new(&id.class_name, &id.name, &id.descriptor)
    }
}

/// Finished analysis: the serializable document plus in-memory summary data.
#[derive(Clone, Debug)]
pub(crate) struct CallGraphReport {
    pub(crate) strategy: &'static str,
    pub(crate) document: CallGraphDocument,
    pub(crate) reachable: Vec<MethodId>,
    pub(crate) edge_count: usize,
    pub(crate) warning_count: usize,
}

/// Convert a finished call graph into records ordered by enclosing type, method
/// and offset, with targets ordered by declaring type, name and descriptor.
pub(crate) fn build_report(graph: &CallGraph) -> Result<CallGraphReport> {
    let sites: Vec<(&CallSiteId, &CallSiteEntry)> = graph.call_sites.iter().collect();
    let call_sites = sites
        .par_iter()
        .map(|(site, entry)| call_site_record(site, entry))
        .collect::<Result<Vec<_>>>()?;
    Ok(CallGraphReport {
        strategy: graph.strategy,
        document: CallGraphDocument { call_sites },
        reachable: graph.reachable.iter().cloned().collect(),
        edge_count: graph.edge_count(),
        warning_count: graph.diagnostics.len(),
    })
}

fn call_site_record(site: &CallSiteId, entry: &CallSiteEntry) -> Result<CallSiteRecord> {
    let declared = &entry.declared;
    let targets = entry
        .targets
        .iter()
        .map(MethodRecord::from_id)
        .collect::<Result<Vec<_>>>()?;
    Ok(CallSiteRecord {
        declared_target: MethodRecord::new(&declared.owner, &declared.name, &declared.descriptor)?,
        line: entry.line.map(i64::from).unwrap_or(-1),
        method: MethodRecord::from_id(&site.caller)?,
        targets,
    })
}

/// Render the document exactly as it is written to disk.
pub(crate) fn render(report: &CallGraphReport) -> serde_json::Result<String> {
    let mut rendered = serde_json::to_string_pretty(&report.document)?;
    rendered.push('\n');
    Ok(rendered)
}

/// Write the report to `output` (`-` for stdout). On failure the report is
/// handed back inside the error.
pub(crate) fn write_report(
    report: CallGraphReport,
    output: &Path,
) -> Result<CallGraphReport, OutputError> {
    match write_document(&report, output) {
        Ok(()) => Ok(report),
        Err(source) => Err(OutputError {
            target: output.to_path_buf(),
            report: Box::new(report),
            source,
        }),
    }
}

fn write_document(report: &CallGraphReport, output: &Path) -> io::Result<()> {
    let rendered = render(report).map_err(io::Error::from)?;
    if output == Path::new("-") {
        let mut stdout = io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        return stdout.flush();
    }
    let mut writer = BufWriter::new(File::create(output)?);
    writer.write_all(rendered.as_bytes())?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::ir::{CallKind, InvokeRef};

    fn id(class_name: &str, name: &str, descriptor: &str) -> MethodId {
        MethodId {
            class_name: class_name.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    fn sample_graph() -> CallGraph {
        let caller = id("app/Main", "main", "([Ljava/lang/String;)V");
        let mut graph = CallGraph {
            strategy: "CHA",
            ..CallGraph::default()
        };
        graph.reachable.insert(caller.clone());
        for (offset, line, targets) in [
            (
                4,
                Some(12),
                vec![id("app/Derived", "f", "(I)J"), id("app/Base", "f", "(I)J")],
            ),
            (0, None, Vec::new()),
        ] {
            graph.call_sites.insert(
                CallSiteId {
                    caller: caller.clone(),
                    offset,
                },
                CallSiteEntry {
                    declared: InvokeRef {
                        owner: "app/Base".to_string(),
                        name: "f".to_string(),
                        descriptor: "(I)J".to_string(),
                        kind: CallKind::Virtual,
                        array_receiver: false,
                    },
                    line,
                    targets: targets.into_iter().collect::<BTreeSet<_>>(),
                },
            );
        }
        graph
    }

    #[test]
    fn records_follow_site_offset_order() {
        let report = build_report(&sample_graph()).expect("report");

        let lines: Vec<i64> = report
            .document
            .call_sites
            .iter()
            .map(|record| record.line)
            .collect();

        assert_eq!(lines, vec![-1, 12]);
        assert_eq!(report.edge_count, 2);
    }

    #[test]
    fn targets_are_sorted_and_canonical() {
        let report = build_report(&sample_graph()).expect("report");

        let record = &report.document.call_sites[1];
        let declaring: Vec<&str> = record
            .targets
            .iter()
            .map(|target| target.declaring_type.as_str())
            .collect();

        assert_eq!(declaring, vec!["Lapp/Base;", "Lapp/Derived;"]);
        assert_eq!(record.targets[0].parameter_types, vec!["I"]);
        assert_eq!(record.targets[0].return_type, "J");
        assert_eq!(record.method.parameter_types, vec!["[Ljava/lang/String;"]);
    }

    #[test]
    fn document_uses_call_site_field_names() {
        let report = build_report(&sample_graph()).expect("report");

        let value = serde_json::to_value(&report.document).expect("serialize");

        let site = &value["callSites"][1];
        assert_eq!(site["declaredTarget"]["name"], "f");
        assert_eq!(site["declaredTarget"]["declaringType"], "Lapp/Base;");
        assert_eq!(site["method"]["name"], "main");
        assert_eq!(site["line"], 12);
        assert_eq!(site["targets"].as_array().expect("targets").len(), 2);
    }

    #[test]
    fn render_is_stable_across_runs() {
        let first = render(&build_report(&sample_graph()).expect("report")).expect("render");
        let second = render(&build_report(&sample_graph()).expect("report")).expect("render");

        assert_eq!(first, second);
        assert!(first.ends_with("}\n"));
    }

    #[test]
    fn document_matches_schema() {
        let schema_path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("schema")
            .join("callgraph.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(schema_path).expect("read schema"))
                .expect("parse schema");
        let validator = jsonschema::validator_for(&schema).expect("compile schema");
        let report = build_report(&sample_graph()).expect("report");

        let value = serde_json::to_value(&report.document).expect("serialize");

        assert!(validator.is_valid(&value));
    }

    #[test]
    fn write_failure_returns_the_report() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let report = build_report(&sample_graph()).expect("report");

        let error = write_report(report, temp_dir.path()).err().expect("write error");

        assert_eq!(error.report.document.call_sites.len(), 2);
        assert_eq!(error.target, temp_dir.path());
    }

    #[test]
    fn write_report_creates_the_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let output = temp_dir.path().join("cg.json");
        let report = build_report(&sample_graph()).expect("report");

        let report = write_report(report, &output).expect("write");

        let written = std::fs::read_to_string(&output).expect("read output");
        assert_eq!(written, render(&report).expect("render"));
    }
}
