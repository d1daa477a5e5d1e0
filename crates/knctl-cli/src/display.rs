//! Display formatting for CLI output
//!
//! Provides:
//! - column-aligned tables for services, revisions and routes
//! - the human-readable service description
//! - JSON/YAML rendering of raw objects

use chrono::{DateTime, Utc};
use console::style;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use knctl_core::resources::{ConditionStatus, Conditioned, Revision, Route, Service};
use knctl_kube::ServiceDescription;
use serde::Serialize;

use crate::error::{CliError, Result};
use crate::flags::OutputFormat;

// ========== Tables ==========

/// Plain-text table with left-aligned columns
#[derive(Debug, Default)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Render with or without the header line
    pub fn render(&self, headers: bool) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(String::len).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.chars().count());
                }
            }
        }

        let mut out = String::new();
        let mut push_line = |cells: &[String]| {
            let line: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect();
            out.push_str(line.join("   ").trim_end());
            out.push('\n');
        };
        if headers {
            push_line(&self.header);
        }
        for row in &self.rows {
            push_line(row);
        }
        out
    }
}

fn print_table(table: &Table, format: OutputFormat) {
    print!("{}", table.render(format != OutputFormat::NoHeaders));
}

// ========== Columns ==========

/// `5s`, `3m`, `2h` or `4d` since the object was created
pub fn age(meta: &ObjectMeta, now: DateTime<Utc>) -> String {
    let Some(created) = meta.creation_timestamp.as_ref() else {
        return String::new();
    };
    format_age((now - created.0).num_seconds())
}

pub fn format_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

/// `OK / total` count of True conditions
pub fn condition_summary<K: Conditioned>(object: &K) -> String {
    let conditions = object.conditions();
    let ok = conditions
        .iter()
        .filter(|c| c.status == ConditionStatus::True)
        .count();
    format!("{ok} OK / {}", conditions.len())
}

/// READY and REASON columns
pub fn ready_columns<K: Conditioned>(object: &K) -> (String, String) {
    match object.ready_condition() {
        Some(ready) => (
            ready.status.to_string(),
            ready.reason.clone().unwrap_or_default(),
        ),
        None => ("Unknown".to_string(), String::new()),
    }
}

fn name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

// ========== Lists ==========

pub fn service_table(services: &[Service], all_namespaces: bool, now: DateTime<Utc>) -> Table {
    let mut header = vec!["NAME", "URL", "LATEST", "AGE", "CONDITIONS", "READY", "REASON"];
    if all_namespaces {
        header.insert(0, "NAMESPACE");
    }
    let mut table = Table::new(&header);
    for service in services {
        let (ready, reason) = ready_columns(service);
        let mut row = vec![
            name(&service.metadata),
            service.url().unwrap_or_default().to_string(),
            service.latest_ready_revision().unwrap_or_default().to_string(),
            age(&service.metadata, now),
            condition_summary(service),
            ready,
            reason,
        ];
        if all_namespaces {
            row.insert(0, service.metadata.namespace.clone().unwrap_or_default());
        }
        table.add_row(row);
    }
    table
}

pub fn print_services(services: &[Service], format: OutputFormat, all_namespaces: bool) -> Result<()> {
    if format.is_machine() {
        return print_object(&services, format);
    }
    if services.is_empty() {
        println!("No services found.");
        return Ok(());
    }
    print_table(&service_table(services, all_namespaces, Utc::now()), format);
    Ok(())
}

/// Revisions with the traffic the parent service sends them
pub fn revision_table(
    revisions: &[Revision],
    services: &[Service],
    all_namespaces: bool,
    now: DateTime<Utc>,
) -> Table {
    let mut header = vec![
        "NAME", "SERVICE", "TRAFFIC", "TAGS", "GENERATION", "AGE", "CONDITIONS", "READY", "REASON",
    ];
    if all_namespaces {
        header.insert(0, "NAMESPACE");
    }
    let mut table = Table::new(&header);
    for revision in revisions {
        let revision_name = name(&revision.metadata);
        let service = revision.service_name().and_then(|s| {
            services.iter().find(|svc| {
                svc.metadata.name.as_deref() == Some(s)
                    && svc.metadata.namespace == revision.metadata.namespace
            })
        });
        let (percent, tags) = service
            .map(|svc| routed_to(svc, &revision_name))
            .unwrap_or_default();
        let (ready, reason) = ready_columns(revision);
        let mut row = vec![
            revision_name,
            revision.service_name().unwrap_or_default().to_string(),
            if percent > 0 { format!("{percent}%") } else { String::new() },
            tags.join(","),
            revision.configuration_generation().to_string(),
            age(&revision.metadata, now),
            condition_summary(revision),
            ready,
            reason,
        ];
        if all_namespaces {
            row.insert(0, revision.metadata.namespace.clone().unwrap_or_default());
        }
        table.add_row(row);
    }
    table
}

/// Percent and tags routed to a revision by a service
fn routed_to(service: &Service, revision: &str) -> (i64, Vec<String>) {
    let latest_ready = service.latest_ready_revision();
    let mut percent = 0;
    let mut tags = Vec::new();
    for target in service.effective_traffic() {
        let matches = match target.revision_name.as_deref() {
            Some(name) => name == revision,
            None => target.is_latest() && latest_ready == Some(revision),
        };
        if matches {
            percent += target.percent_or_zero();
            tags.extend(target.tag.clone());
        }
    }
    (percent, tags)
}

pub fn print_revisions(
    revisions: &[Revision],
    services: &[Service],
    format: OutputFormat,
    all_namespaces: bool,
) -> Result<()> {
    if format.is_machine() {
        return print_object(&revisions, format);
    }
    if revisions.is_empty() {
        println!("No revisions found.");
        return Ok(());
    }
    print_table(
        &revision_table(revisions, services, all_namespaces, Utc::now()),
        format,
    );
    Ok(())
}

pub fn route_table(routes: &[Route], all_namespaces: bool) -> Table {
    let mut header = vec!["NAME", "URL", "READY"];
    if all_namespaces {
        header.insert(0, "NAMESPACE");
    }
    let mut table = Table::new(&header);
    for route in routes {
        let (ready, _) = ready_columns(route);
        let url = route
            .status
            .as_ref()
            .and_then(|s| s.url.clone())
            .unwrap_or_default();
        let mut row = vec![name(&route.metadata), url, ready];
        if all_namespaces {
            row.insert(0, route.metadata.namespace.clone().unwrap_or_default());
        }
        table.add_row(row);
    }
    table
}

pub fn print_routes(routes: &[Route], format: OutputFormat, all_namespaces: bool) -> Result<()> {
    if format.is_machine() {
        return print_object(&routes, format);
    }
    if routes.is_empty() {
        println!("No routes found.");
        return Ok(());
    }
    print_table(&route_table(routes, all_namespaces), format);
    Ok(())
}

// ========== Objects ==========

/// Serialize an object in a machine-readable format
pub fn render_object<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map(|s| s + "\n")
            .map_err(|e| CliError::Other {
                message: e.to_string(),
            }),
        _ => serde_yaml::to_string(value).map_err(|e| CliError::Other {
            message: e.to_string(),
        }),
    }
}

pub fn print_object<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<()> {
    print!("{}", render_object(value, format)?);
    Ok(())
}

// ========== Describe ==========

/// Human-readable service description
pub fn describe_service(description: &ServiceDescription, now: DateTime<Utc>) -> String {
    let service = &description.service;
    let mut out = String::new();
    let field = |out: &mut String, key: &str, value: &str| {
        out.push_str(&format!("{:<11} {value}\n", format!("{key}:")));
    };

    field(&mut out, "Name", &name(&service.metadata));
    field(
        &mut out,
        "Namespace",
        service.metadata.namespace.as_deref().unwrap_or_default(),
    );
    if let Some(annotations) = service.metadata.annotations.as_ref() {
        let shown: Vec<String> = annotations
            .iter()
            .filter(|(k, _)| !k.starts_with("kubectl.kubernetes.io/"))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !shown.is_empty() {
            field(&mut out, "Annotations", &shown.join(", "));
        }
    }
    field(&mut out, "Age", &age(&service.metadata, now));
    field(&mut out, "URL", service.url().unwrap_or_default());
    if let Some(image) = service.image() {
        field(&mut out, "Image", image);
    }

    out.push_str("\nRevisions:\n");
    for summary in &description.revisions {
        let revision = &summary.revision;
        let marker = if revision.is_ready() { "+" } else { "!" };
        let mut line = format!(
            "  {:>4}  {marker} {}",
            format!("{}%", summary.percent),
            name(&revision.metadata)
        );
        if summary.latest {
            line.push_str(" (current @latest)");
        }
        for tag in &summary.tags {
            line.push_str(&format!(" #{tag}"));
        }
        line.push_str(&format!(" [{}]", revision.configuration_generation()));
        line.push_str(&format!(" ({})", age(&revision.metadata, now)));
        out.push_str(&line);
        out.push('\n');
        if let Some(image) = revision.image() {
            out.push_str(&format!("        Image: {image}\n"));
        }
    }

    out.push_str("\nConditions:\n");
    out.push_str(&format!("  {:<4} {:<24} {:<6} {}\n", "OK", "TYPE", "AGE", "REASON"));
    for condition in service.conditions() {
        let ok = match condition.status {
            ConditionStatus::True => "++",
            ConditionStatus::False => "!!",
            ConditionStatus::Unknown => "??",
        };
        out.push_str(&format!(
            "  {ok:<4} {:<24} {:<6} {}\n",
            condition.type_,
            condition
                .last_transition_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| format_age((now - t.with_timezone(&Utc)).num_seconds()))
                .unwrap_or_default(),
            condition.reason.as_deref().unwrap_or_default()
        ));
    }
    out
}

/// Print a one-line success message
pub fn success(message: &str) {
    println!("{} {message}", style("✓").green().bold());
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use knctl_core::resources::{Condition, ServiceStatus};
    use knctl_core::TrafficTarget;
    use std::collections::BTreeMap;

    fn ready_service(name: &str) -> Service {
        let mut service = Service::with_image(name, "default", "img");
        service.metadata.generation = Some(1);
        service.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::minutes(5)));
        service.status = Some(ServiceStatus {
            observed_generation: Some(1),
            conditions: vec![
                Condition::new("ConfigurationsReady", ConditionStatus::True),
                Condition::new("Ready", ConditionStatus::True),
                Condition::new("RoutesReady", ConditionStatus::True),
            ],
            url: Some(format!("http://{name}.example.com")),
            latest_ready_revision_name: Some(format!("{name}-00001")),
            latest_created_revision_name: Some(format!("{name}-00001")),
            traffic: vec![TrafficTarget::revision(format!("{name}-00001"), 100)],
            ..Default::default()
        });
        service
    }

    fn revision(name: &str, service: &str, generation: u32) -> Revision {
        let mut revision = Revision::new(name, Default::default());
        revision.metadata.namespace = Some("default".into());
        revision.metadata.labels = Some(BTreeMap::from([
            ("serving.knative.dev/service".to_string(), service.to_string()),
            (
                "serving.knative.dev/configurationGeneration".to_string(),
                generation.to_string(),
            ),
        ]));
        revision
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-3), "0s");
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(300), "5m");
        assert_eq!(format_age(7200), "2h");
        assert_eq!(format_age(3 * 86_400), "3d");
    }

    #[test]
    fn test_service_table() {
        let table = service_table(&[ready_service("foo")], false, Utc::now());
        let out = table.render(true);
        let mut lines = out.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("NAME"));
        assert!(header.contains("URL"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("foo "));
        assert!(row.contains("http://foo.example.com"));
        assert!(row.contains("3 OK / 3"));
        assert!(row.contains("True"));
        assert!(row.contains("5m"));

        assert!(!table.render(false).contains("NAME"));
    }

    #[test]
    fn test_all_namespaces_column() {
        let out = service_table(&[ready_service("foo")], true, Utc::now()).render(true);
        assert!(out.starts_with("NAMESPACE"));
        assert!(out.lines().nth(1).unwrap().starts_with("default"));
    }

    #[test]
    fn test_revision_table_traffic() {
        let services = [ready_service("foo")];
        let revisions = [revision("foo-00001", "foo", 1), revision("foo-00000", "foo", 0)];
        let out = revision_table(&revisions, &services, false, Utc::now()).render(false);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].contains("100%"));
        assert!(!lines[1].contains('%'));
    }

    #[test]
    fn test_render_object() {
        let service = ready_service("foo");
        let yaml = render_object(&service, OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("kind: Service"));
        let json = render_object(&service, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["metadata"]["name"], "foo");
    }

    #[test]
    fn test_describe_service() {
        let service = ready_service("foo");
        let description = ServiceDescription {
            revisions: vec![knctl_kube::RevisionSummary {
                revision: revision("foo-00001", "foo", 1),
                percent: 100,
                tags: vec!["stable".into()],
                latest: false,
            }],
            service,
        };
        let out = describe_service(&description, Utc::now());
        assert!(out.contains("Name:       foo"));
        assert!(out.contains("URL:        http://foo.example.com"));
        assert!(out.contains("100%"));
        assert!(out.contains("foo-00001 #stable [1]"));
        assert!(out.contains("RoutesReady"));
    }
}
