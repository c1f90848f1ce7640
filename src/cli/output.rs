//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ClusterSpec, ValidationResult};
use crate::planner::OpKind;
use crate::reconciler::{DriftReport, PlanReport, ReconciliationResult};
use crate::state::{LockInfo, ObservedSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, report: &PlanReport, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(report, detailed),
        }
    }

    fn format_plan_text(report: &PlanReport, detailed: bool) -> String {
        let plan = &report.plan;
        if plan.is_empty() {
            return format!(
                "{} No changes required - cluster is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution Plan\n");
        let _ = write!(output, "   Spec hash: {}\n\n", Self::short(&plan.spec_hash));

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| PlanStepRow {
                index: i + 1,
                action: Self::format_op(step.op),
                resource: step.node_id.to_string(),
                after: Self::truncate(
                    &step
                        .prerequisites
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                    50,
                ),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in report.diff.changes().filter(|c| !c.changed_fields.is_empty()) {
                let _ = writeln!(output, "\n  ~ {}", change.node_id);
                for field in &change.changed_fields {
                    let _ = writeln!(output, "      {field}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            report.diff.creates.to_string().green(),
            report.diff.updates.to_string().yellow(),
            report.diff.deletes.to_string().red(),
            report.diff.unchanged
        );

        output
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation incomplete", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged.len());

                if !result.failed.is_empty() {
                    let _ = write!(output, "\n{} Failed:\n", "✗".red());
                    for failure in &result.failed {
                        let _ = writeln!(output, "   - {} {}: {}", failure.op, failure.node_id, failure.error);
                    }
                }
                if !result.blocked.is_empty() {
                    let _ = write!(output, "\n{} Blocked:\n", "⚠".yellow());
                    for blocked in &result.blocked {
                        let _ = writeln!(output, "   - {} {}: {}", blocked.op, blocked.node_id, blocked.error);
                    }
                }

                let outputs = &result.outputs;
                if outputs.cluster_id.is_some() {
                    output.push_str("\nOutputs:\n");
                    let none = String::from("-");
                    let _ = writeln!(output, "   Cluster: {}", outputs.cluster_id.as_ref().unwrap_or(&none));
                    let _ = writeln!(output, "   Endpoint: {}", outputs.endpoint.as_ref().unwrap_or(&none));
                    let _ = writeln!(
                        output,
                        "   OIDC issuer: {}",
                        outputs.oidc_issuer_url.as_ref().unwrap_or(&none)
                    );
                    for (pool, id) in &outputs.node_pools {
                        let _ = writeln!(output, "   Node pool {pool}: {id}");
                    }
                }

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() && report.errors.is_empty() {
                    return format!(
                        "{} No drift detected across {} resource(s).\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in &report.drifted {
                    let _ = writeln!(output, "   ~ {}", entry.node_id);
                    for field in &entry.fields {
                        let _ = writeln!(output, "       {field}");
                    }
                }
                for id in &report.missing {
                    let _ = writeln!(output, "   - {id} {}", "(missing)".red());
                }
                for (id, error) in &report.errors {
                    let _ = writeln!(output, "   ? {id}: {error}");
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len() + report.missing.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats the recorded state of a cluster.
    #[must_use]
    pub fn format_state(&self, snapshot: &ObservedSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "resources": snapshot.values().collect::<Vec<_>>(),
                    "lock": lock,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if snapshot.is_empty() {
                    return String::from("No state found.\n");
                }

                let rows: Vec<StateRow> = snapshot
                    .values()
                    .map(|s| StateRow {
                        resource: s.id.to_string(),
                        provider_id: Self::truncate(&s.provider_id, 60),
                        fingerprint: Self::short(&s.fingerprint),
                        updated: s.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "\nLocked by {} ({}s remaining)",
                        lock.holder,
                        lock.remaining_secs()
                    );
                }
                output
            }
        }
    }

    /// Formats a validation outcome.
    #[must_use]
    pub fn format_validation(&self, spec: &ClusterSpec, result: &ValidationResult, warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "cluster": spec.cluster.name,
                    "cloud": spec.cloud,
                    "node_pools": spec.node_pools.len(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Manifest is valid\n", "✓".green());
                if warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                output.push_str("\nCluster summary:\n");
                let _ = writeln!(output, "  Cluster: {}", spec.cluster.name);
                let _ = writeln!(output, "  Cloud: {}", spec.cloud);
                let _ = writeln!(output, "  Region: {}", spec.cluster.region);
                let _ = writeln!(output, "  Node pools: {}", spec.node_pools.len());
                let _ = writeln!(output, "  Add-ons: {}", spec.addons.enabled().len());
                output
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn format_message(&self, success: bool, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let status = if success { "success" } else { "error" };
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text if success => format!("{} {message}", "✓".green()),
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }

    fn format_op(op: OpKind) -> String {
        match op {
            OpKind::Create => "+create".green().to_string(),
            OpKind::Update => "~update".yellow().to_string(),
            OpKind::Delete => "-delete".red().to_string(),
            OpKind::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn short(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_short_strings() {
        assert_eq!(OutputFormatter::truncate("node-pool:default", 40), "node-pool:default");
        assert_eq!(OutputFormatter::truncate("abcdefghij", 6), "abc...");
    }

    #[test]
    fn test_empty_state_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(formatter.format_state(&ObservedSnapshot::new(), None), "No state found.\n");
    }

    #[test]
    fn test_message_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&formatter.format_message(false, "lock held")).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "lock held");
    }
}
