//! Human-readable report text for the terminal.

use std::fmt::Write as _;

use zoneshift_core::{MigrationPlan, PlanAction, Step, TaskStatus};
use zoneshift_engine::{Discovery, RestoreReport, ScaleMode};

const PVC_COL: usize = 40;
const ZONE_COL: usize = 14;
const REASON_MAX: usize = 60;

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", keep)
}

fn rule(title: &str) -> String {
    format!("{}\n{}\n", title, "=".repeat(title.len()))
}

pub fn plan(plan: &MigrationPlan) -> String {
    let mut out = rule("MIGRATION PLAN");
    out.push('\n');
    out.push_str("Configuration:\n");
    let _ = writeln!(out, "  Target Zone:   {}", plan.target_zone);
    let _ = writeln!(out, "  Storage Class: {}", plan.storage_class);
    let _ = writeln!(out, "  Namespaces:    {}", plan.namespaces.join(", "));
    let _ = writeln!(out, "  Concurrency:   {}", plan.concurrency);
    if plan.dry_run {
        out.push_str("  DRY RUN: no changes will be made\n");
    }

    let _ = writeln!(out, "\nPVCs to Process ({}):", plan.items.len());
    let counts: Vec<String> =
        PlanAction::ALL.iter().map(|a| format!("{}: {}", a.label(), plan.count(*a))).collect();
    let _ = writeln!(out, "  {}\n", counts.join("  "));

    let _ = writeln!(out, "{:<pw$}{:<zw$}{}", "PVC", "Current Zone", "Action", pw = PVC_COL, zw = ZONE_COL);
    let _ = writeln!(out, "{}", "-".repeat(PVC_COL + ZONE_COL + 25));
    for item in &plan.items {
        let zone = item.current_zone.as_deref().filter(|z| !z.is_empty()).unwrap_or("N/A");
        let action = match item.action {
            PlanAction::Migrate => format!("✓ Will migrate → {}", item.target_zone),
            PlanAction::Skip => "○ Skip (same AZ)".to_string(),
            PlanAction::Error => {
                format!("✗ {}", truncate(item.reason.as_deref().unwrap_or("unknown error"), REASON_MAX))
            }
        };
        let _ = writeln!(
            out,
            "{:<pw$}{:<zw$}{}",
            truncate(&item.name, PVC_COL - 2),
            zone,
            action,
            pw = PVC_COL,
            zw = ZONE_COL
        );
        if item.action == PlanAction::Migrate {
            let _ = writeln!(
                out,
                "  └─ {}, Volume: {}",
                item.capacity.as_deref().unwrap_or("?"),
                item.volume_id.as_deref().unwrap_or("?")
            );
        }
    }

    let migrating = plan.count(PlanAction::Migrate);
    if migrating > 0 {
        out.push_str("\nActions to be performed:\n");
        let _ = writeln!(out, "  1. Create EBS snapshots for {} volume(s)", migrating);
        let _ = writeln!(out, "  2. Create new volumes in {}", plan.target_zone);
        out.push_str("  3. Delete old PVCs and PVs\n");
        out.push_str("  4. Create new static PVs and PVCs bound to the new volumes\n");
    } else {
        out.push_str("\nNothing to migrate.\n");
    }
    out
}

pub fn discovery(tasks: &[String], discovery: &Discovery, scale_mode: ScaleMode, dry_run: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Found {} PVC(s) to process:", tasks.len());
    for t in tasks {
        let _ = writeln!(out, "  - {}", t);
    }

    let apps: Vec<_> = discovery.namespaces.iter().flat_map(|n| n.sync_apps.iter()).collect();
    if !apps.is_empty() {
        let _ = writeln!(out, "\nArgo CD applications with auto-sync ({}):", apps.len());
        for app in apps {
            let _ = writeln!(out, "  - {}", app.qualified_name());
        }
    }

    if discovery.workload_count() > 0 {
        let note = match (dry_run, scale_mode) {
            (true, _) => " (dry run: left running)",
            (false, ScaleMode::Manual) => " (manual: scale them yourself)",
            (false, ScaleMode::Auto) => "",
        };
        let _ = writeln!(out, "\nWorkloads to scale down ({}){}:", discovery.workload_count(), note);
        for ns in &discovery.namespaces {
            for w in &ns.workloads {
                let _ = writeln!(out, "  - {}/{} {} ({} replicas)", ns.namespace, w.name, w.kind, w.replicas);
            }
        }
    }
    out
}

/// `kubectl scale` lines the operator runs in manual mode.
pub fn manual_scale_commands(discovery: &Discovery, context: Option<&str>) -> Vec<String> {
    let ctx = context.map(|c| format!(" --context={}", c)).unwrap_or_default();
    discovery
        .namespaces
        .iter()
        .flat_map(|ns| {
            ns.workloads.iter().map(move |w| {
                format!("kubectl scale {} {} --replicas=0 -n {}", w.kind.kubectl_resource(), w.name, ns.namespace)
            })
        })
        .map(|cmd| format!("{}{}", cmd, ctx))
        .collect()
}

/// One line per observed step change.
pub fn transition(status: &TaskStatus) -> String {
    match status.step {
        Step::Failed => format!("[{}] Failed: {}", status.name, status.error.as_deref().unwrap_or("unknown error")),
        step if step.reports_progress() => format!("[{}] {} {}%", status.name, step.label(), status.progress),
        step => format!("[{}] {}", status.name, step.label()),
    }
}

fn seconds(status: &TaskStatus) -> String {
    status.elapsed().map(|d| format!(" ({}s)", d.num_seconds())).unwrap_or_default()
}

pub fn summary(statuses: &[TaskStatus], target_zone: &str) -> String {
    let mut out = String::new();
    let (mut ok, mut skipped, mut failed, mut other) = (0, 0, 0, 0);
    let mut lines = String::new();
    for s in statuses {
        match s.step {
            Step::Done => {
                ok += 1;
                let moved = match (&s.old_volume_id, &s.new_volume_id) {
                    (Some(old), Some(new)) => format!(" {} -> {}", old, new),
                    _ => String::new(),
                };
                let _ = writeln!(lines, "  ✓ {}{}{}", s.name, moved, seconds(s));
            }
            Step::Skipped => {
                skipped += 1;
                let _ = writeln!(lines, "  ○ {} already in {}", s.name, target_zone);
            }
            Step::Failed => {
                failed += 1;
                let _ = writeln!(lines, "  ✗ {}: {}", s.name, s.error.as_deref().unwrap_or("unknown error"));
            }
            step => {
                other += 1;
                let _ = writeln!(lines, "  ? {} stopped at {}", s.name, step.label());
            }
        }
    }
    out.push_str(&rule("MIGRATION SUMMARY"));
    let _ = writeln!(out, "Succeeded: {}  Skipped: {}  Failed: {}", ok, skipped, failed);
    if other > 0 {
        let _ = writeln!(out, "Unfinished: {}", other);
    }
    out.push('\n');
    out.push_str(&lines);
    out
}

/// Empty when every restoration went through.
pub fn restore_warnings(report: &RestoreReport) -> String {
    if report.is_clean() {
        return String::new();
    }
    let mut out = format!(
        "WARNING: {} of {} restoration(s) failed. Run these by hand:\n",
        report.failures.len(),
        report.attempted
    );
    for f in &report.failures {
        let _ = writeln!(out, "  - {}: {}", f.target, f.error);
        let _ = writeln!(out, "    {}", f.target.manual_action());
    }
    out
}
