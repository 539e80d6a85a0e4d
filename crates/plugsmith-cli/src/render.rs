use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use plugsmith_core::{ErrorContext, Event, EventType, ResourceKey, ResourceState};
use plugsmith_installer::{Detection, DetectionOutcome, InstallOutcome, InstallReceipt};
use plugsmith_state::{EventBroadcaster, ReconcileReport, ResourceRecord};
use serde_json::Value;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, no_color: bool) -> OutputStyle {
    if stdout_is_tty && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    resolve_output_style(std::io::stdout().is_terminal(), no_color)
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

pub(crate) fn render_error_lines(style: OutputStyle, message: &str, hint: Option<&str>) -> Vec<String> {
    let (error_label, hint_label) = match style {
        OutputStyle::Plain => ("error:".to_string(), "hint:".to_string()),
        OutputStyle::Rich => (
            colorize(error_style(), "error:"),
            colorize(hint_style(), "hint:"),
        ),
    };
    let mut lines = vec![format!("{error_label} {message}")];
    if let Some(hint) = hint {
        lines.push(format!("{hint_label} {hint}"));
    }
    lines
}

pub(crate) fn format_status_lines(
    key: &ResourceKey,
    state: ResourceState,
    error: Option<&ErrorContext>,
) -> Vec<String> {
    let mut lines = vec![format!("{key}: {state}")];
    if let Some(error) = error {
        lines.push(format!("  error: {} (source={})", error.message, error.source));
        lines.push(format!(
            "  recoverable: {} retries: {}",
            error.recoverable, error.retry_count
        ));
    }
    lines
}

pub(crate) fn format_detection_lines(detection: &Detection) -> Vec<String> {
    let how = match &detection.outcome {
        DetectionOutcome::Skipped => "unchanged".to_string(),
        DetectionOutcome::Host => "found on host".to_string(),
        DetectionOutcome::Cached => "cached".to_string(),
        DetectionOutcome::Probed => "probed source".to_string(),
        DetectionOutcome::Failed(reason) => format!("failed: {reason}"),
    };
    let mut line = format!("{}: {} ({how})", detection.resource, detection.state);
    if let Some(version) = &detection.content_version {
        line.push_str(&format!(" version={version}"));
    }
    vec![line]
}

pub(crate) fn format_install_outcome_lines(outcome: &InstallOutcome, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "installed {} ({}) into plugins/{}",
            outcome.resource, outcome.branch, outcome.directory
        ),
    )];
    lines.push(format!("  entry: {}", outcome.host_identifier));
    lines.push(format!("  sha256: {}", outcome.archive_sha256));
    lines.push(format!("  state: {}", outcome.state));
    if let Some(err) = &outcome.activation_error {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("activation failed: {}", err.message),
        ));
    }
    lines
}

pub(crate) fn format_reconcile_lines(report: &ReconcileReport, style: OutputStyle) -> Vec<String> {
    if report.skipped {
        return vec![render_status_line(
            style,
            "warn",
            "host unavailable; reconciliation skipped",
        )];
    }
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "checked {}, corrected {}",
            report.checked,
            report.corrected.len()
        ),
    )];
    for correction in &report.corrected {
        let host = correction.host_identifier.as_deref().unwrap_or("absent");
        lines.push(format!(
            "  {}: {} -> {} (host {host})",
            correction.resource, correction.from, correction.to
        ));
    }
    lines
}

pub(crate) fn format_list_lines(
    records: &BTreeMap<String, ResourceRecord>,
    receipts: &[InstallReceipt],
) -> Vec<String> {
    if records.is_empty() {
        return vec!["No tracked resources".to_string()];
    }
    records
        .iter()
        .map(|(key, record)| {
            match receipts.iter().find(|receipt| receipt.key.to_string() == *key) {
                Some(receipt) => format!(
                    "{key} {} {} {}",
                    record.state, receipt.directory, receipt.content_version
                ),
                None => format!("{key} {}", record.state),
            }
        })
        .collect()
}

pub(crate) fn format_event_line(event: &Event) -> String {
    format!(
        "{} {} {} {} {}",
        event.id,
        event.timestamp,
        event.event_type.as_str(),
        event.resource.as_deref().unwrap_or("-"),
        event.payload
    )
}

/// One-line summary of an `InstallProgress` payload.
pub(crate) fn describe_progress(payload: &Value) -> Option<String> {
    let step = payload.get("step")?.as_str()?;
    let status = payload.get("status")?.as_str()?;
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if message.is_empty() {
        Some(format!("{step} {status}"))
    } else {
        Some(format!("{step} {status}: {message}"))
    }
}

/// Spinner following a resource's install progress events. Plain output gets
/// no spinner.
pub(crate) struct InstallProgress {
    progress_bar: Option<ProgressBar>,
}

impl InstallProgress {
    pub(crate) fn attach(events: &EventBroadcaster, style: OutputStyle, resource: &ResourceKey) -> Self {
        if style == OutputStyle::Plain {
            return Self { progress_bar: None };
        }

        let progress_bar = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {prefix:.bold} {msg}") {
            progress_bar.set_style(template.tick_chars(".oO@* "));
        }
        progress_bar.set_prefix(resource.to_string());
        progress_bar.enable_steady_tick(Duration::from_millis(80));

        let listener_bar = progress_bar.clone();
        let key = resource.to_string();
        events.subscribe(Box::new(move |event| {
            if event.event_type != EventType::InstallProgress
                || event.resource.as_deref() != Some(key.as_str())
            {
                return;
            }
            if let Some(line) = describe_progress(&event.payload) {
                listener_bar.set_message(line);
            }
        }));

        Self {
            progress_bar: Some(progress_bar),
        }
    }

    pub(crate) fn finish(self) {
        if let Some(progress_bar) = self.progress_bar {
            progress_bar.finish_and_clear();
        }
    }
}

fn error_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightRed.into()))
        .effects(Effects::BOLD)
}

fn hint_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::Yellow.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
