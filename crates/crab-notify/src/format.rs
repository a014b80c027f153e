//! Alert body formatting. The engine is format-agnostic; everything
//! human-readable is produced here from the delta, recent events, the
//! display timezone and the rule's include_output flag.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crab_core::{EventRecord, JobOutput, JobRecord};
use crab_monitor::StatusDelta;

/// Short subject line: `crab: backup on hostA: fail`.
pub fn subject(job: &JobRecord, delta: &StatusDelta) -> String {
    format!("crab: {} on {}: {}", display_name(job), job.host, delta.new)
}

/// Plain-text alert body.
pub fn body(
    job: &JobRecord,
    delta: &StatusDelta,
    events: &[EventRecord],
    output: Option<&JobOutput>,
    tz: Tz,
    include_output: bool,
) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Job:      {} on {}", display_name(job), job.host));
    lines.push(format!("Command:  {}", job.command));
    lines.push(format!(
        "Status:   {} (was {}) at {}",
        delta.new,
        delta.old,
        local(delta.at, tz)
    ));
    lines.push(String::new());

    if !events.is_empty() {
        lines.push("Recent events:".to_string());
        for event in events.iter().rev() {
            let status = match event.status {
                Some(code) => format!(" status={code}"),
                None => String::new(),
            };
            lines.push(format!(
                "  {}  {}{}",
                local(event.datetime, tz),
                event.kind,
                status
            ));
        }
        lines.push(String::new());
    }

    if include_output {
        if let Some(output) = output {
            if let Some(stdout) = &output.stdout {
                if !stdout.is_empty() {
                    lines.push("Stdout:".to_string());
                    lines.push(indent(stdout));
                }
            }
            if let Some(stderr) = &output.stderr {
                if !stderr.is_empty() {
                    lines.push("Stderr:".to_string());
                    lines.push(indent(stderr));
                }
            }
        }
    }

    lines.join("\n")
}

fn display_name(job: &JobRecord) -> &str {
    job.crabid.as_deref().unwrap_or(&job.command)
}

fn local(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

fn indent(text: &str) -> String {
    text.trim_end()
        .lines()
        .map(|l| format!("  {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
