//! Formatted terminal output.
//!
//! Everything printed to stdout is built here so output changes stay localized.
//! Diagnostics go through `tracing` instead.

use crate::domain::{FittedModel, Job, JobState, RetryPolicy};
use crate::queue::QueueSnapshot;
use crate::report::ExperimentSummary;
use crate::worker::WorkerSummary;

/// `"{exp} has {N} units firing at {X} kHz total with {B} bursts"`.
pub fn format_experiment_line(summary: &ExperimentSummary) -> String {
    format!(
        "{} has {} units firing at {:.2} kHz total with {} bursts",
        summary.experiment, summary.n_units, summary.total_rate_khz, summary.n_bursts
    )
}

pub fn format_missing_model(experiment: &str, n_states: u32) -> String {
    format!("No model for {experiment} with {n_states} states!")
}

/// Sweep report: one block per experiment, then a per-model entropy table.
pub fn format_sweep_summary(summaries: &[ExperimentSummary]) -> String {
    let mut out = String::new();

    for s in summaries {
        out.push_str(&format_experiment_line(s));
        out.push('\n');
        if !s.top_units.is_empty() {
            let ids: Vec<String> = s.top_units.iter().map(|u| u.to_string()).collect();
            out.push_str(&format!("  most active units: {}\n", ids.join(", ")));
        }
        for &n in &s.missing {
            out.push_str(&format_missing_model(&s.experiment, n));
            out.push('\n');
        }
    }
    out.push('\n');

    push_row(&mut out, format!("{:<20} {:>6} {:>12} {:>12} {:>8}", "experiment", "states", "entropy", "baseline", "bursts"));
    push_row(&mut out, format!("{:-<20} {:-<6} {:-<12} {:-<12} {:-<8}", "", "", "", "", ""));
    for s in summaries {
        for m in &s.models {
            push_row(
                &mut out,
                format!(
                    "{:<20} {:>6} {:>12.4} {:>12.4} {:>8}",
                    truncate(&s.experiment, 20),
                    m.n_states,
                    m.mean_entropy,
                    m.baseline_entropy,
                    m.n_bursts
                ),
            );
        }
    }

    out.push('\n');
    for s in summaries {
        let entropy = s.mean_entropy().map(|h| format!("{h:.4}")).unwrap_or_else(|| "n/a".into());
        let baseline = s
            .baseline_stats()
            .map(|(mu, sd)| format!("{mu:.4} ± {sd:.4}"))
            .unwrap_or_else(|| "n/a".into());
        out.push_str(&format!(
            "{}: mean entropy {entropy} bits, baseline {baseline} bits ({} of {} models)\n",
            s.experiment,
            s.models.len(),
            s.models.len() + s.missing.len(),
        ));
    }

    out
}

/// Queue status: counts per state, then one row per job.
pub fn format_queue_status(snapshot: &QueueSnapshot, policy: RetryPolicy) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Queue: {} pending | {} leased | {} abandoned (max attempts {})\n",
        snapshot.pending.len(),
        snapshot.leased.len(),
        snapshot.abandoned.len(),
        policy.max_attempts,
    ));
    if snapshot.total() == 0 {
        return out;
    }
    out.push('\n');

    push_row(
        &mut out,
        format!("{:<10} {:<44} {:>8} {:<20} {}", "state", "key", "attempts", "since", "last error"),
    );
    push_row(&mut out, format!("{:-<10} {:-<44} {:-<8} {:-<20} {:-<10}", "", "", "", "", ""));

    let groups = [
        (JobState::Pending, &snapshot.pending),
        (JobState::Leased, &snapshot.leased),
        (JobState::Abandoned, &snapshot.abandoned),
    ];
    for (state, jobs) in groups {
        for job in jobs {
            push_row(&mut out, job_row(state, job));
        }
    }
    out
}

fn job_row(state: JobState, job: &Job) -> String {
    let since = job.leased_at.unwrap_or(job.enqueued_at);
    format!(
        "{:<10} {:<44} {:>8} {:<20} {}",
        state.to_string(),
        truncate(&job.key.to_string(), 44),
        job.attempts,
        since.format("%Y-%m-%d %H:%M:%S"),
        job.last_error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default(),
    )
}

pub fn format_worker_summary(summary: &WorkerSummary) -> String {
    format!(
        "Worker done: {} succeeded, {} retried, {} failed after retries, {} abandoned, {} queue errors",
        summary.succeeded, summary.retried, summary.failed, summary.abandoned, summary.queue_errors
    )
}

/// Details of one cached model.
pub fn format_model(model: &FittedModel) -> String {
    let mut out = String::new();
    out.push_str(&format!("Model: {}\n", model.key));
    out.push_str(&format!("- path       : {}\n", model.key.storage_path().display()));
    out.push_str(&format!("- states     : {}\n", model.hmm.n_states()));
    out.push_str(&format!("- units      : {}\n", model.hmm.n_units()));
    out.push_str(&format!("- loglik     : {:.4}\n", model.log_likelihood));
    out.push_str(&format!(
        "- iterations : {} ({})\n",
        model.iterations,
        if model.converged { "converged" } else { "not converged" }
    ));
    out.push_str(&format!("- attempt    : {}\n", model.attempt));
    out.push_str(&format!("- fitted at  : {}\n", model.fitted_at.to_rfc3339()));
    out.push_str(&format!("- initial    : {}\n", fmt_vec(model.hmm.initial().as_slice())));
    out
}

fn push_row(out: &mut String, row: String) {
    out.push_str(row.trim_end());
    out.push('\n');
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
