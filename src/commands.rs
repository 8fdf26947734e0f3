//! CLI command handlers.
//!
//! Each `run_*` function opens the service, performs one operation and
//! prints the result to stdout, either as text or as JSON with `--json`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::time::Duration;

use context_bundler_core::models::{BuildStatus, ContextBundle};

use crate::config::Config;
use crate::service::{BuildStatusReport, ContextService, GetContextOptions, TriggerOptions};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_bundle_summary(bundle: &ContextBundle) {
    println!(
        "{}/{}: {} documents, {} tokens",
        bundle.project,
        bundle.document_type,
        bundle.included_ids.len(),
        bundle.total_tokens
    );
    for chunk in &bundle.chunks {
        println!(
            "  + {} ({} tokens, score {:.3})",
            chunk.document_id, chunk.tokens, chunk.score
        );
    }
    for id in &bundle.excluded_ids {
        println!("  - {}", id);
    }
}

fn print_status(project: &str, document_type: &str, report: &BuildStatusReport) {
    println!("{}/{}: {}", project, document_type, report.status);
    if let Some(age) = report.age_secs {
        println!("  age: {}s", age);
    }
    if let Some(reason) = &report.failure_reason {
        println!("  failure: {}", reason);
    }
    if let Some(meta) = &report.meta {
        println!("  build: {}", meta.build_id);
        println!(
            "  model: {} (budget {} tokens)",
            meta.model_category, meta.token_budget
        );
        if meta.is_override {
            println!("  manual selection");
        }
        if !meta.oversized_ids.is_empty() {
            println!("  oversized: {}", meta.oversized_ids.join(", "));
        }
    }
}

/// `ctxb get`: returns the bundle, building it in-process if needed.
pub async fn run_get(
    config: &Config,
    project: &str,
    document_type: &str,
    force: bool,
    wait_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let service = ContextService::open(config).await?;
    let options = GetContextOptions {
        force_rebuild: force,
    };
    let mut response = service
        .get_context(project, document_type, options)
        .await?;

    if response.status.is_in_flight() {
        // Builds run in this process, so wait for them before exiting
        let wait = wait_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.cache.debounce() + config.cache.build_timeout());
        service.wait_for_build(project, document_type, wait).await?;
        response = service
            .get_context(project, document_type, GetContextOptions::default())
            .await?;
    }

    if json {
        return print_json(&response);
    }
    match (&response.status, &response.bundle) {
        (BuildStatus::Ready, Some(bundle)) => {
            println!("{}", bundle.render());
            Ok(())
        }
        (BuildStatus::Failed, _) => bail!(
            "build failed: {}",
            response.failure_reason.unwrap_or_default()
        ),
        (status, _) => bail!("bundle not available (status {})", status),
    }
}

/// `ctxb build`: runs a build now, or waits out the debounce first.
pub async fn run_build(
    config: &Config,
    project: &str,
    document_type: &str,
    now: bool,
) -> Result<()> {
    let service = ContextService::open(config).await?;
    let response = service
        .trigger_build(project, document_type, TriggerOptions { immediate: now })
        .await?;

    if !now {
        if !response.scheduled {
            println!("{}/{}: build already in progress", project, document_type);
            return Ok(());
        }
        let wait = config.cache.debounce() + config.cache.build_timeout();
        let report = service.wait_for_build(project, document_type, wait).await?;
        print_status(project, document_type, &report);
        return Ok(());
    }

    if let Some(build) = &response.build {
        println!("{}/{}: {}", project, document_type, build.status);
        if let Some(reason) = &build.failure_reason {
            println!("  failure: {}", reason);
        } else {
            println!(
                "  {} included, {} excluded, {} tokens",
                build.included_ids.len(),
                build.excluded_ids.len(),
                build.total_tokens
            );
        }
    }
    Ok(())
}

pub async fn run_status(config: &Config, project: &str, document_type: &str) -> Result<()> {
    let service = ContextService::open(config).await?;
    let report = service.get_build_status(project, document_type).await?;
    print_status(project, document_type, &report);
    Ok(())
}

pub async fn run_overflow(
    config: &Config,
    project: &str,
    document_type: &str,
    model: Option<&str>,
    json: bool,
) -> Result<()> {
    let service = ContextService::open(config).await?;
    let report = service
        .check_overflow(project, document_type, model)
        .await?;
    if json {
        return print_json(&report);
    }

    println!(
        "{}/{} on {}: {} / {} tokens{}",
        project,
        document_type,
        report.model_category,
        report.total_tokens,
        report.max_context_tokens,
        if report.will_overflow {
            format!(" (over by {})", report.excess_tokens())
        } else {
            String::new()
        }
    );
    for entry in &report.documents {
        println!(
            "  {:>3}. {} {:<40} {:>8} tokens  {:>8} cumulative  score {:.3}",
            entry.rank,
            if entry.included { "+" } else { "-" },
            entry.id,
            entry.tokens,
            entry.cumulative_tokens,
            entry.score
        );
    }
    if !report.oversized_ids.is_empty() {
        println!("  oversized: {}", report.oversized_ids.join(", "));
    }
    Ok(())
}

pub async fn run_select(
    config: &Config,
    project: &str,
    document_type: &str,
    ids: &[String],
    model: Option<&str>,
) -> Result<()> {
    let service = ContextService::open(config).await?;
    let bundle = service
        .apply_selection(project, document_type, ids, model)
        .await?;
    print_bundle_summary(&bundle);
    Ok(())
}

pub async fn run_clear(config: &Config, project: &str, document_type: &str) -> Result<()> {
    let service = ContextService::open(config).await?;
    if service.clear_cache(project, document_type).await? {
        println!("{}/{}: cleared", project, document_type);
    } else {
        println!(
            "{}/{}: build in progress, not cleared",
            project, document_type
        );
    }
    Ok(())
}

pub async fn run_cleanup(config: &Config, max_age_hours: Option<u64>) -> Result<()> {
    let service = ContextService::open(config).await?;
    let hours = max_age_hours.unwrap_or(config.cache.cleanup_max_age_hours);
    let purged = service.cleanup(hours).await?;
    println!("Purged {} entries older than {}h.", purged, hours);
    Ok(())
}
