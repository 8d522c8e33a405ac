use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::model::{
    DependencyKind, DeploymentSample, DryRunCatalog, NetworkLink, Pipeline, Resource,
    ResourcePool, StepMetricsSample, StepPerformanceSample,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed row in {table}: {source}")]
    Csv {
        table: String,
        #[source]
        source: csv::Error,
    },
    #[error("unknown step '{step}' in {table}")]
    UnknownStep { step: String, table: String },
    #[error("unknown resource '{resource}' in {table}")]
    UnknownResource { resource: String, table: String },
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("invalid dependency kind '{0}' (expected 'sync' or 'async')")]
    InvalidDependencyKind(String),
}

// ---------------------------------------------------------------------------
// Timestamp parsing helpers
// ---------------------------------------------------------------------------

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse the timestamp column, accepting a handful of ISO 8601 shapes and
/// ignoring a trailing Z or numeric timezone offset.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, IngestError> {
    let s = raw.trim().trim_end_matches('Z');
    let s = match s.rfind('+') {
        Some(pos) if pos > 10 => &s[..pos],
        _ => s,
    };
    let s = if s.len() > 19 && s.as_bytes().get(19) == Some(&b'-') {
        &s[..19]
    } else {
        s
    };

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(IngestError::InvalidTimestamp(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PipelineRow {
    step: String,
    prerequisite: Option<String>,
    kind: Option<String>,
    scalable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ResourceRow {
    name: String,
    cpu_cores: f64,
    memory_bytes: u64,
    cost_per_second: f64,
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    source: String,
    target: String,
    bandwidth_bytes_per_sec: f64,
    latency_ms: f64,
}

#[derive(Debug, Deserialize)]
struct StepMetricsRow {
    dry_run_id: String,
    timestamp: String,
    step: String,
    resource: String,
    num_inputs: u64,
    input_bytes: u64,
    num_outputs: u64,
    output_bytes: u64,
    step_processing_ms: f64,
    data_transmission_ms: f64,
}

#[derive(Debug, Deserialize)]
struct PerformanceRow {
    dry_run_id: String,
    timestamp: String,
    step: String,
    resource: String,
    max_cpu_pct: f64,
    avg_cpu_pct: f64,
    max_mem_mb: f64,
}

#[derive(Debug, Deserialize)]
struct DeploymentRow {
    step: String,
    resource: String,
    avg_download_seconds: f64,
    avg_instance_start_seconds: f64,
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

fn rows<R: Read, T: for<'de> Deserialize<'de>>(
    reader: R,
    table: &str,
) -> Result<Vec<T>, IngestError> {
    let mut reader = csv::Reader::from_reader(reader);
    reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(|source| IngestError::Csv {
            table: table.to_string(),
            source,
        })
}

fn lookup_step(
    pipeline: &Pipeline,
    name: &str,
    table: &str,
) -> Result<crate::model::StepId, IngestError> {
    pipeline
        .step_id(name)
        .ok_or_else(|| IngestError::UnknownStep {
            step: name.to_string(),
            table: table.to_string(),
        })
}

fn lookup_resource(
    pool: &ResourcePool,
    name: &str,
    table: &str,
) -> Result<crate::model::ResourceId, IngestError> {
    pool.resource_id(name)
        .ok_or_else(|| IngestError::UnknownResource {
            resource: name.to_string(),
            table: table.to_string(),
        })
}

/// Read the pipeline descriptor: one row per step or per dependency edge.
/// Roots appear with an empty prerequisite column.
pub fn read_pipeline<R: Read>(reader: R) -> Result<Pipeline, IngestError> {
    let mut pipeline = Pipeline::new();
    for row in rows::<_, PipelineRow>(reader, "pipeline")? {
        let step = pipeline.add_step(&row.step);
        let Some(prerequisite) = row.prerequisite.filter(|p| !p.is_empty()) else {
            continue;
        };
        let predecessor = pipeline.add_step(&prerequisite);
        let kind = match row.kind.as_deref() {
            Some("sync") => DependencyKind::Synchronous,
            Some("async") => DependencyKind::Asynchronous,
            other => {
                return Err(IngestError::InvalidDependencyKind(
                    other.unwrap_or("").to_string(),
                ))
            }
        };
        pipeline.add_dependency(step, predecessor, kind, row.scalable.unwrap_or(false));
    }
    Ok(pipeline)
}

pub fn read_resources<R: Read>(reader: R) -> Result<ResourcePool, IngestError> {
    let mut pool = ResourcePool::new();
    for row in rows::<_, ResourceRow>(reader, "resources")? {
        pool.add_resource(Resource {
            name: row.name,
            cpu_cores: row.cpu_cores,
            memory_bytes: row.memory_bytes,
            cost_per_second: row.cost_per_second,
        });
    }
    Ok(pool)
}

pub fn read_links<R: Read>(reader: R, pool: &mut ResourcePool) -> Result<(), IngestError> {
    for row in rows::<_, LinkRow>(reader, "links")? {
        let source = lookup_resource(pool, &row.source, "links")?;
        let target = lookup_resource(pool, &row.target, "links")?;
        pool.set_link(
            source,
            target,
            NetworkLink {
                bandwidth_bytes_per_sec: row.bandwidth_bytes_per_sec,
                latency_seconds: row.latency_ms / 1000.0,
            },
        );
    }
    Ok(())
}

pub fn read_step_metrics<R: Read>(
    reader: R,
    pipeline: &Pipeline,
    pool: &ResourcePool,
    catalog: &mut DryRunCatalog,
) -> Result<(), IngestError> {
    for row in rows::<_, StepMetricsRow>(reader, "step_metrics")? {
        catalog.step_metrics.push(StepMetricsSample {
            step: lookup_step(pipeline, &row.step, "step_metrics")?,
            resource: lookup_resource(pool, &row.resource, "step_metrics")?,
            timestamp: parse_timestamp(&row.timestamp)?,
            dry_run_id: row.dry_run_id,
            num_inputs: row.num_inputs,
            input_bytes: row.input_bytes,
            num_outputs: row.num_outputs,
            output_bytes: row.output_bytes,
            step_processing_ms: row.step_processing_ms,
            data_transmission_ms: row.data_transmission_ms,
        });
    }
    Ok(())
}

pub fn read_performance_metrics<R: Read>(
    reader: R,
    pipeline: &Pipeline,
    pool: &ResourcePool,
    catalog: &mut DryRunCatalog,
) -> Result<(), IngestError> {
    for row in rows::<_, PerformanceRow>(reader, "step_performance_metrics")? {
        catalog.performance_metrics.push(StepPerformanceSample {
            step: lookup_step(pipeline, &row.step, "step_performance_metrics")?,
            resource: lookup_resource(pool, &row.resource, "step_performance_metrics")?,
            timestamp: parse_timestamp(&row.timestamp)?,
            dry_run_id: row.dry_run_id,
            max_cpu_pct: row.max_cpu_pct,
            avg_cpu_pct: row.avg_cpu_pct,
            max_mem_mb: row.max_mem_mb,
        });
    }
    Ok(())
}

pub fn read_deployment_metrics<R: Read>(
    reader: R,
    pipeline: &Pipeline,
    pool: &ResourcePool,
    catalog: &mut DryRunCatalog,
) -> Result<(), IngestError> {
    for row in rows::<_, DeploymentRow>(reader, "deployment_metrics")? {
        catalog.deployment_metrics.push(DeploymentSample {
            step: lookup_step(pipeline, &row.step, "deployment_metrics")?,
            resource: lookup_resource(pool, &row.resource, "deployment_metrics")?,
            avg_download_seconds: row.avg_download_seconds,
            avg_instance_start_seconds: row.avg_instance_start_seconds,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Path-based loaders
// ---------------------------------------------------------------------------

fn open(path: &Path) -> Result<File, IngestError> {
    File::open(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_pipeline(path: &Path) -> Result<Pipeline, IngestError> {
    read_pipeline(open(path)?)
}

pub fn load_resources(resources: &Path, links: &Path) -> Result<ResourcePool, IngestError> {
    let mut pool = read_resources(open(resources)?)?;
    read_links(open(links)?, &mut pool)?;
    Ok(pool)
}

pub fn load_catalog(
    step_metrics: &Path,
    performance_metrics: &Path,
    deployment_metrics: &Path,
    pipeline: &Pipeline,
    pool: &ResourcePool,
) -> Result<DryRunCatalog, IngestError> {
    let mut catalog = DryRunCatalog::default();
    read_step_metrics(open(step_metrics)?, pipeline, pool, &mut catalog)?;
    read_performance_metrics(open(performance_metrics)?, pipeline, pool, &mut catalog)?;
    read_deployment_metrics(open(deployment_metrics)?, pipeline, pool, &mut catalog)?;
    Ok(catalog)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
