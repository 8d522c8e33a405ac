use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cats_engine::model::{
    EstimatorConfig, ForcedDeployment, Pipeline, ResourcePool, SchedulingRequest,
};
use cats_engine::solver::{self, PlannerConfig, PruneReason, SolveError};
use cats_engine::{ingest, report};

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

const EXIT_INFEASIBLE: i32 = 2;
const EXIT_MALFORMED: i32 = 3;
const EXIT_SAMPLE_GAP: i32 = 4;

// ---------------------------------------------------------------------------
// CLI surface
// ---------------------------------------------------------------------------

/// Context-aware timeline scheduler: plans a pipeline of processing steps
/// across a fog/cloud resource continuum from dry-run measurements.
#[derive(Debug, Parser)]
#[command(name = "cats-engine", version)]
struct Cli {
    /// Pipeline descriptor CSV (step, prerequisite, kind, scalable).
    #[arg(long)]
    pipeline: PathBuf,
    /// Resource catalog CSV (name, cpu_cores, memory_bytes, cost_per_second).
    #[arg(long)]
    resources: PathBuf,
    /// Network links CSV (source, target, bandwidth_bytes_per_sec, latency_ms).
    #[arg(long)]
    links: PathBuf,
    /// Dry-run step metrics CSV.
    #[arg(long)]
    step_metrics: PathBuf,
    /// Dry-run performance metrics CSV.
    #[arg(long)]
    performance_metrics: PathBuf,
    /// Dry-run deployment metrics CSV.
    #[arg(long)]
    deployment_metrics: PathBuf,

    #[arg(long)]
    deadline_seconds: f64,
    #[arg(long)]
    budget_usd: f64,
    #[arg(long)]
    input_volume_mb: f64,
    /// Upper bound on replicas per scalable step.
    #[arg(long)]
    max_scalability: Option<u32>,
    /// Pin a step to a resource; repeatable.
    #[arg(long = "force", value_name = "STEP=RESOURCE")]
    force: Vec<String>,

    /// Directory for timeline_<n>.csv outputs; stdout when omitted.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Worker threads for the search; defaults to all cores.
    #[arg(long)]
    workers: Option<usize>,
    /// Wall-clock budget for the search in seconds.
    #[arg(long)]
    timeout_seconds: Option<f64>,
    /// Safety factor over the mean observed CPU load.
    #[arg(long, default_value_t = 1.0)]
    cpu_headroom: f64,
    /// Safety factor over the peak observed memory.
    #[arg(long, default_value_t = 1.0)]
    memory_headroom: f64,
    /// Emit only the first timeline of the deterministic tie order.
    #[arg(long)]
    single: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_forced(
    raw: &str,
    pipeline: &Pipeline,
    pool: &ResourcePool,
) -> Result<ForcedDeployment, String> {
    let (step, resource) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected STEP=RESOURCE, got '{raw}'"))?;
    let step = pipeline
        .step_id(step)
        .ok_or_else(|| format!("unknown step '{step}' in --force"))?;
    let resource = pool
        .resource_id(resource)
        .ok_or_else(|| format!("unknown resource '{resource}' in --force"))?;
    Ok(ForcedDeployment { step, resource })
}

fn fail(code: i32, message: impl std::fmt::Display) -> i32 {
    eprintln!("{message}");
    code
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn run(cli: Cli) -> i32 {
    let pipeline = match ingest::load_pipeline(&cli.pipeline) {
        Ok(p) => p,
        Err(e) => return fail(EXIT_MALFORMED, e),
    };
    let pool = match ingest::load_resources(&cli.resources, &cli.links) {
        Ok(p) => p,
        Err(e) => return fail(EXIT_MALFORMED, e),
    };
    let catalog = match ingest::load_catalog(
        &cli.step_metrics,
        &cli.performance_metrics,
        &cli.deployment_metrics,
        &pipeline,
        &pool,
    ) {
        Ok(c) => c,
        Err(e) => return fail(EXIT_MALFORMED, e),
    };

    let mut forced_deployments = Vec::new();
    for raw in &cli.force {
        match parse_forced(raw, &pipeline, &pool) {
            Ok(forced) => forced_deployments.push(forced),
            Err(e) => return fail(EXIT_MALFORMED, e),
        }
    }

    let request = SchedulingRequest {
        deadline_seconds: cli.deadline_seconds,
        budget_usd: cli.budget_usd,
        input_volume_mb: cli.input_volume_mb,
        max_scalability: cli.max_scalability,
        forced_deployments,
    };
    let config = PlannerConfig {
        estimator: EstimatorConfig {
            cpu_headroom: cli.cpu_headroom,
            memory_headroom: cli.memory_headroom,
        },
        wall_clock_budget: cli.timeout_seconds.map(Duration::from_secs_f64),
    };

    let solve = || solver::plan(&pipeline, &pool, &catalog, &request, &config);
    let outcome = match cli.workers {
        Some(workers) => {
            let worker_pool = match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
            {
                Ok(p) => p,
                Err(e) => return fail(1, format!("failed to build worker pool: {e}")),
            };
            worker_pool.install(solve)
        }
        None => solve(),
    };

    let candidates = match outcome {
        Ok(candidates) => candidates,
        Err(SolveError::InvalidInput(message)) => return fail(EXIT_MALFORMED, message),
        Err(err @ SolveError::Infeasible { reason }) => {
            let code = match reason {
                PruneReason::SampleGap => EXIT_SAMPLE_GAP,
                _ => EXIT_INFEASIBLE,
            };
            return fail(code, err);
        }
        Err(err) => return fail(1, err),
    };

    let emit = if cli.single { 1 } else { candidates.len() };
    for (index, candidate) in candidates.iter().take(emit).enumerate() {
        let csv = match report::write_timeline_csv(&candidate.timeline, &pipeline, &pool) {
            Ok(csv) => csv,
            Err(e) => return fail(1, e),
        };
        if let Some(dir) = &cli.output_dir {
            let path = dir.join(format!("timeline_{index}.csv"));
            if let Err(e) = std::fs::write(&path, &csv) {
                return fail(1, format!("failed to write {}: {e}", path.display()));
            }
        } else {
            print!("{csv}");
        }

        let summary = report::summarize(candidate, &pool);
        match serde_json::to_string(&summary) {
            Ok(line) => println!("{line}"),
            Err(e) => return fail(1, e),
        }
    }

    0
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cats_engine=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    std::process::exit(run(Cli::parse()));
}
