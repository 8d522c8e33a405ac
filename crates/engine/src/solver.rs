use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use itertools::Itertools;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rayon::prelude::*;

use crate::estimator::EstimationCache;
use crate::model::{
    DryRunCatalog, EstimatorConfig, Pipeline, ResourceId, ResourcePool, SchedulingRequest, StepId,
};
use crate::timeline::{ResourceReservation, SchedulingEvent, Timeline, TimelineError};

/// Two combined scores within this distance are treated as a tie.
const TIE_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a candidate (or the whole search) was cut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReason {
    BudgetExceeded,
    DeadlineExceeded,
    /// No dry run covers a required (step, resource) pair.
    SampleGap,
}

impl std::fmt::Display for PruneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded => write!(f, "budget exceeded"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::SampleGap => write!(f, "insufficient dry-run samples"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("invalid scheduling input: {0}")]
    InvalidInput(String),
    #[error("no feasible timeline: {reason}")]
    Infeasible { reason: PruneReason },
    /// A placement failed after its position was pre-queried. This is an
    /// internal consistency bug, not a property of the inputs.
    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Combined time/cost score of a timeline. Deadline and budget act as
/// normalization constants; either fraction exceeding 1 is a hard prune.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub time_fraction: f64,
    pub cost_fraction: f64,
}

impl Score {
    pub const ZERO: Score = Score {
        time_fraction: 0.0,
        cost_fraction: 0.0,
    };

    pub fn combined(&self) -> f64 {
        self.time_fraction + self.cost_fraction
    }

    fn hard_limit(&self) -> Option<PruneReason> {
        if self.cost_fraction > 1.0 + TIE_EPS {
            Some(PruneReason::BudgetExceeded)
        } else if self.time_fraction > 1.0 + TIE_EPS {
            Some(PruneReason::DeadlineExceeded)
        } else {
            None
        }
    }
}

pub fn score_timeline(timeline: &Timeline, pool: &ResourcePool, request: &SchedulingRequest) -> Score {
    Score {
        time_fraction: timeline.total_time() / request.deadline_seconds,
        cost_fraction: (timeline.resource_cost(pool) + timeline.data_transmission_cost())
            / request.budget_usd,
    }
}

/// A timeline surviving the search, paired with its score.
#[derive(Debug, Clone)]
pub struct ScheduleCandidate {
    pub timeline: Timeline,
    pub score: Score,
}

/// Knobs around the search itself, separate from the scheduling request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlannerConfig {
    pub estimator: EstimatorConfig,
    /// Wall-clock budget for the whole search. When it runs out, no new
    /// tuples are dispatched and the best-so-far set is returned.
    pub wall_clock_budget: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Level decomposition
// ---------------------------------------------------------------------------

/// Split the pipeline DAG into topological levels: level 0 holds the steps
/// without prerequisites, level i+1 the steps whose prerequisites all sit in
/// levels <= i. Steps inside a level are sorted by id for reproducibility.
pub(crate) fn topological_levels(pipeline: &Pipeline) -> Result<Vec<Vec<StepId>>, SolveError> {
    let n = pipeline.len();
    let mut graph: DiGraph<StepId, ()> = DiGraph::with_capacity(n, n);
    let nodes: Vec<NodeIndex> = pipeline.step_ids().map(|id| graph.add_node(id)).collect();

    for step in pipeline.step_ids() {
        for dep in &pipeline.step(step).dependencies {
            graph.add_edge(nodes[dep.predecessor.0], nodes[step.0], ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(SolveError::InvalidInput(
            "pipeline contains a dependency cycle".to_string(),
        ));
    }

    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&ix| graph.neighbors_directed(ix, Direction::Incoming).count())
        .collect();

    let mut levels: Vec<Vec<StepId>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    while !current.is_empty() {
        current.sort_unstable();
        levels.push(current.iter().map(|&i| StepId(i)).collect());

        let mut next: Vec<usize> = Vec::new();
        for &i in &current {
            for succ in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                let j = graph[succ].0;
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    next.push(j);
                }
            }
        }
        current = next;
    }

    Ok(levels)
}

// ---------------------------------------------------------------------------
// Search context and tuple evaluation
// ---------------------------------------------------------------------------

/// Read-only state shared by all workers of a search run.
struct SearchContext<'a> {
    pipeline: &'a Pipeline,
    pool: &'a ResourcePool,
    cache: &'a EstimationCache,
    request: &'a SchedulingRequest,
    eligible: &'a HashMap<StepId, Vec<ResourceId>>,
}

enum TupleOutcome {
    Placed(ScheduleCandidate),
    Pruned(PruneReason),
}

/// The resource feeding `step`: where its latest-finishing prerequisite ran.
/// Steps without scheduled prerequisites are fed locally (zero transfer).
fn feed_resource(
    ctx: &SearchContext<'_>,
    timeline: &Timeline,
    step: StepId,
    fallback: ResourceId,
) -> ResourceId {
    let mut feed: Option<(f64, ResourceId)> = None;
    for parent in ctx.pipeline.step(step).parents() {
        if let Some(event) = timeline.latest_finishing_event_of_step(parent) {
            let candidate = (event.end(), event.resource);
            feed = Some(match feed {
                Some(best) if best.0 >= candidate.0 => best,
                _ => candidate,
            });
        }
    }
    feed.map(|(_, r)| r).unwrap_or(fallback)
}

/// Place one instance of `step` on `resource` at the earliest legal position.
/// Returns `Ok(false)` when no estimation covers the pair (a sample gap).
fn place_instance(
    ctx: &SearchContext<'_>,
    timeline: &mut Timeline,
    step: StepId,
    resource: ResourceId,
    replication: Option<(u32, u32)>,
) -> Result<bool, TimelineError> {
    let producer = feed_resource(ctx, timeline, step, resource);
    let Some(estimation) = ctx.cache.timeline(step, producer, resource) else {
        return Ok(false);
    };
    let estimation = match replication {
        None => estimation.clone(),
        Some((replicas, index)) => match estimation.scale_to(replicas, index) {
            Some(scaled) => scaled,
            None => return Ok(false),
        },
    };
    if estimation.number_of_transmitted_inputs() == 0 {
        // An empty share needs no instance at all.
        return Ok(true);
    }
    let Some(hardware) = ctx.cache.hardware(step, resource) else {
        return Ok(false);
    };

    let reservation = ResourceReservation {
        cpu_cores: hardware.cpu_cores,
        memory_bytes: hardware.memory_bytes,
    };

    // Provisioning is paid once per (step, resource); a replica landing next
    // to an already-deployed sibling reuses its image and warm instance.
    let mut duration = estimation.total_duration();
    if timeline.events_of(step).any(|e| e.resource == resource) {
        duration -= estimation.provisioning_and_deployment_time();
    }

    let floor = timeline.step_release_position(step, ctx.pipeline);
    let start =
        timeline.earliest_available_position_after(resource, &reservation, duration, floor, ctx.pool);

    let transmission_seconds = estimation.data_transmission_time();
    timeline.add_event(
        SchedulingEvent {
            step,
            resource,
            start,
            duration,
            reservation,
            inputs_covered: estimation.number_of_transmitted_inputs(),
            transmission_seconds,
            transmission_cost: transmission_seconds
                * ctx.pool.resource(producer).cost_per_second,
        },
        ctx.pipeline,
        ctx.pool,
    )?;
    Ok(true)
}

/// Upper bound on useful replicas of `step`: more instances than the
/// producer can keep fed are wasted. ceil(total production time of the feed
/// / per-input processing time), capped by the request's max_scalability.
fn max_useful_replicas(
    ctx: &SearchContext<'_>,
    timeline: &Timeline,
    step: StepId,
    resource: ResourceId,
) -> u32 {
    let user_cap = ctx.request.max_scalability.unwrap_or(u32::MAX);
    if user_cap <= 1 {
        return 1;
    }

    let mut feed: Option<&SchedulingEvent> = None;
    for parent in ctx.pipeline.step(step).asynchronous_parents() {
        if let Some(event) = timeline.latest_finishing_event_of_step(parent) {
            if feed.is_none_or(|best| best.end() < event.end()) {
                feed = Some(event);
            }
        }
    }
    let Some(feed) = feed else { return 1 };
    let Some(producer_est) = ctx.cache.timeline(feed.step, feed.resource, feed.resource) else {
        return 1;
    };
    let produce_total =
        producer_est.production_time_per_output() * producer_est.number_of_produced_outputs() as f64;

    let producer = feed_resource(ctx, timeline, step, resource);
    let Some(own_est) = ctx.cache.timeline(step, producer, resource) else {
        return 1;
    };
    let per_input = own_est.processing_time_per_input();
    if per_input <= 0.0 || produce_total <= 0.0 {
        return 1;
    }

    ((produce_total / per_input).ceil() as u32).min(user_cap).max(1)
}

/// Try replicating `step` over 2..=K resources; adopt the best replication
/// iff its score improves on the single-instance placement without breaching
/// a hard limit.
fn explore_scaling(
    ctx: &SearchContext<'_>,
    current: &ScheduleCandidate,
    step: StepId,
    resource: ResourceId,
) -> Result<Option<ScheduleCandidate>, TimelineError> {
    let max_replicas = max_useful_replicas(ctx, &current.timeline, step, resource);
    if max_replicas < 2 {
        return Ok(None);
    }

    let mut best: Option<ScheduleCandidate> = None;
    let mut best_combined = current.score.combined();

    for replicas in 2..=max_replicas {
        let extras = (1..replicas)
            .map(|_| ctx.eligible[&step].clone())
            .multi_cartesian_product();
        for extra in extras {
            let mut timeline = current.timeline.clone();
            timeline.remove_events_of_step(step);

            let mut placed_all = true;
            for (index, &replica_resource) in
                std::iter::once(&resource).chain(extra.iter()).enumerate()
            {
                if !place_instance(
                    ctx,
                    &mut timeline,
                    step,
                    replica_resource,
                    Some((replicas, index as u32)),
                )? {
                    placed_all = false;
                    break;
                }
            }
            if !placed_all {
                continue;
            }

            let score = score_timeline(&timeline, ctx.pool, ctx.request);
            if score.hard_limit().is_none() && score.combined() + TIE_EPS < best_combined {
                best_combined = score.combined();
                best = Some(ScheduleCandidate { timeline, score });
            }
        }
    }
    Ok(best)
}

/// Evaluate one (permutation, assignment) tuple against a snapshot of the
/// pre-level timeline. Pure function of its inputs; runs on a worker.
fn evaluate_tuple(
    ctx: &SearchContext<'_>,
    base: &Timeline,
    permutation: &[StepId],
    assignment: &[ResourceId],
) -> Result<TupleOutcome, TimelineError> {
    let mut timeline = base.clone();
    for (&step, &resource) in permutation.iter().zip(assignment) {
        if !place_instance(ctx, &mut timeline, step, resource, None)? {
            return Ok(TupleOutcome::Pruned(PruneReason::SampleGap));
        }
    }

    let score = score_timeline(&timeline, ctx.pool, ctx.request);
    if let Some(reason) = score.hard_limit() {
        return Ok(TupleOutcome::Pruned(reason));
    }

    let mut current = ScheduleCandidate { timeline, score };
    for (&step, &resource) in permutation.iter().zip(assignment) {
        if ctx.pipeline.step(step).is_scalable() && ctx.request.forced_resource(step).is_none() {
            if let Some(better) = explore_scaling(ctx, &current, step, resource)? {
                current = better;
            }
        }
    }
    Ok(TupleOutcome::Placed(current))
}

/// All (permutation, assignment) tuples of one level, in deterministic order.
fn level_tuples(
    ctx: &SearchContext<'_>,
    level: &[StepId],
) -> Vec<(Vec<StepId>, Vec<ResourceId>)> {
    let mut tuples = Vec::new();
    for permutation in level.iter().copied().permutations(level.len()) {
        let pools: Vec<Vec<ResourceId>> = permutation
            .iter()
            .map(|step| ctx.eligible[step].clone())
            .collect();
        for assignment in pools.into_iter().multi_cartesian_product() {
            tuples.push((permutation.clone(), assignment));
        }
    }
    tuples
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Plan the pipeline across the resource pool.
///
/// 1. Validates the inputs and splits the DAG into topological levels.
/// 2. Builds the estimation cache (single-threaded, read-only afterwards).
/// 3. Level by level, enumerates step permutations x resource assignments,
///    extends every surviving timeline speculatively on a worker pool,
///    explores replication of scalable steps, and keeps the set of
///    minimum-score timelines.
///
/// Returns every timeline tying for the best score, deduplicated and ordered
/// by the canonical event key so identical inputs produce identical output.
pub fn plan(
    pipeline: &Pipeline,
    pool: &ResourcePool,
    catalog: &DryRunCatalog,
    request: &SchedulingRequest,
    config: &PlannerConfig,
) -> Result<Vec<ScheduleCandidate>, SolveError> {
    let validation = crate::validator::validate(pipeline, pool, catalog, request);
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }
    if !validation.is_ok() {
        return Err(SolveError::InvalidInput(validation.errors.join("; ")));
    }

    if pipeline.is_empty() {
        return Ok(vec![ScheduleCandidate {
            timeline: Timeline::new(),
            score: Score::ZERO,
        }]);
    }

    let levels = topological_levels(pipeline)?;
    let cache = EstimationCache::build(
        catalog,
        pipeline,
        pool,
        &config.estimator,
        request.input_volume_mb,
    );

    let mut eligible: HashMap<StepId, Vec<ResourceId>> = HashMap::new();
    for step in pipeline.step_ids() {
        let runnable = cache.runnable_resources(step, pool);
        let set: Vec<ResourceId> = match request.forced_resource(step) {
            Some(pinned) => runnable.into_iter().filter(|&r| r == pinned).collect(),
            None => runnable,
        };
        if set.is_empty() {
            tracing::info!(
                step = %pipeline.step(step).name,
                "no runnable resource for step"
            );
            return Err(SolveError::Infeasible {
                reason: PruneReason::SampleGap,
            });
        }
        eligible.insert(step, set);
    }

    let ctx = SearchContext {
        pipeline,
        pool,
        cache: &cache,
        request,
        eligible: &eligible,
    };

    let started = Instant::now();
    let expired = |at: Instant| {
        config
            .wall_clock_budget
            .is_some_and(|budget| at.elapsed() >= budget)
    };

    let mut best = vec![ScheduleCandidate {
        timeline: Timeline::new(),
        score: Score::ZERO,
    }];
    let mut last_prune: Option<PruneReason> = None;

    for (depth, level) in levels.iter().enumerate() {
        if expired(started) {
            tracing::info!(level = depth, "wall-clock budget exhausted, returning best-so-far");
            break;
        }

        let tuples = level_tuples(&ctx, level);
        tracing::debug!(level = depth, tuples = tuples.len(), "exploring level");

        let mut merged: Vec<ScheduleCandidate> = Vec::new();
        let mut best_combined = f64::INFINITY;

        for candidate in &best {
            let outcomes = tuples
                .par_iter()
                .map(|(permutation, assignment)| {
                    evaluate_tuple(&ctx, &candidate.timeline, permutation, assignment)
                })
                .collect::<Result<Vec<_>, _>>()?;

            for outcome in outcomes {
                match outcome {
                    TupleOutcome::Pruned(reason) => last_prune = Some(reason),
                    TupleOutcome::Placed(next) => {
                        let combined = next.score.combined();
                        if combined <= best_combined + TIE_EPS {
                            best_combined = best_combined.min(combined);
                            merged.push(next);
                        }
                    }
                }
            }

            if expired(started) {
                tracing::info!(level = depth, "wall-clock budget exhausted mid-level");
                break;
            }
        }

        merged.retain(|c| c.score.combined() <= best_combined + TIE_EPS);
        merged.sort_by(|a, b| a.timeline.canonical_key().cmp(&b.timeline.canonical_key()));
        let mut seen = HashSet::new();
        merged.retain(|c| seen.insert(c.timeline.canonical_key()));

        if merged.is_empty() {
            if expired(started) {
                break;
            }
            return Err(SolveError::Infeasible {
                reason: last_prune.unwrap_or(PruneReason::SampleGap),
            });
        }
        tracing::debug!(level = depth, retained = merged.len(), "level complete");
        best = merged;
    }

    Ok(best)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
