use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::Serialize;

use crate::model::{DryRunCatalog, Pipeline, ResourcePool, SchedulingRequest};

// ---------------------------------------------------------------------------
// Validation result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validate implementation
// ---------------------------------------------------------------------------

/// Validate the scheduling inputs, returning errors (block solving) and
/// warnings (advisory). Errors are listed before warnings.
pub fn validate(
    pipeline: &Pipeline,
    pool: &ResourcePool,
    catalog: &DryRunCatalog,
    request: &SchedulingRequest,
) -> ValidationResult {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // -----------------------------------------------------------------------
    // Per-step errors
    // -----------------------------------------------------------------------
    for id in pipeline.step_ids() {
        let step = pipeline.step(id);
        for dep in &step.dependencies {
            if dep.predecessor == id {
                errors.push(format!("Step '{}' depends on itself", step.name));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error: circular dependencies
    // -----------------------------------------------------------------------
    {
        let mut graph: DiGraph<usize, ()> =
            DiGraph::with_capacity(pipeline.len(), pipeline.len());
        let nodes: Vec<_> = pipeline.step_ids().map(|id| graph.add_node(id.0)).collect();
        for id in pipeline.step_ids() {
            for dep in &pipeline.step(id).dependencies {
                graph.add_edge(nodes[dep.predecessor.0], nodes[id.0], ());
            }
        }
        if is_cyclic_directed(&graph) {
            let involved: Vec<&str> = pipeline
                .steps()
                .iter()
                .filter(|s| !s.dependencies.is_empty())
                .map(|s| s.name.as_str())
                .collect();
            errors.push(format!(
                "Circular dependency among steps: {}",
                involved.join(", ")
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Error: degenerate request values
    // -----------------------------------------------------------------------
    if !(request.deadline_seconds > 0.0) {
        errors.push("Deadline must be positive".to_string());
    }
    if !(request.budget_usd > 0.0) {
        errors.push("Budget must be positive".to_string());
    }
    if request.input_volume_mb < 0.0 || request.input_volume_mb.is_nan() {
        errors.push("Input volume must be non-negative".to_string());
    }
    if request.max_scalability == Some(0) {
        errors.push("max_scalability must be at least 1".to_string());
    }

    // -----------------------------------------------------------------------
    // Error: forced deployments referencing unknown arena entries
    // -----------------------------------------------------------------------
    for forced in &request.forced_deployments {
        if forced.step.0 >= pipeline.len() {
            errors.push(format!(
                "Forced deployment references unknown step id {}",
                forced.step.0
            ));
        }
        if forced.resource.0 >= pool.len() {
            errors.push(format!(
                "Forced deployment references unknown resource id {}",
                forced.resource.0
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Warnings
    // -----------------------------------------------------------------------
    for id in pipeline.step_ids() {
        let covered = pool.resource_ids().any(|r| catalog.covers(id, r));
        if !covered {
            warnings.push(format!(
                "Step '{}' has no dry-run coverage on any resource",
                pipeline.step(id).name
            ));
        }
    }

    for a in pool.resource_ids() {
        for b in pool.resource_ids() {
            if a != b && pool.link(a, b).is_none() {
                warnings.push(format!(
                    "No network link from '{}' to '{}' -- cross placements of that pair are unavailable",
                    pool.resource(a).name,
                    pool.resource(b).name
                ));
            }
        }
    }

    if pool.resource_ids().any(|r| pool.resource(r).cost_per_second == 0.0) {
        warnings.push("A resource has zero cost -- cost fractions will ignore it".to_string());
    }

    if !pipeline.is_empty() && pipeline.steps().iter().all(|s| s.dependencies.is_empty()) {
        warnings.push(
            "No dependencies between steps -- the whole pipeline forms a single level".to_string(),
        );
    }

    ValidationResult { errors, warnings }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
