use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Decimal megabyte, matching the bytes-per-second unit of network links.
pub const MEGABYTE: f64 = 1_000_000.0;

// ---------------------------------------------------------------------------
// Arena ids
// ---------------------------------------------------------------------------

/// Stable index of a step inside a [`Pipeline`]. All cross-references between
/// steps go through ids so the model stays cycle-free and cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub usize);

/// Stable index of a resource inside a [`ResourcePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub usize);

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Flavor of a dependency edge between two pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Successor may only start once the prerequisite has finished.
    Synchronous,
    /// Successor consumes a message stream; it may run alongside the
    /// prerequisite once the stream has opened.
    Asynchronous,
}

/// A directed dependency from a prerequisite step to its consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDependency {
    pub predecessor: StepId,
    pub kind: DependencyKind,
    /// Whether the consumer may be replicated to drain this edge faster.
    pub scalable: bool,
}

/// A single processing step of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub dependencies: Vec<StepDependency>,
}

impl Step {
    /// True when at least one incoming dependency is asynchronous, i.e. the
    /// step consumes a message stream instead of a finished data set.
    pub fn has_asynchronous_parent(&self) -> bool {
        self.dependencies
            .iter()
            .any(|d| d.kind == DependencyKind::Asynchronous)
    }

    /// A step is scalable iff at least one incoming dependency is
    /// asynchronous and marked scalable.
    pub fn is_scalable(&self) -> bool {
        self.dependencies
            .iter()
            .any(|d| d.kind == DependencyKind::Asynchronous && d.scalable)
    }

    pub fn synchronous_parents(&self) -> impl Iterator<Item = StepId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Synchronous)
            .map(|d| d.predecessor)
    }

    pub fn asynchronous_parents(&self) -> impl Iterator<Item = StepId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Asynchronous)
            .map(|d| d.predecessor)
    }

    pub fn parents(&self) -> impl Iterator<Item = StepId> + '_ {
        self.dependencies.iter().map(|d| d.predecessor)
    }
}

/// Arena of pipeline steps. Steps are identified by unique names; the arena
/// hands out [`StepId`]s and owns every [`Step`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    steps: Vec<Step>,
    index: HashMap<String, StepId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a step by name, or return the id of the existing step with
    /// that name.
    pub fn add_step(&mut self, name: &str) -> StepId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = StepId(self.steps.len());
        self.steps.push(Step {
            name: name.to_string(),
            dependencies: Vec::new(),
        });
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn add_dependency(
        &mut self,
        step: StepId,
        predecessor: StepId,
        kind: DependencyKind,
        scalable: bool,
    ) {
        self.steps[step.0].dependencies.push(StepDependency {
            predecessor,
            kind,
            scalable,
        });
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0]
    }

    pub fn step_id(&self, name: &str) -> Option<StepId> {
        self.index.get(name).copied()
    }

    pub fn step_ids(&self) -> impl Iterator<Item = StepId> {
        (0..self.steps.len()).map(StepId)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resources and the network graph
// ---------------------------------------------------------------------------

/// A compute host in the continuum (fog or cloud node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    /// CPU capacity in cores (fractions allowed).
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    /// Monetary cost of keeping one instance busy for one second.
    pub cost_per_second: f64,
}

/// Pairwise transfer characteristics between two distinct resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkLink {
    pub bandwidth_bytes_per_sec: f64,
    pub latency_seconds: f64,
}

/// Arena of resources plus the directed link table between them. Transfers
/// within a single resource take zero time and cost nothing; a missing link
/// between distinct resources means the pair cannot exchange data.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    resources: Vec<Resource>,
    index: HashMap<String, ResourceId>,
    links: HashMap<(ResourceId, ResourceId), NetworkLink>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&mut self, resource: Resource) -> ResourceId {
        if let Some(&id) = self.index.get(&resource.name) {
            self.resources[id.0] = resource;
            return id;
        }
        let id = ResourceId(self.resources.len());
        self.index.insert(resource.name.clone(), id);
        self.resources.push(resource);
        id
    }

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    pub fn resource_id(&self, name: &str) -> Option<ResourceId> {
        self.index.get(name).copied()
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> {
        (0..self.resources.len()).map(ResourceId)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn set_link(&mut self, from: ResourceId, to: ResourceId, link: NetworkLink) {
        self.links.insert((from, to), link);
    }

    pub fn link(&self, from: ResourceId, to: ResourceId) -> Option<NetworkLink> {
        if from == to {
            return Some(NetworkLink {
                bandwidth_bytes_per_sec: f64::INFINITY,
                latency_seconds: 0.0,
            });
        }
        self.links.get(&(from, to)).copied()
    }

    /// Seconds needed to move `bytes` from `from` to `to`. Zero within a
    /// resource; `None` when no link is known for the pair.
    pub fn transfer_seconds(&self, from: ResourceId, to: ResourceId, bytes: f64) -> Option<f64> {
        if from == to {
            return Some(0.0);
        }
        let link = self.link(from, to)?;
        Some(bytes / link.bandwidth_bytes_per_sec + link.latency_seconds)
    }
}

// ---------------------------------------------------------------------------
// Dry-run catalog
// ---------------------------------------------------------------------------

/// One dry-run measurement of a step's throughput on a resource.
#[derive(Debug, Clone)]
pub struct StepMetricsSample {
    pub dry_run_id: String,
    pub timestamp: NaiveDateTime,
    pub step: StepId,
    pub resource: ResourceId,
    pub num_inputs: u64,
    pub input_bytes: u64,
    pub num_outputs: u64,
    pub output_bytes: u64,
    /// Total processing time of the dry run in milliseconds.
    pub step_processing_ms: f64,
    pub data_transmission_ms: f64,
}

/// One dry-run measurement of a step's hardware footprint on a resource.
#[derive(Debug, Clone)]
pub struct StepPerformanceSample {
    pub dry_run_id: String,
    pub timestamp: NaiveDateTime,
    pub step: StepId,
    pub resource: ResourceId,
    pub max_cpu_pct: f64,
    pub avg_cpu_pct: f64,
    pub max_mem_mb: f64,
}

/// Measured container-pull and instance-start times for (step, resource).
#[derive(Debug, Clone)]
pub struct DeploymentSample {
    pub step: StepId,
    pub resource: ResourceId,
    pub avg_download_seconds: f64,
    pub avg_instance_start_seconds: f64,
}

/// Read-only collection of every dry-run measurement, loaded once before the
/// search starts.
#[derive(Debug, Clone, Default)]
pub struct DryRunCatalog {
    pub step_metrics: Vec<StepMetricsSample>,
    pub performance_metrics: Vec<StepPerformanceSample>,
    pub deployment_metrics: Vec<DeploymentSample>,
}

impl DryRunCatalog {
    pub fn step_metrics_for(
        &self,
        step: StepId,
        resource: ResourceId,
    ) -> impl Iterator<Item = &StepMetricsSample> {
        self.step_metrics
            .iter()
            .filter(move |s| s.step == step && s.resource == resource)
    }

    pub fn performance_for(
        &self,
        step: StepId,
        resource: ResourceId,
    ) -> impl Iterator<Item = &StepPerformanceSample> {
        self.performance_metrics
            .iter()
            .filter(move |s| s.step == step && s.resource == resource)
    }

    pub fn deployment_for(&self, step: StepId, resource: ResourceId) -> Option<&DeploymentSample> {
        self.deployment_metrics
            .iter()
            .find(|s| s.step == step && s.resource == resource)
    }

    /// True when at least one step-metrics row covers the pair.
    pub fn covers(&self, step: StepId, resource: ResourceId) -> bool {
        self.step_metrics_for(step, resource).next().is_some()
    }
}

// ---------------------------------------------------------------------------
// Scheduling request
// ---------------------------------------------------------------------------

/// Operator-supplied pin of a step to a resource. Removes every other
/// placement of that step from the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedDeployment {
    pub step: StepId,
    pub resource: ResourceId,
}

/// The user's scheduling inputs: normalization constants for the score plus
/// optional scaling cap and placement pins.
#[derive(Debug, Clone)]
pub struct SchedulingRequest {
    pub deadline_seconds: f64,
    pub budget_usd: f64,
    pub input_volume_mb: f64,
    pub max_scalability: Option<u32>,
    pub forced_deployments: Vec<ForcedDeployment>,
}

impl SchedulingRequest {
    pub fn forced_resource(&self, step: StepId) -> Option<ResourceId> {
        self.forced_deployments
            .iter()
            .find(|f| f.step == step)
            .map(|f| f.resource)
    }

    pub fn input_volume_bytes(&self) -> f64 {
        self.input_volume_mb * MEGABYTE
    }
}

/// Headroom factors applied on top of observed dry-run hardware usage.
/// Requirements always cover the observed peak regardless of the factor.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorConfig {
    pub cpu_headroom: f64,
    pub memory_headroom: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            cpu_headroom: 1.0,
            memory_headroom: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
