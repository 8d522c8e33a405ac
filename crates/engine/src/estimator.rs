use std::collections::HashMap;

use crate::model::{
    DryRunCatalog, EstimatorConfig, Pipeline, ResourceId, ResourcePool, StepId, MEGABYTE,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EstimateError {
    #[error("no dry-run samples for step '{step}' on resource '{resource}'")]
    InsufficientSamples { step: String, resource: String },
    #[error("no network link from '{from}' to '{to}'")]
    MissingLink { from: String, to: String },
}

// ---------------------------------------------------------------------------
// Hardware requirements
// ---------------------------------------------------------------------------

/// CPU and memory reservation a step needs on a given resource, derived from
/// dry-run performance samples with configurable headroom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepHardwareRequirement {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// Aggregate the performance samples for (step, resource) into a required
/// reservation. CPU is the mean observed load scaled by headroom, floored at
/// the observed peak; memory is the observed peak scaled by headroom.
pub fn estimate_hardware(
    catalog: &DryRunCatalog,
    pipeline: &Pipeline,
    pool: &ResourcePool,
    step: StepId,
    resource: ResourceId,
    config: &EstimatorConfig,
) -> Result<StepHardwareRequirement, EstimateError> {
    let samples: Vec<_> = catalog.performance_for(step, resource).collect();
    if samples.is_empty() {
        return Err(EstimateError::InsufficientSamples {
            step: pipeline.step(step).name.clone(),
            resource: pool.resource(resource).name.clone(),
        });
    }

    let mean_cpu =
        samples.iter().map(|s| s.avg_cpu_pct / 100.0).sum::<f64>() / samples.len() as f64;
    let peak_cpu = samples
        .iter()
        .map(|s| s.max_cpu_pct / 100.0)
        .fold(0.0, f64::max);
    let peak_mem_mb = samples.iter().map(|s| s.max_mem_mb).fold(0.0, f64::max);

    Ok(StepHardwareRequirement {
        cpu_cores: (mean_cpu * config.cpu_headroom).max(peak_cpu),
        memory_bytes: (peak_mem_mb * MEGABYTE * config.memory_headroom).round() as u64,
    })
}

// ---------------------------------------------------------------------------
// Throughput profile
// ---------------------------------------------------------------------------

/// Per-unit rates of a step on a resource, averaged over its dry runs.
#[derive(Debug, Clone, Copy)]
struct ThroughputProfile {
    seconds_per_input: f64,
    seconds_per_output: f64,
    outputs_per_input: f64,
    bytes_per_input: f64,
    mean_inputs: f64,
}

fn throughput_profile(
    catalog: &DryRunCatalog,
    step: StepId,
    resource: ResourceId,
) -> Option<ThroughputProfile> {
    let samples: Vec<_> = catalog
        .step_metrics_for(step, resource)
        .filter(|s| s.num_inputs > 0)
        .collect();
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as f64;
    let mean = |f: &dyn Fn(&&crate::model::StepMetricsSample) -> f64| {
        samples.iter().map(f).sum::<f64>() / n
    };

    let seconds_per_input = mean(&|s| s.step_processing_ms / 1000.0 / s.num_inputs as f64);
    let seconds_per_output = mean(&|s| {
        if s.num_outputs > 0 {
            s.step_processing_ms / 1000.0 / s.num_outputs as f64
        } else {
            0.0
        }
    });
    let outputs_per_input = mean(&|s| s.num_outputs as f64 / s.num_inputs as f64);
    let bytes_per_input = mean(&|s| s.input_bytes as f64 / s.num_inputs as f64);
    let mean_inputs = mean(&|s| s.num_inputs as f64);

    Some(ThroughputProfile {
        seconds_per_input,
        seconds_per_output,
        outputs_per_input,
        bytes_per_input,
        mean_inputs,
    })
}

// ---------------------------------------------------------------------------
// Timeline estimations
// ---------------------------------------------------------------------------

/// Numeric components shared by both estimation variants.
#[derive(Debug, Clone, Copy, PartialEq)]
struct EstimationBasis {
    deployment_seconds: f64,
    seconds_per_input: f64,
    seconds_per_output: f64,
    outputs_per_input: f64,
    /// Inbound transfer seconds per input; zero when producer == consumer.
    transfer_seconds_per_input: f64,
    /// One-time link latency; zero when producer == consumer.
    latency_seconds: f64,
}

/// Estimation of a step whose total work is fixed by the global input volume
/// (no asynchronous parent).
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerEstimation {
    basis: EstimationBasis,
    inputs: u64,
}

/// Estimation of a step that drains an asynchronous stream. Its duration is
/// parameterized by the share of inputs this instance actually processes,
/// which is how replication shrinks the work per replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerEstimation {
    basis: EstimationBasis,
    total_inputs: u64,
    assigned_inputs: u64,
}

impl ConsumerEstimation {
    /// Re-derive this estimation for replica `index` of `replicas` total.
    /// Replicas 0..k-1 take ceil(N/k) inputs each; the last takes the
    /// remainder. Deployment time is paid by every replica.
    pub fn scale_to(&self, replicas: u32, index: u32) -> ConsumerEstimation {
        debug_assert!(replicas >= 1 && index < replicas);
        let k = replicas as u64;
        let base = self.total_inputs.div_ceil(k);
        let assigned = if (index as u64) < k - 1 {
            base
        } else {
            self.total_inputs.saturating_sub(base * (k - 1))
        };
        ConsumerEstimation {
            basis: self.basis,
            total_inputs: self.total_inputs,
            assigned_inputs: assigned,
        }
    }
}

/// Per-(step, producer resource, consumer resource) prediction of deployment,
/// processing, and transfer time. Dispatch between the two variants is by
/// tag; both expose the same capability set.
#[derive(Debug, Clone, PartialEq)]
pub enum StepTimelineEstimation {
    Producer(ProducerEstimation),
    Consumer(ConsumerEstimation),
}

impl StepTimelineEstimation {
    fn basis(&self) -> &EstimationBasis {
        match self {
            Self::Producer(p) => &p.basis,
            Self::Consumer(c) => &c.basis,
        }
    }

    /// Inputs this instance is expected to process.
    pub fn number_of_transmitted_inputs(&self) -> u64 {
        match self {
            Self::Producer(p) => p.inputs,
            Self::Consumer(c) => c.assigned_inputs,
        }
    }

    /// Total inputs of the step at the operating volume, across all replicas.
    pub fn total_expected_inputs(&self) -> u64 {
        match self {
            Self::Producer(p) => p.inputs,
            Self::Consumer(c) => c.total_inputs,
        }
    }

    pub fn number_of_produced_outputs(&self) -> u64 {
        let b = self.basis();
        (self.number_of_transmitted_inputs() as f64 * b.outputs_per_input).round() as u64
    }

    pub fn provisioning_and_deployment_time(&self) -> f64 {
        self.basis().deployment_seconds
    }

    pub fn step_processing_time(&self) -> f64 {
        self.number_of_transmitted_inputs() as f64 * self.basis().seconds_per_input
    }

    /// Per-output production rate, used to bound how many replicas of a
    /// downstream consumer are worth deploying.
    pub fn production_time_per_output(&self) -> f64 {
        self.basis().seconds_per_output
    }

    /// Per-input processing rate on the consumer resource.
    pub fn processing_time_per_input(&self) -> f64 {
        self.basis().seconds_per_input
    }

    /// Total inbound transfer time for this instance's share. Zero for
    /// co-located producer and consumer.
    pub fn data_transmission_time(&self) -> f64 {
        let b = self.basis();
        let inputs = self.number_of_transmitted_inputs();
        if inputs == 0 || (b.transfer_seconds_per_input == 0.0 && b.latency_seconds == 0.0) {
            return 0.0;
        }
        inputs as f64 * b.transfer_seconds_per_input + b.latency_seconds
    }

    /// Wall-clock span of the event: provisioning, processing, and inbound
    /// transfer are all subsumed into the instance's duration.
    pub fn total_duration(&self) -> f64 {
        self.provisioning_and_deployment_time()
            + self.step_processing_time()
            + self.data_transmission_time()
    }

    /// The scaling operation: only consumers can shrink their input share.
    pub fn scale_to(&self, replicas: u32, index: u32) -> Option<StepTimelineEstimation> {
        match self {
            Self::Producer(_) => None,
            Self::Consumer(c) => Some(Self::Consumer(c.scale_to(replicas, index))),
        }
    }
}

/// Derive the timeline estimation for `step` running on `consumer_resource`
/// and fed from `producer_resource`, at the given input volume.
pub fn estimate_timeline(
    catalog: &DryRunCatalog,
    pipeline: &Pipeline,
    pool: &ResourcePool,
    step: StepId,
    producer_resource: ResourceId,
    consumer_resource: ResourceId,
    input_volume_mb: f64,
) -> Result<StepTimelineEstimation, EstimateError> {
    let profile = throughput_profile(catalog, step, consumer_resource).ok_or_else(|| {
        EstimateError::InsufficientSamples {
            step: pipeline.step(step).name.clone(),
            resource: pool.resource(consumer_resource).name.clone(),
        }
    })?;

    // Linear extrapolation from dry-run throughput to the operating volume.
    let volume_bytes = input_volume_mb * MEGABYTE;
    let inputs = if profile.bytes_per_input > 0.0 {
        (volume_bytes / profile.bytes_per_input).ceil() as u64
    } else {
        profile.mean_inputs.round() as u64
    };

    let deployment_seconds = catalog
        .deployment_for(step, consumer_resource)
        .map(|d| d.avg_download_seconds + d.avg_instance_start_seconds)
        .unwrap_or(0.0);

    let (transfer_seconds_per_input, latency_seconds) = if producer_resource == consumer_resource {
        (0.0, 0.0)
    } else {
        let link = pool.link(producer_resource, consumer_resource).ok_or_else(|| {
            EstimateError::MissingLink {
                from: pool.resource(producer_resource).name.clone(),
                to: pool.resource(consumer_resource).name.clone(),
            }
        })?;
        (
            profile.bytes_per_input / link.bandwidth_bytes_per_sec,
            link.latency_seconds,
        )
    };

    let basis = EstimationBasis {
        deployment_seconds,
        seconds_per_input: profile.seconds_per_input,
        seconds_per_output: profile.seconds_per_output,
        outputs_per_input: profile.outputs_per_input,
        transfer_seconds_per_input,
        latency_seconds,
    };

    Ok(if pipeline.step(step).has_asynchronous_parent() {
        StepTimelineEstimation::Consumer(ConsumerEstimation {
            basis,
            total_inputs: inputs,
            assigned_inputs: inputs,
        })
    } else {
        StepTimelineEstimation::Producer(ProducerEstimation { basis, inputs })
    })
}

// ---------------------------------------------------------------------------
// Estimation cache
// ---------------------------------------------------------------------------

/// Memoized estimations, built once by a single thread before the search
/// begins and read-only thereafter. Pairs that fail estimation are simply
/// absent; the search reads absence as "pair unavailable".
#[derive(Debug, Default)]
pub struct EstimationCache {
    hardware: HashMap<(StepId, ResourceId), StepHardwareRequirement>,
    timeline: HashMap<(StepId, ResourceId, ResourceId), StepTimelineEstimation>,
}

impl EstimationCache {
    pub fn build(
        catalog: &DryRunCatalog,
        pipeline: &Pipeline,
        pool: &ResourcePool,
        config: &EstimatorConfig,
        input_volume_mb: f64,
    ) -> Self {
        let mut cache = Self::default();
        for step in pipeline.step_ids() {
            for consumer in pool.resource_ids() {
                if let Ok(hw) = estimate_hardware(catalog, pipeline, pool, step, consumer, config) {
                    cache.hardware.insert((step, consumer), hw);
                }
                for producer in pool.resource_ids() {
                    if let Ok(est) = estimate_timeline(
                        catalog,
                        pipeline,
                        pool,
                        step,
                        producer,
                        consumer,
                        input_volume_mb,
                    ) {
                        cache.timeline.insert((step, producer, consumer), est);
                    }
                }
            }
        }
        cache
    }

    pub fn hardware(&self, step: StepId, resource: ResourceId) -> Option<&StepHardwareRequirement> {
        self.hardware.get(&(step, resource))
    }

    pub fn timeline(
        &self,
        step: StepId,
        producer: ResourceId,
        consumer: ResourceId,
    ) -> Option<&StepTimelineEstimation> {
        self.timeline.get(&(step, producer, consumer))
    }

    /// Resources on which the step can run at all: a hardware requirement and
    /// a co-located estimation exist, and the reservation fits the capacity.
    pub fn runnable_resources(&self, step: StepId, pool: &ResourcePool) -> Vec<ResourceId> {
        pool.resource_ids()
            .filter(|&r| {
                let res = pool.resource(r);
                self.timeline(step, r, r).is_some()
                    && self.hardware(step, r).is_some_and(|hw| {
                        hw.cpu_cores <= res.cpu_cores + 1e-9 && hw.memory_bytes <= res.memory_bytes
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DependencyKind, DryRunCatalog, NetworkLink, Resource, StepMetricsSample,
        StepPerformanceSample,
    };
    use chrono::NaiveDateTime;

    fn ts() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-03-01T12:00:00", "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn fixture() -> (Pipeline, ResourcePool, DryRunCatalog) {
        let mut pipeline = Pipeline::new();
        let produce = pipeline.add_step("produce");
        let consume = pipeline.add_step("consume");
        pipeline.add_dependency(consume, produce, DependencyKind::Asynchronous, true);

        let mut pool = ResourcePool::new();
        let r1 = pool.add_resource(Resource {
            name: "r1".into(),
            cpu_cores: 4.0,
            memory_bytes: 8_000_000_000,
            cost_per_second: 0.02,
        });
        let r2 = pool.add_resource(Resource {
            name: "r2".into(),
            cpu_cores: 4.0,
            memory_bytes: 8_000_000_000,
            cost_per_second: 0.005,
        });
        pool.set_link(
            r1,
            r2,
            NetworkLink {
                bandwidth_bytes_per_sec: 100.0 * MEGABYTE,
                latency_seconds: 0.01,
            },
        );
        pool.set_link(
            r2,
            r1,
            NetworkLink {
                bandwidth_bytes_per_sec: 100.0 * MEGABYTE,
                latency_seconds: 0.01,
            },
        );

        let mut catalog = DryRunCatalog::default();
        for (step, res, total_ms) in [(produce, r1, 10_000.0), (consume, r1, 20_000.0)] {
            catalog.step_metrics.push(StepMetricsSample {
                dry_run_id: "d1".into(),
                timestamp: ts(),
                step,
                resource: res,
                num_inputs: 10,
                input_bytes: 100_000_000,
                num_outputs: 10,
                output_bytes: 100_000_000,
                step_processing_ms: total_ms,
                data_transmission_ms: 0.0,
            });
        }
        catalog.performance_metrics.push(StepPerformanceSample {
            dry_run_id: "d1".into(),
            timestamp: ts(),
            step: produce,
            resource: r1,
            max_cpu_pct: 250.0,
            avg_cpu_pct: 150.0,
            max_mem_mb: 1024.0,
        });
        catalog.performance_metrics.push(StepPerformanceSample {
            dry_run_id: "d2".into(),
            timestamp: ts(),
            step: produce,
            resource: r1,
            max_cpu_pct: 180.0,
            avg_cpu_pct: 130.0,
            max_mem_mb: 900.0,
        });

        (pipeline, pool, catalog)
    }

    #[test]
    fn hardware_covers_observed_peak() {
        let (pipeline, pool, catalog) = fixture();
        let produce = pipeline.step_id("produce").unwrap();
        let r1 = pool.resource_id("r1").unwrap();

        let hw = estimate_hardware(
            &catalog,
            &pipeline,
            &pool,
            produce,
            r1,
            &EstimatorConfig::default(),
        )
        .unwrap();
        // Mean avg is 1.4 cores but the observed peak is 2.5 cores.
        assert!((hw.cpu_cores - 2.5).abs() < 1e-9);
        assert_eq!(hw.memory_bytes, 1_024_000_000);

        let roomy = estimate_hardware(
            &catalog,
            &pipeline,
            &pool,
            produce,
            r1,
            &EstimatorConfig {
                cpu_headroom: 2.0,
                memory_headroom: 1.5,
            },
        )
        .unwrap();
        assert!((roomy.cpu_cores - 2.8).abs() < 1e-9);
        assert_eq!(roomy.memory_bytes, 1_536_000_000);
    }

    #[test]
    fn hardware_without_samples_is_insufficient() {
        let (pipeline, pool, catalog) = fixture();
        let consume = pipeline.step_id("consume").unwrap();
        let r1 = pool.resource_id("r1").unwrap();
        let err = estimate_hardware(
            &catalog,
            &pipeline,
            &pool,
            consume,
            r1,
            &EstimatorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EstimateError::InsufficientSamples { .. }));
    }

    #[test]
    fn producer_estimation_extrapolates_to_volume() {
        let (pipeline, pool, catalog) = fixture();
        let produce = pipeline.step_id("produce").unwrap();
        let r1 = pool.resource_id("r1").unwrap();

        // Dry run: 10 inputs of 10 MB each in 10 s. At 1000 MB we expect 100
        // inputs and 100 s of processing.
        let est = estimate_timeline(&catalog, &pipeline, &pool, produce, r1, r1, 1000.0).unwrap();
        assert!(matches!(est, StepTimelineEstimation::Producer(_)));
        assert_eq!(est.number_of_transmitted_inputs(), 100);
        assert_eq!(est.number_of_produced_outputs(), 100);
        assert!((est.step_processing_time() - 100.0).abs() < 1e-9);
        assert_eq!(est.data_transmission_time(), 0.0);
        assert!((est.total_duration() - 100.0).abs() < 1e-9);
        assert!(est.scale_to(2, 0).is_none(), "producers do not scale");
    }

    #[test]
    fn cross_resource_estimation_adds_transfer_time() {
        let (pipeline, pool, catalog) = fixture();
        let consume = pipeline.step_id("consume").unwrap();
        let r1 = pool.resource_id("r1").unwrap();
        let r2 = pool.resource_id("r2").unwrap();

        // consume has metrics on r1 only; feeding it from r2 moves
        // 100 inputs x 10 MB over a 100 MB/s link: 10 s plus 10 ms latency.
        let est = estimate_timeline(&catalog, &pipeline, &pool, consume, r2, r1, 1000.0).unwrap();
        assert!(matches!(est, StepTimelineEstimation::Consumer(_)));
        assert!((est.data_transmission_time() - 10.01).abs() < 1e-6);

        // No samples of consume on r2 at all.
        let err =
            estimate_timeline(&catalog, &pipeline, &pool, consume, r1, r2, 1000.0).unwrap_err();
        assert!(matches!(err, EstimateError::InsufficientSamples { .. }));
    }

    #[test]
    fn consumer_scaling_partitions_inputs() {
        let (pipeline, pool, catalog) = fixture();
        let consume = pipeline.step_id("consume").unwrap();
        let r1 = pool.resource_id("r1").unwrap();

        let est = estimate_timeline(&catalog, &pipeline, &pool, consume, r1, r1, 1000.0).unwrap();
        assert_eq!(est.total_expected_inputs(), 100);

        // 100 inputs over 3 replicas: 34 + 34 + 32.
        let shares: Vec<u64> = (0..3)
            .map(|i| est.scale_to(3, i).unwrap().number_of_transmitted_inputs())
            .collect();
        assert_eq!(shares, vec![34, 34, 32]);
        assert_eq!(shares.iter().sum::<u64>(), 100);

        // Every replica still pays deployment; processing shrinks with the
        // share while the per-input rate is unchanged.
        let replica = est.scale_to(3, 2).unwrap();
        assert!(
            (replica.provisioning_and_deployment_time()
                - est.provisioning_and_deployment_time())
            .abs()
                < 1e-12
        );
        assert!((replica.step_processing_time() - 32.0 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn cache_tracks_runnable_resources() {
        let (pipeline, pool, catalog) = fixture();
        let produce = pipeline.step_id("produce").unwrap();
        let consume = pipeline.step_id("consume").unwrap();
        let r1 = pool.resource_id("r1").unwrap();

        let cache = EstimationCache::build(
            &catalog,
            &pipeline,
            &pool,
            &EstimatorConfig::default(),
            1000.0,
        );
        assert_eq!(cache.runnable_resources(produce, &pool), vec![r1]);
        // consume has throughput samples on r1 but no performance samples
        // anywhere, so no resource can host it.
        assert!(cache.runnable_resources(consume, &pool).is_empty());
        assert!(cache.timeline(produce, r1, r1).is_some());
    }
}
