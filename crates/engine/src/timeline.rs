use std::cmp::Ordering;

use crate::model::{Pipeline, ResourceId, ResourcePool, StepId};

/// Tolerance for floating-point position and capacity comparisons.
const EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("reservation conflict on resource {resource:?} at position {position}")]
    ReservationConflict { resource: ResourceId, position: f64 },
    #[error(
        "step {step:?} scheduled at {position} before its synchronization position {required}"
    )]
    DependencyViolation {
        step: StepId,
        position: f64,
        required: f64,
    },
    #[error("event to replace is not present in the timeline")]
    UnknownEvent,
}

// ---------------------------------------------------------------------------
// Events and reservations
// ---------------------------------------------------------------------------

/// CPU and memory held on a resource for the span of one event. Two
/// reservations conflict iff they share a resource, overlap in time, and
/// their sum exceeds the resource capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceReservation {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// One step instance pinned to a resource for a contiguous interval.
/// Provisioning and inbound transfer time are part of `duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingEvent {
    pub step: StepId,
    pub resource: ResourceId,
    pub start: f64,
    pub duration: f64,
    pub reservation: ResourceReservation,
    /// Inputs this instance covers; replicas of a scaled step partition the
    /// step's total inputs across their events.
    pub inputs_covered: u64,
    /// Inbound transfer seconds subsumed into `duration`.
    pub transmission_seconds: f64,
    /// Monetary cost of that transfer, charged separately from runtime cost.
    pub transmission_cost: f64,
}

impl SchedulingEvent {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Sort key keeping the event vector totally ordered by (resource, start,
/// step). Positions are non-negative, so the bit representation of `start`
/// orders the same way as the value.
fn event_order(a: &SchedulingEvent, b: &SchedulingEvent) -> Ordering {
    a.resource
        .cmp(&b.resource)
        .then(a.start.total_cmp(&b.start))
        .then(a.step.cmp(&b.step))
}

/// Canonical multiset key of a timeline: used to deduplicate equal-score
/// candidates and to order ties deterministically.
pub type CanonicalKey = Vec<(usize, u64, u64, usize)>;

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Ordered collection of scheduling events. The single event vector is kept
/// sorted by (resource, start, step); a deep copy is a plain vector clone,
/// which is what the search relies on for speculative placement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    events: Vec<SchedulingEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SchedulingEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events_on(&self, resource: ResourceId) -> impl Iterator<Item = &SchedulingEvent> {
        self.events.iter().filter(move |e| e.resource == resource)
    }

    pub fn events_of(&self, step: StepId) -> impl Iterator<Item = &SchedulingEvent> {
        self.events.iter().filter(move |e| e.step == step)
    }

    // -----------------------------------------------------------------------
    // Packing queries
    // -----------------------------------------------------------------------

    /// Whether placing `reservation` on `resource` over [start, end) keeps
    /// the summed reservations within capacity at every position. The sum
    /// only changes where an overlapping event starts, so checking the window
    /// start plus each such boundary is exhaustive.
    fn fits(
        &self,
        resource: ResourceId,
        reservation: &ResourceReservation,
        start: f64,
        end: f64,
        pool: &ResourcePool,
    ) -> bool {
        let capacity = pool.resource(resource);
        let overlapping: Vec<&SchedulingEvent> = self
            .events_on(resource)
            .filter(|e| e.start < end - EPS && e.end() > start + EPS)
            .collect();

        let mut positions: Vec<f64> = vec![start];
        positions.extend(
            overlapping
                .iter()
                .map(|e| e.start)
                .filter(|&s| s > start + EPS && s < end - EPS),
        );

        positions.iter().all(|&p| {
            let mut cpu = reservation.cpu_cores;
            let mut memory = reservation.memory_bytes;
            for e in &overlapping {
                if e.start <= p + EPS && e.end() > p + EPS {
                    cpu += e.reservation.cpu_cores;
                    memory += e.reservation.memory_bytes;
                }
            }
            cpu <= capacity.cpu_cores + EPS && memory <= capacity.memory_bytes
        })
    }

    /// Smallest position >= `after` at which `reservation` can run on
    /// `resource` for `duration` seconds without exceeding capacity.
    /// Candidate positions only need to be `after` itself plus the end of
    /// each reservation already on the resource; the sum of active
    /// reservations can only drop at those boundaries.
    pub fn earliest_available_position_after(
        &self,
        resource: ResourceId,
        reservation: &ResourceReservation,
        duration: f64,
        after: f64,
        pool: &ResourcePool,
    ) -> f64 {
        let mut candidates: Vec<f64> = vec![after];
        candidates.extend(
            self.events_on(resource)
                .map(|e| e.end())
                .filter(|&end| end > after + EPS),
        );
        candidates.sort_by(f64::total_cmp);

        for candidate in &candidates {
            if self.fits(resource, reservation, *candidate, candidate + duration, pool) {
                return *candidate;
            }
        }
        // Past the last reservation end nothing is active; the final
        // candidate is always that position, so this is unreachable unless
        // the reservation alone exceeds capacity. Fall back to it and let
        // add_event report the conflict.
        *candidates.last().unwrap_or(&after)
    }

    /// Latest end position across all events of the synchronous
    /// prerequisites of `step`. Zero when none are scheduled.
    pub fn step_synchronization_position(&self, step: StepId, pipeline: &Pipeline) -> f64 {
        pipeline
            .step(step)
            .synchronous_parents()
            .flat_map(|parent| self.events_of(parent).map(|e| e.end()))
            .fold(0.0, f64::max)
    }

    /// Earliest position at which `step` may start: synchronous parents must
    /// have finished, and every asynchronous feed must have started emitting.
    pub fn step_release_position(&self, step: StepId, pipeline: &Pipeline) -> f64 {
        let sync = self.step_synchronization_position(step, pipeline);
        pipeline
            .step(step)
            .asynchronous_parents()
            .filter_map(|parent| {
                self.events_of(parent)
                    .map(|e| e.start)
                    .min_by(f64::total_cmp)
            })
            .fold(sync, f64::max)
    }

    pub fn latest_finishing_event_of_step(&self, step: StepId) -> Option<&SchedulingEvent> {
        self.events_of(step)
            .max_by(|a, b| a.end().total_cmp(&b.end()).then(event_order(a, b)))
    }

    pub fn scheduled_resource_of_step(&self, step: StepId) -> Option<ResourceId> {
        self.latest_finishing_event_of_step(step).map(|e| e.resource)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert an event, validating capacity and the synchronization floor.
    /// Callers are expected to have found a conflict-free position through
    /// `earliest_available_position_after`; a conflict here is a bug.
    pub fn add_event(
        &mut self,
        event: SchedulingEvent,
        pipeline: &Pipeline,
        pool: &ResourcePool,
    ) -> Result<(), TimelineError> {
        let required = self.step_synchronization_position(event.step, pipeline);
        if event.start + EPS < required {
            return Err(TimelineError::DependencyViolation {
                step: event.step,
                position: event.start,
                required,
            });
        }
        if !self.fits(
            event.resource,
            &event.reservation,
            event.start,
            event.end(),
            pool,
        ) {
            return Err(TimelineError::ReservationConflict {
                resource: event.resource,
                position: event.start,
            });
        }

        let at = self
            .events
            .partition_point(|e| event_order(e, &event) != Ordering::Greater);
        self.events.insert(at, event);
        Ok(())
    }

    /// Remove and return every event of `step`, preserving order.
    pub fn remove_events_of_step(&mut self, step: StepId) -> Vec<SchedulingEvent> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.events.drain(..).partition(|e| e.step == step);
        self.events = kept;
        removed
    }

    /// Swap one event for another, e.g. to revert a speculative scaled
    /// placement that did not pay off. The original event is restored when
    /// the replacement cannot be placed.
    pub fn replace_event(
        &mut self,
        old: &SchedulingEvent,
        new: SchedulingEvent,
        pipeline: &Pipeline,
        pool: &ResourcePool,
    ) -> Result<(), TimelineError> {
        let at = self
            .events
            .iter()
            .position(|e| e == old)
            .ok_or(TimelineError::UnknownEvent)?;
        let old = self.events.remove(at);
        match self.add_event(new, pipeline, pool) {
            Ok(()) => Ok(()),
            Err(err) => {
                let at = self
                    .events
                    .partition_point(|e| event_order(e, &old) != Ordering::Greater);
                self.events.insert(at, old);
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    /// Maximum end position across all events; zero for an empty timeline.
    pub fn total_time(&self) -> f64 {
        self.events.iter().map(|e| e.end()).fold(0.0, f64::max)
    }

    /// Runtime cost: event durations weighted by their resource's rate.
    pub fn resource_cost(&self, pool: &ResourcePool) -> f64 {
        self.events
            .iter()
            .map(|e| e.duration * pool.resource(e.resource).cost_per_second)
            .sum()
    }

    /// Total cost of data transfers between producer and consumer resources.
    pub fn data_transmission_cost(&self) -> f64 {
        self.events.iter().map(|e| e.transmission_cost).sum()
    }

    /// Deterministic event-multiset key. The event vector is already sorted
    /// by (resource, start, step), so mapping in order yields a canonical
    /// form; non-negative floats compare identically by bits and by value.
    pub fn canonical_key(&self) -> CanonicalKey {
        self.events
            .iter()
            .map(|e| {
                (
                    e.resource.0,
                    e.start.to_bits(),
                    e.duration.to_bits(),
                    e.step.0,
                )
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
    use crate::model::{DependencyKind, Resource};

    fn pool_with(cpu: f64, memory: u64) -> (ResourcePool, ResourceId) {
        let mut pool = ResourcePool::new();
        let r = pool.add_resource(Resource {
            name: "r".into(),
            cpu_cores: cpu,
            memory_bytes: memory,
            cost_per_second: 0.01,
        });
        (pool, r)
    }

    fn event(step: usize, resource: ResourceId, start: f64, duration: f64, cpu: f64) -> SchedulingEvent {
        SchedulingEvent {
            step: StepId(step),
            resource,
            start,
            duration,
            reservation: ResourceReservation {
                cpu_cores: cpu,
                memory_bytes: 1_000_000,
            },
            inputs_covered: 1,
            transmission_seconds: 0.0,
            transmission_cost: 0.0,
        }
    }

    fn chain_pipeline() -> Pipeline {
        let mut p = Pipeline::new();
        let a = p.add_step("a");
        let b = p.add_step("b");
        p.add_dependency(b, a, DependencyKind::Synchronous, false);
        p
    }

    #[test]
    fn empty_timeline_sentinels() {
        let t = Timeline::new();
        let p = chain_pipeline();
        assert_eq!(t.total_time(), 0.0);
        assert_eq!(t.step_synchronization_position(StepId(1), &p), 0.0);
        assert!(t.latest_finishing_event_of_step(StepId(0)).is_none());
        assert!(t.scheduled_resource_of_step(StepId(0)).is_none());
    }

    #[test]
    fn earliest_position_skips_saturated_window() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 3.0), &p, &pool).unwrap();

        let res = ResourceReservation {
            cpu_cores: 2.0,
            memory_bytes: 1_000_000,
        };
        // 3 + 2 cores exceed capacity, so the slot opens when the first
        // reservation ends.
        let pos = t.earliest_available_position_after(r, &res, 5.0, 0.0, &pool);
        assert!((pos - 10.0).abs() < 1e-9);

        // A one-core reservation shares the window.
        let small = ResourceReservation {
            cpu_cores: 1.0,
            memory_bytes: 1_000_000,
        };
        let pos = t.earliest_available_position_after(r, &small, 5.0, 0.0, &pool);
        assert_eq!(pos, 0.0);
    }

    #[test]
    fn earliest_position_respects_floor() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 3.0), &p, &pool).unwrap();

        let res = ResourceReservation {
            cpu_cores: 1.0,
            memory_bytes: 1_000_000,
        };
        let pos = t.earliest_available_position_after(r, &res, 5.0, 42.0, &pool);
        assert_eq!(pos, 42.0);
    }

    #[test]
    fn gap_between_events_is_found() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 4.0), &p, &pool).unwrap();
        t.add_event(event(1, r, 30.0, 10.0, 4.0), &p, &pool).unwrap();

        let res = ResourceReservation {
            cpu_cores: 4.0,
            memory_bytes: 1_000_000,
        };
        // A 20 s gap sits between the two events; a 15 s request fits there.
        let pos = t.earliest_available_position_after(r, &res, 15.0, 0.0, &pool);
        assert!((pos - 10.0).abs() < 1e-9);
        // A 25 s request does not; it must wait for the second event to end.
        let pos = t.earliest_available_position_after(r, &res, 25.0, 0.0, &pool);
        assert!((pos - 40.0).abs() < 1e-9);
    }

    #[test]
    fn add_event_rejects_capacity_conflict() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 3.0), &p, &pool).unwrap();

        let err = t.add_event(event(1, r, 5.0, 10.0, 2.0), &p, &pool).unwrap_err();
        assert!(matches!(err, TimelineError::ReservationConflict { .. }));
        assert_eq!(t.events().len(), 1);
    }

    #[test]
    fn add_event_rejects_start_before_sync_parent_end() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 1.0), &p, &pool).unwrap();

        let err = t.add_event(event(1, r, 5.0, 5.0, 1.0), &p, &pool).unwrap_err();
        assert!(matches!(err, TimelineError::DependencyViolation { .. }));

        t.add_event(event(1, r, 10.0, 5.0, 1.0), &p, &pool).unwrap();
        assert_eq!(t.total_time(), 15.0);
    }

    #[test]
    fn memory_conflicts_are_also_rejected() {
        let (pool, r) = pool_with(8.0, 2_000_000);
        let mut p = Pipeline::new();
        for name in ["a", "b", "c"] {
            p.add_step(name);
        }
        let mut t = Timeline::new();
        t.add_event(event(0, r, 0.0, 10.0, 1.0), &p, &pool).unwrap();
        // Each event reserves 1 MB; a third concurrent MB exceeds the 2 MB
        // capacity even though CPU is plentiful.
        t.add_event(event(1, r, 0.0, 10.0, 1.0), &p, &pool).unwrap();
        let err = t.add_event(event(2, r, 3.0, 2.0, 1.0), &p, &pool).unwrap_err();
        assert!(matches!(err, TimelineError::ReservationConflict { .. }));
    }

    #[test]
    fn replace_event_restores_original_on_failure() {
        let (pool, r) = pool_with(4.0, 8_000_000_000);
        let p = chain_pipeline();
        let mut t = Timeline::new();
        let original = event(0, r, 0.0, 10.0, 3.0);
        t.add_event(original.clone(), &p, &pool).unwrap();
        t.add_event(event(1, r, 20.0, 10.0, 3.0), &p, &pool).unwrap();

        // Replacement collides with the second event; the original must
        // survive the failed swap.
        let err = t
            .replace_event(&original, event(0, r, 22.0, 10.0, 3.0), &p, &pool)
            .unwrap_err();
        assert!(matches!(err, TimelineError::ReservationConflict { .. }));
        assert_eq!(t.events().len(), 2);
        assert!(t.events().contains(&original));

        t.replace_event(&original, event(0, r, 50.0, 4.0, 3.0), &p, &pool)
            .unwrap();
        assert_eq!(t.total_time(), 54.0);
    }

    #[test]
    fn costs_and_monotonicity() {
        let (mut pool, r1) = pool_with(4.0, 8_000_000_000);
        let r2 = pool.add_resource(Resource {
            name: "r2".into(),
            cpu_cores: 4.0,
            memory_bytes: 8_000_000_000,
            cost_per_second: 0.05,
        });
        let p = chain_pipeline();
        let mut t = Timeline::new();

        t.add_event(event(0, r1, 0.0, 100.0, 1.0), &p, &pool).unwrap();
        let (time0, cost0) = (t.total_time(), t.resource_cost(&pool));

        let mut ev = event(1, r2, 100.0, 10.0, 1.0);
        ev.transmission_seconds = 2.0;
        ev.transmission_cost = 0.04;
        t.add_event(ev, &p, &pool).unwrap();

        // Extending a timeline never decreases either aggregate.
        assert!(t.total_time() >= time0);
        assert!(t.resource_cost(&pool) >= cost0);
        assert!((t.resource_cost(&pool) - (100.0 * 0.01 + 10.0 * 0.05)).abs() < 1e-9);
        assert!((t.data_transmission_cost() - 0.04).abs() < 1e-12);
    }

    #[test]
    fn canonical_key_orders_events() {
        let (mut pool, r1) = pool_with(4.0, 8_000_000_000);
        let r2 = pool.add_resource(Resource {
            name: "r2".into(),
            cpu_cores: 4.0,
            memory_bytes: 8_000_000_000,
            cost_per_second: 0.01,
        });
        let p = chain_pipeline();

        let mut a = Timeline::new();
        a.add_event(event(0, r2, 5.0, 1.0, 1.0), &p, &pool).unwrap();
        a.add_event(event(1, r1, 7.0, 1.0, 1.0), &p, &pool).unwrap();

        // Insertion order must not matter for the key.
        let mut b = Timeline::new();
        b.add_event(event(1, r1, 7.0, 1.0, 1.0), &p, &pool).unwrap();
        b.add_event(event(0, r2, 5.0, 1.0, 1.0), &p, &pool).unwrap();

        assert_eq!(a.canonical_key(), b.canonical_key());
        assert_eq!(a.canonical_key()[0].0, r1.0);
    }
}
