use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::model::{Pipeline, ResourcePool};
use crate::solver::ScheduleCandidate;
use crate::timeline::{ResourceReservation, SchedulingEvent, Timeline, TimelineError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize timeline: {0}")]
    Csv(#[from] csv::Error),
    #[error("timeline csv is not valid utf-8")]
    Utf8,
    #[error("unknown step '{0}' in timeline csv")]
    UnknownStep(String),
    #[error("unknown resource '{0}' in timeline csv")]
    UnknownResource(String),
    #[error("timeline csv violates scheduling invariants: {0}")]
    Timeline(#[from] TimelineError),
}

// ---------------------------------------------------------------------------
// Timeline CSV
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TimelineRow {
    step: String,
    start_position_seconds: f64,
    end_position_seconds: f64,
    resource: String,
    cpu_reservation: f64,
    memory_reservation: u64,
}

/// Serialize a timeline: rows ordered by start position ascending, ties by
/// resource name then step name.
pub fn write_timeline_csv(
    timeline: &Timeline,
    pipeline: &Pipeline,
    pool: &ResourcePool,
) -> Result<String, ReportError> {
    let mut events: Vec<&SchedulingEvent> = timeline.events().iter().collect();
    events.sort_by(|a, b| {
        a.start
            .total_cmp(&b.start)
            .then_with(|| pool.resource(a.resource).name.cmp(&pool.resource(b.resource).name))
            .then_with(|| pipeline.step(a.step).name.cmp(&pipeline.step(b.step).name))
    });

    let mut writer = csv::Writer::from_writer(Vec::new());
    for event in events {
        writer.serialize(TimelineRow {
            step: pipeline.step(event.step).name.clone(),
            start_position_seconds: event.start,
            end_position_seconds: event.end(),
            resource: pool.resource(event.resource).name.clone(),
            cpu_reservation: event.reservation.cpu_cores,
            memory_reservation: event.reservation.memory_bytes,
        })?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))?;
    String::from_utf8(bytes).map_err(|_| ReportError::Utf8)
}

/// Rebuild a timeline from its CSV form. Input-partition and transmission
/// figures are not part of the serialization; placements, reservations and
/// the event order round-trip exactly.
pub fn read_timeline_csv<R: Read>(
    reader: R,
    pipeline: &Pipeline,
    pool: &ResourcePool,
) -> Result<Timeline, ReportError> {
    let mut timeline = Timeline::new();
    let mut reader = csv::Reader::from_reader(reader);
    for row in reader.deserialize() {
        let row: TimelineRow = row?;
        let step = pipeline
            .step_id(&row.step)
            .ok_or_else(|| ReportError::UnknownStep(row.step.clone()))?;
        let resource = pool
            .resource_id(&row.resource)
            .ok_or_else(|| ReportError::UnknownResource(row.resource.clone()))?;
        timeline.add_event(
            SchedulingEvent {
                step,
                resource,
                start: row.start_position_seconds,
                duration: row.end_position_seconds - row.start_position_seconds,
                reservation: ResourceReservation {
                    cpu_cores: row.cpu_reservation,
                    memory_bytes: row.memory_reservation,
                },
                inputs_covered: 0,
                transmission_seconds: 0.0,
                transmission_cost: 0.0,
            },
            pipeline,
            pool,
        )?;
    }
    Ok(timeline)
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// One machine-readable line per produced timeline.
#[derive(Debug, Serialize)]
pub struct TimelineSummary {
    pub total_time: f64,
    pub resource_cost: f64,
    pub transmission_cost: f64,
    pub combined_score: f64,
}

pub fn summarize(candidate: &ScheduleCandidate, pool: &ResourcePool) -> TimelineSummary {
    TimelineSummary {
        total_time: candidate.timeline.total_time(),
        resource_cost: candidate.timeline.resource_cost(pool),
        transmission_cost: candidate.timeline.data_transmission_cost(),
        combined_score: candidate.score.combined(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
