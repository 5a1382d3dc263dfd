//! Assertions over progress event logs.

#![allow(dead_code)]

use rd_protocol::event_models::{ProgressEvent, ProgressEventType};
use rd_protocol::run_models::{Run, RunStatus};

/// Sequence numbers are 1, 2, 3, ... with no gaps or repeats.
pub fn assert_gap_free(events: &[ProgressEvent]) {
    for (index, event) in events.iter().enumerate() {
        assert_eq!(
            event.sequence_number,
            index as u64 + 1,
            "event #{} out of sequence: {:?}",
            index,
            event
        );
    }
}

pub fn event_types(events: &[ProgressEvent]) -> Vec<ProgressEventType> {
    events.iter().map(|e| e.event_type).collect()
}

/// Events of `event_type`, optionally restricted to one stage.
pub fn events_of<'a>(
    events: &'a [ProgressEvent],
    event_type: ProgressEventType,
    stage: Option<&str>,
) -> Vec<&'a ProgressEvent> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .filter(|e| stage.is_none() || e.stage() == stage)
        .collect()
}

pub fn count_of(events: &[ProgressEvent], event_type: ProgressEventType, stage: Option<&str>) -> usize {
    events_of(events, event_type, stage).len()
}

/// The run's status and its event log tell the same story.
///
/// A terminal status has exactly one terminal event, and only `log` events
/// may follow it.
pub fn assert_terminal_agrees(run: &Run, events: &[ProgressEvent]) {
    let expected = match run.status {
        RunStatus::Completed => ProgressEventType::Completed,
        RunStatus::Failed => ProgressEventType::StageFailed,
        RunStatus::Cancelled => ProgressEventType::Cancelled,
        other => panic!("run is not terminal: {}", other),
    };

    let terminal: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event_type.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminal.len(), 1, "expected one terminal event, got {:?}", event_types(events));

    let position = terminal[0];
    assert_eq!(events[position].event_type, expected);
    for later in &events[position + 1..] {
        assert_eq!(
            later.event_type,
            ProgressEventType::Log,
            "state-mutating event after termination: {:?}",
            later
        );
    }
}

/// Stages in the order their `stage_started` events were recorded.
pub fn started_stages(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == ProgressEventType::StageStarted)
        .filter_map(|e| e.stage().map(str::to_string))
        .collect()
}
