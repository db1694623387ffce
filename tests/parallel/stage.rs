//! Stage loop semantics: block commit, failure policies, filtered
//! ranges, and restart-point tracking.

use std::sync::{Arc, Mutex};

use replicore::{
    metadata, CancelToken, Error, FailurePolicy, Filter, Payload, ReplEvent, Result, Schedule,
    StageConfig, StageEvent, StageTask,
};

use crate::{data_event, ApplierCall, Feed, RecordingApplier, TestExtractor};

fn fragment(seqno: u64, fragno: u32, last: bool) -> ReplEvent {
    ReplEvent::new(
        seqno,
        format!("binlog.000001:{seqno}:{fragno}"),
        Payload::Statement("w".into()),
    )
    .with_fragment(fragno, last)
}

fn task_over(
    events: Vec<ReplEvent>,
    applier: RecordingApplier,
    config: StageConfig,
) -> StageTask<TestExtractor, RecordingApplier> {
    let cancel = CancelToken::new();
    let schedule = Schedule::new(cancel.clone());
    let extractor = TestExtractor::new(events, cancel);
    StageTask::new("q-to-dbms", extractor, applier, schedule, config)
}

#[test]
fn fragmented_transaction_commits_once() {
    let events = vec![
        fragment(5, 0, false),
        fragment(5, 1, false),
        fragment(5, 2, false),
        fragment(5, 3, true),
    ];
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(10),
    );
    task.run().unwrap();

    assert_eq!(applier.commit_flags(), vec![false, false, false, true]);
    let committed = task.schedule().last_committed().unwrap();
    assert_eq!(committed.seqno, 5);
    assert_eq!(committed.fragno, 3);
    assert!(committed.last_frag);
}

#[test]
fn block_commit_batches_transactions() {
    let events = (1..=5).map(data_event).collect();
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(2),
    );
    task.run().unwrap();

    // Commits at the block boundary (2, 4) and at input drain (5).
    assert_eq!(
        applier.commit_flags(),
        vec![false, true, false, true, true]
    );
    assert_eq!(task.schedule().last_committed().unwrap().seqno, 5);
    assert_eq!(task.schedule().events_processed(), 5);
}

#[test]
fn unbatched_mode_commits_every_transaction() {
    let events = (1..=3).map(data_event).collect();
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(1),
    );
    task.run().unwrap();
    assert_eq!(applier.commit_flags(), vec![true, true, true]);
}

#[test]
fn warn_policy_skips_failed_event_without_advancing() {
    let events = (1..=3).map(data_event).collect();
    let applier = RecordingApplier::new().fail_on([2]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default()
            .block_commit_rows(1)
            .applier_policy(FailurePolicy::Warn),
    );
    task.set_observer(move |event| observed.lock().unwrap().push(event.clone()));
    task.run().unwrap();

    assert_eq!(applier.commit_flags(), vec![true, true]); // seqnos 1 and 3
    assert_eq!(task.schedule().last_committed().unwrap().seqno, 3);
    assert_eq!(task.schedule().events_processed(), 2);
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|event| matches!(
        event,
        StageEvent::ApplierError { seqno: 2, .. }
    )));
}

#[test]
fn stop_policy_surfaces_failure_and_records_last_good() {
    let events = (1..=3).map(data_event).collect();
    let applier = RecordingApplier::new().fail_on([2]);
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(1),
    );
    let result = task.run();
    assert!(matches!(result, Err(Error::Application { seqno: 2, .. })));
    assert_eq!(task.schedule().last_committed().unwrap().seqno, 1);
    // The last good position is re-persisted, marked non-recoverable.
    assert_eq!(
        applier.calls().last().unwrap(),
        &ApplierCall::Position {
            seqno: 1,
            commit: true,
            recoverable: false,
        }
    );
}

#[test]
fn extractor_warn_policy_retries() {
    let cancel = CancelToken::new();
    let schedule = Schedule::new(cancel.clone());
    let extractor = TestExtractor::scripted(
        vec![
            Feed::Event(data_event(1)),
            Feed::Fail("connection reset".into()),
            Feed::Event(data_event(2)),
        ],
        cancel,
    );
    let applier = RecordingApplier::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let mut task = StageTask::new(
        "flaky-upstream",
        extractor,
        applier.clone(),
        schedule,
        StageConfig::default()
            .block_commit_rows(1)
            .extractor_policy(FailurePolicy::Warn),
    );
    task.set_observer(move |event| observed.lock().unwrap().push(event.clone()));
    task.run().unwrap();

    assert_eq!(applier.commit_flags(), vec![true, true]);
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, StageEvent::ExtractorError { .. })));
}

#[test]
fn extractor_stop_policy_exits() {
    let cancel = CancelToken::new();
    let schedule = Schedule::new(cancel.clone());
    let extractor = TestExtractor::scripted(
        vec![Feed::Fail("corrupt header".into()), Feed::Event(data_event(1))],
        cancel,
    );
    let applier = RecordingApplier::new();
    let mut task = StageTask::new(
        "broken-upstream",
        extractor,
        applier.clone(),
        schedule,
        StageConfig::default(),
    );
    assert!(matches!(task.run(), Err(Error::Extraction { .. })));
    assert!(applier.commit_flags().is_empty());
}

/// Suppresses every event whose seqno falls in a fixed range.
struct SuppressRange {
    from: u64,
    to: u64,
}

impl Filter for SuppressRange {
    fn filter(&mut self, event: ReplEvent) -> Result<Option<ReplEvent>> {
        if (self.from..=self.to).contains(&event.seqno()) {
            Ok(None)
        } else {
            Ok(Some(event))
        }
    }
}

#[test]
fn suppressed_run_is_delivered_as_one_range() {
    let events = (1..=4).map(data_event).collect();
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(1),
    );
    task.add_filter(Box::new(SuppressRange { from: 2, to: 3 }));
    task.run().unwrap();

    let applies: Vec<ApplierCall> = applier
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ApplierCall::Apply { .. }))
        .collect();
    assert_eq!(applies.len(), 3);
    assert!(matches!(
        applies[0],
        ApplierCall::Apply { seqno: 1, filtered: None, .. }
    ));
    // One synthetic event stands in for both suppressed seqnos, ahead
    // of the next real event.
    assert!(matches!(
        applies[1],
        ApplierCall::Apply { seqno: 3, filtered: Some((2, 3)), .. }
    ));
    assert!(matches!(
        applies[2],
        ApplierCall::Apply { seqno: 4, filtered: None, .. }
    ));
    assert_eq!(task.schedule().last_committed().unwrap().seqno, 4);
}

#[test]
fn rollback_metadata_arms_rollback_and_flushes_block() {
    let events = vec![
        data_event(1),
        data_event(2).with_metadata(metadata::ROLLBACK, "1"),
    ];
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(5),
    );
    task.run().unwrap();

    let calls = applier.calls();
    assert_eq!(
        calls[0],
        ApplierCall::Apply {
            seqno: 1,
            commit: false,
            rollback: false,
            filtered: None,
        }
    );
    // The pending block commits before the rolled-back transaction.
    assert_eq!(calls[1], ApplierCall::Commit);
    assert!(matches!(
        calls[2],
        ApplierCall::Apply { seqno: 2, rollback: true, .. }
    ));
}

#[test]
fn unsafe_for_block_commit_breaks_the_block() {
    let events = vec![
        data_event(1),
        data_event(2).with_metadata(metadata::UNSAFE_FOR_BLOCK_COMMIT, "1"),
        data_event(3),
    ];
    let applier = RecordingApplier::new();
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(10),
    );
    task.run().unwrap();

    let calls = applier.calls();
    assert_eq!(
        calls[1],
        ApplierCall::Commit,
        "pending block must flush before the unsafe event"
    );
    assert!(matches!(
        calls[2],
        ApplierCall::Apply { seqno: 2, commit: true, .. }
    ));
    // The trailing event commits at input drain.
    assert!(matches!(
        calls[3],
        ApplierCall::Apply { seqno: 3, commit: true, .. }
    ));
}

#[test]
fn service_change_forces_commit_boundary() {
    let events = vec![
        data_event(1).with_service("east"),
        data_event(2).with_service("east"),
        data_event(3).with_service("west"),
    ];
    let applier = RecordingApplier::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let mut task = task_over(
        events,
        applier.clone(),
        StageConfig::default().block_commit_rows(10),
    );
    task.set_observer(move |event| observed.lock().unwrap().push(event.clone()));
    task.run().unwrap();

    let calls = applier.calls();
    // Two east transactions stage, then the service switch commits them
    // before any west work.
    assert!(matches!(calls[0], ApplierCall::Apply { seqno: 1, commit: false, .. }));
    assert!(matches!(calls[1], ApplierCall::Apply { seqno: 2, commit: false, .. }));
    assert_eq!(calls[2], ApplierCall::Commit);
    assert!(matches!(calls[3], ApplierCall::Apply { seqno: 3, .. }));
    assert_eq!(
        seen.lock().unwrap().iter().filter(|event| matches!(
            event,
            StageEvent::ServiceChange { mid_fragment: false, .. }
        )).count(),
        1
    );
}

#[test]
fn schedule_skips_advance_position_without_applying() {
    let events: Vec<_> = (1..=4).map(data_event).collect();
    let applier = RecordingApplier::new();
    let cancel = CancelToken::new();
    let mut schedule = Schedule::new(cancel.clone());
    schedule.skip_seqno_range(2, 3, false);
    let extractor = TestExtractor::new(events, cancel);
    let mut task = StageTask::new(
        "skipper",
        extractor,
        applier.clone(),
        schedule,
        StageConfig::default().block_commit_rows(1),
    );
    task.run().unwrap();

    let calls = applier.calls();
    assert!(matches!(calls[0], ApplierCall::Apply { seqno: 1, .. }));
    assert_eq!(
        calls[1],
        ApplierCall::Position {
            seqno: 2,
            commit: false,
            recoverable: true,
        }
    );
    assert_eq!(
        calls[2],
        ApplierCall::Position {
            seqno: 3,
            commit: false,
            recoverable: true,
        }
    );
    assert!(matches!(calls[3], ApplierCall::Apply { seqno: 4, .. }));
    assert_eq!(task.schedule().events_processed(), 4);
}

#[test]
fn quit_rule_exits_orderly_with_final_commit() {
    let events: Vec<_> = (1..=5).map(data_event).collect();
    let applier = RecordingApplier::new();
    let cancel = CancelToken::new();
    let mut schedule = Schedule::new(cancel.clone());
    schedule.stop_after_seqno(3);
    let extractor = TestExtractor::new(events, cancel);
    let mut task = StageTask::new(
        "bounded",
        extractor,
        applier.clone(),
        schedule,
        StageConfig::default().block_commit_rows(10),
    );
    task.run().unwrap();

    // Seqnos 1..=3 apply; seqno 4 triggers the quit; 5 is never
    // extracted. The partial block flushes on the way out.
    assert_eq!(applier.commit_flags(), vec![false, false, false]);
    let calls = applier.calls();
    assert_eq!(
        calls[3],
        ApplierCall::Position {
            seqno: 4,
            commit: false,
            recoverable: true,
        }
    );
    assert_eq!(calls[4], ApplierCall::Commit);
    assert_eq!(task.schedule().last_committed().unwrap().seqno, 3);
}

#[test]
fn cancellation_rolls_back_open_transaction() {
    // The task is canceled mid-stream while a block is open; the
    // uncommitted tail must roll back, not commit, and the third event
    // must never be extracted.
    let cancel = CancelToken::new();
    let schedule = Schedule::new(cancel.clone());
    let extractor = TestExtractor::scripted(
        vec![
            Feed::Event(data_event(1)),
            Feed::Event(data_event(2)),
            Feed::Cancel,
            Feed::Event(data_event(3)),
        ],
        cancel,
    );
    let applier = RecordingApplier::new();
    let mut task = StageTask::new(
        "canceled",
        extractor,
        applier.clone(),
        schedule,
        StageConfig::default().block_commit_rows(100),
    );
    task.run().unwrap();

    let calls = applier.calls();
    assert_eq!(applier.commit_flags(), vec![false, false]);
    assert_eq!(calls.last().unwrap(), &ApplierCall::Rollback);
    assert!(task.schedule().last_committed().is_none());
}

#[test]
fn replaying_a_stream_is_deterministic() {
    let run = || {
        let events = vec![
            data_event(1),
            fragment(2, 0, false),
            fragment(2, 1, true),
            data_event(3).with_metadata(metadata::UNSAFE_FOR_BLOCK_COMMIT, "1"),
            data_event(4),
        ];
        let applier = RecordingApplier::new();
        let mut task = task_over(
            events,
            applier.clone(),
            StageConfig::default().block_commit_rows(3),
        );
        task.run().unwrap();
        let committed = task.schedule().last_committed().cloned();
        (applier.calls(), committed)
    };
    let (first_calls, first_committed) = run();
    let (second_calls, second_committed) = run();
    assert_eq!(first_calls, second_calls);
    assert_eq!(first_committed, second_committed);
    assert_eq!(first_committed.unwrap().seqno, 4);
}

#[test]
fn auto_sync_notifies_in_sequence_once() {
    let events = vec![data_event(1)];
    let applier = RecordingApplier::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let mut task = task_over(
        events,
        applier,
        StageConfig::default().auto_sync(true),
    );
    task.set_observer(move |event| observed.lock().unwrap().push(event.clone()));
    task.run().unwrap();
    assert_eq!(
        seen.lock()
            .unwrap()
            .iter()
            .filter(|event| **event == StageEvent::InSequence)
            .count(),
        1
    );
}
