//! Integration tests for Scheduler.

use std::collections::HashMap;

use nano_serve::config::{CacheConfig, EngineConfig, SamplingConfig, SchedulerConfig};
use nano_serve::core::sequence::{FinishReason, RequestId, SequenceStatus};
use nano_serve::engine::{StreamEvent, SyntheticKernel};
use nano_serve::scheduler::{Role, Scheduler};
use nano_serve::{Error, ErrorKind};
use proptest::prelude::*;

const VOCAB: usize = 1_000_000;

fn test_config(page_size: usize, num_pages: usize, width: usize, chunk: usize) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            page_size,
            num_pages,
            max_chain_pages: None,
        },
        scheduler: SchedulerConfig {
            batch_width: width,
            max_prefill_chunk: chunk,
            prefill_fraction: 0.5,
            max_admission_attempts_per_tick: 1,
            token_width_buckets: Vec::new(),
        },
        pad_token_id: 0,
        eos_token_id: None,
    }
}

fn scheduler(config: &EngineConfig) -> Scheduler<SyntheticKernel> {
    Scheduler::new(config, SyntheticKernel::new(VOCAB)).unwrap()
}

type Streams = HashMap<RequestId, Vec<StreamEvent>>;

/// Step until idle, collecting every request's events.
fn drive(sched: &mut Scheduler<SyntheticKernel>, max_steps: usize) -> Streams {
    let mut streams = Streams::new();
    for _ in 0..max_steps {
        if sched.is_idle() {
            break;
        }
        let report = sched.step().unwrap();
        for (id, event) in report.events {
            streams.entry(id).or_default().push(event);
        }
    }
    streams
}

fn tokens(events: &[StreamEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token(t) => Some(*t),
            _ => None,
        })
        .collect()
}

// ========== Scenario A: chunked prefill and chain limit ==========

#[test]
fn test_long_prompt_prefills_over_four_ticks() {
    let config = test_config(16, 4, 1, 16);
    let mut sched = scheduler(&config);
    let id = RequestId::new(1);
    sched
        .admit(id, (0..50).collect(), SamplingConfig::greedy(2))
        .unwrap();

    for tick in 1..=3 {
        let report = sched.step().unwrap();
        assert_eq!(report.role_of(id), Some(Role::Prefill), "tick {tick}");
        assert!(report.tokens_for(id).is_empty());
        assert_eq!(sched.sequence(id).unwrap().status(), SequenceStatus::Prefilling);
        assert_eq!(sched.sequence(id).unwrap().prefill_cursor(), tick * 16);
    }

    let report = sched.step().unwrap();
    assert_eq!(report.role_of(id), Some(Role::Prefill));
    assert_eq!(report.token_width, 2);
    assert_eq!(report.tokens_for(id), vec![50]);
    assert_eq!(sched.sequence(id).unwrap().status(), SequenceStatus::Decoding);
    assert_eq!(sched.pool_usage().used_pages, 4);

    let report = sched.step().unwrap();
    assert_eq!(report.tokens_for(id), vec![51]);
    assert_eq!(
        report.terminal_for(id),
        Some(StreamEvent::Completed(FinishReason::MaxTokens))
    );
    sched.teardown().unwrap();
}

#[test]
fn test_long_prompt_rejected_by_chain_limit() {
    let mut config = test_config(16, 4, 1, 16);
    config.cache.max_chain_pages = Some(3);
    let mut sched = scheduler(&config);

    let err = sched
        .admit(RequestId::new(1), (0..50).collect(), SamplingConfig::greedy(2))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::OversizedRequest {
            required_pages: 4,
            max_pages: 3
        }
    ));
    assert_eq!(err.kind(), ErrorKind::OversizedRequest);
    assert!(sched.is_idle());
    assert_eq!(sched.stats().rejected, 1);
}

// ========== Scenario B: width-limited admission ==========

#[test]
fn test_third_prompt_waits_for_a_row() {
    let config = test_config(4, 16, 2, 8);
    let mut sched = scheduler(&config);
    let ids: Vec<RequestId> = (1..=3).map(RequestId::new).collect();
    for &id in &ids {
        sched.admit(id, vec![10, 20, 30], SamplingConfig::greedy(3)).unwrap();
    }

    let report = sched.step().unwrap();
    assert_eq!(
        report.rows,
        vec![(ids[0], Role::Prefill), (ids[1], Role::Prefill)]
    );
    assert_eq!(sched.sequence(ids[2]).unwrap().status(), SequenceStatus::Queued);

    let report = sched.step().unwrap();
    assert_eq!(report.role_of(ids[2]), Some(Role::Prefill));
    assert_eq!(report.role_of(ids[0]), Some(Role::Decode));
    assert_eq!(report.rows.len(), 2);

    let streams = drive(&mut sched, 50);
    for id in &ids[..] {
        let events = streams.get(id).unwrap();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Completed(FinishReason::MaxTokens))
        );
    }
    assert_eq!(sched.stats().completed, 3);
    sched.teardown().unwrap();
}

// ========== Scenario C: kernel failure ==========

#[test]
fn test_kernel_failure_aborts_whole_batch() {
    let config = test_config(4, 16, 3, 8);
    let kernel = SyntheticKernel::new(VOCAB).fail_at_step(2);
    let mut sched = Scheduler::new(&config, kernel).unwrap();
    let ids: Vec<RequestId> = (1..=3).map(RequestId::new).collect();
    for &id in &ids {
        sched.admit(id, vec![1, 2, 3], SamplingConfig::greedy(10)).unwrap();
    }

    let first = sched.step().unwrap();
    assert_eq!(first.rows.len(), 3);
    assert_eq!(sched.pool_usage().used_pages, 3);

    let report = sched.step().unwrap();
    assert!(report.kernel_failed);
    for &id in &ids {
        assert!(report.tokens_for(id).is_empty());
        assert_eq!(
            report.terminal_for(id),
            Some(StreamEvent::Aborted(ErrorKind::KernelFailure))
        );
    }
    assert_eq!(sched.pool_usage().used_pages, 0);
    assert!(sched.is_idle());
    assert_eq!(sched.stats().kernel_failures, 1);
    assert_eq!(sched.stats().aborted, 3);

    let after = sched.step().unwrap();
    assert!(after.events.is_empty());
    sched.teardown().unwrap();
}

// ========== Scenario D: cancellation ==========

#[test]
fn test_cancel_decoding_sequence() {
    let config = test_config(4, 16, 2, 8);
    let mut sched = scheduler(&config);
    let id = RequestId::new(1);
    let other = RequestId::new(2);
    sched.admit(id, vec![1, 2, 3], SamplingConfig::greedy(10)).unwrap();
    sched.admit(other, vec![5, 6], SamplingConfig::greedy(10)).unwrap();

    sched.step().unwrap();
    sched.step().unwrap();
    assert_eq!(sched.sequence(id).unwrap().status(), SequenceStatus::Decoding);

    assert!(sched.cancel(id));
    let report = sched.step().unwrap();
    assert_eq!(report.role_of(id), None);
    assert!(report.tokens_for(id).is_empty());
    assert_eq!(report.terminal_for(id), Some(StreamEvent::Cancelled));
    assert_eq!(report.role_of(other), Some(Role::Decode));
    assert!(sched.sequence(id).is_none());
    assert_eq!(sched.stats().cancelled, 1);

    // A second cancel is a no-op.
    assert!(!sched.cancel(id));
    let report = sched.step().unwrap();
    assert!(report.terminal_for(id).is_none());
}

#[test]
fn test_cancel_queued_sequence_frees_nothing() {
    let config = test_config(4, 16, 1, 8);
    let mut sched = scheduler(&config);
    let running = RequestId::new(1);
    let waiting = RequestId::new(2);
    sched.admit(running, vec![1], SamplingConfig::greedy(5)).unwrap();
    sched.admit(waiting, vec![1], SamplingConfig::greedy(5)).unwrap();

    sched.step().unwrap();
    assert_eq!(sched.num_queued(), 1);

    assert!(sched.cancel(waiting));
    let report = sched.step().unwrap();
    assert_eq!(report.terminal_for(waiting), Some(StreamEvent::Cancelled));
    assert_eq!(sched.num_active(), 1);
}

#[test]
fn test_cancel_completed_is_noop() {
    let config = test_config(4, 16, 1, 8);
    let mut sched = scheduler(&config);
    let id = RequestId::new(1);
    sched.admit(id, vec![1, 2], SamplingConfig::greedy(1)).unwrap();

    let report = sched.step().unwrap();
    assert_eq!(
        report.terminal_for(id),
        Some(StreamEvent::Completed(FinishReason::MaxTokens))
    );
    assert!(!sched.cancel(id));
}

// ========== Policy ==========

#[test]
fn test_fifo_first_token_order() {
    let config = test_config(4, 32, 2, 8);
    let mut sched = scheduler(&config);
    let ids: Vec<RequestId> = (1..=4).map(RequestId::new).collect();
    for &id in &ids {
        sched.admit(id, vec![1, 2, 3, 4], SamplingConfig::greedy(4)).unwrap();
    }

    let mut first_token_tick: HashMap<RequestId, usize> = HashMap::new();
    for tick in 1..=40 {
        if sched.is_idle() {
            break;
        }
        let report = sched.step().unwrap();
        for &id in &ids {
            if !report.tokens_for(id).is_empty() {
                first_token_tick.entry(id).or_insert(tick);
            }
        }
    }

    let ticks: Vec<usize> = ids.iter().map(|id| first_token_tick[id]).collect();
    assert!(ticks.windows(2).all(|w| w[0] <= w[1]), "{ticks:?}");
}

#[test]
fn test_queue_head_blocks_later_arrivals() {
    let config = test_config(4, 4, 4, 16);
    let mut sched = scheduler(&config);
    let big = RequestId::new(1);
    let medium = RequestId::new(2);
    let small = RequestId::new(3);
    sched.admit(big, vec![1; 12], SamplingConfig::greedy(1)).unwrap();
    sched.admit(medium, vec![1; 8], SamplingConfig::greedy(1)).unwrap();
    sched.admit(small, vec![1; 2], SamplingConfig::greedy(1)).unwrap();

    let report = sched.step().unwrap();
    assert_eq!(report.rows, vec![(big, Role::Prefill)]);
    assert_eq!(sched.sequence(small).unwrap().status(), SequenceStatus::Queued);
}

#[test]
fn test_more_attempts_let_small_requests_through() {
    let mut config = test_config(4, 4, 4, 16);
    config.scheduler.max_admission_attempts_per_tick = 2;
    let mut sched = scheduler(&config);
    let big = RequestId::new(1);
    let medium = RequestId::new(2);
    let small = RequestId::new(3);
    sched.admit(big, vec![1; 12], SamplingConfig::greedy(1)).unwrap();
    sched.admit(medium, vec![1; 8], SamplingConfig::greedy(1)).unwrap();
    sched.admit(small, vec![1; 2], SamplingConfig::greedy(1)).unwrap();

    let report = sched.step().unwrap();
    assert_eq!(report.rows, vec![(big, Role::Prefill), (small, Role::Prefill)]);
    assert_eq!(sched.sequence(medium).unwrap().status(), SequenceStatus::Queued);
}

#[test]
fn test_stop_token_is_not_emitted() {
    let config = test_config(4, 16, 1, 8);
    let mut sched = scheduler(&config);
    let id = RequestId::new(1);
    sched
        .admit(id, vec![5], SamplingConfig::greedy(10).with_stop_token(8))
        .unwrap();

    let streams = drive(&mut sched, 20);
    let events = &streams[&id];
    assert_eq!(tokens(events), vec![6, 7]);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Completed(FinishReason::StopToken(8)))
    );
}

#[test]
fn test_engine_wide_eos() {
    let mut config = test_config(4, 16, 1, 8);
    config.eos_token_id = Some(3);
    let mut sched = scheduler(&config);
    let id = RequestId::new(1);
    sched.admit(id, vec![1, 2], SamplingConfig::greedy(10)).unwrap();

    let streams = drive(&mut sched, 20);
    assert!(tokens(&streams[&id]).is_empty());
    assert_eq!(
        streams[&id].last(),
        Some(&StreamEvent::Completed(FinishReason::StopToken(3)))
    );
}

#[test]
fn test_padding_is_counted() {
    let config = test_config(4, 16, 4, 8);
    let mut sched = scheduler(&config);
    sched.admit(RequestId::new(1), vec![1], SamplingConfig::greedy(1)).unwrap();

    let report = sched.step().unwrap();
    assert_eq!(report.padding_rows, 3);
    assert_eq!(sched.stats().padding_rows, 3);
}

// ========== Properties ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_streams_are_ordered_and_terminate(
        requests in prop::collection::vec((1usize..20, 1usize..10), 1..8),
        num_pages in 4usize..16,
        width in 1usize..4,
    ) {
        let config = test_config(4, num_pages, width, 8);
        let mut sched = scheduler(&config);

        let mut admitted = Vec::new();
        for (n, (prompt_len, max_tokens)) in requests.into_iter().enumerate() {
            let id = RequestId::new(n as u64);
            let prompt: Vec<u32> = (0..prompt_len as u32).map(|t| t * 7 + n as u32).collect();
            let last = *prompt.last().unwrap();
            if sched.admit(id, prompt, SamplingConfig::greedy(max_tokens)).is_ok() {
                admitted.push((id, last, max_tokens));
            }
        }

        let mut streams = Streams::new();
        for _ in 0..2000 {
            if sched.is_idle() {
                break;
            }
            let report = sched.step().unwrap();
            let usage = sched.pool_usage();
            prop_assert!(usage.used_pages <= usage.total_pages);
            for (id, event) in report.events {
                let stream = streams.entry(id).or_default();
                prop_assert!(stream.last().map_or(true, |e| !e.is_terminal()));
                stream.push(event);
            }
        }
        prop_assert!(sched.is_idle());

        for (id, last, max_tokens) in admitted {
            let events = &streams[&id];
            let emitted = tokens(events);
            let expected: Vec<u32> = (1..=emitted.len() as u32).map(|k| last + k).collect();
            prop_assert_eq!(&emitted, &expected);
            match events.last() {
                Some(StreamEvent::Completed(FinishReason::MaxTokens)) => {
                    prop_assert_eq!(emitted.len(), max_tokens);
                }
                Some(StreamEvent::Completed(FinishReason::ContextLimit)) => {}
                other => prop_assert!(false, "unexpected terminal {:?}", other),
            }
        }
        prop_assert!(sched.teardown().is_ok());
    }
}
