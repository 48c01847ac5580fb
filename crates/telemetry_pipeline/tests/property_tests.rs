//! Property-based tests for the bounded buffer.
//!
//! Each test drives a [`BoundedBuffer`] with a random sequence of enqueues and
//! drains and compares it step by step against a `VecDeque` model of the
//! overflow policy under test.

use proptest::prelude::*;
use std::collections::VecDeque;
use telemetry_pipeline::{
    BoundedBuffer, BufferConfig, EnqueueError, Enqueued, LogRecord, OverflowPolicy, Severity,
    SignalKind, SignalRecord,
};

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Drain(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Enqueue),
        1 => (1usize..16).prop_map(Op::Drain),
    ]
}

fn buffer(capacity: usize, overflow_policy: OverflowPolicy) -> BoundedBuffer {
    BoundedBuffer::new(
        SignalKind::Log,
        BufferConfig {
            capacity,
            overflow_policy,
            high_watermark: capacity,
            ..BufferConfig::default()
        },
    )
}

fn record(seq: u64) -> SignalRecord {
    SignalRecord::Log(LogRecord::new(Severity::Info, seq.to_string()))
}

fn seqs(records: Vec<SignalRecord>) -> Vec<u64> {
    records
        .into_iter()
        .map(|r| match r {
            SignalRecord::Log(l) => l.body.parse().unwrap(),
            other => panic!("unexpected record {:?}", other),
        })
        .collect()
}

proptest! {
    /// Under drop_oldest the buffer always holds the most recent records, in
    /// emission order, and never more than its capacity.
    #[test]
    fn prop_drop_oldest_matches_model(
        capacity in 1usize..32,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        let buffer = buffer(capacity, OverflowPolicy::DropOldest);
        let mut model: VecDeque<u64> = VecDeque::new();
        let mut next = 0u64;

        for op in ops {
            match op {
                Op::Enqueue => {
                    let displaced = model.len() == capacity;
                    if displaced {
                        model.pop_front();
                    }
                    model.push_back(next);
                    let expected = if displaced { Enqueued::DisplacedOldest } else { Enqueued::Accepted };
                    prop_assert_eq!(buffer.try_enqueue(record(next)), Ok(expected));
                    next += 1;
                }
                Op::Drain(max) => {
                    let take = max.min(model.len());
                    let expected: Vec<u64> = model.drain(..take).collect();
                    prop_assert_eq!(seqs(buffer.drain(max)), expected);
                }
            }
            prop_assert!(buffer.len() <= capacity);
            prop_assert_eq!(buffer.len(), model.len());
        }

        prop_assert_eq!(seqs(buffer.drain(usize::MAX)), Vec::from(model));
    }

    /// Under drop_newest nothing already buffered is ever lost.
    #[test]
    fn prop_drop_newest_matches_model(
        capacity in 1usize..32,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        let buffer = buffer(capacity, OverflowPolicy::DropNewest);
        let mut model: VecDeque<u64> = VecDeque::new();
        let mut rejected = 0u64;

        for (next, op) in (0u64..).zip(ops) {
            match op {
                Op::Enqueue => {
                    if model.len() < capacity {
                        model.push_back(next);
                        prop_assert_eq!(buffer.try_enqueue(record(next)), Ok(Enqueued::Accepted));
                    } else {
                        rejected += 1;
                        prop_assert_eq!(buffer.try_enqueue(record(next)), Err(EnqueueError::Rejected));
                    }
                }
                Op::Drain(max) => {
                    let take = max.min(model.len());
                    let expected: Vec<u64> = model.drain(..take).collect();
                    prop_assert_eq!(seqs(buffer.drain(max)), expected);
                }
            }
            prop_assert_eq!(buffer.len(), model.len());
        }

        prop_assert_eq!(buffer.metrics().rejected(), rejected);
        prop_assert_eq!(buffer.metrics().displaced(), 0);
    }

    /// Every offered record is either accepted or counted as dropped.
    #[test]
    fn prop_offered_records_accounted(
        capacity in 1usize..16,
        offered in 0u64..100,
        policy in prop_oneof![
            Just(OverflowPolicy::DropOldest),
            Just(OverflowPolicy::DropNewest),
            Just(OverflowPolicy::Block),
        ],
    ) {
        let buffer = buffer(capacity, policy);
        for seq in 0..offered {
            let _ = buffer.try_enqueue(record(seq));
        }

        let metrics = buffer.metrics();
        let refused = metrics.rejected() + metrics.full();
        prop_assert_eq!(metrics.accepted() + refused, offered);

        let buffered = buffer.drain(usize::MAX).len() as u64;
        prop_assert_eq!(buffered, metrics.accepted() - metrics.displaced());
        prop_assert!(buffered <= capacity as u64);
    }

    /// A closed buffer refuses everything but still yields what it held.
    #[test]
    fn prop_close_keeps_buffered_records(
        before in 0u64..20,
        after in 0u64..20,
    ) {
        let buffer = buffer(64, OverflowPolicy::DropOldest);
        for seq in 0..before {
            prop_assert!(buffer.try_enqueue(record(seq)).is_ok());
        }
        buffer.close();
        for seq in 0..after {
            prop_assert_eq!(buffer.try_enqueue(record(before + seq)), Err(EnqueueError::Closed));
        }

        prop_assert_eq!(seqs(buffer.drain(usize::MAX)), (0..before).collect::<Vec<_>>());
        prop_assert_eq!(buffer.metrics().closed(), after);
    }
}
