//! Debug assertion macros for pipeline invariants.
//!
//! Active only in debug builds; release builds compile them away.

// =============================================================================
// Bounded buffer length
// =============================================================================

/// Assert that a buffer never holds more records than its capacity.
///
/// **Invariant**: `len ≤ capacity` after every enqueue and drain
///
/// Used in: `BoundedBuffer::offer()`, `BoundedBuffer::drain()`
macro_rules! debug_assert_bounded_len {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "buffer length {} exceeds capacity {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// Single consumer per buffer
// =============================================================================

/// Assert that no other drain was in progress when this one started.
///
/// **Invariant**: each buffer is drained by exactly one processor at a time
///
/// Used in: `BoundedBuffer::drain()`
macro_rules! debug_assert_single_consumer {
    ($was_draining:expr) => {
        debug_assert!(
            !$was_draining,
            "concurrent drain detected: buffers are single-consumer"
        )
    };
}

// =============================================================================
// Batch size bound
// =============================================================================

/// Assert that a drained batch respects the requested maximum.
///
/// **Invariant**: `drain(max).len() ≤ max`
///
/// Used in: `BoundedBuffer::drain()`
macro_rules! debug_assert_batch_bounded {
    ($batch_len:expr, $max_items:expr) => {
        debug_assert!(
            $batch_len <= $max_items,
            "drained {} records but only {} were requested",
            $batch_len,
            $max_items
        )
    };
}

// =============================================================================
// Processor leaves Exporting
// =============================================================================

/// Assert that an export cycle never ends in a non-idle state.
///
/// **Invariant**: `Exporting → Idle` regardless of the export outcome
///
/// Used in: `Worker::run_cycle()`
macro_rules! debug_assert_returned_to_idle {
    ($state:expr) => {
        debug_assert!(
            matches!($state, $crate::batch_processor::ProcessorState::Idle),
            "processor finished a cycle in state {:?} instead of Idle",
            $state
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_bounded_len;
pub(crate) use debug_assert_returned_to_idle;
pub(crate) use debug_assert_single_consumer;
