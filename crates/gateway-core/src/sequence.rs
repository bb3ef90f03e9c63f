//! Correlation number allocation.
//!
//! Sequences live in two disjoint ranges: one for normal request/reply
//! exchanges and one for observe-style exchanges. Each range wraps back to
//! its own start, so a sequence never collides with the other range or with
//! zero, which means "no sequence".

use gateway_protocol::Sequence;
use std::sync::atomic::{AtomicU32, Ordering};

/// First sequence of the normal range.
pub const NORMAL_START: Sequence = 1;

/// Last sequence of the normal range.
pub const NORMAL_END: Sequence = 0x7FFF_FFFF;

/// First sequence of the observe range.
pub const OBSERVE_START: Sequence = 0x8000_0000;

/// Last sequence of the observe range.
pub const OBSERVE_END: Sequence = Sequence::MAX;

/// Lock-free sequence allocator.
#[derive(Debug)]
pub struct Sequencer {
    /// Next normal sequence to hand out.
    normal: AtomicU32,
    /// Next observe sequence to hand out.
    observe: AtomicU32,
}

impl Sequencer {
    /// Create a sequencer starting at the beginning of both ranges.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(NORMAL_START, OBSERVE_START)
    }

    /// Create a sequencer whose next numbers are `normal` and `observe`.
    ///
    /// Values outside their range are moved to the range start.
    #[must_use]
    pub fn starting_at(normal: Sequence, observe: Sequence) -> Self {
        let normal = if is_normal(normal) { normal } else { NORMAL_START };
        let observe = if is_observe(observe) {
            observe
        } else {
            OBSERVE_START
        };
        Self {
            normal: AtomicU32::new(normal),
            observe: AtomicU32::new(observe),
        }
    }

    /// Get the next normal sequence.
    pub fn next_normal(&self) -> Sequence {
        next_in(&self.normal, NORMAL_START, NORMAL_END)
    }

    /// Get the next observe sequence.
    pub fn next_observe(&self) -> Sequence {
        next_in(&self.observe, OBSERVE_START, OBSERVE_END)
    }

    /// Classify a sequence.
    #[must_use]
    pub fn is_observe(&self, sequence: Sequence) -> bool {
        is_observe(sequence)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

fn next_in(counter: &AtomicU32, start: Sequence, end: Sequence) -> Sequence {
    let previous = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(if current >= end { start } else { current + 1 })
    });
    // The closure never returns None.
    match previous {
        Ok(sequence) | Err(sequence) => sequence,
    }
}

/// Check if a sequence belongs to the observe range.
#[must_use]
pub fn is_observe(sequence: Sequence) -> bool {
    sequence >= OBSERVE_START
}

/// Check if a sequence belongs to the normal range.
#[must_use]
pub fn is_normal(sequence: Sequence) -> bool {
    (NORMAL_START..=NORMAL_END).contains(&sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ranges_are_disjoint() {
        let sequencer = Sequencer::new();
        let normal = sequencer.next_normal();
        let observe = sequencer.next_observe();

        assert_eq!(normal, NORMAL_START);
        assert_eq!(observe, OBSERVE_START);
        assert!(!sequencer.is_observe(normal));
        assert!(sequencer.is_observe(observe));
        assert!(!is_normal(0));
        assert!(!is_observe(0));
    }

    #[test]
    fn test_wrap_at_range_end() {
        let sequencer = Sequencer::starting_at(NORMAL_END - 1, OBSERVE_END - 1);

        assert_eq!(sequencer.next_normal(), NORMAL_END - 1);
        assert_eq!(sequencer.next_normal(), NORMAL_END);
        assert_eq!(sequencer.next_normal(), NORMAL_START);

        assert_eq!(sequencer.next_observe(), OBSERVE_END - 1);
        assert_eq!(sequencer.next_observe(), OBSERVE_END);
        assert_eq!(sequencer.next_observe(), OBSERVE_START);
    }

    #[test]
    fn test_wrap_never_crosses_ranges() {
        // Issue well past both wrap points and classify everything.
        let sequencer = Sequencer::starting_at(NORMAL_END - 10_000, OBSERVE_END - 10_000);
        for _ in 0..50_000 {
            let normal = sequencer.next_normal();
            let observe = sequencer.next_observe();
            assert!(is_normal(normal), "{normal:#x} left the normal range");
            assert!(is_observe(observe), "{observe:#x} left the observe range");
            assert_ne!(normal, 0);
        }
    }

    #[test]
    fn test_out_of_range_start_is_clamped() {
        let sequencer = Sequencer::starting_at(0, 5);
        assert_eq!(sequencer.next_normal(), NORMAL_START);
        assert_eq!(sequencer.next_observe(), OBSERVE_START);
    }

    #[test]
    fn test_concurrent_sequences_are_distinct() {
        let sequencer = Arc::new(Sequencer::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sequencer = Arc::clone(&sequencer);
                std::thread::spawn(move || {
                    (0..5_000)
                        .map(|_| {
                            if i % 2 == 0 {
                                sequencer.next_normal()
                            } else {
                                sequencer.next_observe()
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for sequence in handle.join().unwrap() {
                assert!(seen.insert(sequence), "duplicate sequence {sequence}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }
}
