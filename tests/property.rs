//! Property tests: deque ordering, the attempt-count law, JSON escaping,
//! and ETA formatting.

use jobforge::logger::escape_json;
use jobforge::{Job, JobExecutor, LogHandle, LogLevel, ProgressTracker, TaskError, WorkDeque};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

proptest! {
    #[test]
    fn owner_pops_reverse_push_order(items in proptest::collection::vec(any::<u32>(), 0..64)) {
        let dq = WorkDeque::new();
        for &x in &items {
            dq.push_bottom(x);
        }
        let mut popped = Vec::new();
        while let Some(x) = dq.pop_bottom() {
            popped.push(x);
        }
        let mut expected = items.clone();
        expected.reverse();
        prop_assert_eq!(popped, expected);
    }

    #[test]
    fn thieves_steal_in_push_order(items in proptest::collection::vec(any::<u32>(), 0..64)) {
        let dq = WorkDeque::new();
        for &x in &items {
            dq.push_bottom(x);
        }
        let mut stolen = Vec::new();
        while let Some(x) = dq.steal_top() {
            stolen.push(x);
        }
        prop_assert_eq!(stolen, items);
    }

    #[test]
    fn attempt_count_law(failures in 0u32..6, retries in 0u32..6) {
        // A task that fails its first `failures` invocations then succeeds.
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let job = Job::builder("law", move || {
            if c.fetch_add(1, Ordering::Relaxed) < failures {
                Err(TaskError::new("try again"))
            } else {
                Ok(())
            }
        })
        .retry_count(retries)
        .build();

        let result = JobExecutor::execute(job, &LogHandle::null());

        prop_assert!(result.attempts >= 1);
        prop_assert!(result.attempts <= retries + 1);
        prop_assert_eq!(result.attempts, (failures + 1).min(retries + 1));
        prop_assert_eq!(result.success, failures <= retries);
        prop_assert_eq!(result.success, result.error_message.is_none());
    }

    #[test]
    fn escaped_strings_parse_back(input in "\\PC*") {
        let escaped = escape_json(&input);
        // Emitted records are pure ASCII.
        prop_assert!(escaped.is_ascii());
        let parsed: String = serde_json::from_str(&format!("\"{escaped}\""))
            .expect("escaped output is a valid JSON string");
        prop_assert_eq!(parsed, input);
    }

    #[test]
    fn eta_is_well_formed(total in 1u64..500, done in 1u64..500, latency in 0u64..5_000) {
        let done = done.min(total);
        let tracker = ProgressTracker::new(total, LogHandle::null());
        tracker.pause();
        for _ in 0..done {
            tracker.mark_done(latency, LogLevel::Info);
        }

        let eta = tracker.eta_string();
        if done >= total {
            prop_assert_eq!(eta, "0s");
        } else {
            // Either "<m>m<s>s" or "<s>s", digits only between the units.
            let ok = if let Some(m_pos) = eta.find('m') {
                let (mins, rest) = eta.split_at(m_pos);
                mins.chars().all(|c| c.is_ascii_digit())
                    && rest.ends_with('s')
                    && rest[1..rest.len() - 1].chars().all(|c| c.is_ascii_digit())
            } else {
                eta.ends_with('s') && eta[..eta.len() - 1].chars().all(|c| c.is_ascii_digit())
            };
            prop_assert!(ok, "malformed ETA: {}", eta);
        }
    }
}
