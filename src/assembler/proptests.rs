//! Property-based tests for usage accounting
//!
//! - Turn totals equal input + output whenever the tool gives no total
//! - Cumulative mode never reports more than the running total
//! - Per-invocation mode passes reported counts through unchanged

use super::{account, TokenCounts, UsageAccounting};
use crate::cli::ResultUsage;
use proptest::prelude::*;

fn arb_usage() -> impl Strategy<Value = ResultUsage> {
    (0u64..1_000_000, 0u64..1_000_000, 0u64..100_000, 0u64..100_000).prop_map(
        |(input, output, cache_creation, cache_read)| ResultUsage {
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: cache_creation,
            cache_read_input_tokens: cache_read,
            total_tokens: None,
        },
    )
}

fn arb_counts() -> impl Strategy<Value = TokenCounts> {
    (0u64..2_000_000, 0u64..2_000_000).prop_map(|(input, output)| TokenCounts {
        input_tokens: input,
        output_tokens: output,
    })
}

fn arb_mode() -> impl Strategy<Value = UsageAccounting> {
    prop_oneof![
        Just(UsageAccounting::PerInvocation),
        Just(UsageAccounting::Cumulative),
    ]
}

proptest! {
    #[test]
    fn prop_total_is_sum_without_explicit_total(
        reported in arb_usage(),
        previous in arb_counts(),
        mode in arb_mode(),
    ) {
        let (turn, _) = account(&reported, mode, previous);
        prop_assert_eq!(turn.total_tokens, turn.input_tokens + turn.output_tokens);
    }

    #[test]
    fn prop_cumulative_turn_bounded_by_running_total(
        reported in arb_usage(),
        previous in arb_counts(),
    ) {
        let (turn, stored) = account(&reported, UsageAccounting::Cumulative, previous);
        prop_assert!(turn.input_tokens <= stored.input_tokens);
        prop_assert!(turn.output_tokens <= stored.output_tokens);
    }

    #[test]
    fn prop_per_invocation_passes_counts_through(
        reported in arb_usage(),
        previous in arb_counts(),
    ) {
        let (turn, stored) = account(&reported, UsageAccounting::PerInvocation, previous);
        let input = reported.input_tokens
            + reported.cache_creation_input_tokens
            + reported.cache_read_input_tokens;
        prop_assert_eq!(turn.input_tokens, input);
        prop_assert_eq!(turn.output_tokens, reported.output_tokens);
        prop_assert_eq!(stored.input_tokens, previous.input_tokens + input);
    }
}
