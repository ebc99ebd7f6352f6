//! Property-based tests for workflow definition validation
//!
//! Step lists arrive from tenant admins in arbitrary order. Validation must
//! accept exactly the lists whose orders form 0..n with no repeats and return
//! them sorted, whatever order they came in.

use proptest::prelude::*;
use wps_approval::{
    definition::{ApproverRule, StepDefinition, validate_steps},
    error::ValidationError,
};

fn step(order: u32) -> StepDefinition {
    StepDefinition::new(&format!("Step {}", order), ApproverRule::Users(vec![1])).set_order(order)
}

/// A contiguous step list in shuffled order.
fn shuffled_steps_strategy() -> impl Strategy<Value = Vec<StepDefinition>> {
    (1u32..8)
        .prop_flat_map(|n| Just((0..n).collect::<Vec<u32>>()).prop_shuffle())
        .prop_map(|orders| orders.into_iter().map(step).collect())
}

proptest! {
    /// Property: any permutation of 0..n validates and comes back sorted
    #[test]
    fn prop_shuffled_contiguous_steps_are_sorted(steps in shuffled_steps_strategy()) {
        let sorted = validate_steps(&steps).expect("contiguous steps validate");
        prop_assert_eq!(sorted.len(), steps.len());
        for (idx, step) in sorted.iter().enumerate() {
            prop_assert_eq!(step.step_order as usize, idx);
            prop_assert_eq!(&step.step_name, &format!("Step {}", idx));
        }
    }

    /// Property: dropping any step other than the last leaves a gap
    #[test]
    fn prop_gap_is_rejected(
        steps in shuffled_steps_strategy().prop_filter("need two steps", |s| s.len() >= 2),
        pick in any::<prop::sample::Index>(),
    ) {
        let n = steps.len() as u32;
        let missing = pick.index(n as usize - 1) as u32;
        let remaining: Vec<_> = steps.into_iter().filter(|s| s.step_order != missing).collect();
        prop_assert_eq!(
            validate_steps(&remaining),
            Err(ValidationError::NonContiguousSteps { expected: missing, found: missing + 1 })
        );
    }

    /// Property: repeating an order is reported as a duplicate
    #[test]
    fn prop_duplicate_order_is_rejected(
        steps in shuffled_steps_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        let dup = pick.index(steps.len()) as u32;
        let mut with_dup = steps;
        with_dup.push(step(dup));
        prop_assert_eq!(validate_steps(&with_dup), Err(ValidationError::DuplicateStepOrder(dup)));
    }
}

#[test]
fn empty_list_and_empty_approvers_are_rejected() {
    assert_eq!(validate_steps(&[]), Err(ValidationError::NoSteps));
    let empty = StepDefinition::new("Nobody", ApproverRule::Role(vec![]));
    assert_eq!(
        validate_steps(&[step(0), empty.set_order(1)]),
        Err(ValidationError::EmptyApproverSet(1))
    );
}
