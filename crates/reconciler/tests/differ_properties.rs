//! Property tests for the differ.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::collections::BTreeMap;

use keel_reconciler::{
    Action, DesiredAttributes, ObservedAttributes, ResourceLimits, Safety, diff_attributes,
};
use proptest::prelude::*;

fn limits() -> impl Strategy<Value = ResourceLimits> {
    (
        proptest::option::of(1u32..8000),
        proptest::option::of(1u32..16384),
    )
        .prop_map(|(cpu_millis, memory_mib)| ResourceLimits {
            cpu_millis,
            memory_mib,
        })
}

fn labels() -> impl Strategy<Value = BTreeMap<String, String>> {
    proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..5)
}

prop_compose! {
    fn desired()(
        image in "[a-z]{1,8}:[0-9]{1,2}",
        replicas in 0u32..20,
        limits in limits(),
        labels in labels(),
    ) -> DesiredAttributes {
        DesiredAttributes { replicas, image, limits, labels }
    }
}

prop_compose! {
    fn observed()(
        image in proptest::option::of("[a-z]{1,8}:[0-9]{1,2}"),
        replicas in 0u32..20,
        limits in limits(),
        labels in labels(),
    ) -> ObservedAttributes {
        ObservedAttributes { replicas, image, limits, labels }
    }
}

proptest! {
    #[test]
    fn diff_against_empty_state_is_non_empty_and_deterministic(desired in desired()) {
        let empty = ObservedAttributes::default();
        let first = diff_attributes(&desired, &empty);
        let second = diff_attributes(&desired, &empty);

        prop_assert!(!first.is_empty());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn applying_a_diff_converges(desired in desired(), mut observed in observed()) {
        for action in diff_attributes(&desired, &observed) {
            action.apply_to(&mut observed);
        }
        prop_assert!(diff_attributes(&desired, &observed).is_empty());
    }

    #[test]
    fn additive_actions_precede_destructive_ones(desired in desired(), observed in observed()) {
        let actions = diff_attributes(&desired, &observed);
        let keys: Vec<_> = actions.iter().map(Action::ordering_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);

        let safeties: Vec<Safety> = actions.iter().map(Action::safety).collect();
        let first_destructive = safeties
            .iter()
            .position(|s| *s == Safety::Destructive)
            .unwrap_or(safeties.len());
        prop_assert!(safeties.iter().skip(first_destructive).all(|s| *s == Safety::Destructive));
    }

    #[test]
    fn matching_observed_state_needs_no_actions(desired in desired()) {
        let observed = ObservedAttributes::matching(&desired);
        prop_assert!(diff_attributes(&desired, &observed).is_empty());
    }
}
