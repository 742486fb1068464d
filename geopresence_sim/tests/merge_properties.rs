//! Property tests for the identity-keyed merge.

use chrono::DateTime;
use geopresence_core::{PositionUpdate, PresenceSnapshot};
use proptest::prelude::*;

fn update_strategy() -> impl Strategy<Value = (String, f64, f64)> {
    let identity = prop_oneof![
        Just("alice"),
        Just("bob"),
        Just("carol"),
        Just("dave"),
        Just("erin"),
    ];
    (identity, -90.0f64..=90.0, -180.0f64..=180.0)
        .prop_map(|(identity, latitude, longitude)| (identity.to_string(), latitude, longitude))
}

fn apply(updates: &[(String, f64, f64)]) -> PresenceSnapshot {
    let observed_at = DateTime::from_timestamp(1_704_067_200, 0)
        .unwrap_or_else(|| panic!("fixed timestamp out of range"));
    updates.iter().fold(PresenceSnapshot::empty(), |snapshot, (identity, lat, lon)| {
        let update = PositionUpdate::new(identity.as_str(), *lat, *lon, observed_at)
            .unwrap_or_else(|e| panic!("generated update rejected: {e}"));
        snapshot.merged(update)
    })
}

fn first_appearance(updates: &[(String, f64, f64)]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for (identity, _, _) in updates {
        if !order.contains(identity) {
            order.push(identity.clone());
        }
    }
    order
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn no_duplication(updates in prop::collection::vec(update_strategy(), 0..64)) {
        let snapshot = apply(&updates);
        prop_assert_eq!(snapshot.len(), first_appearance(&updates).len());
        prop_assert_eq!(snapshot.version(), updates.len() as u64);
    }

    #[test]
    fn order_is_first_appearance(updates in prop::collection::vec(update_strategy(), 1..64)) {
        let snapshot = apply(&updates);
        let identities: Vec<String> = snapshot.identities().into_iter().map(str::to_string).collect();
        prop_assert_eq!(identities, first_appearance(&updates));
    }

    #[test]
    fn latest_update_wins(updates in prop::collection::vec(update_strategy(), 1..64)) {
        let snapshot = apply(&updates);
        for entry in &snapshot {
            let last = updates
                .iter()
                .rev()
                .find(|(identity, _, _)| identity == entry.identity())
                .unwrap_or_else(|| panic!("{} never sent", entry.identity()));
            prop_assert_eq!(entry.latitude(), last.1);
            prop_assert_eq!(entry.longitude(), last.2);
        }
    }

    #[test]
    fn earlier_snapshots_are_untouched(
        prefix in prop::collection::vec(update_strategy(), 1..32),
        suffix in prop::collection::vec(update_strategy(), 1..32),
    ) {
        let before = apply(&prefix);
        let frozen: Vec<PositionUpdate> = before.entries().to_vec();

        let mut after = before.clone();
        for update in apply(&suffix).entries() {
            after = after.merged(update.clone());
        }

        prop_assert_eq!(before.entries(), frozen.as_slice());
        prop_assert!(!after.same_instance(&before));
    }
}
