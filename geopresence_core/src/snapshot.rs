//! Position updates and the identity-unique presence snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Why a position could not be built from its parts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("expected 3 arguments (latitude, longitude, identity), got {0}")]
    Arity(usize),

    #[error("{0} is not a number")]
    NotANumber(&'static str),

    #[error("identity is not a string")]
    IdentityNotAString,

    #[error("identity is empty")]
    EmptyIdentity,

    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Latest known position of one sender.
///
/// Immutable once constructed. `new` enforces coordinate ranges and a
/// non-blank identity; `from_arguments` only checks the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    identity: String,
    latitude: f64,
    longitude: f64,
    observed_at: DateTime<Utc>,
}

impl PositionUpdate {
    /// Builds a validated update.
    pub fn new(
        identity: impl Into<String>,
        latitude: f64,
        longitude: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(PositionError::EmptyIdentity);
        }
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(PositionError::OutOfRange { field: "latitude", value: latitude });
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(PositionError::OutOfRange { field: "longitude", value: longitude });
        }

        Ok(Self {
            identity,
            latitude,
            longitude,
            observed_at,
        })
    }

    /// Parses hub arguments in wire order: `(latitude, longitude, identity)`.
    ///
    /// Only the shape is checked. Other clients of the hub show whatever a
    /// sender published, so off-range coordinates and blank identities are
    /// kept as received.
    pub fn from_arguments(arguments: &[Value], observed_at: DateTime<Utc>) -> Result<Self, PositionError> {
        let [latitude, longitude, identity] = arguments else {
            return Err(PositionError::Arity(arguments.len()));
        };
        let latitude = finite(latitude, "latitude")?;
        let longitude = finite(longitude, "longitude")?;
        let identity = identity.as_str().ok_or(PositionError::IdentityNotAString)?;

        Ok(Self {
            identity: identity.to_string(),
            latitude,
            longitude,
            observed_at,
        })
    }

    /// Hub arguments in wire order: `(latitude, longitude, identity)`.
    pub fn to_arguments(&self) -> Vec<Value> {
        vec![json!(self.latitude), json!(self.longitude), json!(self.identity)]
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

fn finite(value: &Value, field: &'static str) -> Result<f64, PositionError> {
    value
        .as_f64()
        .filter(|number| number.is_finite())
        .ok_or(PositionError::NotANumber(field))
}

/// Ordered, identity-unique collection of latest positions.
///
/// Never mutated in place: `merged` returns a new snapshot sharing nothing
/// mutable with the old one, so readers can hold any published snapshot
/// for as long as they like.
#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    entries: Arc<Vec<PositionUpdate>>,
    version: u64,
}

impl PresenceSnapshot {
    /// Creates an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Upserts by identity.
    ///
    /// A known identity is replaced at its current index; a new identity is
    /// appended. No ordering by `observed_at` is attempted: the last applied
    /// update wins.
    pub fn merged(&self, update: PositionUpdate) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());

        match self.position_of(update.identity()) {
            Some(index) => entries[index] = update,
            None => entries.push(update),
        }

        Self {
            entries: Arc::new(entries),
            version: self.version + 1,
        }
    }

    /// Index of an identity in snapshot order.
    pub fn position_of(&self, identity: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.identity() == identity)
    }

    /// Latest update for an identity.
    pub fn get(&self, identity: &str) -> Option<&PositionUpdate> {
        self.entries.iter().find(|entry| entry.identity() == identity)
    }

    pub fn entries(&self) -> &[PositionUpdate] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PositionUpdate> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of merges that produced this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Identities in snapshot order.
    pub fn identities(&self) -> Vec<&str> {
        self.entries.iter().map(PositionUpdate::identity).collect()
    }

    /// True if both handles point at the same published instance.
    pub fn same_instance(&self, other: &PresenceSnapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl PartialEq for PresenceSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<'a> IntoIterator for &'a PresenceSnapshot {
    type Item = &'a PositionUpdate;
    type IntoIter = std::slice::Iter<'a, PositionUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200 + secs, 0).unwrap()
    }

    fn update(identity: &str, lat: f64, lon: f64) -> PositionUpdate {
        PositionUpdate::new(identity, lat, lon, at(0)).unwrap()
    }

    #[test]
    fn test_alice_bob_alice_scenario() {
        let snapshot = PresenceSnapshot::empty()
            .merged(update("alice", 40.7128, -74.0060))
            .merged(update("bob", 51.5074, -0.1278))
            .merged(update("alice", 40.71, -74.00));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.identities(), vec!["alice", "bob"]);

        let alice = &snapshot.entries()[0];
        assert_eq!(alice.latitude(), 40.71);
        assert_eq!(alice.longitude(), -74.00);

        let bob = &snapshot.entries()[1];
        assert_eq!(bob.latitude(), 51.5074);
        assert_eq!(bob.longitude(), -0.1278);
    }

    #[test]
    fn test_merge_never_mutates_previous() {
        let first = PresenceSnapshot::empty().merged(update("alice", 1.0, 1.0));
        let second = first.merged(update("alice", 2.0, 2.0));

        assert_eq!(first.get("alice").unwrap().latitude(), 1.0);
        assert_eq!(second.get("alice").unwrap().latitude(), 2.0);
        assert!(!first.same_instance(&second));
        assert_eq!(first.version(), 1);
        assert_eq!(second.version(), 2);
    }

    #[test]
    fn test_from_arguments_wire_order() {
        let args = vec![json!(40.7128), json!(-74.006), json!("alice")];
        let parsed = PositionUpdate::from_arguments(&args, at(5)).unwrap();

        assert_eq!(parsed.identity(), "alice");
        assert_eq!(parsed.latitude(), 40.7128);
        assert_eq!(parsed.longitude(), -74.006);
        assert_eq!(parsed.observed_at(), at(5));
        assert_eq!(parsed.to_arguments(), args);
    }

    #[test]
    fn test_from_arguments_rejects_malformed() {
        let cases = vec![
            (vec![json!(1.0), json!(2.0)], PositionError::Arity(2)),
            (vec![json!("north"), json!(2.0), json!("a")], PositionError::NotANumber("latitude")),
            (vec![json!(1.0), json!(null), json!("a")], PositionError::NotANumber("longitude")),
            (vec![json!(1.0), json!(2.0), json!(7)], PositionError::IdentityNotAString),
            (vec![json!(1.0), json!(2.0), json!(null)], PositionError::IdentityNotAString),
        ];

        for (args, expected) in cases {
            assert_eq!(PositionUpdate::from_arguments(&args, at(0)), Err(expected));
        }
    }

    #[test]
    fn test_from_arguments_keeps_off_range_and_blank_identity() {
        let off_range = PositionUpdate::from_arguments(&[json!(95.0), json!(200.0), json!("carol")], at(0)).unwrap();
        assert_eq!(off_range.latitude(), 95.0);
        assert_eq!(off_range.longitude(), 200.0);

        let blank = PositionUpdate::from_arguments(&[json!(10.0), json!(20.0), json!("")], at(0)).unwrap();
        assert_eq!(blank.identity(), "");

        // The same values are refused when we build an update to send
        assert_eq!(
            PositionUpdate::new("carol", 95.0, 200.0, at(0)),
            Err(PositionError::OutOfRange { field: "latitude", value: 95.0 })
        );
        assert_eq!(PositionUpdate::new("", 10.0, 20.0, at(0)), Err(PositionError::EmptyIdentity));
    }

    #[test]
    fn test_new_rejects_non_finite() {
        assert!(PositionUpdate::new("a", f64::NAN, 0.0, at(0)).is_err());
        assert!(PositionUpdate::new("a", 0.0, f64::INFINITY, at(0)).is_err());
    }
}
