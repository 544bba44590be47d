//! Core vocabulary types for the event log.
//!
//! Identifiers that originate from callers use smart constructors so that an
//! invalid aggregate id or resource owner can never reach the store. Names that
//! are fixed by code (aggregate and event types) are only trimmed.

use nutype::nutype;

/// Name of an aggregate type, e.g. `user` or `org`.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// Name of an event type, e.g. `user.human.added`.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Identifier of one aggregate instance.
///
/// Guaranteed non-empty and at most 200 characters after trimming.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

/// Tenant (organisation) that owns an aggregate.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceOwner(String);

/// Identity of whoever caused an event (a user id or a system principal).
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EditorUser(String);

/// Store-wide position of an event.
///
/// Sequences start at 1 and are never reused. `Sequence::zero()` is the
/// watermark of a handler that has not processed anything yet.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Sequence(u64);

impl Sequence {
    /// The position before the first event.
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// The position directly after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Postgres has no unsigned 64-bit type; sequences are stored as BIGINT.
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.into_inner()).unwrap_or(i64::MAX)
    }

    /// Inverse of [`Sequence::as_i64`]; negative values clamp to zero.
    pub fn from_i64(value: i64) -> Self {
        Self::new(u64::try_from(value).unwrap_or(0))
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::zero()
    }
}

/// Number of events in one aggregate; the first event has version 1.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct AggregateVersion(u64);

impl AggregateVersion {
    /// Version of an aggregate that has no events.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the next version after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

impl Default for AggregateVersion {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn aggregate_id_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,200}") {
            let id = AggregateId::try_new(s.clone());
            prop_assert!(id.is_ok());
            let id = id.unwrap();
            prop_assert_eq!(id.as_ref(), &s);
        }

        #[test]
        fn aggregate_id_trims_whitespace(s in " {0,5}[a-z0-9]{1,100} {0,5}") {
            let id = AggregateId::try_new(s.clone()).unwrap();
            prop_assert_eq!(id.as_ref(), s.trim());
        }

        #[test]
        fn sequence_survives_bigint_conversion(n in 0u64..(i64::MAX as u64)) {
            let sequence = Sequence::new(n);
            prop_assert_eq!(Sequence::from_i64(sequence.as_i64()), sequence);
        }

        #[test]
        fn next_sequence_is_strictly_greater(n in 0u64..u64::MAX) {
            let sequence = Sequence::new(n);
            prop_assert!(sequence.next() > sequence);
        }
    }

    #[test]
    fn aggregate_id_rejects_empty_string() {
        assert!(AggregateId::try_new("   ").is_err());
    }

    #[test]
    fn resource_owner_rejects_overlong_values() {
        let too_long = "o".repeat(201);
        assert!(ResourceOwner::try_new(too_long).is_err());
    }

    #[test]
    fn negative_bigint_clamps_to_zero() {
        assert_eq!(Sequence::from_i64(-4), Sequence::zero());
    }

    #[test]
    fn versions_start_at_zero_and_increment() {
        let version = AggregateVersion::initial();
        assert_eq!(version.next(), AggregateVersion::new(1));
    }
}
