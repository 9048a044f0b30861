//! Core types for the maruberu bell service.
//!
//! All types use smart constructors to ensure validity at construction time,
//! following the "parse, don't validate" principle.

use nutype::nutype;
use uuid::Uuid;

/// Characters accepted in a resource token.
fn is_token_alphabet(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

/// The token that identifies a bell resource.
///
/// `ResourceId` values are non-empty, at most 64 characters and consist of
/// ASCII hex digits and dashes only, which is the shape of the tokens handed
/// out to users (UUID strings).
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 64, predicate = is_token_alphabet),
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
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a new random token.
    pub fn generate() -> Self {
        // A hyphenated v4 UUID always satisfies the token alphabet
        Self::try_new(Uuid::new_v4().to_string())
            .expect("hyphenated UUID should always be a valid resource id")
    }
}

/// How long the bell rings for a single resource, in milliseconds.
///
/// Validated to be at least one millisecond.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
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
    )
)]
pub struct DurationMillis(u64);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let first = ResourceId::generate();
        let second = ResourceId::generate();

        assert_ne!(first, second);
        assert_eq!(first.as_ref().len(), 36);
    }

    #[test]
    fn resource_id_rejects_empty() {
        assert!(ResourceId::try_new("   ").is_err());
    }

    #[test]
    fn resource_id_rejects_path_characters() {
        assert!(ResourceId::try_new("../etc/passwd").is_err());
        assert!(ResourceId::try_new("abc def").is_err());
    }

    #[test]
    fn resource_id_is_normalized_to_lowercase() {
        let id = ResourceId::try_new(" ABCDEF-0123 ").unwrap();
        assert_eq!(id.as_ref(), "abcdef-0123");
    }

    #[test]
    fn duration_rejects_zero() {
        assert!(DurationMillis::try_new(0).is_err());
    }

    #[test]
    fn duration_displays_and_converts_as_milliseconds() {
        let duration = DurationMillis::try_new(1500).unwrap();
        assert_eq!(duration.to_string(), "1500");
        assert_eq!(u64::from(duration), 1500);
    }

    proptest! {
        #[test]
        fn resource_id_accepts_token_strings(s in "[0-9a-f-]{1,64}") {
            let id = ResourceId::try_new(s.clone());
            prop_assert!(id.is_ok());
            let id = id.unwrap();
            prop_assert_eq!(id.as_ref(), s.as_str());
        }

        #[test]
        fn resource_id_rejects_overlong_strings(s in "[0-9a-f]{65,80}") {
            prop_assert!(ResourceId::try_new(s).is_err());
        }
    }
}
