//! Practitioner license identifiers.

/// Errors that can occur when parsing a license number.
#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    /// The input did not match the registry identifier pattern.
    #[error("License number must be 2-3 letters, a dash, then at least 5 digits")]
    InvalidFormat,
}

/// An external registry identifier for a licensed practitioner.
///
/// The registry pattern is a 2-3 letter authority prefix, a dash, then at
/// least 5 digits (e.g. `MD-10234`, `PHA-55012`). The license is the
/// ownership key for prescriptions: only the identity holding the prescribing
/// license may sign or cancel the record it created.
///
/// Not every account resolves to a license; integrator and administrative
/// accounts legitimately have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LicenseNumber(String);

impl LicenseNumber {
    /// Parses a license number, validating the registry pattern.
    ///
    /// The input is trimmed and the authority prefix is upper-cased so that
    /// `md-10234` and `MD-10234` compare equal.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, LicenseError> {
        let trimmed = input.as_ref().trim();
        if !Self::matches_pattern(trimmed) {
            return Err(LicenseError::InvalidFormat);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Returns true if `input` is shaped like a registry identifier.
    ///
    /// Used by the credential gate to decide whether a provider claim field
    /// (preferred handle, email local part) carries a license at all.
    pub fn matches_pattern(input: &str) -> bool {
        let Some((prefix, digits)) = input.split_once('-') else {
            return false;
        };
        let prefix_ok =
            (2..=3).contains(&prefix.len()) && prefix.chars().all(|c| c.is_ascii_alphabetic());
        let digits_ok = digits.len() >= 5 && digits.chars().all(|c| c.is_ascii_digit());
        prefix_ok && digits_ok
    }

    /// Returns the inner identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LicenseNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for LicenseNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for LicenseNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for LicenseNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        LicenseNumber::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_two_and_three_letter_prefixes() {
        assert!(LicenseNumber::parse("MD-10234").is_ok());
        assert!(LicenseNumber::parse("PHA-55012").is_ok());
    }

    #[test]
    fn normalises_case_and_whitespace() {
        let license = LicenseNumber::parse("  md-10234 ").unwrap();
        assert_eq!(license.as_str(), "MD-10234");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for input in [
            "",
            "MD10234",
            "M-10234",
            "ABCD-10234",
            "MD-1234",
            "MD-12a45",
            "12-34567",
            "MD-",
        ] {
            assert!(
                LicenseNumber::parse(input).is_err(),
                "expected {input:?} to be rejected"
            );
        }
    }

    #[test]
    fn pattern_check_does_not_allocate_on_failure() {
        assert!(!LicenseNumber::matches_pattern("nurse.jones"));
        assert!(LicenseNumber::matches_pattern("GP-900001"));
    }
}
