//! Key-name heuristics for values that must be stored encrypted.

use crate::remote::ParameterType;

const SENSITIVE_MARKERS: &[&str] = &[
    "password",
    "secret",
    "key",
    "token",
    "credential",
    "auth",
    "private",
    "cert",
];

/// True when `key` contains one of the sensitive markers, ignoring case.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// `SecureString` for sensitive keys, `String` otherwise.
pub fn parameter_type_for(key: &str) -> ParameterType {
    if is_sensitive_key(key) {
        ParameterType::SecureString
    } else {
        ParameterType::String
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DB_PASSWORD", true)]
    #[case("stripe_secret", true)]
    #[case("API_KEY", true)]
    #[case("GithubToken", true)]
    #[case("AWS_CREDENTIALS", true)]
    #[case("OAUTH_CLIENT", true)]
    #[case("PRIVATE_PEM", true)]
    #[case("TLS_CERT", true)]
    #[case("PORT", false)]
    #[case("LOG_LEVEL", false)]
    fn markers_match_case_insensitively(#[case] key: &str, #[case] expected: bool) {
        assert_eq!(is_sensitive_key(key), expected);
    }

    #[test]
    fn sensitive_keys_map_to_secure_string() {
        assert_eq!(parameter_type_for("DB_PASSWORD"), ParameterType::SecureString);
        assert_eq!(parameter_type_for("PORT"), ParameterType::String);
    }
}
