//! Secret string wrapper that never appears in logs.

use serde::Deserialize;

/// Wrapper for values that must never appear in logs.
///
/// Directory URLs and webhook URLs often embed tokens. `Debug` and `Display`
/// always print `[REDACTED]`; [`SecretString::expose`] is the only way out.
///
/// ```
/// use herald::config::SecretString;
///
/// let secret = SecretString::new("https://hooks.example.com/T0K3N".to_string());
/// assert_eq!(format!("{:?}", secret), "[REDACTED]");
/// assert_eq!(secret.expose(), "https://hooks.example.com/T0K3N");
/// ```
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    /// The underlying value. Never pass it to a logging macro.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}
