//! Process origin identity
//!
//! Every process participating in the exchange carries a stable 128-bit
//! identity generated once at start. Objects and events record the origin
//! that produced them; the transport uses it to suppress echoes of our own
//! broadcasts.

use uuid::Uuid;

/// Stable identity of an exchange participant
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    /// Generate a fresh origin id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Textual form, as carried in envelopes
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
