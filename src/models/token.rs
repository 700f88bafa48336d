use serde::{Deserialize, Serialize};

/// Sentinel for `expires_at`: the token never expires.
pub const NEVER_EXPIRES: i64 = -1;

/// Lifecycle status of an issued token.
///
/// Stored as a SMALLINT; the numeric values are part of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }

    /// Unknown codes are treated as disabled so they can never pass validation.
    pub fn from_i16(code: i16) -> Self {
        match code {
            1 => TokenStatus::Enabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            _ => TokenStatus::Disabled,
        }
    }
}

/// An issued access key metered against its own quota and its account's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub account_id: i64,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    pub created_at: i64,
    pub accessed_at: i64,
    /// Epoch seconds, or [`NEVER_EXPIRES`].
    pub expires_at: i64,
    pub remaining_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
}

impl Token {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at != NEVER_EXPIRES && self.expires_at < now
    }

    /// Whether this token can cover `cost` on its own quota.
    pub fn covers(&self, cost: i64) -> bool {
        self.unlimited_quota || self.remaining_quota >= cost
    }
}
