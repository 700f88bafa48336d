use serde::{Deserialize, Serialize};

/// Aggregate quota of an account, shared by all of its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountQuota {
    pub account_id: i64,
    pub remaining: i64,
    pub used: i64,
}
