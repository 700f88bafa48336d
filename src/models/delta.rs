//! Relative (delta) updates applied to persisted quota counters.
//!
//! Counters are only ever mutated as `field = field + delta` in a single
//! statement. There is no read-modify-write path.

/// Which counter pair a relative update applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaTarget {
    Token(i64),
    Account(i64),
}

/// Signed change to a `remaining` / `used` counter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaDelta {
    pub remaining: i64,
    pub used: i64,
}

impl QuotaDelta {
    /// Consume `amount`: remaining goes down, used goes up.
    pub fn debit(amount: i64) -> Self {
        Self {
            remaining: -amount,
            used: amount,
        }
    }

    /// Give back `amount`: remaining goes up, used goes down.
    pub fn credit(amount: i64) -> Self {
        Self {
            remaining: amount,
            used: -amount,
        }
    }

    /// Debit for a positive usage delta, credit for a negative one.
    /// `None` for `i64::MIN`, whose credit does not fit in an i64.
    pub fn for_usage(usage: i64) -> Option<Self> {
        if usage >= 0 {
            Some(Self::debit(usage))
        } else {
            usage.checked_neg().map(Self::credit)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.remaining == 0 && self.used == 0
    }
}

/// Usage accumulated in memory for one token, not yet persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    pub token_id: i64,
    pub delta: i64,
}
