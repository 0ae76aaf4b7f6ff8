use chrono::{DateTime, Utc};

use crate::models::Priority;

// ============================================================================
// Dispatch Scoring
// ============================================================================
//
// score = base(priority) - age_bonus - urgency_bonus, lowest dispatched first.
//
// Tiers are evenly spaced; the urgency bonus is smaller than the spacing so
// a near-deadline message never scores like a higher tier.
//
// ============================================================================

/// Distance between two adjacent tier base scores
pub const TIER_SPACING: f64 = 1_000_000.0;

/// Subtracted per whole minute since the message was first staged
pub const AGE_BONUS_PER_MINUTE: f64 = 10.0;

/// Subtracted when the deadline is less than `URGENCY_WINDOW_SECS` away
pub const URGENCY_BONUS: f64 = 100_000.0;

pub const URGENCY_WINDOW_SECS: i64 = 60;

/// CRITICAL = 1,000,000 ... DEFERRED = 5,000,000
pub fn base_score(priority: Priority) -> f64 {
    (priority.tier_index() + 1) as f64 * TIER_SPACING
}

pub fn age_bonus(enqueued_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let minutes = (now - enqueued_at).num_minutes().max(0);
    minutes as f64 * AGE_BONUS_PER_MINUTE
}

pub fn urgency_bonus(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match deadline {
        Some(deadline) if (deadline - now).num_seconds() < URGENCY_WINDOW_SECS => URGENCY_BONUS,
        _ => 0.0,
    }
}

pub fn score(
    priority: Priority,
    enqueued_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    base_score(priority) - age_bonus(enqueued_at, now) - urgency_bonus(deadline, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_base_scores_are_evenly_spaced() {
        assert_eq!(base_score(Priority::Critical), 1_000_000.0);
        assert_eq!(base_score(Priority::High), 2_000_000.0);
        assert_eq!(base_score(Priority::Deferred), 5_000_000.0);
    }

    #[test]
    fn test_fresh_message_scores_at_base() {
        let now = Utc::now();
        assert_eq!(score(Priority::Normal, now, None, now), 3_000_000.0);
    }

    #[test]
    fn test_age_bonus_counts_whole_minutes() {
        let now = Utc::now();
        let enqueued = now - Duration::seconds(150);
        assert_eq!(age_bonus(enqueued, now), 20.0);
        assert_eq!(score(Priority::Low, enqueued, None, now), 4_000_000.0 - 20.0);
    }

    #[test]
    fn test_urgency_bonus_only_inside_window() {
        let now = Utc::now();
        assert_eq!(urgency_bonus(Some(now + Duration::seconds(30)), now), URGENCY_BONUS);
        assert_eq!(urgency_bonus(Some(now + Duration::seconds(120)), now), 0.0);
        assert_eq!(urgency_bonus(None, now), 0.0);
    }

    #[test]
    fn test_urgency_never_crosses_a_tier() {
        let now = Utc::now();
        let urgent_high = score(Priority::High, now, Some(now + Duration::seconds(5)), now);
        assert!(urgent_high > base_score(Priority::Critical));
        assert!(URGENCY_BONUS < TIER_SPACING);
    }
}
