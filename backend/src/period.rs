//! Billing period arithmetic.
//!
//! Month and year steps are calendar steps: adding a month to Jan 31 lands on
//! the last day of February. Results saturate at the maximum representable
//! instant instead of panicking.

use chrono::{DateTime, Days, Duration, Months, Utc};

use crate::models::IntervalType;

/// Instant of the next redemption, one interval after `from`.
pub fn next_redemption(interval: IntervalType, from: DateTime<Utc>) -> DateTime<Utc> {
    advance(interval, from, 1)
}

/// End of a term of `term_length` intervals starting at `start`.
///
/// Non-positive term lengths are rejected upstream; here they leave `start`
/// unchanged.
pub fn period_end(start: DateTime<Utc>, interval: IntervalType, term_length: i32) -> DateTime<Utc> {
    let units = u32::try_from(term_length).unwrap_or(0);
    advance(interval, start, units)
}

fn advance(interval: IntervalType, from: DateTime<Utc>, units: u32) -> DateTime<Utc> {
    let stepped = match interval {
        IntervalType::OneMinute => from.checked_add_signed(Duration::minutes(i64::from(units))),
        IntervalType::FiveMinutes => {
            from.checked_add_signed(Duration::minutes(5 * i64::from(units)))
        }
        IntervalType::Daily => from.checked_add_days(Days::new(u64::from(units))),
        IntervalType::Weekly => from.checked_add_days(Days::new(7 * u64::from(units))),
        IntervalType::Yearly => units
            .checked_mul(12)
            .and_then(|months| from.checked_add_months(Months::new(months))),
        // Unknown intervals bill monthly.
        IntervalType::Monthly | IntervalType::Unknown => {
            from.checked_add_months(Months::new(units))
        }
    };
    stepped.unwrap_or(DateTime::<Utc>::MAX_UTC)
}
