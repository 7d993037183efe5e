//! Shared time budget helpers for bounded phases.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("time budget exhausted"));
    }
    Ok(remaining)
}

/// Clamp `timeout` so it does not run past `deadline`.
///
/// Returns `None` once the deadline has passed.
pub fn clamp_to_deadline(timeout: Duration, deadline: Instant) -> Option<Duration> {
    let remaining = remaining_budget(deadline).ok()?;
    Some(timeout.min(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_errors_after_deadline() {
        let deadline = Instant::now() - Duration::from_millis(1);
        assert!(remaining_budget(deadline).is_err());
    }

    #[test]
    fn clamp_uses_smaller_of_timeout_and_remaining() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let clamped = clamp_to_deadline(Duration::from_secs(5), deadline).expect("budget left");
        assert_eq!(clamped, Duration::from_secs(5));

        let clamped = clamp_to_deadline(Duration::from_secs(600), deadline).expect("budget left");
        assert!(clamped <= Duration::from_secs(60));
    }
}
