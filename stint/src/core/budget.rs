//! Time and token budget helpers.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("attempt timed out"));
    }
    Ok(remaining)
}

/// Clamp a per-call timeout to what is left of the deadline.
pub fn bounded_timeout(timeout: Duration, deadline: Option<Instant>) -> Result<Duration> {
    match deadline {
        Some(deadline) => Ok(timeout.min(remaining_budget(deadline)?)),
        None => Ok(timeout),
    }
}

/// Rough token estimate: about four ASCII characters per token, while other
/// characters weigh more. Non-empty text is at least one token.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let ascii = text.chars().filter(char::is_ascii).count();
    let other = text.chars().count() - ascii;
    let estimate = ascii as f64 / 4.0 + other as f64 / 1.5;
    (estimate.ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_is_an_error() {
        let past = Instant::now() - Duration::from_millis(5);
        assert!(remaining_budget(past).is_err());
        assert!(bounded_timeout(Duration::from_secs(1), Some(past)).is_err());
    }

    #[test]
    fn timeout_is_clamped_to_deadline() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let timeout = bounded_timeout(Duration::from_secs(60), Some(deadline)).expect("budget");
        assert!(timeout <= Duration::from_secs(2));
        assert_eq!(
            bounded_timeout(Duration::from_secs(60), None).expect("budget"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn token_estimate_is_about_four_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
