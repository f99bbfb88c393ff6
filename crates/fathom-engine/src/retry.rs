//! Connect retry policy — a timed backoff helper owned by the connection
//! thread. Created from the session settings on the first connect failure,
//! consumed delay by delay, dropped on a successful connect.

use fathom_core::settings::{keys, SessionSettings};
use std::time::Duration;

const DEFAULT_DELAY_SECS: u32 = 30;

#[derive(Debug)]
pub struct ConnectionRetry {
    /// Remaining attempts; `None` is unlimited (configured count 0).
    remaining: Option<u32>,
    delay: Duration,
}

impl ConnectionRetry {
    /// Build from settings; `None` when retry is disabled.
    pub fn from_settings(settings: &SessionSettings) -> Option<Self> {
        if !settings.get_bool(keys::RETRY, false) {
            return None;
        }
        let count = settings.get_u32(keys::RETRY_COUNT, 0);
        let delay = settings.get_u32(keys::RETRY_DELAY, DEFAULT_DELAY_SECS);
        Some(Self {
            remaining: (count > 0).then_some(count),
            delay: Duration::from_secs(delay as u64),
        })
    }

    /// Consume one attempt. `None` means the budget is exhausted and the
    /// original failure should stand.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match &mut self.remaining {
            None => Some(self.delay),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let settings = SessionSettings::new();
        assert!(ConnectionRetry::from_settings(&settings).is_none());
    }

    #[test]
    fn counted_retries_exhaust() {
        let mut settings = SessionSettings::new();
        settings.set(keys::RETRY, true);
        settings.set(keys::RETRY_COUNT, 2);
        settings.set(keys::RETRY_DELAY, 5);
        let mut retry = ConnectionRetry::from_settings(&settings).unwrap();
        assert_eq!(retry.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(retry.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(retry.next_delay(), None);
    }

    #[test]
    fn zero_count_is_unlimited() {
        let mut settings = SessionSettings::new();
        settings.set(keys::RETRY, true);
        settings.set(keys::RETRY_COUNT, 0);
        let mut retry = ConnectionRetry::from_settings(&settings).unwrap();
        for _ in 0..100 {
            assert!(retry.next_delay().is_some());
        }
    }
}
