//! Bounded exponential backoff for transient transport failures.

use crate::RdsError;
use rand::Rng;
use std::time::Duration;

/// Backoff schedule: `initial * factor^n`, capped, with up to 25%
/// random jitter added to de-synchronize competing retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            factor: 2.0,
            cap: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64
            * self.factor.powi(attempt as i32);
        let capped = base.min(self.cap.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(1.0 .. 1.25);
        Duration::from_millis((capped * jitter) as u64)
    }

    /// Run `operation` until it succeeds, fails with a final error, or
    /// exhausts the attempt budget.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, RdsError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RdsError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay(attempt);
                    debug!(
                        "transient appliance error ({}), retry {} in {:?}",
                        error,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn transient() -> RdsError {
        RdsError::Transport {
            context: "test".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(4),
            attempts: 3,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(0) >= Duration::from_millis(200));
        assert!(policy.delay(1) >= Duration::from_millis(400));
        // cap plus maximum jitter
        assert!(policy.delay(10) <= Duration::from_millis(6250));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result = quick()
            .run(move || {
                let calls = counted.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), _> = quick()
            .run(move || {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn final_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), _> = quick()
            .run(move || {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RdsError::VolumeNotFound {
                        id: "pvc-x".to_string(),
                    })
                }
            })
            .await;
        assert_matches!(result.unwrap_err(), RdsError::VolumeNotFound { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
