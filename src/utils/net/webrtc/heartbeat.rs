//! Periodic tasks that keep a negotiated stream alive

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Remote-side controls for an established media session
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Push back the remote expiry of `session_handle`.
    async fn extend(&self, session_handle: &str) -> Result<()>;

    /// Ask the remote side to end `session_handle`.
    async fn stop(&self, session_handle: &str) -> Result<()>;
}

/// Something that can ask the remote encoder for a fresh keyframe
#[async_trait]
pub trait KeyframeRequester: Send + Sync {
    /// Returns the number of video streams a request was sent for.
    async fn request_keyframes(&self) -> Result<usize>;
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sends a picture-loss indication for every inbound video stream each `period`.
///
/// Never returns; run it scoped to the session's stop signal.
pub async fn keyframe_loop(requester: Arc<dyn KeyframeRequester>, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        match requester.request_keyframes().await {
            Ok(count) => debug!("Requested keyframe on {} video stream(s)", count),
            Err(e) => debug!("Keyframe request failed: {}", e),
        }
    }
}

/// Extends the remote media session each `period`.
///
/// A failed extension is logged and retried on the next tick; it never
/// ends the loop. Never returns; run it scoped to the session's stop signal.
pub async fn extend_loop(control: Arc<dyn StreamControl>, session_handle: String, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        match control.extend(&session_handle).await {
            Ok(()) => debug!("Extended media session"),
            Err(e) => warn!("Failed to extend stream: {:#}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls; the first `fail_extends` extensions fail.
    #[derive(Default)]
    pub(crate) struct CountingControl {
        pub extends: AtomicUsize,
        pub stops: AtomicUsize,
        pub fail_extends: usize,
        pub fail_stop: bool,
    }

    #[async_trait]
    impl StreamControl for CountingControl {
        async fn extend(&self, _session_handle: &str) -> Result<()> {
            let n = self.extends.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_extends {
                anyhow::bail!("extend rejected");
            }
            Ok(())
        }

        async fn stop(&self, _session_handle: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                anyhow::bail!("stop rejected");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingRequester {
        pub requests: AtomicUsize,
    }

    #[async_trait]
    impl KeyframeRequester for CountingRequester {
        async fn request_keyframes(&self) -> Result<usize> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_requests_every_period() {
        let requester = Arc::new(CountingRequester::default());
        let task = tokio::spawn(keyframe_loop(requester.clone(), Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(requester.requests.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(4200)).await;
        assert_eq!(requester.requests.load(Ordering::SeqCst), 3);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_extension_is_retried_next_tick() {
        let control = Arc::new(CountingControl {
            fail_extends: 1,
            ..Default::default()
        });
        let task = tokio::spawn(extend_loop(
            control.clone(),
            "session-1".into(),
            Duration::from_secs(240),
        ));

        tokio::time::sleep(Duration::from_secs(241)).await;
        assert_eq!(control.extends.load(Ordering::SeqCst), 1);
        assert!(!task.is_finished());

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(control.extends.load(Ordering::SeqCst), 2);

        task.abort();
    }
}
