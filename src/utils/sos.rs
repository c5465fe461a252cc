use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared stop signal: every clone observes the same cancellation.
///
/// Tasks spawned through [`SignalOfStop::spawn`] are raced against the
/// signal and dropped as soon as it fires, so a single `cancel()` tears
/// down everything a session or job started.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            token: CancellationToken::new(),
        }
    }

    /// A signal that fires when `self` fires, but can also be cancelled on its own.
    pub fn child(&self) -> SignalOfStop {
        SignalOfStop {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_cancellation(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` to completion unless the signal fires first.
    pub async fn select<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Spawn `fut` scoped to this signal.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let sos = self.clone();
        tokio::spawn(async move { sos.select(fut).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawned_task_stops_on_cancel() {
        let sos = SignalOfStop::new();
        let handle = sos.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            42
        });

        sos.cancel();
        assert_eq!(handle.await.unwrap(), None);
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn test_child_follows_parent_only() {
        let parent = SignalOfStop::new();
        let child = parent.child();

        child.cancel();
        assert!(child.cancelled());
        assert!(!parent.cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.cancelled());
    }

    #[tokio::test]
    async fn test_select_completes_before_cancel() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
    }
}
