use std::sync::Arc;
use tokio::sync::watch;

/// Graceful shutdown signal shared by a server and its connections.
///
/// After [`trigger`](Self::trigger):
/// - the accept loop stops and [`Server::launch`](crate::Server::launch)
///   returns once every admitted connection has finished;
/// - connections idle between requests close at once;
/// - an exchange in progress finishes and its response carries
///   `connection: close`;
/// - upgraded connections see the signal through
///   [`ConnectionHandle::shutdown`](crate::ConnectionHandle::shutdown).
///
/// # Examples
/// ```
/// use tollgate::Shutdown;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let shutdown = Shutdown::new();
/// let waiter = shutdown.clone();
/// let task = tokio::spawn(async move { waiter.triggered().await });
///
/// assert!(!shutdown.is_triggered());
/// shutdown.trigger();
/// task.await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Shutdown {
    signal: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    #[inline]
    pub fn new() -> Self {
        Self {
            signal: Arc::new(watch::channel(false).0),
        }
    }

    /// Starts the shutdown. Triggering twice has no further effect.
    #[inline]
    pub fn trigger(&self) {
        if !self.signal.send_replace(true) {
            tracing::debug!("shutdown triggered");
        }
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) was called, at once if it
    /// already was.
    pub async fn triggered(&self) {
        let mut signal = self.signal.subscribe();
        // The sender lives as long as `self`, so the channel cannot close.
        let _ = signal.wait_for(|&stop| stop).await;
    }
}

impl Default for Shutdown {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn every_clone_sees_the_trigger() {
        let shutdown = Shutdown::new();
        let clones = [shutdown.clone(), shutdown.clone()];

        let waiters: Vec<_> = clones
            .iter()
            .cloned()
            .map(|clone| tokio::spawn(async move { clone.triggered().await }))
            .collect();

        tokio::task::yield_now().await;
        assert!(waiters.iter().all(|waiter| !waiter.is_finished()));

        shutdown.trigger();
        shutdown.trigger();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert!(clones.iter().all(Shutdown::is_triggered));
        clones[0].triggered().await;
    }
}
