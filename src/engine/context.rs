// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Caller context: a cancellation signal and an optional deadline that
//! every external call is raced against.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    select,
    sync::watch,
    time::{sleep_until, Instant},
};

use crate::guard::{GuardError, GuardResult};

#[derive(Clone, Debug)]
pub struct Context {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Context {
        Context::background()
    }
}

impl Context {
    /// A context with no deadline that is only cancelled explicitly.
    pub fn background() -> Context {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Context {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            deadline: None,
        }
    }

    /// A child context sharing this context's cancellation, whose deadline
    /// is the earlier of this context's deadline and `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let candidate = Instant::now() + timeout;
        Context {
            cancel_tx: Arc::clone(&self.cancel_tx),
            cancel_rx: self.cancel_rx.clone(),
            deadline: Some(match self.deadline {
                Some(d) if d < candidate => d,
                _ => candidate,
            }),
        }
    }

    /// A context that is unaffected by this context's cancellation but is
    /// bounded by `timeout`. Used for cleanup that must run even after the
    /// caller has given up.
    pub fn detached(timeout: Duration) -> Context {
        Context::background().with_timeout(timeout)
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Return an error if the context is already cancelled or expired.
    pub fn check(&self) -> GuardResult<()> {
        if self.is_cancelled() {
            return Err(GuardError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(GuardError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `fut` until it completes, the context is cancelled, or the
    /// deadline passes. A result that arrives after cancellation is not
    /// returned; the cancellation is reported instead.
    pub async fn run<F, T>(&self, fut: F) -> GuardResult<T>
    where
        F: Future<Output = GuardResult<T>>,
    {
        self.check()?;
        let mut cancel_rx = self.cancel_rx.clone();
        let deadline = self.deadline;
        select! {
            biased;
            _ = wait_cancelled(&mut cancel_rx) => Err(GuardError::Cancelled),
            _ = wait_deadline(deadline) => Err(GuardError::DeadlineExceeded),
            res = fut => {
                self.check()?;
                res
            }
        }
    }

    /// Sleep for `duration`, waking early with an error on cancellation or
    /// deadline expiry.
    pub async fn sleep(&self, duration: Duration) -> GuardResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // The sender lives as long as any context clone, so this is only
        // reached if the context is being torn down.
        futures::future::pending::<()>().await;
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => futures::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        assert_matches!(ctx.run(async { Ok(3) }).await, Ok(3));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_run() {
        let ctx = Context::background();
        let child = ctx.with_timeout(Duration::from_secs(60));
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let res = child
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_matches!(res, Err(GuardError::Cancelled));
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_interrupts_run() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_matches!(res, Err(GuardError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(100));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_detached_ignores_cancellation() {
        let ctx = Context::background();
        ctx.cancel();
        assert_matches!(ctx.check(), Err(GuardError::Cancelled));
        let cleanup = Context::detached(Duration::from_secs(5));
        assert_matches!(cleanup.run(async { Ok(()) }).await, Ok(()));
    }
}
