use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// A cancellable one-shot timer polled from the connection's `select!` loop.
///
/// Starting a running timer replaces its deadline, so at most one expiry of
/// each kind is ever pending.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, after: Duration) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(Instant::now() + after),
            None => self.sleep = Some(Box::pin(sleep(after))),
        }
    }

    pub fn stop(&mut self) {
        self.sleep = None;
    }

    pub fn is_active(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the timer expires, then disarms it. Never resolves while stopped.
    pub async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending().await,
        }
    }
}
