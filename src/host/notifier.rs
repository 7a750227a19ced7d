//! Lifetime management for host invalidation registrations.

use super::{HostMm, IntervalNotifier, NotifierHandle};
use crate::error::HmmResult;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Installing,
    Active,
    WindingDown,
}

/// An interval notifier registration. Unregistered on drop.
pub struct Subscription {
    host: Arc<dyn HostMm>,
    notifier: Arc<dyn IntervalNotifier>,
    handle: Option<NotifierHandle>,
    start: u64,
    end: u64,
    state: SubscriptionState,
}

impl Subscription {
    /// Register `notifier` for `[start, end]`.
    pub fn install(
        host: Arc<dyn HostMm>,
        start: u64,
        end: u64,
        notifier: Arc<dyn IntervalNotifier>,
    ) -> HmmResult<Self> {
        let mut subscription = Self {
            host,
            notifier,
            handle: None,
            start,
            end,
            state: SubscriptionState::Installing,
        };
        let handle = subscription.host.register_notifier(
            start,
            end,
            subscription.notifier.clone(),
        )?;
        subscription.handle = Some(handle);
        subscription.state = SubscriptionState::Active;
        Ok(subscription)
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Unregister, waiting for callbacks already running to finish.
    pub fn remove(mut self) {
        self.wind_down();
    }

    fn wind_down(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.state = SubscriptionState::WindingDown;
            self.host.unregister_notifier(handle);
        }
    }

    /// Move the registration to `[start, end]` without a gap in coverage.
    ///
    /// If the coverage cannot be guaranteed the original, wider registration
    /// is kept; the notifier clips what it receives.
    #[must_use]
    pub fn resize(self, start: u64, end: u64, delay: Option<Duration>) -> Self {
        match OverlapWindow::open(self) {
            Ok(window) => window.close(start, end, delay),
            Err(original) => {
                tracing::warn!(
                    start = format_args!("{:#x}", original.start),
                    end = format_args!("{:#x}", original.end),
                    "keeping wide notifier registration"
                );
                original
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.wind_down();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Two live registrations for one notifier while its interval changes.
///
/// `covering` spans the retiring interval for as long as the window exists, so
/// an invalidation of any address in it is delivered at every instant.
pub struct OverlapWindow {
    covering: Subscription,
    retiring: Subscription,
}

impl OverlapWindow {
    /// Install the covering registration. Hands `retiring` back on failure.
    pub fn open(retiring: Subscription) -> Result<Self, Subscription> {
        match Subscription::install(
            retiring.host.clone(),
            retiring.start,
            retiring.end,
            retiring.notifier.clone(),
        ) {
            Ok(covering) => Ok(Self { covering, retiring }),
            Err(_) => Err(retiring),
        }
    }

    /// Replace the retiring registration with one over `[start, end]`, then
    /// drop the covering one.
    pub fn close(self, start: u64, end: u64, delay: Option<Duration>) -> Subscription {
        let Self { covering, retiring } = self;
        let host = retiring.host.clone();
        let notifier = retiring.notifier.clone();
        retiring.remove();

        if let Some(delay) = delay {
            tracing::debug!(
                target: "hmm::tools",
                delay_us = delay.as_micros(),
                "split invalidate window"
            );
            thread::sleep(delay);
        }

        match Subscription::install(host, start, end, notifier) {
            Ok(resized) => {
                covering.remove();
                resized
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install resized notifier");
                covering
            }
        }
    }
}
