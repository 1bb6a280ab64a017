//! Session configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::stream::proto::SubscriptionContext;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncDefaults;

impl SyncDefaults {
    pub const CONNECT_ATTEMPTS: usize = 5;
    pub const RECONNECT_ATTEMPTS: usize = usize::MAX;
    pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(50);
    pub const SUBSCRIPTION_CONTEXT: SubscriptionContext = SubscriptionContext::Connection;
}

/// Options for [`SyncSession`](crate::stream::session::SyncSession).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Budget for `start()`. Exhausting it fails the start.
    pub connect_policy: RetryPolicy,
    /// Budget for reconnecting after a dropped connection.
    pub reconnect_policy: RetryPolicy,
    /// Lifetime scope the server attaches to each subscription.
    pub subscription_context: SubscriptionContext,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            connect_policy: RetryPolicy {
                max_attempts: SyncDefaults::CONNECT_ATTEMPTS,
                initial_backoff: SyncDefaults::INITIAL_BACKOFF,
                max_backoff: SyncDefaults::MAX_BACKOFF,
                jitter: SyncDefaults::JITTER,
            },
            reconnect_policy: RetryPolicy {
                max_attempts: SyncDefaults::RECONNECT_ATTEMPTS,
                initial_backoff: SyncDefaults::INITIAL_BACKOFF,
                max_backoff: SyncDefaults::MAX_BACKOFF,
                jitter: SyncDefaults::JITTER,
            },
            subscription_context: SyncDefaults::SUBSCRIPTION_CONTEXT,
        }
    }
}

impl SyncOptions {
    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_subscription_context(mut self, context: SubscriptionContext) -> Self {
        self.subscription_context = context;
        self
    }
}
