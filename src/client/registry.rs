use std::collections::HashMap;

use futures_channel::mpsc;

use super::types::ChannelMessage;

/// State of one channel subscription.
///
/// `subscribing` holds from the subscribe command until the service
/// acknowledges; `resubscribe_on_reconnect` marks entries the driver
/// re-issues after a drop.
#[derive(Debug)]
pub(crate) struct ChannelSubscription {
    pub subscribing: bool,
    pub subscribed: bool,
    pub resubscribe_on_reconnect: bool,
    /// Per-channel delivery stream handed back by `subscribe`.
    pub sink: mpsc::UnboundedSender<ChannelMessage>,
}

/// Per-channel subscription state, owned by the driver.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    channels: HashMap<String, ChannelSubscription>,
}

impl SubscriptionRegistry {
    pub(crate) fn get(&self, channel: &str) -> Option<&ChannelSubscription> {
        self.channels.get(channel)
    }

    pub(crate) fn get_mut(&mut self, channel: &str) -> Option<&mut ChannelSubscription> {
        self.channels.get_mut(channel)
    }

    pub(crate) fn insert(&mut self, channel: String, subscription: ChannelSubscription) {
        self.channels.insert(channel, subscription);
    }

    pub(crate) fn remove(&mut self, channel: &str) -> Option<ChannelSubscription> {
        self.channels.remove(channel)
    }

    pub(crate) fn mark_subscribed(&mut self, channel: &str) {
        if let Some(entry) = self.channels.get_mut(channel) {
            entry.subscribing = false;
            entry.subscribed = true;
        }
    }

    pub(crate) fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.channels.clear();
    }
}

/// Channel-pattern → opaque permission token, cached from the validate
/// response and echoed verbatim in outbound subscribe / send commands.
#[derive(Debug, Default)]
pub(crate) struct PermissionCache {
    grants: HashMap<String, String>,
}

impl PermissionCache {
    /// Replaces the whole cache from a `validated` frame.
    pub(crate) fn replace(&mut self, grants: HashMap<String, String>) {
        self.grants = grants;
    }

    pub(crate) fn clear(&mut self) {
        self.grants.clear();
    }

    /// Token for `channel`: the exact key first, then the `prefix:*`
    /// wildcard for domain channels. An empty cache authorizes everything
    /// with an empty token; that is the unauthenticated mode.
    pub(crate) fn lookup(&self, channel: &str) -> Option<String> {
        if self.grants.is_empty() {
            return Some(String::new());
        }
        if let Some(token) = self.grants.get(channel) {
            if !token.is_empty() {
                return Some(token.clone());
            }
        }
        if let Some(colon) = channel.find(':') {
            let wildcard = format!("{}*", &channel[..colon + 1]);
            if let Some(token) = self.grants.get(&wildcard) {
                if !token.is_empty() {
                    return Some(token.clone());
                }
            }
        }
        None
    }
}
