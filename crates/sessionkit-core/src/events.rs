//! Notification channel for authentication state changes.
//!
//! Delivery is at-least-once to current subscribers only. Nothing is
//! persisted: a subscriber that joins late never sees earlier events, and
//! a subscriber that falls behind skips what it missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffer size for the broadcast channel.
/// Auth events are rare; 64 covers bursts of concurrent checks.
const CHANNEL_CAPACITY: usize = 64;

/// Events published by the authentication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    LoggingIn,
    LoggedOut,
    Check,
    Required,
}

impl AuthEvent {
    /// Events after which a previously built Authorization header is stale
    pub const SESSION_CHANGES: [AuthEvent; 3] = [AuthEvent::LoggingIn, AuthEvent::LoggedOut, AuthEvent::Check];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEvent::LoggingIn => "auth:loggingIn",
            AuthEvent::LoggedOut => "auth:loggedOut",
            AuthEvent::Check => "auth:check",
            AuthEvent::Required => "auth:required",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub name: String,
    pub payload: Option<Value>,
}

impl Notification {
    pub fn is(&self, event: AuthEvent) -> bool {
        self.name == event.as_str()
    }
}

/// Publish/subscribe channel. Clone is cheap and every clone shares the
/// same subscribers and counters.
///
/// Besides the lossy broadcast, two generation counters record how many
/// logouts and session changes were ever published. They never skip, so
/// state derived from them survives a lagging receiver.
#[derive(Debug, Clone)]
pub struct Events {
    sender: broadcast::Sender<Notification>,
    logouts: Arc<AtomicU64>,
    session_changes: Arc<AtomicU64>,
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            logouts: Arc::new(AtomicU64::new(0)),
            session_changes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of `auth:loggedOut` notifications published so far
    pub fn logout_generation(&self) -> u64 {
        self.logouts.load(Ordering::SeqCst)
    }

    /// Number of loggingIn, loggedOut and check notifications published so far
    pub fn session_generation(&self) -> u64 {
        self.session_changes.load(Ordering::SeqCst)
    }

    pub fn publish(&self, name: impl Into<String>, payload: Option<Value>) {
        let notification = Notification {
            name: name.into(),
            payload,
        };
        // Counters move before delivery so a subscriber never sees an event
        // ahead of its generation
        if notification.is(AuthEvent::LoggedOut) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
        if AuthEvent::SESSION_CHANGES.into_iter().any(|event| notification.is(event)) {
            self.session_changes.fetch_add(1, Ordering::SeqCst);
        }
        // Err only means nobody is listening
        if self.sender.send(notification).is_err() {
            debug!("Published event with no subscribers");
        }
    }

    pub fn broadcast(&self, event: AuthEvent, payload: Option<Value>) {
        self.publish(event.as_str(), payload)
    }

    /// Receive every notification published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Stream of payloads for a single event name
    pub fn listen(&self, name: impl Into<String>) -> impl Stream<Item = Option<Value>> + Send + 'static {
        let name = name.into();
        let receiver = self.sender.subscribe();
        stream::unfold((receiver, name), |(mut receiver, name)| async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) if notification.name == name => {
                        return Some((notification.payload, (receiver, name)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(event = %name, skipped, "Listener lagged, skipping events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}
