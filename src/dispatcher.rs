//! Local fan-out of documents to registered callbacks.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{Document, DocumentName};

pub type DocumentCallback = Arc<dyn Fn(DocumentName, &Document) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

struct Subscription {
    filter: Option<DocumentName>,
    callback: DocumentCallback,
}

/// Delivers each processed document to every matching subscriber, in
/// registration order, on the calling task.
#[derive(Default)]
pub struct Dispatcher {
    next_token: AtomicU64,
    subscriptions: RwLock<BTreeMap<SubscriptionToken, Subscription>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every document regardless of name.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(DocumentName, &Document) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    /// Receive only documents named `name`.
    pub fn subscribe_to<F>(&self, name: DocumentName, callback: F) -> SubscriptionToken
    where
        F: Fn(DocumentName, &Document) + Send + Sync + 'static,
    {
        self.insert(Some(name), Arc::new(callback))
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.subscriptions.write().remove(&token).is_some()
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Hand `document` to each matching subscriber and return how many ran.
    ///
    /// Callbacks are snapshotted first, so a callback may subscribe or
    /// unsubscribe without deadlocking; such changes apply from the next
    /// document on.
    pub fn process(&self, name: DocumentName, document: &Document) -> usize {
        let callbacks: Vec<DocumentCallback> = self
            .subscriptions
            .read()
            .values()
            .filter(|sub| sub.filter.map_or(true, |wanted| wanted == name))
            .map(|sub| sub.callback.clone())
            .collect();

        for callback in &callbacks {
            callback(name, document);
        }
        callbacks.len()
    }

    fn insert(&self, filter: Option<DocumentName>, callback: DocumentCallback) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .insert(token, Subscription { filter, callback });
        token
    }
}
