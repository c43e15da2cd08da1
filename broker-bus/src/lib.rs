//! The reference in-process bus transport (C4): a [`SpecificProvider`]
//! that routes subjects in-memory instead of over a network.
//!
//! Subscriptions are matched by dot-segment wildcarding (`*` matches
//! exactly one segment, mirroring the `$Name` -> `*` substitution
//! `broker_core::provider` performs before calling us). Within a queue
//! group only one subscriber is delivered to per message; distinct queue
//! groups each get their own delivery, same as the addressed bus this
//! stands in for. Concurrency is bounded by a semaphore sized from
//! `BrokerConfig::bus_max_conns`, same backpressure shape as the typed
//! event bus this crate used to carry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_core::error::BrokerError;
use broker_core::provider::{RawHandler, SpecificProvider, Unsubscribe};
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;
use uuid::Uuid;

struct Subscriber {
    subject: String,
    group: String,
    handler: RawHandler,
}

/// In-process reference transport. One instance is shared (wrapped in a
/// `broker_core::provider::ProviderBase`) across every service a process
/// hosts.
pub struct LocalBus {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    inboxes: DashMap<String, mpsc::Sender<Vec<u8>>>,
    semaphore: Arc<Semaphore>,
    max_chans: usize,
    next_id: AtomicU64,
}

impl LocalBus {
    /// `max_conns` bounds concurrently in-flight deliveries; `max_chans`
    /// bounds the number of distinct subscriptions this bus will admit.
    pub fn new(max_conns: usize, max_chans: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            inboxes: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_conns)),
            max_chans,
            next_id: AtomicU64::new(1),
        }
    }

    /// One subscriber per distinct queue group whose subject pattern
    /// matches `subject` — the first registered subscriber in each group,
    /// mirroring a load-balanced queue subscription without needing
    /// per-group round-robin state.
    fn matching(&self, subject: &str) -> Vec<RawHandler> {
        let mut seen_groups: Vec<String> = Vec::new();
        let mut picked = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !subject_matches(&sub.subject, subject) {
                continue;
            }
            if seen_groups.contains(&sub.group) {
                continue;
            }
            seen_groups.push(sub.group.clone());
            picked.push(sub.handler.clone());
        }
        picked
    }

    async fn deliver(&self, handler: RawHandler, payload: Vec<u8>, reply_subject: String) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        tokio::spawn(async move {
            handler(payload, reply_subject).await;
            drop(permit);
        });
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024, 4096)
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let p: Vec<&str> = pattern.split('.').collect();
    let s: Vec<&str> = subject.split('.').collect();
    p.len() == s.len() && p.iter().zip(s.iter()).all(|(a, b)| *a == "*" || a == b)
}

#[async_trait]
impl SpecificProvider for LocalBus {
    async fn subscribe_raw(
        &self,
        subject: String,
        queue_group: String,
        handler: RawHandler,
    ) -> Result<Unsubscribe, BrokerError> {
        if self.subscribers.len() >= self.max_chans {
            return Err(BrokerError::ServiceUnavailable("subscription capacity exhausted".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, Subscriber { subject, group: queue_group, handler });

        // The closure only needs the DashMap entry removed; it doesn't
        // borrow `self`, so it can outlive the `LocalBus` that created it
        // as long as the map it points into does.
        let subscribers = self.subscribers.clone();
        Ok(Arc::new(move || {
            let subscribers = subscribers.clone();
            Box::pin(async move {
                subscribers.remove(&id);
            })
        }))
    }

    async fn request_raw(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BrokerError> {
        let targets = self.matching(subject);
        if targets.is_empty() {
            return Err(BrokerError::ServiceUnavailable(format!("no subscriber for {subject}")));
        }

        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel(4);
        self.inboxes.insert(inbox.clone(), tx);

        for target in &targets {
            self.deliver(target.clone(), payload.clone(), inbox.clone()).await;
        }

        let mut deadline = timeout;
        let result = loop {
            match tokio::time::timeout(deadline, rx.recv()).await {
                Ok(Some(bytes)) => {
                    if let Some(extend_by) = broker_core::envelope::parse_timeout_sentinel(&bytes) {
                        deadline = extend_by;
                        continue;
                    }
                    break Ok(bytes);
                }
                Ok(None) => break Err(BrokerError::ServiceUnavailable("reply channel closed".into())),
                Err(_) => break Err(BrokerError::Timeout(format!("no reply on {subject} within deadline"))),
            }
        };

        self.inboxes.remove(&inbox);
        result
    }

    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        for target in self.matching(subject) {
            self.deliver(target, payload.clone(), String::new()).await;
        }
        Ok(())
    }

    async fn reply_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if subject.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.inboxes.get(subject) {
            if tx.send(payload).await.is_err() {
                warn!(subject, "reply dropped, inbox receiver gone");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.subscribers.clear();
        self.inboxes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn echo_handler(bus_clone_target: &str) -> RawHandler {
        let target = bus_clone_target.to_string();
        Arc::new(move |payload, reply_subject| {
            let target = target.clone();
            Box::pin(async move {
                let _ = (target, payload, reply_subject);
            })
        })
    }

    #[test]
    fn subject_matches_wildcards_single_segment() {
        assert!(subject_matches("profile.*.get", "profile.42.get"));
        assert!(!subject_matches("profile.*.get", "profile.42.43.get"));
        assert!(!subject_matches("profile.*.get", "profile.42.set"));
    }

    #[tokio::test]
    async fn request_reaches_single_queue_group_subscriber_once() {
        let bus = LocalBus::new(16, 16);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let hits = hits.clone();
            let handler: RawHandler = Arc::new(move |_payload, _reply| {
                let hits = hits.clone();
                Box::pin(async move {
                    hits.fetch_add(1, AtomicOrdering::SeqCst);
                })
            });
            bus.subscribe_raw("svc.get".into(), "svc-workers".into(), handler)
                .await
                .unwrap();
        }

        bus.publish_raw("svc.get", b"hi".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_round_trips_through_reply_raw() {
        let bus = Arc::new(LocalBus::new(16, 16));
        let replier = bus.clone();
        let handler: RawHandler = Arc::new(move |_payload, reply_subject| {
            let replier = replier.clone();
            Box::pin(async move {
                replier.reply_raw(&reply_subject, b"pong".to_vec()).await.unwrap();
            })
        });
        bus.subscribe_raw("svc.ping".into(), "svc-workers".into(), handler)
            .await
            .unwrap();

        let reply = bus
            .request_raw("svc.ping", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn request_times_out_without_a_subscriber() {
        let bus = LocalBus::new(16, 16);
        let err = bus
            .request_raw("svc.nobody", b"hi".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn timeout_sentinel_extends_the_deadline() {
        let bus = Arc::new(LocalBus::new(16, 16));
        let replier = bus.clone();
        let handler: RawHandler = Arc::new(move |_payload, reply_subject| {
            let replier = replier.clone();
            Box::pin(async move {
                let sentinel = broker_core::envelope::timeout_sentinel(Duration::from_millis(200));
                replier.reply_raw(&reply_subject, sentinel).await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
                replier.reply_raw(&reply_subject, b"done".to_vec()).await.unwrap();
            })
        });
        bus.subscribe_raw("svc.slow".into(), "svc-workers".into(), handler)
            .await
            .unwrap();

        let reply = bus
            .request_raw("svc.slow", b"go".to_vec(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(reply, b"done");
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = LocalBus::new(16, 16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let handler: RawHandler = Arc::new(move |_payload, _reply| {
            let hits = hits_clone.clone();
            Box::pin(async move {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
            })
        });
        let unsubscribe = bus
            .subscribe_raw("svc.evt".into(), "svc-workers".into(), handler)
            .await
            .unwrap();

        unsubscribe().await;
        bus.publish_raw("svc.evt", b"x".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_capacity_is_enforced() {
        let bus = LocalBus::new(16, 1);
        bus.subscribe_raw("a".into(), "g".into(), echo_handler("a"))
            .await
            .unwrap();
        let err = bus
            .subscribe_raw("b".into(), "g".into(), echo_handler("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ServiceUnavailable(_)));
    }
}
