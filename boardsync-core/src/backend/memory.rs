/// In-process card backend.
///
/// Behaves like the remote table plus its change feed:
/// - server timestamps come from a strictly increasing clock
/// - every committed write is broadcast to all subscribers, including the writer
/// - failures and stalls can be injected for the next N writes
///
/// Used by the tests and by the CLI's `--memory` demo mode.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::{self, BoxFuture};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{CardBackend, ChangeStream, TransportError};
use crate::store::sort_by_position;
use crate::types::{Card, ChangeEvent, Column};

const FEED_CAPACITY: usize = 1024;

struct Inner {
    /// card id -> row
    rows: Mutex<HashMap<String, Card>>,
    /// (board id, event)
    feed: broadcast::Sender<(String, ChangeEvent)>,
    last_timestamp: Mutex<DateTime<Utc>>,
    failures: AtomicUsize,
    stalls: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

enum Injected {
    Fail,
    Stall,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(HashMap::new()),
                feed,
                last_timestamp: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
                failures: AtomicUsize::new(0),
                stalls: AtomicUsize::new(0),
            }),
        }
    }

    /// Store rows directly, without broadcasting.
    pub fn seed(&self, cards: Vec<Card>) {
        let mut rows = self.inner.rows.lock().unwrap();
        for card in cards {
            rows.insert(card.id.clone(), card);
        }
    }

    /// Current rows of a board, ascending by position.
    pub fn snapshot(&self, board_id: &str) -> Vec<Card> {
        self.inner.snapshot(board_id)
    }

    pub fn row(&self, card_id: &str) -> Option<Card> {
        self.inner.rows.lock().unwrap().get(card_id).cloned()
    }

    /// Publish an event as-is, e.g. to simulate redelivery.
    pub fn publish(&self, board_id: &str, event: ChangeEvent) {
        let _ = self.inner.feed.send((board_id.to_string(), event));
    }

    /// Reject the next `n` writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }

    /// Never answer the next `n` writes (they are not applied either).
    pub fn stall_next_writes(&self, n: usize) {
        self.inner.stalls.store(n, Ordering::SeqCst);
    }

    /// Update a row as another client would, broadcasting the change.
    pub fn remote_move(&self, card_id: &str, column: Column, order_index: f64) -> Option<Card> {
        self.inner.update(card_id, |card| {
            card.column_type = column;
            card.order_index = order_index;
        })
    }

    pub fn remote_edit(&self, card_id: &str, content: &str) -> Option<Card> {
        self.inner
            .update(card_id, |card| card.content = content.to_string())
    }

    pub fn remote_delete(&self, card_id: &str) -> bool {
        self.inner.delete(card_id)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap();
        let now = Utc::now();
        let ts = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = ts;
        ts
    }

    fn take_injected(&self) -> Option<Injected> {
        let take = |counter: &AtomicUsize| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        if take(&self.failures) {
            Some(Injected::Fail)
        } else if take(&self.stalls) {
            Some(Injected::Stall)
        } else {
            None
        }
    }

    fn snapshot(&self, board_id: &str) -> Vec<Card> {
        let mut cards: Vec<Card> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.project_id == board_id)
            .cloned()
            .collect();
        sort_by_position(&mut cards);
        cards
    }

    fn insert(&self, mut card: Card) -> Result<Card, TransportError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&card.id) {
            return Err(TransportError::Rejected {
                status: 409,
                message: format!("duplicate key value: {}", card.id),
            });
        }
        let ts = self.next_timestamp();
        card.created_at = ts;
        card.updated_at = ts;
        rows.insert(card.id.clone(), card.clone());
        drop(rows);
        let _ = self
            .feed
            .send((card.project_id.clone(), ChangeEvent::Insert(card.clone())));
        Ok(card)
    }

    fn update(&self, card_id: &str, apply: impl FnOnce(&mut Card)) -> Option<Card> {
        let mut rows = self.rows.lock().unwrap();
        let card = rows.get_mut(card_id)?;
        apply(card);
        card.updated_at = self.next_timestamp();
        let updated = card.clone();
        drop(rows);
        let _ = self
            .feed
            .send((updated.project_id.clone(), ChangeEvent::Update(updated.clone())));
        Some(updated)
    }

    fn delete(&self, card_id: &str) -> bool {
        let removed = self.rows.lock().unwrap().remove(card_id);
        match removed {
            Some(card) => {
                let _ = self.feed.send((
                    card.project_id,
                    ChangeEvent::Delete {
                        id: card_id.to_string(),
                    },
                ));
                true
            }
            None => false,
        }
    }
}

/// Run `write` unless a failure or stall was injected.
fn guarded<T: Send + 'static>(
    inner: Arc<Inner>,
    write: impl FnOnce(&Inner) -> Result<T, TransportError> + Send + 'static,
) -> BoxFuture<'static, Result<T, TransportError>> {
    Box::pin(async move {
        match inner.take_injected() {
            Some(Injected::Fail) => Err(TransportError::Rejected {
                status: 503,
                message: "injected failure".to_string(),
            }),
            Some(Injected::Stall) => future::pending().await,
            None => write(&inner),
        }
    })
}

impl CardBackend for MemoryBackend {
    fn load_cards(&self, board_id: &str) -> BoxFuture<'static, Result<Vec<Card>, TransportError>> {
        let inner = self.inner.clone();
        let board_id = board_id.to_string();
        Box::pin(async move { Ok(inner.snapshot(&board_id)) })
    }

    fn insert_card(&self, card: Card) -> BoxFuture<'static, Result<Card, TransportError>> {
        guarded(self.inner.clone(), move |inner| inner.insert(card))
    }

    fn update_position(
        &self,
        card_id: &str,
        column: Column,
        order_index: f64,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>> {
        let card_id = card_id.to_string();
        guarded(self.inner.clone(), move |inner| {
            Ok(inner.update(&card_id, |card| {
                card.column_type = column;
                card.order_index = order_index;
            }))
        })
    }

    fn update_content(
        &self,
        card_id: &str,
        content: &str,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>> {
        let card_id = card_id.to_string();
        let content = content.to_string();
        guarded(self.inner.clone(), move |inner| {
            Ok(inner.update(&card_id, |card| card.content = content))
        })
    }

    fn delete_card(&self, card_id: &str) -> BoxFuture<'static, Result<(), TransportError>> {
        let card_id = card_id.to_string();
        guarded(self.inner.clone(), move |inner| {
            inner.delete(&card_id);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        board_id: &str,
    ) -> BoxFuture<'static, Result<ChangeStream, TransportError>> {
        // Subscribe now so nothing published after this call is missed.
        let rx = self.inner.feed.subscribe();
        let board_id = board_id.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok((board, event)) if board == board_id => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(TransportError::Lagged(n))),
            };
            future::ready(out)
        });
        let stream: ChangeStream = Box::pin(stream);
        Box::pin(future::ready(Ok(stream)))
    }
}
