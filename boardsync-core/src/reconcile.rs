/// Merges local optimistic intents, remote change events and write
/// confirmations into the card store.
///
/// Rule per row: last writer wins on the server-assigned `updated_at`.
///
/// - The last server-confirmed image of every card is kept apart from the
///   store. Optimistic images carry a local-clock timestamp that never takes
///   part in a comparison, so any confirmed image newer than the last confirmed
///   one replaces a pending optimistic edit.
/// - Inserts/updates not newer than the confirmed image are stale duplicates.
/// - Deletes win over everything. Ids are never reused, so deleted ids are
///   remembered and later events for them are ignored.
/// - A failed write restores the confirmed image, or removes the card when it
///   was never confirmed. An update that matched no row is undone the same
///   way unless the card's insert is still in flight; the card only goes away
///   with a Delete event or a reload that no longer contains it.
use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::backend::TransportError;
use crate::store::CardStore;
use crate::types::{Card, ChangeEvent, Column};

/// Identifies one durable write issued for a local intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(pub u64);

/// A change the local user just made.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Create(Card),
    Move {
        card_id: String,
        column: Column,
        order_index: f64,
    },
    Edit {
        card_id: String,
        content: String,
    },
    Delete {
        card_id: String,
    },
}

impl Intent {
    pub fn card_id(&self) -> &str {
        match self {
            Intent::Create(card) => &card.id,
            Intent::Move { card_id, .. }
            | Intent::Edit { card_id, .. }
            | Intent::Delete { card_id } => card_id,
        }
    }
}

/// The durable call backing an intent.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Card),
    UpdatePosition {
        card_id: String,
        column: Column,
        order_index: f64,
    },
    UpdateContent {
        card_id: String,
        content: String,
    },
    Delete {
        card_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub id: WriteId,
    pub op: WriteOp,
}

/// What the server said about a write.
/// `Ok(Some(row))` carries the stored row, `Ok(None)` means nothing to merge
/// (a delete, or an update that matched no row).
pub type WriteResult = Result<Option<Card>, TransportError>;

/// How an input was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A newer image was stored.
    Applied,
    /// The card was removed.
    Removed,
    /// Older or equal to what is held; discarded.
    Stale,
    /// Refers to a deleted card; discarded.
    Ignored,
    /// A write was confirmed.
    Confirmed,
    /// A write failed or matched no row; its optimistic change was undone.
    Reverted,
    /// A completion for a write this reconciler never issued.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Create,
    Move,
    Edit,
    Delete,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    card_id: String,
    kind: WriteKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Card already exists: {0}")]
    DuplicateCard(String),
}

#[derive(Debug, Default)]
pub struct ChangeReconciler {
    /// card id -> last server-confirmed image
    confirmed: HashMap<String, Card>,
    deleted: HashSet<String>,
    pending: HashMap<WriteId, PendingWrite>,
    next_write: u64,
}

impl ChangeReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the initial snapshot of a board. Replaces everything held.
    pub fn load(&mut self, store: &mut CardStore, cards: Vec<Card>) {
        store.clear();
        self.confirmed.clear();
        self.deleted.clear();
        self.pending.clear();
        for card in cards {
            self.confirmed.insert(card.id.clone(), card.clone());
            store.upsert(card);
        }
    }

    /// Apply a local intent optimistically and describe the write to issue.
    pub fn apply_local(
        &mut self,
        store: &mut CardStore,
        intent: Intent,
    ) -> Result<WriteRequest, ReconcileError> {
        let card_id = intent.card_id().to_string();
        let (kind, op) = match intent {
            Intent::Create(card) => {
                if store.contains(&card.id) || self.deleted.contains(&card.id) {
                    return Err(ReconcileError::DuplicateCard(card.id));
                }
                store.upsert(card.clone());
                (WriteKind::Create, WriteOp::Insert(card))
            }
            Intent::Move {
                card_id,
                column,
                order_index,
            } => {
                let mut card = self.optimistic_copy(store, &card_id)?;
                card.column_type = column;
                card.order_index = order_index;
                store.upsert(card);
                (
                    WriteKind::Move,
                    WriteOp::UpdatePosition {
                        card_id,
                        column,
                        order_index,
                    },
                )
            }
            Intent::Edit { card_id, content } => {
                let mut card = self.optimistic_copy(store, &card_id)?;
                card.content = content.clone();
                store.upsert(card);
                (WriteKind::Edit, WriteOp::UpdateContent { card_id, content })
            }
            Intent::Delete { card_id } => {
                if store.remove(&card_id).is_none() {
                    return Err(ReconcileError::CardNotFound(card_id));
                }
                (WriteKind::Delete, WriteOp::Delete { card_id })
            }
        };

        self.next_write += 1;
        let id = WriteId(self.next_write);
        log::debug!(
            target: "boardsync.reconcile",
            "Issued write {:?} ({:?}) for card {}",
            id,
            kind,
            card_id
        );
        self.pending.insert(id, PendingWrite { card_id, kind });
        Ok(WriteRequest { id, op })
    }

    /// Apply a change event from the push channel (another client's change or our echo).
    pub fn apply_remote(&mut self, store: &mut CardStore, event: ChangeEvent) -> Reconciled {
        match event {
            ChangeEvent::Insert(card) | ChangeEvent::Update(card) => self.merge_row(store, card),
            ChangeEvent::Delete { id } => {
                if !self.deleted.insert(id.clone()) {
                    return Reconciled::Stale;
                }
                self.confirmed.remove(&id);
                store.remove(&id);
                log::debug!(target: "boardsync.reconcile", "Card {} deleted remotely", id);
                Reconciled::Removed
            }
        }
    }

    /// Handle the outcome of a write issued by `apply_local`.
    pub fn complete(
        &mut self,
        store: &mut CardStore,
        write_id: WriteId,
        result: WriteResult,
    ) -> Reconciled {
        let Some(PendingWrite { card_id, kind }) = self.pending.remove(&write_id) else {
            return Reconciled::Unknown;
        };
        if self.deleted.contains(&card_id) {
            log::debug!(
                target: "boardsync.reconcile",
                "Write {:?} completed for deleted card {}, ignoring",
                write_id,
                card_id
            );
            return Reconciled::Ignored;
        }

        match result {
            Ok(Some(row)) => {
                self.merge_row(store, row);
                Reconciled::Confirmed
            }
            Ok(None) if kind == WriteKind::Delete => {
                self.deleted.insert(card_id.clone());
                self.confirmed.remove(&card_id);
                store.remove(&card_id);
                Reconciled::Confirmed
            }
            Ok(None) => {
                // No row matched. Only a Delete event tombstones the card.
                if self.has_pending_create(&card_id) {
                    log::info!(
                        target: "boardsync.reconcile",
                        "Card {} not stored yet, {:?} write {:?} dropped",
                        card_id,
                        kind,
                        write_id
                    );
                } else {
                    log::info!(
                        target: "boardsync.reconcile",
                        "Card {} not found on the server, reverting {:?} write {:?}",
                        card_id,
                        kind,
                        write_id
                    );
                    self.revert(store, &card_id);
                }
                Reconciled::Reverted
            }
            Err(e) => {
                log::warn!(
                    target: "boardsync.reconcile",
                    "Write {:?} ({:?}) for card {} failed, reverting: {}",
                    write_id,
                    kind,
                    card_id,
                    e
                );
                self.revert(store, &card_id);
                Reconciled::Reverted
            }
        }
    }

    /// Reconcile a full reload of the board (after a subscription gap).
    ///
    /// Newer rows are applied, confirmed cards missing from the snapshot are
    /// removed, cards whose create is still in flight are kept.
    /// Returns the number of cards that changed.
    pub fn resync(&mut self, store: &mut CardStore, snapshot: Vec<Card>) -> usize {
        let present: HashSet<String> = snapshot.iter().map(|c| c.id.clone()).collect();
        let mut changed = 0;
        for card in snapshot {
            if self.merge_row(store, card) == Reconciled::Applied {
                changed += 1;
            }
        }

        let vanished: Vec<String> = self
            .confirmed
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            self.apply_remote(store, ChangeEvent::Delete { id });
            changed += 1;
        }
        changed
    }

    pub fn has_pending(&self, card_id: &str) -> bool {
        self.pending.values().any(|p| p.card_id == card_id)
    }

    fn has_pending_create(&self, card_id: &str) -> bool {
        self.pending
            .values()
            .any(|p| p.card_id == card_id && p.kind == WriteKind::Create)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn confirmed(&self, card_id: &str) -> Option<&Card> {
        self.confirmed.get(card_id)
    }

    pub fn is_deleted(&self, card_id: &str) -> bool {
        self.deleted.contains(card_id)
    }

    fn merge_row(&mut self, store: &mut CardStore, card: Card) -> Reconciled {
        if self.deleted.contains(&card.id) {
            return Reconciled::Ignored;
        }
        if let Some(held) = self.confirmed.get(&card.id) {
            if card.updated_at <= held.updated_at {
                log::debug!(
                    target: "boardsync.reconcile",
                    "Discarding stale image of card {} ({} <= {})",
                    card.id,
                    card.updated_at,
                    held.updated_at
                );
                return Reconciled::Stale;
            }
        }
        self.confirmed.insert(card.id.clone(), card.clone());
        store.upsert(card);
        Reconciled::Applied
    }

    fn optimistic_copy(&self, store: &CardStore, card_id: &str) -> Result<Card, ReconcileError> {
        let mut card = store
            .get(card_id)
            .cloned()
            .ok_or_else(|| ReconcileError::CardNotFound(card_id.to_string()))?;
        card.updated_at = Utc::now();
        Ok(card)
    }

    fn revert(&mut self, store: &mut CardStore, card_id: &str) {
        match self.confirmed.get(card_id) {
            Some(card) => store.upsert(card.clone()),
            None => {
                store.remove(card_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn make_card(id: &str, column: Column, order_index: f64, updated: i64) -> Card {
        Card {
            id: id.to_string(),
            project_id: "p1".to_string(),
            column_type: column,
            content: format!("card {}", id),
            order_index,
            created_by: "u1".to_string(),
            created_at: at(0),
            updated_at: at(updated),
        }
    }

    fn loaded(cards: Vec<Card>) -> (ChangeReconciler, CardStore) {
        let mut reconciler = ChangeReconciler::new();
        let mut store = CardStore::new();
        reconciler.load(&mut store, cards);
        (reconciler, store)
    }

    #[test]
    fn test_remote_insert_and_redelivery_is_idempotent() {
        let (mut r, mut store) = loaded(vec![]);
        let event = ChangeEvent::Insert(make_card("a", Column::Todo, 1.0, 1));

        assert_eq!(r.apply_remote(&mut store, event.clone()), Reconciled::Applied);
        let once = store.by_column(Column::Todo);
        assert_eq!(r.apply_remote(&mut store, event), Reconciled::Stale);
        assert_eq!(store.by_column(Column::Todo), once);
    }

    #[test]
    fn test_later_timestamp_wins_regardless_of_arrival_order() {
        let older = ChangeEvent::Update(make_card("a", Column::Todo, 1.0, 5));
        let newer = ChangeEvent::Update(make_card("a", Column::Done, 2.0, 9));

        for events in [
            vec![older.clone(), newer.clone()],
            vec![newer.clone(), older.clone()],
        ] {
            let (mut r, mut store) = loaded(vec![make_card("a", Column::Todo, 0.0, 1)]);
            for event in events {
                r.apply_remote(&mut store, event);
            }
            let card = store.get("a").unwrap();
            assert_eq!(card.column_type, Column::Done);
            assert_eq!(card.updated_at, at(9));
        }
    }

    #[test]
    fn test_confirmed_remote_supersedes_pending_optimistic() {
        let (mut r, mut store) = loaded(vec![make_card("a", Column::Todo, 0.0, 1)]);
        r.apply_local(
            &mut store,
            Intent::Move {
                card_id: "a".into(),
                column: Column::Done,
                order_index: 3.0,
            },
        )
        .unwrap();
        assert_eq!(store.get("a").unwrap().column_type, Column::Done);

        // Another client's edit, confirmed by the server. The optimistic image
        // has a local-clock timestamp far newer than this, but it still loses.
        let remote = make_card("a", Column::InProgress, 7.0, 2);
        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Update(remote)),
            Reconciled::Applied
        );
        assert_eq!(store.get("a").unwrap().column_type, Column::InProgress);
    }

    #[test]
    fn test_echo_confirms_optimistic_move() {
        let (mut r, mut store) = loaded(vec![make_card("a", Column::Todo, 0.0, 1)]);
        let write = r
            .apply_local(
                &mut store,
                Intent::Move {
                    card_id: "a".into(),
                    column: Column::Done,
                    order_index: 3.0,
                },
            )
            .unwrap();
        assert!(r.has_pending("a"));

        let echo = make_card("a", Column::Done, 3.0, 2);
        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Update(echo.clone())),
            Reconciled::Applied
        );
        // Confirmation carrying the same row is then a no-op merge.
        assert_eq!(
            r.complete(&mut store, write.id, Ok(Some(echo.clone()))),
            Reconciled::Confirmed
        );
        assert!(!r.has_pending("a"));
        assert_eq!(store.get("a"), Some(&echo));
        assert_eq!(r.confirmed("a"), Some(&echo));
    }

    #[test]
    fn test_failed_create_removes_card() {
        let (mut r, mut store) = loaded(vec![]);
        let card = make_card("n", Column::Todo, 0.0, 1);
        let write = r.apply_local(&mut store, Intent::Create(card)).unwrap();
        assert!(store.contains("n"));

        let outcome = r.complete(&mut store, write.id, Err(TransportError::Timeout));
        assert_eq!(outcome, Reconciled::Reverted);
        assert!(!store.contains("n"));
    }

    #[test]
    fn test_failed_update_restores_previous_image() {
        let original = make_card("a", Column::Todo, 0.0, 1);
        let (mut r, mut store) = loaded(vec![original.clone()]);
        let write = r
            .apply_local(
                &mut store,
                Intent::Edit {
                    card_id: "a".into(),
                    content: "changed".into(),
                },
            )
            .unwrap();
        assert_eq!(store.get("a").unwrap().content, "changed");

        r.complete(
            &mut store,
            write.id,
            Err(TransportError::Network("connection reset".into())),
        );
        assert_eq!(store.get("a"), Some(&original));
    }

    #[test]
    fn test_failed_delete_restores_card() {
        let original = make_card("a", Column::Todo, 0.0, 1);
        let (mut r, mut store) = loaded(vec![original.clone()]);
        let write = r
            .apply_local(&mut store, Intent::Delete { card_id: "a".into() })
            .unwrap();
        assert!(!store.contains("a"));

        r.complete(
            &mut store,
            write.id,
            Err(TransportError::Rejected {
                status: 403,
                message: "forbidden".into(),
            }),
        );
        assert_eq!(store.get("a"), Some(&original));
    }

    #[test]
    fn test_remote_delete_while_edit_pending() {
        let (mut r, mut store) = loaded(vec![make_card("x", Column::Todo, 0.0, 1)]);
        let write = r
            .apply_local(
                &mut store,
                Intent::Edit {
                    card_id: "x".into(),
                    content: "edited".into(),
                },
            )
            .unwrap();

        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Delete { id: "x".into() }),
            Reconciled::Removed
        );
        assert!(!store.contains("x"));

        // Confirmation of the edit, success or failure, is a no-op.
        let late = make_card("x", Column::Todo, 0.0, 5);
        assert_eq!(
            r.complete(&mut store, write.id, Ok(Some(late))),
            Reconciled::Ignored
        );
        assert!(!store.contains("x"));
    }

    #[test]
    fn test_delete_is_idempotent_and_blocks_resurrection() {
        let card = make_card("a", Column::Todo, 0.0, 1);
        let (mut r, mut store) = loaded(vec![card.clone()]);
        let delete = ChangeEvent::Delete { id: "a".into() };

        assert_eq!(r.apply_remote(&mut store, delete.clone()), Reconciled::Removed);
        assert_eq!(r.apply_remote(&mut store, delete), Reconciled::Stale);
        // A redelivered insert arriving after the delete.
        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Insert(card)),
            Reconciled::Ignored
        );
        assert!(!store.contains("a"));
        assert!(r.is_deleted("a"));
    }

    #[test]
    fn test_update_matching_no_row_reverts_until_delete_arrives() {
        let original = make_card("a", Column::Todo, 0.0, 1);
        let (mut r, mut store) = loaded(vec![original.clone()]);
        let write = r
            .apply_local(
                &mut store,
                Intent::Move {
                    card_id: "a".into(),
                    column: Column::Done,
                    order_index: 0.0,
                },
            )
            .unwrap();
        assert_eq!(r.complete(&mut store, write.id, Ok(None)), Reconciled::Reverted);
        assert_eq!(store.get("a"), Some(&original));
        assert!(!r.is_deleted("a"));

        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Delete { id: "a".into() }),
            Reconciled::Removed
        );
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_move_overtaking_its_create_keeps_card() {
        let (mut r, mut store) = loaded(vec![]);
        let card = make_card("n", Column::Todo, 0.0, 1);
        let create = r.apply_local(&mut store, Intent::Create(card)).unwrap();
        let moved = r
            .apply_local(
                &mut store,
                Intent::Move {
                    card_id: "n".into(),
                    column: Column::Done,
                    order_index: 0.0,
                },
            )
            .unwrap();

        // The update reaches the server before the insert and matches nothing.
        assert_eq!(r.complete(&mut store, moved.id, Ok(None)), Reconciled::Reverted);
        assert!(store.contains("n"));
        assert!(!r.is_deleted("n"));

        let row = make_card("n", Column::Todo, 0.0, 2);
        assert_eq!(
            r.complete(&mut store, create.id, Ok(Some(row.clone()))),
            Reconciled::Confirmed
        );
        assert_eq!(store.get("n"), Some(&row));
        assert_eq!(
            r.apply_remote(&mut store, ChangeEvent::Insert(row.clone())),
            Reconciled::Stale
        );

        r.resync(&mut store, vec![row.clone()]);
        assert_eq!(store.get("n"), Some(&row));
    }

    #[test]
    fn test_unknown_write_completion() {
        let (mut r, mut store) = loaded(vec![]);
        assert_eq!(
            r.complete(&mut store, WriteId(42), Err(TransportError::Timeout)),
            Reconciled::Unknown
        );
    }

    #[test]
    fn test_intent_for_missing_card_is_rejected() {
        let (mut r, mut store) = loaded(vec![]);
        let err = r
            .apply_local(&mut store, Intent::Delete { card_id: "nope".into() })
            .unwrap_err();
        assert!(matches!(err, ReconcileError::CardNotFound(_)));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_resync_applies_newer_and_drops_vanished() {
        let (mut r, mut store) = loaded(vec![
            make_card("a", Column::Todo, 0.0, 1),
            make_card("b", Column::Todo, 1.0, 1),
        ]);
        let pending = make_card("new", Column::Todo, 2.0, 1);
        r.apply_local(&mut store, Intent::Create(pending)).unwrap();

        let changed = r.resync(&mut store, vec![make_card("a", Column::Done, 0.0, 4)]);
        assert_eq!(changed, 2);
        assert_eq!(store.get("a").unwrap().column_type, Column::Done);
        assert!(!store.contains("b"));
        // Never confirmed, create still in flight: kept.
        assert!(store.contains("new"));
    }
}
