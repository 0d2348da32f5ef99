/// Board controller: owns the open board's store, reconciler and drag
/// session, and wires them to a `CardBackend`.
///
/// Everything runs on the caller's task. Writes are pushed into a
/// `FuturesUnordered` and only make progress while `pump` (or `settle`,
/// `process_ready`) is being awaited, where they interleave with the push
/// subscription. Every write is tagged with the session that issued it;
/// completions for a closed session are dropped.
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::broadcast;

use crate::backend::{CardBackend, ChangeStream, TransportError};
use crate::config::SyncSettings;
use crate::drag::{DragError, DragPhase, DragSession, DropOutcome, DropTarget};
use crate::order;
use crate::reconcile::{
    ChangeReconciler, Intent, ReconcileError, Reconciled, WriteId, WriteOp, WriteResult,
};
use crate::store::CardStore;
use crate::types::{BoardEvent, Card, ChangeEvent, Column};

const EVENT_CAPACITY: usize = 256;

/// One open/close lifetime of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("No board is open")]
    NotOpen,

    #[error("Card content is empty")]
    EmptyContent,

    #[error("A drag is in progress")]
    DragInProgress,

    #[error("Failed to open board {board_id}: {source}")]
    Open {
        board_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to reload board {board_id}: {source}")]
    Resync {
        board_id: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Drag(#[from] DragError),
}

/// What one `pump` step processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Remote(Reconciled),
    Write { write_id: WriteId, outcome: Reconciled },
    Resynced { changed: usize },
    ResyncFailed(String),
    /// A completion for a session that is no longer open.
    Discarded,
}

struct WriteCompletion {
    session: SessionId,
    write_id: WriteId,
    result: WriteResult,
}

enum Input {
    Remote(Option<Result<ChangeEvent, TransportError>>),
    Write(WriteCompletion),
}

struct ActiveBoard {
    session: SessionId,
    board_id: String,
    store: CardStore,
    reconciler: ChangeReconciler,
    drag: DragSession,
    subscription: Option<ChangeStream>,
}

pub struct BoardController {
    backend: Arc<dyn CardBackend>,
    user_id: String,
    settings: SyncSettings,
    next_session: u64,
    active: Option<ActiveBoard>,
    in_flight: FuturesUnordered<BoxFuture<'static, WriteCompletion>>,
    events: broadcast::Sender<BoardEvent>,
}

impl BoardController {
    pub fn new(
        backend: Arc<dyn CardBackend>,
        user_id: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            user_id: user_id.into(),
            settings,
            next_session: 0,
            active: None,
            in_flight: FuturesUnordered::new(),
            events,
        }
    }

    /// Notifications for the presentation layer.
    pub fn events(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    /// Load `board_id` and start following its changes.
    ///
    /// The subscription is opened before the load so nothing committed in
    /// between is missed; events buffered meanwhile are reconciled right after
    /// the snapshot is installed. If the feed reports a gap meanwhile the
    /// snapshot is fetched once more. Dropping this future before it resolves
    /// leaves no board open.
    pub async fn open(&mut self, board_id: &str) -> Result<(), BoardError> {
        self.close();
        self.next_session += 1;
        let session = SessionId(self.next_session);
        log::info!(
            target: "boardsync.controller",
            "Opening board {} ({:?})",
            board_id,
            session
        );

        let open_err = |source| BoardError::Open {
            board_id: board_id.to_string(),
            source,
        };
        let mut subscription = self.backend.subscribe(board_id).await.map_err(open_err)?;
        let cards = self.backend.load_cards(board_id).await.map_err(open_err)?;

        let mut store = CardStore::new();
        let mut reconciler = ChangeReconciler::new();
        let loaded = cards.len();
        reconciler.load(&mut store, cards);

        let mut buffered = 0;
        let mut gap = None;
        while let Some(Some(item)) = subscription.next().now_or_never() {
            match item {
                Ok(event) => {
                    reconciler.apply_remote(&mut store, event);
                    buffered += 1;
                }
                Err(e) => gap = Some(e),
            }
        }
        if let Some(e) = gap {
            // The snapshot may predate the dropped events.
            log::warn!(
                target: "boardsync.controller",
                "Subscription gap while loading board {}, reloading: {}",
                board_id,
                e
            );
            let cards = self.backend.load_cards(board_id).await.map_err(open_err)?;
            reconciler.resync(&mut store, cards);
        }
        log::info!(
            target: "boardsync.controller",
            "Loaded {} cards for board {} ({} buffered events)",
            loaded,
            board_id,
            buffered
        );

        store.take_dirty();
        let revision = store.revision();
        self.active = Some(ActiveBoard {
            session,
            board_id: board_id.to_string(),
            store,
            reconciler,
            drag: DragSession::new(),
            subscription: Some(subscription),
        });
        let _ = self.events.send(BoardEvent::Changed {
            board_id: board_id.to_string(),
            revision,
        });
        Ok(())
    }

    /// Drop the subscription and discard the store. Safe to call repeatedly.
    ///
    /// Writes already issued keep running; their results are ignored.
    pub fn close(&mut self) {
        if let Some(board) = self.active.take() {
            log::info!(
                target: "boardsync.controller",
                "Closed board {} ({:?}, {} writes in flight)",
                board.board_id,
                board.session,
                self.in_flight.len()
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn board_id(&self) -> Option<&str> {
        self.active.as_ref().map(|b| b.board_id.as_str())
    }

    pub fn session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|b| b.session)
    }

    /// Ordered cards of `column` as they should be drawn.
    /// While a drag is in progress this is the gesture's frozen view.
    pub fn column_view(&self, column: Column) -> Vec<Card> {
        match &self.active {
            Some(board) => board
                .drag
                .view(column)
                .unwrap_or_else(|| board.store.by_column(column)),
            None => Vec::new(),
        }
    }

    /// Current image of a card in the store (ignores any drag freeze).
    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.active.as_ref()?.store.get(card_id).cloned()
    }

    pub fn drag_phase(&self) -> Option<&DragPhase> {
        self.active.as_ref().map(|b| b.drag.phase())
    }

    /// Writes issued and not yet completed, across sessions.
    pub fn writes_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // ── Local actions ────────────────────────────────────────────────────────

    /// Append a new card to `column`. Returns its id.
    pub fn create_card(&mut self, column: Column, content: &str) -> Result<String, BoardError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(BoardError::EmptyContent);
        }
        let board = self.active.as_ref().ok_or(BoardError::NotOpen)?;
        let position = order::append_position(&board.store.by_column(column));
        let card = Card::new_local(&board.board_id, column, content, position, &self.user_id);
        let card_id = card.id.clone();
        self.submit(Intent::Create(card))?;
        Ok(card_id)
    }

    pub fn edit_card(&mut self, card_id: &str, content: &str) -> Result<WriteId, BoardError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(BoardError::EmptyContent);
        }
        self.submit(Intent::Edit {
            card_id: card_id.to_string(),
            content: content.to_string(),
        })
    }

    pub fn delete_card(&mut self, card_id: &str) -> Result<WriteId, BoardError> {
        self.submit(Intent::Delete {
            card_id: card_id.to_string(),
        })
    }

    /// Move a card without a gesture. Same rules as a drag dropped on `target`.
    pub fn move_card(
        &mut self,
        card_id: &str,
        target: DropTarget,
    ) -> Result<Option<WriteId>, BoardError> {
        self.begin_drag(card_id)?;
        self.end_drag(Some(target))
    }

    pub fn begin_drag(&mut self, card_id: &str) -> Result<(), BoardError> {
        let board = self.active.as_mut().ok_or(BoardError::NotOpen)?;
        board.drag.begin(&board.store, card_id)?;
        Ok(())
    }

    pub fn drag_over(&mut self, target: Option<DropTarget>) -> Result<(), BoardError> {
        let board = self.active.as_mut().ok_or(BoardError::NotOpen)?;
        board.drag.hover(target)?;
        let _ = self.events.send(BoardEvent::Changed {
            board_id: board.board_id.clone(),
            revision: board.store.revision(),
        });
        Ok(())
    }

    /// Finish the gesture. `None` means dropped outside every column.
    /// Returns the write issued for the move, if any.
    pub fn end_drag(&mut self, target: Option<DropTarget>) -> Result<Option<WriteId>, BoardError> {
        let board = self.active.as_mut().ok_or(BoardError::NotOpen)?;
        let outcome = board.drag.drop_on(&board.store, target)?;

        let write = match outcome {
            DropOutcome::Unchanged => None,
            DropOutcome::Commit(intent) => {
                let submitted = self.submit(intent);
                if let Some(board) = self.active.as_mut() {
                    board.drag.finish();
                }
                if let Some(target) = target {
                    self.check_gaps(target.column);
                }
                Some(submitted?)
            }
        };

        // Back to Idle: redraw from the store, including anything that
        // arrived during the gesture.
        if let Some(board) = self.active.as_mut() {
            board.store.take_dirty();
            let _ = self.events.send(BoardEvent::Changed {
                board_id: board.board_id.clone(),
                revision: board.store.revision(),
            });
        }
        Ok(write)
    }

    /// Reassign integer-spaced positions to `column`'s current order.
    /// A maintenance operation; refused while a drag is in progress.
    pub fn renumber_column(&mut self, column: Column) -> Result<Vec<WriteId>, BoardError> {
        let board = self.active.as_ref().ok_or(BoardError::NotOpen)?;
        if !board.drag.is_idle() {
            return Err(BoardError::DragInProgress);
        }
        let changes = order::renumber(&board.store.by_column(column));
        log::info!(
            target: "boardsync.order",
            "Renumbering column {} of board {}: {} cards change position",
            column,
            board.board_id,
            changes.len()
        );
        changes
            .into_iter()
            .map(|(card_id, order_index)| {
                self.submit(Intent::Move {
                    card_id,
                    column,
                    order_index,
                })
            })
            .collect()
    }

    // ── Driving ──────────────────────────────────────────────────────────────

    /// Wait for the next remote event or write completion and process it.
    /// Returns `None` when there is nothing left to wait for.
    pub async fn pump(&mut self) -> Option<Activity> {
        let input = {
            let subscription = self.active.as_mut().and_then(|b| b.subscription.as_mut());
            match subscription {
                Some(stream) if !self.in_flight.is_empty() => tokio::select! {
                    item = stream.next() => Input::Remote(item),
                    Some(done) = self.in_flight.next() => Input::Write(done),
                },
                Some(stream) => Input::Remote(stream.next().await),
                None => Input::Write(self.in_flight.next().await?),
            }
        };
        Some(self.process(input).await)
    }

    /// Process every input that is ready right now, without waiting.
    pub fn process_ready(&mut self) -> usize {
        let mut processed = 0;
        while let Some(Some(_)) = self.pump().now_or_never() {
            processed += 1;
        }
        processed
    }

    /// Pump until every issued write has completed, then drain ready events.
    pub async fn settle(&mut self) {
        while !self.in_flight.is_empty() {
            if self.pump().await.is_none() {
                break;
            }
        }
        self.process_ready();
    }

    /// Reload the board and reconcile it against the store, re-subscribing
    /// first. Used after a subscription gap. Returns the number of changed cards.
    pub async fn resync(&mut self) -> Result<usize, BoardError> {
        let (board_id, session) = match &self.active {
            Some(board) => (board.board_id.clone(), board.session),
            None => return Err(BoardError::NotOpen),
        };
        log::info!(target: "boardsync.controller", "Resyncing board {}", board_id);

        let fetched = async {
            let stream = self.backend.subscribe(&board_id).await?;
            let cards = self.backend.load_cards(&board_id).await?;
            Ok::<_, TransportError>((stream, cards))
        }
        .await;

        let Some(board) = self.active.as_mut().filter(|b| b.session == session) else {
            return Err(BoardError::NotOpen);
        };
        match fetched {
            Ok((stream, cards)) => {
                board.subscription = Some(stream);
                let changed = board.reconciler.resync(&mut board.store, cards);
                let _ = self.events.send(BoardEvent::Resynced {
                    board_id: board_id.clone(),
                });
                self.notify();
                Ok(changed)
            }
            Err(source) => {
                // Without a working feed the board is static until the next resync.
                board.subscription = None;
                let _ = self.events.send(BoardEvent::Notice {
                    board_id: board_id.clone(),
                    message: format!("Live updates unavailable: {}", source),
                });
                Err(BoardError::Resync { board_id, source })
            }
        }
    }

    fn submit(&mut self, intent: Intent) -> Result<WriteId, BoardError> {
        let board = self.active.as_mut().ok_or(BoardError::NotOpen)?;
        let request = board.reconciler.apply_local(&mut board.store, intent)?;
        let session = board.session;
        let write_id = request.id;

        let call = issue(self.backend.as_ref(), request.op, self.settings.write_timeout());
        self.in_flight.push(Box::pin(call.map(move |result| WriteCompletion {
            session,
            write_id,
            result,
        })));
        self.notify();
        Ok(write_id)
    }

    async fn process(&mut self, input: Input) -> Activity {
        match input {
            Input::Remote(Some(Ok(event))) => {
                let Some(board) = self.active.as_mut() else {
                    return Activity::Discarded;
                };
                let outcome = board.reconciler.apply_remote(&mut board.store, event);
                self.notify();
                Activity::Remote(outcome)
            }
            Input::Remote(Some(Err(e))) => {
                log::warn!(target: "boardsync.controller", "Subscription gap: {}", e);
                self.resync_activity().await
            }
            Input::Remote(None) => {
                log::info!(target: "boardsync.controller", "Subscription ended, reconnecting");
                self.resync_activity().await
            }
            Input::Write(done) => self.complete_write(done),
        }
    }

    async fn resync_activity(&mut self) -> Activity {
        match self.resync().await {
            Ok(changed) => Activity::Resynced { changed },
            Err(BoardError::NotOpen) => Activity::Discarded,
            Err(e) => {
                log::error!(target: "boardsync.controller", "{}", e);
                Activity::ResyncFailed(e.to_string())
            }
        }
    }

    fn complete_write(&mut self, done: WriteCompletion) -> Activity {
        let Some(board) = self.active.as_mut().filter(|b| b.session == done.session) else {
            log::debug!(
                target: "boardsync.controller",
                "Dropping completion of write {:?} from closed {:?}",
                done.write_id,
                done.session
            );
            return Activity::Discarded;
        };

        let failure = done.result.as_ref().err().map(ToString::to_string);
        let outcome = board
            .reconciler
            .complete(&mut board.store, done.write_id, done.result);
        if let (Reconciled::Reverted, Some(reason)) = (outcome, failure) {
            let _ = self.events.send(BoardEvent::Notice {
                board_id: board.board_id.clone(),
                message: format!("Change could not be saved: {}", reason),
            });
        }
        self.notify();
        Activity::Write {
            write_id: done.write_id,
            outcome,
        }
    }

    /// Emit `Changed` if the store was mutated. Held back while dragging;
    /// `end_drag` redraws once the gesture is over.
    fn notify(&mut self) {
        let Some(board) = self.active.as_mut() else {
            return;
        };
        if !board.drag.is_idle() {
            return;
        }
        if board.store.take_dirty() {
            let _ = self.events.send(BoardEvent::Changed {
                board_id: board.board_id.clone(),
                revision: board.store.revision(),
            });
        }
    }

    fn check_gaps(&self, column: Column) {
        let Some(board) = &self.active else {
            return;
        };
        if order::needs_renumber(&board.store.by_column(column), self.settings.min_position_gap) {
            log::warn!(
                target: "boardsync.order",
                "Column {} of board {} has run out of room between positions, renumber it",
                column,
                board.board_id
            );
        }
    }
}

/// Start the backend call for a write, bounded by `timeout`.
fn issue(
    backend: &dyn CardBackend,
    op: WriteOp,
    timeout: Duration,
) -> BoxFuture<'static, WriteResult> {
    let call: BoxFuture<'static, WriteResult> = match op {
        WriteOp::Insert(card) => backend.insert_card(card).map(|r| r.map(Some)).boxed(),
        WriteOp::UpdatePosition {
            card_id,
            column,
            order_index,
        } => backend.update_position(&card_id, column, order_index),
        WriteOp::UpdateContent { card_id, content } => backend.update_content(&card_id, &content),
        WriteOp::Delete { card_id } => backend
            .delete_card(&card_id)
            .map(|r| r.map(|_| None))
            .boxed(),
    };
    Box::pin(async move {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    })
}
