/// State machine for one drag gesture.
///
/// Idle -> Dragging -> Committing -> Idle, or Idle -> Dragging -> Idle when the
/// card is dropped outside any column or back onto its origin slot.
///
/// While Dragging the visual order is frozen to the snapshot taken at `begin`
/// plus the gesture's own hover slot. The store keeps ingesting remote events;
/// the new position is computed against the store's current order at drop time.
use std::collections::HashMap;

use crate::order;
use crate::reconcile::Intent;
use crate::store::CardStore;
use crate::types::{Card, Column};

/// A slot in a column: the index the card occupies after the move, counted
/// with the moved card excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropTarget {
    pub column: Column,
    pub index: usize,
}

impl DropTarget {
    pub fn new(column: Column, index: usize) -> Self {
        Self { column, index }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveDrag {
    pub card_id: String,
    pub origin: DropTarget,
    pub hover: Option<DropTarget>,
    /// Column orders at gesture start, dragged card included.
    frozen: HashMap<Column, Vec<Card>>,
}

#[derive(Debug, Clone, Default)]
pub enum DragPhase {
    #[default]
    Idle,
    Dragging(ActiveDrag),
    Committing(ActiveDrag),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropOutcome {
    /// Nothing to write; the session is Idle again.
    Unchanged,
    /// Apply this move and issue its write, then call `finish`.
    Commit(Intent),
}

#[derive(Debug, thiserror::Error)]
pub enum DragError {
    #[error("A drag is already in progress for card {0}")]
    AlreadyDragging(String),

    #[error("No drag in progress")]
    NotDragging,

    #[error("Card not found: {0}")]
    UnknownCard(String),
}

#[derive(Debug, Default)]
pub struct DragSession {
    phase: DragPhase,
}

impl DragSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &DragPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, DragPhase::Idle)
    }

    /// Card being dragged, if any.
    pub fn card_id(&self) -> Option<&str> {
        match &self.phase {
            DragPhase::Idle => None,
            DragPhase::Dragging(drag) | DragPhase::Committing(drag) => Some(&drag.card_id),
        }
    }

    pub fn begin(&mut self, store: &CardStore, card_id: &str) -> Result<(), DragError> {
        if let Some(current) = self.card_id() {
            return Err(DragError::AlreadyDragging(current.to_string()));
        }
        let card = store
            .get(card_id)
            .ok_or_else(|| DragError::UnknownCard(card_id.to_string()))?;

        let frozen: HashMap<Column, Vec<Card>> = Column::ALL
            .iter()
            .map(|column| (*column, store.by_column(*column)))
            .collect();
        let index = frozen[&card.column_type]
            .iter()
            .position(|c| c.id == card_id)
            .unwrap_or(0);

        log::debug!(target: "boardsync.drag", "Drag started for card {}", card_id);
        self.phase = DragPhase::Dragging(ActiveDrag {
            card_id: card_id.to_string(),
            origin: DropTarget::new(card.column_type, index),
            hover: None,
            frozen,
        });
        Ok(())
    }

    /// Record the slot the card is currently over (`None` when outside every column).
    pub fn hover(&mut self, target: Option<DropTarget>) -> Result<(), DragError> {
        match &mut self.phase {
            DragPhase::Dragging(drag) => {
                drag.hover = target;
                Ok(())
            }
            _ => Err(DragError::NotDragging),
        }
    }

    /// Frozen order of `column` with the dragged card at its hover slot.
    /// `None` when no gesture is in progress.
    pub fn view(&self, column: Column) -> Option<Vec<Card>> {
        let drag = match &self.phase {
            DragPhase::Idle => return None,
            DragPhase::Dragging(drag) | DragPhase::Committing(drag) => drag,
        };
        let mut cards: Vec<Card> = drag.frozen.get(&column).cloned().unwrap_or_default();
        let dragged = drag
            .frozen
            .values()
            .flatten()
            .find(|c| c.id == drag.card_id)
            .cloned();
        cards.retain(|c| c.id != drag.card_id);

        let slot = drag.hover.unwrap_or(drag.origin);
        if let (Some(card), true) = (dragged, slot.column == column) {
            let index = slot.index.min(cards.len());
            cards.insert(index, card);
        }
        Some(cards)
    }

    /// End the gesture over `target`.
    ///
    /// Dropping outside a column, back on the origin slot, or after the card
    /// was deleted returns `Unchanged` and the session is Idle. Otherwise the
    /// session enters Committing and the move intent is returned.
    pub fn drop_on(
        &mut self,
        store: &CardStore,
        target: Option<DropTarget>,
    ) -> Result<DropOutcome, DragError> {
        let drag = match std::mem::take(&mut self.phase) {
            DragPhase::Dragging(drag) => drag,
            other => {
                self.phase = other;
                return Err(DragError::NotDragging);
            }
        };

        let Some(target) = target else {
            log::debug!(
                target: "boardsync.drag",
                "Card {} dropped outside the board",
                drag.card_id
            );
            return Ok(DropOutcome::Unchanged);
        };
        if target == drag.origin {
            return Ok(DropOutcome::Unchanged);
        }
        if !store.contains(&drag.card_id) {
            log::info!(
                target: "boardsync.drag",
                "Card {} was deleted during the drag, dropping gesture",
                drag.card_id
            );
            return Ok(DropOutcome::Unchanged);
        }

        let mut sequence = store.by_column(target.column);
        sequence.retain(|c| c.id != drag.card_id);
        let index = target.index.min(sequence.len());
        let order_index = order::compute_position(&sequence, index);

        let intent = Intent::Move {
            card_id: drag.card_id.clone(),
            column: target.column,
            order_index,
        };
        self.phase = DragPhase::Committing(drag);
        Ok(DropOutcome::Commit(intent))
    }

    /// Committing -> Idle, once the move was applied and its write issued.
    pub fn finish(&mut self) {
        if matches!(self.phase, DragPhase::Committing(_)) {
            self.phase = DragPhase::Idle;
        }
    }
}
