/// In-memory card set for one open board.
///
/// Pure state: no operation here performs I/O or decides whether an image
/// should win. The reconciler makes that call and then upserts.
use std::collections::HashMap;

use crate::types::{Card, Column};

#[derive(Debug, Default)]
pub struct CardStore {
    cards: HashMap<String, Card>,
    /// Bumped on every mutation.
    revision: u64,
    dirty: bool,
}

impl CardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite with the incoming image.
    pub fn upsert(&mut self, card: Card) {
        self.cards.insert(card.id.clone(), card);
        self.touch();
    }

    pub fn remove(&mut self, id: &str) -> Option<Card> {
        let removed = self.cards.remove(id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&Card> {
        self.cards.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cards.contains_key(id)
    }

    /// Cards of `column`, ascending by position, ties broken by id.
    pub fn by_column(&self, column: Column) -> Vec<Card> {
        let mut cards: Vec<Card> = self
            .cards
            .values()
            .filter(|c| c.column_type == column)
            .cloned()
            .collect();
        sort_by_position(&mut cards);
        cards
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Drop every card (board closed).
    pub fn clear(&mut self) {
        if !self.cards.is_empty() {
            self.cards.clear();
            self.touch();
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read and reset the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }
}

/// Stable ascending sort by position with id as tie-break.
pub fn sort_by_position(cards: &mut [Card]) {
    cards.sort_by(|a, b| {
        a.order_index
            .total_cmp(&b.order_index)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_card(id: &str, column: Column, order_index: f64) -> Card {
        let mut card = Card::new_local("p1", column, id, order_index, "u1");
        card.id = id.to_string();
        card
    }

    #[test]
    fn test_by_column_sorted_and_filtered() {
        let mut store = CardStore::new();
        store.upsert(make_card("c", Column::Todo, 3.0));
        store.upsert(make_card("a", Column::Todo, 1.0));
        store.upsert(make_card("x", Column::Done, 0.0));
        store.upsert(make_card("b", Column::Todo, 2.0));

        let ids: Vec<String> = store.by_column(Column::Todo).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.by_column(Column::Done).len(), 1);
        assert!(store.by_column(Column::InProgress).is_empty());
    }

    #[test]
    fn test_ties_broken_by_id() {
        let mut store = CardStore::new();
        store.upsert(make_card("b", Column::Todo, 1.0));
        store.upsert(make_card("a", Column::Todo, 1.0));
        let ids: Vec<String> = store.by_column(Column::Todo).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_upsert_overwrites() {
        let mut store = CardStore::new();
        store.upsert(make_card("a", Column::Todo, 1.0));
        store.upsert(make_card("a", Column::Done, 5.0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().column_type, Column::Done);
    }

    #[test]
    fn test_mutations_mark_dirty() {
        let mut store = CardStore::new();
        assert!(!store.is_dirty());

        store.upsert(make_card("a", Column::Todo, 1.0));
        assert!(store.take_dirty());
        assert!(!store.is_dirty());

        // Removing something absent is not a mutation.
        assert!(store.remove("missing").is_none());
        assert!(!store.is_dirty());

        store.remove("a");
        assert!(store.take_dirty());
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_clear() {
        let mut store = CardStore::new();
        store.upsert(make_card("a", Column::Todo, 1.0));
        store.clear();
        assert!(store.is_empty());
        assert!(!store.contains("a"));
    }
}
