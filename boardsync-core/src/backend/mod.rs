pub mod memory;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::types::{Card, ChangeEvent, Column};

/// Push feed of row changes for one board. Ends when the subscription closes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, TransportError>>;

/// The remote card store the board syncs against.
/// Implementations: MemoryBackend (in-process), RestBackend (boardsync-remote).
///
/// Every call may fail with a `TransportError`; the controller maps failed
/// writes to a local revert.
pub trait CardBackend: Send + Sync {
    /// All cards of a board, ascending by `order_index`.
    fn load_cards(&self, board_id: &str) -> BoxFuture<'static, Result<Vec<Card>, TransportError>>;

    /// Insert a card. Returns the stored row with server timestamps.
    fn insert_card(&self, card: Card) -> BoxFuture<'static, Result<Card, TransportError>>;

    /// Move a card. Returns the updated row, or `None` if no row matched.
    fn update_position(
        &self,
        card_id: &str,
        column: Column,
        order_index: f64,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>>;

    /// Replace a card's content. Returns the updated row, or `None` if no row matched.
    fn update_content(
        &self,
        card_id: &str,
        content: &str,
    ) -> BoxFuture<'static, Result<Option<Card>, TransportError>>;

    fn delete_card(&self, card_id: &str) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Open a push subscription for `board_id`.
    fn subscribe(&self, board_id: &str) -> BoxFuture<'static, Result<ChangeStream, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Subscription closed")]
    Closed,

    #[error("Subscription lagged, {0} events dropped")]
    Lagged(u64),
}
