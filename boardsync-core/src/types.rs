use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three fixed columns of a board.
/// Not a stored entity: it only partitions cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Column {
    #[serde(rename = "todo")]
    Todo,
    #[serde(rename = "inprogress")]
    InProgress,
    #[serde(rename = "done")]
    Done,
}

impl Column {
    /// All columns in board order (left to right).
    pub const ALL: [Column; 3] = [Column::Todo, Column::InProgress, Column::Done];

    /// Wire name, as stored in the `column_type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Todo => "todo",
            Column::InProgress => "inprogress",
            Column::Done => "done",
        }
    }

    /// Display title.
    pub fn title(&self) -> &'static str {
        match self {
            Column::Todo => "To Do",
            Column::InProgress => "In Progress",
            Column::Done => "Done",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown column: {0}")]
pub struct UnknownColumn(pub String);

impl FromStr for Column {
    type Err = UnknownColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todo" => Ok(Column::Todo),
            "inprogress" | "in-progress" | "in_progress" => Ok(Column::InProgress),
            "done" => Ok(Column::Done),
            other => Err(UnknownColumn(other.to_string())),
        }
    }
}

/// One card row, as held by the remote store and delivered in change events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    /// Owning board.
    pub project_id: String,
    pub column_type: Column,
    pub content: String,
    /// Fractional position. Only meaningful relative to cards in the same column.
    pub order_index: f64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Server-assigned last-modified time. Authority for last-writer-wins.
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Build a card for a local create. Timestamps are provisional until the
    /// server echoes the row back.
    pub fn new_local(
        project_id: &str,
        column: Column,
        content: &str,
        order_index: f64,
        created_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            column_type: column,
            content: content.to_string(),
            order_index,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A row-level change notification for the `cards` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "row", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert(Card),
    Update(Card),
    Delete { id: String },
}

impl ChangeEvent {
    /// Id of the card the event refers to.
    pub fn card_id(&self) -> &str {
        match self {
            ChangeEvent::Insert(card) | ChangeEvent::Update(card) => &card.id,
            ChangeEvent::Delete { id } => id,
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BoardEvent {
    /// The board view changed and should be redrawn.
    Changed { board_id: String, revision: u64 },
    /// A non-fatal message for the user (a write was rejected and reverted).
    Notice { board_id: String, message: String },
    /// The board was reloaded after a subscription gap.
    Resynced { board_id: String },
}
