use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use boardsync_core::backend::memory::MemoryBackend;
use boardsync_core::backend::CardBackend;
use boardsync_core::controller::BoardController;
use boardsync_core::drag::DropTarget;
use boardsync_core::types::{BoardEvent, Card, Column};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use boardsync_remote::config::ClientConfig;
use boardsync_remote::rest::RestBackend;

const SHORT_ID_LEN: usize = 8;

#[derive(Parser)]
#[command(name = "boardsync")]
#[command(version, about = "Follow and edit a shared task board")]
pub struct Cli {
    /// Config file (defaults to ~/.config/boardsync/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use an in-process board seeded with demo cards instead of the server
    #[arg(long, global = true)]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the board
    Show { board: String },
    /// Print the board and reprint it on every change until interrupted
    Watch { board: String },
    /// Add a card at the bottom of a column
    Add {
        board: String,
        column: Column,
        #[arg(required = true, num_args = 1..)]
        content: Vec<String>,
    },
    /// Replace a card's text
    Edit {
        board: String,
        /// Card id or unique id prefix
        card: String,
        #[arg(required = true, num_args = 1..)]
        content: Vec<String>,
    },
    /// Move a card to a column slot
    Move {
        board: String,
        card: String,
        column: Column,
        /// Slot in the target column (defaults to the bottom, or the card's
        /// current slot when it stays in its column)
        #[arg(short, long)]
        index: Option<usize>,
    },
    /// Delete a card
    Delete { board: String, card: String },
    /// Reset a column's positions to 0, 1, 2, ...
    Renumber { board: String, column: Column },
}

impl Commands {
    fn board(&self) -> &str {
        match self {
            Commands::Show { board }
            | Commands::Watch { board }
            | Commands::Add { board, .. }
            | Commands::Edit { board, .. }
            | Commands::Move { board, .. }
            | Commands::Delete { board, .. }
            | Commands::Renumber { board, .. } => board,
        }
    }
}

pub async fn run(cli: Cli, config: ClientConfig, config_path: PathBuf) -> Result<()> {
    let board_id = cli.command.board().to_string();
    let (backend, user_id): (Arc<dyn CardBackend>, String) = if cli.memory {
        (Arc::new(demo_backend(&board_id)), "local".to_string())
    } else {
        config.validate(&config_path)?;
        let backend = RestBackend::new(&config).context("Failed to build HTTP client")?;
        (Arc::new(backend), config.user_id.clone())
    };

    let mut controller = BoardController::new(backend, user_id, config.sync.clone());
    controller
        .open(&board_id)
        .await
        .with_context(|| format!("Could not open board {}", board_id))?;
    let mut events = controller.events();

    match cli.command {
        Commands::Show { .. } => print_board(&controller),
        Commands::Watch { .. } => watch(&mut controller, &mut events).await?,
        Commands::Add { column, content, .. } => {
            let card_id = controller.create_card(column, &content.join(" "))?;
            finish(&mut controller, &mut events).await?;
            println!("Added {}", short_id(&card_id));
        }
        Commands::Edit { card, content, .. } => {
            let card_id = resolve_card(&controller, &card)?;
            controller.edit_card(&card_id, &content.join(" "))?;
            finish(&mut controller, &mut events).await?;
        }
        Commands::Move {
            card, column, index, ..
        } => {
            let card_id = resolve_card(&controller, &card)?;
            let index = index
                .unwrap_or_else(|| default_slot(&controller.column_view(column), &card_id));
            if controller
                .move_card(&card_id, DropTarget::new(column, index))?
                .is_none()
            {
                println!("Card already in place");
                return Ok(());
            }
            finish(&mut controller, &mut events).await?;
        }
        Commands::Delete { card, .. } => {
            let card_id = resolve_card(&controller, &card)?;
            controller.delete_card(&card_id)?;
            finish(&mut controller, &mut events).await?;
        }
        Commands::Renumber { column, .. } => {
            let writes = controller.renumber_column(column)?;
            finish(&mut controller, &mut events).await?;
            println!("Renumbered {} cards in {}", writes.len(), column.title());
        }
    }

    controller.close();
    Ok(())
}

/// Wait for issued writes and fail on the first rejected one.
async fn finish(
    controller: &mut BoardController,
    events: &mut broadcast::Receiver<BoardEvent>,
) -> Result<()> {
    controller.settle().await;
    while let Ok(event) = events.try_recv() {
        if let BoardEvent::Notice { message, .. } = event {
            bail!(message);
        }
    }
    Ok(())
}

async fn watch(
    controller: &mut BoardController,
    events: &mut broadcast::Receiver<BoardEvent>,
) -> Result<()> {
    print_board(controller);
    loop {
        tokio::select! {
            activity = controller.pump() => {
                if activity.is_none() {
                    bail!("Live updates stopped");
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }

        let mut redraw = false;
        while let Ok(event) = events.try_recv() {
            match event {
                BoardEvent::Changed { .. } => redraw = true,
                BoardEvent::Notice { message, .. } => eprintln!("! {}", message),
                BoardEvent::Resynced { board_id } => eprintln!("Reloaded board {}", board_id),
            }
        }
        if redraw {
            println!();
            print_board(controller);
        }
    }
}

fn print_board(controller: &BoardController) {
    for column in Column::ALL {
        let cards = controller.column_view(column);
        println!("{} ({})", column.title(), cards.len());
        for card in &cards {
            println!("  {}  {:>8}  {}", short_id(&card.id), card.order_index, card.content);
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// Find the card whose id equals or uniquely starts with `needle`.
fn resolve_card(controller: &BoardController, needle: &str) -> Result<String> {
    let cards: Vec<Card> = Column::ALL
        .iter()
        .flat_map(|column| controller.column_view(*column))
        .collect();
    find_card(&cards, needle)
}

/// Slot for a move without `--index`: where the card already is when it stays
/// in `column`, otherwise the bottom.
fn default_slot(column: &[Card], card_id: &str) -> usize {
    column
        .iter()
        .position(|c| c.id == card_id)
        .unwrap_or(usize::MAX)
}

fn find_card(cards: &[Card], needle: &str) -> Result<String> {
    if let Some(card) = cards.iter().find(|c| c.id == needle) {
        return Ok(card.id.clone());
    }
    let matches: Vec<&Card> = cards.iter().filter(|c| c.id.starts_with(needle)).collect();
    match matches.as_slice() {
        [card] => Ok(card.id.clone()),
        [] => bail!("No card matches {}", needle),
        _ => bail!("{} matches {} cards, use a longer prefix", needle, matches.len()),
    }
}

fn demo_backend(board_id: &str) -> MemoryBackend {
    let backend = MemoryBackend::new();
    let seed = [
        (Column::Todo, "Sketch the board layout", 0.0),
        (Column::Todo, "Write the sync tests", 1.0),
        (Column::InProgress, "Fractional positions", 0.0),
        (Column::Done, "Pick a card schema", 0.0),
    ];
    backend.seed(
        seed.iter()
            .map(|(column, content, position)| {
                Card::new_local(board_id, *column, content, *position, "demo")
            })
            .collect(),
    );
    backend
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str) -> Card {
        let mut card = Card::new_local("p1", Column::Todo, id, 0.0, "u1");
        card.id = id.to_string();
        card
    }

    #[test]
    fn test_find_card_by_prefix() {
        let cards = vec![card("abc123"), card("abd456"), card("ab")];
        assert_eq!(find_card(&cards, "abc").unwrap(), "abc123");
        assert_eq!(find_card(&cards, "ab").unwrap(), "ab");
        assert!(find_card(&cards, "abx").is_err());
        assert!(find_card(&cards, "abd4").is_ok());
        assert!(find_card(&cards, "a").unwrap_err().to_string().contains("3 cards"));
    }

    #[test]
    fn test_default_slot_keeps_card_in_its_column() {
        let todo = vec![card("a"), card("b"), card("c")];
        assert_eq!(default_slot(&todo, "c"), 2);
        assert_eq!(default_slot(&todo, "a"), 0);
        // Moving in from another column: append.
        assert_eq!(default_slot(&todo, "z"), usize::MAX);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("8d0b3f52-7c38"), "8d0b3f52");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_cli_parses_move() {
        let cli = Cli::try_parse_from([
            "boardsync",
            "--memory",
            "move",
            "p1",
            "abc",
            "in-progress",
            "-i",
            "0",
        ])
        .unwrap();
        assert!(cli.memory);
        match cli.command {
            Commands::Move { board, card, column, index } => {
                assert_eq!(board, "p1");
                assert_eq!(card, "abc");
                assert_eq!(column, Column::InProgress);
                assert_eq!(index, Some(0));
            }
            _ => panic!("expected move"),
        }
    }

    #[tokio::test]
    async fn test_demo_board_commands() {
        for args in [
            vec!["boardsync", "--memory", "show", "p1"],
            vec!["boardsync", "--memory", "add", "p1", "done", "Ship", "it"],
            vec!["boardsync", "--memory", "renumber", "p1", "todo"],
        ] {
            let cli = Cli::try_parse_from(args).unwrap();
            run(cli, ClientConfig::default(), PathBuf::from("config.json"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_remote_mode_requires_config() {
        let cli = Cli::try_parse_from(["boardsync", "show", "p1"]).unwrap();
        let err = run(cli, ClientConfig::default(), PathBuf::from("config.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
