//! Game Persistence
//!
//! The core never touches storage directly. Game actors load a game once
//! when they start and save it after every mutation through [`GameStore`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::game::{Game, GameId};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Loads and saves games by id.
pub trait GameStore: Send + Sync {
    /// Load a game.
    fn load(&self, id: &str) -> Result<Option<Game>, StoreError>;

    /// Persist a game.
    fn save(&self, game: &Game) -> Result<(), StoreError>;

    /// Ids of saved games, as they are saved.
    fn subscribe(&self) -> broadcast::Receiver<GameId>;
}

/// In-memory store.
pub struct MemoryGameStore {
    games: RwLock<BTreeMap<GameId, Game>>,
    changes: broadcast::Sender<GameId>,
}

impl MemoryGameStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            games: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Number of stored games.
    pub fn len(&self) -> usize {
        self.games.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryGameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStore for MemoryGameStore {
    fn load(&self, id: &str) -> Result<Option<Game>, StoreError> {
        let games = self
            .games
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(games.get(id).cloned())
    }

    fn save(&self, game: &Game) -> Result<(), StoreError> {
        {
            let mut games = self
                .games
                .write()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            games.insert(game.id.clone(), game.clone());
        }
        // No subscribers is fine.
        let _ = self.changes.send(game.id.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GameId> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{GameSettings, GameState, Team};

    #[test]
    fn test_save_load_and_notify() {
        let store = MemoryGameStore::new();
        let mut changes = store.subscribe();
        assert!(store.load("g1").unwrap().is_none());

        let game = Game::new(
            "g1",
            GameState::new(vec![Team::human(0, "alice"), Team::human(1, "bob")], GameSettings::default()),
        );
        store.save(&game).unwrap();

        assert_eq!(store.load("g1").unwrap(), Some(game));
        assert_eq!(changes.try_recv().unwrap(), "g1");
        assert_eq!(store.len(), 1);
    }
}
