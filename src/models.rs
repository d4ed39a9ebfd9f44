use serde::{Deserialize, Serialize};

use crate::cards::Card;

pub type CardId = String;
pub type DeckId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub full_name: String,
    pub is_admin: bool,
    /// Decks owned by this user.
    #[serde(default)]
    pub decks: Vec<DeckId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    pub id: DeckId,
    pub name: String,
    pub cards: Vec<Card>,
}
