use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::models::CardId;

/// Shuffle a sequence in place. `SliceRandom::shuffle` is an unbiased
/// Fisher-Yates pass, so every permutation is equally likely.
pub fn shuffle<T>(items: &mut [T]) {
    items.shuffle(&mut rand::thread_rng());
}

/// Pick a uniformly random element, or `None` if the slice is empty.
pub fn random_item<T>(items: &[T]) -> Option<&T> {
    items.choose(&mut rand::thread_rng())
}

/// Draw `size` distinct elements without replacement, in reshuffled order.
/// Requests larger than the input truncate to the input length.
pub fn random_subset<T: Clone>(items: &[T], size: usize) -> Vec<T> {
    let mut rng = rand::thread_rng();
    let mut subset: Vec<T> = items.choose_multiple(&mut rng, size).cloned().collect();
    subset.shuffle(&mut rng);
    subset
}

/// Tracking identity of a card. A flipped card counts as a different card
/// than its unflipped twin, so progress on one never bleeds into the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardKey {
    pub id: CardId,
    pub flipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub term: String,
    pub definition: String,
    #[serde(default)]
    pub flipped: bool,
}

impl Card {
    pub fn new(
        id: impl Into<CardId>,
        term: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            term: term.into(),
            definition: definition.into(),
            flipped: false,
        }
    }

    pub fn front(&self) -> &str {
        if self.flipped {
            &self.definition
        } else {
            &self.term
        }
    }

    pub fn back(&self) -> &str {
        if self.flipped {
            &self.term
        } else {
            &self.definition
        }
    }

    pub fn flip(&mut self) {
        self.flipped = !self.flipped;
    }

    pub fn key(&self) -> CardKey {
        CardKey {
            id: self.id.clone(),
            flipped: self.flipped,
        }
    }
}

/// An ordered set of cards keyed by term: one card per term, iteration in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPool {
    cards: Vec<Card>,
}

impl CardPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keyed by term. Re-inserting a known term replaces that card in
    /// place, keeping its original position.
    pub fn insert(&mut self, card: Card) {
        match self.cards.iter().position(|c| c.term == card.term) {
            Some(pos) => self.cards[pos] = card,
            None => self.cards.push(card),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Search for and return a card.
    pub fn get(&self, term: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.term == term)
    }

    pub fn terms(&self) -> Vec<&str> {
        self.cards.iter().map(|c| c.term.as_str()).collect()
    }

    pub fn definitions(&self) -> Vec<&str> {
        self.cards.iter().map(|c| c.definition.as_str()).collect()
    }

    /// Return the backsides of all cards.
    pub fn backsides(&self) -> Vec<&str> {
        self.cards.iter().map(|c| c.back()).collect()
    }

    /// Treat the opposite side as the front, as if each card in the deck was
    /// turned over. Flipping twice restores the original orientation.
    pub fn flip(&mut self) {
        for card in &mut self.cards {
            card.flip();
        }
    }

    /// Orientation of the pool (all members share it after a `flip`).
    pub fn flipped(&self) -> bool {
        self.cards.first().map(|c| c.flipped).unwrap_or(false)
    }

    /// Return a uniformly random card.
    pub fn get_random(&self) -> Option<&Card> {
        random_item(&self.cards)
    }

    pub fn remove(&mut self, term: &str) -> bool {
        match self.cards.iter().position(|c| c.term == term) {
            Some(pos) => {
                self.cards.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards.iter()
    }
}

impl FromIterator<(String, String)> for CardPool {
    /// Build from term/definition pairs; the term doubles as the card id.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        let mut pool = CardPool::new();
        for (term, definition) in pairs {
            pool.insert(Card::new(term.clone(), term, definition));
        }
        pool
    }
}

impl From<Vec<Card>> for CardPool {
    fn from(cards: Vec<Card>) -> Self {
        let mut pool = CardPool::new();
        for card in cards {
            pool.insert(card);
        }
        pool
    }
}

impl<'a> IntoIterator for &'a CardPool {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub answer: String,
    pub correct: bool,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub card: Card,
    pub correct: u32,
    pub wrong: u32,
    pub answers: Vec<AnswerEntry>,
}

/// Per-card answer bookkeeping for one study session. Records live for the
/// lifetime of the tracker and are created lazily on the first answer.
#[derive(Debug, Clone)]
pub struct AnswerTracker {
    removal_threshold: u32,
    records: HashMap<CardKey, AnswerRecord>,
}

impl AnswerTracker {
    /// `removal_threshold` is how many correct answers a card needs before
    /// it counts as mastered. Zero is treated as one.
    pub fn new(removal_threshold: u32) -> Self {
        Self {
            removal_threshold: removal_threshold.max(1),
            records: HashMap::new(),
        }
    }

    pub fn removal_threshold(&self) -> u32 {
        self.removal_threshold
    }

    pub fn record(&self, card: &Card) -> Option<&AnswerRecord> {
        self.records.get(&card.key())
    }

    pub fn wrong_answer(&mut self, card: &Card, answer: &str) {
        self.log_answer(card, answer, false);
    }

    /// Log a correct answer and return whether the card should be removed
    /// from the active study set (its correct count reached the threshold).
    pub fn correct_answer(&mut self, card: &Card, answer: &str) -> bool {
        let threshold = self.removal_threshold;
        let record = self.log_answer(card, answer, true);
        record.correct >= threshold
    }

    fn log_answer(&mut self, card: &Card, answer: &str, is_correct: bool) -> &AnswerRecord {
        let record = self
            .records
            .entry(card.key())
            .or_insert_with(|| AnswerRecord {
                card: card.clone(),
                correct: 0,
                wrong: 0,
                answers: Vec::new(),
            });
        if is_correct {
            record.correct += 1;
        } else {
            record.wrong += 1;
        }
        record.answers.push(AnswerEntry {
            answer: answer.to_string(),
            correct: is_correct,
            answered_at: Utc::now(),
        });
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StudyMode {
    MultipleChoice,
    Written,
}

/// Study session settings, serialized with the field names the web client
/// stores in its JSON config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyConfig {
    pub mode: StudyMode,
    pub multiple_choice_options: usize,
    pub removal_threshold: u32,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            mode: StudyMode::MultipleChoice,
            multiple_choice_options: 5,
            removal_threshold: 1,
        }
    }
}
