//! Client support layer for toomanycards, an overengineered Quizlet
//! replacement. Provides the authenticated JSON API client (with coalesced
//! session refresh), the in-memory flashcard domain model used by the study
//! pages, and the versioned cache of static build assets.

pub mod api;
pub mod assets;
pub mod cards;
pub mod models;

#[cfg(test)]
mod api_tests;

pub use api::{ApiClient, ApiError, Auth, Priority, RequestOptions};
pub use assets::{
    AssetCacheWorker, AssetManifest, AssetSource, CacheError, CacheStore, HttpAssetSource,
};
pub use cards::{
    random_item, random_subset, shuffle, AnswerEntry, AnswerRecord, AnswerTracker, Card, CardKey,
    CardPool, StudyConfig, StudyMode,
};
pub use models::{CardId, Deck, DeckId, User};
