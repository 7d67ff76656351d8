//! Review card persistence
//!
//! The spaced-repetition algorithm is an external collaborator behind
//! `CardScheduler`. This module only stores whatever card state it returns
//! through the global vocabulary repository, so every review is synced like
//! any other edit.

use super::records::{make_global_id, GlobalVocabularyEntry};
use super::repo::SyncedRepo;
use super::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Scheduler-owned card fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardState {
    pub due: Option<String>,
    pub stability: f64,
    pub difficulty: f64,
    pub elapsed_days: f64,
    pub scheduled_days: f64,
    pub reps: i64,
    pub lapses: i64,
    pub state: i64,
    pub last_review: Option<String>,
}

/// Review answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Rating {
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Again),
            2 => Some(Self::Hard),
            3 => Some(Self::Good),
            4 => Some(Self::Easy),
            _ => None,
        }
    }
}

/// Next due date per rating, for showing the user before they answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalPreview {
    pub rating: Rating,
    pub due: String,
}

/// Spaced-repetition algorithm
pub trait CardScheduler: Send + Sync {
    /// Card for a word entering review; `existing` is kept when already learning
    fn ensure_learning_card(&self, existing: Option<&CardState>, now: DateTime<Utc>) -> CardState;

    fn review_card(&self, card: &CardState, rating: Rating, now: DateTime<Utc>) -> CardState;

    fn preview_intervals(&self, card: &CardState, now: DateTime<Utc>) -> Vec<IntervalPreview>;
}

/// Global vocabulary operations that go through the card scheduler
pub struct GlobalVocabService {
    repo: SyncedRepo<GlobalVocabularyEntry>,
    scheduler: Arc<dyn CardScheduler>,
}

impl GlobalVocabService {
    pub fn new(repo: SyncedRepo<GlobalVocabularyEntry>, scheduler: Arc<dyn CardScheduler>) -> Self {
        Self { repo, scheduler }
    }

    /// Create the card for `word` if missing and record `book_id` as a source
    pub fn ensure_card(
        &self,
        language: &str,
        word: &str,
        book_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GlobalVocabularyEntry, StoreError> {
        let id = make_global_id(language, word);
        let mut entry = self
            .repo
            .get(&id)?
            .unwrap_or_else(|| GlobalVocabularyEntry::new(language, word));

        let learning = Some(&entry.card).filter(|c| c.reps > 0 || c.due.is_some());
        entry.card = self.scheduler.ensure_learning_card(learning, now);
        if let Some(book_id) = book_id {
            if !entry.source_books.iter().any(|b| b == book_id) {
                entry.source_books.push(book_id.to_string());
            }
        }

        self.repo.upsert(entry)
    }

    /// Apply a review answer and persist the new card state
    pub fn review(
        &self,
        id: &str,
        rating: Rating,
        now: DateTime<Utc>,
    ) -> Result<Option<GlobalVocabularyEntry>, StoreError> {
        let Some(mut entry) = self.repo.get(id)? else {
            log::warn!("Review for unknown card {}", id);
            return Ok(None);
        };

        entry.card = self.scheduler.review_card(&entry.card, rating, now);
        self.repo.upsert(entry).map(Some)
    }

    pub fn preview(&self, id: &str, now: DateTime<Utc>) -> Result<Vec<IntervalPreview>, StoreError> {
        Ok(self
            .repo
            .get(id)?
            .map(|entry| self.scheduler.preview_intervals(&entry.card, now))
            .unwrap_or_default())
    }

    /// Cards due at `now`, earliest first
    pub fn due_cards(&self, now: DateTime<Utc>) -> Result<Vec<GlobalVocabularyEntry>, StoreError> {
        let now = super::models::format_timestamp(now);
        let mut due: Vec<_> = self
            .repo
            .list_all()?
            .into_iter()
            .filter(|entry| entry.card.due.as_deref().map_or(false, |d| d <= now.as_str()))
            .collect();
        due.sort_by(|a, b| a.card.due.cmp(&b.card.due));
        Ok(due)
    }

    /// Drop `book_id` from the card's sources; the card is deleted once no
    /// source book remains. Returns the surviving card, if any.
    pub fn remove_book_source(
        &self,
        id: &str,
        book_id: &str,
    ) -> Result<Option<GlobalVocabularyEntry>, StoreError> {
        let Some(mut entry) = self.repo.get(id)? else {
            return Ok(None);
        };

        let before = entry.source_books.len();
        entry.source_books.retain(|b| b != book_id);
        if entry.source_books.len() == before {
            return Ok(Some(entry));
        }

        if entry.source_books.is_empty() {
            self.repo.delete(id)?;
            return Ok(None);
        }

        self.repo.upsert(entry).map(Some)
    }
}

// ============================================================================
// Tests
// ============================================================================
