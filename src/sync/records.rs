//! Synced record kinds and their remote row mappings
//!
//! - `BookVocabularyEntry`: words saved while reading a book
//! - `GlobalVocabularyEntry`: cross-book review cards, one per (language, word)
//! - `ReadingProgress`: one row per book
//! - `BookMetadata`: book title/position, pushed during full sync only
//!
//! Incoming rows are mapped leniently: numeric fields may arrive as strings or
//! nulls, `created_at` falls back to `updated_at`. A row without an id or an
//! `updated_at` is rejected.

use super::models::{
    normalize_word, row_f64, row_i64, row_stamps, row_str, row_string_list, row_timestamp,
    EntityKind, RowError, SyncRecord,
};
use super::srs::CardState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Id of a book vocabulary entry: `<bookId>:<normalizedWord>`
pub fn make_vocab_id(book_id: &str, word: &str) -> String {
    format!("{}:{}", book_id, normalize_word(word))
}

/// Id of a global vocabulary entry: `<language>:<normalizedWord>`
pub fn make_global_id(language: &str, word: &str) -> String {
    let word = normalize_word(word);
    let language = language.trim();
    if language.is_empty() {
        word
    } else {
        format!("{}:{}", language, word)
    }
}

// ============================================================================
// Book Vocabulary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookVocabularyEntry {
    pub id: String,
    pub book_id: String,
    #[serde(default)]
    pub language: Option<String>,
    pub word: String,
    #[serde(default)]
    pub display_word: Option<String>,
    #[serde(default)]
    pub lemma: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub analysis: Option<Value>,
    #[serde(default)]
    pub source_chapter_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl BookVocabularyEntry {
    pub fn new(book_id: &str, word: &str) -> Self {
        let normalized = normalize_word(word);
        Self {
            id: make_vocab_id(book_id, word),
            book_id: book_id.to_string(),
            language: None,
            display_word: Some(word.trim().to_string()).filter(|w| !w.is_empty() && *w != normalized),
            word: normalized,
            lemma: None,
            status: None,
            context: None,
            analysis: None,
            source_chapter_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

impl SyncRecord for BookVocabularyEntry {
    const KIND: EntityKind = EntityKind::BookVocabulary;

    fn id(&self) -> &str {
        &self.id
    }

    fn scope(&self) -> &str {
        &self.book_id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn set_updated_at(&mut self, timestamp: String) {
        self.updated_at = timestamp;
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn set_created_at(&mut self, timestamp: String) {
        self.created_at = timestamp;
    }

    fn to_row(&self, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "id": self.id,
            "kind": "book",
            "book_id": self.book_id,
            "language": self.language,
            "word": self.word,
            "display_word": self.display_word,
            "lemma": self.lemma,
            "status": self.status,
            "context": self.context,
            "analysis": self.analysis,
            "source_chapter_id": self.source_chapter_id,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }

    fn from_row(row: &Value) -> Result<Self, RowError> {
        let id = row_str(row, "id").ok_or(RowError::MissingField("id"))?;
        let book_id = row_str(row, "book_id").ok_or(RowError::MissingField("book_id"))?;
        let (created_at, updated_at) = row_stamps(row)?;

        Ok(Self {
            id,
            book_id,
            language: row_str(row, "language"),
            word: normalize_word(&row_str(row, "word").unwrap_or_default()),
            display_word: row_str(row, "display_word"),
            lemma: row_str(row, "lemma"),
            status: row_str(row, "status"),
            context: row_str(row, "context"),
            analysis: row.get("analysis").filter(|v| !v.is_null()).cloned(),
            source_chapter_id: row_str(row, "source_chapter_id"),
            created_at,
            updated_at,
        })
    }
}

// ============================================================================
// Global Vocabulary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalVocabularyEntry {
    pub id: String,
    #[serde(default)]
    pub language: Option<String>,
    pub normalized_word: String,
    #[serde(default)]
    pub display_word: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub source_books: Vec<String>,
    #[serde(default)]
    pub meaning: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
    #[serde(default)]
    pub contextual_meaning: Option<String>,
    #[serde(default)]
    pub context_sentence: Option<String>,

    /// Scheduler-owned card fields, persisted verbatim
    #[serde(flatten)]
    pub card: CardState,

    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl GlobalVocabularyEntry {
    pub fn new(language: &str, word: &str) -> Self {
        let language = language.trim();
        Self {
            id: make_global_id(language, word),
            language: Some(language.to_string()).filter(|l| !l.is_empty()),
            normalized_word: normalize_word(word),
            display_word: Some(word.trim().to_string()).filter(|w| !w.is_empty()),
            status: None,
            source_books: Vec::new(),
            meaning: None,
            usage: None,
            contextual_meaning: None,
            context_sentence: None,
            card: CardState::default(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

impl SyncRecord for GlobalVocabularyEntry {
    const KIND: EntityKind = EntityKind::GlobalVocabulary;

    fn id(&self) -> &str {
        &self.id
    }

    fn scope(&self) -> &str {
        self.language.as_deref().unwrap_or("")
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn set_updated_at(&mut self, timestamp: String) {
        self.updated_at = timestamp;
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn set_created_at(&mut self, timestamp: String) {
        self.created_at = timestamp;
    }

    fn to_row(&self, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "id": self.id,
            "kind": "global",
            "book_id": null,
            "language": self.language,
            "word": self.normalized_word,
            "display_word": self.display_word,
            "status": self.status,
            "source_books": self.source_books,
            "meaning": self.meaning,
            "usage": self.usage,
            "contextual_meaning": self.contextual_meaning,
            "context_sentence": self.context_sentence,
            "due": self.card.due,
            "stability": self.card.stability,
            "difficulty": self.card.difficulty,
            "elapsed_days": self.card.elapsed_days,
            "scheduled_days": self.card.scheduled_days,
            "reps": self.card.reps,
            "lapses": self.card.lapses,
            "state": self.card.state,
            "last_review": self.card.last_review,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }

    fn from_row(row: &Value) -> Result<Self, RowError> {
        let id = row_str(row, "id").ok_or(RowError::MissingField("id"))?;
        let (created_at, updated_at) = row_stamps(row)?;
        let word = row_str(row, "word")
            .or_else(|| row_str(row, "normalized_word"))
            .unwrap_or_else(|| id.clone());

        Ok(Self {
            language: row_str(row, "language").map(|l| l.trim().to_string()),
            normalized_word: normalize_word(&word),
            display_word: row_str(row, "display_word"),
            status: row_str(row, "status"),
            source_books: row_string_list(row, "source_books"),
            meaning: row_str(row, "meaning"),
            usage: row_str(row, "usage"),
            contextual_meaning: row_str(row, "contextual_meaning"),
            context_sentence: row_str(row, "context_sentence"),
            card: CardState {
                due: row_timestamp(row, "due"),
                stability: row_f64(row, "stability"),
                difficulty: row_f64(row, "difficulty"),
                elapsed_days: row_f64(row, "elapsed_days"),
                scheduled_days: row_f64(row, "scheduled_days"),
                reps: row_i64(row, "reps"),
                lapses: row_i64(row, "lapses"),
                state: row_i64(row, "state"),
                last_review: row_timestamp(row, "last_review"),
            },
            id,
            created_at,
            updated_at,
        })
    }
}

// ============================================================================
// Reading Progress
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    pub book_id: String,
    #[serde(default)]
    pub chapter_id: Option<String>,
    #[serde(default)]
    pub page_number: i64,
    #[serde(default)]
    pub scroll_position: f64,
    #[serde(default)]
    pub char_offset: i64,
    #[serde(default)]
    pub chapter_text_hash: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl ReadingProgress {
    pub fn new(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            chapter_id: None,
            page_number: 0,
            scroll_position: 0.0,
            char_offset: 0,
            chapter_text_hash: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

impl SyncRecord for ReadingProgress {
    const KIND: EntityKind = EntityKind::ReadingProgress;

    fn id(&self) -> &str {
        &self.book_id
    }

    fn scope(&self) -> &str {
        &self.book_id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn set_updated_at(&mut self, timestamp: String) {
        self.updated_at = timestamp;
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn set_created_at(&mut self, timestamp: String) {
        self.created_at = timestamp;
    }

    fn to_row(&self, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "book_id": self.book_id,
            "chapter_id": self.chapter_id,
            "page_number": self.page_number,
            "scroll_position": self.scroll_position,
            "char_offset": self.char_offset,
            "chapter_text_hash": self.chapter_text_hash,
            "updated_at": self.updated_at,
        })
    }

    fn from_row(row: &Value) -> Result<Self, RowError> {
        let book_id = row_str(row, "book_id").ok_or(RowError::MissingField("book_id"))?;
        let (created_at, updated_at) = row_stamps(row)?;

        Ok(Self {
            book_id,
            chapter_id: row_str(row, "chapter_id"),
            page_number: row_i64(row, "page_number"),
            scroll_position: row_f64(row, "scroll_position"),
            char_offset: row_i64(row, "char_offset"),
            chapter_text_hash: row_str(row, "chapter_text_hash"),
            created_at,
            updated_at,
        })
    }
}

// ============================================================================
// Book Metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub chapter_count: i64,
    #[serde(default)]
    pub current_chapter: i64,
    #[serde(default)]
    pub last_read_at: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl SyncRecord for BookMetadata {
    const KIND: EntityKind = EntityKind::Book;

    fn id(&self) -> &str {
        &self.id
    }

    fn scope(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn set_updated_at(&mut self, timestamp: String) {
        self.updated_at = timestamp;
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn set_created_at(&mut self, timestamp: String) {
        self.created_at = timestamp;
    }

    fn to_row(&self, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "id": self.id,
            "title": self.title,
            "language": self.language,
            "chapter_count": self.chapter_count,
            "current_chapter": self.current_chapter,
            "last_read_at": self.last_read_at,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }

    fn from_row(row: &Value) -> Result<Self, RowError> {
        let id = row_str(row, "id").ok_or(RowError::MissingField("id"))?;
        let (created_at, updated_at) = row_stamps(row)?;

        Ok(Self {
            id,
            title: row_str(row, "title").unwrap_or_default(),
            language: row_str(row, "language"),
            chapter_count: row_i64(row, "chapter_count"),
            current_chapter: row_i64(row, "current_chapter"),
            last_read_at: row_timestamp(row, "last_read_at"),
            created_at,
            updated_at,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
