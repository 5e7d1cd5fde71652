use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use thiserror::Error;

/// Enumeration of errors for canonical record writes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Two workers raced on the same story: a duplicate-key rejection, or a
    /// merge into a record whose insert has not landed yet. Retrying
    /// resolves the race once the first writer finishes.
    #[error("canonical record write conflicted, safe to retry")]
    Conflict,
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict => true,
            StoreError::Database(_) => true,
        }
    }
}

/// The record of truth for one distinct story. Created once, updated only
/// to bump `merge_count` or refresh `category`; never deleted here.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalArticle {
    pub canonical_id: String,
    pub title: String,
    pub description: String,
    pub source: String,
    pub link: String,
    pub category: String,
    pub confidence: f64,
    pub picture: Option<String>,
    pub provider: Option<String>,
    /// Category assigned by the upstream feed, kept for inspection.
    pub original_category: Option<String>,
    pub published_date: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// The record already existed: a redelivery or a lost race. The update
    /// still applied category and merge_count.
    AlreadyExists,
}

/// Capability interface over canonical article storage.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Idempotently create the canonical record for a distinct story.
    async fn upsert_new(&self, article: &CanonicalArticle) -> Result<UpsertOutcome, StoreError>;

    /// Count one more merged source item into an existing story. Fails with
    /// `Conflict` while the story's record has not been written yet.
    async fn record_merge(&self, canonical_id: &str) -> Result<(), StoreError>;
}

/// `ArticleStore` on a MongoDB collection, the storage target the read API
/// queries by category, source and full text.
pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    pub async fn new(uri: &str, db_name: &str, collection: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let store = Self {
            collection: client.database(db_name).collection::<Document>(collection),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// Indexes backing the pipeline's idempotence guarantee (unique link)
    /// and the read API's query patterns.
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = IndexOptions::builder().unique(true).build();
        let indexes = [
            IndexModel::builder()
                .keys(doc! { "link": 1 })
                .options(unique)
                .build(),
            IndexModel::builder().keys(doc! { "category": 1 }).build(),
            IndexModel::builder().keys(doc! { "source": 1 }).build(),
            IndexModel::builder()
                .keys(doc! { "published_date": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "title": "text", "description": "text" })
                .build(),
        ];
        self.collection.create_indexes(indexes, None).await?;
        Ok(())
    }
}

/// The single update shape used for every new-story write.
///
/// Identity fields and the initial `merge_count` are written exactly once,
/// on insert, so a redelivery that slips past the window (expiry, restart)
/// is a no-op. `category`/`confidence` apply last-writer-wins so a
/// reclassified story converges.
fn upsert_update(article: &CanonicalArticle) -> Document {
    doc! {
        "$setOnInsert": {
            "title": &article.title,
            "description": &article.description,
            "source": &article.source,
            "link": &article.link,
            "picture": article.picture.clone(),
            "provider": article.provider.clone(),
            "original_category": article.original_category.clone(),
            "published_date": mongodb::bson::DateTime::from_chrono(article.published_date),
            "first_seen_at": mongodb::bson::DateTime::from_chrono(article.first_seen_at),
            "merge_count": 1,
        },
        "$set": {
            "category": &article.category,
            "confidence": article.confidence,
        },
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref write_error)) if write_error.code == 11000
    )
}

#[async_trait]
impl ArticleStore for MongoStore {
    async fn upsert_new(&self, article: &CanonicalArticle) -> Result<UpsertOutcome, StoreError> {
        let filter = doc! { "_id": &article.canonical_id };
        let options = UpdateOptions::builder().upsert(true).build();

        match self
            .collection
            .update_one(filter, upsert_update(article), options)
            .await
        {
            Ok(result) if result.upserted_id.is_some() => Ok(UpsertOutcome::Created),
            Ok(_) => Ok(UpsertOutcome::AlreadyExists),
            // The unique link index can reject a racing upsert.
            Err(error) if is_duplicate_key(&error) => Err(StoreError::Conflict),
            Err(error) => Err(error.into()),
        }
    }

    async fn record_merge(&self, canonical_id: &str) -> Result<(), StoreError> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": canonical_id },
                doc! { "$inc": { "merge_count": 1 } },
                None,
            )
            .await?;
        // The record may not exist yet: a concurrent worker reserves the
        // story in the window before its upsert lands. Surface that as a
        // conflict so the retry policy bridges the gap instead of acking a
        // merge that matched nothing.
        if result.matched_count == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> CanonicalArticle {
        CanonicalArticle {
            canonical_id: "abc123".to_owned(),
            title: "Big Tech Announces New AI Initiative".to_owned(),
            description: "A groundbreaking AI project.".to_owned(),
            source: "Example News".to_owned(),
            link: "http://example.com/news/123".to_owned(),
            category: "BUSINESS".to_owned(),
            confidence: 0.87,
            picture: None,
            provider: Some("rss".to_owned()),
            original_category: None,
            published_date: Utc::now(),
            first_seen_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_update_separates_identity_from_mutable_fields() {
        let update = upsert_update(&article());

        let on_insert = update.get_document("$setOnInsert").unwrap();
        assert_eq!(
            on_insert.get_str("link").unwrap(),
            "http://example.com/news/123"
        );
        assert!(on_insert.get("first_seen_at").is_some());
        // Identity fields must not be overwritten on merge/redelivery.
        assert!(on_insert.get("category").is_none());

        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("category").unwrap(), "BUSINESS");

        // merge_count starts at 1 on insert and only record_merge moves it,
        // so writing the same record twice leaves it untouched.
        assert_eq!(on_insert.get_i32("merge_count").unwrap(), 1);
        assert!(update.get("$inc").is_none());
    }

    #[test]
    fn conflict_is_transient() {
        assert!(StoreError::Conflict.is_transient());
    }
}
