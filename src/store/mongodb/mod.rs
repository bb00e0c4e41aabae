//! MongoDB message store.
//!
//! Messages live in a single collection keyed by `ObjectId`. A TTL index on
//! `expires_at` lets the server delete expired broadcasts; a `(channel, _id)`
//! index serves the polling query. Change streams require a replica set or a
//! sharded cluster, detected with `hello`.

mod change_feed;

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::options::{
    Acknowledgment, ChangeStreamOptions, CollectionOptions, FindOneOptions, FindOptions,
    IndexOptions, WriteConcern,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{info, warn};

use super::{
    ChangeFeed, Message, MessageId, MessageStore, ResumePosition, Result, StoreError,
};
use crate::config::StoreConfig;
use crate::utils::retry::connection_backoff;

use change_feed::{decode_token, MongoChangeFeed};

/// Index names.
const TTL_INDEX: &str = "expires_at_ttl";
const CHANNEL_INDEX: &str = "channel_id";

/// Server error codes meaning an equivalent index already exists.
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// MongoDB implementation of MessageStore.
pub struct MongoMessageStore {
    client: Client,
    database: Database,
    messages: Collection<Document>,
    ttl: Duration,
}

impl MongoMessageStore {
    /// Wrap an already-connected client.
    pub fn new(client: Client, config: &StoreConfig, ttl: Duration) -> Self {
        let database = client.database(&config.database);
        let options = CollectionOptions::builder()
            .write_concern(parse_write_concern(&config.write_concern))
            .build();
        let messages = database.collection_with_options(&config.collection, options);

        Self {
            client,
            database,
            messages,
            ttl,
        }
    }

    /// Connect with retry and verify the server answers `ping`.
    pub async fn connect(config: &StoreConfig, ttl: Duration) -> Result<Self> {
        let uri = config.uri.clone();
        let client = (|| async {
            let client = Client::with_uri_str(&uri).await?;
            client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await?;
            Ok::<_, mongodb::error::Error>(client)
        })
        .retry(connection_backoff())
        .notify(|e, delay| {
            warn!(
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "MongoDB connection failed, retrying"
            );
        })
        .await?;

        info!(database = %config.database, "Connected to MongoDB");
        Ok(Self::new(client, config, ttl))
    }

    /// Get the database reference.
    pub fn database(&self) -> &Database {
        &self.database
    }

    async fn create_index(&self, index: IndexModel, name: &str) -> Result<()> {
        match self.messages.create_index(index).await {
            Ok(_) => {
                info!(index = name, collection = %self.messages.name(), "Index ensured");
                Ok(())
            }
            Err(e) if is_index_conflict(&e) => {
                info!(index = name, "Index already exists with different options, keeping it");
                Ok(())
            }
            Err(e) => {
                warn!(index = name, error = %e, "Failed to create index");
                Err(e.into())
            }
        }
    }
}

fn is_index_conflict(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        mongodb::error::ErrorKind::Command(ref cmd)
            if cmd.code == INDEX_OPTIONS_CONFLICT || cmd.code == INDEX_KEY_SPECS_CONFLICT
    )
}

/// "majority", a node count, or a custom tag set name.
fn parse_write_concern(value: &str) -> WriteConcern {
    let w = match value.parse::<u32>() {
        Ok(nodes) => Acknowledgment::Nodes(nodes),
        Err(_) if value.eq_ignore_ascii_case("majority") => Acknowledgment::Majority,
        Err(_) => Acknowledgment::Custom(value.to_string()),
    };
    WriteConcern::builder().w(w).build()
}

fn to_chrono(value: &mongodb::bson::DateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value.timestamp_millis())
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {}", value)))
}

/// Parse a stored message document.
pub(crate) fn decode_message(doc: &Document) -> Result<Message> {
    let field = |name: &str, e: mongodb::bson::document::ValueAccessError| {
        StoreError::Decode(format!("{}: {}", name, e))
    };

    let id = doc.get_object_id("_id").map_err(|e| field("_id", e))?;
    let channel = doc.get_str("channel").map_err(|e| field("channel", e))?;
    let payload = doc.get_str("payload").map_err(|e| field("payload", e))?;
    let created_at = doc
        .get_datetime("created_at")
        .map_err(|e| field("created_at", e))?;
    let expires_at = doc
        .get_datetime("expires_at")
        .map_err(|e| field("expires_at", e))?;

    Ok(Message {
        id: MessageId::from_bytes(id.bytes()),
        channel: channel.to_string(),
        payload: payload.to_string(),
        created_at: to_chrono(created_at)?,
        expires_at: to_chrono(expires_at)?,
    })
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn insert(&self, channel: &str, payload: &str) -> Result<MessageId> {
        let id = ObjectId::new();
        let now = mongodb::bson::DateTime::now();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at =
            mongodb::bson::DateTime::from_millis(now.timestamp_millis().saturating_add(ttl_ms));

        let doc = doc! {
            "_id": id,
            "channel": channel,
            "payload": payload,
            "created_at": now,
            "expires_at": expires_at,
        };

        self.messages.insert_one(doc).await?;
        Ok(MessageId::from_bytes(id.bytes()))
    }

    async fn query_after(
        &self,
        cursor: Option<MessageId>,
        channels: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut filter = Document::new();
        if let Some(cursor) = cursor {
            filter.insert("_id", doc! { "$gt": ObjectId::from_bytes(cursor.bytes()) });
        }
        if let Some(channels) = channels {
            filter.insert("channel", doc! { "$in": channels.to_vec() });
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();

        let mut cursor = self.messages.find(filter).with_options(options).await?;

        let mut messages = Vec::new();
        while cursor.advance().await? {
            let doc = cursor.deserialize_current()?;
            messages.push(decode_message(&doc)?);
        }

        Ok(messages)
    }

    async fn latest_id(&self) -> Result<Option<MessageId>> {
        let options = FindOneOptions::builder()
            .sort(doc! { "_id": -1 })
            .projection(doc! { "_id": 1 })
            .build();

        let latest = self
            .messages
            .find_one(doc! {})
            .with_options(options)
            .await?;

        match latest {
            Some(doc) => {
                let id = doc
                    .get_object_id("_id")
                    .map_err(|e| StoreError::Decode(format!("_id: {}", e)))?;
                Ok(Some(MessageId::from_bytes(id.bytes())))
            }
            None => Ok(None),
        }
    }

    async fn supports_change_feed(&self) -> Result<bool> {
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await?;

        let replica_set = hello.get_str("setName").is_ok();
        let sharded = hello.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false);
        Ok(replica_set || sharded)
    }

    async fn open_change_feed(
        &self,
        resume: Option<ResumePosition>,
        channels: Option<&[String]>,
    ) -> Result<Box<dyn ChangeFeed>> {
        let mut stage = doc! { "operationType": "insert" };
        if let Some(channels) = channels {
            stage.insert("fullDocument.channel", doc! { "$in": channels.to_vec() });
        }
        let pipeline = vec![doc! { "$match": stage }];

        let resume_after = resume.as_ref().map(decode_token).transpose()?;
        let options = ChangeStreamOptions::builder()
            .resume_after(resume_after)
            .build();

        let stream = self
            .messages
            .watch()
            .pipeline(pipeline)
            .with_options(options)
            .await
            .map_err(change_feed::classify)?;

        Ok(Box::new(MongoChangeFeed::new(stream)))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ttl_index = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .name(TTL_INDEX.to_string())
                    .expire_after(Duration::ZERO)
                    .build(),
            )
            .build();

        let channel_index = IndexModel::builder()
            .keys(doc! { "channel": 1, "_id": 1 })
            .options(IndexOptions::builder().name(CHANNEL_INDEX.to_string()).build())
            .build();

        // Attempt both even if the first fails.
        let ttl = self.create_index(ttl_index, TTL_INDEX).await;
        let lookup = self.create_index(channel_index, CHANNEL_INDEX).await;
        ttl.and(lookup)
    }
}
