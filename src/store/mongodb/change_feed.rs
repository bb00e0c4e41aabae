//! Change stream reader over the message collection.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use tracing::debug;

use super::decode_message;
use crate::store::{ChangeFeed, FeedEvent, ResumePosition, Result, StoreError};

/// Server codes for a resume token that can no longer be used.
const CHANGE_STREAM_FATAL: i32 = 280;
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;
const INVALID_RESUME_TOKEN: i32 = 260;

/// Map driver errors, separating unusable resume tokens.
pub(super) fn classify(e: mongodb::error::Error) -> StoreError {
    match *e.kind {
        mongodb::error::ErrorKind::Command(ref cmd)
            if matches!(
                cmd.code,
                CHANGE_STREAM_FATAL | CHANGE_STREAM_HISTORY_LOST | INVALID_RESUME_TOKEN
            ) =>
        {
            StoreError::ResumeInvalid(e.to_string())
        }
        _ => StoreError::Mongo(e),
    }
}

pub(super) fn encode_token(token: &ResumeToken) -> Result<ResumePosition> {
    mongodb::bson::to_vec(token)
        .map(ResumePosition::new)
        .map_err(|e| StoreError::ChangeFeed(format!("failed to encode resume token: {}", e)))
}

pub(super) fn decode_token(position: &ResumePosition) -> Result<ResumeToken> {
    mongodb::bson::from_slice(position.as_bytes())
        .map_err(|e| StoreError::ChangeFeed(format!("failed to decode resume token: {}", e)))
}

/// Open change stream. Dropping the stream kills the server cursor.
pub(super) struct MongoChangeFeed {
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

impl MongoChangeFeed {
    pub(super) fn new(stream: ChangeStream<ChangeStreamEvent<Document>>) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn next(&mut self, max_wait: Duration) -> Result<Option<FeedEvent>> {
        let stream = self.stream.as_mut().ok_or(StoreError::FeedClosed)?;

        // next_if_any returns after a single getMore, empty or not.
        let event = match tokio::time::timeout(max_wait, stream.next_if_any()).await {
            Err(_) => return Ok(None),
            Ok(result) => match result.map_err(classify)? {
                Some(event) => event,
                None => return Ok(None),
            },
        };

        if event.operation_type != OperationType::Insert {
            debug!(operation = ?event.operation_type, "Ignoring non-insert change event");
            return Ok(None);
        }

        let doc = event
            .full_document
            .ok_or_else(|| StoreError::Decode("insert event without fullDocument".to_string()))?;

        Ok(Some(FeedEvent {
            message: decode_message(&doc)?,
            resume: Some(encode_token(&event.id)?),
        }))
    }

    fn resume_position(&self) -> Option<ResumePosition> {
        self.stream
            .as_ref()
            .and_then(|s| s.resume_token())
            .and_then(|t| encode_token(&t).ok())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.take();
        Ok(())
    }
}
