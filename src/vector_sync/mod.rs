//! Vector Index Sync: best-effort mirror of persisted observations/summaries
//! into a vector index, fire-and-forget.
//!
//! Grounded on `memory/storage/qdrant/multi_store.rs` (`Qdrant::from_url`,
//! `skip_compatibility_check`, `ensure_collection`, `UpsertPointsBuilder`).
//! Computing embeddings is out of scope here; this only keeps the
//! collection's payload fields mirrored so a downstream embedding job can
//! pick rows up, using a zero vector as a placeholder.

use anyhow::{Context, Result};
use qdrant_client::qdrant::{CreateCollectionBuilder, Distance, PointStruct, UpsertPointsBuilder, VectorParamsBuilder};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::VectorIndexConfig;
use crate::model::{ObservationPayload, SummaryPayload};

const PLACEHOLDER_DIM: u64 = 8;

#[async_trait::async_trait]
pub trait VectorIndexSync: Send + Sync {
    async fn sync_observation(
        &self,
        id: i64,
        session_id: i64,
        project: &str,
        payload: &ObservationPayload,
        prompt_number: Option<i64>,
        created_at_epoch: i64,
        discovery_tokens: i64,
    );

    async fn sync_summary(
        &self,
        id: i64,
        session_id: i64,
        project: &str,
        payload: &SummaryPayload,
        created_at_epoch: i64,
    );
}

pub struct QdrantVectorIndexSync {
    client: Qdrant,
    collection: String,
}

impl QdrantVectorIndexSync {
    pub async fn connect(config: &VectorIndexConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("vector index url not configured")?;
        let client = tokio::time::timeout(config.connect_timeout, async {
            Qdrant::from_url(url).skip_compatibility_check().build()
        })
        .await
        .context("vector index connect timed out")??;

        let sync = Self {
            client,
            collection: config.collection.clone(),
        };
        sync.ensure_collection().await?;
        Ok(sync)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self.client.collection_exists(&self.collection).await?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(PLACEHOLDER_DIM, Distance::Cosine)),
                )
                .await
                .context("failed to create vector index collection")?;
        }
        Ok(())
    }

    async fn upsert(&self, point_id: u64, payload: serde_json::Value) -> Result<()> {
        let vector: Vec<f32> = vec![0.0; PLACEHOLDER_DIM as usize];
        let payload: Payload = payload.try_into().context("payload must be a JSON object")?;
        let point = PointStruct::new(point_id, vector, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .context("failed to upsert vector index point")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorIndexSync for QdrantVectorIndexSync {
    async fn sync_observation(
        &self,
        id: i64,
        session_id: i64,
        project: &str,
        payload: &ObservationPayload,
        prompt_number: Option<i64>,
        created_at_epoch: i64,
        discovery_tokens: i64,
    ) {
        let body = json!({
            "kind": "observation",
            "session_id": session_id,
            "project": project,
            "type": payload.r#type,
            "title": payload.title,
            "text": payload.text,
            "prompt_number": prompt_number,
            "created_at_epoch": created_at_epoch,
            "discovery_tokens": discovery_tokens,
        });
        if let Err(e) = self.upsert(id as u64, body).await {
            warn!("vector sync failed for observation {}: {:?}", id, e);
        } else {
            debug!("vector sync committed observation {}", id);
        }
    }

    async fn sync_summary(
        &self,
        id: i64,
        session_id: i64,
        project: &str,
        payload: &SummaryPayload,
        created_at_epoch: i64,
    ) {
        let body = json!({
            "kind": "summary",
            "session_id": session_id,
            "project": project,
            "request": payload.request,
            "learned": payload.learned,
            "created_at_epoch": created_at_epoch,
        });
        // Summary ids share the observations collection's id space in name
        // only; offset to avoid colliding with observation point ids.
        if let Err(e) = self.upsert((id as u64) | (1u64 << 62), body).await {
            warn!("vector sync failed for summary {}: {:?}", id, e);
        } else {
            debug!("vector sync committed summary {}", id);
        }
    }
}

/// Used when no vector index url is configured. The rest of the pipeline
/// never needs to know the mirror is disabled.
pub struct NoopVectorIndexSync;

#[async_trait::async_trait]
impl VectorIndexSync for NoopVectorIndexSync {
    async fn sync_observation(
        &self,
        _id: i64,
        _session_id: i64,
        _project: &str,
        _payload: &ObservationPayload,
        _prompt_number: Option<i64>,
        _created_at_epoch: i64,
        _discovery_tokens: i64,
    ) {
    }

    async fn sync_summary(
        &self,
        _id: i64,
        _session_id: i64,
        _project: &str,
        _payload: &SummaryPayload,
        _created_at_epoch: i64,
    ) {
    }
}

/// Spawns the sync as a detached background task so the orchestrator never
/// awaits completion on its critical path; failures are swallowed by the
/// trait methods themselves.
pub fn spawn_observation_sync(
    sync: Arc<dyn VectorIndexSync>,
    id: i64,
    session_id: i64,
    project: String,
    payload: ObservationPayload,
    prompt_number: Option<i64>,
    created_at_epoch: i64,
    discovery_tokens: i64,
) {
    tokio::spawn(async move {
        sync.sync_observation(
            id,
            session_id,
            &project,
            &payload,
            prompt_number,
            created_at_epoch,
            discovery_tokens,
        )
        .await;
    });
}

pub fn spawn_summary_sync(
    sync: Arc<dyn VectorIndexSync>,
    id: i64,
    session_id: i64,
    project: String,
    payload: SummaryPayload,
    created_at_epoch: i64,
) {
    tokio::spawn(async move {
        sync.sync_summary(id, session_id, &project, &payload, created_at_epoch)
            .await;
    });
}
