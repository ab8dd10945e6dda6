//! 异步轮换编排器
//!
//! 密钥轮换在阻塞线程上执行，完成后再用 `Semaphore` 限流、`JoinSet`
//! 并发地重新加密各个文档。
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{CancellationFlag, Outcome, ReencryptionReport};
use crate::common::config::SweepConfig;
use crate::error::Error;
use crate::lifecycle::KeyLifecycleManager;

/// [`DocumentStore`](super::DocumentStore) 的异步版本
#[async_trait]
pub trait AsyncDocumentStore: Send + Sync + 'static {
    type Document: Send;
    type Error: Display + Send;

    async fn get(&self, id: &str) -> Result<Self::Document, Self::Error>;

    async fn put(&self, id: &str, document: Self::Document) -> Result<(), Self::Error>;
}

pub struct AsyncRotationOrchestrator<S: AsyncDocumentStore> {
    manager: Arc<KeyLifecycleManager>,
    store: Arc<S>,
    max_parallelism: usize,
}

impl<S: AsyncDocumentStore> AsyncRotationOrchestrator<S> {
    pub fn new(
        manager: Arc<KeyLifecycleManager>,
        store: Arc<S>,
        config: &SweepConfig,
    ) -> Result<Self, Error> {
        if config.max_parallelism == 0 {
            return Err(Error::Config(
                "sweep.max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            manager,
            store,
            max_parallelism: config.max_parallelism,
        })
    }

    pub async fn rotate_and_reencrypt(
        &self,
        document_ids: &[String],
    ) -> Result<ReencryptionReport, Error> {
        self.rotate_and_reencrypt_until(document_ids, &CancellationFlag::new())
            .await
    }

    /// 轮换密钥后并发重新加密文档；`cancel` 置位后不再启动新的文档。
    pub async fn rotate_and_reencrypt_until(
        &self,
        document_ids: &[String],
        cancel: &CancellationFlag,
    ) -> Result<ReencryptionReport, Error> {
        let manager = Arc::clone(&self.manager);
        let rotation = tokio::task::spawn_blocking(move || manager.rotate_keys()).await??;
        info!(
            new_key_id = %rotation.new_active,
            documents = document_ids.len(),
            "starting async re-encryption sweep"
        );

        // 未完成的任务（例如发生 panic）保持为失败
        let mut outcomes = vec![Outcome::Failed; document_ids.len()];
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let mut tasks = JoinSet::new();

        for (index, id) in document_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                outcomes[index] = Outcome::Skipped;
                continue;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                outcomes[index] = Outcome::Skipped;
                continue;
            };
            // 等待许可期间可能已被取消
            if cancel.is_cancelled() {
                outcomes[index] = Outcome::Skipped;
                continue;
            }

            let store = Arc::clone(&self.store);
            let id = id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = reencrypt_document(store.as_ref(), &id).await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(e) => warn!(error = %e, "document re-encryption task aborted"),
            }
        }

        let report = ReencryptionReport::from_outcomes(document_ids, &outcomes, rotation);
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "async re-encryption sweep finished"
        );
        Ok(report)
    }
}

async fn reencrypt_document<S: AsyncDocumentStore>(store: &S, id: &str) -> Outcome {
    let document = match store.get(id).await {
        Ok(document) => document,
        Err(e) => {
            warn!(document_id = id, error = %e, "document fetch failed");
            return Outcome::Failed;
        }
    };
    match store.put(id, document).await {
        Ok(()) => {
            debug!(document_id = id, "document re-encrypted");
            Outcome::Succeeded
        }
        Err(e) => {
            warn!(document_id = id, error = %e, "document store failed");
            Outcome::Failed
        }
    }
}
