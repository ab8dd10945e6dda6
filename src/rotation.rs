//! 密钥轮换编排
//!
//! 先执行一次密钥轮换，再把调用方给出的文档逐个重新加密到新的 `Active`
//! 密钥下。单个文档的失败只记录在该文档上，不会中止整个批次。
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::common::config::SweepConfig;
use crate::error::Error;
use crate::lifecycle::{KeyLifecycleManager, RotationSummary};

#[cfg(feature = "async")]
pub mod async_;
pub mod sweep;

#[cfg(feature = "async")]
pub use async_::{AsyncDocumentStore, AsyncRotationOrchestrator};

/// 文档存储协作方
///
/// `get` 返回已解密的文档，`put` 负责用当前密钥重新加密并持久化。
/// 加解密本身委托给 [`KeyLifecycleManager`]。
pub trait DocumentStore: Send + Sync {
    type Document: Send;
    type Error: Display + Send;

    fn get(&self, id: &str) -> Result<Self::Document, Self::Error>;

    fn put(&self, id: &str, document: Self::Document) -> Result<(), Self::Error>;
}

/// Cooperative stop signal for a running sweep.
///
/// Checked before each document starts; a document already in flight always
/// finishes its fetch and store.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one document during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of a rotation sweep. Ids keep their input order.
#[derive(Debug, Clone)]
pub struct ReencryptionReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Not started because the sweep was cancelled.
    pub skipped: Vec<String>,
    pub rotation: RotationSummary,
}

impl ReencryptionReport {
    pub(crate) fn from_outcomes(
        ids: &[String],
        outcomes: &[Outcome],
        rotation: RotationSummary,
    ) -> Self {
        let mut report = Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            rotation,
        };
        for (id, outcome) in ids.iter().zip(outcomes) {
            let bucket = match outcome {
                Outcome::Succeeded => &mut report.succeeded,
                Outcome::Failed => &mut report.failed,
                Outcome::Skipped => &mut report.skipped,
            };
            bucket.push(id.clone());
        }
        report
    }

    /// `(succeeded, failed)`
    pub fn into_parts(self) -> (Vec<String>, Vec<String>) {
        (self.succeeded, self.failed)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// 轮换编排器
///
/// 自身不持有任何状态，只协调 [`KeyLifecycleManager`] 与 [`DocumentStore`]。
pub struct RotationOrchestrator<S: DocumentStore> {
    manager: Arc<KeyLifecycleManager>,
    store: Arc<S>,
    sweeper: sweep::Sweeper,
}

impl<S: DocumentStore> RotationOrchestrator<S> {
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
            sweeper: sweep::Sweeper::new(config.max_parallelism)?,
        })
    }

    /// 轮换密钥并重新加密给定文档，返回成功与失败的文档 ID。
    ///
    /// 只有轮换本身失败时整个调用才失败，此时不会触碰任何文档。
    pub fn rotate_and_reencrypt(
        &self,
        document_ids: &[String],
    ) -> Result<ReencryptionReport, Error> {
        self.rotate_and_reencrypt_until(document_ids, &CancellationFlag::new())
    }

    /// Like [`rotate_and_reencrypt`](Self::rotate_and_reencrypt), but stops
    /// starting new documents once `cancel` is set.
    pub fn rotate_and_reencrypt_until(
        &self,
        document_ids: &[String],
        cancel: &CancellationFlag,
    ) -> Result<ReencryptionReport, Error> {
        let rotation = self.manager.rotate_keys()?;
        info!(
            new_key_id = %rotation.new_active,
            documents = document_ids.len(),
            "starting re-encryption sweep"
        );

        let outcomes = self.sweeper.run(document_ids, cancel, |id| {
            reencrypt_document(self.store.as_ref(), id)
        });
        let report = ReencryptionReport::from_outcomes(document_ids, &outcomes, rotation);

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "re-encryption sweep finished"
        );
        Ok(report)
    }
}

/// Fetches (decrypting) and stores again (re-encrypting) a single document.
///
/// Never propagates: errors and panics become `Outcome::Failed`.
pub(crate) fn reencrypt_document<S: DocumentStore + ?Sized>(store: &S, id: &str) -> Outcome {
    let attempt = catch_unwind(AssertUnwindSafe(|| -> Result<(), String> {
        let document = store.get(id).map_err(|e| format!("fetch failed: {e}"))?;
        store
            .put(id, document)
            .map_err(|e| format!("store failed: {e}"))
    }));

    match attempt {
        Ok(Ok(())) => {
            debug!(document_id = id, "document re-encrypted");
            Outcome::Succeeded
        }
        Ok(Err(reason)) => {
            warn!(document_id = id, %reason, "document re-encryption failed");
            Outcome::Failed
        }
        Err(_) => {
            warn!(document_id = id, "document re-encryption panicked");
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn summary() -> RotationSummary {
        RotationSummary {
            new_active: Uuid::new_v4(),
            new_version: 2,
            demoted: None,
            disabled: Vec::new(),
            deleted: Vec::new(),
        }
    }

    struct Flaky;

    impl DocumentStore for Flaky {
        type Document = String;
        type Error = String;

        fn get(&self, id: &str) -> Result<String, String> {
            match id {
                "missing" => Err("no such document".to_string()),
                "boom" => panic!("collaborator bug"),
                _ => Ok(id.to_string()),
            }
        }

        fn put(&self, id: &str, _document: String) -> Result<(), String> {
            if id == "readonly" {
                Err("write refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn single_document_outcomes() {
        assert_eq!(reencrypt_document(&Flaky, "doc"), Outcome::Succeeded);
        assert_eq!(reencrypt_document(&Flaky, "missing"), Outcome::Failed);
        assert_eq!(reencrypt_document(&Flaky, "readonly"), Outcome::Failed);
        assert_eq!(reencrypt_document(&Flaky, "boom"), Outcome::Failed);
    }

    #[test]
    fn report_partitions_in_input_order() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let outcomes = [
            Outcome::Failed,
            Outcome::Succeeded,
            Outcome::Skipped,
            Outcome::Succeeded,
        ];
        let report = ReencryptionReport::from_outcomes(&ids, &outcomes, summary());
        assert_eq!(report.skipped, vec!["c"]);
        assert!(!report.is_complete());

        let (succeeded, failed) = report.into_parts();
        assert_eq!(succeeded, vec!["b", "d"]);
        assert_eq!(failed, vec!["a"]);
    }

    #[test]
    fn cancellation_flag_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }
}
