//! 文档扫描执行器
//!
//! 启用 `parallel` 特性时在专用的 Rayon 线程池上并发处理文档，
//! 否则按顺序处理。两种方式的结果都按输入顺序返回。
use super::{CancellationFlag, Outcome};
use crate::error::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub(crate) struct Sweeper {
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl Sweeper {
    #[cfg(feature = "parallel")]
    pub(crate) fn new(max_parallelism: usize) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_parallelism)
            .thread_name(|i| format!("reencrypt-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot build sweep thread pool: {e}")))?;
        Ok(Self { pool })
    }

    #[cfg(not(feature = "parallel"))]
    pub(crate) fn new(_max_parallelism: usize) -> Result<Self, Error> {
        Ok(Self {})
    }

    /// Runs `work` for every id not reached by cancellation.
    #[cfg(feature = "parallel")]
    pub(crate) fn run<F>(&self, ids: &[String], cancel: &CancellationFlag, work: F) -> Vec<Outcome>
    where
        F: Fn(&str) -> Outcome + Sync,
    {
        self.pool.install(|| {
            ids.par_iter()
                .map(|id| {
                    if cancel.is_cancelled() {
                        Outcome::Skipped
                    } else {
                        work(id)
                    }
                })
                .collect()
        })
    }

    #[cfg(not(feature = "parallel"))]
    pub(crate) fn run<F>(&self, ids: &[String], cancel: &CancellationFlag, work: F) -> Vec<Outcome>
    where
        F: Fn(&str) -> Outcome + Sync,
    {
        ids.iter()
            .map(|id| {
                if cancel.is_cancelled() {
                    Outcome::Skipped
                } else {
                    work(id)
                }
            })
            .collect()
    }
}
