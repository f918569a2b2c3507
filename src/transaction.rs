use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// Commit/rollback protocol supplied by each backend. Backends without a
/// native transaction concept (maildir) implement begin/commit as no-ops and
/// rollback as a best-effort discard.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Scoped unit of work around backend operations. One runner lives in each
/// mapper; a mapper is confined to its session, so the depth counter only
/// ever sees one task, but it still releases correctly when the work future
/// is cancelled mid-frame.
pub struct TransactionRunner {
    depth: AtomicUsize,
}

impl Default for TransactionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRunner {
    pub fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
        }
    }

    /// Run `work` inside a transaction frame: begin, then commit on success
    /// or rollback on failure. Re-entrant calls join the outermost frame
    /// instead of opening a new one. A rollback failure is logged and the
    /// original error is kept.
    pub async fn execute<B, T>(
        &self,
        backend: &B,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T>
    where
        B: TransactionBackend + ?Sized,
    {
        let frame = FrameGuard::enter(&self.depth);
        if !frame.outermost {
            return work.await;
        }

        backend.begin().await?;

        match work.await {
            Ok(value) => {
                backend.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = backend.rollback().await {
                    tracing::warn!(
                        error = %rollback_err,
                        "rollback failed after {}", err
                    );
                }
                Err(err)
            }
        }
    }
}

struct FrameGuard<'a> {
    depth: &'a AtomicUsize,
    outermost: bool,
}

impl<'a> FrameGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        let previous = depth.fetch_add(1, Ordering::AcqRel);
        Self {
            depth,
            outermost: previous == 0,
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn storage_error(msg: &str) -> MailboxError {
        MailboxError::Storage(anyhow::anyhow!("{}", msg))
    }

    #[derive(Default)]
    struct Trace {
        calls: Mutex<Vec<&'static str>>,
        fail_commit: bool,
    }

    #[async_trait]
    impl TransactionBackend for Trace {
        async fn begin(&self) -> Result<()> {
            self.calls.lock().unwrap().push("begin");
            Ok(())
        }
        async fn commit(&self) -> Result<()> {
            self.calls.lock().unwrap().push("commit");
            if self.fail_commit {
                return Err(storage_error("commit refused"));
            }
            Ok(())
        }
        async fn rollback(&self) -> Result<()> {
            self.calls.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn commits_on_success() {
        let backend = Trace::default();
        let runner = TransactionRunner::new();
        let out = runner.execute(&backend, async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
        assert_eq!(*backend.calls.lock().unwrap(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn rolls_back_on_failure() {
        let backend = Trace::default();
        let runner = TransactionRunner::new();
        let out: Result<()> = runner
            .execute(&backend, async { Err(storage_error("boom")) })
            .await;
        assert!(out.is_err());
        assert_eq!(*backend.calls.lock().unwrap(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn nested_execute_reuses_the_outer_frame() {
        let backend = Trace::default();
        let runner = TransactionRunner::new();
        let touched = AtomicU32::new(0);

        runner
            .execute(&backend, async {
                runner
                    .execute(&backend, async {
                        touched.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(touched.load(Ordering::SeqCst), 1);
        // One begin, one commit: the inner frame did not open its own
        assert_eq!(*backend.calls.lock().unwrap(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn commit_failure_surfaces_as_error() {
        let backend = Trace {
            fail_commit: true,
            ..Default::default()
        };
        let runner = TransactionRunner::new();
        let out = runner.execute(&backend, async { Ok(()) }).await;
        assert!(out.is_err());
    }
}
