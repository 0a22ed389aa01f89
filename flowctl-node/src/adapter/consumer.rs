use std::sync::Arc;

use flowctl_common::mailbox::MailboxReceiver;
use flowctl_tc::{handle::band_for_priority, requests::BucketConfig, ErrorClass, KernelError};
use flowctl_wire::rpc::Action;
use thiserror::Error;
use tokio::task::AbortHandle;

use super::{AdapterStats, QdiscBackend};

/// Why the consumer gave up on the kernel.
#[derive(Debug, Error)]
enum Escalation {
    #[error("unrecoverable kernel error: {0}")]
    Fatal(KernelError),
    #[error("too many consecutive kernel errors, last: {0}")]
    TooManyErrors(KernelError),
}

/// Drains the mailbox and applies every action it finds to the kernel.
pub(super) struct Consumer<B> {
    pub(super) backend: B,
    pub(super) interfaces: Vec<u32>,
    pub(super) bucket: BucketConfig,
    pub(super) max_transient_errors: usize,
    /// Consecutive transient errors so far.
    pub(super) transient_errors: usize,
    pub(super) from_listener: MailboxReceiver<Action>,
    /// Stopped when the kernel becomes unusable.
    pub(super) listener: AbortHandle,
    pub(super) stats: Arc<AdapterStats>,
}

impl<B: QdiscBackend> Consumer<B> {
    pub(super) async fn run(mut self) {
        while let Some(action) = self.from_listener.recv().await {
            if let Err(escalation) = self.apply(action).await {
                tracing::error!(%escalation, "kernel unusable, stopping traffic adapter");
                self.listener.abort();
                break;
            }
        }

        self.backend.close().await;
        tracing::debug!("adapter consumer stopped");
    }

    async fn apply(&mut self, action: Action) -> Result<(), Escalation> {
        if action.rate_bps == 0 {
            tracing::warn!(?action, "refusing zero rate");
            return Ok(());
        }

        let band = band_for_priority(action.priority);
        tracing::debug!(?action, band, "applying action");

        for if_index in self.interfaces.clone() {
            let result =
                self.backend.set_band_rate(if_index, band, action.rate_bps, self.bucket).await;

            match result {
                Ok(()) => self.transient_errors = 0,
                Err(e) => match e.class() {
                    ErrorClass::Absent => {
                        tracing::debug!(?e, if_index, "nothing to change, ignoring");
                    }
                    ErrorClass::Fatal => return Err(Escalation::Fatal(e)),
                    ErrorClass::Transient => {
                        self.transient_errors += 1;
                        tracing::warn!(
                            ?e,
                            if_index,
                            errors = self.transient_errors,
                            "failed to apply action"
                        );

                        if self.transient_errors > self.max_transient_errors {
                            return Err(Escalation::TooManyErrors(e));
                        }
                    }
                },
            }
        }

        self.stats.increment_applied();

        Ok(())
    }
}
