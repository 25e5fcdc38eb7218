// SPDX-License-Identifier: MIT OR Apache-2.0
//! The resume loop.
//!
//! A periodic tick owned by the scheduler for the service's lifetime:
//! started at boot, stopped through the cancellation token on
//! shutdown. Uses a monotonic interval, not wall-clock arithmetic.

use std::sync::Arc;
use steward_core::cancel::CancelToken;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{DispatchSink, Scheduler};

/// Handle to the running resume loop.
pub struct ResumeLoop {
    handle: JoinHandle<()>,
    cancel: CancelToken,
}

impl ResumeLoop {
    /// Start the loop. Each tick runs one [`Scheduler::resume_pass`].
    #[must_use]
    pub fn start(
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn DispatchSink>,
        cancel: CancelToken,
    ) -> Self {
        let interval = scheduler.config().resume_interval();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = loop_cancel.cancelled() => {
                        debug!(target: "steward.scheduler.resume", "resume loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match scheduler.resume_pass(sink.as_ref()).await {
                            Ok(0) => {}
                            Ok(resumed) => {
                                debug!(
                                    target: "steward.scheduler.resume",
                                    resumed,
                                    "resume tick complete"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    target: "steward.scheduler.resume",
                                    error = %e,
                                    "resume tick failed"
                                );
                            }
                        }
                    }
                }
            }
        });
        Self { handle, cancel }
    }

    /// Stop the loop and wait for the in-flight tick to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
