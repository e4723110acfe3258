use std::sync::PoisonError;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareOutcome {
    /// The controller cleared its update flag. `version` is the firmware it
    /// reports afterwards.
    Completed { version: Option<String> },
    /// The flag was still set after the last check.
    TimedOut,
}

/// Watches a flash started by [`Coordinator::install_firmware`]. Dropping the
/// handle stops the watch.
pub struct FirmwareMonitor {
    handle: Option<JoinHandle<FirmwareOutcome>>,
}

impl FirmwareMonitor {
    /// `None` when the monitor was cancelled or aborted by shutdown.
    pub async fn wait(mut self) -> Option<FirmwareOutcome> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for FirmwareMonitor {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Coordinator {
    /// True while a monitor started by [`Coordinator::install_firmware`] runs.
    pub fn firmware_installing(&self) -> bool {
        self.inner
            .firmware
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Refreshes, checks that the controller offers an update, triggers the
    /// flash and starts watching for completion.
    pub async fn install_firmware(&self) -> Result<FirmwareMonitor> {
        if self.firmware_installing() {
            return Err(Error::UpdateInProgress);
        }

        self.request_refresh().await?;
        let common = self.common();
        if !common.update_available() {
            return Err(Error::NoUpdateAvailable);
        }
        info!(
            installed = ?common.firmware_version(),
            candidate = ?common.candidate_version(),
            "starting firmware update"
        );

        self.inner
            .client
            .flash_firmware(self.inner.timing.flash_timeout)
            .await?;

        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.monitor_firmware().await });
        *self
            .inner
            .firmware
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());

        Ok(FirmwareMonitor {
            handle: Some(handle),
        })
    }

    async fn monitor_firmware(&self) -> FirmwareOutcome {
        let timing = &self.inner.timing;
        tokio::time::sleep(timing.firmware_initial_wait).await;

        for check in 1..=timing.firmware_max_checks {
            debug!(check, of = timing.firmware_max_checks, "checking firmware update progress");
            // The controller reboots while flashing; failed refreshes are expected.
            if let Err(e) = self.request_refresh().await {
                debug!(error = %e, "refresh during firmware update failed");
            } else if !self.common().update_flag() {
                let version = self.common().firmware_version();
                info!(version = ?version, "firmware update finished");
                return FirmwareOutcome::Completed { version };
            }
            if check < timing.firmware_max_checks {
                tokio::time::sleep(timing.firmware_check_interval).await;
            }
        }

        warn!(
            checks = timing.firmware_max_checks,
            "firmware update did not finish in time"
        );
        FirmwareOutcome::TimedOut
    }
}
