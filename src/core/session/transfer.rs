//! Transfer pipeline
//! Drives the single active upload (background image or `.bin` package) and
//! the watch face selection commands that share its exclusivity.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::{
    CommandReply, FileTransferEvent, TRANSFER_ERROR_TIMEOUT, Transport, VendorCommand,
};
use crate::core::session::channel::EventChannel;
use crate::core::session::transcode::transcode_background;
use crate::core::session::types::{
    ErrorEvent, ErrorKind, TransferJobKind, TransferProgress, TransferState,
};
use crate::error::BridgeError;

const BIN_EXTENSION: &str = "bin";

/// One upload, from request to terminal state
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: u64,
    pub kind: TransferJobKind,
    pub source: PathBuf,
    /// -1 until the first progress value arrives
    pub progress: i32,
    pub state: TransferState,
    /// Encoded primary raster of an image job, dropped on failure
    pub preview: Option<Vec<u8>>,
}

impl TransferJob {
    fn report(&self) -> TransferProgress {
        TransferProgress {
            job_id: self.id,
            kind: self.kind,
            progress: self.progress,
            state: self.state,
        }
    }

    fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Default)]
struct Slot {
    /// The active job, or the last finished one
    job: Option<TransferJob>,
    face_op: bool,
    watchdog: Option<CancellationToken>,
    last_id: u64,
}

impl Slot {
    fn is_busy(&self) -> bool {
        self.face_op || self.job.as_ref().is_some_and(TransferJob::is_active)
    }

    fn disarm(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }
}

/// Clears the face operation flag however the operation ends
struct FaceOpGuard<'a>(&'a Mutex<Slot>);

impl Drop for FaceOpGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap().face_op = false;
    }
}

pub struct TransferPipeline {
    transport: Arc<dyn Transport>,
    transfer_timeout: Duration,
    slot: Mutex<Slot>,
    progress: EventChannel<TransferProgress>,
    errors: Arc<EventChannel<ErrorEvent>>,
}

impl TransferPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        transfer_timeout: Duration,
        errors: Arc<EventChannel<ErrorEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            transfer_timeout,
            slot: Mutex::new(Slot::default()),
            progress: EventChannel::new(),
            errors,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// The active job, or the last finished one
    pub fn current_job(&self) -> Option<TransferJob> {
        self.slot.lock().unwrap().job.clone()
    }

    pub fn preview(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap().job.as_ref().and_then(|job| job.preview.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().unwrap().is_busy()
    }

    /// Transcodes `path` and submits it as the watch background.
    /// Returns the job id once the transport accepted the command.
    pub async fn upload_image(self: &Arc<Self>, path: &Path) -> Result<u64, BridgeError> {
        let job_id = self.reserve(TransferJobKind::ImageBackground, path)?;

        let source = path.to_path_buf();
        let transcoded = match tokio::task::spawn_blocking(move || transcode_background(&source)).await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::Task(e)),
        };
        let background = match transcoded {
            Ok(background) => background,
            Err(e) => {
                warn!("Image job {} rejected: {}", job_id, e);
                self.finish(job_id, TransferState::Failed, None);
                return Err(e);
            }
        };

        self.update(job_id, |job| job.preview = Some(background.primary.clone()));
        let command = VendorCommand::SendBackgroundImage {
            image: background,
            timeout_secs: self.transfer_timeout.as_secs(),
        };
        self.submit(job_id, command).await?;
        Ok(job_id)
    }

    /// Forwards a `.bin` watch face package unmodified
    pub async fn upload_bin(self: &Arc<Self>, path: &Path, index: i32) -> Result<u64, BridgeError> {
        let is_bin = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(BIN_EXTENSION));
        if !is_bin {
            return Err(BridgeError::WrongExtension {
                path: path.to_path_buf(),
                expected: BIN_EXTENSION,
            });
        }
        if !path.is_file() {
            return Err(BridgeError::FileNotFound(path.to_path_buf()));
        }

        let job_id = self.reserve(TransferJobKind::BinPackage, path)?;
        let command = VendorCommand::SendBinPackage {
            path: path.to_path_buf(),
            index,
            timeout_secs: self.transfer_timeout.as_secs(),
        };
        self.submit(job_id, command).await?;
        Ok(job_id)
    }

    /// Starts a job in PREPARING, or fails with `Busy`
    fn reserve(&self, kind: TransferJobKind, path: &Path) -> Result<u64, BridgeError> {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_busy() {
            info!("Upload of {:?} rejected, pipeline busy", path);
            return Err(BridgeError::Busy);
        }
        slot.last_id += 1;
        let job = TransferJob {
            id: slot.last_id,
            kind,
            source: path.to_path_buf(),
            progress: -1,
            state: TransferState::Preparing,
            preview: None,
        };
        info!("Transfer job {} ({:?}) for {:?}", job.id, kind, path);
        self.progress.publish(job.report());
        slot.job = Some(job);
        Ok(slot.last_id)
    }

    async fn submit(self: &Arc<Self>, job_id: u64, command: VendorCommand) -> Result<(), BridgeError> {
        self.arm_watchdog(job_id);
        if let Err(e) = self.transport.send_command(command).await {
            warn!("Transfer job {} refused by transport: {}", job_id, e);
            if self.finish(job_id, TransferState::Failed, None) {
                self.errors.publish(ErrorEvent::new(
                    ErrorKind::Transport,
                    format!("transfer failed: {}", e),
                ));
            }
            return Err(BridgeError::Transport(e));
        }
        Ok(())
    }

    fn arm_watchdog(self: &Arc<Self>, job_id: u64) {
        let token = CancellationToken::new();
        {
            let mut slot = self.slot.lock().unwrap();
            slot.disarm();
            slot.watchdog = Some(token.clone());
        }

        let this = self.clone();
        let transfer_timeout = self.transfer_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(transfer_timeout) => {
                    if this.finish(job_id, TransferState::Failed, None) {
                        warn!("Transfer job {} timed out after {:?}", job_id, transfer_timeout);
                        this.errors.publish(
                            ErrorEvent::new(ErrorKind::Timeout, "transfer timed out")
                                .with_code(TRANSFER_ERROR_TIMEOUT),
                        );
                        if let Err(e) = this.transport.send_command(VendorCommand::CancelTransfer).await {
                            warn!("Failed to stop timed out transfer {}: {}", job_id, e);
                        }
                    }
                }
                _ = token.cancelled() => debug!("Watchdog of job {} disarmed", job_id),
            }
        });
    }

    /// Applies one transport progress notification to the active job
    pub fn handle_event(&self, event: FileTransferEvent) {
        let job_id = {
            let slot = self.slot.lock().unwrap();
            match slot.job.as_ref() {
                Some(job) if job.is_active() => job.id,
                Some(job) => {
                    debug!(
                        "Ignoring progress {} after job {} ended {:?}",
                        event.progress, job.id, job.state
                    );
                    return;
                }
                None => {
                    debug!("Ignoring progress {} without a job", event.progress);
                    return;
                }
            }
        };

        if event.error.is_some() || event.progress < 0 {
            let code = event.error.unwrap_or(event.progress);
            if self.finish(job_id, TransferState::Failed, Some(event.progress)) {
                warn!("Transfer job {} failed with code {}", job_id, code);
                self.errors.publish(
                    ErrorEvent::new(ErrorKind::Transport, "transfer failed").with_code(code),
                );
            }
        } else if event.progress >= 100 {
            if self.finish(job_id, TransferState::Complete, Some(event.progress)) {
                info!("Transfer job {} complete", job_id);
            }
        } else {
            self.update(job_id, |job| {
                job.progress = event.progress;
                job.state = TransferState::InProgress;
            });
        }
    }

    /// Fails the active job without an error event, e.g. after link loss
    /// was already reported
    pub fn abort(&self, reason: &str) {
        let job_id = match self.slot.lock().unwrap().job.as_ref() {
            Some(job) if job.is_active() => job.id,
            _ => return,
        };
        if self.finish(job_id, TransferState::Failed, None) {
            info!("Transfer job {} aborted: {}", job_id, reason);
        }
    }

    /// Mutates and republishes job `job_id` while it is still active
    fn update(&self, job_id: u64, apply: impl FnOnce(&mut TransferJob)) -> bool {
        let mut slot = self.slot.lock().unwrap();
        match slot.job.as_mut() {
            Some(job) if job.id == job_id && job.is_active() => {
                apply(job);
                self.progress.publish(job.report());
                true
            }
            _ => false,
        }
    }

    /// Moves job `job_id` to a terminal state. Returns false if it already had one.
    fn finish(&self, job_id: u64, state: TransferState, progress: Option<i32>) -> bool {
        let mut slot = self.slot.lock().unwrap();
        let finished = match slot.job.as_mut() {
            Some(job) if job.id == job_id && job.is_active() => {
                job.state = state;
                if let Some(progress) = progress {
                    job.progress = progress;
                }
                if state == TransferState::Failed {
                    job.preview = None;
                }
                self.progress.publish(job.report());
                true
            }
            _ => false,
        };
        if finished {
            slot.disarm();
        }
        finished
    }

    /// Reads the selected built-in watch face
    pub async fn get_display_face(&self) -> Result<i32, BridgeError> {
        let _guard = self.begin_face_op()?;
        match self.transport.send_command(VendorCommand::QueryDisplayFace).await? {
            CommandReply::DisplayFace(index) => Ok(index),
            other => Err(BridgeError::Transport(anyhow::anyhow!(
                "unexpected reply to display face query: {:?}",
                other
            ))),
        }
    }

    /// Selects a built-in watch face
    pub async fn set_display_face(&self, index: i32) -> Result<(), BridgeError> {
        let _guard = self.begin_face_op()?;
        self.transport.send_command(VendorCommand::SetDisplayFace(index)).await?;
        info!("Display face set to {}", index);
        Ok(())
    }

    fn begin_face_op(&self) -> Result<FaceOpGuard<'_>, BridgeError> {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_busy() {
            info!("Watch face operation rejected, pipeline busy");
            return Err(BridgeError::Busy);
        }
        slot.face_op = true;
        Ok(FaceOpGuard(&self.slot))
    }

    pub fn close(&self) {
        self.slot.lock().unwrap().disarm();
        self.progress.close();
    }
}
