//! CLI commands
//! This module defines the operations the command line front end invokes.
//! Each returns a displayable error string.

use std::path::Path;
use std::time::Duration;

use log::info;
use tokio::sync::broadcast;

use crate::core::bluetooth::DiscoveredDevice;
use crate::core::session::{
    ConnectionSession, ConnectionStatus, ErrorEvent, TransferProgress, TransferState, WatchSession,
};
use crate::error::BridgeError;
use crate::state::AppState;

/// Scans for `duration` and returns the devices found, product family first
pub async fn scan_devices(app_state: &AppState, duration: Duration) -> Result<Vec<DiscoveredDevice>, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;

    session.start_scan().await.map_err(|e| e.to_string())?;
    info!("Scanning for {:?}", duration);
    tokio::time::sleep(duration).await;
    session.stop_scan().await.map_err(|e| e.to_string())?;

    Ok(session.sorted_devices())
}

/// Connects to `address` and waits until the attempt settles
pub async fn connect_to_device(
    app_state: &AppState,
    address: &str,
    name: &str,
) -> Result<ConnectionSession, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;
    let errors = session.subscribe_errors();

    session.connect(address, name).await.map_err(|e| e.to_string())?;
    wait_until_settled(&session, errors, connect_wait(app_state)).await
}

/// Connects to the last paired watch. `None` when no watch was paired before.
pub async fn reconnect(app_state: &AppState) -> Result<Option<ConnectionSession>, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;
    let errors = session.subscribe_errors();

    if !session.reconnect_last().await.map_err(|e| e.to_string())? {
        return Ok(None);
    }
    wait_until_settled(&session, errors, connect_wait(app_state))
        .await
        .map(Some)
}

/// Forgets the last paired watch
pub async fn forget(app_state: &AppState) -> Result<(), String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;

    session.forget().await.map_err(|e| e.to_string())
}

/// Disconnects from the connected watch
pub async fn disconnect(app_state: &AppState) -> Result<(), String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;

    session.disconnect().await.map_err(|e| e.to_string())
}

/// Uploads an image as the watch background and waits for the transfer to end
pub async fn upload_image(app_state: &AppState, path: &Path) -> Result<TransferProgress, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;
    let progress = session.subscribe_transfers();
    let errors = session.subscribe_errors();

    let job_id = session
        .upload_background_image(path)
        .await
        .map_err(|e| e.to_string())?;
    wait_for_transfer(progress, errors, job_id).await
}

/// Uploads a `.bin` watch face package and waits for the transfer to end
pub async fn upload_bin(
    app_state: &AppState,
    path: &Path,
    index: Option<i32>,
) -> Result<TransferProgress, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;
    let progress = session.subscribe_transfers();
    let errors = session.subscribe_errors();

    let job_id = session
        .upload_bin_package(path, index)
        .await
        .map_err(|e| e.to_string())?;
    wait_for_transfer(progress, errors, job_id).await
}

/// Reads the selected built-in watch face
pub async fn get_watch_face(app_state: &AppState) -> Result<i32, String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;

    session.get_display_face().await.map_err(|e| e.to_string())
}

/// Selects a built-in watch face
pub async fn set_watch_face(app_state: &AppState, index: i32) -> Result<(), String> {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;

    session.set_display_face(index).await.map_err(|e| e.to_string())
}

/// Releases the session; the watch stays connected until the process exits
pub async fn shutdown(app_state: &AppState) {
    let session_arc = app_state.get_session_arc();
    let session = session_arc.lock().await;
    session.dispose().await;
}

/// Slightly longer than the session's own timeout, which normally fires first
fn connect_wait(app_state: &AppState) -> Duration {
    Duration::from_secs(app_state.config.session.connect_timeout_secs + 1)
}

async fn wait_until_settled(
    session: &WatchSession,
    mut errors: broadcast::Receiver<ErrorEvent>,
    limit: Duration,
) -> Result<ConnectionSession, String> {
    let mut state = session.subscribe_connection();
    let settled = tokio::time::timeout(
        limit,
        state.wait_for(|s| s.status != ConnectionStatus::Connecting),
    )
    .await
    .map_err(|_| BridgeError::Timeout("connection").to_string())?
    .map_err(|_| BridgeError::Disposed.to_string())?
    .clone();

    if settled.is_connected() {
        return Ok(settled);
    }
    match errors.try_recv() {
        Ok(error) => Err(error.message),
        Err(_) => Err("connection failed".to_string()),
    }
}

async fn wait_for_transfer(
    mut progress: broadcast::Receiver<TransferProgress>,
    mut errors: broadcast::Receiver<ErrorEvent>,
    job_id: u64,
) -> Result<TransferProgress, String> {
    loop {
        match progress.recv().await {
            Ok(report) if report.job_id == job_id => {
                info!("Transfer {}: {}% {:?}", job_id, report.progress, report.state);
                if report.state.is_terminal() {
                    return match report.state {
                        TransferState::Complete => Ok(report),
                        _ => Err(match errors.try_recv() {
                            Ok(error) => match error.code {
                                Some(code) => format!("{} (code {})", error.message, code),
                                None => error.message,
                            },
                            Err(_) => "transfer failed".to_string(),
                        }),
                    };
                }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err(BridgeError::Disposed.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    async fn simulated() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let app_state = AppState::new(AppConfig::default(), dir.path(), true).await.unwrap();
        (app_state, dir)
    }

    #[tokio::test]
    async fn simulated_session_round_trip() {
        let (app_state, _config_dir) = simulated().await;

        let devices = scan_devices(&app_state, Duration::from_millis(50)).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.name.starts_with("AW12")));

        let connected = connect_to_device(&app_state, &devices[0].address, &devices[0].name)
            .await
            .unwrap();
        assert!(connected.is_connected());

        set_watch_face(&app_state, 2).await.unwrap();
        assert_eq!(get_watch_face(&app_state).await.unwrap(), 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.bin");
        std::fs::write(&path, [7u8; 32]).unwrap();
        let done = upload_bin(&app_state, &path, Some(1)).await.unwrap();
        assert_eq!(done.progress, 100);

        disconnect(&app_state).await.unwrap();
        shutdown(&app_state).await;
    }

    #[tokio::test]
    async fn errors_come_back_as_text() {
        let (app_state, _config_dir) = simulated().await;

        let error = set_watch_face(&app_state, 1).await.unwrap_err();
        assert_eq!(error, "no watch connected");
        assert_eq!(reconnect(&app_state).await.unwrap(), None);
    }
}
