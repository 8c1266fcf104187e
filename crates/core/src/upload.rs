use std::path::Path;

use tracing::{debug, warn};

use crate::scanner::CandidateFile;
use crate::storage::{MediaStorage, TransferMode};
use crate::{Error, ErrorKind, Result};

/// Files at or above this size skip photo mode.
pub const DOCUMENT_MODE_MIN_BYTES: u64 = 10 * 1024 * 1024;
/// Formats photo mode is known to reject.
const DOCUMENT_ONLY_EXTENSIONS: &[&str] = &["heic", "heif"];
pub const HISTORY_FILE_NAME: &str = "history.json";

pub fn forced_document(path: &Path, size_bytes: u64) -> bool {
    if size_bytes >= DOCUMENT_MODE_MIN_BYTES {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            DOCUMENT_ONLY_EXTENSIONS
                .iter()
                .any(|d| e.eq_ignore_ascii_case(d))
        })
}

/// Sends one file, trying photo mode first when allowed and falling back to a single document
/// attempt if it fails.
///
/// A failure whose last attempt was a network problem comes back as [`Error::Network`] so the
/// caller can stop the run; anything else is [`Error::UploadFailed`].
pub async fn upload_file<S: MediaStorage + ?Sized>(
    storage: &S,
    file: &CandidateFile,
    destination_id: &str,
) -> Result<()> {
    let path = file.path.as_path();

    if forced_document(path, file.size_bytes) {
        return storage
            .send_media(path, destination_id, TransferMode::Document)
            .await
            .map_err(|e| upload_error(path, e.kind(), e.to_string()));
    }

    let first = match storage
        .send_media(path, destination_id, TransferMode::Photo)
        .await
    {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!(
        event = "upload.photo_failed",
        path = %path.display(),
        error = %first,
        "upload.photo_failed"
    );

    match storage
        .send_media(path, destination_id, TransferMode::Document)
        .await
    {
        Ok(()) => Ok(()),
        Err(second) => {
            warn!(
                event = "upload.fallback_failed",
                path = %path.display(),
                error = %second,
                "upload.fallback_failed"
            );
            Err(upload_error(
                path,
                second.kind(),
                format!("{first} (fallback failed: {second})"),
            ))
        }
    }
}

fn upload_error(path: &Path, kind: ErrorKind, message: String) -> Error {
    match kind {
        ErrorKind::Transient => Error::Network { message },
        ErrorKind::Permanent => Error::UploadFailed {
            path: path.display().to_string(),
            message,
        },
    }
}

pub async fn upload_history_snapshot<S: MediaStorage + ?Sized>(
    storage: &S,
    json: String,
) -> Result<String> {
    storage
        .upload_document(HISTORY_FILE_NAME, json.into_bytes())
        .await
}

pub async fn download_history_snapshot<S: MediaStorage + ?Sized>(
    storage: &S,
    file_id: &str,
) -> Result<String> {
    let bytes = storage.download_document(file_id).await?;
    String::from_utf8(bytes).map_err(|_| Error::Telegram {
        message: format!("history snapshot {file_id} is not UTF-8"),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage::InMemoryRemote;

    fn candidate(name: &str, size_bytes: u64) -> CandidateFile {
        CandidateFile {
            path: PathBuf::from("/sdcard/DCIM/Camera").join(name),
            parent_folder: PathBuf::from("/sdcard/DCIM/Camera"),
            modified_at: 1_700_000_000,
            size_bytes,
        }
    }

    #[test]
    fn heic_and_large_files_are_forced_to_document_mode() {
        assert!(forced_document(Path::new("/a/IMG.HEIC"), 10));
        assert!(forced_document(Path::new("/a/big.jpg"), DOCUMENT_MODE_MIN_BYTES));
        assert!(!forced_document(Path::new("/a/small.jpg"), DOCUMENT_MODE_MIN_BYTES - 1));
    }

    #[tokio::test]
    async fn photo_mode_is_tried_first() {
        let remote = InMemoryRemote::new();
        upload_file(&remote, &candidate("a.jpg", 100), "7").await.unwrap();

        let attempts = remote.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].mode, TransferMode::Photo);
        assert_eq!(attempts[0].destination_id, "7");
    }

    #[tokio::test]
    async fn rejected_photo_falls_back_to_one_document_attempt() {
        let remote = InMemoryRemote::new();
        remote.reject(TransferMode::Photo, "a.jpg").await;

        upload_file(&remote, &candidate("a.jpg", 100), "7").await.unwrap();

        let modes = remote
            .attempts()
            .await
            .into_iter()
            .map(|a| a.mode)
            .collect::<Vec<_>>();
        assert_eq!(modes, vec![TransferMode::Photo, TransferMode::Document]);
    }

    #[tokio::test]
    async fn double_failure_reports_both_descriptions() {
        let remote = InMemoryRemote::new();
        remote.reject(TransferMode::Photo, "a.jpg").await;
        remote.reject(TransferMode::Document, "a.jpg").await;

        let err = upload_file(&remote, &candidate("a.jpg", 100), "7")
            .await
            .unwrap_err();
        assert_eq!(remote.attempts().await.len(), 2);
        match err {
            Error::UploadFailed { message, .. } => {
                assert!(message.contains("sendPhoto rejected a.jpg"), "{message}");
                assert!(message.contains("sendDocument rejected a.jpg"), "{message}");
            }
            other => panic!("expected UploadFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_document_has_no_fallback() {
        let remote = InMemoryRemote::new();
        remote.reject(TransferMode::Document, "IMG_1.heic").await;

        let err = upload_file(&remote, &candidate("IMG_1.heic", 100), "7")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UploadFailed { .. }));
        let attempts = remote.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].mode, TransferMode::Document);
    }

    #[tokio::test]
    async fn network_failure_stays_transient() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);

        let err = upload_file(&remote, &candidate("a.jpg", 100), "7")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn history_snapshot_round_trips() {
        let remote = InMemoryRemote::new();
        let id = upload_history_snapshot(&remote, r#"[{"p":"/a","m":1,"u":2}]"#.to_string())
            .await
            .unwrap();
        let text = download_history_snapshot(&remote, &id).await.unwrap();
        assert_eq!(text, r#"[{"p":"/a","m":1,"u":2}]"#);
    }
}
