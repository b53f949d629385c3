//! Firmware update session state machine.
//!
//! One [`UpdateSession`] exists per in-progress transfer. It streams chunks
//! into the storage write target in arrival order, keeps a running CRC32 over
//! the payload, and verifies only after the last byte has been written: the
//! device cannot afford to buffer a whole image in memory, so it trades a
//! window of written-but-unverified flash for bounded RAM. The boot target is
//! only switched after both the size and the checksum in the image header
//! check out; on any failure the previously running firmware stays bootable.
//!
//! [`Updater`] is the process-wide slot holding the at-most-one active
//! session (`None` ↔ `Some(UpdateSession)`).

use crate::storage::{FlashStore, IMAGE_HEADER_LEN, ImageHeader, WriteTarget};
use crc::{CRC_32_ISO_HDLC, Crc, Digest};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 over a firmware payload, as stored in the image header.
pub fn payload_crc32(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// Terminal and in-flight failures of an update transfer.
///
/// All of these are fatal to the session, never to the device: the prior
/// firmware remains bootable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("update already in progress")]
    AlreadyInProgress,
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("integrity mismatch: checksum does not match image header")]
    IntegrityMismatch,
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    #[error("image exceeds update region capacity")]
    StorageFull,
    #[error("client disconnected before the upload completed")]
    ClientDisconnected,
    #[error("upload stalled: no data received within the idle timeout")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Receiving,
    Verifying,
    Committing,
    Succeeded,
    Failed(UpdateError),
}

impl SessionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SessionStatus::Receiving => "receiving",
            SessionStatus::Verifying => "verifying",
            SessionStatus::Committing => "committing",
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed(_) => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Succeeded | SessionStatus::Failed(_))
    }
}

/// Read-only progress view, recomputed from session state on demand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub status: String,
    pub bytes_received: u64,
    pub expected_size: Option<u64>,
    pub percent: Option<u8>,
}

/// One in-progress firmware transfer.
pub struct UpdateSession {
    target: Option<Box<dyn WriteTarget>>,
    status: SessionStatus,
    bytes_received: u64,
    expected_size: Option<u64>,
    header: [u8; IMAGE_HEADER_LEN],
    digest: Option<Digest<'static, u32>>,
}

impl UpdateSession {
    fn new(target: Box<dyn WriteTarget>, expected_size: Option<u64>) -> Self {
        Self {
            target: Some(target),
            status: SessionStatus::Receiving,
            bytes_received: 0,
            expected_size,
            header: [0u8; IMAGE_HEADER_LEN],
            digest: Some(CRC32.digest()),
        }
    }

    /// Append `chunk` at the current offset and advance the accumulator.
    pub fn consume(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        if self.status != SessionStatus::Receiving {
            return Err(self.current_failure());
        }
        let Some(target) = self.target.as_mut() else {
            return Err(self.fail(UpdateError::StorageWrite("write target gone".into())));
        };

        if let Err(e) = target.write(self.bytes_received, chunk) {
            return Err(self.fail(e));
        }

        // The first IMAGE_HEADER_LEN bytes are the self-declared metadata;
        // only the payload after them feeds the running CRC.
        let offset = self.bytes_received as usize;
        let header_part = chunk.len().min(IMAGE_HEADER_LEN.saturating_sub(offset));
        if header_part > 0 {
            self.header[offset..offset + header_part].copy_from_slice(&chunk[..header_part]);
        }
        if let Some(digest) = self.digest.as_mut() {
            digest.update(&chunk[header_part..]);
        }

        self.bytes_received += chunk.len() as u64;
        Ok(())
    }

    /// Verify the received image and, on success, switch the boot target.
    pub fn finalize(&mut self) -> Result<(), UpdateError> {
        if self.status != SessionStatus::Receiving {
            return Err(self.current_failure());
        }
        self.status = SessionStatus::Verifying;

        if let Some(expected) = self.expected_size {
            if expected != self.bytes_received {
                return Err(self.fail(UpdateError::SizeMismatch {
                    expected,
                    actual: self.bytes_received,
                }));
            }
        }
        if self.bytes_received < IMAGE_HEADER_LEN as u64 {
            return Err(self.fail(UpdateError::IntegrityMismatch));
        }

        let header = match ImageHeader::parse(&self.header) {
            Ok(header) => header,
            Err(e) => return Err(self.fail(e)),
        };
        let payload_len = self.bytes_received - IMAGE_HEADER_LEN as u64;
        if u64::from(header.payload_len) != payload_len {
            return Err(self.fail(UpdateError::SizeMismatch {
                expected: u64::from(header.payload_len) + IMAGE_HEADER_LEN as u64,
                actual: self.bytes_received,
            }));
        }
        let crc = match self.digest.take() {
            Some(digest) => digest.finalize(),
            None => return Err(self.fail(UpdateError::IntegrityMismatch)),
        };
        if crc != header.crc32 {
            debug!(
                "checksum mismatch: computed {crc:#010x}, header declares {:#010x}",
                header.crc32
            );
            return Err(self.fail(UpdateError::IntegrityMismatch));
        }

        self.status = SessionStatus::Committing;
        let Some(target) = self.target.as_mut() else {
            return Err(self.fail(UpdateError::StorageWrite("write target gone".into())));
        };
        if let Err(e) = target.mark_boot_target() {
            return Err(self.fail(e));
        }

        self.target = None;
        self.status = SessionStatus::Succeeded;
        info!("firmware image verified and committed ({payload_len} payload bytes)");
        Ok(())
    }

    /// Release the write target and record the failure reason.
    ///
    /// Idempotent: aborting a session already in a terminal state is a no-op.
    pub fn abort(&mut self, reason: UpdateError) {
        if self.status.is_terminal() {
            return;
        }
        warn!("update session aborted: {reason}");
        self.fail(reason);
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let percent = self
            .expected_size
            .filter(|&size| size > 0)
            .map(|size| ((self.bytes_received * 100) / size).min(100) as u8);
        ProgressSnapshot {
            status: self.status.name().to_string(),
            bytes_received: self.bytes_received,
            expected_size: self.expected_size,
            percent,
        }
    }

    fn fail(&mut self, reason: UpdateError) -> UpdateError {
        self.target = None;
        self.digest = None;
        self.status = SessionStatus::Failed(reason.clone());
        reason
    }

    fn current_failure(&self) -> UpdateError {
        match &self.status {
            SessionStatus::Failed(e) => e.clone(),
            // Terminal success or mid-verify reentry: surface as a write
            // ordering error rather than panicking the server.
            _ => UpdateError::StorageWrite(format!("session is {}", self.status.name())),
        }
    }
}

/// Process-wide single-session slot.
///
/// At most one [`UpdateSession`] exists at any time; a second `open()` while
/// one is active fails with [`UpdateError::AlreadyInProgress`]. The session is
/// destroyed on its terminal outcome, with the failure reason retained for the
/// status endpoint.
pub struct Updater {
    store: Arc<dyn FlashStore>,
    active: Mutex<Option<UpdateSession>>,
    last_failure: Mutex<Option<UpdateError>>,
}

impl Updater {
    pub fn new(store: Arc<dyn FlashStore>) -> Self {
        Self {
            store,
            active: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.store.capacity()
    }

    pub fn in_progress(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Allocate a write target and transition to `Receiving`.
    ///
    /// Sizing follows the declared size when known, else the full update
    /// region, so `StorageFull` is raised here and not mid-stream.
    pub fn open(&self, expected_size: Option<u64>) -> Result<(), UpdateError> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(UpdateError::AlreadyInProgress);
        }

        let min_size = expected_size.unwrap_or_else(|| self.store.capacity());
        let target = self.store.open_write_target(min_size)?;
        *active = Some(UpdateSession::new(target, expected_size));
        *self.last_failure.lock().unwrap() = None;
        debug!("update session opened (expected size: {expected_size:?})");
        Ok(())
    }

    pub fn consume(&self, chunk: &[u8]) -> Result<(), UpdateError> {
        let mut active = self.active.lock().unwrap();
        let Some(session) = active.as_mut() else {
            return Err(UpdateError::StorageWrite("no active session".into()));
        };
        let result = session.consume(chunk);
        if let Err(e) = &result {
            self.clear_failed(&mut active, e);
        }
        result
    }

    pub fn finalize(&self) -> Result<(), UpdateError> {
        let mut active = self.active.lock().unwrap();
        let Some(session) = active.as_mut() else {
            return Err(UpdateError::StorageWrite("no active session".into()));
        };
        let result = session.finalize();
        match &result {
            Ok(()) => *active = None,
            Err(e) => self.clear_failed(&mut active, e),
        }
        result
    }

    /// Abort the active session, if any. No-op once a terminal outcome has
    /// been reached.
    pub fn abort(&self, reason: UpdateError) {
        let mut active = self.active.lock().unwrap();
        if let Some(session) = active.as_mut() {
            session.abort(reason.clone());
            self.clear_failed(&mut active, &reason);
        }
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.active.lock().unwrap().as_ref().map(|s| s.snapshot())
    }

    /// Reason of the most recent terminal failure, cleared when a new session
    /// opens.
    pub fn last_failure(&self) -> Option<UpdateError> {
        self.last_failure.lock().unwrap().clone()
    }

    fn clear_failed(&self, active: &mut Option<UpdateSession>, reason: &UpdateError) {
        *active = None;
        *self.last_failure.lock().unwrap() = Some(reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encode_image;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory write target recording writes and the commit flag.
    #[derive(Default)]
    struct MemFlash {
        capacity: u64,
        committed: Arc<AtomicBool>,
        fail_writes: bool,
    }

    struct MemTarget {
        data: Vec<u8>,
        committed: Arc<AtomicBool>,
        fail_writes: bool,
    }

    impl FlashStore for MemFlash {
        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn open_write_target(&self, min_size: u64) -> Result<Box<dyn WriteTarget>, UpdateError> {
            if min_size > self.capacity {
                return Err(UpdateError::StorageFull);
            }
            Ok(Box::new(MemTarget {
                data: Vec::new(),
                committed: self.committed.clone(),
                fail_writes: self.fail_writes,
            }))
        }
    }

    impl WriteTarget for MemTarget {
        fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), UpdateError> {
            if self.fail_writes {
                return Err(UpdateError::StorageWrite("simulated flash fault".into()));
            }
            assert_eq!(offset as usize, self.data.len(), "writes must be in order");
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn mark_boot_target(&mut self) -> Result<(), UpdateError> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn updater(capacity: u64) -> (Updater, Arc<AtomicBool>) {
        let committed = Arc::new(AtomicBool::new(false));
        let store = MemFlash {
            capacity,
            committed: committed.clone(),
            fail_writes: false,
        };
        (Updater::new(Arc::new(store)), committed)
    }

    #[test]
    fn well_formed_image_commits() {
        let (updater, committed) = updater(1 << 20);
        let image = encode_image(&vec![0xA5u8; 4096]);

        updater.open(Some(image.len() as u64)).expect("open");
        for chunk in image.chunks(1024) {
            updater.consume(chunk).expect("consume");
        }
        updater.finalize().expect("finalize");

        assert!(committed.load(Ordering::SeqCst));
        assert!(!updater.in_progress());
        assert_eq!(updater.last_failure(), None);
    }

    #[test]
    fn second_open_is_already_in_progress() {
        let (updater, _) = updater(1 << 20);
        updater.open(None).expect("first open");
        assert_eq!(updater.open(None), Err(UpdateError::AlreadyInProgress));
        // Still rejected regardless of how much has streamed in.
        updater.consume(b"data").expect("consume");
        assert_eq!(
            updater.open(Some(16)),
            Err(UpdateError::AlreadyInProgress)
        );
    }

    #[test]
    fn declared_size_mismatch_leaves_boot_target_unchanged() {
        let (updater, committed) = updater(1 << 20);
        let image = encode_image(b"payload");

        updater.open(Some(image.len() as u64 + 1)).expect("open");
        updater.consume(&image).expect("consume");

        assert_eq!(
            updater.finalize(),
            Err(UpdateError::SizeMismatch {
                expected: image.len() as u64 + 1,
                actual: image.len() as u64,
            })
        );
        assert!(!committed.load(Ordering::SeqCst));
        assert!(!updater.in_progress());
    }

    #[test]
    fn corrupted_trailing_byte_is_integrity_mismatch() {
        let (updater, committed) = updater(1 << 20);
        let mut image = encode_image(&vec![0x5Au8; 2048]);
        *image.last_mut().unwrap() ^= 0xFF;

        updater.open(Some(image.len() as u64)).expect("open");
        updater.consume(&image).expect("consume");

        assert_eq!(updater.finalize(), Err(UpdateError::IntegrityMismatch));
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(updater.last_failure(), Some(UpdateError::IntegrityMismatch));
    }

    #[test]
    fn header_payload_length_mismatch_is_size_mismatch() {
        let (updater, committed) = updater(1 << 20);
        let mut image = encode_image(b"four");
        image.extend_from_slice(b"extra");

        updater.open(None).expect("open");
        updater.consume(&image).expect("consume");

        assert!(matches!(
            updater.finalize(),
            Err(UpdateError::SizeMismatch { .. })
        ));
        assert!(!committed.load(Ordering::SeqCst));
    }

    #[test]
    fn truncated_image_is_integrity_mismatch() {
        let (updater, _) = updater(1 << 20);
        updater.open(None).expect("open");
        updater.consume(b"EMB").expect("consume");
        assert_eq!(updater.finalize(), Err(UpdateError::IntegrityMismatch));
    }

    #[test]
    fn oversized_declared_size_is_storage_full_at_open() {
        let (updater, _) = updater(1024);
        assert_eq!(updater.open(Some(2048)), Err(UpdateError::StorageFull));
        // Not a session failure: nothing was ever opened.
        assert!(!updater.in_progress());
    }

    #[test]
    fn storage_write_failure_is_fatal_to_the_session() {
        let committed = Arc::new(AtomicBool::new(false));
        let store = MemFlash {
            capacity: 1 << 20,
            committed: committed.clone(),
            fail_writes: true,
        };
        let updater = Updater::new(Arc::new(store));

        updater.open(None).expect("open");
        assert!(matches!(
            updater.consume(b"data"),
            Err(UpdateError::StorageWrite(_))
        ));
        assert!(!updater.in_progress());
        assert!(!committed.load(Ordering::SeqCst));
    }

    #[test]
    fn abort_is_idempotent_after_terminal_state() {
        let store = MemFlash {
            capacity: 1 << 20,
            ..Default::default()
        };
        let mut session = UpdateSession::new(
            store.open_write_target(16).expect("target"),
            None,
        );

        session.abort(UpdateError::ClientDisconnected);
        assert_eq!(
            *session.status(),
            SessionStatus::Failed(UpdateError::ClientDisconnected)
        );

        // A later abort must not overwrite the recorded reason.
        session.abort(UpdateError::Timeout);
        assert_eq!(
            *session.status(),
            SessionStatus::Failed(UpdateError::ClientDisconnected)
        );
    }

    #[test]
    fn abort_after_success_is_a_noop() {
        let (updater, committed) = updater(1 << 20);
        let image = encode_image(b"ok");

        updater.open(None).expect("open");
        updater.consume(&image).expect("consume");
        updater.finalize().expect("finalize");

        updater.abort(UpdateError::Timeout);
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(updater.last_failure(), None);
    }

    #[test]
    fn snapshot_reports_progress_percent() {
        let (updater, _) = updater(1 << 20);
        updater.open(Some(200)).expect("open");
        updater.consume(&[0u8; 50]).expect("consume");

        let snapshot = updater.snapshot().expect("snapshot");
        assert_eq!(snapshot.bytes_received, 50);
        assert_eq!(snapshot.expected_size, Some(200));
        assert_eq!(snapshot.percent, Some(25));
        assert_eq!(snapshot.status, "receiving");

        updater.abort(UpdateError::ClientDisconnected);
        assert_eq!(updater.snapshot(), None);
    }
}
