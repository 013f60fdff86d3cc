//! File-backed snapshot store.
//!
//! Each snapshot is a directory `<term>-<index>-<unix-millis>/` under
//! `<base>/snapshots/` holding `meta.json` and `state.bin`. Writes land in a
//! `.tmp`-suffixed directory that is renamed into place on close, with the
//! parent directory fsynced afterwards, so a crash never exposes a partial
//! snapshot. State bytes are checksummed with CRC64-ECMA on the way in and
//! verified on open.
//!
//! `.tmp` directories surviving a crash are skipped by listing and left on
//! disk for the operator to inspect.

use super::{encode_peers, PeerEncoder, SnapshotMeta, SnapshotVersion};
use super::{SNAPSHOT_VERSION_MAX, SNAPSHOT_VERSION_MIN};
use crate::error::{RaftNetError, Result};
use crate::types::{Configuration, LogIndex, Term};
use crc::{Crc, Digest, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

const SNAP_PATH: &str = "snapshots";
const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";
const PERM_TEST_FILE: &str = "permTest";

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// On-disk metadata: the shared meta plus the state file checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileSnapshotMeta {
    #[serde(flatten)]
    meta: SnapshotMeta,
    #[serde(rename = "CRC", default)]
    crc: u64,
}

/// Snapshot store persisting to a local directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
    retain: usize,
    // Skips fsync calls. Test-only; a crash can lose snapshots.
    no_sync: bool,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a store under `<base>/snapshots/`,
    /// retaining the newest `retain` snapshots. `retain` must be at least 1.
    pub fn new<P: AsRef<Path>>(base: P, retain: usize) -> Result<Self> {
        if retain < 1 {
            return Err(RaftNetError::InvalidRetainCount);
        }

        let path = base.as_ref().join(SNAP_PATH);
        fs::create_dir_all(&path)
            .map_err(|e| RaftNetError::SnapshotPathNotAccessible(e.to_string()))?;

        let store = Self {
            path,
            retain,
            no_sync: false,
        };
        store
            .test_permissions()
            .map_err(|e| RaftNetError::PermissionsTestFailed(e.to_string()))?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn new_no_sync<P: AsRef<Path>>(base: P, retain: usize) -> Result<Self> {
        let mut store = Self::new(base, retain)?;
        store.no_sync = true;
        Ok(store)
    }

    /// Touch and remove a probe file so permission problems surface at
    /// construction rather than at the first snapshot.
    fn test_permissions(&self) -> io::Result<()> {
        let path = self.path.join(PERM_TEST_FILE);
        let file = File::create(&path)?;
        drop(file);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Begin a new snapshot at `(term, index)`. Returns a sink the caller
    /// streams state bytes into and then closes (or cancels).
    pub fn create(
        &self,
        version: SnapshotVersion,
        index: LogIndex,
        term: Term,
        configuration: Configuration,
        configuration_index: LogIndex,
        encoder: &dyn PeerEncoder,
    ) -> Result<FileSnapshotSink> {
        if version != 1 {
            return Err(RaftNetError::UnsupportedSnapshotVersion(version));
        }

        let name = snapshot_name(term, index);
        let dir = self.path.join(format!("{}{}", name, TMP_SUFFIX));
        info!(path = %dir.display(), "creating new snapshot");

        fs::create_dir_all(&dir)?;

        let peers = encode_peers(&configuration, encoder)?;

        let mut sink = FileSnapshotSink {
            store: self.clone(),
            dir: dir.clone(),
            parent_dir: self.path.clone(),
            no_sync: self.no_sync,
            meta: FileSnapshotMeta {
                meta: SnapshotMeta {
                    version,
                    id: name,
                    index,
                    term,
                    peers,
                    configuration,
                    configuration_index,
                    size: 0,
                },
                crc: 0,
            },
            state: None,
            closed: false,
        };

        sink.write_meta()?;

        let state_path = dir.join(STATE_FILE);
        let file = File::create(&state_path)?;
        sink.state = Some(StateWriter {
            file: BufWriter::new(file),
            digest: CRC64.digest(),
        });

        Ok(sink)
    }

    /// Metadata for the newest `retain` snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let snapshots = self.get_snapshots()?;
        Ok(snapshots
            .into_iter()
            .take(self.retain)
            .map(|m| m.meta)
            .collect())
    }

    /// All readable snapshots, sorted newest first by `(term, index, id)`.
    fn get_snapshots(&self) -> Result<Vec<FileSnapshotMeta>> {
        let entries = fs::read_dir(&self.path).map_err(|e| {
            error!(error = %e, "failed to scan snapshot directory");
            RaftNetError::from(e)
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                warn!(name = %name, "found temporary snapshot");
                continue;
            }

            let meta = match self.read_meta(&name) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to read metadata");
                    continue;
                }
            };

            if meta.meta.version < SNAPSHOT_VERSION_MIN || meta.meta.version > SNAPSHOT_VERSION_MAX
            {
                warn!(name = %name, version = meta.meta.version, "snapshot version not supported");
                continue;
            }

            snapshots.push(meta);
        }

        snapshots.sort_by(|a, b| {
            (a.meta.term, a.meta.index, &a.meta.id).cmp(&(b.meta.term, b.meta.index, &b.meta.id))
        });
        snapshots.reverse();

        Ok(snapshots)
    }

    fn read_meta(&self, name: &str) -> Result<FileSnapshotMeta> {
        let meta_path = self.path.join(name).join(META_FILE);
        let file = File::open(&meta_path)?;
        let meta = serde_json::from_reader(BufReader::new(file))?;
        Ok(meta)
    }

    /// Open a finalized snapshot, verifying the state file against its
    /// stored CRC before returning a buffered reader over it.
    pub fn open(&self, id: &str) -> Result<(SnapshotMeta, BufReader<File>)> {
        let meta = self.read_meta(id).map_err(|e| {
            error!(id = %id, error = %e, "failed to get meta data to open snapshot");
            e
        })?;

        let state_path = self.path.join(id).join(STATE_FILE);
        let mut file = File::open(&state_path)?;

        let mut digest = CRC64.digest();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        let computed = digest.finalize();

        if meta.crc != computed {
            error!(stored = meta.crc, computed, "CRC checksum failed");
            return Err(RaftNetError::CrcMismatch);
        }

        file.seek(SeekFrom::Start(0))?;
        Ok((meta.meta, BufReader::new(file)))
    }

    /// Delete every snapshot beyond the newest `retain`.
    pub fn reap_snapshots(&self) -> Result<()> {
        let snapshots = self.get_snapshots()?;

        for meta in snapshots.iter().skip(self.retain) {
            let path = self.path.join(&meta.meta.id);
            info!(path = %path.display(), "reaping snapshot");
            fs::remove_dir_all(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to reap snapshot");
                RaftNetError::from(e)
            })?;
        }
        Ok(())
    }
}

struct StateWriter {
    file: BufWriter<File>,
    digest: Digest<'static, u64>,
}

/// Write handle for an in-progress snapshot. Bytes written here go to the
/// state file and the running CRC. Finish with [`close`](Self::close) or
/// [`cancel`](Self::cancel); both are idempotent.
pub struct FileSnapshotSink {
    store: FileSnapshotStore,
    dir: PathBuf,
    parent_dir: PathBuf,
    no_sync: bool,
    meta: FileSnapshotMeta,
    state: Option<StateWriter>,
    closed: bool,
}

impl std::fmt::Debug for FileSnapshotSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSnapshotSink")
            .field("dir", &self.dir)
            .field("parent_dir", &self.parent_dir)
            .field("no_sync", &self.no_sync)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FileSnapshotSink {
    /// The id of the snapshot being written, usable with
    /// [`FileSnapshotStore::open`] after a successful close.
    pub fn id(&self) -> &str {
        &self.meta.meta.id
    }

    /// Finalize the snapshot: flush and fsync the state file, record size
    /// and CRC in the metadata, move the directory into place, fsync the
    /// parent directory, and reap snapshots past the retention count.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(err) = self.finalize() {
            error!(error = %err, "failed to finalize snapshot");
            if let Err(del_err) = fs::remove_dir_all(&self.dir) {
                error!(
                    path = %self.dir.display(),
                    error = %del_err,
                    "failed to delete temporary snapshot directory"
                );
                return Err(del_err.into());
            }
            return Err(err);
        }

        if let Err(err) = self.write_meta() {
            error!(error = %err, "failed to write metadata");
            return Err(err);
        }

        let final_path = self
            .parent_dir
            .join(self.meta.meta.id.as_str());
        if let Err(err) = fs::rename(&self.dir, &final_path) {
            error!(error = %err, "failed to move snapshot into place");
            return Err(err.into());
        }

        // Directory entry edits need their own fsync on *nix file systems;
        // Windows has no equivalent and does not need one.
        #[cfg(not(windows))]
        if !self.no_sync {
            let parent = File::open(&self.parent_dir).map_err(|err| {
                error!(path = %self.parent_dir.display(), error = %err, "failed to open snapshot parent directory");
                RaftNetError::from(err)
            })?;
            parent.sync_all().map_err(|err| {
                error!(path = %self.parent_dir.display(), error = %err, "failed syncing parent directory");
                RaftNetError::from(err)
            })?;
        }

        self.store.reap_snapshots()
    }

    /// Abandon the snapshot and remove its temporary directory. Idempotent
    /// with [`close`](Self::close).
    pub fn cancel(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(err) = self.finalize() {
            error!(error = %err, "failed to finalize snapshot");
            return Err(err);
        }

        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Flush buffers, fsync, capture size and CRC. Consumes the state file.
    fn finalize(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        let StateWriter { file, digest } = state;

        let file = file
            .into_inner()
            .map_err(|e| RaftNetError::Io(e.into_error()))?;

        if !self.no_sync {
            file.sync_all()?;
        }

        let size = file.metadata()?.len();
        drop(file);

        self.meta.meta.size = size;
        self.meta.crc = digest.finalize();
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let meta_path = self.dir.join(META_FILE);
        let file = File::create(&meta_path)?;
        let mut buffered = BufWriter::new(file);

        serde_json::to_writer(&mut buffered, &self.meta)
            .map_err(|e| RaftNetError::Encode(e.to_string()))?;
        buffered.flush()?;

        let file = buffered
            .into_inner()
            .map_err(|e| RaftNetError::Io(e.into_error()))?;
        if !self.no_sync {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "snapshot sink finalized"))?;
        let n = state.file.write(buf)?;
        state.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.as_mut() {
            Some(state) => state.file.flush(),
            None => Ok(()),
        }
    }
}

/// Directory name for a snapshot taken now: `<term>-<index>-<unix-millis>`.
fn snapshot_name(term: Term, index: LogIndex) -> String {
    let msec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}-{}-{}", term, index, msec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Server, ServerAddress, ServerId, ServerSuffrage};
    use tempfile::tempdir;

    struct PlainEncoder;

    impl PeerEncoder for PlainEncoder {
        fn encode_peer(&self, _id: &ServerId, addr: &ServerAddress) -> Result<Vec<u8>> {
            crate::wire::encode_peer(addr)
        }
    }

    fn test_configuration() -> Configuration {
        Configuration {
            servers: vec![Server {
                suffrage: ServerSuffrage::Voter,
                id: ServerId::from("id1"),
                address: ServerAddress::from("127.0.0.1:7000"),
            }],
        }
    }

    fn create_snapshot(store: &FileSnapshotStore, term: Term, index: LogIndex, body: &[u8]) -> String {
        let mut sink = store
            .create(1, index, term, test_configuration(), 2, &PlainEncoder)
            .unwrap();
        sink.write_all(body).unwrap();
        let id = sink.id().to_string();
        sink.close().unwrap();
        id
    }

    #[test]
    fn test_retain_validation() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileSnapshotStore::new(dir.path(), 0),
            Err(RaftNetError::InvalidRetainCount)
        ));
        FileSnapshotStore::new(dir.path(), 1).unwrap();
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 1).unwrap();
        let err = store
            .create(2, 10, 3, test_configuration(), 2, &PlainEncoder)
            .unwrap_err();
        assert!(matches!(err, RaftNetError::UnsupportedSnapshotVersion(2)));
    }

    #[test]
    fn test_create_close_open_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        let id = create_snapshot(&store, 3, 10, b"hello, snapshot");

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, id);
        assert_eq!(metas[0].index, 10);
        assert_eq!(metas[0].term, 3);
        assert_eq!(metas[0].size, 15);

        let (meta, mut reader) = store.open(&id).unwrap();
        assert_eq!(meta.id, id);
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello, snapshot");
    }

    #[test]
    fn test_crc_tamper_detected() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        let id = create_snapshot(&store, 1, 5, b"abcd");

        // Flip one byte of the state file.
        let state_path = dir.path().join(SNAP_PATH).join(&id).join(STATE_FILE);
        let mut contents = fs::read(&state_path).unwrap();
        contents[2] ^= 0xff;
        fs::write(&state_path, &contents).unwrap();

        let err = store.open(&id).unwrap_err();
        assert!(matches!(err, RaftNetError::CrcMismatch));
    }

    #[test]
    fn test_cancel_removes_temp_dir() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        let mut sink = store
            .create(1, 10, 2, test_configuration(), 2, &PlainEncoder)
            .unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();
        // A later close is a no-op.
        sink.close().unwrap();

        assert!(store.list().unwrap().is_empty());
        let entries: Vec<_> = fs::read_dir(dir.path().join(SNAP_PATH))
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_retention_reaps_oldest() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 2).unwrap();

        create_snapshot(&store, 1, 10, b"one");
        create_snapshot(&store, 2, 20, b"two");
        create_snapshot(&store, 3, 30, b"three");

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 2);
        // Newest first.
        assert_eq!(metas[0].term, 3);
        assert_eq!(metas[0].index, 30);
        assert_eq!(metas[1].term, 2);

        // The reaped snapshot is gone from disk, not just from the listing.
        let entries = fs::read_dir(dir.path().join(SNAP_PATH)).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_ordering_within_same_term() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        create_snapshot(&store, 2, 10, b"a");
        create_snapshot(&store, 2, 30, b"b");
        create_snapshot(&store, 2, 20, b"c");

        let metas = store.list().unwrap();
        let indexes: Vec<_> = metas.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![30, 20, 10]);
    }

    #[test]
    fn test_tmp_dirs_ignored_but_kept() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        // Simulate a crash mid-snapshot: a sink that is never closed.
        let mut sink = store
            .create(1, 10, 2, test_configuration(), 2, &PlainEncoder)
            .unwrap();
        sink.write_all(b"orphan").unwrap();
        let tmp_dir = dir
            .path()
            .join(SNAP_PATH)
            .join(format!("{}{}", sink.id(), TMP_SUFFIX));
        std::mem::forget(sink);

        create_snapshot(&store, 2, 20, b"ok");

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].index, 20);
        // Not auto-cleaned.
        assert!(tmp_dir.exists());
    }

    #[test]
    fn test_unreadable_meta_skipped() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new_no_sync(dir.path(), 3).unwrap();

        create_snapshot(&store, 1, 10, b"good");

        // A directory with corrupt metadata must not mask valid snapshots.
        let bogus = dir.path().join(SNAP_PATH).join("9-99-1");
        fs::create_dir_all(&bogus).unwrap();
        fs::write(bogus.join(META_FILE), b"not json").unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].index, 10);
    }

    #[test]
    fn test_peers_encoding_lists_voters_only() {
        let configuration = Configuration {
            servers: vec![
                Server {
                    suffrage: ServerSuffrage::Voter,
                    id: ServerId::from("id1"),
                    address: ServerAddress::from("127.0.0.1:7000"),
                },
                Server {
                    suffrage: ServerSuffrage::Nonvoter,
                    id: ServerId::from("id2"),
                    address: ServerAddress::from("127.0.0.1:7001"),
                },
            ],
        };

        let encoded = encode_peers(&configuration, &PlainEncoder).unwrap();
        let peers: Vec<Vec<u8>> = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            crate::wire::decode_peer(&peers[0]).unwrap(),
            ServerAddress::from("127.0.0.1:7000")
        );
    }
}
