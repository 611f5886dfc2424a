//! Disk spill for one node's error queue.
//!
//! When a node's backlog can't be delivered, the owning [`ErrorQueue`]
//! hands its in-memory messages to a spill worker that appends them to
//! numbered files under `<root>/<node>/`. Each file holds at most
//! `items_per_file` messages or `max_file_size` bytes. Dequeue pops the
//! oldest file whole, so one dequeue never returns more than a file's
//! worth of messages and FIFO order survives the round trip.
//!
//! Spills are blocking file I/O, so they run on tokio's blocking pool.
//! Callers outside a runtime get a short-lived OS thread instead.
//!
//! Each indexed file carries the bytes and messages it was charged for, so
//! a file that turns out unreadable still gives back what it holds.
//!
//! Lock order is `files` before `spilling`. The spill worker only ever
//! holds one of them at a time.
//!
//! [`ErrorQueue`]: crate::ErrorQueue

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use relay_core::{DropNotifier, SerializedMessage};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::format::{self, FormatError, SpillHeader};
use crate::ledger::SpillLedger;

const SPILL_EXTENSION: &str = "spill";
const ERROR_EXTENSION: &str = "error";

/// Errors raised while setting up a spill engine.
#[derive(Debug, Error)]
pub enum SpillError {
    #[error("invalid spill config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Where and how a node's backlog is spilled.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Root folder shared by every node. Each node spills into its own
    /// sub-folder.
    pub root: PathBuf,
    pub items_per_file: usize,
    pub max_file_size: u64,
}

/// The in-memory backlog a spill engine drains.
pub trait SpillSource: Send + Sync {
    /// Takes every queued message, oldest first.
    fn drain(&self) -> Vec<SerializedMessage>;

    /// True if messages are waiting to be drained.
    fn has_pending(&self) -> bool;
}

/// Spills one node's error-queue backlog to disk and reads it back.
#[derive(Clone)]
pub struct SpillEngine {
    inner: Arc<Engine>,
}

struct Engine {
    folder: PathBuf,
    node: String,
    items_per_file: usize,
    max_file_size: u64,
    source: Arc<dyn SpillSource>,
    ledger: Arc<SpillLedger>,
    dropped: DropNotifier,
    files: Mutex<FileIndex>,
    spilling: Mutex<bool>,
    spill_done: Condvar,
    message_count: AtomicI64,
    discard_count: AtomicU64,
}

/// One file in the index and what it is charged for.
struct SpillFile {
    path: PathBuf,
    bytes: u64,
    messages: u32,
}

#[derive(Default)]
struct FileIndex {
    /// Sealed and partial files, oldest first.
    queue: VecDeque<SpillFile>,
    sequence: u32,
    /// The file the spill worker appends to, if any.
    current: Option<PathBuf>,
}

/// A spill file held open by the worker for one pass.
struct OpenSpill {
    path: PathBuf,
    writer: BufWriter<File>,
    header: SpillHeader,
    position: u64,
    initial_len: u64,
}

impl FileIndex {
    fn entry_mut(&mut self, path: &Path) -> Option<&mut SpillFile> {
        self.queue.iter_mut().find(|f| f.path == path)
    }
}

impl OpenSpill {
    /// Flushes buffered records, rewrites the header with the final
    /// message count and charges the file's index entry.
    fn flush_header(&mut self, files: &mut FileIndex) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        self.header.write_to(file)?;
        file.sync_all()?;
        if let Some(entry) = files.entry_mut(&self.path) {
            entry.bytes += self.bytes_added();
            entry.messages = self.header.message_count.max(0) as u32;
        }
        Ok(())
    }

    fn bytes_added(&self) -> u64 {
        self.position.saturating_sub(self.initial_len)
    }
}

impl SpillEngine {
    /// Creates the engine for `node_name`.
    ///
    /// If a non-empty folder from a previous run exists, it is scanned on
    /// the spill thread to rebuild the file index and ledger; the engine
    /// reports itself as spilling until the scan finishes. An empty
    /// leftover folder is removed.
    pub fn open(
        config: SpillConfig,
        node_name: &str,
        source: Arc<dyn SpillSource>,
        ledger: Arc<SpillLedger>,
        dropped: DropNotifier,
    ) -> Result<Self, SpillError> {
        if node_name.is_empty() {
            return Err(SpillError::InvalidConfig("node name may not be empty".into()));
        }
        if config.items_per_file == 0 {
            return Err(SpillError::InvalidConfig(
                "items per file must be greater than zero".into(),
            ));
        }
        if config.max_file_size == 0 {
            return Err(SpillError::InvalidConfig(
                "max file size must be greater than zero".into(),
            ));
        }

        let folder = config.root.join(node_name);
        let engine = Arc::new(Engine {
            folder,
            node: node_name.to_owned(),
            items_per_file: config.items_per_file,
            max_file_size: config.max_file_size,
            source,
            ledger,
            dropped,
            files: Mutex::new(FileIndex::default()),
            spilling: Mutex::new(false),
            spill_done: Condvar::new(),
            message_count: AtomicI64::new(0),
            discard_count: AtomicU64::new(0),
        });

        debug!(
            node = node_name,
            items_per_file = config.items_per_file,
            max_file_size = config.max_file_size,
            max_total_bytes = engine.ledger.max_bytes(),
            "spill engine opened"
        );

        if engine.folder.exists() {
            // only succeeds if the folder is empty
            let _ = fs::remove_dir(&engine.folder);
            if engine.folder.exists() {
                *engine.spilling_lock() = true;
                engine.spawn_worker(true);
            }
        }

        Ok(Self { inner: engine })
    }

    /// Makes sure the node's spill folder exists.
    pub fn create_spill_folder(&self) -> Result<(), SpillError> {
        let _files = self.inner.files_lock();
        fs::create_dir_all(&self.inner.folder)?;
        Ok(())
    }

    /// Starts a spill unless one is already running.
    pub fn start_spill(&self) {
        {
            let mut spilling = self.inner.spilling_lock();
            if *spilling {
                return;
            }
            *spilling = true;
        }
        self.inner.spawn_worker(false);
    }

    /// Blocks until no spill is in progress.
    pub fn wait_for_spill(&self) {
        let mut spilling = self.inner.spilling_lock();
        while *spilling {
            spilling = self
                .inner
                .spill_done
                .wait(spilling)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Moves the oldest spill file's messages into `out` and deletes it.
    ///
    /// Does nothing if the oldest file is still being written by a running
    /// spill. A file that can't be read is renamed with an `.error`
    /// extension and its messages are counted as discarded.
    pub fn dequeue(&self, out: &mut Vec<SerializedMessage>) -> Result<(), FormatError> {
        let entry = {
            let mut files = self.inner.files_lock();
            let Some(front) = files.queue.front() else {
                return Ok(());
            };
            if files.current.as_ref() == Some(&front.path) {
                if *self.inner.spilling_lock() {
                    return Ok(());
                }
                files.current = None;
            }
            match files.queue.pop_front() {
                Some(entry) => entry,
                None => return Ok(()),
            }
        };
        self.inner.release(&entry);

        match read_file(&entry.path) {
            Ok(messages) => {
                out.extend(messages);
                if let Err(e) = fs::remove_file(&entry.path) {
                    warn!(node = %self.inner.node, path = %entry.path.display(), "failed to delete spill file: {e}");
                }
                Ok(())
            }
            Err(e) => {
                error!(node = %self.inner.node, path = %entry.path.display(), "failed to read spill file: {e}");
                self.inner.count_lost(entry.messages);
                self.inner.rename_to_error(&entry.path);
                Err(e)
            }
        }
    }

    /// Messages currently persisted for this node.
    pub fn message_count(&self) -> usize {
        self.inner.message_count.load(Ordering::Acquire).max(0) as usize
    }

    pub fn file_count(&self) -> usize {
        self.inner.files_lock().queue.len()
    }

    /// Messages lost to discarded files.
    pub fn discard_count(&self) -> u64 {
        self.inner.discard_count.load(Ordering::Acquire)
    }

    pub fn is_spilling(&self) -> bool {
        *self.inner.spilling_lock()
    }

    pub fn folder(&self) -> &Path {
        &self.inner.folder
    }
}

impl Engine {
    fn files_lock(&self) -> MutexGuard<'_, FileIndex> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spilling_lock(&self) -> MutexGuard<'_, bool> {
        self.spilling.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns a spill worker. The caller must already have set `spilling`.
    fn spawn_worker(self: &Arc<Self>, rescan: bool) {
        let engine = Arc::clone(self);
        let work = move || {
            if rescan {
                engine.scan();
            }
            engine.run();
        };

        if let Ok(handle) = Handle::try_current() {
            handle.spawn_blocking(work);
            return;
        }
        let spawned = std::thread::Builder::new()
            .name(format!("relay-spill-{}", self.node))
            .spawn(work);
        if let Err(e) = spawned {
            error!(node = %self.node, "failed to spawn spill thread: {e}");
            *self.spilling_lock() = false;
            self.spill_done.notify_all();
        }
    }

    /// Gives back the bytes and messages a file was charged for.
    fn release(&self, entry: &SpillFile) {
        self.ledger.increment(&self.node, -(entry.bytes as i64));
        self.message_count
            .fetch_sub(i64::from(entry.messages), Ordering::AcqRel);
    }

    /// Accounts for released messages that will never be delivered.
    fn count_lost(&self, count: u32) {
        self.discard_count.fetch_add(u64::from(count), Ordering::AcqRel);
        metrics::gauge!("relay_error_queue_depth").decrement(f64::from(count));
        metrics::counter!("relay_error_queue_discards_total").increment(u64::from(count));
    }

    fn run(&self) {
        loop {
            self.spill_pass();

            let mut spilling = self.spilling_lock();
            if self.source.has_pending() {
                // more arrived while this pass was finishing
                continue;
            }
            *spilling = false;
            self.spill_done.notify_all();
            return;
        }
    }

    fn spill_pass(&self) {
        let mut open = None;
        let mut written = 0u64;
        let result = self.write_pending(&mut open, &mut written);
        let exceeded = self.ledger.increment(&self.node, written as i64);

        match result {
            Ok(()) => {
                if exceeded {
                    self.discard_one_file();
                }
            }
            Err(e) => {
                error!(node = %self.node, "spill failed: {e}");
                if let Some(spill) = open.take() {
                    self.abandon(spill);
                }
            }
        }
    }

    /// Drains the source until it's empty, appending to spill files.
    /// `written` accumulates bytes added to files this pass has let go of.
    fn write_pending(
        &self,
        open: &mut Option<OpenSpill>,
        written: &mut u64,
    ) -> Result<(), FormatError> {
        loop {
            let messages = self.source.drain();
            if messages.is_empty() {
                break;
            }
            let mut pending = messages.into_iter();
            while let Some(message) = pending.next() {
                if let Err(e) = self.write_one(&message, open, written) {
                    self.drop_messages(std::iter::once(message).chain(pending));
                    return Err(e);
                }
            }
        }

        if let Some(spill) = open.as_mut() {
            // leave the file current so the next pass appends to it
            spill.flush_header(&mut self.files_lock())?;
            *written += spill.bytes_added();
            *open = None;
        }
        Ok(())
    }

    fn write_one(
        &self,
        message: &SerializedMessage,
        open: &mut Option<OpenSpill>,
        written: &mut u64,
    ) -> Result<(), FormatError> {
        if open.is_none() {
            *open = Some(self.open_current()?);
        }
        let Some(spill) = open.as_mut() else {
            return Err(FormatError::InvalidData("spill file not open".into()));
        };

        spill.position += format::write_record(&mut spill.writer, message)?;
        spill.header.message_count += 1;
        self.message_count.fetch_add(1, Ordering::AcqRel);

        if spill.header.message_count as usize >= self.items_per_file
            || spill.position >= self.max_file_size
        {
            let mut files = self.files_lock();
            spill.flush_header(&mut files)?;
            *written += spill.bytes_added();
            files.current = None;
            drop(files);
            *open = None;
        }
        Ok(())
    }

    /// Opens the current file for appending, or creates the next one.
    fn open_current(&self) -> Result<OpenSpill, FormatError> {
        let mut files = self.files_lock();
        match files.current.clone() {
            Some(path) => {
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                let header = SpillHeader::read_from(&mut file)?;
                let len = file.seek(SeekFrom::End(0))?;
                Ok(OpenSpill {
                    path,
                    writer: BufWriter::new(file),
                    header,
                    position: len,
                    initial_len: len,
                })
            }
            None => {
                files.sequence += 1;
                let path = self.folder.join(spill_file_name(files.sequence));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                let mut writer = BufWriter::new(file);
                let header = SpillHeader::default();
                header.write_to(&mut writer)?;
                files.queue.push_back(SpillFile {
                    path: path.clone(),
                    bytes: 0,
                    messages: 0,
                });
                files.current = Some(path.clone());
                Ok(OpenSpill {
                    path,
                    writer,
                    header,
                    position: header.data_start as u64,
                    initial_len: 0,
                })
            }
        }
    }

    /// Gives up on a file the worker failed to write. Bytes charged by
    /// earlier passes go back to the ledger.
    fn abandon(&self, spill: OpenSpill) {
        let OpenSpill { path, writer, header, .. } = spill;
        drop(writer);
        let charged = {
            let mut files = self.files_lock();
            if files.current.as_ref() == Some(&path) {
                files.current = None;
            }
            let charged = files.entry_mut(&path).map_or(0, |e| e.bytes);
            files.queue.retain(|f| f.path != path);
            charged
        };
        self.ledger.increment(&self.node, -(charged as i64));
        let lost = i64::from(header.message_count);
        self.message_count.fetch_sub(lost, Ordering::AcqRel);
        metrics::gauge!("relay_error_queue_depth").decrement(lost as f64);
        self.rename_to_error(&path);
    }

    /// Deletes the oldest file that isn't being written, reporting every
    /// message in it as dropped.
    fn discard_one_file(&self) {
        let entry = {
            let mut files = self.files_lock();
            let Some(front) = files.queue.front() else {
                return;
            };
            if files.current.as_ref() == Some(&front.path) {
                return;
            }
            files.queue.pop_front()
        };
        let Some(entry) = entry else {
            return;
        };

        warn!(
            node = %self.node,
            count = entry.messages,
            path = %entry.path.display(),
            "discarding spill file, persisted size limit exceeded"
        );
        self.release(&entry);
        self.count_lost(entry.messages);

        match read_file(&entry.path) {
            Ok(messages) => {
                for message in messages {
                    self.dropped.notify(message);
                }
            }
            Err(e) => {
                error!(node = %self.node, path = %entry.path.display(), "failed to read discarded spill file: {e}")
            }
        }
        if let Err(e) = fs::remove_file(&entry.path) {
            error!(node = %self.node, path = %entry.path.display(), "failed to delete discarded spill file: {e}");
        }
    }

    /// Rebuilds the file index and ledger from a previous run's folder.
    fn scan(&self) {
        self.ledger.reset_node(&self.node);

        let entries = match fs::read_dir(&self.folder) {
            Ok(entries) => entries,
            Err(e) => {
                error!(node = %self.node, "failed to scan spill folder: {e}");
                return;
            }
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPILL_EXTENSION) {
                continue;
            }
            match file_sequence(&path) {
                Some(seq) => found.push((seq, path)),
                None => {
                    warn!(node = %self.node, path = %path.display(), "skipping spill file with malformed name")
                }
            }
        }
        found.sort_by_key(|(seq, _)| *seq);

        let mut recovered = 0i64;
        for (seq, path) in found {
            match read_header(&path) {
                Ok((header, len)) => {
                    self.ledger.increment(&self.node, len as i64);
                    let count = i64::from(header.message_count);
                    self.message_count.fetch_add(count, Ordering::AcqRel);
                    metrics::gauge!("relay_error_queue_depth").increment(count as f64);
                    recovered += count;

                    let mut files = self.files_lock();
                    files.queue.push_back(SpillFile {
                        path,
                        bytes: len,
                        messages: header.message_count.max(0) as u32,
                    });
                    files.sequence = seq;
                }
                Err(e) => {
                    error!(node = %self.node, path = %path.display(), "unreadable spill file: {e}");
                    self.rename_to_error(&path);
                }
            }
        }

        let file_count = self.files_lock().queue.len();
        if file_count > 0 {
            info!(
                node = %self.node,
                files = file_count,
                messages = recovered,
                "recovered persisted error queue"
            );
        }
    }

    fn rename_to_error(&self, path: &Path) {
        let target = path.with_extension(ERROR_EXTENSION);
        let _ = fs::remove_file(&target);
        if let Err(e) = fs::rename(path, &target) {
            error!(node = %self.node, path = %path.display(), "failed to rename bad spill file: {e}");
        }
    }

    fn drop_messages(&self, messages: impl Iterator<Item = SerializedMessage>) {
        for message in messages {
            metrics::gauge!("relay_error_queue_depth").decrement(1.0);
            self.dropped.notify(message);
        }
    }
}

fn spill_file_name(sequence: u32) -> String {
    format!("{sequence:08}.{SPILL_EXTENSION}")
}

fn file_sequence(path: &Path) -> Option<u32> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Reads every record of a spill file, oldest first.
fn read_file(path: &Path) -> Result<Vec<SerializedMessage>, FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = SpillHeader::read_from(&mut reader)?;
    reader.seek(SeekFrom::Start(header.data_start as u64))?;
    let mut messages = Vec::with_capacity(format::capped_capacity(header.message_count));
    for _ in 0..header.message_count {
        messages.push(format::read_record(&mut reader)?);
    }
    Ok(messages)
}

fn read_header(path: &Path) -> Result<(SpillHeader, u64), FormatError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let header = SpillHeader::read_from(&mut file)?;
    Ok((header, len))
}
