//! The directory-tailing source processor.
//!
//! Watches one directory and emits every line appended to a matching file
//! after [`FileTailSource::init`], as decoded strings, exactly once per
//! sibling set. Work is split across siblings by a stable hash of the file
//! name, so the instances need no coordination. The source is not
//! cooperative: when it has nothing else to do it blocks on the watcher for
//! up to the configured poll interval, so it gets a dedicated worker thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use encoding_rs::Encoding;
use globset::{Glob, GlobMatcher};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::config::FileSourceSettings;
use crate::edge::Outbox;
use crate::error::{Error, Result};
use crate::message::{Message, StreamItem};
use crate::source::line_reader::TailReader;

/// Poll interval for notify's fallback backend. The native backends
/// (inotify, FSEvents, ReadDirectoryChangesW) push events and ignore it.
const WATCH_FALLBACK_POLL: Duration = Duration::from_millis(100);

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the file name. Must stay stable: siblings on the same host
/// rely on computing identical values.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        })
}

fn fs_err(e: io::Error) -> Error {
    Error::Filesystem(e.to_string())
}

struct OpenTail {
    reader: TailReader<BufReader<File>>,
    /// Byte position the reader was seeked to at open.
    base: u64,
}

struct CurrentFile {
    path: PathBuf,
    tail: Option<OpenTail>,
}

pub struct FileTailSource {
    directory: PathBuf,
    encoding: &'static Encoding,
    glob: GlobMatcher,
    parallelism: usize,
    id: usize,
    lines_per_batch: usize,
    watch_poll: Duration,

    /// Non-negative: resume reading at that byte. Negative `v`: the file has
    /// been seen at size `-v` but never read; skip the line straddling that
    /// size before emitting.
    file_offsets: HashMap<PathBuf, i64>,
    event_queue: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    events: Option<Receiver<notify::Result<Event>>>,
    current: Option<CurrentFile>,
    /// Partial line carried across polls and across close/reopen.
    line_buf: Vec<u8>,
    /// Line refused by the outbox, re-offered before any new read.
    pending_line: Option<Message>,
}

impl FileTailSource {
    pub fn new(settings: FileSourceSettings) -> Result<Self> {
        settings.validate()?;
        let glob = Glob::new(&settings.glob)
            .map_err(|e| Error::Config(format!("invalid glob {:?}: {}", settings.glob, e)))?
            .compile_matcher();
        let encoding = Encoding::for_label(settings.charset.as_bytes())
            .ok_or_else(|| Error::Config(format!("unknown charset {:?}", settings.charset)))?;
        Ok(FileTailSource {
            directory: settings.directory,
            encoding,
            glob,
            parallelism: settings.parallelism,
            id: settings.id,
            lines_per_batch: settings.lines_per_batch,
            watch_poll: Duration::from_secs(settings.watch_poll_secs),
            file_offsets: HashMap::new(),
            event_queue: VecDeque::new(),
            queued: HashSet::new(),
            watcher: None,
            events: None,
            current: None,
            line_buf: Vec::new(),
            pending_line: None,
        })
    }

    /// The full sibling set for `settings.parallelism`, ids `0..N`. Each
    /// instance watches the same directory and keeps only the files it owns.
    pub fn sibling_set(settings: &FileSourceSettings) -> Result<Vec<FileTailSource>> {
        (0..settings.parallelism)
            .map(|id| {
                FileTailSource::new(FileSourceSettings {
                    id,
                    ..settings.clone()
                })
            })
            .collect()
    }

    /// Scans the directory and opens the watch. Existing files are recorded
    /// at their current size so only content appended afterwards is emitted.
    pub fn init(&mut self) -> Result<()> {
        // watch events carry resolved paths; offset-map keys must match
        self.directory = fs::canonicalize(&self.directory).map_err(fs_err)?;
        for entry in fs::read_dir(&self.directory).map_err(fs_err)? {
            let entry = entry.map_err(fs_err)?;
            let metadata = entry.metadata().map_err(fs_err)?;
            if metadata.is_file() {
                self.file_offsets
                    .insert(entry.path(), -(metadata.len() as i64));
            }
        }
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(event);
            },
            notify::Config::default().with_poll_interval(WATCH_FALLBACK_POLL),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;
        watcher
            .watch(&self.directory, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(e.to_string()))?;
        self.watcher = Some(watcher);
        self.events = Some(rx);
        info!("started to watch directory: {}", self.directory.display());
        Ok(())
    }

    /// Performs one batch of work. Returns `true` once the source is closed
    /// and the event queue has drained. Any `Err` is fatal and leaves the
    /// source closed.
    pub fn complete(&mut self, outbox: &mut dyn Outbox) -> Result<bool> {
        if !self.is_closed() {
            if let Err(e) = self.drain_watch_events() {
                self.close();
                return Err(e);
            }
        } else if self.event_queue.is_empty() {
            return Ok(true);
        }
        if self.current.is_none() {
            if let Some(path) = self.event_queue.pop_front() {
                self.queued.remove(&path);
                self.current = Some(CurrentFile { path, tail: None });
            }
        }
        if self.current.is_some() {
            if let Err(e) = self.process_file(outbox) {
                self.close();
                return Err(e);
            }
        }
        Ok(false)
    }

    /// Closes the current file and releases the watch. Idempotent; later
    /// `complete` calls still drain whatever is in the event queue.
    pub fn close(&mut self) {
        self.current = None;
        if self.is_closed() {
            return;
        }
        info!("closing file tail source, pending watch events will still be processed");
        self.watcher = None;
        self.events = None;
    }

    fn is_closed(&self) -> bool {
        self.watcher.is_none()
    }

    fn drain_watch_events(&mut self) -> Result<()> {
        let (batch, disconnected) = {
            let Some(rx) = self.events.as_ref() else {
                return Ok(());
            };
            let mut batch = Vec::new();
            let mut disconnected = false;
            // block only when there is no other work to do
            let idle =
                self.current.is_none() && self.event_queue.is_empty() && self.pending_line.is_none();
            if idle {
                match rx.recv_timeout(self.watch_poll) {
                    Ok(event) => batch.push(event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => disconnected = true,
                }
            }
            while !disconnected {
                match rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => disconnected = true,
                }
            }
            (batch, disconnected)
        };

        if batch.is_empty() && !disconnected {
            if !self.directory.exists() {
                info!(
                    "directory {} does not exist, stopped watching",
                    self.directory.display()
                );
                self.close();
            }
            return Ok(());
        }
        for result in batch {
            let event = result.map_err(|e| Error::Watch(e.to_string()))?;
            self.handle_event(event)?;
        }
        if disconnected {
            info!("watch channel closed, stopping watcher");
            self.close();
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        if event.need_rescan() {
            // lines written during the overflow window may be missed; offsets
            // are intact and the next modification re-enqueues the file
            warn!("watch event overflow in {}", self.directory.display());
            return Ok(());
        }
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    self.maybe_enqueue(path);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    if self.file_offsets.remove(path).is_some() {
                        debug!("file was deleted: {}", path.display());
                    }
                }
            }
            EventKind::Access(_) => {}
            kind => {
                return Err(Error::Watch(format!(
                    "unknown kind of watch event: {:?}",
                    kind
                )))
            }
        }
        Ok(())
    }

    fn maybe_enqueue(&mut self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        if !self.glob.is_match(Path::new(name)) || !self.belongs_to_this_source(name) {
            return;
        }
        if path.is_dir() {
            return;
        }
        if self.queued.insert(path.to_path_buf()) {
            debug!("will open file to read new content: {}", path.display());
            self.file_offsets.entry(path.to_path_buf()).or_insert(0);
            self.event_queue.push_back(path.to_path_buf());
        }
    }

    fn belongs_to_this_source(&self, file_name: &OsStr) -> bool {
        fnv1a(file_name.to_string_lossy().as_bytes()) % self.parallelism as u64 == self.id as u64
    }

    fn process_file(&mut self, outbox: &mut dyn Outbox) -> Result<()> {
        if let Some(line) = self.pending_line.take() {
            if !outbox.offer(StreamItem::Message(line.clone())) {
                self.pending_line = Some(line);
                return Ok(());
            }
        }
        if !self.ensure_file_open()? {
            return Ok(());
        }
        let mut reached_eof = false;
        {
            let Some(current) = self.current.as_mut() else {
                return Ok(());
            };
            let Some(tail) = current.tail.as_mut() else {
                return Ok(());
            };
            for _ in 0..self.lines_per_batch {
                match tail
                    .reader
                    .read_complete_line(&mut self.line_buf)
                    .map_err(fs_err)?
                {
                    Some(line) => {
                        let message = Message::from(line);
                        if !outbox.offer(StreamItem::Message(message.clone())) {
                            self.pending_line = Some(message);
                            break;
                        }
                    }
                    None => {
                        let position = tail.base + tail.reader.consumed();
                        self.file_offsets
                            .insert(current.path.clone(), position as i64);
                        reached_eof = true;
                        break;
                    }
                }
            }
        }
        if reached_eof {
            self.current = None;
        }
        Ok(())
    }

    /// Opens and positions the current file if it is not open yet. `false`
    /// means the file was given up on: it disappeared, or its first new line
    /// is still incomplete and the next modification will retry.
    fn ensure_file_open(&mut self) -> Result<bool> {
        let path = match &self.current {
            Some(current) if current.tail.is_some() => return Ok(true),
            Some(current) => current.path.clone(),
            None => return Ok(false),
        };
        let offset = self.file_offsets.get(&path).copied().unwrap_or(0);
        debug!("processing file {}, previous offset: {}", path.display(), offset);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // a modification event can still arrive for a file deleted
                // just before its delete event
                debug!("file disappeared before open: {}", path.display());
                self.current = None;
                return Ok(false);
            }
            Err(e) => return Err(fs_err(e)),
        };
        // A negative offset encodes the size at which the file was first
        // seen; position one byte earlier so a preceding newline is not
        // missed, then skip past the line straddling that size.
        let base = if offset >= 0 {
            offset as u64
        } else {
            (-offset - 1) as u64
        };
        file.seek(SeekFrom::Start(base)).map_err(fs_err)?;
        let mut reader = TailReader::new(BufReader::new(file), self.encoding);
        if offset < 0 && !reader.find_next_line().map_err(fs_err)? {
            // end-of-file before the straddling line completed; keep the
            // negative offset so the next modification retries
            self.current = None;
            return Ok(false);
        }
        if let Some(current) = self.current.as_mut() {
            current.tail = Some(OpenTail { reader, base });
        }
        Ok(true)
    }
}
