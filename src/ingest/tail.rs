//! Tails local files matching doublestar glob patterns, resuming from a
//! persisted bookmark and following rotation/truncation by inode.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ingest::Ingester;
use crate::record::{Attrs, IngestMessage};
use crate::scheduler::CancelFlag;

const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct FileBookmark {
    inode: u64,
    offset: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct Bookmarks {
    files: HashMap<String, FileBookmark>,
}

impl Bookmarks {
    fn load(path: &Path) -> Self {
        fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub struct TailIngester {
    pub id: String,
    pub patterns: Vec<String>,
    pub poll_interval: Option<Duration>,
    pub state_path: Option<PathBuf>,
}

struct TrackedFile {
    path: PathBuf,
    inode: u64,
    offset: u64,
}

#[async_trait]
impl Ingester for TailIngester {
    async fn run(&self, cancel: CancelFlag, out: mpsc::Sender<IngestMessage>) -> anyhow::Result<()> {
        let bookmarks = Arc::new(Mutex::new(match &self.state_path {
            Some(path) => Bookmarks::load(path),
            None => Bookmarks::default(),
        }));
        let tracked: Arc<Mutex<HashMap<PathBuf, TrackedFile>>> = Arc::new(Mutex::new(HashMap::new()));

        discover_and_seek(&self.patterns, &bookmarks.lock(), &mut tracked.lock())?;

        let (fs_events_tx, mut fs_events_rx) = mpsc::channel::<notify::DebouncedEvent>(1024);
        let watch_dirs = static_watch_dirs(&self.patterns);
        let _watcher_thread = spawn_watcher(watch_dirs, fs_events_tx);

        let mut poll_ticker = tokio::time::interval(self.poll_interval.unwrap_or(Duration::from_secs(5)));

        loop {
            if cancel.load(Ordering::Relaxed) {
                if let Some(path) = &self.state_path {
                    let _ = bookmarks.lock().save(path);
                }
                return Ok(());
            }

            tokio::select! {
                event = fs_events_rx.recv() => {
                    match event {
                        Some(event) => handle_fs_event(event, &self.patterns, &tracked, &bookmarks, &out, &self.id).await,
                        None => {}
                    }
                }
                _ = poll_ticker.tick(), if self.poll_interval.is_some() => {
                    let _ = discover_and_seek(&self.patterns, &bookmarks.lock(), &mut tracked.lock());
                    read_all_tracked(&tracked, &bookmarks, &out, &self.id).await;
                    if let Some(path) = &self.state_path {
                        let _ = bookmarks.lock().save(path);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    // re-check cancellation even with no events/ticks due
                }
            }
        }
    }
}

fn static_watch_dirs(patterns: &[String]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for pattern in patterns {
        let static_prefix = pattern.split(['*', '?', '[']).next().unwrap_or("");
        let dir = Path::new(static_prefix).parent().unwrap_or_else(|| Path::new("."));
        if !dirs.contains(&dir.to_path_buf()) {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs
}

fn spawn_watcher(dirs: Vec<PathBuf>, tx: mpsc::Sender<notify::DebouncedEvent>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (std_tx, std_rx) = std::sync::mpsc::channel();
        let watcher = notify::watcher(std_tx, Duration::from_millis(200));
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                warn!("tail ingester failed to start filesystem watcher: {}", e);
                return;
            }
        };
        let mut active: Vec<RecommendedWatcher> = Vec::new();
        for dir in &dirs {
            if watcher.watch(dir, RecursiveMode::NonRecursive).is_ok() {
                debug!("watching {:?} for tail events", dir);
            }
        }
        active.push(watcher);

        while let Ok(event) = std_rx.recv() {
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    })
}

async fn handle_fs_event(
    event: notify::DebouncedEvent,
    patterns: &[String],
    tracked: &Arc<Mutex<HashMap<PathBuf, TrackedFile>>>,
    bookmarks: &Arc<Mutex<Bookmarks>>,
    out: &mpsc::Sender<IngestMessage>,
    ingester_id: &str,
) {
    use notify::DebouncedEvent::*;
    match event {
        Create(path) | Write(path) | Chmod(path) => {
            if matches_any(patterns, &path) {
                ensure_tracked(&path, tracked);
                read_one(&path, tracked, bookmarks, out, ingester_id).await;
            }
        }
        Remove(path) | Rename(path, _) => {
            tracked.lock().remove(&path);
        }
        _ => {}
    }
}

fn matches_any(patterns: &[String], path: &Path) -> bool {
    patterns.iter().any(|pattern| {
        glob::glob(pattern)
            .map(|mut paths| paths.any(|p| p.map(|p| p == path).unwrap_or(false)))
            .unwrap_or(false)
    })
}

fn ensure_tracked(path: &Path, tracked: &Arc<Mutex<HashMap<PathBuf, TrackedFile>>>) {
    let mut tracked = tracked.lock();
    if !tracked.contains_key(path) {
        if let Ok(meta) = fs::metadata(path) {
            tracked.insert(
                path.to_path_buf(),
                TrackedFile { path: path.to_path_buf(), inode: meta.ino(), offset: 0 },
            );
        }
    }
}

fn discover_and_seek(
    patterns: &[String],
    bookmarks: &Bookmarks,
    tracked: &mut HashMap<PathBuf, TrackedFile>,
) -> anyhow::Result<()> {
    for pattern in patterns {
        let paths = glob::glob(pattern)?;
        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(_) => continue,
            };
            if tracked.contains_key(&path) {
                continue;
            }
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let inode = meta.ino();
            let size = meta.size();
            let key = path.to_string_lossy().into_owned();

            let offset = match bookmarks.files.get(&key) {
                Some(bookmark) if bookmark.inode == inode && bookmark.offset <= size => bookmark.offset,
                _ => size, // fresh file: never flood history on first sight
            };

            tracked.insert(path.clone(), TrackedFile { path, inode, offset });
        }
    }
    Ok(())
}

async fn read_all_tracked(
    tracked: &Arc<Mutex<HashMap<PathBuf, TrackedFile>>>,
    bookmarks: &Arc<Mutex<Bookmarks>>,
    out: &mpsc::Sender<IngestMessage>,
    ingester_id: &str,
) {
    let paths: Vec<PathBuf> = tracked.lock().keys().cloned().collect();
    for path in paths {
        read_one(&path, tracked, bookmarks, out, ingester_id).await;
    }
}

async fn read_one(
    path: &Path,
    tracked: &Arc<Mutex<HashMap<PathBuf, TrackedFile>>>,
    bookmarks: &Arc<Mutex<Bookmarks>>,
    out: &mpsc::Sender<IngestMessage>,
    ingester_id: &str,
) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    let current_inode = meta.ino();
    let current_size = meta.size();

    let mut state = {
        let tracked_guard = tracked.lock();
        match tracked_guard.get(path) {
            Some(f) => TrackedFile { path: f.path.clone(), inode: f.inode, offset: f.offset },
            None => return,
        }
    };

    if state.inode != current_inode {
        state.inode = current_inode;
        state.offset = 0; // rotation: reopen at offset 0 of the new inode
    } else if current_size < state.offset {
        state.offset = 0; // truncation: reset without skipping lines
    }

    let Ok(mut file) = File::open(path) else {
        return;
    };
    if file.seek(SeekFrom::Start(state.offset)).is_err() {
        return;
    }

    let mut reader = BufReader::new(file);
    let mut consumed: u64 = 0;
    loop {
        let mut line = Vec::new();
        let n = match read_bounded_line(&mut reader, &mut line) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break; // no complete trailing line yet
        }
        if !line.ends_with(b"\n") {
            break; // incomplete line at EOF, leave it (and its bytes) for next read
        }
        consumed += n as u64;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let mut attrs = Attrs::new();
        attrs.insert("ingester_type".to_string(), "tail".to_string());
        attrs.insert("file".to_string(), state.path.to_string_lossy().into_owned());
        let mut msg = IngestMessage::new(line, ingester_id.to_string());
        msg.attrs = attrs;
        if out.send(msg).await.is_err() {
            return;
        }
    }

    state.offset += consumed;

    tracked.lock().insert(
        path.to_path_buf(),
        TrackedFile { path: state.path.clone(), inode: state.inode, offset: state.offset },
    );
    bookmarks.lock().files.insert(
        path.to_string_lossy().into_owned(),
        FileBookmark { inode: state.inode, offset: state.offset },
    );
}

fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(total);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..=pos]);
            total += pos + 1;
            reader.consume(pos + 1);
            return Ok(total);
        }
        let chunk_len = available.len();
        if buf.len() + chunk_len > MAX_LINE_BYTES {
            let take = MAX_LINE_BYTES.saturating_sub(buf.len());
            buf.extend_from_slice(&available[..take]);
            reader.consume(chunk_len);
            total += chunk_len;
            return Ok(total); // oversized line: truncate rather than unbounded growth
        }
        buf.extend_from_slice(available);
        total += chunk_len;
        reader.consume(chunk_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_seeks_to_eof_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"preexisting\ncontent\n").unwrap();

        let bookmarks = Bookmarks::default();
        let mut tracked = HashMap::new();
        let pattern = dir.path().join("*.log").to_string_lossy().into_owned();
        discover_and_seek(&[pattern], &bookmarks, &mut tracked).unwrap();

        let state = tracked.get(&path).unwrap();
        let size = fs::metadata(&path).unwrap().len();
        assert_eq!(state.offset, size);
    }

    #[test]
    fn matching_bookmark_resumes_from_stored_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        fs::write(&path, b"0123456789").unwrap();
        let inode = fs::metadata(&path).unwrap().ino();

        let mut bookmarks = Bookmarks::default();
        bookmarks.files.insert(path.to_string_lossy().into_owned(), FileBookmark { inode, offset: 5 });

        let mut tracked = HashMap::new();
        let pattern = dir.path().join("*.log").to_string_lossy().into_owned();
        discover_and_seek(&[pattern], &bookmarks, &mut tracked).unwrap();

        assert_eq!(tracked.get(&path).unwrap().offset, 5);
    }

    #[test]
    fn bookmark_with_mismatched_inode_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.log");
        fs::write(&path, b"0123456789").unwrap();

        let mut bookmarks = Bookmarks::default();
        bookmarks.files.insert(path.to_string_lossy().into_owned(), FileBookmark { inode: 999_999_999, offset: 5 });

        let mut tracked = HashMap::new();
        let pattern = dir.path().join("*.log").to_string_lossy().into_owned();
        discover_and_seek(&[pattern], &bookmarks, &mut tracked).unwrap();

        let size = fs::metadata(&path).unwrap().len();
        assert_eq!(tracked.get(&path).unwrap().offset, size);
    }

    #[test]
    fn bookmarks_roundtrip_through_temp_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("tail").join("ing1.json");
        let mut bookmarks = Bookmarks::default();
        bookmarks.files.insert("/var/log/a.log".to_string(), FileBookmark { inode: 42, offset: 100 });
        bookmarks.save(&path).unwrap();

        let loaded = Bookmarks::load(&path);
        let entry = loaded.files.get("/var/log/a.log").unwrap();
        assert_eq!(entry.inode, 42);
        assert_eq!(entry.offset, 100);
    }

    #[test]
    fn read_bounded_line_splits_on_newline_and_keeps_partial() {
        let data = b"first\nsecond\npartial".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let mut line = Vec::new();
        let n = read_bounded_line(&mut reader, &mut line).unwrap();
        assert_eq!(n, 6);
        assert_eq!(line, b"first\n");

        let mut line2 = Vec::new();
        read_bounded_line(&mut reader, &mut line2).unwrap();
        assert_eq!(line2, b"second\n");

        let mut line3 = Vec::new();
        let n3 = read_bounded_line(&mut reader, &mut line3).unwrap();
        assert_eq!(n3, 7);
        assert_eq!(line3, b"partial"); // no trailing newline, caller leaves it
    }

    #[tokio::test]
    async fn unterminated_trailing_line_is_not_double_counted_once_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        fs::write(&path, b"first\nsecond-part").unwrap();
        let inode = fs::metadata(&path).unwrap().ino();

        let tracked = Arc::new(Mutex::new(HashMap::new()));
        tracked.lock().insert(path.clone(), TrackedFile { path: path.clone(), inode, offset: 0 });
        let bookmarks = Arc::new(Mutex::new(Bookmarks::default()));
        let (tx, mut rx) = mpsc::channel(8);

        read_one(&path, &tracked, &bookmarks, &tx, "ing1").await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.raw, b"first");

        // The offset bookmark must stop right after "first\n", not include
        // any of the unterminated "second-part" bytes.
        assert_eq!(tracked.lock().get(&path).unwrap().offset, 6);

        // Completing the line with a later append must yield the whole
        // line, not just the bytes written after the earlier read.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        file.write_all(b"-done\n").unwrap();
        drop(file);

        read_one(&path, &tracked, &bookmarks, &tx, "ing1").await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.raw, b"second-part-done");
    }
}
