// ABOUTME: Debounced incremental cartridge upload driven by file-system events
// ABOUTME: Coalesces bursts of changes into one zip upload plus deletes, with a cooldown after failures

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::{code_version_dir, upload_and_unzip, Cartridge};
use crate::archive::write_zip;
use crate::remote::webdav;
use crate::remote::Instance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Upsert(PathBuf),
    Remove(PathBuf),
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub debounce: Duration,
    /// Quiet period after a failed upload.
    pub cooldown: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub uploads: Vec<PathBuf>,
    pub deletes: Vec<PathBuf>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }
}

/// Paths waiting for the next flush. The latest change to a path wins.
#[derive(Debug, Default)]
pub struct PendingChanges {
    to_upload: BTreeSet<PathBuf>,
    to_delete: BTreeSet<PathBuf>,
}

impl PendingChanges {
    pub fn record(&mut self, change: FsChange) {
        match change {
            FsChange::Upsert(path) => {
                self.to_delete.remove(&path);
                self.to_upload.insert(path);
            }
            FsChange::Remove(path) => {
                self.to_upload.remove(&path);
                self.to_delete.insert(path);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }

    pub fn take(&mut self) -> Batch {
        Batch {
            uploads: std::mem::take(&mut self.to_upload).into_iter().collect(),
            deletes: std::mem::take(&mut self.to_delete).into_iter().collect(),
        }
    }

    /// Puts a failed batch back without overriding changes recorded since.
    pub fn requeue(&mut self, batch: Batch) {
        for path in batch.uploads {
            if !self.to_delete.contains(&path) {
                self.to_upload.insert(path);
            }
        }
        for path in batch.deletes {
            if !self.to_upload.contains(&path) {
                self.to_delete.insert(path);
            }
        }
    }
}

fn remote_path(cartridges: &[Cartridge], path: &Path) -> Option<String> {
    cartridges.iter().find_map(|c| c.remote_path(path))
}

/// Uploads changed files as one zip, then deletes removed ones.
pub async fn upload_batch(
    instance: &dyn Instance,
    code_version: &str,
    cartridges: &[Cartridge],
    batch: &Batch,
) -> Result<()> {
    let dir = code_version_dir(code_version);
    let mut files = Vec::new();
    for path in &batch.uploads {
        let Some(name) = remote_path(cartridges, path) else {
            debug!("{} is outside every cartridge", path.display());
            continue;
        };
        match std::fs::read(path) {
            Ok(data) => files.push((name, data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} vanished before upload", path.display())
            }
            Err(e) if path.is_dir() => debug!("Skipping directory {}: {}", path.display(), e),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        }
    }

    if !files.is_empty() {
        let names: Vec<String> = files.iter().map(|(n, _)| n.clone()).collect();
        upload_and_unzip(instance, &dir, "_watch", write_zip(files)?).await?;
        for name in names {
            info!("[UPLOAD] {}", name);
        }
    }

    for path in &batch.deletes {
        if let Some(name) = remote_path(cartridges, path) {
            instance.delete_file(&webdav::join(&[&dir, &name])).await?;
            info!("[DELETE] {}", name);
        }
    }
    Ok(())
}

/// Consumes change events until the channel closes. Each burst is flushed
/// once no event has arrived for `debounce`; a failed flush is retried
/// after `cooldown` together with anything recorded meanwhile.
pub async fn run_watch_loop(
    instance: &dyn Instance,
    code_version: &str,
    cartridges: &[Cartridge],
    mut events: mpsc::UnboundedReceiver<FsChange>,
    options: WatchOptions,
) -> Result<()> {
    let mut pending = PendingChanges::default();
    let mut deadline: Option<Instant> = None;
    let mut cooldown_until: Option<Instant> = None;
    let mut open = true;

    while open || !pending.is_empty() {
        let flush_at = match (deadline, cooldown_until) {
            (Some(d), Some(c)) => Some(d.max(c)),
            (d, _) if open => d,
            // closed: flush what is left as soon as the cooldown allows
            (_, c) => Some(c.unwrap_or_else(Instant::now)),
        };
        let timer = sleep_until(flush_at.unwrap_or_else(|| Instant::now() + options.debounce));

        tokio::select! {
            event = events.recv(), if open => match event {
                Some(change) => {
                    pending.record(change);
                    deadline = Some(Instant::now() + options.debounce);
                }
                None => open = false,
            },
            _ = timer, if flush_at.is_some() => {
                deadline = None;
                let batch = pending.take();
                if batch.is_empty() {
                    continue;
                }
                match upload_batch(instance, code_version, cartridges, &batch).await {
                    Ok(()) => cooldown_until = None,
                    Err(e) => {
                        error!("Upload failed: {:#}", e);
                        warn!("Pausing uploads for {}s", options.cooldown.as_secs());
                        pending.requeue(batch);
                        let now = Instant::now();
                        cooldown_until = Some(now + options.cooldown);
                        deadline = Some(now);
                        if !open {
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn changes_from(event: Event) -> Vec<FsChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|p| {
                if p.exists() {
                    FsChange::Upsert(p)
                } else {
                    FsChange::Remove(p)
                }
            })
            .collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(FsChange::Remove).collect(),
        _ => Vec::new(),
    }
}

/// Watches every cartridge directory and uploads changes until interrupted.
pub async fn watch_cartridges(
    instance: &dyn Instance,
    code_version: &str,
    cartridges: &[Cartridge],
    options: WatchOptions,
) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for change in changes_from(event) {
                    let _ = tx.send(change);
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        },
        Config::default(),
    )
    .context("Failed to start file watcher")?;

    for cartridge in cartridges {
        watcher
            .watch(&cartridge.src, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", cartridge.src.display()))?;
        info!("Watching {}", cartridge.name);
    }

    tokio::select! {
        result = run_watch_loop(instance, code_version, cartridges, rx, options) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping watch");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::find_cartridges;
    use crate::code::tests::cartridge_tree;
    use crate::testing::{FakeInstance, Op};

    fn unzips(fake: &FakeInstance) -> usize {
        fake.ops()
            .iter()
            .filter(|op| matches!(op, Op::Unzip(_)))
            .count()
    }

    #[test]
    fn test_pending_changes_latest_wins() {
        let mut pending = PendingChanges::default();
        pending.record(FsChange::Upsert(PathBuf::from("a")));
        pending.record(FsChange::Remove(PathBuf::from("a")));
        pending.record(FsChange::Upsert(PathBuf::from("b")));
        let batch = pending.take();
        assert_eq!(batch.uploads, vec![PathBuf::from("b")]);
        assert_eq!(batch.deletes, vec![PathBuf::from("a")]);
        assert!(pending.is_empty());

        pending.record(FsChange::Upsert(PathBuf::from("a")));
        pending.requeue(batch);
        let again = pending.take();
        assert_eq!(again.uploads, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert!(again.deletes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_one_batch_and_late_event_another() {
        let dir = tempfile::tempdir().unwrap();
        cartridge_tree(dir.path());
        let cartridges = find_cartridges(dir.path(), &[]).unwrap();
        let scripts = cartridges[0].src.join("cartridge/scripts");
        for i in 0..5 {
            std::fs::write(scripts.join(format!("file{}.js", i)), "x").unwrap();
        }
        std::fs::write(scripts.join("late.js"), "y").unwrap();
        let fake = FakeInstance::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let producer = async {
            for i in 0..5 {
                tx.send(FsChange::Upsert(scripts.join(format!("file{}.js", i))))
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(unzips(&fake), 1);
            tx.send(FsChange::Upsert(scripts.join("late.js"))).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(tx);
        };
        let (result, ()) = tokio::join!(
            run_watch_loop(&fake, "version1", &cartridges, rx, WatchOptions::default()),
            producer
        );
        result.unwrap();

        assert_eq!(unzips(&fake), 2);
        let files = fake.files_under("Cartridges/version1/app_custom/cartridge/scripts");
        assert_eq!(files.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_waits_for_cooldown_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        cartridge_tree(dir.path());
        let cartridges = find_cartridges(dir.path(), &[]).unwrap();
        let scripts = cartridges[0].src.join("cartridge/scripts");
        std::fs::write(scripts.join("first.js"), "1").unwrap();
        std::fs::write(scripts.join("second.js"), "2").unwrap();
        let fake = FakeInstance::new();
        fake.fail_next_puts(1);
        let (tx, rx) = mpsc::unbounded_channel();

        let producer = async {
            tx.send(FsChange::Upsert(scripts.join("first.js"))).unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(FsChange::Upsert(scripts.join("second.js"))).unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(unzips(&fake), 0);
            tokio::time::sleep(Duration::from_secs(4)).await;
            drop(tx);
        };
        let (result, ()) = tokio::join!(
            run_watch_loop(&fake, "version1", &cartridges, rx, WatchOptions::default()),
            producer
        );
        result.unwrap();

        assert_eq!(unzips(&fake), 1);
        let files = fake.files_under("Cartridges/version1/app_custom/cartridge/scripts");
        assert!(files.iter().any(|f| f.ends_with("first.js")));
        assert!(files.iter().any(|f| f.ends_with("second.js")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_files_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        cartridge_tree(dir.path());
        let cartridges = find_cartridges(dir.path(), &[]).unwrap();
        let fake = FakeInstance::new();
        fake.put_file_sync("Cartridges/version1/app_custom/gone.js", b"x".to_vec());
        let batch = Batch {
            uploads: Vec::new(),
            deletes: vec![cartridges[0].src.join("gone.js")],
        };

        upload_batch(&fake, "version1", &cartridges, &batch).await.unwrap();

        assert!(fake.file("Cartridges/version1/app_custom/gone.js").is_none());
        assert_eq!(unzips(&fake), 0);
    }
}
