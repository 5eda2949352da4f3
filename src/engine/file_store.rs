use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use crate::communication::{MessageDispatchRegistry, Sender};
use crate::error::{CommunicationError, EngineError};
use crate::protocol::{CacheHighWaterMark, DistributeFile, Message, MessageKind};

const README_FILE: &str = "README.txt";
const INCOMING_DIR: &str = "incoming";
const CURRENT_DIR: &str = "current";
const README_TEXT: &str = "\
This directory is managed by a loadmesh agent.

Files distributed by the console arrive in 'incoming' and are copied to
'current' when a run starts. Anything here may be deleted when the console
clears the cache.
";

fn store_error(path: &Path) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::FileStore {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolves a distributed path under `root`, refusing anything that could
/// escape it.
fn resolve_relative(root: &Path, relative: &str) -> Result<PathBuf, EngineError> {
    let candidate = Path::new(relative);
    let mut resolved = root.to_path_buf();
    let mut depth = 0_usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth = depth.saturating_add(1);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(EngineError::InvalidDistributionPath {
                    path: relative.to_owned(),
                });
            }
        }
    }
    if depth == 0 {
        return Err(EngineError::InvalidDistributionPath {
            path: relative.to_owned(),
        });
    }
    Ok(resolved)
}

async fn delete_contents(directory: &Path) -> Result<(), EngineError> {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(store_error(directory)(err)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(store_error(directory))? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(store_error(&path))?;
        let removed = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(store_error(&path))?;
    }
    Ok(())
}

async fn is_newer(source: &Path, destination: &Path) -> Result<bool, EngineError> {
    let source_modified = tokio::fs::metadata(source)
        .await
        .and_then(|metadata| metadata.modified())
        .map_err(store_error(source))?;
    match tokio::fs::metadata(destination).await {
        Ok(metadata) => {
            let destination_modified = metadata.modified().map_err(store_error(destination))?;
            Ok(source_modified > destination_modified)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(store_error(destination)(err)),
    }
}

/// Copies the tree under `from` into `to`. A full copy empties `to` first;
/// an incremental copy only replaces files older than their source.
async fn copy_tree(from: &Path, to: &Path, incremental: bool) -> Result<usize, EngineError> {
    tokio::fs::create_dir_all(to).await.map_err(store_error(to))?;
    if !incremental {
        delete_contents(to).await?;
    }

    let mut copied = 0_usize;
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source_dir, target_dir)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&source_dir)
            .await
            .map_err(store_error(&source_dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(store_error(&source_dir))? {
            let source = entry.path();
            let destination = target_dir.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(store_error(&source))?;

            if file_type.is_dir() {
                tokio::fs::create_dir_all(&destination)
                    .await
                    .map_err(store_error(&destination))?;
                pending.push((source, destination));
            } else if !incremental || is_newer(&source, &destination).await? {
                tokio::fs::copy(&source, &destination)
                    .await
                    .map_err(store_error(&destination))?;
                copied = copied.saturating_add(1);
            }
        }
    }
    Ok(copied)
}

struct Directories {
    incremental: bool,
}

/// Agent-side cache of files distributed by the console.
///
/// Files arrive in `incoming/`; [`directory`](Self::directory) brings
/// `current/` up to date with them and returns it.
pub struct FileStore {
    readme: PathBuf,
    incoming: PathBuf,
    current: PathBuf,
    directories: AsyncMutex<Directories>,
    high_water_mark: Mutex<CacheHighWaterMark>,
}

impl FileStore {
    /// Opens a store rooted at `directory`, which need not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error when `directory` exists but is not a writable
    /// directory.
    pub async fn open(directory: &Path) -> Result<Self, EngineError> {
        let root = std::path::absolute(directory).map_err(store_error(directory))?;
        match tokio::fs::metadata(&root).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(EngineError::NotADirectory { path: root });
            }
            Ok(metadata) if metadata.permissions().readonly() => {
                return Err(store_error(&root)(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "directory is read only",
                )));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(store_error(&root)(err)),
        }

        Ok(Self {
            readme: root.join(README_FILE),
            incoming: root.join(INCOMING_DIR),
            current: root.join(CURRENT_DIR),
            directories: AsyncMutex::new(Directories { incremental: false }),
            high_water_mark: Mutex::new(CacheHighWaterMark::out_of_date()),
        })
    }

    /// Brings `current/` up to date with `incoming/` and returns it. The
    /// first call after opening or clearing copies everything.
    ///
    /// # Errors
    ///
    /// Returns an error when the copy fails.
    pub async fn directory(&self) -> Result<PathBuf, EngineError> {
        let mut directories = self.directories.lock().await;
        if tokio::fs::try_exists(&self.incoming)
            .await
            .map_err(store_error(&self.incoming))?
        {
            let copied = copy_tree(&self.incoming, &self.current, directories.incremental).await?;
            debug!("Copied {} file(s) into {}", copied, self.current.display());
        } else {
            tokio::fs::create_dir_all(&self.current)
                .await
                .map_err(store_error(&self.current))?;
        }
        directories.incremental = true;
        Ok(self.current.clone())
    }

    #[must_use]
    pub fn cache_high_water_mark(&self) -> CacheHighWaterMark {
        self.high_water_mark
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Empties `incoming/`; the next [`directory`](Self::directory) call
    /// copies everything again.
    ///
    /// # Errors
    ///
    /// Returns an error when a file cannot be removed.
    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        info!("Clearing file store");
        let mut directories = self.directories.lock().await;
        delete_contents(&self.incoming).await?;
        directories.incremental = false;
        Ok(())
    }

    /// Writes one distributed file into `incoming/`.
    ///
    /// # Errors
    ///
    /// Returns an error for paths outside the store, undecodable contents,
    /// or a failed write.
    pub async fn distribute(&self, file: &DistributeFile) -> Result<(), EngineError> {
        let target = resolve_relative(&self.incoming, &file.path)?;
        let contents = BASE64
            .decode(file.contents_b64.as_bytes())
            .map_err(|source| EngineError::Base64 {
                path: file.path.clone(),
                source,
            })?;

        let _directories = self.directories.lock().await;
        tokio::fs::create_dir_all(&self.incoming)
            .await
            .map_err(store_error(&self.incoming))?;
        self.create_readme().await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(store_error(parent))?;
        }
        info!("Updating file store: {} ({} bytes)", file.path, contents.len());
        tokio::fs::write(&target, contents)
            .await
            .map_err(store_error(&target))
    }

    pub fn checkpoint(&self, high_water_mark: CacheHighWaterMark) {
        *self
            .high_water_mark
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = high_water_mark;
    }

    async fn create_readme(&self) -> Result<(), EngineError> {
        if tokio::fs::try_exists(&self.readme)
            .await
            .map_err(store_error(&self.readme))?
        {
            return Ok(());
        }
        tokio::fs::write(&self.readme, README_TEXT)
            .await
            .map_err(store_error(&self.readme))
    }

    /// Registers handlers for the cache messages.
    pub fn register_message_handlers(self: &Arc<Self>, registry: &dyn MessageDispatchRegistry) {
        for kind in [
            MessageKind::ClearCache,
            MessageKind::DistributeFile,
            MessageKind::DistributionCacheCheckpoint,
        ] {
            registry.set_handler(kind, Arc::new(FileStoreHandler(Arc::clone(self))));
        }
    }
}

struct FileStoreHandler(Arc<FileStore>);

fn handler_failure(err: EngineError) -> CommunicationError {
    error!("{}", err);
    CommunicationError::failure(err.to_string(), err)
}

#[async_trait]
impl Sender for FileStoreHandler {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        match message {
            Message::ClearCache => self.0.clear_cache().await.map_err(handler_failure),
            Message::DistributeFile(file) => self.0.distribute(&file).await.map_err(handler_failure),
            Message::DistributionCacheCheckpoint {
                cache_high_water_mark,
            } => {
                self.0.checkpoint(cache_high_water_mark);
                Ok(())
            }
            ignored @ (Message::CloseCommunication
            | Message::NoResponse
            | Message::RequiringResponse(_)
            | Message::InitialiseWorker(_)
            | Message::StartWorkers(_)
            | Message::ResetWorkers
            | Message::StopWorkers
            | Message::AgentProcessReport(_)
            | Message::WorkerProcessReport(_)) => {
                debug!("File store ignoring {}", ignored.kind());
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {}
}
