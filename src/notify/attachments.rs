//! Attachment retrieval from execution agents.
//!
//! The production fetcher reads agent workspaces mounted under a local root,
//! one directory per server host. Each file is first copied into a scratch
//! [`tempfile::NamedTempFile`] so a log still being written by the agent is
//! captured as one consistent snapshot; the scratch file is removed when it
//! drops, on every exit path.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::model::ServerRow;

/// Files larger than this are not attached.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub filename: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, server: &ServerRow, remote_path: &str) -> Result<FetchedFile>;
}

pub struct WorkspaceFetcher {
    root: PathBuf,
}

impl WorkspaceFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceFetcher { root: root.into() }
    }

    /// Map an agent-side absolute path onto the local mount. Windows agents
    /// report `\`-separated paths, which are read as `/`.
    fn local_path(&self, host: &str, remote_path: &str) -> Result<PathBuf> {
        if !is_plain_host(host) {
            bail!("server host is not a plain directory name: {:?}", host);
        }
        let remote_path = remote_path.replace('\\', "/");
        let mut local = self.root.join(host);
        for component in Path::new(&remote_path).components() {
            match component {
                Component::Normal(part) => local.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    bail!("attachment path escapes the workspace: {}", remote_path)
                }
            }
        }
        Ok(local)
    }
}

/// A host names exactly one directory under the workspace root.
pub fn is_plain_host(host: &str) -> bool {
    let mut components = Path::new(host).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !host.contains('\\')
}

fn snapshot(path: &Path) -> Result<Vec<u8>> {
    let mut source =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut scratch = tempfile::NamedTempFile::new()?;
    let copied = std::io::copy(
        &mut (&mut source).take(MAX_ATTACHMENT_BYTES + 1),
        scratch.as_file_mut(),
    )?;
    drop(source);
    if copied > MAX_ATTACHMENT_BYTES {
        bail!(
            "{} exceeds the {} byte attachment limit",
            path.display(),
            MAX_ATTACHMENT_BYTES
        );
    }

    let file = scratch.as_file_mut();
    file.seek(SeekFrom::Start(0))?;
    let mut data = Vec::with_capacity(usize::try_from(copied).unwrap_or(0));
    file.read_to_end(&mut data)?;
    Ok(data)
}

#[async_trait]
impl AttachmentFetcher for WorkspaceFetcher {
    async fn fetch(&self, server: &ServerRow, remote_path: &str) -> Result<FetchedFile> {
        let local = self.local_path(&server.host, remote_path)?;
        let filename = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("attachment path has no file name: {}", remote_path))?;
        let data = tokio::task::spawn_blocking(move || snapshot(&local)).await??;
        Ok(FetchedFile { filename, data })
    }
}
