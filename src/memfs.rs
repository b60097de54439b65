//! In-memory reference backend.
//!
//! Implements the full [`Filesystem`] capability against process memory,
//! including per-file checkpoint pre-images and extended attributes. It
//! anchors the integration tests and doubles as a worked example of what a
//! real backend must provide.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::fs::{
    CkpAct, CkpInfo, ClientIdent, FaItem, FaRequest, FileKind, Filesystem, FsError, FsFile,
    FsResult, FsStat,
};
use crate::ll::wire::OpenFlags;

const MEMFS_DEV: u64 = 1;

#[derive(Debug)]
enum PreImage {
    Range {
        offset: i64,
        old_len: u64,
        bytes: Vec<u8>,
    },
    Trunc {
        old_len: u64,
        tail_off: i64,
        bytes: Vec<u8>,
    },
}

#[derive(Debug)]
struct Slot {
    max_size: u32,
    used: u32,
    pre: Vec<PreImage>,
}

struct MemNode {
    ino: u64,
    mode: AtomicU32,
    data: RwLock<Vec<u8>>,
    xattrs: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    ckpt: Mutex<Option<Slot>>,
}

enum Entry {
    Dir { ino: u64 },
    File(Arc<MemNode>),
}

/// A memory-backed filesystem.
pub struct MemFs {
    entries: RwLock<BTreeMap<String, Entry>>,
    next_ino: AtomicU64,
    ckp_max: u32,
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFs")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl MemFs {
    pub fn new() -> Arc<MemFs> {
        let fs = MemFs {
            entries: RwLock::new(BTreeMap::new()),
            next_ino: AtomicU64::new(2),
            ckp_max: 10 << 20,
        };
        fs.entries.write().insert("/".to_string(), Entry::Dir { ino: 1 });
        Arc::new(fs)
    }

    /// Seed a file, creating parent directories.
    pub fn insert(&self, path: &str, contents: &[u8]) {
        let node = self.make_node(0o644);
        *node.data.write() = contents.to_vec();
        self.add_parents(path);
        self.entries
            .write()
            .insert(path.to_string(), Entry::File(node));
    }

    /// Read a file's current contents, for test assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.entries.read().get(path) {
            Some(Entry::File(node)) => Some(node.data.read().clone()),
            _ => None,
        }
    }

    fn make_node(&self, mode: u32) -> Arc<MemNode> {
        Arc::new(MemNode {
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            mode: AtomicU32::new(mode),
            data: RwLock::new(Vec::new()),
            xattrs: Mutex::new(BTreeMap::new()),
            ckpt: Mutex::new(None),
        })
    }

    fn add_parents(&self, path: &str) {
        let mut entries = self.entries.write();
        let mut at = 0;
        while let Some(pos) = path[at + 1..].find('/') {
            let dir = &path[..at + 1 + pos];
            let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
            entries
                .entry(dir.to_string())
                .or_insert(Entry::Dir { ino });
            at += 1 + pos;
        }
    }

    fn lookup_file(&self, path: &str) -> FsResult<Arc<MemNode>> {
        match self.entries.read().get(path) {
            Some(Entry::File(node)) => Ok(Arc::clone(node)),
            Some(Entry::Dir { .. }) => Err(FsError::io(libc::EISDIR, format!("{path} is a directory"))),
            None => Err(FsError::not_found(path)),
        }
    }

    fn node_stat(node: &MemNode) -> FsStat {
        FsStat {
            dev: MEMFS_DEV,
            ino: node.ino,
            size: node.data.read().len() as i64,
            mtime: 0,
            kind: FileKind::File,
            exec: node.mode.load(Ordering::Relaxed) & 0o111 != 0,
            readable: true,
            writable: true,
        }
    }
}

struct MemFile {
    node: Arc<MemNode>,
    writable: bool,
    ckp_max: u32,
}

impl MemFile {
    fn write_at(&self, offset: i64, data: &[u8]) -> FsResult<usize> {
        if !self.writable {
            return Err(FsError::io(libc::EACCES, "file opened read-only"));
        }
        let offset = offset as usize;
        let mut bytes = self.node.data.write();
        if bytes.len() < offset + data.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_at(&self, offset: i64, buf: &mut [u8]) -> usize {
        let bytes = self.node.data.read();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return 0;
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }
}

#[async_trait]
impl FsFile for MemFile {
    async fn read(&self, offset: i64, buf: &mut [u8]) -> FsResult<usize> {
        if offset < 0 {
            return Err(FsError::io(libc::EINVAL, "negative offset"));
        }
        Ok(self.read_at(offset, buf))
    }

    async fn write(&self, offset: i64, data: &[u8]) -> FsResult<usize> {
        if offset < 0 {
            return Err(FsError::io(libc::EINVAL, "negative offset"));
        }
        self.write_at(offset, data)
    }

    async fn pgread(&self, offset: i64, buf: &mut [u8], _verify: bool) -> FsResult<usize> {
        self.read(offset, buf).await
    }

    async fn pgwrite(&self, offset: i64, data: &[u8]) -> FsResult<usize> {
        self.write(offset, data).await
    }

    async fn sync(&self) -> FsResult<()> {
        Ok(())
    }

    async fn truncate(&self, size: i64) -> FsResult<()> {
        if !self.writable {
            return Err(FsError::io(libc::EACCES, "file opened read-only"));
        }
        self.node.data.write().resize(size as usize, 0);
        Ok(())
    }

    async fn stat(&self) -> FsResult<FsStat> {
        Ok(MemFs::node_stat(&self.node))
    }

    async fn checkpoint(&self, act: CkpAct<'_>) -> FsResult<CkpInfo> {
        let mut slot = self.node.ckpt.lock();
        match act {
            CkpAct::Create => {
                if slot.is_some() {
                    return Err(FsError::io(libc::ETXTBSY, "checkpoint already active"));
                }
                *slot = Some(Slot {
                    max_size: self.ckp_max,
                    used: 0,
                    pre: Vec::new(),
                });
                Ok(CkpInfo::default())
            }
            CkpAct::Delete => {
                if slot.take().is_none() {
                    return Err(FsError::io(libc::ENOENT, "no checkpoint active"));
                }
                Ok(CkpInfo::default())
            }
            CkpAct::Query => match slot.as_ref() {
                Some(s) => Ok(CkpInfo {
                    max_size: s.max_size,
                    used_size: s.used,
                }),
                None => Err(FsError::io(libc::ENOENT, "no checkpoint active")),
            },
            CkpAct::Restore => {
                let Some(s) = slot.take() else {
                    return Err(FsError::io(libc::ENOENT, "no checkpoint active"));
                };
                let mut bytes = self.node.data.write();
                for pre in s.pre.into_iter().rev() {
                    match pre {
                        PreImage::Range {
                            offset,
                            old_len,
                            bytes: old,
                        } => {
                            bytes.resize(old_len as usize, 0);
                            let off = offset as usize;
                            let n = old.len().min(bytes.len().saturating_sub(off));
                            bytes[off..off + n].copy_from_slice(&old[..n]);
                        }
                        PreImage::Trunc {
                            old_len,
                            tail_off,
                            bytes: old,
                        } => {
                            bytes.resize(old_len as usize, 0);
                            let off = tail_off as usize;
                            let n = old.len().min(bytes.len().saturating_sub(off));
                            bytes[off..off + n].copy_from_slice(&old[..n]);
                        }
                    }
                }
                Ok(CkpInfo::default())
            }
            CkpAct::Write { ranges } => {
                let Some(s) = slot.as_mut() else {
                    return Err(FsError::io(libc::ENOENT, "no checkpoint active"));
                };
                let bytes = self.node.data.read();
                for &(offset, len) in ranges {
                    if offset < 0 || len < 0 {
                        return Err(FsError::io(libc::EINVAL, "bad checkpoint range"));
                    }
                    let off = offset as usize;
                    let old = if off < bytes.len() {
                        bytes[off..(off + len as usize).min(bytes.len())].to_vec()
                    } else {
                        Vec::new()
                    };
                    let cost = old.len() as u32 + 24;
                    if s.used.saturating_add(cost) > s.max_size {
                        return Err(FsError::io(libc::EDQUOT, "checkpoint space exhausted"));
                    }
                    s.used += cost;
                    s.pre.push(PreImage::Range {
                        offset,
                        old_len: bytes.len() as u64,
                        bytes: old,
                    });
                }
                Ok(CkpInfo::default())
            }
            CkpAct::Trunc { size } => {
                let Some(s) = slot.as_mut() else {
                    return Err(FsError::io(libc::ENOENT, "no checkpoint active"));
                };
                let bytes = self.node.data.read();
                let off = (size.max(0) as usize).min(bytes.len());
                let old = bytes[off..].to_vec();
                let cost = old.len() as u32 + 24;
                if s.used.saturating_add(cost) > s.max_size {
                    return Err(FsError::io(libc::EDQUOT, "checkpoint space exhausted"));
                }
                s.used += cost;
                s.pre.push(PreImage::Trunc {
                    old_len: bytes.len() as u64,
                    tail_off: off as i64,
                    bytes: old,
                });
                Ok(CkpInfo::default())
            }
        }
    }

    async fn close(&self) -> FsResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Filesystem for MemFs {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        _client: &ClientIdent,
    ) -> FsResult<Box<dyn FsFile>> {
        let writable = flags.intersects(
            OpenFlags::NEW | OpenFlags::DELETE | OpenFlags::UPDATE | OpenFlags::APPEND,
        );
        let node = {
            let mut entries = self.entries.write();
            match entries.get(path) {
                Some(Entry::File(node)) => {
                    if flags.contains(OpenFlags::NEW) {
                        return Err(FsError::io(libc::EEXIST, format!("{path} exists")));
                    }
                    if flags.contains(OpenFlags::DELETE) {
                        node.data.write().clear();
                    }
                    Arc::clone(node)
                }
                Some(Entry::Dir { .. }) => {
                    return Err(FsError::io(libc::EISDIR, format!("{path} is a directory")));
                }
                None => {
                    if !writable {
                        return Err(FsError::not_found(path));
                    }
                    let node = self.make_node(mode);
                    entries.insert(path.to_string(), Entry::File(Arc::clone(&node)));
                    node
                }
            }
        };
        self.add_parents(path);
        Ok(Box::new(MemFile {
            node,
            writable,
            ckp_max: self.ckp_max,
        }))
    }

    async fn stat(&self, path: &str, _client: &ClientIdent) -> FsResult<FsStat> {
        match self.entries.read().get(path) {
            Some(Entry::File(node)) => Ok(MemFs::node_stat(node)),
            Some(Entry::Dir { ino }) => Ok(FsStat {
                dev: MEMFS_DEV,
                ino: *ino,
                size: 0,
                mtime: 0,
                kind: FileKind::Dir,
                exec: false,
                readable: true,
                writable: true,
            }),
            None => Err(FsError::not_found(path)),
        }
    }

    async fn chmod(&self, path: &str, mode: u32, _client: &ClientIdent) -> FsResult<()> {
        let node = self.lookup_file(path)?;
        node.mode.store(mode, Ordering::Relaxed);
        Ok(())
    }

    async fn mkdir(
        &self,
        path: &str,
        _mode: u32,
        mkpath: bool,
        _client: &ClientIdent,
    ) -> FsResult<()> {
        if mkpath {
            self.add_parents(path);
        }
        let mut entries = self.entries.write();
        if entries.contains_key(path) {
            return Err(FsError::io(libc::EEXIST, format!("{path} exists")));
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        entries.insert(path.to_string(), Entry::Dir { ino });
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, _client: &ClientIdent) -> FsResult<()> {
        let mut entries = self.entries.write();
        let node = entries
            .remove(from)
            .ok_or_else(|| FsError::not_found(from))?;
        entries.insert(to.to_string(), node);
        Ok(())
    }

    async fn remove(&self, path: &str, _client: &ClientIdent) -> FsResult<()> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(Entry::File(_)) => {
                entries.remove(path);
                Ok(())
            }
            Some(Entry::Dir { .. }) => Err(FsError::io(libc::EISDIR, format!("{path} is a directory"))),
            None => Err(FsError::not_found(path)),
        }
    }

    async fn rmdir(&self, path: &str, _client: &ClientIdent) -> FsResult<()> {
        let mut entries = self.entries.write();
        match entries.get(path) {
            Some(Entry::Dir { .. }) => {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                if entries.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(FsError::io(libc::ENOTEMPTY, format!("{path} not empty")));
                }
                entries.remove(path);
                Ok(())
            }
            Some(Entry::File(_)) => Err(FsError::io(libc::ENOTDIR, format!("{path} not a directory"))),
            None => Err(FsError::not_found(path)),
        }
    }

    async fn dirlist(&self, path: &str, _client: &ClientIdent) -> FsResult<Vec<String>> {
        let entries = self.entries.read();
        match entries.get(path) {
            Some(Entry::Dir { .. }) => {}
            Some(Entry::File(_)) => {
                return Err(FsError::io(libc::ENOTDIR, format!("{path} not a directory")));
            }
            None => return Err(FsError::not_found(path)),
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let mut names = Vec::new();
        for key in entries.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.push(rest.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn truncate(&self, path: &str, size: i64, _client: &ClientIdent) -> FsResult<()> {
        let node = self.lookup_file(path)?;
        node.data.write().resize(size.max(0) as usize, 0);
        Ok(())
    }

    async fn fattr(
        &self,
        path: &str,
        req: FaRequest,
        items: &mut Vec<FaItem>,
        _client: &ClientIdent,
    ) -> FsResult<()> {
        let node = self.lookup_file(path)?;
        let mut xattrs = node.xattrs.lock();
        match req {
            FaRequest::Get => {
                for item in items.iter_mut() {
                    match xattrs.get(&item.name) {
                        Some(v) => item.value = v.clone(),
                        None => item.rc = libc::ENOENT,
                    }
                }
            }
            FaRequest::Set { new_only } => {
                for item in items.iter_mut() {
                    if new_only && xattrs.contains_key(&item.name) {
                        item.rc = libc::EEXIST;
                        continue;
                    }
                    xattrs.insert(item.name.clone(), std::mem::take(&mut item.value));
                }
            }
            FaRequest::Del => {
                for item in items.iter_mut() {
                    if xattrs.remove(&item.name).is_none() {
                        item.rc = libc::ENOENT;
                    }
                }
            }
            FaRequest::List { with_values } => {
                for (name, value) in xattrs.iter() {
                    items.push(FaItem {
                        name: name.clone(),
                        value: if with_values { value.clone() } else { Vec::new() },
                        rc: 0,
                    });
                }
            }
        }
        Ok(())
    }
}
