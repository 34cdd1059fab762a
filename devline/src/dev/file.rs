//! File device ("File IO").
//!
//! Plain blocking file and directory operations. Every command completes
//! synchronously, so nothing is ever left on the pending list and the
//! device's poller has no work to do.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::command::{CommandSet, Outcome};
use crate::device::{Device, DeviceCtx};
use crate::error::Error;
use crate::request::{ReqToken, Request, RequestExt, RequestFlags};
use crate::sys;

bitflags! {
    /// File open and access modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileModes: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const SEEK = 1 << 3;
        const NEW = 1 << 4;
        const READONLY = 1 << 5;
        const TRUNCATE = 1 << 6;
        /// Seek to `index` before the next transfer, then clear.
        const RESEEK = 1 << 7;
        const DIR = 1 << 8;
    }
}

/// A directory entry produced by reading a `DIR` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct FileState {
    pub path: PathBuf,
    pub modes: FileModes,
    /// Size in bytes, filled by `Open` and `Query`. Zero for directories.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Target of a `Rename`.
    pub rename_to: Option<PathBuf>,
    /// Entries from the last directory read.
    pub entries: Vec<DirEntry>,
}

impl FileState {
    pub fn new(path: impl Into<PathBuf>, modes: FileModes) -> Self {
        FileState {
            path: path.into(),
            modes,
            ..Self::default()
        }
    }
}

fn state(ext: &mut RequestExt) -> Result<&mut FileState, Error> {
    match ext {
        RequestExt::File(f) => Ok(f),
        _ => Err(Error::Protocol("request has no file state".into())),
    }
}

fn c_path(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Protocol(format!("path {} contains NUL", path.display())))
}

fn stat(path: &Path) -> Result<libc::stat, Error> {
    let c = c_path(path)?;
    let mut info: libc::stat = unsafe { std::mem::zeroed() };
    sys::cvt(unsafe { libc::stat(c.as_ptr(), &mut info) })?;
    Ok(info)
}

fn is_dir(info: &libc::stat) -> bool {
    info.st_mode & libc::S_IFMT == libc::S_IFDIR
}

/// Seek to the request's index (`-1` = end) and record where we landed.
fn seek(req: &mut Request) -> Result<(), Error> {
    let pos = if req.index < 0 {
        unsafe { libc::lseek(req.handle, 0, libc::SEEK_END) }
    } else {
        unsafe { libc::lseek(req.handle, req.index as libc::off_t, libc::SEEK_SET) }
    };
    if pos < 0 {
        return Err(Error::last_os());
    }
    req.index = pos as i64;
    Ok(())
}

#[derive(Debug, Default)]
pub struct FileDevice;

impl FileDevice {
    pub fn new() -> Self {
        FileDevice
    }

    fn read_dir(&mut self, req: &mut Request) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        let entries = std::fs::read_dir(&file.path)?;
        file.entries.clear();
        for entry in entries {
            let entry = entry?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            file.entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        req.actual = file.entries.len();
        req.flags.insert(RequestFlags::DONE);
        Ok(Outcome::Done)
    }
}

impl Device for FileDevice {
    fn name(&self) -> &'static str {
        "File IO"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::OPEN
            | CommandSet::CLOSE
            | CommandSet::READ
            | CommandSet::WRITE
            | CommandSet::POLL
            | CommandSet::QUERY
            | CommandSet::CREATE
            | CommandSet::DELETE
            | CommandSet::RENAME
    }

    fn request_ext(&self) -> RequestExt {
        RequestExt::File(FileState::default())
    }

    fn poll(&mut self, _pending: &[ReqToken], _cx: &mut DeviceCtx<'_>) -> Option<bool> {
        Some(false)
    }

    fn open(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        let modes = file.modes;

        if modes.contains(FileModes::DIR) {
            let info = stat(&file.path)?;
            if !is_dir(&info) {
                return Err(Error::from_os(libc::ENOTDIR));
            }
            file.size = 0;
            file.mtime = info.st_mtime as i64;
            req.flags.insert(RequestFlags::OPEN);
            return Ok(Outcome::Done);
        }

        let mut flags = if modes.contains(FileModes::READ) {
            libc::O_RDONLY
        } else {
            libc::O_RDWR
        };
        if modes.intersects(FileModes::WRITE | FileModes::APPEND) {
            flags = libc::O_RDWR | libc::O_CREAT;
            if modes.contains(FileModes::NEW)
                || !modes.intersects(FileModes::READ | FileModes::APPEND | FileModes::SEEK)
            {
                flags |= libc::O_TRUNC;
            }
        }
        flags |= libc::O_CLOEXEC;
        let access: libc::c_uint = if modes.contains(FileModes::READONLY) {
            libc::S_IRUSR as libc::c_uint
        } else {
            (libc::S_IRUSR | libc::S_IWUSR | libc::S_IRGRP | libc::S_IWGRP | libc::S_IROTH)
                as libc::c_uint
        };

        let c = c_path(&file.path)?;
        let fd = sys::cvt(unsafe { libc::open(c.as_ptr(), flags, access) })?;

        if modes.contains(FileModes::SEEK) && unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) } < 0 {
            let err = Error::last_os();
            let _ = sys::close(fd);
            return Err(err);
        }

        let mut info: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut info) } == 0 {
            file.size = info.st_size as u64;
            file.mtime = info.st_mtime as i64;
        }
        log::debug!("opened {} as fd {fd}", file.path.display());
        req.handle = fd;
        req.flags.insert(RequestFlags::OPEN);
        Ok(Outcome::Done)
    }

    fn close(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        req.flags.remove(RequestFlags::OPEN);
        if req.handle >= 0 {
            let fd = req.handle;
            req.handle = -1;
            sys::close(fd)?;
        }
        Ok(Outcome::Done)
    }

    fn read(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let modes = state(&mut req.ext)?.modes;
        if modes.contains(FileModes::DIR) {
            return self.read_dir(req);
        }
        if req.handle < 0 {
            return Err(Error::from_os(libc::EBADF));
        }
        if modes.intersects(FileModes::SEEK | FileModes::RESEEK) {
            state(&mut req.ext)?.modes.remove(FileModes::RESEEK);
            seek(req)?;
        }

        req.data.clear();
        req.data.resize(req.length, 0);
        let ret = unsafe {
            libc::read(
                req.handle,
                req.data.as_mut_ptr() as *mut libc::c_void,
                req.length,
            )
        };
        let n = match sys::cvt_size(ret) {
            Ok(n) => n,
            Err(e) => {
                req.data.clear();
                return Err(e);
            }
        };
        req.data.truncate(n);
        req.actual = n;
        if req.index >= 0 {
            req.index += n as i64;
        }
        Ok(Outcome::Done)
    }

    fn write(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        if req.handle < 0 {
            return Err(Error::from_os(libc::EBADF));
        }
        let file = state(&mut req.ext)?;
        let modes = file.modes;
        if modes.contains(FileModes::APPEND) {
            file.modes.remove(FileModes::APPEND);
            if unsafe { libc::lseek(req.handle, 0, libc::SEEK_END) } < 0 {
                return Err(Error::last_os());
            }
        }
        if modes.intersects(FileModes::SEEK | FileModes::RESEEK | FileModes::TRUNCATE) {
            state(&mut req.ext)?.modes.remove(FileModes::RESEEK);
            seek(req)?;
            if modes.contains(FileModes::TRUNCATE) {
                sys::cvt(unsafe { libc::ftruncate(req.handle, req.index as libc::off_t) })?;
            }
        }

        let len = req.length.min(req.data.len());
        if len == 0 {
            req.actual = 0;
            return Ok(Outcome::Done);
        }
        let ret = unsafe {
            libc::write(
                req.handle,
                req.data.as_ptr() as *const libc::c_void,
                len,
            )
        };
        req.actual = sys::cvt_size(ret)?;
        if req.index >= 0 {
            req.index += req.actual as i64;
        }
        if req.flags.contains(RequestFlags::FLUSH) {
            sys::cvt(unsafe { libc::fsync(req.handle) })?;
        }
        Ok(Outcome::Done)
    }

    fn query(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        let info = stat(&file.path)?;
        if is_dir(&info) {
            file.modes.insert(FileModes::DIR);
            file.size = 0;
        } else {
            file.modes.remove(FileModes::DIR);
            file.size = info.st_size as u64;
        }
        file.mtime = info.st_mtime as i64;
        Ok(Outcome::Done)
    }

    fn create(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        if !file.modes.contains(FileModes::DIR) {
            return self.open(req, cx);
        }
        let c = c_path(&file.path)?;
        sys::cvt(unsafe { libc::mkdir(c.as_ptr(), 0o777) })?;
        Ok(Outcome::Done)
    }

    fn delete(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        let c = c_path(&file.path)?;
        if file.modes.contains(FileModes::DIR) {
            sys::cvt(unsafe { libc::rmdir(c.as_ptr()) })?;
        } else {
            sys::cvt(unsafe { libc::unlink(c.as_ptr()) })?;
        }
        Ok(Outcome::Done)
    }

    fn rename(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let file = state(&mut req.ext)?;
        let to = file
            .rename_to
            .take()
            .ok_or_else(|| Error::Protocol("rename has no target path".into()))?;
        let from_c = c_path(&file.path)?;
        let to_c = c_path(&to)?;
        sys::cvt(unsafe { libc::rename(from_c.as_ptr(), to_c.as_ptr()) })?;
        file.path = to;
        Ok(Outcome::Done)
    }
}
