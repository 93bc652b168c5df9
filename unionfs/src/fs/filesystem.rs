use std::ffi::{CStr, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::{
    Context, CreateIn, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, SetattrValid,
    ZeroCopyReader, ZeroCopyWriter, ROOT_ID,
};
use tracing::{debug, instrument};

use super::attr::gen_file_attr;
use super::{Times, UnionFs};

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn name_to_path(name: &CStr) -> &Path {
    Path::new(OsStr::from_bytes(name.to_bytes()))
}

fn file_type_bits(file_type: std::fs::FileType) -> u32 {
    if file_type.is_dir() {
        libc::S_IFDIR as u32
    } else if file_type.is_symlink() {
        libc::S_IFLNK as u32
    } else if file_type.is_file() {
        libc::S_IFREG as u32
    } else if file_type.is_fifo() {
        libc::S_IFIFO as u32
    } else if file_type.is_socket() {
        libc::S_IFSOCK as u32
    } else if file_type.is_block_device() {
        libc::S_IFBLK as u32
    } else if file_type.is_char_device() {
        libc::S_IFCHR as u32
    } else {
        0
    }
}

impl UnionFs {
    fn path_for(&self, inode: u64) -> io::Result<PathBuf> {
        self.path_for_ino(inode).ok_or_else(enoent)
    }

    fn child_path(&self, parent: u64, name: &CStr) -> io::Result<PathBuf> {
        self.child_logical_path(parent, OsStr::from_bytes(name.to_bytes()))
            .ok_or_else(enoent)
    }

    fn entry_for(&self, logical: &Path) -> io::Result<Entry> {
        let meta = self.getattr(logical)?;
        let ino = self.ino_for(logical);
        Ok(Entry {
            inode: ino,
            attr: gen_file_attr(&meta, ino).into(),
            attr_timeout: Duration::from_secs(1),
            entry_timeout: Duration::from_secs(1),
            ..Default::default()
        })
    }
}

impl FileSystem for UnionFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let child = self.child_path(parent, name)?;
        self.entry_for(&child)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let path = self.path_for(inode)?;
        let meta = UnionFs::getattr(self, &path)?;
        Ok((gen_file_attr(&meta, inode).into(), Duration::from_secs(1)))
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let path = self.path_for(inode)?;

        if valid.contains(SetattrValid::MODE) {
            UnionFs::chmod(self, &path, attr.st_mode)?;
        }
        if valid.contains(SetattrValid::UID) || valid.contains(SetattrValid::GID) {
            let uid = valid.contains(SetattrValid::UID).then_some(attr.st_uid);
            let gid = valid.contains(SetattrValid::GID).then_some(attr.st_gid);
            UnionFs::chown(self, &path, uid, gid)?;
        }
        if valid.contains(SetattrValid::SIZE) {
            UnionFs::truncate(self, &path, attr.st_size as u64)?;
        }
        if valid.contains(SetattrValid::ATIME) || valid.contains(SetattrValid::MTIME) {
            let to_time = |secs: i64, nsec: i64| {
                std::time::UNIX_EPOCH + Duration::new(secs as u64, nsec as u32)
            };
            let times = Times {
                atime: valid
                    .contains(SetattrValid::ATIME)
                    .then(|| to_time(attr.st_atime, attr.st_atime_nsec)),
                mtime: valid
                    .contains(SetattrValid::MTIME)
                    .then(|| to_time(attr.st_mtime, attr.st_mtime_nsec)),
            };
            UnionFs::utimens(self, &path, times)?;
        }

        let meta = UnionFs::getattr(self, &path)?;
        Ok((gen_file_attr(&meta, inode).into(), Duration::from_secs(1)))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.mask = mask))]
    fn access(&self, _ctx: &Context, inode: Self::Inode, mask: u32) -> io::Result<()> {
        let path = self.path_for(inode)?;
        Ok(UnionFs::access(self, &path, mask as i32)?)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        debug!("readdir");

        if inode == ROOT_ID {
            let entries = self.aggregator().list_root()?;
            for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
                let logical = Path::new("/").join(&entry.name);
                let concrete = self.router().sources()[entry.source_index].concrete_path(&entry.name);
                let meta = std::fs::symlink_metadata(&concrete)?;
                let ino = self.ino_for(&logical);
                let written = add_entry(DirEntry {
                    ino,
                    offset: offset + i as u64 + 1,
                    type_: file_type_bits(meta.file_type()),
                    name: entry.name.as_bytes(),
                })?;
                if written == 0 {
                    break;
                }
            }
            return Ok(());
        }

        let parent_path = self.path_for(inode)?;
        let names = UnionFs::readdir(self, &parent_path)?;
        for (i, name) in names.iter().enumerate().skip(offset as usize) {
            let logical = parent_path.join(name);
            let concrete = self.router().resolve(&logical);
            let meta = std::fs::symlink_metadata(&concrete)?;
            let ino = self.ino_for(&logical);
            let written = add_entry(DirEntry {
                ino,
                offset: offset + i as u64 + 1,
                type_: file_type_bits(meta.file_type()),
                name: name.as_bytes(),
            })?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        let path = self.path_for(inode)?;
        let target = UnionFs::readlink(self, &path)?;
        Ok(target.into_os_string().into_vec())
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn symlink(
        &self,
        _ctx: &Context,
        linkname: &CStr,
        parent: Self::Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        let link_path = self.child_path(parent, name)?;
        UnionFs::symlink(self, name_to_path(linkname), &link_path)?;
        self.entry_for(&link_path)
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn mknod(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        rdev: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child_path(parent, name)?;
        UnionFs::mknod(self, &path, mode, rdev as u64)?;
        self.entry_for(&path)
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn mkdir(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child_path(parent, name)?;
        UnionFs::mkdir(self, &path, mode)?;
        self.entry_for(&path)
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let path = self.child_path(parent, name)?;
        Ok(UnionFs::unlink(self, &path)?)
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let path = self.child_path(parent, name)?;
        Ok(UnionFs::rmdir(self, &path)?)
    }

    #[instrument(skip_all)]
    fn rename(
        &self,
        _ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        _flags: u32,
    ) -> io::Result<()> {
        let old_path = self.child_path(olddir, oldname)?;
        let new_path = self.child_path(newdir, newname)?;
        Ok(UnionFs::rename(self, &old_path, &new_path)?)
    }

    #[instrument(skip_all)]
    fn link(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        newparent: Self::Inode,
        newname: &CStr,
    ) -> io::Result<Entry> {
        let existing = self.path_for(inode)?;
        let new_path = self.child_path(newparent, newname)?;
        UnionFs::link(self, &existing, &new_path)?;
        self.entry_for(&new_path)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let path = self.path_for(inode)?;
        let write = (flags & (libc::O_WRONLY as u32 | libc::O_RDWR as u32)) != 0;
        let fh = UnionFs::open(self, &path, write)?;
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn create(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let path = self.child_path(parent, name)?;
        let fh = UnionFs::create(self, &path, args.mode)?;
        let entry = self.entry_for(&path)?;
        Ok((entry, Some(fh), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let _ = inode;
        let mut buf = vec![0u8; size as usize];
        let n = UnionFs::read(self, handle, &mut buf, offset)?;
        w.write(&buf[..n])
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let _ = inode;
        let mut buf = vec![0u8; size as usize];
        let read = r.read(&mut buf)?;
        Ok(UnionFs::write(self, handle, &buf[..read], offset)?)
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn flush(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _lock_owner: u64,
    ) -> io::Result<()> {
        let _ = inode;
        Ok(UnionFs::flush(self, handle)?)
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn fsync(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        datasync: bool,
        handle: Self::Handle,
    ) -> io::Result<()> {
        let _ = inode;
        Ok(UnionFs::fsync(self, handle, datasync)?)
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        let _ = inode;
        Ok(UnionFs::release(self, handle)?)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn statfs(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<libc::statvfs64> {
        let path = self.path_for(inode)?;
        let agg = UnionFs::statfs(self, &path)?;

        // SAFETY: `libc::statvfs64` is a plain-old-data struct; every
        // platform carries reserved/padding fields the public `statvfs(2)`
        // API gives no way to populate, so zeroing them is the only option.
        let mut out: libc::statvfs64 = unsafe { std::mem::zeroed() };
        out.f_bsize = agg.block_size;
        out.f_frsize = agg.fragment_size;
        out.f_blocks = agg.blocks;
        out.f_bfree = agg.blocks_free;
        out.f_bavail = agg.blocks_available;
        out.f_files = agg.files;
        out.f_ffree = agg.files_free;
        out.f_favail = agg.files_available;
        out.f_namemax = agg.name_max;
        out.f_flag = agg.flags;
        Ok(out)
    }
}

use std::os::unix::ffi::OsStringExt;
