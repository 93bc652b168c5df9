use std::os::unix::fs::MetadataExt;

use fuse_backend_rs::abi::fuse_abi::Attr;

/// Builds an [Attr] from a real `lstat` of a source file. Every field here
/// is the concrete file's own, so union members (including the root, which
/// is just the first source's root directory) keep their original
/// permissions, ownership and timestamps.
pub fn gen_file_attr(meta: &std::fs::Metadata, inode: u64) -> Attr {
    Attr {
        ino: inode,
        size: meta.size(),
        blksize: meta.blksize() as u32,
        blocks: meta.blocks(),
        mode: meta.mode(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        atimensec: meta.atime_nsec() as u32,
        mtimensec: meta.mtime_nsec() as u32,
        ctimensec: meta.ctime_nsec() as u32,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: 0,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}
