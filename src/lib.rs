//! Direct userspace interface to the ZFS-on-Linux control device.
//!
//! No mounting, no property policy, no history log, nothing shelled out:
//! every operation is an explicit ioctl against `/dev/zfs`, with requests
//! and replies marshalled through the kernel's nvlist format by a
//! pure-Rust codec.

mod error;
pub use error::{Error, Result};
mod ioctl;
pub use ioctl::{Handle, DEFAULT_DEV_PATH};
pub mod nvlist;
mod ops;
pub use ops::*;
mod stream;
pub use stream::{ReceiveStream, SendStream, BEGIN_RECORD_SIZE};
mod sys;
pub use sys::{DmuObjsetStats, DrrBegin, Ioc, ZfsCmd, ZfsShare, ZfsStat, ZinjectRecord};


/// Test env holding the backing file for a file-vdev pool.
///
/// If `dev_size` is not zero, a temp file of that many bytes is created to
/// act as the pool's block device. Everything is deleted when the env goes
/// out of scope.
#[cfg(test)]
pub(crate) struct ZfsTestEnv {
    dev_file: tempfile::NamedTempFile,
}

#[cfg(test)]
impl ZfsTestEnv {
    pub fn new(dev_size: u64) -> Self {
        let dev_file = tempfile::NamedTempFile::new().unwrap();
        if dev_size > 0 {
            dev_file.as_file().set_len(dev_size).unwrap();
        }
        ZfsTestEnv { dev_file }
    }

    pub fn dev_path(&self) -> &str {
        self.dev_file.path().to_str().unwrap()
    }
}
