//! The control-channel dispatcher: opens the control device, marshals up to
//! three nvlists around a fixed command record, issues the ioctl and retries
//! undersized output buffers. Every raw syscall of the crate lives here or
//! in the stream adapters; the rest of the library works on plain values.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, trace};
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::nvlist::{self, NvList};
use crate::sys::{self, Ioc, ZfsCmd};

/// Conventional path of the control device node.
pub const DEFAULT_DEV_PATH: &str = "/dev/zfs";

// Well-known character device numbers, used when the node has to be
// created first.
const DEV_MAJOR: u32 = 10;
const DEV_MINOR: u32 = 54;

const INITIAL_OUTPUT_SIZE: usize = 8 * 1024;
const OUTPUT_GROWTH_FACTOR: usize = 8;
const MAX_OUTPUT_SIZE: usize = 16 * 1024 * 1024;

static SHARED: OnceCell<Handle> = OnceCell::new();

/// An open control device. Cloning shares the underlying descriptor; the
/// kernel serializes dispatch per descriptor, so one handle can serve any
/// number of tasks.
#[derive(Debug, Clone)]
pub struct Handle {
    dev: Arc<File>,
}

impl Handle {
    /// Opens the control device at the conventional path, creating the
    /// device node first if it does not exist.
    pub fn open() -> Result<Self> {
        Self::open_at(DEFAULT_DEV_PATH)
    }

    /// Opens the control device at `path`. A missing node is created as a
    /// character device with the well-known major/minor before retrying,
    /// which needs device-creation privilege.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dev = match File::open(path) {
            Ok(dev) => dev,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("creating control device node at {}", path.display());
                let cpath = CString::new(path.as_os_str().as_bytes())
                    .map_err(|_| Error::InvalidValue("device path contains a null byte"))?;
                unsafe {
                    // Best effort; the retried open reports the real error.
                    libc::mknod(
                        cpath.as_ptr(),
                        libc::S_IFCHR | 0o666,
                        libc::makedev(DEV_MAJOR, DEV_MINOR),
                    );
                }
                File::open(path).map_err(Error::Device)?
            }
            Err(err) => return Err(Error::Device(err)),
        };
        Ok(Handle { dev: Arc::new(dev) })
    }

    /// The lazily-opened process-wide handle at the conventional path.
    pub fn shared() -> Result<&'static Handle> {
        SHARED.get_or_try_init(Handle::open)
    }

    /// Issues one control operation.
    ///
    /// `request` and `config` are marshalled into the record's primary and
    /// secondary input nvlists. An output buffer is always attached; when
    /// `response` is supplied the output nvlist is demarshalled into it
    /// after a successful call. `cmd` is committed back to the caller from
    /// the final attempt only, so records scribbled on during retried
    /// attempts never leak out.
    pub fn call(
        &self,
        ioc: Ioc,
        name: &str,
        cmd: &mut ZfsCmd,
        request: Option<&NvList>,
        response: Option<&mut NvList>,
        config: Option<&NvList>,
    ) -> Result<()> {
        let fd = self.dev.as_raw_fd();
        dispatch(
            |working| {
                let rc =
                    unsafe { libc::ioctl(fd, ioc as libc::c_ulong, working as *mut ZfsCmd) };
                if rc < 0 {
                    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
                } else {
                    0
                }
            },
            ioc,
            name,
            cmd,
            request,
            response,
            config,
        )
    }
}

/// The dispatcher proper, with the raw control call injected so the retry
/// machinery can be exercised against a mock device.
pub(crate) fn dispatch<F>(
    mut raw_call: F,
    ioc: Ioc,
    name: &str,
    cmd: &mut ZfsCmd,
    request: Option<&NvList>,
    response: Option<&mut NvList>,
    config: Option<&NvList>,
) -> Result<()>
where
    F: FnMut(&mut ZfsCmd) -> i32,
{
    trace!("dispatching {ioc:?} for {name:?}");

    // The marshalled buffers and the output buffer live on this frame for
    // the whole call; the kernel reads and writes them through the raw
    // pointers planted in the record.
    let src = request.map(nvlist::pack).transpose()?;
    let conf = config.map(nvlist::pack).transpose()?;
    let mut dst = vec![0u8; INITIAL_OUTPUT_SIZE];

    loop {
        // Some handlers scribble on the record even on attempts that end
        // in ENOMEM, so each attempt works on a fresh copy.
        let mut working = cmd.clone();
        sys::put_name(&mut working.name, name)?;
        if let Some(src) = &src {
            working.nvlist_src = src.as_ptr() as u64;
            working.nvlist_src_size = src.len() as u64;
        }
        if let Some(conf) = &conf {
            working.nvlist_conf = conf.as_ptr() as u64;
            working.nvlist_conf_size = conf.len() as u64;
        }
        working.nvlist_dst = dst.as_mut_ptr() as u64;
        working.nvlist_dst_size = dst.len() as u64;

        let errno = raw_call(&mut working);

        if errno == libc::ENOMEM {
            if dst.len() >= MAX_OUTPUT_SIZE {
                return Err(Error::BufferTooLarge);
            }
            debug!(
                "{ioc:?}: output buffer undersized, growing {} -> {}",
                dst.len(),
                dst.len() * OUTPUT_GROWTH_FACTOR
            );
            dst = vec![0u8; dst.len() * OUTPUT_GROWTH_FACTOR];
            continue;
        }

        *cmd = working;
        if errno != 0 {
            return Err(Error::from_errno(errno));
        }
        break;
    }

    if let Some(sink) = response {
        // The kernel updates the size slot in place to what it filled.
        let filled = (cmd.nvlist_dst_size as usize).min(dst.len());
        *sink = nvlist::unpack(&dst[..filled])?;
    }
    Ok(())
}
