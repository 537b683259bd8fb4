//! Byte-exact mirrors of the kernel control ABI: the command record handed
//! to every ioctl and the operation code space.
//!
//! Field order, sizes and natural alignment must match the kernel structs
//! exactly; the dispatcher treats the record as opaque bytes except for the
//! slots an operation explicitly reads or writes.

use std::os::raw::c_int;

// include/sys/fs/zfs.h
pub const ZFS_MAX_DATASET_NAME_LEN: usize = 256;

// include/os/linux/spl/sys/sysmacros.h
pub const MAXNAMELEN: usize = 256;
pub const MAXPATHLEN: usize = 4096;

/// `dmu_objset_stats_t`, filled by the kernel for list and stat operations.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct DmuObjsetStats {
    pub num_clones: u64,
    pub creation_txg: u64,
    pub guid: u64,
    pub objset_type: c_int, // enum dmu_objset_type
    pub is_snapshot: u8,
    pub inconsistent: u8,
    pub redacted: u8,
    pub origin: [u8; ZFS_MAX_DATASET_NAME_LEN],
}

/// `struct drr_begin`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct DrrBegin {
    pub magic: u64,
    pub versioninfo: u64,
    pub creation_time: u64,
    pub drr_type: c_int, // enum dmu_objset_type
    pub flags: u32,
    pub toguid: u64,
    pub fromguid: u64,
    pub toname: [u8; MAXNAMELEN],
}

/// `zinject_record_t`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct ZinjectRecord {
    pub objset: u64,
    pub object: u64,
    pub start: u64,
    pub end: u64,
    pub guid: u64,
    pub level: u32,
    pub error: u32,
    pub inject_type: u64,
    pub freq: u32,
    pub failfast: u32,
    pub func: [u8; MAXNAMELEN],
    pub iotype: u32,
    pub duration: i32,
    pub timer: u64,
    pub nlanes: u64,
    pub cmd: u64,
    pub dvas: u64,
}

/// `zfs_share_t`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct ZfsShare {
    pub exportdata: u64,
    pub sharedata: u64,
    pub sharetype: u64,
    pub sharemax: u64,
}

/// `zfs_stat_t`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct ZfsStat {
    pub gen: u64,
    pub mode: u64,
    pub links: u64,
    pub ctime: [u64; 2],
}

/// `zfs_cmd_t`. Pointer slots are carried as `u64` the way the kernel
/// declares them, so the layout is identical no matter what Rust would pick
/// for a pointer field.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct ZfsCmd {
    pub name: [u8; MAXPATHLEN],
    pub nvlist_src: u64,
    pub nvlist_src_size: u64,
    pub nvlist_dst: u64,
    pub nvlist_dst_size: u64,
    pub nvlist_dst_filled: c_int, // boolean_t
    pub pad2: c_int,

    // Slots kept by legacy ioctls that never moved to nvlist arguments.
    pub history: u64,
    pub value: [u8; MAXPATHLEN * 2],
    pub string: [u8; MAXNAMELEN],
    pub guid: u64,
    pub nvlist_conf: u64,
    pub nvlist_conf_size: u64,
    pub cookie: u64,
    pub objset_type: u64,
    pub perm_action: u64,
    pub history_len: u64,
    pub history_offset: u64,
    pub obj: u64,
    pub iflags: u64,
    pub share: ZfsShare,
    pub objset_stats: DmuObjsetStats,
    pub begin_record: DrrBegin,
    pub inject_record: ZinjectRecord,
    pub defer_destroy: u32,
    pub flags: i32,
    pub action_handle: u64,
    pub cleanup_fd: c_int,
    pub simple: u8,
    pub pad: [u8; 3],
    pub sendobj: u64,
    pub fromobj: u64,
    pub createtxg: u64,
    pub stat: ZfsStat,
    pub zoneid: u64,
}

impl Default for ZfsCmd {
    fn default() -> Self {
        // All-zero is the valid initial state for every field.
        unsafe { std::mem::zeroed() }
    }
}

/// The operation code space shared with the kernel module. A dense enum
/// from `'Z' << 8` with OS-common, Linux and FreeBSD sub-ranges; the
/// ordinals are ABI-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Ioc {
    PoolCreate = 0x5a00,
    PoolDestroy = 0x5a01,
    PoolImport = 0x5a02,
    PoolExport = 0x5a03,
    PoolConfigs = 0x5a04,
    PoolStats = 0x5a05,
    PoolTryimport = 0x5a06,
    PoolScan = 0x5a07,
    PoolFreeze = 0x5a08,
    PoolUpgrade = 0x5a09,
    PoolGetHistory = 0x5a0a,
    VdevAdd = 0x5a0b,
    VdevRemove = 0x5a0c,
    VdevSetState = 0x5a0d,
    VdevAttach = 0x5a0e,
    VdevDetach = 0x5a0f,
    VdevSetpath = 0x5a10,
    VdevSetfru = 0x5a11,
    ObjsetStats = 0x5a12,
    ObjsetZplProps = 0x5a13,
    DatasetListNext = 0x5a14,
    SnapshotListNext = 0x5a15,
    SetProp = 0x5a16,
    Create = 0x5a17,
    Destroy = 0x5a18,
    Rollback = 0x5a19,
    Rename = 0x5a1a,
    Recv = 0x5a1b,
    Send = 0x5a1c,
    InjectFault = 0x5a1d,
    ClearFault = 0x5a1e,
    InjectListNext = 0x5a1f,
    ErrorLog = 0x5a20,
    Clear = 0x5a21,
    Promote = 0x5a22,
    Snapshot = 0x5a23,
    DsobjToDsname = 0x5a24,
    ObjToPath = 0x5a25,
    PoolSetProps = 0x5a26,
    PoolGetProps = 0x5a27,
    SetFsacl = 0x5a28,
    GetFsacl = 0x5a29,
    Share = 0x5a2a,
    InheritProp = 0x5a2b,
    SmbAcl = 0x5a2c,
    UserspaceOne = 0x5a2d,
    UserspaceMany = 0x5a2e,
    UserspaceUpgrade = 0x5a2f,
    Hold = 0x5a30,
    Release = 0x5a31,
    GetHolds = 0x5a32,
    ObjsetRecvdProps = 0x5a33,
    VdevSplit = 0x5a34,
    NextObj = 0x5a35,
    Diff = 0x5a36,
    TmpSnapshot = 0x5a37,
    ObjToStats = 0x5a38,
    SpaceWritten = 0x5a39,
    SpaceSnaps = 0x5a3a,
    DestroySnaps = 0x5a3b,
    PoolReguid = 0x5a3c,
    PoolReopen = 0x5a3d,
    SendProgress = 0x5a3e,
    LogHistory = 0x5a3f,
    SendNew = 0x5a40,
    SendSpace = 0x5a41,
    Clone = 0x5a42,
    Bookmark = 0x5a43,
    GetBookmarks = 0x5a44,
    DestroyBookmarks = 0x5a45,
    RecvNew = 0x5a46,
    PoolSync = 0x5a47,

    // Linux sub-range.
    EventsNext = 0x5a81,
    EventsClear = 0x5a82,
    EventsSeek = 0x5a83,
}

/// Copies a name into one of the record's fixed null-terminated fields.
pub(crate) fn put_name(field: &mut [u8], name: &str) -> crate::error::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= field.len() {
        return Err(crate::error::Error::InvalidValue("name too long for its command field"));
    }
    if bytes.contains(&0) {
        return Err(crate::error::Error::InvalidValue("name contains a null byte"));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(())
}

/// Reads a null-terminated name back out of a fixed field.
pub(crate) fn get_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Offsets pinned against the kernel's x86-64 layout; a drift here means
    // every slot after it lands in the wrong place.
    #[test]
    fn command_record_layout() {
        use std::mem::{offset_of, size_of};

        assert_eq!(size_of::<ZfsShare>(), 32);
        assert_eq!(size_of::<DmuObjsetStats>(), 288);
        assert_eq!(size_of::<DrrBegin>(), 304);
        assert_eq!(size_of::<ZinjectRecord>(), 360);
        assert_eq!(size_of::<ZfsStat>(), 40);

        assert_eq!(offset_of!(ZfsCmd, nvlist_src), 4096);
        assert_eq!(offset_of!(ZfsCmd, nvlist_dst_filled), 4128);
        assert_eq!(offset_of!(ZfsCmd, history), 4136);
        assert_eq!(offset_of!(ZfsCmd, value), 4144);
        assert_eq!(offset_of!(ZfsCmd, string), 12336);
        assert_eq!(offset_of!(ZfsCmd, guid), 12592);
        assert_eq!(offset_of!(ZfsCmd, cookie), 12616);
        assert_eq!(offset_of!(ZfsCmd, objset_type), 12624);
        assert_eq!(offset_of!(ZfsCmd, share), 12672);
        assert_eq!(offset_of!(ZfsCmd, objset_stats), 12704);
        assert_eq!(offset_of!(ZfsCmd, begin_record), 12992);
        assert_eq!(offset_of!(ZfsCmd, inject_record), 13296);
        assert_eq!(offset_of!(ZfsCmd, defer_destroy), 13656);
        assert_eq!(offset_of!(ZfsCmd, stat), 13704);
        assert_eq!(offset_of!(ZfsCmd, zoneid), 13744);
        assert_eq!(size_of::<ZfsCmd>(), 13752);
    }

    #[test]
    fn name_fields() {
        let mut field = [0xffu8; 8];
        put_name(&mut field, "tank").unwrap();
        assert_eq!(&field, b"tank\0\0\0\0");
        assert_eq!(get_name(&field), "tank");

        assert!(put_name(&mut field, "12345678").is_err());
        assert!(put_name(&mut field, "a\0b").is_err());
    }
}
