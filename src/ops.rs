//! The operations façade: one small function per control operation that
//! assembles the request shape, picks the command code and projects the
//! reply. Anything streaming lives in the adapters next door.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::nvlist::{unknown_field, FromNvlist, NvList, ToNvlist, Value};
use crate::sys::{self, DmuObjsetStats, Ioc, ZfsCmd};
use crate::Handle;

/// `dmu_objset_type_t`, used by create and destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectType {
    None = 0,
    Meta = 1,
    Zfs = 2,
    Zvol = 3,
    Other = 4,
    Any = 5,
}

/// Where a property value comes from, as the kernel tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PropSource {
    None = 1 << 0,
    Default = 1 << 1,
    Temporary = 1 << 2,
    Local = 1 << 3,
    Inherited = 1 << 4,
    Received = 1 << 5,
}

/// Scan-type operations on a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ScanType {
    /// Stops an ongoing scrub or resilver.
    None = 0,
    /// Starts or resumes a scrub.
    Scrub = 1,
    /// Resumes a paused resilver.
    Resilver = 2,
}

/// One step of a dataset or snapshot listing. Feed `cursor` back into the
/// next call; the kernel reports the end of the list with ESRCH
/// ([`Error::is_list_end`]).
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub cursor: u64,
    pub stats: DmuObjsetStats,
    pub props: NvList,
}

/// One virtual device in a pool layout tree. The tree handed to
/// [`Handle::pool_create`] is rooted in a `root`-typed vdev whose children
/// are the actual devices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VDev {
    pub vdev_type: String,
    pub path: String,
    pub is_log: u64,
    pub dtl: u64,
    pub ashift: u64,
    pub asize: u64,
    pub guid: u64,
    pub id: u64,
    pub children: Vec<VDev>,
    pub l2cache: Vec<VDev>,
    pub spares: Vec<VDev>,
}

impl ToNvlist for VDev {
    fn to_nvlist(&self) -> Result<NvList> {
        let mut nv = NvList::new();
        nv.insert("type", self.vdev_type.as_str());
        nv.insert("path", self.path.as_str());
        nv.insert("is_log", self.is_log);
        if self.dtl != 0 {
            nv.insert("DTL", self.dtl);
        }
        if self.ashift != 0 {
            nv.insert("ashift", self.ashift);
        }
        if self.asize != 0 {
            nv.insert("asize", self.asize);
        }
        if self.guid != 0 {
            nv.insert("guid", self.guid);
        }
        if self.id != 0 {
            nv.insert("id", self.id);
        }
        for (name, vdevs) in [
            ("children", &self.children),
            ("l2cache", &self.l2cache),
            ("spares", &self.spares),
        ] {
            if !vdevs.is_empty() {
                let lists = vdevs
                    .iter()
                    .map(ToNvlist::to_nvlist)
                    .collect::<Result<Vec<_>>>()?;
                nv.insert(name, lists);
            }
        }
        Ok(nv)
    }
}

impl FromNvlist for VDev {
    fn from_nvlist(nv: &NvList) -> Result<Self> {
        let mut vdev = VDev::default();
        for (name, value) in nv {
            match name.as_str() {
                "type" => vdev.vdev_type = want_str(value)?,
                "path" => vdev.path = want_str(value)?,
                "is_log" => vdev.is_log = want_u64(value)?,
                "DTL" => vdev.dtl = want_u64(value)?,
                "ashift" => vdev.ashift = want_u64(value)?,
                "asize" => vdev.asize = want_u64(value)?,
                "guid" => vdev.guid = want_u64(value)?,
                "id" => vdev.id = want_u64(value)?,
                "children" => vdev.children = want_vdevs(value)?,
                "l2cache" => vdev.l2cache = want_vdevs(value)?,
                "spares" => vdev.spares = want_vdevs(value)?,
                other => return Err(unknown_field(other)),
            }
        }
        Ok(vdev)
    }
}

/// Pool properties, for the props side of [`Handle::pool_create`]. The
/// fields past the writable block mirror what the kernel reports about a
/// live pool; they are read-only and never marshalled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolProps {
    pub altroot: String,
    pub temporary_name: String,
    pub boot_fs: String,
    pub cache_file: String,
    pub comment: String,
    pub version: u64,
    pub ashift: u64,
    pub max_block_size: u64,
    pub max_dnode_size: u64,
    pub read_only: bool,
    pub multihost: bool,
    pub delegation: bool,
    pub autoreplace: bool,
    pub autoexpand: bool,
    pub list_snapshots: bool,
    /// Properties of the pool's root dataset.
    pub root_props: Option<NvList>,

    // Read-only state the kernel owns.
    pub size: u64,
    pub free: u64,
    pub allocated: u64,
    pub fragmentation: u64,
    pub capacity: u64,
    pub guid: u64,
    pub health: String,
}

impl ToNvlist for PoolProps {
    fn to_nvlist(&self) -> Result<NvList> {
        let mut nv = NvList::new();
        for (name, value) in [
            ("altroot", &self.altroot),
            ("tname", &self.temporary_name),
            ("bootfs", &self.boot_fs),
            ("cachefile", &self.cache_file),
            ("comment", &self.comment),
        ] {
            if !value.is_empty() {
                nv.insert(name, value.as_str());
            }
        }
        for (name, value) in [
            ("version", self.version),
            ("ashift", self.ashift),
            ("maxblocksize", self.max_block_size),
            ("maxdnodesize", self.max_dnode_size),
        ] {
            if value != 0 {
                nv.insert(name, value);
            }
        }
        nv.insert("readonly", self.read_only);
        nv.insert("multihost", self.multihost);
        nv.insert("delegation", self.delegation);
        nv.insert("autoreplace", self.autoreplace);
        nv.insert("autoexpand", self.autoexpand);
        nv.insert("listsnapshots", self.list_snapshots);
        if let Some(root_props) = &self.root_props {
            nv.insert("root-props-nvl", root_props.clone());
        }
        Ok(nv)
    }
}

/// Options for [`Handle::send_space`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendSpaceOptions {
    /// Older snapshot for an incremental estimate.
    pub from: String,
    pub large_blocks: bool,
    pub embed: bool,
    pub compress: bool,
}

impl ToNvlist for SendSpaceOptions {
    fn to_nvlist(&self) -> Result<NvList> {
        let mut nv = NvList::new();
        if !self.from.is_empty() {
            nv.insert("from", self.from.as_str());
        }
        nv.insert("largeblockok", self.large_blocks);
        nv.insert("embedok", self.embed);
        nv.insert("compressok", self.compress);
        Ok(nv)
    }
}

impl FromNvlist for SendSpaceOptions {
    fn from_nvlist(nv: &NvList) -> Result<Self> {
        let mut opts = SendSpaceOptions::default();
        for (name, value) in nv {
            match name.as_str() {
                "from" => opts.from = want_str(value)?,
                "largeblockok" => opts.large_blocks = want_bool(value)?,
                "embedok" => opts.embed = want_bool(value)?,
                "compressok" => opts.compress = want_bool(value)?,
                other => return Err(unknown_field(other)),
            }
        }
        Ok(opts)
    }
}

/// Options for [`Handle::send`]. The stream file descriptor is owned by
/// the adapter and never appears here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Older snapshot for an incremental send.
    pub from: String,
    /// Redaction bookmark limiting what is sent.
    pub redact_bookmark: String,
    pub large_blocks: bool,
    /// Allows embedded write records.
    pub embed: bool,
    /// Allows compressed write records.
    pub compress: bool,
    /// Allows raw encrypted records.
    pub raw: bool,
    /// Sends a partially received snapshot.
    pub saved: bool,
    /// Resume point of an interrupted transfer.
    pub resume_object: u64,
    pub resume_offset: u64,
}

impl ToNvlist for SendOptions {
    fn to_nvlist(&self) -> Result<NvList> {
        let mut nv = NvList::new();
        if !self.from.is_empty() {
            nv.insert("fromsnap", self.from.as_str());
        }
        if !self.redact_bookmark.is_empty() {
            nv.insert("redactbook", self.redact_bookmark.as_str());
        }
        nv.insert("largeblockok", self.large_blocks);
        nv.insert("embedok", self.embed);
        nv.insert("compress", self.compress);
        nv.insert("rawok", self.raw);
        nv.insert("savedok", self.saved);
        if self.resume_object != 0 {
            nv.insert("resume_object", self.resume_object);
        }
        if self.resume_offset != 0 {
            nv.insert("resume_offset", self.resume_offset);
        }
        Ok(nv)
    }
}

/// Options for [`Handle::receive`]. The stream descriptor and the begin
/// record are supplied by the adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveOptions {
    /// Full name of the snapshot to create.
    pub snapshot_name: String,
    /// Origin snapshot when receiving into a clone.
    pub origin: String,
    /// Properties to apply as received.
    pub props: Option<NvList>,
    /// Properties to apply as local overrides.
    pub local_props: Option<NvList>,
    /// The kernel aborts the receive when this descriptor closes.
    pub cleanup_fd: Option<i32>,
    pub force: bool,
    pub resumable: bool,
}

impl ToNvlist for ReceiveOptions {
    fn to_nvlist(&self) -> Result<NvList> {
        let mut nv = NvList::new();
        nv.insert("snapname", self.snapshot_name.as_str());
        if !self.origin.is_empty() {
            nv.insert("origin", self.origin.as_str());
        }
        if let Some(props) = &self.props {
            nv.insert("props", props.clone());
        }
        if let Some(props) = &self.local_props {
            nv.insert("localprops", props.clone());
        }
        if let Some(fd) = self.cleanup_fd {
            nv.insert("cleanup_fd", fd);
        }
        nv.insert("force", self.force);
        nv.insert("resumable", self.resumable);
        Ok(nv)
    }
}

/// Structured failure report of a receive, from the operation's output
/// nvlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveFailure {
    pub read_bytes: u64,
    pub error_flags: u64,
    pub errors: BTreeMap<String, i32>,
}

impl FromNvlist for ReceiveFailure {
    fn from_nvlist(nv: &NvList) -> Result<Self> {
        let mut failure = ReceiveFailure::default();
        for (name, value) in nv {
            match name.as_str() {
                "read_bytes" => failure.read_bytes = want_u64(value)?,
                "error_flags" => failure.error_flags = want_u64(value)?,
                "errors" => {
                    if let Value::List(errors) = value {
                        for (prop, errno) in errors {
                            if let Value::Int32(errno) = errno {
                                failure.errors.insert(prop.clone(), *errno);
                            }
                        }
                    }
                }
                other => return Err(unknown_field(other)),
            }
        }
        Ok(failure)
    }
}

fn want_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Uint64(v) => Ok(*v),
        _ => Err(Error::InvalidValue("expected a uint64 pair")),
    }
}

fn want_str(value: &Value) -> Result<String> {
    match value {
        Value::Str(v) => Ok(v.clone()),
        _ => Err(Error::InvalidValue("expected a string pair")),
    }
}

fn want_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(v) => Ok(*v),
        _ => Err(Error::InvalidValue("expected a boolean pair")),
    }
}

fn want_vdevs(value: &Value) -> Result<Vec<VDev>> {
    match value {
        Value::ListArray(lists) => lists.iter().map(VDev::from_nvlist).collect(),
        _ => Err(Error::InvalidValue("expected an nvlist array pair")),
    }
}

/// Scans a per-entry error map; a non-empty one turns into
/// [`Error::Partial`].
pub(crate) fn check_partial(reply: &NvList) -> Result<()> {
    let mut errors = BTreeMap::new();
    for (name, value) in reply {
        let errno = match value {
            Value::Int32(e) => i64::from(*e),
            Value::Int64(e) => *e,
            _ => continue,
        };
        if errno != 0 {
            errors.insert(name.clone(), errno as i32);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Partial(errors))
    }
}

impl Handle {
    /// Creates a pool from a root vdev tree; `props` carries pool
    /// properties and feature enables.
    pub fn pool_create(&self, name: &str, props: &NvList, root: &VDev) -> Result<()> {
        let config = root.to_nvlist()?;
        let mut cmd = ZfsCmd::default();
        self.call(Ioc::PoolCreate, name, &mut cmd, Some(props), None, Some(&config))
    }

    pub fn pool_destroy(&self, name: &str) -> Result<()> {
        let mut cmd = ZfsCmd::default();
        self.call(Ioc::PoolDestroy, name, &mut cmd, None, None, None)
    }

    /// Top-level configuration of every imported pool, keyed by pool name.
    pub fn pool_configs(&self) -> Result<NvList> {
        let mut cmd = ZfsCmd::default();
        let mut configs = NvList::new();
        self.call(Ioc::PoolConfigs, "", &mut cmd, None, Some(&mut configs), None)?;
        Ok(configs)
    }

    /// Pool statistics: iostat counters, config, features, a real mixed
    /// bag.
    pub fn pool_stats(&self, name: &str) -> Result<NvList> {
        let mut cmd = ZfsCmd::default();
        let mut stats = NvList::new();
        self.call(Ioc::PoolStats, name, &mut cmd, None, Some(&mut stats), None)?;
        Ok(stats)
    }

    pub fn pool_get_props(&self, name: &str) -> Result<NvList> {
        let mut cmd = ZfsCmd::default();
        let mut props = NvList::new();
        self.call(Ioc::PoolGetProps, name, &mut cmd, None, Some(&mut props), None)?;
        Ok(props)
    }

    /// Imports a pool from a label config (as produced by export or label
    /// scanning); returns the resulting active config.
    pub fn pool_import(
        &self,
        name: &str,
        config: &NvList,
        props: Option<&NvList>,
    ) -> Result<NvList> {
        let guid = config
            .get_u64("pool_guid")
            .ok_or(Error::InvalidValue("pool config lacks pool_guid"))?;
        let mut cmd = ZfsCmd {
            guid,
            ..Default::default()
        };
        let mut out = NvList::new();
        self.call(Ioc::PoolImport, name, &mut cmd, props, Some(&mut out), Some(config))?;
        // Import reports some failures through the cookie slot instead of
        // the call status.
        if cmd.cookie != 0 {
            return Err(Error::from_errno(cmd.cookie as i32));
        }
        Ok(out)
    }

    pub fn pool_export(&self, name: &str, force: bool, hard_force: bool) -> Result<()> {
        let mut cmd = ZfsCmd {
            cookie: force as u64,
            guid: hard_force as u64,
            ..Default::default()
        };
        self.call(Ioc::PoolExport, name, &mut cmd, None, None, None)
    }

    /// Assigns a new GUID to the pool. Needs every device writable, so the
    /// pool cannot be degraded.
    pub fn pool_reguid(&self, name: &str) -> Result<()> {
        let mut cmd = ZfsCmd::default();
        self.call(Ioc::PoolReguid, name, &mut cmd, None, None, None)
    }

    /// Starts, resumes or stops a scrub or resilver.
    pub fn pool_scan(&self, name: &str, kind: ScanType) -> Result<()> {
        let mut cmd = ZfsCmd {
            cookie: kind as u64,
            ..Default::default()
        };
        self.call(Ioc::PoolScan, name, &mut cmd, None, None, None)
    }

    /// Pauses an active scrub.
    pub fn pool_scan_pause(&self, name: &str) -> Result<()> {
        let mut cmd = ZfsCmd {
            flags: 1,
            ..Default::default()
        };
        self.call(Ioc::PoolScan, name, &mut cmd, None, None, None)
    }

    /// Dataset statistics and properties with their sources.
    pub fn objset_stats(&self, name: &str) -> Result<NvList> {
        let mut cmd = ZfsCmd::default();
        let mut props = NvList::new();
        self.call(Ioc::ObjsetStats, name, &mut cmd, None, Some(&mut props), None)?;
        Ok(props)
    }

    pub fn objset_zpl_props(&self, name: &str) -> Result<NvList> {
        let mut cmd = ZfsCmd::default();
        let mut props = NvList::new();
        self.call(Ioc::ObjsetZplProps, name, &mut cmd, None, Some(&mut props), None)?;
        Ok(props)
    }

    /// One step of the child-dataset listing under `name`. Start with
    /// cursor 0 and feed each returned cursor into the next call.
    pub fn dataset_list_next(&self, name: &str, cursor: u64) -> Result<ListEntry> {
        self.list_next(Ioc::DatasetListNext, name, cursor)
    }

    /// One step of the snapshot listing under `name`.
    pub fn snapshot_list_next(&self, name: &str, cursor: u64) -> Result<ListEntry> {
        self.list_next(Ioc::SnapshotListNext, name, cursor)
    }

    fn list_next(&self, ioc: Ioc, name: &str, cursor: u64) -> Result<ListEntry> {
        let mut cmd = ZfsCmd {
            cookie: cursor,
            ..Default::default()
        };
        let mut props = NvList::new();
        self.call(ioc, name, &mut cmd, None, Some(&mut props), None)?;
        Ok(ListEntry {
            name: sys::get_name(&cmd.name),
            cursor: cmd.cookie,
            stats: cmd.objset_stats.clone(),
            props,
        })
    }

    /// Iterates the child datasets of `name`, driving the cursor protocol
    /// until the kernel reports the end of the list.
    pub fn datasets(&self, name: &str) -> ListIter<'_> {
        ListIter {
            handle: self,
            ioc: Ioc::DatasetListNext,
            name: name.to_owned(),
            cursor: 0,
            done: false,
        }
    }

    /// Iterates the snapshots of `name`.
    pub fn snapshots(&self, name: &str) -> ListIter<'_> {
        ListIter {
            handle: self,
            ioc: Ioc::SnapshotListNext,
            name: name.to_owned(),
            cursor: 0,
            done: false,
        }
    }

    /// Creates a dataset.
    pub fn create(&self, name: &str, kind: ObjectType, props: Option<&NvList>) -> Result<()> {
        let mut req = NvList::new();
        req.insert("type", kind as i32);
        if let Some(props) = props {
            req.insert("props", props.clone());
        }
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::Create, name, &mut cmd, Some(&req), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Creates a writable dataset from an origin snapshot.
    pub fn clone_dataset(&self, name: &str, origin: &str, props: Option<&NvList>) -> Result<()> {
        let mut req = NvList::new();
        req.insert("origin", origin);
        if let Some(props) = props {
            req.insert("props", props.clone());
        }
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::Clone, name, &mut cmd, Some(&req), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Swaps a clone with its origin filesystem. A snapshot name conflict
    /// makes the kernel fail with EEXIST; the offending name is then
    /// available in the record's secondary-name slot via [`Handle::call`].
    pub fn promote(&self, name: &str) -> Result<()> {
        let mut cmd = ZfsCmd::default();
        self.call(Ioc::Promote, name, &mut cmd, None, None, None)
    }

    /// Takes one or more snapshots atomically. All names are
    /// `dataset@snap` paths inside `pool`.
    pub fn snapshot(&self, names: &[&str], pool: &str, props: Option<&NvList>) -> Result<()> {
        let mut snaps = NvList::new();
        for name in names {
            if snaps.contains(name) {
                return Err(Error::InvalidValue("duplicate snapshot name"));
            }
            snaps.insert(*name, true);
        }
        let mut req = NvList::new();
        req.insert("snaps", snaps);
        if let Some(props) = props {
            req.insert("props", props.clone());
        }
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::Snapshot, pool, &mut cmd, Some(&req), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Destroys snapshots in one pool. With `defer` the removal finishes
    /// in the background after the call returns.
    pub fn destroy_snapshots(&self, names: &[&str], pool: &str, defer: bool) -> Result<()> {
        let mut snaps = NvList::new();
        for name in names {
            if snaps.contains(name) {
                return Err(Error::InvalidValue("duplicate snapshot name"));
            }
            snaps.insert(*name, true);
        }
        let mut req = NvList::new();
        req.insert("snaps", snaps);
        req.insert("defer", defer);
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::DestroySnaps, pool, &mut cmd, Some(&req), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Creates bookmarks; `marks` maps each new full bookmark name to its
    /// source snapshot.
    pub fn bookmark(&self, marks: &NvList) -> Result<()> {
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::Bookmark, "", &mut cmd, Some(marks), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Rolls a dataset back to its most recent snapshot (or to `target`)
    /// and returns the snapshot actually used.
    pub fn rollback(&self, name: &str, target: Option<&str>) -> Result<String> {
        let mut req = NvList::new();
        if let Some(target) = target {
            req.insert("target", target);
        }
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::Rollback, name, &mut cmd, Some(&req), Some(&mut reply), None)?;
        reply
            .get_str("target")
            .map(str::to_owned)
            .ok_or(Error::InvalidData)
    }

    /// Sets properties on a dataset; the cookie carries the source kind.
    pub fn set_prop(&self, name: &str, props: &NvList, source: PropSource) -> Result<()> {
        let mut cmd = ZfsCmd {
            cookie: source as u64,
            ..Default::default()
        };
        let mut reply = NvList::new();
        self.call(Ioc::SetProp, name, &mut cmd, Some(props), Some(&mut reply), None)?;
        check_partial(&reply)
    }

    /// Reverts a property to the parent's value, or with
    /// `revert_to_received` to the received value shadowed by a local one.
    pub fn inherit_prop(&self, name: &str, prop: &str, revert_to_received: bool) -> Result<()> {
        let mut cmd = ZfsCmd {
            cookie: revert_to_received as u64,
            ..Default::default()
        };
        sys::put_name(&mut cmd.value, prop)?;
        self.call(Ioc::InheritProp, name, &mut cmd, None, None, None)
    }

    /// Bytes written to `dataset` since `snapshot` was taken.
    pub fn space_written(&self, dataset: &str, snapshot: &str) -> Result<u64> {
        let mut cmd = ZfsCmd::default();
        sys::put_name(&mut cmd.value, snapshot)?;
        self.call(Ioc::SpaceWritten, dataset, &mut cmd, None, None, None)?;
        Ok(cmd.cookie)
    }

    /// Renames a dataset; `recursive` renames the matching snapshot of
    /// every descendant instead.
    pub fn rename(&self, name: &str, new_name: &str, recursive: bool) -> Result<()> {
        let mut cmd = ZfsCmd {
            cookie: recursive as u64,
            ..Default::default()
        };
        sys::put_name(&mut cmd.value, new_name)?;
        self.call(Ioc::Rename, name, &mut cmd, None, None, None)
    }

    /// Destroys a dataset or snapshot irrevocably. With `defer` the
    /// removal completes asynchronously.
    pub fn destroy(&self, name: &str, kind: ObjectType, defer: bool) -> Result<()> {
        let mut cmd = ZfsCmd {
            objset_type: kind as u64,
            defer_destroy: defer as u32,
            ..Default::default()
        };
        self.call(Ioc::Destroy, name, &mut cmd, None, None, None)
    }

    /// Estimates the size of the stream [`Handle::send`] would produce.
    pub fn send_space(&self, name: &str, options: &SendSpaceOptions) -> Result<u64> {
        let req = options.to_nvlist()?;
        let mut cmd = ZfsCmd::default();
        let mut reply = NvList::new();
        self.call(Ioc::SendSpace, name, &mut cmd, Some(&req), Some(&mut reply), None)?;
        reply.get_u64("space").ok_or(Error::InvalidData)
    }
}

/// Cursor-driven listing, one control call per step. Ends cleanly on the
/// kernel's list-end errno; any other failure is yielded and terminates
/// the iteration.
pub struct ListIter<'a> {
    handle: &'a Handle,
    ioc: Ioc,
    name: String,
    cursor: u64,
    done: bool,
}

impl Iterator for ListIter<'_> {
    type Item = Result<ListEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.handle.list_next(self.ioc, &self.name, self.cursor) {
            Ok(entry) => {
                self.cursor = entry.cursor;
                Some(Ok(entry))
            }
            Err(err) if err.is_list_end() => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvlist::{pack, unpack};

    fn sample_tree() -> VDev {
        VDev {
            vdev_type: "root".to_owned(),
            children: vec![VDev {
                vdev_type: "file".to_owned(),
                path: "/tmp/zdev0".to_owned(),
                ashift: 12,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn vdev_round_trip() {
        let tree = sample_tree();
        let decoded = unpack(&pack(&tree.to_nvlist().unwrap()).unwrap()).unwrap();
        assert_eq!(VDev::from_nvlist(&decoded).unwrap(), tree);
    }

    #[test]
    fn vdev_omit_empty() {
        let nv = sample_tree().to_nvlist().unwrap();
        // Zero-valued optional fields stay off the wire; required ones
        // are always present.
        assert!(nv.get("ashift").is_none());
        assert!(nv.get("guid").is_none());
        assert!(nv.get("spares").is_none());
        assert_eq!(nv.get_u64("is_log"), Some(0));
        assert_eq!(nv.get_str("type"), Some("root"));
    }

    #[test]
    fn vdev_unknown_field_is_rejected() {
        let mut nv = sample_tree().to_nvlist().unwrap();
        nv.insert("surprise", 1u64);
        assert!(matches!(
            VDev::from_nvlist(&nv),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn pool_props_skip_read_only_fields() {
        let props = PoolProps {
            comment: "test pool".to_owned(),
            ashift: 12,
            delegation: true,
            // Kernel-owned state must never reach the wire.
            size: 1 << 30,
            guid: 0xabcd,
            health: "ONLINE".to_owned(),
            ..Default::default()
        };
        let nv = props.to_nvlist().unwrap();
        assert_eq!(nv.get_str("comment"), Some("test pool"));
        assert_eq!(nv.get_u64("ashift"), Some(12));
        assert!(nv.get_bool("delegation"));
        assert!(nv.get("size").is_none());
        assert!(nv.get("guid").is_none());
        assert!(nv.get("health").is_none());
    }

    #[test]
    fn send_space_options_round_trip() {
        let opts = SendSpaceOptions {
            from: "tank/fs@s1".to_owned(),
            compress: true,
            ..Default::default()
        };
        let decoded = unpack(&pack(&opts.to_nvlist().unwrap()).unwrap()).unwrap();
        assert_eq!(SendSpaceOptions::from_nvlist(&decoded).unwrap(), opts);
    }

    #[test]
    fn boolean_asymmetry_in_records() {
        let opts = SendSpaceOptions {
            compress: true,
            ..Default::default()
        };
        let decoded = unpack(&pack(&opts.to_nvlist().unwrap()).unwrap()).unwrap();
        // False booleans never hit the wire; absence reads back as false.
        assert!(decoded.get("largeblockok").is_none());
        assert!(decoded.get("from").is_none());
        let restored = SendSpaceOptions::from_nvlist(&decoded).unwrap();
        assert!(!restored.large_blocks);
        assert!(restored.compress);
    }

    #[test]
    fn receive_failure_projection() {
        let mut errors = NvList::new();
        errors.insert("compression", libc::EINVAL);
        let mut nv = NvList::new();
        nv.insert("read_bytes", 4096u64);
        nv.insert("error_flags", 1u64);
        nv.insert("errors", errors);

        let failure = ReceiveFailure::from_nvlist(&nv).unwrap();
        assert_eq!(failure.read_bytes, 4096);
        assert_eq!(failure.error_flags, 1);
        assert_eq!(failure.errors.get("compression"), Some(&libc::EINVAL));
    }

    #[test]
    fn partial_failure_detection() {
        let mut reply = NvList::new();
        assert!(check_partial(&reply).is_ok());

        reply.insert("tp1/a@s1", 0i32);
        assert!(check_partial(&reply).is_ok());

        reply.insert("tp1/b@s1", libc::EBUSY);
        match check_partial(&reply).unwrap_err() {
            Error::Partial(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors.get("tp1/b@s1"), Some(&libc::EBUSY));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
