use crate::arbitration::{
    keys, ArbitrationSession, DiskArbiter, DiskDescription, Dissenter, OperationCallback,
    Property, RunLoop,
};
use crate::device::{validate_bsd_name, DeviceDescriptor, DeviceKind, MIN_ENUMERATED_BSD_NAME_LEN};
use crate::error::OperationError;
use crate::safety::{classify, Placement};
use anyhow::{anyhow, Result};
use nix::errno::Errno;
use nix::ioctl_none;
use nix::mount::{umount2, MntFlags};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;

ioctl_none!(blkflsbuf, 0x12, 97);

const SYS_BLOCK: &str = "/sys/block";
const MOUNTS: &str = "/proc/self/mounts";
const DEV: &str = "/dev";
const SYSTEM_ROOT: &str = "/";

/// How many levels of stacked devices (dm, md) are followed from a
/// partition to the device holding the root filesystem.
const MAX_HOLDER_DEPTH: usize = 4;

/// Helper to read a specific file below a device's sysfs directory.
fn read_sys_file(device_dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(device_dir.join(file)).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., sda1 -> sda,
/// mmcblk0p1 -> mmcblk0). This is used to find the system drive's parent for
/// exclusion.
fn parent_device_name(partition: &str) -> &str {
    if let Some(index) = partition.rfind('p') {
        let (head, tail) = partition.split_at(index);
        let tail_is_partition = tail.len() > 1 && tail[1..].bytes().all(|b| b.is_ascii_digit());
        if tail_is_partition && head.ends_with(|c: char| c.is_ascii_digit()) {
            return head;
        }
    }
    if partition.starts_with("sd") || partition.starts_with("vd") || partition.starts_with("hd") {
        return partition.trim_end_matches(|c: char| c.is_ascii_digit());
    }
    partition
}

/// Whether `device` (a name below `/dev`) is `disk` itself or one of its
/// partitions.
fn belongs_to_disk(device: &str, disk: &str) -> bool {
    let Some(rest) = device.strip_prefix(disk) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    // Disks whose names end in a digit separate partitions with a 'p'.
    let digits = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Boot and RPMB areas of an eMMC device show up as disks of their own.
fn is_mmc_hardware_partition(name: &str) -> bool {
    name.starts_with("mmcblk") && (name.contains("boot") || name.ends_with("rpmb"))
}

/// Decodes the octal escapes (`\040` for a space) the kernel uses in mount
/// tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points of every volume on `disk`, deepest first.
fn mount_points_of(mounts: &Path, disk: &str) -> io::Result<Vec<PathBuf>> {
    let table = fs::read_to_string(mounts)?;
    let mut points: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let device = source.strip_prefix("/dev/")?;
            belongs_to_disk(device, disk).then(|| PathBuf::from(unescape_mount_field(target)))
        })
        .collect();
    points.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    points.dedup();
    Ok(points)
}

/// Reads what sysfs knows about one whole disk into a description.
///
/// The "is internal" property is only set when the `removable` flag reads
/// cleanly; anything else leaves classification to fail closed. MMC block
/// devices are told apart by the card type the MMC core reports: only `SD`
/// is removable media, `MMC` is soldered-on eMMC and always internal.
fn describe_block_device(device_dir: &Path, name: &str) -> DiskDescription {
    let mut description =
        DiskDescription::new().with(keys::BSD_NAME, Property::Text(name.to_string()));

    let on_usb = fs::canonicalize(device_dir)
        .map(|p| p.components().any(|c| c.as_os_str().to_string_lossy().starts_with("usb")))
        .unwrap_or(false);
    let card_type = read_sys_file(device_dir, "device/type").ok();
    let is_sd = card_type.as_deref() == Some("SD");
    let is_emmc = card_type.as_deref() == Some("MMC") || is_mmc_hardware_partition(name);

    let removable = read_sys_file(device_dir, "removable").ok();
    match removable.as_deref() {
        _ if is_emmc => description.insert(keys::DEVICE_INTERNAL, Property::Bool(true)),
        Some("1") => description.insert(keys::DEVICE_INTERNAL, Property::Bool(false)),
        Some("0") => description.insert(keys::DEVICE_INTERNAL, Property::Bool(!on_usb)),
        Some(other) => description.insert(keys::DEVICE_INTERNAL, Property::Text(other.to_string())),
        None => {}
    }

    let kind = if is_emmc {
        DeviceKind::Internal
    } else if is_sd {
        DeviceKind::Sd
    } else if on_usb {
        DeviceKind::Usb
    } else if removable.as_deref() == Some("0") {
        DeviceKind::Internal
    } else {
        DeviceKind::Other
    };
    description.insert(keys::MEDIA_KIND, Property::Text(kind.as_str().to_string()));

    if let Ok(sectors) = read_sys_file(device_dir, "size").and_then(|s| {
        s.parse::<u64>()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
    }) {
        description.insert(keys::MEDIA_SIZE, Property::Integer(sectors * 512));
    }

    if let Ok(dev) = read_sys_file(device_dir, "dev") {
        if let Some((major, minor)) = dev.split_once(':') {
            if let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                description.insert(keys::DEVICE_ID, Property::Integer((major << 32) | minor));
            }
        }
    }

    let vendor = read_sys_file(device_dir, "device/vendor").unwrap_or_default();
    let model = read_sys_file(device_dir, "device/model")
        .or_else(|_| read_sys_file(device_dir, "device/name"))
        .unwrap_or_default();
    let display = format!("{vendor} {model}").trim().to_string();
    if !display.is_empty() {
        description.insert(keys::MEDIA_NAME, Property::Text(display));
    }

    description
}

/// Scans for candidate block devices on a Linux system.
///
/// This function discovers devices by iterating through the `/sys/block`
/// directory and describing each one the same way the executor will when an
/// operation is requested. The filtering logic is as follows:
/// 1.  Find the main system drive (e.g., `nvme0n1`) and exclude it.
/// 2.  Skip virtual devices (loop, ram, zram, device-mapper, md) and the
///     boot/RPMB areas of eMMC devices.
/// 3.  Skip devices that cannot be classified or that are internal, except
///     SD cards, which may sit behind an internal reader.
/// 4.  Skip devices reporting a size of zero, which often corresponds to
///     empty card readers.
///
/// # Returns
///
/// A `Result<Vec<DeviceDescriptor>>` of freshly built descriptors, or an
/// error if the system drive cannot be determined or `/sys/block` cannot be
/// read.
pub fn enumerate_devices() -> Result<Vec<DeviceDescriptor>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut system_disk = None;
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let name = disk.name().to_string_lossy();
            let name = name.strip_prefix("/dev/").unwrap_or(&name);
            system_disk = Some(parent_device_name(name).to_string());
            break;
        }
    }
    let system_disk = system_disk.ok_or_else(|| anyhow!("Could not determine system drive."))?;

    enumerate_devices_in(Path::new(SYS_BLOCK), &system_disk)
}

/// Enumeration over an explicit sysfs block directory.
pub fn enumerate_devices_in(sys_block: &Path, system_disk: &str) -> Result<Vec<DeviceDescriptor>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir(sys_block)?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();

        let is_virtual = ["loop", "ram", "zram", "dm-", "md"]
            .iter()
            .any(|prefix| name.starts_with(prefix));
        if is_virtual || name == system_disk || is_mmc_hardware_partition(&name) {
            continue;
        }
        if validate_bsd_name(&name, MIN_ENUMERATED_BSD_NAME_LEN).is_err() {
            tracing::debug!(device = %name, "skipping device with unusable name");
            continue;
        }

        let description = describe_block_device(&sys_block.join(&name), &name);
        let kind = description.media_kind().unwrap_or(DeviceKind::Other);
        match classify(&name, &description) {
            Ok(Placement::External) => {}
            Ok(Placement::Internal) if kind == DeviceKind::Sd => {}
            Ok(Placement::Internal) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unclassifiable device");
                continue;
            }
        }

        let size_bytes = description.integer(keys::MEDIA_SIZE).unwrap_or(0);
        if size_bytes == 0 {
            continue;
        }

        devices.push(DeviceDescriptor {
            service_id: description.integer(keys::DEVICE_ID).unwrap_or(0),
            display_name: description
                .text(keys::MEDIA_NAME)
                .unwrap_or("Unknown device")
                .to_string(),
            bsd_name: name,
            size_bytes,
            device_kind: kind,
        });
    }

    devices.sort_by(|a, b| a.bsd_name.cmp(&b.bsd_name));
    Ok(devices)
}

/// Disk arbitration backed by sysfs, the mount table and `umount2`.
#[derive(Clone, Debug)]
pub struct LinuxArbiter {
    sys_block: PathBuf,
    mounts: PathBuf,
    dev_dir: PathBuf,
    system_root: PathBuf,
}

impl Default for LinuxArbiter {
    fn default() -> Self {
        Self::with_roots(SYS_BLOCK, MOUNTS, DEV)
    }
}

impl LinuxArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An arbiter reading from alternative roots, e.g. a sysfs snapshot.
    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        mounts: impl Into<PathBuf>,
        dev_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            mounts: mounts.into(),
            dev_dir: dev_dir.into(),
            system_root: PathBuf::from(SYSTEM_ROOT),
        }
    }

    /// Uses `root` instead of `/` when looking for the disk that holds the
    /// running system.
    pub fn with_system_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.system_root = root.into();
        self
    }

    /// Whether `disk`, one of its partitions, or a device stacked on them
    /// holds the system root.
    ///
    /// Checked two ways: the device number backing the root directory, and
    /// the source of the `/` entry in the mount table. An unreadable root
    /// counts as a match, so the answer fails closed.
    fn holds_system_root(&self, disk: &LinuxDisk) -> bool {
        let root_dev = match fs::metadata(&self.system_root) {
            Ok(meta) => {
                let dev = meta.dev();
                format!("{}:{}", libc::major(dev), libc::minor(dev))
            }
            Err(e) => {
                tracing::warn!(root = %self.system_root.display(), error = %e, "cannot stat system root");
                return true;
            }
        };

        let mut candidates = vec![disk.sys_path.clone()];
        if let Ok(entries) = fs::read_dir(&disk.sys_path) {
            candidates.extend(
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().starts_with(&disk.name))
                    .map(|e| e.path()),
            );
        }
        if candidates
            .iter()
            .any(|dir| self.device_or_holder_is(dir, &root_dev, MAX_HOLDER_DEPTH))
        {
            return true;
        }

        fs::read_to_string(&self.mounts)
            .map(|table| {
                table.lines().any(|line| {
                    let mut fields = line.split_whitespace();
                    let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
                        return false;
                    };
                    target == SYSTEM_ROOT
                        && source
                            .strip_prefix("/dev/")
                            .is_some_and(|device| belongs_to_disk(device, &disk.name))
                })
            })
            .unwrap_or(false)
    }

    /// Whether the block device at `dir`, or anything in its `holders`
    /// chain, has device number `wanted`.
    fn device_or_holder_is(&self, dir: &Path, wanted: &str, depth: usize) -> bool {
        if read_sys_file(dir, "dev").is_ok_and(|dev| dev == wanted) {
            return true;
        }
        if depth == 0 {
            return false;
        }
        let Ok(holders) = fs::read_dir(dir.join("holders")) else {
            return false;
        };
        holders.filter_map(Result::ok).any(|holder| {
            self.device_or_holder_is(&self.sys_block.join(holder.file_name()), wanted, depth - 1)
        })
    }
}

impl DiskArbiter for LinuxArbiter {
    type Session = LinuxSession;

    fn open_session(&self) -> Result<LinuxSession, OperationError> {
        fs::read_dir(&self.sys_block).map_err(|e| {
            OperationError::SessionCreateFailed(format!("{}: {e}", self.sys_block.display()))
        })?;
        tracing::debug!("arbitration session opened");
        Ok(LinuxSession {
            arbiter: self.clone(),
            scheduled: false,
        })
    }
}

/// A whole disk resolved by a [`LinuxSession`].
#[derive(Clone, Debug)]
pub struct LinuxDisk {
    name: String,
    sys_path: PathBuf,
    dev_path: PathBuf,
}

pub struct LinuxSession {
    arbiter: LinuxArbiter,
    scheduled: bool,
}

impl LinuxSession {
    /// Runs `work` on a worker thread and reports its outcome through
    /// `callback`, the way an OS delivers arbitration callbacks.
    fn deliver<F>(&self, callback: OperationCallback, work: F)
    where
        F: FnOnce() -> Option<Dissenter> + Send + 'static,
    {
        let spawned = thread::Builder::new()
            .name(format!("diskgate-{}", callback.operation()))
            .spawn(move || {
                let dissenter = work();
                callback.complete(dissenter);
            });
        // On spawn failure the closure, and the callback inside it, are
        // dropped, which reports the operation as abandoned.
        if let Err(e) = spawned {
            tracing::error!(error = %e, "could not start disk worker");
        }
    }
}

fn unmount_all(mounts: &Path, disk: &LinuxDisk) -> Option<Dissenter> {
    let points = match mount_points_of(mounts, &disk.name) {
        Ok(points) => points,
        Err(e) => return Some(io_dissenter(&e)),
    };
    for point in points {
        tracing::debug!(device = %disk.name, mount_point = %point.display(), "unmounting");
        if let Err(errno) = umount2(&point, MntFlags::empty()) {
            return Some(errno_dissenter(errno));
        }
    }
    None
}

fn detach(disk: &LinuxDisk) -> Option<Dissenter> {
    // Flushing is best effort: the kernel flushes again on detach.
    match File::open(&disk.dev_path) {
        Ok(file) => {
            if let Err(errno) = unsafe { blkflsbuf(file.as_raw_fd()) } {
                tracing::debug!(device = %disk.name, %errno, "buffer flush failed");
            }
        }
        Err(e) => tracing::debug!(device = %disk.name, error = %e, "could not open device to flush"),
    }

    match fs::write(disk.sys_path.join("device/delete"), b"1") {
        Ok(()) => None,
        Err(e) => Some(io_dissenter(&e)),
    }
}

fn errno_dissenter(errno: Errno) -> Dissenter {
    Dissenter::new(errno as i32, errno.desc())
}

fn io_dissenter(err: &io::Error) -> Dissenter {
    Dissenter::new(err.raw_os_error().unwrap_or(-1), err.to_string())
}

impl ArbitrationSession for LinuxSession {
    type Disk = LinuxDisk;

    fn schedule(&mut self, _run_loop: &RunLoop) -> Result<(), OperationError> {
        // Completion reaches the loop through the callback itself; the
        // session only tracks that it is attached.
        self.scheduled = true;
        Ok(())
    }

    fn unschedule(&mut self) {
        self.scheduled = false;
    }

    fn resolve_disk(&self, bsd_name: &str) -> Result<LinuxDisk, OperationError> {
        if is_mmc_hardware_partition(bsd_name) {
            return Err(OperationError::DiskResolveFailed {
                name: bsd_name.to_string(),
                reason: "eMMC boot and RPMB areas are not disks".into(),
            });
        }
        let sys_path = self.arbiter.sys_block.join(bsd_name);
        if !sys_path.join("dev").is_file() {
            return Err(OperationError::DiskResolveFailed {
                name: bsd_name.to_string(),
                reason: format!("{} is not a block device", sys_path.display()),
            });
        }
        Ok(LinuxDisk {
            name: bsd_name.to_string(),
            sys_path,
            dev_path: self.arbiter.dev_dir.join(bsd_name),
        })
    }

    fn describe(&self, disk: &LinuxDisk) -> Result<DiskDescription, OperationError> {
        if !disk.sys_path.is_dir() {
            return Err(OperationError::DescriptionFetchFailed {
                name: disk.name.clone(),
                reason: "device disappeared".into(),
            });
        }
        let system = self.arbiter.holds_system_root(disk);
        Ok(describe_block_device(&disk.sys_path, &disk.name)
            .with(keys::SYSTEM_DISK, Property::Bool(system)))
    }

    fn unmount_whole(&self, disk: &LinuxDisk, callback: OperationCallback) {
        let mounts = self.arbiter.mounts.clone();
        let disk = disk.clone();
        self.deliver(callback, move || unmount_all(&mounts, &disk));
    }

    fn eject(&self, disk: &LinuxDisk, callback: OperationCallback) {
        let mounts = self.arbiter.mounts.clone();
        let disk = disk.clone();
        self.deliver(callback, move || {
            unmount_all(&mounts, &disk).or_else(|| detach(&disk))
        });
    }
}

impl Drop for LinuxSession {
    fn drop(&mut self) {
        if self.scheduled {
            tracing::debug!("releasing a session that was still scheduled");
        }
        tracing::debug!("arbitration session released");
    }
}
