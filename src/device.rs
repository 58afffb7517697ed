//! Reference-counted GPU device handles, deduplicated by render node.
//!
//! The remote peer identifies devices by raw `dev_t` numbers. Several
//! numbers can resolve to the same render node (a card node and its render
//! node describe one device), so the registry keys its cache on the
//! *resolved* node path and hands out shared-ownership handles: a device is
//! closed exactly when the last handle referencing it is dropped.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::error::AllocError;

/// Major number of DRM character devices on Linux.
const DRM_MAJOR: u32 = 226;

/// First minor number reserved for render nodes.
const RENDER_NODE_MINOR_BASE: u32 = 128;

struct DeviceShared {
    gbm: gbm::Device<File>,
    node_path: PathBuf,
    devnum: libc::dev_t,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        debug!(node = %self.node_path.display(), "closing GPU device");
    }
}

/// A shared-ownership handle to an opened GPU device.
///
/// Obtained from [`DeviceRegistry::get_or_open`] or by duplication; never
/// constructed directly. Dropping the last handle for a device closes it.
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
}

impl DeviceHandle {
    /// The gbm allocation device.
    pub fn gbm(&self) -> &gbm::Device<File> {
        &self.shared.gbm
    }

    /// Path of the render node backing this handle.
    pub fn node_path(&self) -> &Path {
        &self.shared.node_path
    }

    /// The device number this handle was originally resolved from.
    pub fn devnum(&self) -> libc::dev_t {
        self.shared.devnum
    }

    /// Whether two handles refer to the same opened device.
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("node", &self.shared.node_path)
            .field("refs", &Arc::strong_count(&self.shared))
            .finish()
    }
}

/// Owns the cache of opened GPU devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<PathBuf, Weak<DeviceShared>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Return a handle for `devnum`, opening the device on first use.
    ///
    /// The device number is resolved to its render node first, so a card
    /// node and its render node share one refcount. Fails if the number
    /// does not resolve to a render-capable node or the node cannot be
    /// opened; callers should treat that as "try a different tranche".
    pub fn get_or_open(&mut self, devnum: libc::dev_t) -> Result<DeviceHandle, AllocError> {
        let node_path = resolve_render_node(devnum).ok_or_else(|| AllocError::DeviceUnavailable {
            devnum: devnum as u64,
            reason: "no render node for device".into(),
        })?;

        if let Some(weak) = self.devices.get(&node_path) {
            if let Some(shared) = weak.upgrade() {
                return Ok(DeviceHandle { shared });
            }
        }

        let file = File::options()
            .read(true)
            .write(true)
            .open(&node_path)
            .map_err(|e| AllocError::DeviceUnavailable {
                devnum: devnum as u64,
                reason: format!("open {}: {e}", node_path.display()),
            })?;

        let gbm = gbm::Device::new(file).map_err(|e| AllocError::DeviceUnavailable {
            devnum: devnum as u64,
            reason: format!("gbm init on {}: {e}", node_path.display()),
        })?;

        debug!(node = %node_path.display(), devnum, "opened GPU device");

        let shared = Arc::new(DeviceShared {
            gbm,
            node_path: node_path.clone(),
            devnum,
        });
        self.devices.insert(node_path, Arc::downgrade(&shared));
        Ok(DeviceHandle { shared })
    }

    /// Duplicate a handle, sharing the refcount with the original.
    ///
    /// Equivalent to `handle.clone()`; present so all ownership operations
    /// read as registry calls.
    pub fn duplicate(&self, handle: &DeviceHandle) -> DeviceHandle {
        handle.clone()
    }

    /// Release one handle. The device closes when this was the last one.
    pub fn release(&mut self, handle: DeviceHandle) {
        drop(handle);
        self.devices.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live handles for the device `devnum` resolves to.
    ///
    /// Zero means the device is not currently open.
    pub fn refcount(&self, devnum: libc::dev_t) -> usize {
        resolve_render_node(devnum)
            .and_then(|path| self.devices.get(&path))
            .map(|weak| weak.strong_count())
            .unwrap_or(0)
    }
}

/// Resolve a raw device number to the path of its render node.
///
/// Walks `/sys/dev/char/<major>:<minor>/device/drm`, which lists every DRM
/// node of the underlying device, and picks the render node. Falls back to
/// the conventional `/dev/dri/renderD<minor>` path when sysfs is not
/// informative but the number already names a render node.
pub fn resolve_render_node(devnum: libc::dev_t) -> Option<PathBuf> {
    let major = libc::major(devnum);
    let minor = libc::minor(devnum);
    if major != DRM_MAJOR {
        warn!(devnum, major, "device is not a DRM node");
        return None;
    }

    let sys_path = format!("/sys/dev/char/{major}:{minor}/device/drm");
    if let Ok(entries) = std::fs::read_dir(&sys_path) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with("renderD") {
                    let node = PathBuf::from("/dev/dri").join(name);
                    if node.exists() {
                        return Some(node);
                    }
                }
            }
        }
    }

    if minor >= RENDER_NODE_MINOR_BASE {
        let node = PathBuf::from(format!("/dev/dri/renderD{minor}"));
        if node.exists() {
            return Some(node);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_drm_major_is_rejected() {
        // dev_t for /dev/null (major 1, minor 3) is never a DRM node.
        let devnum = libc::makedev(1, 3);
        assert!(resolve_render_node(devnum).is_none());
    }

    #[test]
    fn test_unknown_device_refcount_is_zero() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.refcount(libc::makedev(1, 3)), 0);
    }

    #[test]
    fn test_get_or_open_fails_for_unresolvable_device() {
        let mut registry = DeviceRegistry::new();
        let err = registry.get_or_open(libc::makedev(1, 3)).unwrap_err();
        assert!(matches!(err, AllocError::DeviceUnavailable { .. }));
    }
}
