//! One named POSIX shared-memory object mapped into this process.
use std::{
    ffi::CString,
    fs::{File, Permissions},
    io,
    os::{
        fd::{FromRawFd, OwnedFd},
        unix::fs::PermissionsExt,
    },
};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{BridgeError, BridgeResult};

/// Who is responsible for removing the object from the OS namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by this process; unlinked when the region is dropped.
    Owned,
    /// Attached to an object left behind by another instance; only detached.
    Borrowed,
}

/// A shared-memory object together with its mapping.
///
/// Zero-length regions exist in the namespace but are never mapped.
pub struct SharedRegion {
    name: String,
    map: Option<MmapMut>,
    ownership: Ownership,
}

impl SharedRegion {
    /// Create `name` exclusively with `len` zeroed bytes.
    ///
    /// With `allow_reuse` an already existing object is attached instead. Its
    /// size is taken as found, so the mapping never extends past its end.
    pub fn create(name: &str, len: usize, allow_reuse: bool, mode: u32) -> BridgeResult<Self> {
        let os_name = os_name(name)?;
        let c_name = CString::new(os_name.clone())
            .map_err(|_| BridgeError::config(format!("shared memory name '{name}' contains NUL")))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                mode as libc::mode_t,
            )
        };

        if fd >= 0 {
            let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
            // From here on a failure drops `region`, which unlinks the object again.
            let mut region = SharedRegion {
                name: os_name,
                map: None,
                ownership: Ownership::Owned,
            };
            file.set_permissions(Permissions::from_mode(mode))
                .map_err(|e| region.fail("failed to set permissions of", e))?;
            file.set_len(len as u64)
                .map_err(|e| region.fail("failed to resize", e))?;
            region.map = map_file(&file, len).map_err(|e| region.fail("failed to map", e))?;
            log::debug!("Created shared memory '{}' ({len} bytes)", region.name);
            return Ok(region);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(BridgeError::resource(
                format!("failed to create shared memory '{os_name}'"),
                err,
            ));
        }
        if !allow_reuse {
            return Err(BridgeError::RegionExists { name: os_name });
        }

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(BridgeError::resource(
                format!("failed to attach to shared memory '{os_name}'"),
                io::Error::last_os_error(),
            ));
        }
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        let existing = file
            .metadata()
            .map_err(|e| BridgeError::resource(format!("failed to inspect '{os_name}'"), e))?
            .len() as usize;
        if existing != len {
            log::warn!(
                "Reusing shared memory '{os_name}' with {existing} bytes (requested {len} bytes)"
            );
        } else {
            log::warn!("Reusing existing shared memory '{os_name}'");
        }
        let map = map_file(&file, existing)
            .map_err(|e| BridgeError::resource(format!("failed to map '{os_name}'"), e))?;

        Ok(SharedRegion {
            name: os_name,
            map,
            ownership: Ownership::Borrowed,
        })
    }

    /// Name in the OS namespace (always with a leading `/`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..],
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    fn fail(&self, what: &str, err: io::Error) -> BridgeError {
        BridgeError::resource(format!("{what} shared memory '{}'", self.name), err)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Detach first; the mapping must not outlive the name we are about to drop.
        self.map.take();
        if self.ownership == Ownership::Owned {
            if let Err(err) = unlink(&self.name) {
                log::warn!("Failed to unlink shared memory '{}': {err}", self.name);
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("ownership", &self.ownership)
            .finish()
    }
}

/// Remove `name` from the shared-memory namespace.
pub fn unlink(name: &str) -> io::Result<()> {
    let c_name = CString::new(os_name_unchecked(name))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn map_file(file: &File, len: usize) -> io::Result<Option<MmapMut>> {
    if len == 0 {
        return Ok(None);
    }
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(Some(map))
}

fn os_name(name: &str) -> BridgeResult<String> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(BridgeError::config(format!(
            "'{name}' is not a valid shared memory name"
        )));
    }
    Ok(format!("/{trimmed}"))
}

fn os_name_unchecked(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn unique(tag: &str) -> String {
        format!(
            "region_test_{}_{}_{tag}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn names_get_a_single_leading_slash() {
        assert_eq!(os_name("modbus_DO").unwrap(), "/modbus_DO");
        assert_eq!(os_name("//modbus_DO").unwrap(), "/modbus_DO");
        assert!(os_name("a/b").is_err());
        assert!(os_name("/").is_err());
    }

    #[test]
    fn owned_region_is_zeroed_and_unlinked_on_drop() {
        let name = unique("owned");
        {
            let region = SharedRegion::create(&name, 32, false, 0o600).unwrap();
            assert_eq!(region.ownership(), Ownership::Owned);
            assert_eq!(region.len(), 32);
            assert!(region.as_slice().iter().all(|b| *b == 0));
        }
        // Gone from the namespace: exclusive creation works again.
        let again = SharedRegion::create(&name, 8, false, 0o600).unwrap();
        assert_eq!(again.ownership(), Ownership::Owned);
    }

    #[test]
    fn zero_length_region_has_no_mapping() {
        let name = unique("empty");
        let mut region = SharedRegion::create(&name, 0, false, 0o600).unwrap();
        assert!(region.is_empty());
        assert!(region.as_mut_slice().is_empty());
    }

    #[test]
    fn existing_region_is_rejected_or_borrowed() {
        let name = unique("reuse");
        let mut owner = SharedRegion::create(&name, 4, false, 0o600).unwrap();
        owner.as_mut_slice()[2] = 0xAB;

        let err = SharedRegion::create(&name, 4, false, 0o600).unwrap_err();
        assert!(matches!(err, BridgeError::RegionExists { .. }));

        {
            let borrowed = SharedRegion::create(&name, 4, true, 0o600).unwrap();
            assert_eq!(borrowed.ownership(), Ownership::Borrowed);
            assert_eq!(borrowed.as_slice()[2], 0xAB);
        }
        // Dropping the borrower left the object in place.
        assert_eq!(owner.as_slice()[2], 0xAB);
        assert!(matches!(
            SharedRegion::create(&name, 4, false, 0o600),
            Err(BridgeError::RegionExists { .. })
        ));
    }
}
