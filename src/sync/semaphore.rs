//! Named POSIX semaphore used as the cooperative lock around the register store.
use std::{ffi::CString, io, time::Duration};

use crate::error::{BridgeError, BridgeResult};

/// A lock that can be tried for a bounded time and released only by its holder.
pub trait CooperativeLock: Send {
    fn name(&self) -> &str;

    /// Wait at most `max_wait`; `Ok(false)` when the time ran out.
    fn try_acquire(&mut self, max_wait: Duration) -> BridgeResult<bool>;

    /// Give the lock back. Does nothing when it is not held.
    fn release(&mut self) -> BridgeResult<()>;

    fn is_held(&self) -> bool;
}

pub struct NamedSemaphore {
    name: String,
    handle: *mut libc::sem_t,
    held: bool,
}

// The handle is a process-wide kernel object; sem_* calls are thread safe.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Create `name` with `initial` count. With `force` an existing semaphore of
    /// that name is opened as is (orphan recovery after an unclean exit).
    pub fn open(name: &str, initial: u32, force: bool, mode: u32) -> BridgeResult<Self> {
        let bare = name.trim_start_matches('/');
        if bare.is_empty() || bare.contains('/') {
            return Err(BridgeError::config(format!(
                "'{name}' is not a valid semaphore name"
            )));
        }
        let os_name = format!("/{bare}");
        let c_name = CString::new(os_name.clone())
            .map_err(|_| BridgeError::config(format!("semaphore name '{name}' contains NUL")))?;

        let handle = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                mode as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if handle != libc::SEM_FAILED {
            log::debug!("Created semaphore '{os_name}'");
            return Ok(Self {
                name: os_name,
                handle,
                held: false,
            });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(BridgeError::resource(
                format!("failed to create semaphore '{os_name}'"),
                err,
            ));
        }
        if !force {
            return Err(BridgeError::SemaphoreExists { name: os_name });
        }

        let handle = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if handle == libc::SEM_FAILED {
            return Err(BridgeError::resource(
                format!("failed to open semaphore '{os_name}'"),
                io::Error::last_os_error(),
            ));
        }
        log::warn!("Reusing existing semaphore '{os_name}'");
        Ok(Self {
            name: os_name,
            handle,
            held: false,
        })
    }

    #[cfg(target_os = "linux")]
    fn timed_wait(&mut self, max_wait: Duration) -> io::Result<bool> {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let nanos = deadline.tv_nsec as u64 + u64::from(max_wait.subsec_nanos());
        deadline.tv_sec += (max_wait.as_secs() + nanos / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;

        loop {
            if unsafe { libc::sem_timedwait(self.handle, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn timed_wait(&mut self, max_wait: Duration) -> io::Result<bool> {
        const STEP: Duration = Duration::from_millis(1);
        let deadline = std::time::Instant::now() + max_wait;
        loop {
            if unsafe { libc::sem_trywait(self.handle) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                _ => return Err(err),
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(STEP);
        }
    }
}

impl CooperativeLock for NamedSemaphore {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&mut self, max_wait: Duration) -> BridgeResult<bool> {
        if self.held {
            return Ok(true);
        }
        let acquired = self.timed_wait(max_wait).map_err(|e| {
            BridgeError::resource(format!("failed to wait on semaphore '{}'", self.name), e)
        })?;
        self.held = acquired;
        Ok(acquired)
    }

    fn release(&mut self) -> BridgeResult<()> {
        if !self.held {
            return Ok(());
        }
        if unsafe { libc::sem_post(self.handle) } != 0 {
            return Err(BridgeError::resource(
                format!("failed to post semaphore '{}'", self.name),
                io::Error::last_os_error(),
            ));
        }
        self.held = false;
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("{err}");
        }
        // Closed but never unlinked: other processes keep using the same name.
        unsafe {
            libc::sem_close(self.handle);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("held", &self.held)
            .finish()
    }
}

/// Remove a semaphore name; used by tests and operator tooling.
pub fn unlink(name: &str) -> io::Result<()> {
    let c_name = CString::new(format!("/{}", name.trim_start_matches('/')))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn unique() -> String {
        format!(
            "sem_test_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn binary_semaphore_times_out_while_held() {
        let name = unique();
        let mut first = NamedSemaphore::open(&name, 1, false, 0o600).unwrap();
        let mut second = NamedSemaphore::open(&name, 1, true, 0o600).unwrap();

        assert!(first.try_acquire(Duration::from_millis(100)).unwrap());
        assert!(first.is_held());
        assert!(!second.try_acquire(Duration::from_millis(20)).unwrap());
        assert!(!second.is_held());

        first.release().unwrap();
        assert!(second.try_acquire(Duration::from_millis(100)).unwrap());
        second.release().unwrap();

        drop(first);
        drop(second);
        unlink(&name).unwrap();
    }

    #[test]
    fn existing_name_needs_force() {
        let name = unique();
        let _owner = NamedSemaphore::open(&name, 1, false, 0o600).unwrap();
        let err = NamedSemaphore::open(&name, 1, false, 0o600).unwrap_err();
        assert!(matches!(err, BridgeError::SemaphoreExists { .. }));
        unlink(&name).unwrap();
    }

    #[test]
    fn release_without_acquire_keeps_the_count() {
        let name = unique();
        let mut sem = NamedSemaphore::open(&name, 1, false, 0o600).unwrap();
        sem.release().unwrap();
        sem.release().unwrap();

        let mut other = NamedSemaphore::open(&name, 1, true, 0o600).unwrap();
        assert!(sem.try_acquire(Duration::from_millis(50)).unwrap());
        // A double post above would have left a second token for `other`.
        assert!(!other.try_acquire(Duration::from_millis(20)).unwrap());
        sem.release().unwrap();
        drop(other);
        drop(sem);
        unlink(&name).unwrap();
    }
}
