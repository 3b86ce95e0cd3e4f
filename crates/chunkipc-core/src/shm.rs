//! Named POSIX shared memory

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};

/// Named shared memory mapping
///
/// The creating process owns the name and unlinks it on drop; processes
/// that open an existing mapping only unmap it.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// SAFETY: the mapping is plain memory. Everything placed in it is accessed
// through atomics, so sharing the handle between threads is sound.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a zero-filled mapping. Fails if the name is taken.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists => {
                    Error::SharedMemory(format!("{} already exists", name))
                }
                e => Error::SharedMemory(format!("create {}: {}", name, e)),
            })?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Open a mapping created by another process
    pub fn open(name: &str) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(format!("open {}: {}", name, e)))?;
        shmem.set_owner(false);

        let size = shmem.len();
        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.inner.is_owner()
    }

    /// Keep the name alive after this handle is dropped
    pub fn disown(&mut self) {
        self.inner.set_owner(false);
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.is_owner())
            .finish()
    }
}
