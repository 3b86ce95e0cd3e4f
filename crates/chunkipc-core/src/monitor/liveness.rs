//! How the monitor learns that a peer is gone and reaches its segments

use crate::segment::Segment;
use crate::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Tells whether a registered process is still running
pub trait PeerLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Asks the OS with a null signal
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLiveness;

impl PeerLiveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Opens the segment a database registered with
pub trait SegmentResolver: Send + Sync {
    fn open(&self, segment_name: &str) -> Result<Arc<Segment>>;
}

/// Opens named shared memory
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmSegmentResolver;

impl SegmentResolver for ShmSegmentResolver {
    fn open(&self, segment_name: &str) -> Result<Arc<Segment>> {
        Ok(Arc::new(Segment::open(segment_name)?))
    }
}

/// Hands out segments living in this process
#[derive(Default)]
pub struct InProcessResolver {
    segments: Mutex<HashMap<String, Arc<Segment>>>,
}

impl InProcessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, segment: Arc<Segment>) {
        self.segments.lock().insert(segment.name().to_string(), segment);
    }
}

impl SegmentResolver for InProcessResolver {
    fn open(&self, segment_name: &str) -> Result<Arc<Segment>> {
        self.segments
            .lock()
            .get(segment_name)
            .cloned()
            .ok_or_else(|| Error::SharedMemory(format!("no segment named {}", segment_name)))
    }
}
