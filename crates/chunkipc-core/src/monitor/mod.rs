//! Crash-recovery monitor
//!
//! The monitor hands out owner ids, watches every registered process and
//! drives reclamation when one exits without unregistering. It runs three
//! threads around one shared state:
//!
//! - the registrar answers registration and unregistration requests;
//! - the watcher checks liveness every poll interval and retries pending
//!   clean-ups;
//! - the writer rewrites the active databases file after each change.

mod cleanup;
mod interface;
mod liveness;
mod registry;

pub use interface::{
    provisional_owner, MonitorLink, Operation, ProcessKind, RegistrationRequest, SEGMENT_NAME_CAPACITY,
};
pub use liveness::{InProcessResolver, PeerLiveness, ProcessLiveness, SegmentResolver, ShmSegmentResolver};
pub use registry::{ProcessEntry, Registry};

use crate::config::MonitorConfig;
use crate::owner_id::OwnerId;
use crate::segment::Segment;
use crate::{Error, Result};
use cleanup::{PendingCleanUp, Progress};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct Inner {
    registry: Registry,
    /// Segments of registered databases, by database owner id
    segments: HashMap<OwnerId, Arc<Segment>>,
    pending: Vec<PendingCleanUp>,
    databases_dirty: bool,
}

struct MonitorState {
    config: MonitorConfig,
    link: Arc<MonitorLink>,
    liveness: Arc<dyn PeerLiveness>,
    resolver: Arc<dyn SegmentResolver>,
    inner: Mutex<Inner>,
    databases_changed: Condvar,
    stop: AtomicBool,
}

/// Handle to a running monitor. Dropping it stops the threads.
pub struct Monitor {
    state: Arc<MonitorState>,
    threads: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Start a monitor on named shared memory, checking peers with the OS
    pub fn start(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let link = Arc::new(MonitorLink::create(&config)?);
        Self::start_with(config, link, Arc::new(ProcessLiveness), Arc::new(ShmSegmentResolver))
    }

    /// Start a monitor with injected parts
    pub fn start_with(
        config: MonitorConfig,
        link: Arc<MonitorLink>,
        liveness: Arc<dyn PeerLiveness>,
        resolver: Arc<dyn SegmentResolver>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            server = %config.server_name,
            interface = link.name(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "monitor starting"
        );
        let state = Arc::new(MonitorState {
            config,
            link,
            liveness,
            resolver,
            inner: Mutex::new(Inner {
                registry: Registry::new(),
                segments: HashMap::new(),
                pending: Vec::new(),
                // The file starts out empty
                databases_dirty: true,
            }),
            databases_changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut monitor = Self {
            state,
            threads: Vec::new(),
        };
        monitor.spawn("chunkipc-registrar", MonitorState::run_registrar)?;
        monitor.spawn("chunkipc-watcher", MonitorState::run_watcher)?;
        monitor.spawn("chunkipc-writer", MonitorState::run_writer)?;
        monitor.state.link.set_ready(Some(std::process::id()));
        info!("monitor started");
        Ok(monitor)
    }

    fn spawn(&mut self, name: &str, body: fn(&MonitorState)) -> Result<()> {
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("thread started");
            body(&state);
            debug!("thread exiting");
        })?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.state.config
    }

    pub fn link(&self) -> Arc<MonitorLink> {
        Arc::clone(&self.state.link)
    }

    /// Registered processes
    pub fn processes(&self) -> Vec<(OwnerId, ProcessEntry)> {
        self.state.inner.lock().registry.entries()
    }

    pub fn active_databases(&self) -> Vec<String> {
        self.state.inner.lock().registry.active_databases()
    }

    /// Client slots still waiting to be reclaimed
    pub fn pending_clean_ups(&self) -> usize {
        self.state.inner.lock().pending.len()
    }

    /// Stop and join every monitor thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        info!("monitor stopping");
        self.state.link.set_ready(None);
        self.state.stop.store(true, Ordering::Release);
        self.state.databases_changed.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("monitor thread panicked");
            }
        }
        info!("monitor stopped");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MonitorState {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run_registrar(&self) {
        while !self.stopping() {
            if let Some(request) = self.link.take_request(self.config.registrar_tick) {
                self.handle_request(request);
            }
        }
    }

    fn run_watcher(&self) {
        while !self.stopping() {
            self.check_peers();
            self.advance_clean_ups();
            self.clear_dead_registrants();
            thread::sleep(self.config.poll_interval);
        }
    }

    fn run_writer(&self) {
        let path = self.config.active_databases_path();
        loop {
            let names = {
                let mut inner = self.inner.lock();
                while !inner.databases_dirty && !self.stopping() {
                    self.databases_changed
                        .wait_for(&mut inner, self.config.registrar_tick);
                }
                if !inner.databases_dirty {
                    return;
                }
                inner.databases_dirty = false;
                inner.registry.active_databases()
            };
            match write_active_databases(&path, &names) {
                Ok(()) => {
                    let generation = self.link.signal_active_databases_changed();
                    info!(path = %path.display(), databases = ?names, generation, "active databases written");
                }
                Err(e) => error!(path = %path.display(), error = %e, "failed to write active databases"),
            }
        }
    }

    fn mark_databases_dirty(&self, inner: &mut Inner) {
        inner.databases_dirty = true;
        self.databases_changed.notify_one();
    }

    fn handle_request(&self, request: RegistrationRequest) {
        let answer = match request.operation {
            Operation::Register => self.register(&request),
            Operation::Unregister => self.unregister(&request),
        };
        let answer = answer.map_err(|e| {
            warn!(pid = request.pid, kind = ?request.kind, operation = ?request.operation, error = %e, "request refused");
        });
        // No point holding a reply longer than the registrant waits for it
        self.link
            .reply(request.sequence, answer, self.config.registration_timeout);
    }

    fn register(&self, request: &RegistrationRequest) -> Result<OwnerId> {
        // Opened before taking the lock; resolution may touch the OS
        let segment = match (request.kind, &request.segment_name) {
            (ProcessKind::Database, Some(name)) => match self.resolver.open(name) {
                Ok(segment) => Some(segment),
                Err(e) => {
                    warn!(segment = %name, error = %e, "database segment not reachable, clients will not be cleaned up");
                    None
                }
            },
            _ => None,
        };

        let mut inner = self.inner.lock();
        let owner = inner
            .registry
            .register(request.pid, request.kind, request.segment_name.clone())?;
        if request.kind == ProcessKind::Database {
            if let Some(segment) = segment {
                inner.segments.insert(owner, segment);
            }
            self.mark_databases_dirty(&mut inner);
        }
        info!(pid = request.pid, kind = ?request.kind, %owner, segment = ?request.segment_name, "process registered");
        Ok(owner)
    }

    fn unregister(&self, request: &RegistrationRequest) -> Result<OwnerId> {
        let mut inner = self.inner.lock();
        let entry = inner.registry.unregister(request.owner, request.pid)?;
        if entry.kind == ProcessKind::Database {
            if let Some(segment) = inner.segments.remove(&request.owner) {
                inner.pending.retain(|p| !Arc::ptr_eq(&p.segment, &segment));
            }
            self.mark_databases_dirty(&mut inner);
        }
        info!(pid = request.pid, kind = ?entry.kind, owner = %request.owner, "process unregistered");
        Ok(request.owner)
    }

    fn check_peers(&self) {
        let entries = self.inner.lock().registry.entries();
        for (owner, entry) in entries {
            if !self.liveness.is_alive(entry.pid) {
                self.handle_exit(owner, entry);
            }
        }
    }

    fn handle_exit(&self, owner: OwnerId, entry: ProcessEntry) {
        info!(pid = entry.pid, kind = ?entry.kind, %owner, "process exited without unregistering");
        match entry.kind {
            ProcessKind::Client => {
                let segments: Vec<Arc<Segment>> = {
                    let mut inner = self.inner.lock();
                    inner.registry.remove(owner);
                    inner.segments.values().cloned().collect()
                };
                let mut pending = Vec::new();
                for segment in &segments {
                    segment.force_unlock_owned_by(owner);
                    pending.extend(cleanup::mark_dead_client(segment, owner, self.config.notify_timeout));
                }
                if pending.is_empty() {
                    debug!(%owner, "dead client held no client slot");
                }
                self.inner.lock().pending.extend(pending);
            }
            ProcessKind::Database => {
                let segment = {
                    let mut inner = self.inner.lock();
                    inner.registry.remove(owner);
                    self.mark_databases_dirty(&mut inner);
                    let segment = inner.segments.remove(&owner);
                    if let Some(segment) = &segment {
                        inner.pending.retain(|p| !Arc::ptr_eq(&p.segment, segment));
                    }
                    segment
                };
                if let Some(segment) = segment {
                    cleanup::database_terminated(&segment, owner);
                }
            }
        }
        self.link.force_unlock_owned_by(owner);
    }

    fn advance_clean_ups(&self) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        if pending.is_empty() {
            return;
        }
        let mut keep = Vec::with_capacity(pending.len());
        for mut p in pending {
            match cleanup::advance(&mut p, self.config.notify_timeout, self.config.cleanup_retries) {
                Progress::Done => {
                    info!(segment = p.segment.name(), client = p.client_number, owner = %p.owner, "clean-up complete");
                    self.link.signal_clean_up();
                }
                Progress::Pending => keep.push(p),
                Progress::GaveUp => error!(
                    segment = p.segment.name(),
                    client = p.client_number,
                    owner = %p.owner,
                    attempts = p.attempts,
                    "clean-up did not complete, giving up"
                ),
            }
        }
        self.inner.lock().pending.extend(keep);
    }

    /// Clear rendezvous locks left by processes that died while registering
    fn clear_dead_registrants(&self) {
        for (tag, pid) in self.link.provisional_holders() {
            if !self.liveness.is_alive(pid) {
                warn!(pid, "registering process died holding a monitor lock");
                self.link.force_unlock_owned_by(tag);
            }
        }
    }
}

/// Rewrite the active databases file, one name per line
fn write_active_databases(path: &Path, names: &[String]) -> Result<()> {
    let mut contents = String::new();
    for name in names {
        contents.push_str(name);
        contents.push('\n');
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path).map_err(Error::from)
}
