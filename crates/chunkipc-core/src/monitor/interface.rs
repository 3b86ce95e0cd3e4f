//! Monitor interface: the named region processes use to reach the monitor
//!
//! Registration and unregistration are a rendezvous. The caller takes the
//! global lock, writes the `in` record under its own lock, sets the request
//! event and waits for the `out` record to carry the answer to its request
//! sequence number. The `out` flag is only ever cleared while holding the
//! `out` lock, and a late answer to a timed-out request is recognized by
//! its sequence number and dropped.
//!
//! While a process has no owner id yet it tags the locks with a
//! provisional id carrying its pid, so the monitor can clear them if it
//! dies mid-rendezvous.

use crate::config::MonitorConfig;
use crate::event::Event;
use crate::memory::SegmentMemory;
use crate::owner_id::{AtomicOwnerId, OwnerId};
use crate::spinlock::RobustSpinlock;
use crate::{Error, Result, TimeoutKind};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAGIC: u32 = 0x4D4F_4E49; // "MONI"
const VERSION: u32 = 1;

/// Longest segment name a request can carry
pub const SEGMENT_NAME_CAPACITY: usize = 64;

const PROVISIONAL_BIT: u64 = 1 << 62;

const STATUS_OK: u32 = 0;
const STATUS_REFUSED: u32 = 1;

/// Lock tag of a process that has no owner id yet
pub fn provisional_owner(pid: u32) -> OwnerId {
    OwnerId::new(PROVISIONAL_BIT | pid as u64)
}

/// Pid behind a provisional lock tag
pub fn provisional_pid(owner: OwnerId) -> Option<u32> {
    if owner.id() & PROVISIONAL_BIT != 0 {
        Some((owner.id() & u32::MAX as u64) as u32)
    } else {
        None
    }
}

/// Kind of registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProcessKind {
    Database = 1,
    Client = 2,
}

impl ProcessKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ProcessKind::Database),
            2 => Some(ProcessKind::Client),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    Register = 1,
    Unregister = 2,
}

impl Operation {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Operation::Register),
            2 => Some(Operation::Unregister),
            _ => None,
        }
    }
}

/// A request as read by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub sequence: u64,
    pub pid: u32,
    pub kind: ProcessKind,
    pub operation: Operation,
    pub owner: OwnerId,
    pub segment_name: Option<String>,
}

#[repr(C, align(64))]
struct RequestRecord {
    lock: RobustSpinlock,
    available: AtomicU32,
    pid: AtomicU32,
    kind: AtomicU32,
    operation: AtomicU32,
    name_len: AtomicU32,
    sequence: AtomicU64,
    owner: AtomicOwnerId,
    name: [AtomicU8; SEGMENT_NAME_CAPACITY],
}

#[repr(C, align(64))]
struct ReplyRecord {
    lock: RobustSpinlock,
    available: AtomicU32,
    status: AtomicU32,
    sequence: AtomicU64,
    owner: AtomicOwnerId,
}

/// Shared record between the monitor and every registering process
#[repr(C)]
pub struct MonitorInterface {
    magic: AtomicU32,
    version: AtomicU32,
    ready: AtomicU32,
    monitor_pid: AtomicU32,
    lock: RobustSpinlock,
    next_sequence: AtomicU64,
    request: RequestRecord,
    reply: ReplyRecord,
    request_event: Event,
    reply_event: Event,
    clean_up_wait: Event,
    active_databases_changed: Event,
    active_databases_generation: AtomicU64,
}

/// What a caller sends
struct Outgoing<'a> {
    pid: u32,
    kind: ProcessKind,
    operation: Operation,
    owner: OwnerId,
    segment_name: Option<&'a str>,
    /// Tag for the rendezvous locks
    tag: OwnerId,
}

/// Handle on a monitor interface region
pub struct MonitorLink {
    memory: SegmentMemory,
    name: String,
    registration_timeout: Duration,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn shm_os_id(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

impl MonitorLink {
    /// Create the named region. Called by the monitor; the handle removes
    /// the name when dropped.
    pub fn create(config: &MonitorConfig) -> Result<Self> {
        let name = config.interface_name();
        let memory = SegmentMemory::create_shared(&shm_os_id(&name), size_of::<MonitorInterface>())?;
        let link = Self {
            memory,
            name,
            registration_timeout: config.registration_timeout,
        };
        link.initialize();
        Ok(link)
    }

    /// Region in process-local memory, for a monitor and its peers living
    /// in one process
    pub fn create_local(name: &str) -> Self {
        let link = Self {
            memory: SegmentMemory::local(size_of::<MonitorInterface>()),
            name: name.to_string(),
            registration_timeout: MonitorConfig::default().registration_timeout,
        };
        link.initialize();
        link
    }

    /// Open the region of a running monitor
    pub fn open(config: &MonitorConfig) -> Result<Self> {
        let name = config.interface_name();
        let memory = SegmentMemory::open_shared(&shm_os_id(&name))?;
        if memory.size() < size_of::<MonitorInterface>() {
            return Err(Error::BadSegment(format!("{}: {} bytes is too small", name, memory.size())));
        }
        let link = Self {
            memory,
            name,
            registration_timeout: config.registration_timeout,
        };
        let interface = link.interface();
        let magic = interface.magic.load(Ordering::Acquire);
        let version = interface.version.load(Ordering::Acquire);
        if magic != MAGIC || version != VERSION {
            warn!(interface = %link.name, magic, version, "refusing monitor interface");
            return Err(Error::BadSegment(format!(
                "{}: magic {:#x} version {}",
                link.name, magic, version
            )));
        }
        Ok(link)
    }

    fn initialize(&self) {
        let interface = self.interface();
        interface.magic.store(MAGIC, Ordering::Relaxed);
        interface.version.store(VERSION, Ordering::Release);
    }

    fn interface(&self) -> &MonitorInterface {
        // SAFETY: the mapping is at least size_of::<MonitorInterface>() bytes,
        // 64-byte aligned, and an all-zero record is valid.
        unsafe { &*(self.memory.as_ptr() as *const MonitorInterface) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long a registrant waits for the monitor's answer, taken from
    /// the [`MonitorConfig`] the link was opened with
    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// True while a monitor serves this region
    pub fn is_ready(&self) -> bool {
        self.interface().ready.load(Ordering::Acquire) != 0
    }

    pub fn monitor_pid(&self) -> u32 {
        self.interface().monitor_pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, pid: Option<u32>) {
        let interface = self.interface();
        interface.monitor_pid.store(pid.unwrap_or(0), Ordering::Relaxed);
        interface.ready.store(pid.is_some() as u32, Ordering::Release);
    }

    /// Register a client process and get its owner id
    pub fn register_client(&self, pid: u32, timeout: Duration) -> Result<OwnerId> {
        self.rendezvous(
            Outgoing {
                pid,
                kind: ProcessKind::Client,
                operation: Operation::Register,
                owner: OwnerId::NONE,
                segment_name: None,
                tag: provisional_owner(pid),
            },
            TimeoutKind::Registration,
            timeout,
        )
    }

    /// Register a database process serving `segment_name`
    pub fn register_database(&self, pid: u32, segment_name: &str, timeout: Duration) -> Result<OwnerId> {
        self.rendezvous(
            Outgoing {
                pid,
                kind: ProcessKind::Database,
                operation: Operation::Register,
                owner: OwnerId::NONE,
                segment_name: Some(segment_name),
                tag: provisional_owner(pid),
            },
            TimeoutKind::Registration,
            timeout,
        )
    }

    /// Unregister on graceful shutdown. Both `pid` and `owner` must match
    /// the registration.
    pub fn unregister(&self, pid: u32, kind: ProcessKind, owner: OwnerId, timeout: Duration) -> Result<()> {
        self.rendezvous(
            Outgoing {
                pid,
                kind,
                operation: Operation::Unregister,
                owner,
                segment_name: None,
                tag: owner,
            },
            TimeoutKind::Unregistration,
            timeout,
        )
        .map(|_| ())
    }

    fn rendezvous(&self, out: Outgoing<'_>, kind: TimeoutKind, timeout: Duration) -> Result<OwnerId> {
        let name = out.segment_name.unwrap_or("");
        if name.len() > SEGMENT_NAME_CAPACITY {
            return Err(Error::RegistrationRefused(format!("segment name {:?} too long", name)));
        }
        let interface = self.interface();
        let deadline = Instant::now() + timeout;

        // Serializes registrants
        let _global = interface
            .lock
            .guard(out.tag, timeout)
            .ok_or(Error::Timeout(TimeoutKind::Rendezvous))?;
        let sequence = interface.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let request = &interface.request;
            let _in = request
                .lock
                .guard(out.tag, remaining(deadline))
                .ok_or(Error::Timeout(TimeoutKind::Rendezvous))?;
            request.pid.store(out.pid, Ordering::Relaxed);
            request.kind.store(out.kind as u32, Ordering::Relaxed);
            request.operation.store(out.operation as u32, Ordering::Relaxed);
            request.owner.store(out.owner);
            request.name_len.store(name.len() as u32, Ordering::Relaxed);
            for (slot, byte) in request.name.iter().zip(name.bytes()) {
                slot.store(byte, Ordering::Relaxed);
            }
            request.sequence.store(sequence, Ordering::Relaxed);
            request.available.store(1, Ordering::Release);
        }
        interface.request_event.set();

        let reply = &interface.reply;
        loop {
            {
                let _out = reply
                    .lock
                    .guard(out.tag, remaining(deadline))
                    .ok_or(Error::Timeout(kind))?;
                if reply.available.load(Ordering::Acquire) != 0 {
                    reply.available.store(0, Ordering::Release);
                    if reply.sequence.load(Ordering::Relaxed) == sequence {
                        return match reply.status.load(Ordering::Relaxed) {
                            STATUS_OK => Ok(reply.owner.load()),
                            _ => Err(Error::RegistrationRefused(format!(
                                "{:?} {:?} of pid {}",
                                out.operation, out.kind, out.pid
                            ))),
                        };
                    }
                    debug!(sequence, "dropped answer to an earlier request");
                }
            }
            if Instant::now() >= deadline {
                self.withdraw(out.tag, sequence);
                return Err(Error::Timeout(kind));
            }
            interface
                .reply_event
                .wait(remaining(deadline).min(Duration::from_millis(1)));
        }
    }

    /// Take back a request the monitor has not picked up and clear any
    /// answer, each under its own lock
    fn withdraw(&self, tag: OwnerId, sequence: u64) {
        let interface = self.interface();
        let grace = Duration::from_millis(10);
        if let Some(_in) = interface.request.lock.guard(tag, grace) {
            if interface.request.sequence.load(Ordering::Relaxed) == sequence {
                interface.request.available.store(0, Ordering::Release);
            }
        }
        if let Some(_out) = interface.reply.lock.guard(tag, grace) {
            interface.reply.available.store(0, Ordering::Release);
        }
    }

    /// Next request, waiting up to `timeout`. Monitor side.
    pub(crate) fn take_request(&self, timeout: Duration) -> Option<RegistrationRequest> {
        let interface = self.interface();
        let request = &interface.request;
        if request.available.load(Ordering::Acquire) == 0 && !interface.request_event.wait(timeout) {
            return None;
        }
        let _in = request.lock.guard(OwnerId::ANONYMOUS, timeout)?;
        if request.available.load(Ordering::Acquire) == 0 {
            return None;
        }
        request.available.store(0, Ordering::Release);

        let sequence = request.sequence.load(Ordering::Relaxed);
        let pid = request.pid.load(Ordering::Relaxed);
        let (Some(kind), Some(operation)) = (
            ProcessKind::from_u32(request.kind.load(Ordering::Relaxed)),
            Operation::from_u32(request.operation.load(Ordering::Relaxed)),
        ) else {
            warn!(sequence, pid, "malformed monitor request");
            return None;
        };
        let len = (request.name_len.load(Ordering::Relaxed) as usize).min(SEGMENT_NAME_CAPACITY);
        let bytes: Vec<u8> = request.name[..len]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let segment_name = match String::from_utf8(bytes) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(_) => {
                warn!(sequence, pid, "segment name is not UTF-8");
                None
            }
        };
        Some(RegistrationRequest {
            sequence,
            pid,
            kind,
            operation,
            owner: request.owner.load(),
            segment_name,
        })
    }

    /// Answer request `sequence`. Monitor side.
    pub(crate) fn reply(&self, sequence: u64, answer: std::result::Result<OwnerId, ()>, timeout: Duration) -> bool {
        let interface = self.interface();
        let reply = &interface.reply;
        {
            let Some(_out) = reply.lock.guard(OwnerId::ANONYMOUS, timeout) else {
                warn!(sequence, "monitor reply lock timed out");
                return false;
            };
            match answer {
                Ok(owner) => {
                    reply.owner.store(owner);
                    reply.status.store(STATUS_OK, Ordering::Relaxed);
                }
                Err(()) => {
                    reply.owner.store(OwnerId::NONE);
                    reply.status.store(STATUS_REFUSED, Ordering::Relaxed);
                }
            }
            reply.sequence.store(sequence, Ordering::Relaxed);
            reply.available.store(1, Ordering::Release);
        }
        interface.reply_event.set();
        true
    }

    /// Wait until the monitor completes a clean-up
    pub fn wait_for_clean_up(&self, timeout: Duration) -> bool {
        self.interface().clean_up_wait.wait(timeout)
    }

    pub(crate) fn signal_clean_up(&self) {
        self.interface().clean_up_wait.set();
    }

    /// Bumped each time the active databases file is rewritten
    pub fn active_databases_generation(&self) -> u64 {
        self.interface().active_databases_generation.load(Ordering::Acquire)
    }

    /// Wait for the next change of the active databases list
    pub fn wait_for_active_databases_change(&self, timeout: Duration) -> bool {
        self.interface().active_databases_changed.wait(timeout)
    }

    pub(crate) fn signal_active_databases_changed(&self) -> u64 {
        let interface = self.interface();
        let generation = interface
            .active_databases_generation
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        interface.active_databases_changed.set();
        generation
    }

    fn locks(&self) -> [&RobustSpinlock; 3] {
        let interface = self.interface();
        [&interface.lock, &interface.request.lock, &interface.reply.lock]
    }

    /// Clear the rendezvous locks held by `dead`
    pub fn force_unlock_owned_by(&self, dead: OwnerId) -> usize {
        let cleared = self
            .locks()
            .into_iter()
            .filter(|lock| lock.force_unlock_if_owned_by(dead))
            .count();
        if cleared > 0 {
            warn!(interface = %self.name, owner = %dead, cleared, "force-cleared monitor interface locks");
        }
        cleared
    }

    #[cfg(test)]
    pub(crate) fn hold_global_lock(&self, tag: OwnerId) -> bool {
        self.interface().lock.try_lock(tag)
    }

    /// Pids of processes holding a rendezvous lock with a provisional tag
    pub(crate) fn provisional_holders(&self) -> Vec<(OwnerId, u32)> {
        self.locks()
            .into_iter()
            .filter_map(|lock| lock.holder())
            .filter_map(|holder| provisional_pid(holder).map(|pid| (holder, pid)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_provisional_tags() {
        let tag = provisional_owner(4242);
        assert_eq!(provisional_pid(tag), Some(4242));
        assert_eq!(provisional_pid(OwnerId::new(7)), None);
        assert!(!tag.is_clean_up());
    }

    #[test]
    fn test_registration_timeout_follows_config() {
        let link = MonitorLink::create_local("chunkipc_test_monitor_interface");
        assert_eq!(link.registration_timeout(), MonitorConfig::default().registration_timeout);
        let link = link.with_registration_timeout(Duration::from_millis(300));
        assert_eq!(link.registration_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_rendezvous_round_trip() {
        let link = Arc::new(MonitorLink::create_local("chunkipc_test_monitor_interface"));
        let server = {
            let link = Arc::clone(&link);
            thread::spawn(move || {
                let request = link.take_request(Duration::from_secs(5)).unwrap();
                assert_eq!(request.kind, ProcessKind::Database);
                assert_eq!(request.operation, Operation::Register);
                assert_eq!(request.segment_name.as_deref(), Some("chunkipc_DB_1"));
                link.reply(request.sequence, Ok(OwnerId::new(9)), Duration::from_secs(1));
            })
        };
        let owner = link
            .register_database(77, "chunkipc_DB_1", Duration::from_secs(5))
            .unwrap();
        assert_eq!(owner, OwnerId::new(9));
        server.join().unwrap();
        assert!(!link.interface().lock.is_locked());
    }

    #[test]
    fn test_timeout_clears_state() {
        let link = MonitorLink::create_local("chunkipc_test_monitor_interface");
        assert!(matches!(
            link.register_client(77, Duration::from_millis(20)),
            Err(Error::Timeout(TimeoutKind::Registration))
        ));
        // 未被取走的请求已撤回
        assert!(link.take_request(Duration::ZERO).is_none());
        assert!(!link.interface().reply.lock.is_locked());
    }

    #[test]
    fn test_late_answer_is_ignored() {
        let link = Arc::new(MonitorLink::create_local("chunkipc_test_monitor_interface"));
        // 上一个超时请求的迟到应答
        link.reply(1000, Ok(OwnerId::new(3)), Duration::from_secs(1));
        let server = {
            let link = Arc::clone(&link);
            thread::spawn(move || {
                let request = link.take_request(Duration::from_secs(5)).unwrap();
                link.reply(request.sequence, Err(()), Duration::from_secs(1));
            })
        };
        assert!(matches!(
            link.register_client(77, Duration::from_secs(5)),
            Err(Error::RegistrationRefused(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_force_unlock_provisional_holder() {
        let link = MonitorLink::create_local("chunkipc_test_monitor_interface");
        let tag = provisional_owner(55);
        assert!(link.interface().lock.try_lock(tag));
        assert_eq!(link.provisional_holders(), vec![(tag, 55)]);
        assert_eq!(link.force_unlock_owned_by(tag), 1);
        assert!(link.provisional_holders().is_empty());
    }
}
