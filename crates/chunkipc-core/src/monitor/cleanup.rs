//! Reclaiming what a dead process left in a segment

use crate::interface::DatabaseState;
use crate::owner_id::OwnerId;
use crate::reclaim::{reclaim_client_slot, tear_down_channel};
use crate::segment::Segment;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A client slot of a dead owner that still holds resources
pub(crate) struct PendingCleanUp {
    pub segment: Arc<Segment>,
    pub client_number: u32,
    pub owner: OwnerId,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Done,
    Pending,
    GaveUp,
}

/// Mark every slot of `dead` in `segment` for clean-up, mark its channels
/// for release and wake the schedulers serving them
pub(crate) fn mark_dead_client(segment: &Arc<Segment>, dead: OwnerId, notify_timeout: Duration) -> Vec<PendingCleanUp> {
    let mut pending = Vec::new();
    for client_number in segment.client_slots_of(dead) {
        let Ok(interface) = segment.client_interface(client_number) else {
            continue;
        };
        // Counted before the flag so a scheduler seeing the flag also sees
        // the counter
        segment.common().increment_client_interfaces_to_clean_up();
        if !interface.owner_slot().mark_for_clean_up() {
            segment.common().decrement_client_interfaces_to_clean_up();
            continue;
        }
        info!(segment = segment.name(), client = client_number, owner = %dead, "client slot marked for clean-up");

        if let Ok(map) = segment.resource_map(client_number) {
            for channel in map.owned_channels() {
                if let Ok(ch) = segment.channel(channel) {
                    ch.mark_for_release();
                }
                let scheduler = segment.scheduler_of(channel);
                let notified = segment
                    .scheduler_interface(scheduler)
                    .map(|s| s.is_active() && s.notify_for_clean_up(notify_timeout))
                    .unwrap_or(false);
                info!(segment = segment.name(), channel, scheduler, notified, "channel marked for release");
            }
        }
        pending.push(PendingCleanUp {
            segment: Arc::clone(segment),
            client_number,
            owner: dead,
            attempts: 0,
        });
    }
    pending
}

/// One retry of a pending clean-up. Schedulers that run release their
/// channels themselves; channels of schedulers that are not attached are
/// torn down here, and the slot is reclaimed once it holds no channel.
pub(crate) fn advance(pending: &mut PendingCleanUp, notify_timeout: Duration, max_attempts: u32) -> Progress {
    match try_advance(pending, notify_timeout) {
        Ok(true) => return Progress::Done,
        Ok(false) => {}
        Err(e) => warn!(
            segment = pending.segment.name(),
            client = pending.client_number,
            error = %e,
            "clean-up step failed"
        ),
    }
    pending.attempts += 1;
    if pending.attempts >= max_attempts {
        Progress::GaveUp
    } else {
        Progress::Pending
    }
}

fn try_advance(pending: &PendingCleanUp, notify_timeout: Duration) -> Result<bool> {
    let segment = &pending.segment;
    let interface = segment.client_interface(pending.client_number)?;
    let current = interface.owner();
    if current.is_none() || !current.same_owner(pending.owner) {
        // A scheduler finished it
        return Ok(true);
    }

    let map = segment.resource_map(pending.client_number)?;
    let channels: Vec<u32> = map.owned_channels().collect();
    for channel in channels {
        let ch = segment.channel(channel)?;
        let scheduler = segment.scheduler_interface(segment.scheduler_of(channel))?;
        if scheduler.is_active() {
            if !scheduler.notify_for_clean_up(notify_timeout) {
                debug!(segment = segment.name(), channel, "scheduler has not picked up clean-up yet");
            }
        } else if ch.is_tranquil() {
            ch.mark_for_release();
            tear_down_channel(segment, OwnerId::ANONYMOUS, channel)?;
        }
    }

    if map.count_owned_channels() > 0 || interface.allocated_channels() > 0 {
        return Ok(false);
    }
    reclaim_client_slot(segment, OwnerId::ANONYMOUS, pending.client_number)?;
    Ok(true)
}

/// The database serving `segment` died: tell its clients
pub(crate) fn database_terminated(segment: &Segment, dead: OwnerId) {
    segment.common().set_database_state(DatabaseState::TerminatedUnexpectedly);
    let mut woken = 0;
    for n in 0..segment.config().clients as u32 {
        if let Ok(interface) = segment.client_interface(n) {
            if !interface.owner().is_none() {
                interface.notifier().force_notify();
                woken += 1;
            }
        }
    }
    segment.force_unlock_owned_by(dead);
    warn!(segment = segment.name(), owner = %dead, clients = woken, "database terminated unexpectedly");
}
