//! Maintenance task: periodic hourly inventory reloads and the
//! campaign-timing-triggered channel cleanups in between. Ported from
//! `original_source/src/services/maintenance.py`'s `MaintenanceService`.
//!
//! Restarted fresh at the end of every `INVENTORY_FETCH` (see
//! `Scheduler::restart_maintenance`), against whatever trigger deque that
//! fetch just rebuilt.

use std::sync::Arc;

use chrono::Utc;

use crate::constants::MAINTENANCE_PERIOD;
use crate::scheduler::{Scheduler, State};

/// Drain the trigger deque until the hourly reload boundary, requesting a
/// `CHANNELS_CLEANUP` on every campaign-timing trigger along the way, then
/// request an `INVENTORY_FETCH` once the period elapses and exit. The next
/// inventory fetch spawns a fresh instance of this task.
pub async fn run(scheduler: Arc<Scheduler>) {
    let next_period = Utc::now()
        + chrono::Duration::from_std(MAINTENANCE_PERIOD).expect("maintenance period fits in a chrono::Duration");

    loop {
        if Utc::now() >= next_period {
            break;
        }

        let next_trigger = {
            let mut triggers = scheduler.mnt_triggers().lock().await;
            let mut next = next_period;
            while triggers.front().is_some_and(|front| *front <= next) {
                next = triggers.pop_front().expect("front just checked Some");
            }
            next
        };
        let is_reload = next_trigger == next_period;

        let wait = (next_trigger - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        tracing::debug!(
            "maintenance task waiting until {} ({})",
            next_trigger,
            if is_reload { "reload" } else { "cleanup" }
        );
        tokio::time::sleep(wait).await;

        if Utc::now() >= next_period {
            break;
        }
        if !is_reload {
            tracing::debug!("maintenance task requests channels cleanup");
            scheduler.change_state(State::ChannelsCleanup).await;
        }
    }

    tracing::debug!("maintenance task requests a reload");
    scheduler.change_state(State::InventoryFetch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn draining_stops_at_the_first_trigger_past_the_cutoff() {
        let now = Utc::now();
        let mut triggers: VecDeque<chrono::DateTime<Utc>> = VecDeque::new();
        triggers.push_back(now + chrono::Duration::seconds(5));
        triggers.push_back(now + chrono::Duration::seconds(10));
        triggers.push_back(now + chrono::Duration::seconds(20));

        let cutoff = now + chrono::Duration::seconds(15);
        let mut next = cutoff;
        while triggers.front().is_some_and(|front| *front <= next) {
            next = triggers.pop_front().unwrap();
        }

        // Only the earliest trigger (5s) is popped: once `next` shrinks to
        // its timestamp, the next trigger (10s) no longer satisfies `<= next`
        // and is left queued alongside the one after it (20s).
        assert_eq!(triggers.len(), 2);
        assert_eq!(next, now + chrono::Duration::seconds(5));
    }
}
