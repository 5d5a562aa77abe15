//! Best-effort real-time scheduling for the control stage.

use thread_priority::{
    set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
    ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy,
};

/// Request SCHED_FIFO at `prio` (1..=99) for the current thread.
///
/// Needs CAP_SYS_NICE or root; failure is logged at warn level and the
/// stage keeps running at normal priority. `prio <= 0` disables.
pub fn try_set_fifo_priority(prio: i16) -> bool {
    if prio <= 0 {
        return false;
    }

    let value = match ThreadPriorityValue::try_from(prio.min(99) as u8) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Invalid FIFO priority {}: {:?}", prio, e);
            return false;
        }
    };

    match set_thread_priority_and_policy(
        thread_native_id(),
        ThreadPriority::Crossplatform(value),
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        Ok(()) => {
            log::info!("SCHED_FIFO priority {} applied", prio);
            true
        }
        Err(e) => {
            log::warn!(
                "Failed to set SCHED_FIFO priority {} (need CAP_SYS_NICE or root): {:?}",
                prio,
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_priority_is_a_no_op() {
        assert!(!try_set_fifo_priority(0));
        assert!(!try_set_fifo_priority(-3));
    }
}
