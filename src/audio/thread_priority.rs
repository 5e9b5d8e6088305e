// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Default priority for the output thread when BEATPAD_THREAD_PRIORITY is unset.
const DEFAULT_OUTPUT_THREAD_PRIORITY: u8 = 70;

/// Default priority for the transport scheduler thread.
const DEFAULT_SCHEDULER_THREAD_PRIORITY: u8 = 60;

fn priority_from_env(var: &str, default: u8) -> Option<ThreadPriorityValue> {
    let value = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|n| *n < 100)
        .unwrap_or(default);
    ThreadPriorityValue::try_from(value).ok()
}

/// Reads BEATPAD_THREAD_PRIORITY (0-99) once, before the output callback is built.
pub fn output_thread_priority() -> Option<ThreadPriorityValue> {
    priority_from_env("BEATPAD_THREAD_PRIORITY", DEFAULT_OUTPUT_THREAD_PRIORITY)
}

/// Reads BEATPAD_SCHEDULER_PRIORITY (0-99).
pub fn scheduler_thread_priority() -> Option<ThreadPriorityValue> {
    priority_from_env(
        "BEATPAD_SCHEDULER_PRIORITY",
        DEFAULT_SCHEDULER_THREAD_PRIORITY,
    )
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Returns whether we should attempt RT (SCHED_FIFO) scheduling for the output thread.
/// Default: enabled. Opt out with BEATPAD_DISABLE_RT_AUDIO=1.
pub fn rt_audio_enabled() -> bool {
    !env_flag("BEATPAD_DISABLE_RT_AUDIO")
}

/// Raises the priority of the calling thread once. `priority_set` guards repeated calls from a
/// callback that runs on the same thread every block.
pub fn configure_thread_priority(
    thread_name: &str,
    priority: Option<ThreadPriorityValue>,
    rt_audio: bool,
    priority_set: &mut bool,
) {
    if *priority_set {
        return;
    }
    *priority_set = true;

    let Some(priority) = priority else {
        return;
    };
    let tp = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(tp) {
        warn!(thread = thread_name, error = ?e, "Failed to raise thread priority");
    }

    #[cfg(unix)]
    if rt_audio {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        match set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => {
                info!(thread = thread_name, "Enabled RT SCHED_FIFO");
            }
            Err(e) => {
                warn!(
                    thread = thread_name,
                    error = %e,
                    "Failed to set RT SCHED_FIFO"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = rt_audio;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_configure_only_once() {
        let mut priority_set = false;
        configure_thread_priority("test", None, false, &mut priority_set);
        assert!(priority_set);
        // A second call is a no-op.
        configure_thread_priority("test", scheduler_thread_priority(), false, &mut priority_set);
        assert!(priority_set);
    }

    #[test]
    fn test_default_priorities_are_valid() {
        assert!(ThreadPriorityValue::try_from(DEFAULT_OUTPUT_THREAD_PRIORITY).is_ok());
        assert!(ThreadPriorityValue::try_from(DEFAULT_SCHEDULER_THREAD_PRIORITY).is_ok());
    }
}
