//! Timer-driven periodic activities with per-tick isolation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::error;

use sweb_common::error::{SwebError, SwebResult};

/// Spawns a named thread running `tick` every `period` until `stop` is set.
///
/// A panicking tick is caught and logged; the schedule itself keeps running. Ticks must be
/// short and bounded; the period is the pause between tick completions.
///
/// # Errors
///
/// Returns `SwebError::Io` when the thread cannot be spawned.
pub(crate) fn spawn_periodic(
    name: &'static str,
    period: Duration,
    stop: Arc<AtomicBool>,
    mut tick: impl FnMut() + Send + 'static,
) -> SwebResult<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| tick())) {
                    error!(
                        activity = name,
                        "periodic tick panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
                thread::sleep(period);
            }
        })
        .map_err(|spawn_error| SwebError::Io(format!("spawn {name} thread failed: {spawn_error}")))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::spawn_periodic;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    fn schedule_survives_panicking_ticks() {
        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicUsize::new(0));
        let tick_counter = Arc::clone(&ticks);

        let schedule = spawn_periodic(
            "test-panicky-tick",
            Duration::from_millis(1),
            Arc::clone(&stop),
            move || {
                let _ = tick_counter.fetch_add(1, Ordering::AcqRel);
                panic!("tick failure");
            },
        )
        .expect("schedule should spawn");

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && ticks.load(Ordering::Acquire) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }

        stop.store(true, Ordering::Release);
        schedule.join().expect("schedule thread should stop");
        assert_that!(ticks.load(Ordering::Acquire) >= 3, eq(true));
    }

    #[rstest]
    fn schedule_stops_once_the_flag_is_set() {
        let stop = Arc::new(AtomicBool::new(false));
        let schedule = spawn_periodic(
            "test-quiet-tick",
            Duration::from_millis(1),
            Arc::clone(&stop),
            || {},
        )
        .expect("schedule should spawn");

        stop.store(true, Ordering::Release);

        schedule.join().expect("schedule thread should stop");
    }
}
