#[cfg(test)]
mod tests {
    use crossbeam::channel;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };
    use taskpool::{
        errors::{RejectReason, SpawnError},
        model::TaskState,
        pool::Config,
        scheduler::SchedulerInner,
        task::TaskContext,
    };

    /// Polls `cond` until it holds or `timeout` elapses.
    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_schedule_runs_once_after_delay() {
        println!("\n=== TEST: delayed task ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let runs = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(300);

        let started = Instant::now();
        let handle = {
            let runs = runs.clone();
            scheduler
                .schedule(
                    move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Instant::now()
                    },
                    delay,
                )
                .expect("schedule")
        };

        assert!(handle.trigger_at() >= started + delay);
        let remaining = handle.remaining_delay();
        assert!(remaining <= delay, "remaining {:?} exceeds delay", remaining);
        assert!(remaining > Duration::ZERO);
        assert!(!handle.is_done());

        let fired_at = handle.get().expect("fired");
        assert!(fired_at.duration_since(started) >= delay, "fired early");
        assert_eq!(handle.remaining_delay(), Duration::ZERO);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 1, "ran exactly once");
    }

    #[test]
    fn test_earlier_task_overtakes_later_one() {
        println!("\n=== TEST: delay ordering ===");
        let scheduler = SchedulerInner::new(2).expect("scheduler");
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |label: &'static str| {
            let order = order.clone();
            move || order.lock().unwrap().push(label)
        };

        let late = scheduler
            .schedule(record("late"), Duration::from_millis(400))
            .expect("schedule");
        let early = scheduler
            .schedule(record("early"), Duration::from_millis(50))
            .expect("schedule");

        early.wait();
        late.wait();
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
        scheduler.shutdown();
    }

    #[test]
    fn test_fixed_rate_firings_follow_trigger_times() {
        println!("\n=== TEST: fixed-rate series ===");
        let scheduler = SchedulerInner::new(2).expect("scheduler");
        let firings = Arc::new(Mutex::new(Vec::new()));
        let initial = Duration::from_millis(50);
        let period = Duration::from_millis(40);

        let started = Instant::now();
        let handle = {
            let firings = firings.clone();
            scheduler
                .schedule_at_fixed_rate(
                    move |_: &TaskContext| {
                        firings.lock().unwrap().push(Instant::now());
                        Ok::<_, SpawnError>(())
                    },
                    initial,
                    period,
                )
                .expect("schedule")
        };

        let first_trigger = handle.trigger_at();
        assert!(wait_until(Duration::from_secs(5), || handle.firings() >= 5));
        assert!(handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);

        // Let a firing that was in progress at cancel time return.
        thread::sleep(Duration::from_millis(100));
        let fired = handle.firings() as u32;
        let last_trigger = handle.trigger_at();
        assert!(
            last_trigger == first_trigger + period * fired
                || last_trigger == first_trigger + period * (fired - 1),
            "trigger drifted from the fixed-rate grid after {} firings",
            fired
        );

        let firings = firings.lock().unwrap().clone();
        for (i, fired_at) in firings.iter().enumerate() {
            let earliest = initial + period * i as u32;
            assert!(
                fired_at.duration_since(started) >= earliest,
                "firing {} came before its trigger",
                i
            );
        }
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_fixed_rate_never_overlaps() {
        println!("\n=== TEST: overrunning fixed-rate series ===");
        let scheduler = SchedulerInner::new(4).expect("scheduler");
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let work_time = Duration::from_millis(60);

        let handle = {
            let running = running.clone();
            let max_running = max_running.clone();
            let starts = starts.clone();
            scheduler
                .schedule_at_fixed_rate(
                    move |_: &TaskContext| {
                        starts.lock().unwrap().push(Instant::now());
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_running.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(work_time);
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, SpawnError>(())
                    },
                    Duration::ZERO,
                    Duration::from_millis(10),
                )
                .expect("schedule")
        };

        assert!(wait_until(Duration::from_secs(5), || handle.firings() >= 4));
        handle.cancel();

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        let starts = starts.lock().unwrap().clone();
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= work_time);
        }
        scheduler.shutdown();
    }

    #[test]
    fn test_failing_firing_stops_series() {
        println!("\n=== TEST: failing periodic task ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = {
            let calls = calls.clone();
            scheduler
                .schedule_at_fixed_rate(
                    move |_: &TaskContext| {
                        if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                            return Err(SpawnError::Execution("third firing failed".into()));
                        }
                        Ok(())
                    },
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                )
                .expect("schedule")
        };

        assert_eq!(handle.wait(), TaskState::Failed);
        assert_eq!(
            handle.get(),
            Err(SpawnError::Execution("third firing failed".into()))
        );
        assert_eq!(handle.firings(), 2);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "series is not re-armed");

        let other = scheduler.submit(|| "pool still serves").expect("submit");
        assert_eq!(other.get(), Ok("pool still serves"));
        scheduler.shutdown();
    }

    #[test]
    fn test_fixed_delay_waits_after_completion() {
        println!("\n=== TEST: fixed-delay series ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let starts = Arc::new(Mutex::new(Vec::new()));
        let work_time = Duration::from_millis(30);
        let delay = Duration::from_millis(40);

        let handle = {
            let starts = starts.clone();
            scheduler
                .schedule_with_fixed_delay(
                    move |_: &TaskContext| {
                        starts.lock().unwrap().push(Instant::now());
                        thread::sleep(work_time);
                        Ok::<_, SpawnError>(())
                    },
                    Duration::ZERO,
                    delay,
                )
                .expect("schedule")
        };

        assert!(wait_until(Duration::from_secs(5), || handle.firings() >= 3));
        handle.cancel();

        let starts = starts.lock().unwrap().clone();
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= work_time + delay);
        }
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_keeps_delayed_and_cancels_periodic() {
        println!("\n=== TEST: scheduler shutdown policy ===");
        let scheduler = SchedulerInner::new(2).expect("scheduler");

        let one_shot = scheduler
            .schedule(|| "still fired", Duration::from_millis(150))
            .expect("schedule");
        let periodic = scheduler
            .schedule_at_fixed_rate(
                |_: &TaskContext| Ok::<_, SpawnError>(()),
                Duration::from_millis(20),
                Duration::from_millis(20),
            )
            .expect("schedule");

        scheduler.shutdown();
        assert_eq!(
            scheduler.schedule(|| (), Duration::ZERO).err(),
            Some(SpawnError::Rejected(RejectReason::Shutdown))
        );

        assert!(periodic.wait_timeout(Duration::from_secs(5)));
        assert!(periodic.is_cancelled());
        assert_eq!(one_shot.get(), Ok("still fired"));
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert!(scheduler.is_terminated());
    }

    #[test]
    fn test_shutdown_now_abandons_delayed() {
        println!("\n=== TEST: scheduler forced shutdown ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");

        let first = scheduler
            .schedule(|| 1, Duration::from_secs(10))
            .expect("schedule");
        let second = scheduler
            .schedule(|| 2, Duration::from_secs(20))
            .expect("schedule");
        let periodic = scheduler
            .schedule_at_fixed_rate(
                |_: &TaskContext| Ok::<_, SpawnError>(()),
                Duration::from_secs(30),
                Duration::from_secs(1),
            )
            .expect("schedule");

        let abandoned = scheduler.shutdown_now();

        let ids: Vec<_> = abandoned.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![first.id(), second.id(), periodic.id()]);
        assert_eq!(first.get(), Err(SpawnError::Cancelled));
        assert_eq!(second.get(), Err(SpawnError::Cancelled));
        assert!(periodic.is_cancelled());
        assert_eq!(first.remaining_delay(), Duration::ZERO);
        assert!(scheduler.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_cancel_delayed_task() {
        println!("\n=== TEST: cancelling a delayed task ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = {
            let ran = ran.clone();
            scheduler
                .schedule(
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    },
                    Duration::from_millis(50),
                )
                .expect("schedule")
        };

        assert!(handle.cancel());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(handle.handle().state(), TaskState::Cancelled);
        assert_eq!(handle.into_handle().join(), Err(SpawnError::Cancelled));
        scheduler.shutdown();
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let scheduler = SchedulerInner::new(1).expect("scheduler");

        let result = scheduler.schedule_at_fixed_rate(
            |_: &TaskContext| Ok::<_, SpawnError>(()),
            Duration::ZERO,
            Duration::ZERO,
        );

        assert!(matches!(result, Err(SpawnError::InvalidSchedule(_))));
        scheduler.shutdown();
    }

    #[test]
    fn test_period_out_of_range_is_rejected() {
        println!("\n=== TEST: period past the clock's range ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let huge = Duration::from_secs(u64::MAX);

        let rate = scheduler.schedule_at_fixed_rate(
            |_: &TaskContext| Ok::<_, SpawnError>(()),
            Duration::ZERO,
            huge,
        );
        let delay = scheduler.schedule_with_fixed_delay(
            |_: &TaskContext| Ok::<_, SpawnError>(()),
            Duration::ZERO,
            huge,
        );

        assert!(matches!(rate, Err(SpawnError::InvalidSchedule(_))));
        assert!(matches!(delay, Err(SpawnError::InvalidSchedule(_))));
        assert_eq!(scheduler.pending_delayed(), 0);

        let follow_up = scheduler.submit(|| "served").expect("submit");
        assert_eq!(follow_up.get_timeout(Duration::from_secs(1)), Ok("served"));
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_long_period_series_rearms_and_shuts_down() {
        println!("\n=== TEST: series with a century-long period ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let century = Duration::from_secs(100 * 365 * 24 * 60 * 60);

        let handle = scheduler
            .schedule_at_fixed_rate(
                |_: &TaskContext| Ok::<_, SpawnError>(()),
                Duration::ZERO,
                century,
            )
            .expect("schedule");

        assert!(wait_until(Duration::from_secs(5), || {
            handle.firings() == 1 && handle.remaining_delay() > century / 2
        }));
        assert_eq!(handle.state(), TaskState::Running);
        assert_eq!(scheduler.pending_delayed(), 1);

        let follow_up = scheduler.submit(|| 1).expect("submit");
        assert_eq!(follow_up.get_timeout(Duration::from_secs(1)), Ok(1));

        scheduler.shutdown();
        assert!(handle.is_cancelled());
        assert!(scheduler.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_cancels_queued_periodic_firing() {
        println!("\n=== TEST: shutdown with a firing waiting for a worker ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let blocker = scheduler
            .submit(move || {
                let _ = release_rx.recv();
            })
            .expect("submit");
        let periodic = {
            let calls = calls.clone();
            scheduler
                .schedule_at_fixed_rate(
                    move |_: &TaskContext| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, SpawnError>(())
                    },
                    Duration::ZERO,
                    Duration::from_millis(10),
                )
                .expect("schedule")
        };

        // The firing has left the delay queue and sits behind the blocker.
        assert!(wait_until(Duration::from_secs(5), || {
            scheduler.pending_delayed() == 0 && scheduler.metrics().queued_tasks == 1
        }));
        scheduler.shutdown();
        release_tx.send(()).expect("release");

        assert_eq!(blocker.wait(), TaskState::Completed);
        assert_eq!(periodic.wait(), TaskState::Cancelled);
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no firing after shutdown");
        assert_eq!(scheduler.metrics().cancelled_tasks, 1);
    }

    #[test]
    fn test_shutdown_now_returns_every_unstarted_delayed_task() {
        println!("\n=== TEST: forced shutdown while the timer dispatches ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");
        let (started_tx, started_rx) = channel::bounded::<()>(1);

        let blocker = scheduler
            .submit_callable(move |ctx: &TaskContext| {
                let _ = started_tx.send(());
                ctx.sleep(Duration::from_secs(30))?;
                Ok::<_, SpawnError>(())
            })
            .expect("submit");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker busy");

        let handles: Vec<_> = (0..200u64)
            .map(|i| {
                scheduler
                    .schedule(move || i, Duration::from_micros(i * 50))
                    .expect("schedule")
            })
            .collect();
        thread::sleep(Duration::from_millis(2));

        let abandoned = scheduler.shutdown_now();

        let mut abandoned_ids: Vec<_> = abandoned.iter().map(|e| e.id()).collect();
        abandoned_ids.sort_unstable();
        let mut handle_ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
        handle_ids.sort_unstable();
        assert_eq!(abandoned_ids, handle_ids);
        assert!(handles.iter().all(|h| h.is_cancelled()));
        assert_eq!(blocker.get(), Err(SpawnError::Interrupted));
        assert!(scheduler.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_interrupted_periodic_firing() {
        println!("\n=== TEST: forced shutdown during a firing ===");
        let scheduler = SchedulerInner::with_config(Config::fixed(1)).expect("scheduler");
        let handle = scheduler
            .schedule_at_fixed_rate(
                |ctx: &TaskContext| {
                    ctx.sleep(Duration::from_secs(30))?;
                    Ok::<_, SpawnError>(())
                },
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .expect("schedule");

        assert!(wait_until(Duration::from_secs(5), || {
            handle.state() == TaskState::Running
        }));
        scheduler.shutdown_now();

        assert_eq!(handle.wait(), TaskState::Failed);
        assert_eq!(handle.get(), Err(SpawnError::Interrupted));
        assert!(scheduler.await_termination(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_await_scheduled_handle() {
        println!("\n=== TEST: awaiting a delayed task ===");
        let scheduler = SchedulerInner::new(1).expect("scheduler");

        let value = scheduler
            .schedule(|| "later", Duration::from_millis(30))
            .expect("schedule")
            .await;

        assert_eq!(value, Ok("later"));
        scheduler.shutdown();
    }
}
