#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };
    use taskpool::{
        errors::SpawnError,
        handle::join_handles,
        model::JoinOrdering,
        pool::{Config, ThreadPoolInner},
        scheduler::SchedulerInner,
        task::TaskContext,
    };

    fn measure<F, T>(name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        result
    }

    #[test]
    fn load_test_1_small_fast_tasks() {
        println!("\n=== LOAD TEST 1: 10k fast tasks (100μs each) ===");
        let pool = ThreadPoolInner::with_config(Config::io_bound()).expect("pool");

        let results: Vec<_> = measure("10k tasks @ 100μs", || {
            let handles: Vec<_> = (0..10_000u64)
                .map(|x| {
                    pool.submit(move || {
                        thread::sleep(Duration::from_micros(100));
                        x * 2
                    })
                    .expect("submit")
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        assert_eq!(results.len(), 10_000);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(results[21], Ok(42));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(10)));
        let metrics = pool.metrics();
        println!("  Completed: {}/{}", metrics.completed_tasks, results.len());
        println!("  Success rate: {:.1}%", metrics.success_rate() * 100.0);
        assert_eq!(metrics.completed_tasks, 10_000);
    }

    #[test]
    fn load_test_2_work_stealing_uneven_load() {
        println!("\n=== LOAD TEST 2: 10k uneven tasks, work stealing ===");
        let pool = ThreadPoolInner::with_config(Config::work_stealing()).expect("pool");

        let results = measure("10k tasks, every 10th slow", || {
            let tasks = (0..10_000u64).map(|x| {
                move |_: &TaskContext| {
                    if x % 10 == 0 {
                        thread::sleep(Duration::from_micros(500));
                    }
                    Ok::<_, SpawnError>(x)
                }
            });
            pool.invoke_all(tasks).expect("invoke_all")
        });

        assert_eq!(results.len(), 10_000);
        for (i, handle) in results.iter().enumerate() {
            assert_eq!(handle.get(), Ok(i as u64));
        }
        println!("  Queue pressure after join: {:.0}", pool.metrics().queue_pressure());
        pool.shutdown();
    }

    #[test]
    fn load_test_3_heavy_blocking() {
        println!("\n=== LOAD TEST 3: 1k blocking tasks ===");
        let pool = ThreadPoolInner::with_config(Config::cpu_bound()).expect("pool");

        let handles: Vec<_> = measure("1k blocking submits", || {
            (0..1_000u64)
                .map(|i| {
                    pool.submit(move || {
                        thread::sleep(Duration::from_millis(2));
                        i * i
                    })
                    .expect("submit")
                })
                .collect()
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let results = measure("join 1k handles", || {
            rt.block_on(join_handles(handles, JoinOrdering::UnOrdered))
        });
        let successful = results.iter().filter(|r| r.is_ok()).count();
        println!("  Successful: {}/{}", successful, results.len());
        assert_eq!(successful, 1_000);
        pool.shutdown();
    }

    #[test]
    fn load_test_4_stress_with_panics() {
        println!("\n=== LOAD TEST 4: stress with panics ===");

        // Silence panic output for this test
        std::panic::set_hook(Box::new(|_| {}));

        let pool = ThreadPoolInner::new(8, None).expect("pool");
        let results: Vec<_> = measure("1k tasks (10% panic)", || {
            let handles: Vec<_> = (0..1_000u64)
                .map(|x| {
                    pool.submit(move || {
                        if x % 10 == 0 {
                            panic!("Intentional panic at {}", x);
                        }
                        x
                    })
                    .expect("submit")
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let successful = results.iter().filter(|r| r.is_ok()).count();
        let panicked = results
            .iter()
            .filter(|r| matches!(r, Err(SpawnError::Panic(_))))
            .count();

        println!("  Successful: {}", successful);
        println!("  Panics captured: {}", panicked);

        assert_eq!(pool.submit(|| 7).expect("submit").get(), Ok(7));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(10)));
        let metrics = pool.metrics();
        println!("  Pool success rate: {:.1}%", metrics.success_rate() * 100.0);

        let _ = std::panic::take_hook();

        assert_eq!(successful, 900);
        assert_eq!(panicked, 100);
        assert_eq!(metrics.failed_tasks, 100);
    }

    #[test]
    fn load_test_5_concurrent_submitters() {
        println!("\n=== LOAD TEST 5: 8 submitting threads x 2.5k tasks ===");
        let pool = ThreadPoolInner::with_config(Config::fixed(4)).expect("pool");
        let counter = Arc::new(AtomicUsize::new(0));

        measure("20k tasks from 8 threads", || {
            thread::scope(|s| {
                for _ in 0..8 {
                    let pool = &pool;
                    let counter = &counter;
                    s.spawn(move || {
                        let handles: Vec<_> = (0..2_500)
                            .map(|_| {
                                let counter = Arc::clone(counter);
                                pool.execute(move || {
                                    counter.fetch_add(1, Ordering::Relaxed);
                                })
                                .expect("execute")
                            })
                            .collect();
                        for handle in handles {
                            handle.wait();
                        }
                    });
                }
            });
        });

        assert_eq!(counter.load(Ordering::Relaxed), 20_000);
        let metrics = pool.metrics();
        println!("  Total spawned: {}", metrics.total_spawned);
        assert_eq!(metrics.total_spawned, 20_000);
        pool.shutdown();
    }

    #[test]
    fn load_test_6_many_delayed_tasks() {
        println!("\n=== LOAD TEST 6: 2k delayed tasks ===");
        let scheduler = SchedulerInner::with_config(Config::fixed(4)).expect("scheduler");

        let handles: Vec<_> = measure("schedule 2k", || {
            (0..2_000u64)
                .map(|i| {
                    let delay = Duration::from_millis(i % 100);
                    scheduler.schedule(move || i, delay).expect("schedule")
                })
                .collect()
        });

        let results: Vec<_> = measure("wait 2k", || {
            handles.into_iter().map(|h| h.join()).collect()
        });
        assert!(results.iter().enumerate().all(|(i, r)| *r == Ok(i as u64)));

        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(10)));
        assert_eq!(scheduler.pending_delayed(), 0);
    }
}
