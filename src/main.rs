use std::{error::Error, thread, time::Duration};
use taskpool::{Config, SchedulerInner, TaskContext, ThreadPoolInner};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

/// One fire-and-forget task on a single worker.
fn standard_exec() -> Result<(), Box<dyn Error>> {
    let pool = ThreadPoolInner::with_config(Config::single_thread())?;
    pool.execute(|| info!(thread = %thread_name(), "hello from the pool"))?;
    pool.shutdown();
    Ok(())
}

/// A value-returning task observed through its handle.
fn callable_example() -> Result<(), Box<dyn Error>> {
    let pool = ThreadPoolInner::with_config(Config::fixed(1))?;
    let future = pool.submit_callable(|ctx: &TaskContext| {
        info!(thread = %thread_name(), "computing");
        ctx.sleep(Duration::from_secs(1))?;
        Ok::<_, taskpool::SpawnError>(123)
    })?;

    info!(done = future.is_done(), "future done?");
    let result = future.get()?;
    info!(done = future.is_done(), result, "future done?");

    pool.shutdown();
    Ok(())
}

/// A bounded wait on a slow task.
fn timeout_exec() -> Result<(), Box<dyn Error>> {
    let pool = ThreadPoolInner::with_config(Config::fixed(1))?;
    let future = pool.submit_callable(|ctx: &TaskContext| {
        ctx.sleep(Duration::from_secs(2))?;
        Ok::<_, taskpool::SpawnError>(123)
    })?;

    match future.get_timeout(Duration::from_secs(1)) {
        Ok(result) => info!(result, "result within timeout"),
        Err(err) => info!(error = %err, "no result within timeout"),
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut future = future;
    let result = rt.block_on(future.await_timeout(Duration::from_secs(5)))?;
    info!(result, "result after waiting longer");

    pool.shutdown();
    Ok(())
}

/// Batch submission joined in input order.
fn invoke_all_example() -> Result<(), Box<dyn Error>> {
    let pool = ThreadPoolInner::with_config(Config::work_stealing())?;
    let tasks = ["task1", "task2", "task3"]
        .map(|name| move |_: &TaskContext| Ok::<_, taskpool::SpawnError>(name));

    for future in pool.invoke_all(tasks)? {
        let result = future.get()?;
        info!(thread = %thread_name(), result, "invoke_all");
    }

    pool.shutdown();
    Ok(())
}

/// A task that runs once after a delay.
fn scheduled_example() -> Result<(), Box<dyn Error>> {
    let scheduler = SchedulerInner::new(1)?;
    let task = || info!(thread = %thread_name(), "scheduling");

    let future = scheduler.schedule(task, Duration::from_secs(3))?;
    thread::sleep(Duration::from_millis(1337));
    info!(remaining = ?future.remaining_delay(), "remaining delay");

    scheduler.schedule(task, Duration::from_secs(3))?;
    scheduler.shutdown();
    scheduler.await_termination(Duration::from_secs(10));
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    standard_exec()?;
    callable_example()?;
    timeout_exec()?;
    invoke_all_example()?;
    scheduled_example()?;
    Ok(())
}
