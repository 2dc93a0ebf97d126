use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use retrial::{eyre, Runner};

/// Counters to track retry attempts across test invocations.
/// These persist across retry attempts within the same process.
static RETRY_ATTEMPT: AtomicUsize = AtomicUsize::new(0);
static TWICE_ATTEMPT: AtomicUsize = AtomicUsize::new(0);
static PASSING_ATTEMPT: AtomicUsize = AtomicUsize::new(0);

/// Fails on the first attempt and succeeds on retry.
async fn succeeds_after_retry() -> eyre::Result<()> {
    let attempt = RETRY_ATTEMPT.fetch_add(1, Ordering::SeqCst);

    if attempt == 0 {
        eyre::bail!("Intentional failure on first attempt");
    }

    Ok(())
}

/// Fails twice, so it needs a budget of 2 retries.
async fn succeeds_on_third_attempt() -> eyre::Result<()> {
    let attempt = TWICE_ATTEMPT.fetch_add(1, Ordering::SeqCst);
    if attempt < 2 {
        eyre::bail!("Intentional failure on attempt {attempt}");
    }
    Ok(())
}

/// Passing tests are never retried.
async fn passes_once() -> eyre::Result<()> {
    let attempt = PASSING_ATTEMPT.fetch_add(1, Ordering::SeqCst);
    eyre::ensure!(attempt == 0, "a passing test was run {} times", attempt + 1);
    Ok(())
}

pub fn register(runner: &mut Runner) {
    runner.add_test(
        "succeeds_after_retry",
        "retry",
        Arc::new(|| Box::pin(succeeds_after_retry())),
    );
    runner.add_test(
        "succeeds_on_third_attempt",
        "retry",
        Arc::new(|| Box::pin(succeeds_on_third_attempt())),
    );
    runner.add_test("passes_once", "retry", Arc::new(|| Box::pin(passes_once())));
}
