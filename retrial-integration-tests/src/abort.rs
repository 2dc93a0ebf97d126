use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use retrial::{eyre, eyre::WrapErr, Aborted, Runner, SkipRetry};

static ABORT_ATTEMPT: AtomicUsize = AtomicUsize::new(0);

/// Aborting is reported as skipped and never retried.
async fn aborts_without_retry() -> eyre::Result<()> {
    let attempt = ABORT_ATTEMPT.fetch_add(1, Ordering::SeqCst);
    if attempt > 0 {
        eyre::bail!("an aborted test was retried");
    }
    if std::env::var("RETRIAL_PAYMENT_SANDBOX").is_err() {
        return Err(Aborted::new("payment sandbox is not configured").into());
    }
    Ok(())
}

async fn reads_fixture() -> eyre::Result<()> {
    std::fs::read_to_string("fixtures/does-not-exist.json")
        .wrap_err(SkipRetry::new("fixture is missing"))?;
    Ok(())
}

pub fn register(runner: &mut Runner) {
    runner.add_test(
        "aborts_without_retry",
        "abort",
        Arc::new(|| Box::pin(aborts_without_retry())),
    );
    // A SkipRetry failure is final, so this one only runs with fail-test.
    if cfg!(feature = "fail-test") {
        runner.add_test("skip_retry", "abort", Arc::new(|| Box::pin(reads_fixture())));
    }
}
