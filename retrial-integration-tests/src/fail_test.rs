use std::sync::Arc;

use retrial::{eyre, pretty_assertions::assert_eq, Runner};

async fn always_fails() -> eyre::Result<()> {
    let total: u32 = [1, 2, 3].iter().sum();
    eyre::ensure!(
        total == 7,
        "Intentional failure for retry and error state previews (enable with --features fail-test): {total}"
    );
    Ok(())
}

async fn always_panics() -> eyre::Result<()> {
    assert_eq!(1 + 1, 3, "Intentional panic, retried like any failure");
    Ok(())
}

pub fn register(runner: &mut Runner) {
    runner.add_test("always_fails", "fail_test", Arc::new(|| Box::pin(always_fails())));
    runner.add_test("always_panics", "fail_test", Arc::new(|| Box::pin(always_panics())));
}
