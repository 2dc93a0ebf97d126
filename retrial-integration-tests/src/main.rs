mod abort;
#[cfg(feature = "fail-test")]
mod fail_test;
mod parameterized;
mod retry;

use retrial::{eyre, Runner};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let mut runner = Runner::new();
    // Flaky tests below need up to 2 retries. Config or CLI may raise it.
    if runner.max_retries() < 2 {
        runner.set_max_retries(2);
    }

    retry::register(&mut runner);
    parameterized::register(&mut runner)?;
    abort::register(&mut runner);
    #[cfg(feature = "fail-test")]
    fail_test::register(&mut runner);

    let app = retrial::App::new();
    app.run(runner).await?;
    Ok(())
}
