use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use retrial::{eyre, json, Arguments, NameFormatter, Runner};

static FLAKY_STATUS_ATTEMPT: AtomicUsize = AtomicUsize::new(0);

async fn status_code(args: Arguments) -> eyre::Result<()> {
    let status: u16 = args.get(0)?;
    let retryable: bool = args.get(1)?;

    // Only the 503 element fails, and only once. Its siblings run once.
    if retryable && FLAKY_STATUS_ATTEMPT.fetch_add(1, Ordering::SeqCst) == 0 {
        eyre::bail!("upstream answered {status}");
    }
    Ok(())
}

async fn login(args: Arguments) -> eyre::Result<()> {
    let user: String = args.get(0)?;
    let password: String = args.get(1)?;
    eyre::ensure!(!user.is_empty() && !password.is_empty(), "empty credentials");
    Ok(())
}

pub fn register(runner: &mut Runner) -> eyre::Result<()> {
    runner.add_parameterized_test(
        "status_code",
        "parameterized",
        vec![
            Arguments::new(vec![json!(200), json!(false)]),
            Arguments::new(vec![json!(503), json!(true)]),
            Arguments::new(vec![json!(404), json!(false)]),
        ],
        Arc::new(|args| Box::pin(status_code(args))),
    )?;

    let formatter = NameFormatter::new("{displayName} as {0} ({index})", "login")?
        .with_parameter_names(["user", "password"]);
    runner.add_parameterized_test_with(
        "login",
        "parameterized",
        formatter,
        vec![
            Arguments::new(vec![json!("alice"), json!("secret")]),
            Arguments::new(vec![json!("bob"), json!("hunter2")]),
        ],
        Arc::new(|args| Box::pin(login(args))),
    )?;

    Ok(())
}
