use app_store_analytics::CliError;

fn is_json_mode_args() -> bool {
    std::env::args().any(|arg| arg == "--json")
}

fn report(err: &CliError) -> ! {
    if err.code == 0 {
        std::process::exit(0);
    }
    if is_json_mode_args() {
        let payload = serde_json::json!({
            "error": {
                "code": err.code,
                "kind": err.kind,
                "message": err.message,
                "hint": err.hint,
                "retryable": err.retryable,
            }
        });
        eprintln!("{payload}");
    } else {
        eprintln!("Error: {}", err.message);
        if let Some(hint) = &err.hint {
            eprintln!("Hint: {hint}");
        }
    }
    std::process::exit(err.code);
}

fn main() -> anyhow::Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let raw_args: Vec<String> = std::env::args().collect();
    let parsed = match app_store_analytics::parse_cli(raw_args) {
        Ok(parsed) => parsed,
        Err(err) => report(&err),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match runtime.block_on(app_store_analytics::run_with_parsed(parsed)) {
        Ok(()) => Ok(()),
        Err(err) => report(&err),
    }
}
