// src/main.rs

use expctl::types::FailureLevel;
use expctl::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(FailureLevel::Ok) => {}
        Ok(level) => {
            eprintln!("expctl: experiment finished with {level:?}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("expctl error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<FailureLevel> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
