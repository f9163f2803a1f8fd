use boardlink_orchestrator::{OrchestratorConfig, OrchestratorError, create_session, parse_pin};
use std::time::Duration;

fn usage() -> ! {
    eprintln!(
        "Usage: boardlink_blink <board_config.toml> [pin] [period_ms] [count]\n\
         \n\
         Examples:\n\
           cargo run -p boardlink_orchestrator --bin blink -- config/board_sim.toml 13 200 6\n\
         \n\
         Notes:\n\
         - count=0 means blink forever.\n\
         - Always forces the output LOW on exit (best effort)."
    );
    std::process::exit(2)
}

fn parse_u64(s: &str, name: &str) -> u64 {
    s.parse::<u64>().unwrap_or_else(|_| {
        eprintln!("Invalid {name}: {s}");
        usage()
    })
}

async fn run(
    config_path: &str,
    pin: u8,
    period_ms: u64,
    count: u64,
) -> Result<(), OrchestratorError> {
    let config = OrchestratorConfig::from_file(config_path)?;
    let session = create_session(&config)?;
    let ext = &session.extension;
    ext.scan().await?;

    let half = Duration::from_millis(period_ms.max(1) / 2);

    let mut iter: u64 = 0;
    loop {
        if count != 0 && iter >= count {
            break;
        }
        if !ext.is_ready() {
            eprintln!("board lost: {}", ext.status_message(Some(pin)).unwrap_or(""));
            break;
        }

        let on = iter % 2 == 0;
        ext.digital_write(Some(pin), on).await;
        tokio::time::sleep(half).await;
        iter += 1;
    }

    // Best-effort fail-safe.
    ext.digital_write(Some(pin), false).await;
    ext.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| usage());
    let pin = args.next().unwrap_or_else(|| "13".to_string());
    let pin = parse_pin(&pin).unwrap_or_else(|| {
        eprintln!("Invalid pin: {pin}");
        usage()
    });
    let period_ms = args
        .next()
        .map(|s| parse_u64(&s, "period_ms"))
        .unwrap_or(200);
    let count = args
        .next()
        .map(|s| parse_u64(&s, "count"))
        .unwrap_or(6);

    if let Err(e) = run(&config_path, pin, period_ms, count).await {
        eprintln!("blink failed: {e}");
        std::process::exit(1);
    }
}
