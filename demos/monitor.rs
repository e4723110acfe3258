use iohouse_climate::{Coordinator, CoordinatorEvent, MessageLogMode};
use std::env;

#[tokio::main]
async fn main() -> iohouse_climate::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let host = args
        .get(1)
        .expect("usage: monitor <host> [--key <api key>] [--log <file>]");
    let flag = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let mut builder = Coordinator::builder(host);
    if let Some(key) = flag("--key") {
        builder = builder.api_key(key);
    }
    if let Some(path) = flag("--log") {
        builder = builder.message_log(MessageLogMode::Diffed, path);
    }
    let coordinator = builder.build()?;

    let mut events = coordinator.subscribe();
    let poll = coordinator.spawn();
    println!("Polling {host}...");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoordinatorEvent::Updated) => {
                    for zone in coordinator.zones() {
                        let temp = zone.current_temperature();
                        let target = zone.target_temperature();
                        println!(
                            "[{}] {:>5} / {:>5} \u{00b0}C | {:?} | {:?} | {}{}",
                            zone.name(),
                            temp.map_or("-".to_string(), |t| format!("{t:.1}")),
                            target.map_or("-".to_string(), |t| format!("{t:.1}")),
                            zone.hvac_mode(),
                            zone.hvac_action(),
                            zone.preset(),
                            if coordinator.zone_available(&zone.id) { "" } else { " | stale" },
                        );
                    }
                }
                Ok(CoordinatorEvent::ZonesChanged(zones)) => println!("Active zones: {zones:?}"),
                Ok(CoordinatorEvent::UpdateFailed(reason)) => eprintln!("Poll error: {reason}"),
                Ok(CoordinatorEvent::AuthFailed) => {
                    eprintln!("Controller rejected the API key");
                    break;
                }
                Err(e) => eprintln!("Event stream: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.shutdown();
    poll.join().await;
    Ok(())
}
