use std::time::Duration;

use tracing::info;

use crate::commands::sweep::sweep_once;
use crate::commands::{load_config, open_database, runtime, CommandResult};

/// Sweeps on the configured interval until interrupted, or until `max_sweeps`
/// passes have run.
pub fn run(max_sweeps: Option<u32>) -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_database(&config).await?;
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.escalation.sweep_interval_secs));
            let mut completed: u32 = 0;
            let mut escalated: usize = 0;

            info!(
                event_name = "escalation.watch.started",
                interval_secs = config.escalation.sweep_interval_secs,
                "escalation watcher started"
            );

            let outcome = loop {
                if max_sweeps.is_some_and(|limit| completed >= limit) {
                    break Ok(());
                }
                tokio::select! {
                    _ = interval.tick() => {
                        match sweep_once(&pool, &config).await {
                            Ok(summary) => {
                                completed += 1;
                                escalated += summary.report.escalated.len();
                            }
                            Err(failure) => break Err(failure),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!(event_name = "escalation.watch.interrupted", "shutdown requested");
                        break Ok(());
                    }
                }
            };

            pool.close().await;
            outcome.map(|()| (completed, escalated))
        })
    });

    match result {
        Ok((completed, escalated)) => CommandResult::success(
            "watch",
            format!("completed {completed} sweep(s); escalated {escalated} step(s)"),
        ),
        Err(failure) => CommandResult::from_failure("watch", failure),
    }
}
