use group_hub::{Hub, HubError, NotifyMessage, WorkerControl};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::TickFormat;
use crate::metrics::WorkerGuard;

/// Encode tick `count` for `group`.
fn render(group: &str, count: u64, format: TickFormat) -> Result<Vec<u8>, HubError> {
    let text = format!("{}: {}", group, count);
    match format {
        TickFormat::Text => Ok(text.into_bytes()),
        TickFormat::Json => NotifyMessage::new("tick", text)
            .with_data(json!({ "group": group, "count": count }))
            .to_bytes(),
    }
}

/// Demo producer: broadcasts `"<group>: <n>"` to its group every `period`.
///
/// The first message goes out one period after start. Exits as soon as the
/// supervisor asks it to. `worker` records the exit however it happens.
pub async fn run(
    group: String,
    mut control: WorkerControl,
    hub: Arc<Hub>,
    period: Duration,
    format: TickFormat,
    worker: WorkerGuard,
) -> Result<(), HubError> {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut count: u64 = 0;

    let signal = loop {
        tokio::select! {
            signal = control.stopped() => break signal,
            _ = tick.tick() => {
                let msg = render(&group, count, format)?;
                match hub.group_broadcast(&msg, &group).await {
                    Ok(delivery) => {
                        if delivery.failed > 0 {
                            worker.metrics().messages_dropped(delivery.failed as u64);
                        }
                    }
                    // Group emptied between ticks; the idle check will stop us.
                    Err(HubError::NoActiveSession { .. }) => {}
                    Err(e) => debug!(group = %group, "ticker broadcast failed: {}", e),
                }
                count += 1;
            }
        }
    };

    info!(group = %group, %signal, ticks = count, "ticker stopping");
    control.ack();
    Ok(())
}
