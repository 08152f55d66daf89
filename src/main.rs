//! Serial bridge binary: stdin bytes go out over the link, reassembled
//! inbound bytes come back on stdout. Lifecycle events and discovered
//! devices are reported on stderr via tracing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tracing::info;

use gimbal_link::infrastructure::logging;
use gimbal_link::{LinkEvent, LinkService, SettingsService};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Arc::new(Mutex::new(SettingsService::new()?));
    let log_settings = settings
        .lock()
        .map_err(|_| anyhow::anyhow!("Lock error"))?
        .get()
        .log_settings
        .clone();
    let _logging_guard = logging::init_logger(&log_settings)?;

    info!("starting gimbal-link serial bridge");
    let handle = LinkService::spawn(settings).await?;
    let mut events = handle.subscribe();

    // stdin -> outbound queue
    let writer_handle = handle.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => writer_handle.send(&buf[..n]),
            }
        }
    });

    // inbound queue -> stdout, plus event reporting
    let mut drain = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = drain.tick() => {
                let bytes = handle.drain_inbound();
                if !bytes.is_empty() {
                    use std::io::Write;
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(&bytes);
                    let _ = stdout.flush();
                }
            }
            event = events.recv() => match event {
                Ok(LinkEvent::Connected) => info!("link up"),
                Ok(LinkEvent::Disconnected) => info!("link down"),
                Ok(LinkEvent::DeviceListChanged) => {
                    for device in handle.active_devices() {
                        info!(
                            name = %device.name,
                            rssi = device.rssi,
                            signal = device.signal_scale,
                            "device visible"
                        );
                    }
                }
                Err(_) => {}
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutting down");
                handle.shutdown();
                break;
            }
        }
    }

    Ok(())
}
