//! Direct instrument control and power monitoring, without the server.

use anyhow::{bail, Result};
use psu_core::limits::{ASIC_VOLTAGE_CEILING, DEFAULT_ASIC_VOLTAGE};
use psu_core::PowerSupply;
use psu_hardware::BoundDriver;
use psu_server::dispatcher::bracketed;
use std::future::Future;
use std::time::Duration;

/// What one `psu control` invocation should do, applied in field order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlActions {
    pub on: bool,
    pub off: bool,
    pub set_voltage: Option<f64>,
    pub id: bool,
    pub read: bool,
    pub disconnect: bool,
}

/// Run `actions` against `driver`, returning the lines to print.
///
/// Turning on zeroes the second output of a dual-channel supply first, then
/// programs the first output to the requested (or nominal) ASIC voltage.
pub async fn run(driver: &BoundDriver, actions: &ControlActions) -> Result<Vec<String>> {
    if let Some(voltage) = actions.set_voltage {
        if voltage > ASIC_VOLTAGE_CEILING {
            bail!("Voltage too high for ASIC: V={}", voltage);
        }
    }

    let supply = driver.supply.as_ref();
    let current = supply.default_current();
    let mut output = Vec::new();

    if actions.on {
        let voltage = actions.set_voltage.unwrap_or(DEFAULT_ASIC_VOLTAGE);
        bracketed(supply, || async {
            if let Some(multi) = &driver.multi_channel {
                multi.set_limits_2(0.0, current).await?;
            }
            program(driver, voltage, current).await?;
            supply.turn_on().await
        })
        .await?;
        tracing::info!(model = %supply.model(), voltage, "output on");
    } else if actions.off {
        bracketed(supply, || supply.turn_off()).await?;
        tracing::info!(model = %supply.model(), "output off");
    } else if let Some(voltage) = actions.set_voltage {
        bracketed(supply, || program(driver, voltage, current)).await?;
        tracing::info!(model = %supply.model(), voltage, "voltage set");
    }

    if actions.id {
        output.push(bracketed(supply, || supply.identify()).await?);
    }
    if actions.read {
        let reading = bracketed(supply, || async { Ok(supply.read_power().await) }).await?;
        output.push(reading.to_string());
    }
    if actions.disconnect {
        // Opening and releasing hands the instrument back to local control
        bracketed(supply, || async { Ok(()) }).await?;
    }
    Ok(output)
}

async fn program(driver: &BoundDriver, voltage: f64, current: f64) -> psu_core::PsuResult<()> {
    match &driver.multi_channel {
        Some(multi) => multi.set_limits_1(voltage, current).await,
        None => driver.supply.set_limits(voltage, current).await,
    }
}

/// Log a power reading every `interval` until `shutdown` completes.
pub async fn monitor(
    driver: &BoundDriver,
    interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let supply = driver.supply.as_ref();
    let mut ticker = tokio::time::interval(interval);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let reading = read_once(supply).await;
                tracing::info!("{}", reading);
            }
        }
    }
    tracing::info!("Closing");
    Ok(())
}

async fn read_once(supply: &dyn PowerSupply) -> psu_core::PowerReading {
    match bracketed(supply, || supply.try_read_power()).await {
        Ok(reading) => reading,
        Err(e) => {
            tracing::warn!(error = %e, "power read failed");
            psu_core::PowerReading::SENTINEL
        }
    }
}
