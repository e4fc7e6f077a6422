#![no_std]
#![no_main]

use defmt::info;
use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use esp_hal::prelude::*;
use {defmt_rtt as _, esp_backtrace as _};

use bme280::{EnvironmentSensorDriver, DEFAULT_SENSOR_ADDRESS};

extern crate alloc;

#[main]
async fn main(spawner: Spawner) {
    let peripherals = esp_hal::init({
        let mut config = esp_hal::Config::default();
        config.cpu_clock = CpuClock::max();
        config
    });

    esp_alloc::heap_allocator!(72 * 1024);

    let timer0 = esp_hal::timer::systimer::SystemTimer::new(peripherals.SYSTIMER)
        .split::<esp_hal::timer::systimer::Target>();
    esp_hal_embassy::init(timer0.alarm0);

    info!("Embassy initialized!");

    let _ = spawner;

    // Get an Device Specific I2c instance (Here: esp-rs)
    let i2c = esp_hal::i2c::master::I2c::new(
        peripherals.I2C0,
        esp_hal::i2c::master::Config {
            frequency: 100.kHz(),
            timeout: None,
        },
    )
    .with_sda(peripherals.GPIO6)
    .with_scl(peripherals.GPIO1)
    .into_async();

    // Setup the driver
    let mut sensor =
        EnvironmentSensorDriver::new(i2c, embassy_time::Delay, DEFAULT_SENSOR_ADDRESS);

    // Reset and init sensor
    sensor.init().await.unwrap();

    loop {
        let measurement = sensor.measure().await.unwrap();
        info!(
            "Sensor t = {}°C  p = {}hPa  h = {}%",
            measurement.temperature,
            measurement.hpa(),
            measurement.humidity
        );
        info!(
            "Altitude = {}m  dew point = {}",
            measurement.altitude(sensor.sealevel()),
            measurement.dew_point()
        );
        Timer::after(Duration::from_secs(1)).await;
    }
}
