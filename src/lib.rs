#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

// The `sync` feature switches maybe-async into its is_sync mode, so the
// blocking traits apply whenever it is enabled.
#[cfg(feature = "sync")]
use embedded_hal::delay::DelayNs;
#[cfg(feature = "sync")]
use embedded_hal::i2c::I2c;
#[cfg(all(feature = "async", not(feature = "sync")))]
use embedded_hal_async::delay::DelayNs;
#[cfg(all(feature = "async", not(feature = "sync")))]
use embedded_hal_async::i2c::I2c;

// As per https://www.bosch-sensortec.com/media/boschsensortec/downloads/datasheets/bst-bme280-ds002.pdf
pub const DEFAULT_SENSOR_ADDRESS: u8 = 0x76;
pub const SECONDARY_SENSOR_ADDRESS: u8 = 0x77;
const CHIP_ID: u8 = 0x60;
const RESET_COMMAND: u8 = 0xB6;
const REG_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_BLOCK_A: u8 = 0x88;
const REG_CALIB_BLOCK_B: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

const MODE_SLEEP: u8 = 0;
const MODE_FORCED: u8 = 1;
const STATUS_MEASURING: u8 = 0x08;

const STARTUP_DELAY_MS: u32 = 2;
const POLL_INTERVAL_MS: u32 = 5;
// Worst-case conversion at 16x oversampling on all channels is ~113 ms.
const MEASUREMENT_TIMEOUT_MS: u32 = 200;

const PRESSURE_MIN_PA: f64 = 30000.0;
const PRESSURE_MAX_PA: f64 = 110000.0;
const SEALEVEL_DEFAULT_PA: f32 = 101325.0;

macro_rules! defmt {
    ($body:expr) => {
        #[cfg(feature = "logging")]
        {
            use defmt::*;

            $body;
        }
        #[cfg(not(feature = "logging"))]
        {
            // No-op
        }
    };
}

/// Driver errors.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "logging", derive(defmt::Format))]
pub enum Error<E> {
    /// Underlying I2C bus error.
    Bus(E),
    /// The chip id read back from the device is not a BME280's.
    DeviceNotFound,
    /// Raw oversampling value outside the five legal register encodings.
    InvalidConfiguration(u8),
    /// The conversion did not finish within the poll deadline.
    Timeout,
}

/// Oversampling setting, applied to all three channels.
///
/// The discriminants are the register encodings from the datasheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "logging", derive(defmt::Format))]
#[repr(u8)]
pub enum Oversampling {
    X1 = 1,
    X2 = 2,
    X4 = 3,
    #[default]
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Oversampling::X1),
            2 => Some(Oversampling::X2),
            3 => Some(Oversampling::X4),
            4 => Some(Oversampling::X8),
            5 => Some(Oversampling::X16),
            _ => None,
        }
    }
}

/// Factory calibration coefficients, fused per device and read once at
/// init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "logging", derive(defmt::Format))]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decode the two calibration blocks (0x88..0xA1 and 0xE1..0xE7).
    ///
    /// All words are little-endian. H4 and H5 share a register byte and
    /// are unfolded from a 12-bit/4-bit split, keeping care of the sign.
    pub fn from_registers(block_a: &[u8; 26], block_b: &[u8; 7]) -> Self {
        let h4_raw = block_b[3] as i8;
        let h5_raw = i16::from_le_bytes([block_b[4], block_b[5]]);
        Calibration {
            t1: u16::from_le_bytes([block_a[0], block_a[1]]),
            t2: i16::from_le_bytes([block_a[2], block_a[3]]),
            t3: i16::from_le_bytes([block_a[4], block_a[5]]),
            p1: u16::from_le_bytes([block_a[6], block_a[7]]),
            p2: i16::from_le_bytes([block_a[8], block_a[9]]),
            p3: i16::from_le_bytes([block_a[10], block_a[11]]),
            p4: i16::from_le_bytes([block_a[12], block_a[13]]),
            p5: i16::from_le_bytes([block_a[14], block_a[15]]),
            p6: i16::from_le_bytes([block_a[16], block_a[17]]),
            p7: i16::from_le_bytes([block_a[18], block_a[19]]),
            p8: i16::from_le_bytes([block_a[20], block_a[21]]),
            p9: i16::from_le_bytes([block_a[22], block_a[23]]),
            // block_a[24] is register 0xA0, which holds no coefficient
            h1: block_a[25],
            h2: i16::from_le_bytes([block_b[0], block_b[1]]),
            h3: block_b[2],
            h4: (h4_raw as i16) * 16 + (h5_raw & 0xF),
            h5: h5_raw >> 4,
            h6: block_b[6] as i8,
        }
    }

    /// Compensate a raw readout into physical units.
    ///
    /// Pure: touches no transport and keeps no state between calls. The
    /// fine-temperature intermediate is recomputed from the raw
    /// temperature on every call and feeds both the pressure and the
    /// humidity polynomials.
    pub fn compensate(&self, raw: &RawData) -> Measurement {
        let raw_temperature = raw.temperature as f64;
        let var1 = (raw_temperature / 16384.0 - self.t1 as f64 / 1024.0) * self.t2 as f64;
        let var2 = raw_temperature / 131072.0 - self.t1 as f64 / 8192.0;
        let var2 = var2 * var2 * self.t3 as f64;
        let t_fine = (var1 + var2) as i32;
        let temperature = ((var1 + var2) / 5120.0).clamp(-40.0, 85.0);

        let var1 = (t_fine as f64 / 2.0) - 64000.0;
        let var2 = var1 * var1 * self.p6 as f64 / 32768.0 + var1 * self.p5 as f64 * 2.0;
        let var2 = (var2 / 4.0) + (self.p4 as f64 * 65536.0);
        let var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        let var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;
        let pressure = if var1 == 0.0 {
            // zero divisor: substitute the range floor instead of dividing
            PRESSURE_MIN_PA
        } else {
            let p = ((1048576.0 - raw.pressure as f64) - (var2 / 4096.0)) * 6250.0 / var1;
            let var1 = self.p9 as f64 * p * p / 2147483648.0;
            let var2 = p * self.p8 as f64 / 32768.0;
            (p + (var1 + var2 + self.p7 as f64) / 16.0).clamp(PRESSURE_MIN_PA, PRESSURE_MAX_PA)
        };

        let h = t_fine as f64 - 76800.0;
        let h = (raw.humidity as f64 - (self.h4 as f64 * 64.0 + self.h5 as f64 / 16384.0 * h))
            * (self.h2 as f64 / 65536.0
                * (1.0
                    + self.h6 as f64 / 67108864.0
                        * h
                        * (1.0 + self.h3 as f64 / 67108864.0 * h)));
        let humidity = h * (1.0 - self.h1 as f64 * h / 524288.0);

        Measurement {
            temperature: temperature as f32,
            pressure: pressure as f32,
            humidity: humidity as f32,
        }
    }
}

/// Uncompensated register readout of one conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "logging", derive(defmt::Format))]
pub struct RawData {
    /// 20-bit raw temperature.
    pub temperature: u32,
    /// 20-bit raw pressure.
    pub pressure: u32,
    /// 16-bit raw humidity.
    pub humidity: u32,
}

impl RawData {
    fn from_burst(readout: &[u8; 8]) -> Self {
        // pressure(0xF7): ((msb << 16) | (lsb << 8) | xlsb) >> 4
        let pressure =
            ((readout[0] as u32) << 16 | (readout[1] as u32) << 8 | readout[2] as u32) >> 4;
        // temperature(0xFA): ((msb << 16) | (lsb << 8) | xlsb) >> 4
        let temperature =
            ((readout[3] as u32) << 16 | (readout[4] as u32) << 8 | readout[5] as u32) >> 4;
        // humidity(0xFD): (msb << 8) | lsb
        let humidity = (readout[6] as u32) << 8 | readout[7] as u32;
        RawData {
            temperature,
            pressure,
            humidity,
        }
    }
}

/// One compensated environment reading.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "logging", derive(defmt::Format))]
pub struct Measurement {
    /// Temperature in °C, clamped to [-40, 85].
    pub temperature: f32,
    /// Pressure in Pa, clamped to [30000, 110000].
    pub pressure: f32,
    /// Relative humidity in %. Not clamped unless the driver is told to.
    pub humidity: f32,
}

impl Measurement {
    pub fn hpa(&self) -> f32 {
        self.pressure / 100.0
    }

    pub fn fahrenheit(&self) -> f32 {
        self.temperature * 9.0 / 5.0 + 32.0
    }

    /// Barometric altitude in m above the given sea-level reference.
    ///
    /// A non-finite result (degenerate pressure ratio) maps to 0.0.
    pub fn altitude(&self, sealevel_pa: f32) -> f32 {
        let altitude = 44330.0 * (1.0 - libm::powf(self.pressure / sealevel_pa, 0.1903));
        if altitude.is_finite() {
            altitude
        } else {
            0.0
        }
    }

    /// Dew point in °C via the Magnus approximation.
    ///
    /// `None` when humidity is zero or negative, where the logarithm
    /// has no value.
    pub fn dew_point(&self) -> Option<f32> {
        if self.humidity <= 0.0 {
            return None;
        }
        let gamma = (libm::log10f(self.humidity) - 2.0) / 0.4343
            + (17.62 * self.temperature) / (243.12 + self.temperature);
        Some(243.12 * gamma / (17.62 - gamma))
    }
}

pub struct EnvironmentSensorDriver<I2cImpl: I2c, DelayImpl: DelayNs> {
    i2c: I2cImpl,
    delay: DelayImpl,
    sensor_address: u8,
    mode: Oversampling,
    calibration: Calibration,
    sealevel: f32,
    clamp_humidity: bool,
}

impl<I2cImpl: I2c, DelayImpl: DelayNs> EnvironmentSensorDriver<I2cImpl, DelayImpl> {
    pub fn new(i2c: I2cImpl, delay: DelayImpl, sensor_address: u8) -> Self {
        EnvironmentSensorDriver {
            i2c,
            delay,
            sensor_address,
            mode: Oversampling::default(),
            calibration: Calibration::default(),
            sealevel: SEALEVEL_DEFAULT_PA,
            clamp_humidity: false,
        }
    }

    /// Coefficients loaded by `init`. All zeros before that.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_oversampling(&mut self, mode: Oversampling) {
        self.mode = mode;
    }

    /// Set the oversampling from a raw register encoding, e.g. a value
    /// carried in stored configuration. Illegal encodings are rejected
    /// before any bus traffic.
    pub fn set_raw_oversampling(&mut self, raw: u8) -> Result<(), Error<I2cImpl::Error>> {
        match Oversampling::from_raw(raw) {
            Some(mode) => {
                self.mode = mode;
                Ok(())
            }
            None => Err(Error::InvalidConfiguration(raw)),
        }
    }

    /// Sea-level reference pressure in Pa used by `altitude`.
    pub fn sealevel(&self) -> f32 {
        self.sealevel
    }

    /// Set the sea-level reference. Values outside (30000, 120000) Pa
    /// are ignored and the previous reference stays in place.
    pub fn set_sealevel(&mut self, pascal: f32) {
        if 30000.0 < pascal && pascal < 120000.0 {
            self.sealevel = pascal;
        }
    }

    /// Clamp compensated humidity into [0, 100] %.
    ///
    /// Off by default: the humidity polynomial can leave the physical
    /// range on extreme readouts, and a saturated value is
    /// indistinguishable from a real 0 or 100 % reading.
    pub fn set_humidity_clamping(&mut self, clamp: bool) {
        self.clamp_humidity = clamp;
    }
}

#[maybe_async::maybe_async]
impl<I2cImpl: I2c, DelayImpl: DelayNs> EnvironmentSensorDriver<I2cImpl, DelayImpl> {
    /// Reset the sensor, check its identity and load the calibration
    /// coefficients, leaving the device parked in sleep mode.
    pub async fn init(&mut self) -> Result<(), Error<I2cImpl::Error>> {
        defmt!(trace!("Resetting sensor"));
        self.write_register(REG_RESET, RESET_COMMAND).await?;
        self.delay.delay_ms(STARTUP_DELAY_MS).await;

        let id = self.read_register(REG_ID).await?;
        if id != CHIP_ID {
            return Err(Error::DeviceNotFound);
        }

        let mut block_a = [0u8; 26];
        self.read_into(REG_CALIB_BLOCK_A, &mut block_a).await?;
        let mut block_b = [0u8; 7];
        self.read_into(REG_CALIB_BLOCK_B, &mut block_b).await?;
        self.calibration = Calibration::from_registers(&block_a, &block_b);
        defmt!(trace!("Received calibration coefficients"));

        let mode = self.mode as u8;
        self.write_register(REG_CTRL_MEAS, mode << 5 | mode << 2 | MODE_SLEEP)
            .await
    }

    /// Trigger one forced-mode conversion and read the raw registers.
    pub async fn read_raw(&mut self) -> Result<RawData, Error<I2cImpl::Error>> {
        let mode = self.mode as u8;
        self.write_register(REG_CTRL_HUM, mode).await?;
        self.write_register(REG_CTRL_MEAS, mode << 5 | mode << 2 | MODE_FORCED)
            .await?;

        let mut remaining_ms = MEASUREMENT_TIMEOUT_MS;
        loop {
            let status = self.read_register(REG_STATUS).await?;
            if status & STATUS_MEASURING == 0 {
                break;
            }
            if remaining_ms == 0 {
                return Err(Error::Timeout);
            }
            self.delay.delay_ms(POLL_INTERVAL_MS).await;
            remaining_ms -= POLL_INTERVAL_MS;
        }

        // burst readout from 0xF7 to 0xFE, recommended by the datasheet
        let mut readout = [0u8; 8];
        self.read_into(REG_DATA, &mut readout).await?;
        let raw = RawData::from_burst(&readout);
        defmt!(trace!(
            "Raw readout t = {} p = {} h = {}",
            raw.temperature,
            raw.pressure,
            raw.humidity
        ));
        Ok(raw)
    }

    /// Take one compensated reading.
    pub async fn measure(&mut self) -> Result<Measurement, Error<I2cImpl::Error>> {
        let raw = self.read_raw().await?;
        let mut measurement = self.calibration.compensate(&raw);
        if self.clamp_humidity {
            measurement.humidity = measurement.humidity.clamp(0.0, 100.0);
        }
        defmt!(trace!(
            "Got temperature {} pressure {} humidity {}",
            measurement.temperature,
            measurement.pressure,
            measurement.humidity
        ));
        Ok(measurement)
    }

    /// Take a reading and derive the altitude against the configured
    /// sea-level reference.
    pub async fn altitude(&mut self) -> Result<f32, Error<I2cImpl::Error>> {
        let measurement = self.measure().await?;
        Ok(measurement.altitude(self.sealevel))
    }

    /// Take a reading and derive the dew point.
    pub async fn dew_point(&mut self) -> Result<Option<f32>, Error<I2cImpl::Error>> {
        let measurement = self.measure().await?;
        Ok(measurement.dew_point())
    }

    async fn write_register(
        &mut self,
        register: u8,
        value: u8,
    ) -> Result<(), Error<I2cImpl::Error>> {
        self.i2c
            .write(self.sensor_address, &[register, value])
            .await
            .map_err(Error::Bus)
    }

    async fn read_register(&mut self, register: u8) -> Result<u8, Error<I2cImpl::Error>> {
        let mut buffer = [0u8; 1];
        self.read_into(register, &mut buffer).await?;
        Ok(buffer[0])
    }

    async fn read_into(
        &mut self,
        register: u8,
        buffer: &mut [u8],
    ) -> Result<(), Error<I2cImpl::Error>> {
        self.i2c
            .write_read(self.sensor_address, &[register], buffer)
            .await
            .map_err(Error::Bus)
    }
}
