use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use super::bootloader::{BootStage, BootstrapSession, CommandFrame, StatusFrame};
use super::registers::*;
use super::{RawCapture, Sensor, SensorConfig, SensorError};
use crate::as_micros;

/// Driver for an 8x8 multizone time-of-flight sensor.
///
/// `enable` is the chip enable line, `interrupt` the active-low result-ready line.
pub struct TofSensor<I2C, EN, INT, D> {
    i2c: I2C,
    enable: EN,
    interrupt: INT,
    delay: D,
    config: SensorConfig,
}

impl<I2C, EN, INT, D> TofSensor<I2C, EN, INT, D>
where
    I2C: I2c,
    EN: OutputPin,
    INT: InputPin,
    D: DelayNs,
{
    pub fn new(i2c: I2C, enable: EN, interrupt: INT, delay: D, config: SensorConfig) -> Self {
        Self {
            i2c,
            enable,
            interrupt,
            delay,
            config,
        }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn release(self) -> (I2C, EN, INT, D) {
        (self.i2c, self.enable, self.interrupt, self.delay)
    }

    /// Power up, load the measurement firmware if needed and start measuring.
    pub async fn initialize(&mut self, firmware: &[u8]) -> Result<(), SensorError> {
        self.enable().await?;
        self.bootstrap_firmware(firmware).await?;
        self.start_measurement().await
    }

    /// Raise the enable line, check the device id and wait for its cpu.
    pub async fn enable(&mut self) -> Result<(), SensorError> {
        self.enable
            .set_high()
            .map_err(|_| SensorError::Communication)?;
        self.delay.delay_us(as_micros(self.config.settle_time)).await;

        let id = self.read_register(ID).await? & CHIP_ID_MASK;
        if id != CHIP_ID {
            error!("unexpected device id {:#x}", id);
            return Err(SensorError::UnexpectedDevice { id });
        }

        self.write_register(ENABLE, ENABLE_PON).await?;
        for _ in 0..=self.config.max_retries {
            if self.read_register(ENABLE).await? & ENABLE_CPU_READY != 0 {
                debug!("sensor cpu ready");
                return Ok(());
            }
            self.pause().await;
        }

        Err(SensorError::PowerUpTimeout)
    }

    /// Download `image` through the bootloader unless the measurement
    /// application is already running.
    ///
    /// A checksum mismatch or a timeout aborts the download; the whole
    /// sequence is never retried here.
    pub async fn bootstrap_firmware(&mut self, image: &[u8]) -> Result<(), SensorError> {
        let app_id = self.read_register(APPID).await?;
        if app_id == APP_ID_MEASUREMENT {
            info!("measurement application already running");
            return Ok(());
        }
        if app_id != APP_ID_BOOTLOADER {
            return Err(SensorError::UnexpectedApplication { app_id });
        }

        let mut session = BootstrapSession::default();

        self.bootloader_command(
            &mut session,
            BootStage::DownloadInit,
            BL_CMD_DOWNLOAD_INIT,
            &[BL_DOWNLOAD_SEED],
        )
        .await?;

        let [lsb, msb] = self.config.ram_address.to_le_bytes();
        self.bootloader_command(
            &mut session,
            BootStage::SetAddress,
            BL_CMD_ADDR_RAM,
            &[lsb, msb],
        )
        .await?;

        for chunk in image.chunks(BL_CHUNK_SIZE) {
            self.bootloader_command(&mut session, BootStage::WriteRam, BL_CMD_W_RAM, chunk)
                .await?;
            session.offset += chunk.len();
        }
        debug!("firmware image written, {} bytes", session.offset);

        let remap = CommandFrame::new(BL_CMD_RAMREMAP_RESET, &[])?;
        self.i2c
            .write(self.config.address, remap.as_write())
            .await
            .map_err(|_| SensorError::Communication)?;

        // The device restarts from RAM; the bus may not answer until it is back.
        for _ in 0..=self.config.max_retries {
            self.pause().await;
            match self.read_register(APPID).await {
                Ok(APP_ID_MEASUREMENT) => {
                    info!(
                        "firmware started after {} status retries",
                        session.retries
                    );
                    return Ok(());
                }
                Ok(app_id) => session.last_status = app_id,
                Err(_) => {}
            }
            session.retries += 1;
        }

        Err(SensorError::BootstrapTimeout {
            stage: BootStage::RemapReset,
            last_status: session.last_status,
        })
    }

    /// Switch to 8x8 mode, program the measurement period into the common
    /// config page, enable the result interrupt and start measuring.
    pub async fn start_measurement(&mut self) -> Result<(), SensorError> {
        self.app_command(CMD_SWITCH_8X8_MODE).await?;

        self.write_register(CONFIG_RESULT, CONFIG_RESULT_COMMON_CID).await?;
        self.app_command(CMD_LOAD_CFG_PAGE_COMMON).await?;
        let period = self.config.measurement_period_ms;
        let [lsb, msb] = period.to_le_bytes();
        self.write_register(PERIOD_MS_LSB, lsb).await?;
        self.write_register(PERIOD_MS_MSB, msb).await?;
        self.app_command(CMD_WRITE_CFG_PAGE).await?;

        self.write_register(INT_ENAB, INT_RESULT).await?;
        self.write_register(CONFIG_RESULT, CONFIG_RESULT_MEAS).await?;
        self.write_register(INT_STATUS, 0xFF).await?;
        self.app_command(CMD_MEASURE).await?;

        info!("measurement started, period {} ms", period);
        Ok(())
    }

    /// Clear the pending interrupt and decode the result block.
    pub async fn sample_fetch(&mut self) -> Result<RawCapture, SensorError> {
        let pending = self
            .read_register(INT_STATUS)
            .await
            .map_err(|_| SensorError::Read)?;
        self.write_register(INT_STATUS, pending)
            .await
            .map_err(|_| SensorError::Read)?;

        let mut block = [0u8; RESULT_BLOCK_LEN];
        self.i2c
            .write_read(self.config.address, &[CONFIG_RESULT], &mut block)
            .await
            .map_err(|_| SensorError::Read)?;

        Ok(RawCapture::decode(&block, self.config.confidence_threshold))
    }

    /// Level of the result-ready line.
    pub fn interrupt_asserted(&mut self) -> Result<bool, SensorError> {
        self.interrupt
            .is_low()
            .map_err(|_| SensorError::Communication)
    }

    async fn bootloader_command(
        &mut self,
        session: &mut BootstrapSession,
        stage: BootStage,
        command: u8,
        payload: &[u8],
    ) -> Result<(), SensorError> {
        let frame = CommandFrame::new(command, payload)?;
        self.i2c
            .write(self.config.address, frame.as_write())
            .await
            .map_err(|_| SensorError::Communication)?;

        for _ in 0..=self.config.max_retries {
            self.pause().await;

            let mut raw = [0u8; 3];
            self.i2c
                .write_read(self.config.address, &[CMD_STAT], &mut raw)
                .await
                .map_err(|_| SensorError::Communication)?;

            let status = StatusFrame::parse(raw)?;
            session.last_status = status.status;
            if status.is_ready() {
                return Ok(());
            }
            session.retries += 1;
        }

        error!(
            "bootloader timed out in {:?} at offset {}",
            stage, session.offset
        );
        Err(SensorError::BootstrapTimeout {
            stage,
            last_status: session.last_status,
        })
    }

    async fn app_command(&mut self, command: u8) -> Result<(), SensorError> {
        self.write_register(CMD_STAT, command).await?;

        for _ in 0..=self.config.max_retries {
            self.pause().await;
            match self.read_register(CMD_STAT).await? {
                STAT_OK | STAT_ACCEPTED => return Ok(()),
                status if status < STAT_PENDING => {
                    return Err(SensorError::CommandRejected { command, status });
                }
                _ => {}
            }
        }

        Err(SensorError::CommandTimeout { command })
    }

    async fn read_register(&mut self, register: u8) -> Result<u8, SensorError> {
        let mut value = [0u8];
        self.i2c
            .write_read(self.config.address, &[register], &mut value)
            .await
            .map_err(|_| SensorError::Communication)?;
        Ok(value[0])
    }

    async fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(self.config.address, &[register, value])
            .await
            .map_err(|_| SensorError::Communication)
    }

    async fn pause(&mut self) {
        self.delay.delay_us(as_micros(self.config.poll_interval)).await;
    }
}

impl<I2C, EN, INT, D> Sensor for TofSensor<I2C, EN, INT, D>
where
    I2C: I2c,
    EN: OutputPin,
    INT: InputPin,
    D: DelayNs,
{
    async fn wait_for_capture(&mut self) -> Result<(), SensorError> {
        while !self.interrupt_asserted()? {
            self.pause().await;
        }
        Ok(())
    }

    async fn sample_fetch(&mut self) -> Result<RawCapture, SensorError> {
        TofSensor::sample_fetch(self).await
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use embedded_hal::digital::ErrorType;
    use embedded_hal::i2c::{ErrorKind, Operation};

    use super::*;
    use crate::sensor::bootloader::checksum;

    /// Register-level model of the sensor: bootloader until remapped, then
    /// the measurement application.
    struct FakeDevice {
        id: u8,
        app_id: u8,
        enable: u8,
        int_status: u8,
        int_enab: u8,
        cmd_stat: u8,
        config_result: u8,
        period_ms: [u8; 2],
        pointer: u8,
        commands: Vec<u8>,
        firmware: Vec<u8>,
        busy_polls: u8,
        pending_busy: u8,
        offline_reads: u8,
        restarting: u8,
        corrupt_status: bool,
        block: [u8; RESULT_BLOCK_LEN],
    }

    impl FakeDevice {
        fn bootloader() -> Self {
            Self {
                id: CHIP_ID,
                app_id: APP_ID_BOOTLOADER,
                enable: 0,
                int_status: 0,
                int_enab: 0,
                cmd_stat: 0,
                config_result: 0,
                period_ms: [0; 2],
                pointer: 0,
                commands: Vec::new(),
                firmware: Vec::new(),
                busy_polls: 0,
                pending_busy: 0,
                offline_reads: 0,
                restarting: 0,
                corrupt_status: false,
                block: [0; RESULT_BLOCK_LEN],
            }
        }

        fn on_write(&mut self, bytes: &[u8]) {
            self.pointer = bytes[0];
            let Some(&value) = bytes.get(1) else {
                return;
            };

            match self.pointer {
                CMD_STAT if self.app_id == APP_ID_BOOTLOADER => {
                    let frame = &bytes[1..];
                    let len = frame[1] as usize;
                    assert_eq!(frame[2 + len], checksum(&frame[..2 + len]));

                    self.commands.push(frame[0]);
                    match frame[0] {
                        BL_CMD_W_RAM => self.firmware.extend_from_slice(&frame[2..2 + len]),
                        BL_CMD_RAMREMAP_RESET => {
                            self.app_id = APP_ID_MEASUREMENT;
                            self.restarting = self.offline_reads;
                        }
                        _ => {}
                    }
                    self.pending_busy = self.busy_polls;
                }
                CMD_STAT => {
                    self.commands.push(value);
                    self.cmd_stat = STAT_OK;
                }
                ENABLE if value & ENABLE_PON != 0 => self.enable = value | ENABLE_CPU_READY,
                ENABLE => self.enable = value,
                INT_STATUS => self.int_status &= !value,
                INT_ENAB => self.int_enab = value,
                CONFIG_RESULT => self.config_result = value,
                PERIOD_MS_LSB => self.period_ms[0] = value,
                PERIOD_MS_MSB => self.period_ms[1] = value,
                _ => {}
            }
        }

        fn on_read(&mut self, buf: &mut [u8]) -> Result<(), ErrorKind> {
            match self.pointer {
                ID => buf[0] = self.id,
                APPID if self.restarting > 0 => {
                    self.restarting -= 1;
                    return Err(ErrorKind::Other);
                }
                APPID => buf[0] = self.app_id,
                ENABLE => buf[0] = self.enable,
                INT_STATUS => buf[0] = self.int_status,
                CMD_STAT if self.app_id == APP_ID_BOOTLOADER => {
                    let status = if self.pending_busy > 0 {
                        self.pending_busy -= 1;
                        [0x02, 0x00, checksum(&[0x02, 0x00])]
                    } else {
                        [BL_STATUS_READY, 0x00, checksum(&[BL_STATUS_READY, 0x00])]
                    };
                    buf.copy_from_slice(&status);
                    if self.corrupt_status {
                        buf[2] = 0x12;
                    }
                }
                CMD_STAT => buf[0] = self.cmd_stat,
                CONFIG_RESULT => buf.copy_from_slice(&self.block[..buf.len()]),
                _ => buf.fill(0),
            }
            Ok(())
        }
    }

    impl embedded_hal::i2c::ErrorType for FakeDevice {
        type Error = ErrorKind;
    }

    impl I2c for FakeDevice {
        async fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), ErrorKind> {
            assert_eq!(address, DEFAULT_ADDRESS);
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => self.on_write(bytes),
                    Operation::Read(buf) => self.on_read(buf)?,
                }
            }
            Ok(())
        }
    }

    struct Pin {
        high: bool,
    }

    impl ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            Ok(())
        }
    }

    impl InputPin for Pin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.high)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.high)
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    fn sensor(device: FakeDevice) -> TofSensor<FakeDevice, Pin, Pin, NoDelay> {
        TofSensor::new(
            device,
            Pin { high: false },
            Pin { high: true },
            NoDelay,
            SensorConfig::default(),
        )
    }

    #[tokio::test]
    async fn initialize_downloads_firmware_and_starts_measuring() {
        let mut device = FakeDevice::bootloader();
        device.busy_polls = 2;
        device.offline_reads = 3;
        let image: Vec<u8> = (0..300u16).map(|i| i as u8).collect();

        let mut sensor = sensor(device);
        sensor.initialize(&image).await.unwrap();

        let (device, enable, _, _) = sensor.release();
        assert!(enable.high);
        assert_eq!(device.firmware, image);
        assert_eq!(
            device.commands,
            [
                BL_CMD_DOWNLOAD_INIT,
                BL_CMD_ADDR_RAM,
                BL_CMD_W_RAM,
                BL_CMD_W_RAM,
                BL_CMD_W_RAM,
                BL_CMD_RAMREMAP_RESET,
                CMD_SWITCH_8X8_MODE,
                CMD_LOAD_CFG_PAGE_COMMON,
                CMD_WRITE_CFG_PAGE,
                CMD_MEASURE,
            ]
        );
        assert_eq!(device.int_enab, INT_RESULT);
        assert_eq!(device.config_result, CONFIG_RESULT_MEAS);
        assert_eq!(u16::from_le_bytes(device.period_ms), 1000);
    }

    #[tokio::test]
    async fn measurement_period_is_written_to_the_common_page() {
        let mut device = FakeDevice::bootloader();
        device.app_id = APP_ID_MEASUREMENT;

        let config = SensorConfig {
            measurement_period_ms: 0x0302,
            ..SensorConfig::default()
        };
        let mut sensor = TofSensor::new(
            device,
            Pin { high: false },
            Pin { high: true },
            NoDelay,
            config,
        );
        sensor.start_measurement().await.unwrap();

        let (device, ..) = sensor.release();
        assert_eq!(device.period_ms, [0x02, 0x03]);
        assert_eq!(
            device.commands,
            [
                CMD_SWITCH_8X8_MODE,
                CMD_LOAD_CFG_PAGE_COMMON,
                CMD_WRITE_CFG_PAGE,
                CMD_MEASURE
            ]
        );
    }

    #[tokio::test]
    async fn running_application_skips_download() {
        let mut device = FakeDevice::bootloader();
        device.app_id = APP_ID_MEASUREMENT;

        let mut sensor = sensor(device);
        sensor.bootstrap_firmware(&[1, 2, 3]).await.unwrap();

        let (device, ..) = sensor.release();
        assert!(device.commands.is_empty());
        assert!(device.firmware.is_empty());
    }

    #[tokio::test]
    async fn wrong_device_id_is_rejected() {
        let mut device = FakeDevice::bootloader();
        device.id = 0x12;

        let mut sensor = sensor(device);

        assert_eq!(
            sensor.enable().await,
            Err(SensorError::UnexpectedDevice { id: 0x12 })
        );
    }

    #[tokio::test]
    async fn corrupt_status_aborts_download() {
        let mut device = FakeDevice::bootloader();
        device.corrupt_status = true;

        let mut sensor = sensor(device);
        let result = sensor.bootstrap_firmware(&[0u8; 16]).await;

        assert_eq!(
            result,
            Err(SensorError::ChecksumMismatch {
                expected: 0xFF,
                actual: 0x12
            })
        );
        let (device, ..) = sensor.release();
        assert_eq!(device.commands, [BL_CMD_DOWNLOAD_INIT]);
    }

    #[tokio::test]
    async fn busy_bootloader_times_out_with_stage() {
        let mut device = FakeDevice::bootloader();
        device.busy_polls = u8::MAX;

        let config = SensorConfig {
            max_retries: 5,
            ..SensorConfig::default()
        };
        let mut sensor = TofSensor::new(
            device,
            Pin { high: false },
            Pin { high: true },
            NoDelay,
            config,
        );

        assert_eq!(
            sensor.bootstrap_firmware(&[0u8; 16]).await,
            Err(SensorError::BootstrapTimeout {
                stage: BootStage::DownloadInit,
                last_status: 0x02
            })
        );
    }

    #[tokio::test]
    async fn sample_fetch_clears_interrupt_and_decodes_block() {
        let mut device = FakeDevice::bootloader();
        device.app_id = APP_ID_MEASUREMENT;
        device.int_status = INT_RESULT;
        device.block[RESULT_NUMBER_OFFSET] = (3 << 2) | 1;
        device.block[RESULTS_OFFSET..RESULTS_OFFSET + 3]
            .copy_from_slice(&[140, 0x00, 0x02]);

        let mut sensor = TofSensor::new(
            device,
            Pin { high: true },
            Pin { high: false },
            NoDelay,
            SensorConfig::default(),
        );

        Sensor::wait_for_capture(&mut sensor).await.unwrap();
        let capture = Sensor::sample_fetch(&mut sensor).await.unwrap();

        assert_eq!(capture.sub_capture, 1);
        assert_eq!(capture.result_number, 3);
        assert_eq!(capture.results[0].distance_mm, 512);

        let (device, ..) = sensor.release();
        assert_eq!(device.int_status, 0);
    }
}
