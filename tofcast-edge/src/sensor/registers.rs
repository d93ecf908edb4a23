//! Register map of the 8x8 multizone time-of-flight sensor.

pub const DEFAULT_ADDRESS: u8 = 0x41;

pub const APPID: u8 = 0x00;
pub const CMD_STAT: u8 = 0x08;
/// Config page selector, also the first byte of the result block read.
pub const CONFIG_RESULT: u8 = 0x20;
pub const PERIOD_MS_LSB: u8 = 0x24;
pub const PERIOD_MS_MSB: u8 = 0x25;
pub const ENABLE: u8 = 0xE0;
pub const INT_STATUS: u8 = 0xE1;
pub const INT_ENAB: u8 = 0xE2;
pub const ID: u8 = 0xE3;

pub const CHIP_ID: u8 = 0x08;
pub const CHIP_ID_MASK: u8 = 0x3F;

pub const ENABLE_PON: u8 = 0x01;
pub const ENABLE_CPU_READY: u8 = 0x40;

pub const APP_ID_MEASUREMENT: u8 = 0x03;
pub const APP_ID_BOOTLOADER: u8 = 0x80;

pub const INT_RESULT: u8 = 0x02;

pub const CONFIG_RESULT_MEAS: u8 = 0x10;
pub const CONFIG_RESULT_COMMON_CID: u8 = 0x16;

// bootloader commands
pub const BL_CMD_RAMREMAP_RESET: u8 = 0x11;
pub const BL_CMD_DOWNLOAD_INIT: u8 = 0x14;
pub const BL_CMD_W_RAM: u8 = 0x41;
pub const BL_CMD_ADDR_RAM: u8 = 0x43;
pub const BL_STATUS_READY: u8 = 0x00;
pub const BL_DOWNLOAD_SEED: u8 = 0x29;
pub const BL_CHUNK_SIZE: usize = 128;

// measurement application commands
pub const CMD_MEASURE: u8 = 0x10;
pub const CMD_WRITE_CFG_PAGE: u8 = 0x15;
pub const CMD_LOAD_CFG_PAGE_COMMON: u8 = 0x16;
pub const CMD_SWITCH_8X8_MODE: u8 = 0x6C;
pub const STAT_OK: u8 = 0x00;
pub const STAT_ACCEPTED: u8 = 0x01;
/// Values at or above this still hold the command being executed.
pub const STAT_PENDING: u8 = 0x10;

pub const DEFAULT_MEASUREMENT_PERIOD_MS: u16 = 1000;

/// Bytes read per capture, starting at [`CONFIG_RESULT`].
pub const RESULT_BLOCK_LEN: usize = RESULTS_OFFSET + RESULT_SLOTS * 3;
pub const RESULT_SLOTS: usize = 36;

// offsets inside the result block
pub const RESULT_NUMBER_OFFSET: usize = 4;
pub const TEMPERATURE_OFFSET: usize = 5;
pub const VALID_RESULTS_OFFSET: usize = 6;
pub const AMBIENT_LIGHT_OFFSET: usize = 8;
pub const PHOTON_COUNT_OFFSET: usize = 12;
pub const REFERENCE_COUNT_OFFSET: usize = 16;
pub const SYS_TICK_OFFSET: usize = 20;
pub const RESULTS_OFFSET: usize = 24;

/// Low bits of the result number byte.
pub const SUB_CAPTURE_MASK: u8 = 0x03;
pub const RESULT_NUMBER_MASK: u8 = 0x3F;

/// Duration of one system tick, in seconds.
pub const TICK_SECONDS: f64 = 0.2e-6;
