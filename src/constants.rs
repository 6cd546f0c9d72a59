// Serial transport
pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const PERIDOT_BOOT_BAUD_RATE: u32 = 115200;
pub const PERIDOT_USER_BAUD_RATE: u32 = 921600;

pub(crate) const SERIAL_TIMEOUT_MS: u64 = 10;
pub(crate) const MAX_RESPONSE_SIZE: usize = 1024;

pub(crate) const RESET_DTR_RTS_LOW_MS: u64 = 50;
pub(crate) const POST_RESET_BOOTUP_DELAY_MS: u64 = 250;

// Raw REPL
pub(crate) const RAW_REPL_PROMPT: &str = "raw REPL; CTRL-B to exit\r\n";
pub(crate) const SOFT_REBOOT_BANNER: &str = "soft reboot\r\n";
pub(crate) const CTRL_A: u8 = 0x01;
pub(crate) const CTRL_B: u8 = 0x02;
pub(crate) const CTRL_C: u8 = 0x03;
pub(crate) const CTRL_D: u8 = 0x04;
pub(crate) const RAW_REPL_COMMAND_CHUNK: usize = 256;
pub(crate) const RAW_REPL_CHUNK_DELAY_MS: u64 = 10;
pub(crate) const RAW_REPL_INTERRUPT_DELAY_MS: u64 = 100;
pub(crate) const RAW_REPL_FILE_CHUNK: usize = 128;
pub(crate) const RAW_REPL_TIMEOUT_MS: u64 = 5000;
// Wait for the interrupt traceback when stopping; nothing may be running
pub(crate) const RAW_REPL_STOP_DRAIN_MS: u64 = 1000;

// ASCII hex console
pub(crate) const ASCII_HEX_BANNER: &str = "WAKAYAMA.RB";
pub(crate) const ASCII_HEX_PROMPT: &str = ">";
pub(crate) const ASCII_HEX_TIMEOUT_MS: u64 = 5000;
pub(crate) const ASCII_HEX_SAVE_TIMEOUT_MS: u64 = 10000;

// Advisory poll used by is_running() on stream boards
pub(crate) const RUNNING_POLL_MS: u64 = 20;

// Avalon-MM bridge
pub(crate) const AVALON_TRANSACTION_SIZE: usize = 1024;
pub(crate) const AVALON_TIMEOUT_MS: u64 = 1000;

// Software interrupt mailbox
pub const SWI_BASE_ADDRESS: u32 = 0x1000_0000;
pub const SWI_REG_CPU_RESET: u32 = 1;
pub const SWI_REG_ENTRY: u32 = 2;
pub const SWI_REG_NOTIFY: u32 = 5;
pub const SWI_REG_MESSAGE: u32 = 6;
pub(crate) const RPC_POLL_INTERVAL_MS: u64 = 5;
pub(crate) const RPC_TIMEOUT_MS: u64 = 2000;
pub(crate) const RPC_READ_CHUNK: usize = 1024;
pub(crate) const RPC_WRITE_CHUNK: usize = 1024;

// PERIDOT pseudo files
pub(crate) const PERIDOT_RUN_FILE: &str = "/sys/mruby/run";
pub(crate) const PERIDOT_INFO_FILE: &str = "/sys/info";
pub(crate) const PERIDOT_FLASH_FILE: &str = "/sys/flash";
pub(crate) const PERIDOT_STDIN: &str = "/dev/stdin";
pub(crate) const PERIDOT_STDOUT: &str = "/dev/stdout";
pub(crate) const PERIDOT_RUN_POLL_MS: u64 = 200;
pub(crate) const FLASH_READY_DEADLINE_MS: u64 = 5000;
pub(crate) const FLASH_READY_RETRY_MS: u64 = 100;

// Sector diff updater
pub(crate) const HASH_TIMEOUT_MS: u64 = 10000;
pub(crate) const WRITE_TIMEOUT_BASE_MS: u64 = 2000;
/// Assumed worst-case flash programming rate, bytes per millisecond
pub(crate) const WRITE_BYTES_PER_MS: u64 = 10;
