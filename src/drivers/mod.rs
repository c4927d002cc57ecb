//! Block-device drivers.
//!
//! [`blockdev::SimpleDisk`] speaks the raw ATA-style PIO protocol and busy
//! -waits; [`nonblocking::NonBlockingDisk`] layers the scheduler-coupled,
//! CPU-yielding I/O path on top of it.

pub mod blockdev;
pub mod nonblocking;
