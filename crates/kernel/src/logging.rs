use core::fmt::{self, Write};

use alloc::string::String;
use spin::RwLock;

use crate::utils::locks::SpinLock;

/// serializes writers so interleaved lines stay whole
static CONSOLE: SpinLock<Console> = SpinLock::new(Console);

/// everything logged since boot, for post-mortem inspection (and the
/// tests), `None` until the kernel is far enough along to allocate
pub static LOG_BUFFER: RwLock<Option<String>> = RwLock::new(None);

pub(crate) fn reset_log_buffer() {
    *LOG_BUFFER.write() = Some(String::new());
}

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::console_write(s);
        Ok(())
    }
}

pub fn _log(args: fmt::Arguments) {
    let mut console = CONSOLE.lock();
    console.write_fmt(args).expect("console write failed");
    drop(console);

    // never block a logger on the buffer, a lost line beats a deadlock
    if let Some(mut buffer) = LOG_BUFFER.try_write()
        && let Some(buffer) = buffer.as_mut()
    {
        let _ = buffer.write_fmt(args);
    }
}

pub fn log_time_from_ms(ms: u64) -> (u32, u8, u8, u16) {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    (
        hours as u32,
        (minutes % 60) as u8,
        (seconds % 60) as u8,
        (ms % 1000) as u16,
    )
}

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {{
        let (hours, minutes, seconds, ms) = $crate::logging::log_time_from_ms($crate::time::boot_ms());
        $crate::logging::_log(format_args!(
            "[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n",
            format_args!($($arg)*)
        ));
    }};
}

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::logln!("[ \x1B[{name_color}m{name:<5}\x1B[0m ]\x1b[90m {kind}:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, kind = $kind)
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::logln!("[ \x1B[{name_color}m{name:<5}\x1B[0m ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name)
    };
}

/// runtime debug info, takes an optional $mod which must be a type
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("warn", 93, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("error", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}

#[cfg(test)]
mod tests {
    use super::{LOG_BUFFER, log_time_from_ms};
    use crate::test::ktest;

    #[test]
    fn time_prefix_breakdown() {
        assert_eq!(log_time_from_ms(0), (0, 0, 0, 0));
        assert_eq!(log_time_from_ms(61_234), (0, 1, 1, 234));
        assert_eq!(log_time_from_ms(3_600_000 + 12 * 60_000 + 5_678), (1, 12, 5, 678));
    }

    #[test]
    fn lines_land_in_the_boot_log() {
        ktest(|| {
            crate::info!("breadcrumb {}", 42);
            let buffer = LOG_BUFFER.read();
            let log = buffer.as_ref().unwrap();
            assert!(log.contains("breadcrumb 42"));
            assert!(log.contains("kernel core up"));
        });
    }
}
