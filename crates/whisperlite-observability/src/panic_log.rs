use std::{fs::OpenOptions, io::Write, path::PathBuf};

use crate::now_ms;

pub const PANIC_LOG: &str = "panic.log";

// Replaces the default hook, which prints to stderr. A failing stderr write
// inside the hook recurses into another panic, so panics go to `dir/panic.log`
// and the hook itself never panics.
pub fn install_best_effort(dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let bt = std::backtrace::Backtrace::force_capture();
        let thread = std::thread::current();
        let msg = format!(
            "ts_ms={}\nthread={}\npanic={info}\nbacktrace={bt}\n---\n",
            now_ms(),
            thread.name().unwrap_or("<unnamed>"),
        );
        let _ = std::fs::create_dir_all(&dir);
        if let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(PANIC_LOG))
        {
            let _ = f.write_all(msg.as_bytes());
        }
    }));
}
