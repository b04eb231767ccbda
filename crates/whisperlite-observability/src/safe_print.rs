// stderr logging that tolerates a missing console.
//
// `eprintln!` panics when the write fails, which happens in GUI hosts without
// an attached console. Write errors are dropped instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
