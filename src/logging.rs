//! Logging init, grounded on `valopok-vroom`'s `NvmeDevice::new` (a single
//! `env_logger::init()` call behind `log`'s debug/error macros elsewhere in
//! the driver). This crate is a library rather than a binary, so init is a
//! function callers opt into rather than something run implicitly; it is
//! idempotent via `env_logger`'s own `try_init`.

/// Initialize the `env_logger` backend for the `log` facade this crate uses
/// throughout (`controller`, `sim`, `dma`). Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
