#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parsing, validation and conversion into the runtime config must never panic.
    let Ok(cfg) = mmu_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_ok() {
        let _ = mmu_core::config::TransportCfg::try_from(&cfg);
    }
});
