#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    let Ok(cfg) = flyscan_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    // A validated scan section must convert into configure parameters
    // without panicking, whatever its sizes and breakpoints.
    if let Some(scan) = &cfg.scan
        && let Ok(params) = flyscan_core::conversions::scan_params(scan, &["det"])
    {
        let size = params.generator.size();
        if size <= 100_000 {
            let _ = flyscan_core::controller::steps_per_run(&params.generator, &params.axes_to_move, &params.breakpoints);
        }
    }
});
