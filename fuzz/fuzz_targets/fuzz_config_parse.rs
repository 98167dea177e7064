#![no_main]

use libfuzzer_sys::fuzz_target;
use sockpool::Config;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = Config::from_toml_str(text) else {
        return;
    };
    assert!(config.pool.capacity >= 1);
    assert!(config.server.backlog >= 1);
    if let Ok(again) = config.to_toml_string() {
        let back = Config::from_toml_str(&again).expect("serialized config must parse");
        assert_eq!(back.pool, config.pool);
    }
});
