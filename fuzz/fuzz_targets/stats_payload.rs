#![no_main]

use fntrace::protocol::parse_stats_payload;
use fntrace::StatsMap;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) {
        let parsed = parse_stats_payload(&payload, &StatsMap::new());
        for stats in parsed.values() {
            assert!(stats.total_time >= 0.0);
            assert!(stats.min_time >= 0.0);
        }
    }
});
