#![no_main]

use fntrace::agent::{parse_call, Agent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and evaluating must never panic, whatever the input
        let _ = parse_call(input);

        let agent = Agent::standalone();
        let _ = agent.evaluate("fntrace.install()");
        let _ = agent.evaluate(input);
    }
});
