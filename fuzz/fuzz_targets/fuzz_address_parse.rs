#![no_main]

use libfuzzer_sys::fuzz_target;
use sockpool::Address;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(address) = text.parse::<Address>() else {
        return;
    };
    // Whatever parses must print back to something that parses the same.
    let printed = address.to_string();
    let reparsed: Address = printed
        .parse()
        .unwrap_or_else(|err| panic!("{printed:?} did not reparse: {err}"));
    assert_eq!(reparsed, address);
    assert_eq!(reparsed.kind(), address.kind());
});
