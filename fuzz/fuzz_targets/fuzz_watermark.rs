//! Fuzz target for watermark parsing and ordering.
//!
//! Parsing arbitrary strings never panics and the resulting order is total.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replay_engine::{MessageType, Watermark};
use std::cmp::Ordering;
use std::str::FromStr;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    let _ = MessageType::from_str(a);

    let wa = Watermark::parse(a);
    let wb = Watermark::parse(b);
    assert_eq!(wa.cmp(&wb), wb.cmp(&wa).reverse());
    assert_eq!(wa.cmp(&wa), Ordering::Equal);

    // Display feeds back into parse unchanged
    assert_eq!(Watermark::parse(&wa.to_string()), wa);
});
