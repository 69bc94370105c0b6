//! Format fuzz target: split input into a format string and an argument buffer.
//! Decoding and rendering must not panic on any input.
//! Build with: cargo fuzz run format_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let split = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let format = String::from_utf8_lossy(&data[..split]);
    let args = data.get(split + 1..).unwrap_or(&[]);
    let _ = tokdetok::FormatString::new(&format).format(args, true);
    let _ = tokdetok::FormatSpec::from_string(&format);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run format_fuzz");
}
