//! Grammar loader fuzz target: arbitrary UTF-8 as a grammar document.
//! Loading and the static checker must not panic.
//! Build with: cargo fuzz run loader_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let s = match std::str::from_utf8(data) {
        Ok(x) => x,
        Err(_) => return,
    };
    if let Ok(g) = binterp::loader::parse(s) {
        let _ = binterp::check::check_grammar(&g);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run loader_fuzz");
}
