#![no_main]

use libfuzzer_sys::fuzz_target;
use texttransform::{ParsedTemplate, Tokenizer};

fuzz_target!(|data: &[u8]| {
    if data.len() > 64 * 1024 {
        return;
    }
    let src = String::from_utf8_lossy(data);
    let mut template = ParsedTemplate::new(Some("fuzz.tt"));
    let mut tokenizer = Tokenizer::new(Some("fuzz.tt"), &src);
    if let Err(err) = template.parse_without_includes(&mut tokenizer) {
        template.record_parse_error(&err);
    }
    let _ = template.content().count();
});
