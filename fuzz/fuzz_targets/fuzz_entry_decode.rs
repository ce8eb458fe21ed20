//! Fuzz target: `LeDecoder::decode`
//!
//! Feeds arbitrary payloads through the default decoder for every data
//! kind.  Fixed-width kinds must reject any payload of the wrong width.
//!
//! cargo fuzz run fuzz_entry_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use wearevent::{DataKind, EntryDecoder, LeDecoder};

const KINDS: [DataKind; 9] = [
    DataKind::Bool,
    DataKind::U8,
    DataKind::I8,
    DataKind::U16,
    DataKind::I16,
    DataKind::U32,
    DataKind::I32,
    DataKind::F32,
    DataKind::Bytes,
];

fuzz_target!(|data: &[u8]| {
    for kind in KINDS {
        let result = LeDecoder.decode(kind, data);
        if let Some(width) = kind.width() {
            assert_eq!(result.is_ok(), data.len() == width, "{kind:?}");
        }
    }
});
