//! Fuzz target: `EventRecipe::decode`
//!
//! Stored recipes are read back from host storage and may be corrupt.
//! Decoding must never panic, and whatever decodes must survive a
//! second encode/decode unchanged.  Bytes are compared since float
//! references may be NaN.
//!
//! cargo fuzz run fuzz_recipe_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use wearevent::EventRecipe;
use wearevent::registry::MAX_RECIPE_DEPTH;

fuzz_target!(|data: &[u8]| {
    if data.len() > 4096 {
        return;
    }
    let Ok(recipe) = EventRecipe::decode(data) else {
        return;
    };
    assert!(recipe.inline_depth() <= MAX_RECIPE_DEPTH);

    let bytes = recipe.encode().expect("decoded recipe re-encodes");
    let again = EventRecipe::decode(&bytes).expect("re-encoded recipe decodes");
    assert_eq!(again.encode().ok(), Some(bytes));
});
