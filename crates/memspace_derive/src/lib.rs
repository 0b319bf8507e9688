use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod shaped;

/// Implements `Shaped` (and `ShapedMut` unless `#[shaped(readonly)]`) by forwarding to the
/// field marked with `#[layout]`, or to the only field of a tuple struct.
#[proc_macro_derive(Shaped, attributes(shaped, layout))]
pub fn derive_shaped(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = shaped::derive_shaped(input);
    expanded.into()
}
