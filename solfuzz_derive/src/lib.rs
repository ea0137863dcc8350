//! `#[derive(FuzzerState)]` for fuzzers wrapping `solfuzz::fuzzer::FuzzerState`.
//!
//! The wrapped state is found as follows:
//! - the only field of a newtype (`struct MyFuzzer(FuzzerState);`),
//! - the field marked `#[fuzzer_state]`,
//! - otherwise a named field called `state`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{Data, DeriveInput, Fields, Index, parse_macro_input};

const STATE_ATTRIBUTE: &str = "fuzzer_state";

#[proc_macro_derive(FuzzerState, attributes(fuzzer_state))]
pub fn derive_fuzzer_state(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let field = state_field(input)?;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::core::convert::AsRef<::solfuzz::fuzzer::FuzzerState>
            for #name #ty_generics #where_clause
        {
            fn as_ref(&self) -> &::solfuzz::fuzzer::FuzzerState {
                &self.#field
            }
        }

        impl #impl_generics ::core::convert::AsMut<::solfuzz::fuzzer::FuzzerState>
            for #name #ty_generics #where_clause
        {
            fn as_mut(&mut self) -> &mut ::solfuzz::fuzzer::FuzzerState {
                &mut self.#field
            }
        }
    })
}

/// The member expression (`0` or `state`) naming the wrapped state.
fn state_field(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FuzzerState can only be derived for structs",
        ));
    };

    let marked = data
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.attrs.iter().any(|a| a.path().is_ident(STATE_ATTRIBUTE)))
        .collect::<Vec<_>>();
    if marked.len() > 1 {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "only one field may be marked #[fuzzer_state]",
        ));
    }
    if let Some((index, field)) = marked.first() {
        return Ok(match &field.ident {
            Some(ident) => ident.to_token_stream(),
            None => Index::from(*index).to_token_stream(),
        });
    }

    match &data.fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(quote! { 0 }),
        Fields::Unnamed(_) => Err(syn::Error::new_spanned(
            &input.ident,
            "tuple structs with several fields need a #[fuzzer_state] field",
        )),
        Fields::Named(fields) => fields
            .named
            .iter()
            .filter_map(|f| f.ident.as_ref())
            .find(|ident| *ident == "state")
            .map(|ident| ident.to_token_stream())
            .ok_or_else(|| {
                syn::Error::new_spanned(
                    &input.ident,
                    "named structs need a `state` field or a #[fuzzer_state] field",
                )
            }),
        Fields::Unit => Err(syn::Error::new_spanned(
            &input.ident,
            "FuzzerState cannot be derived for unit structs",
        )),
    }
}
