//! `#[derive(Error)]` for error enums.
//!
//! ```ignore
//! use kvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum LoadError {
//!     #[error("missing entry point {0}")]
//!     MissingEntry(String),
//!     #[error("stack overflow (capacity {capacity} words)")]
//!     Overflow { capacity: usize, sp: usize },
//!     #[error("halted")]
//!     Halted,
//! }
//! ```
//!
//! Only the fields a message mentions are bound, so a variant may carry
//! context that is not part of its display text.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitStr, Variant, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "Error derive only supports enums",
        ));
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let arms = data
        .variants
        .iter()
        .map(display_arm)
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

fn display_arm(variant: &Variant) -> syn::Result<TokenStream2> {
    let ident = &variant.ident;
    let message = error_message(variant)?;

    let arm = match &variant.fields {
        Fields::Unit => quote! {
            Self::#ident => write!(f, #message),
        },
        Fields::Named(fields) => {
            let used: Vec<_> = fields
                .named
                .iter()
                .filter_map(|field| field.ident.as_ref())
                .filter(|field| mentions(&message, &field.to_string()))
                .collect();
            quote! {
                Self::#ident { #(#used,)* .. } => write!(f, #message, #(#used = #used),*),
            }
        }
        Fields::Unnamed(fields) => {
            // `{0}` is not a valid named argument, rewrite positions to `{f0}`.
            let mut format = message.clone();
            let mut patterns = Vec::with_capacity(fields.unnamed.len());
            let mut used = Vec::new();
            for position in 0..fields.unnamed.len() {
                let key = position.to_string();
                if !mentions(&message, &key) {
                    patterns.push(quote!(_));
                    continue;
                }
                let binding = format_ident!("f{}", position);
                format = format
                    .replace(&format!("{{{key}}}"), &format!("{{{binding}}}"))
                    .replace(&format!("{{{key}:"), &format!("{{{binding}:"));
                patterns.push(quote!(#binding));
                used.push(binding);
            }
            quote! {
                Self::#ident(#(#patterns),*) => write!(f, #format, #(#used = #used),*),
            }
        }
    };

    Ok(arm)
}

fn mentions(message: &str, field: &str) -> bool {
    message.contains(&format!("{{{field}}}")) || message.contains(&format!("{{{field}:"))
}

fn error_message(variant: &Variant) -> syn::Result<String> {
    let attr = variant
        .attrs
        .iter()
        .find(|attr| attr.path().is_ident("error"))
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &variant.ident,
                format!(
                    "variant `{}` is missing #[error(\"...\")]",
                    variant.ident
                ),
            )
        })?;

    attr.parse_args::<LitStr>()
        .map(|lit| lit.value())
        .map_err(|_| {
            syn::Error::new_spanned(
                &attr.meta,
                "expected a string literal, e.g. #[error(\"stack overflow\")]",
            )
        })
}
