//! `#[derive(BinaryCodec)]`: field-order binary serialization.
//!
//! Supports named-field structs and enums. Enums are tagged with a `u8`
//! discriminant (explicit `Variant = N` values are honoured) followed by the
//! variant's fields in declaration order. Generated code targets
//! `crate::types::encoding`, so the derive is only usable inside `kvm`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DataEnum, DeriveInput, Fields, FieldsNamed, parse_macro_input};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => named_struct_bodies(fields),
            _ => {
                return Err(syn::Error::new_spanned(
                    &input.ident,
                    "BinaryCodec supports structs with named fields only",
                ));
            }
        },
        Data::Enum(data) => enum_bodies(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "BinaryCodec does not support unions",
            ));
        }
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

fn named_struct_bodies(fields: &FieldsNamed) -> (TokenStream2, TokenStream2) {
    let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
    let encode = quote! {
        #( crate::types::encoding::Encode::encode(&self.#names, out); )*
    };
    let decode = quote! {
        Ok(Self {
            #( #names: crate::types::encoding::Decode::decode(input)?, )*
        })
    };
    (encode, decode)
}

fn enum_bodies(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let tags = discriminants(data)?;
    let mut encode_arms = Vec::with_capacity(tags.len());
    let mut decode_arms = Vec::with_capacity(tags.len());

    for (variant, tag) in data.variants.iter().zip(tags) {
        let ident = &variant.ident;
        match &variant.fields {
            Fields::Unit => {
                encode_arms.push(quote! {
                    Self::#ident => crate::types::encoding::Encode::encode(&#tag, out),
                });
                decode_arms.push(quote! { #tag => Ok(Self::#ident), });
            }
            _ => {
                return Err(syn::Error::new_spanned(
                    variant,
                    "BinaryCodec enums must have unit variants only",
                ));
            }
        }
    }

    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let tag: u8 = crate::types::encoding::Decode::decode(input)?;
        match tag {
            #(#decode_arms)*
            _ => Err(crate::types::encoding::DecodeError::InvalidValue),
        }
    };
    Ok((encode, decode))
}

/// Tags follow Rust's discriminant rules, restricted to `u8`.
fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: u16 = 0;

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => literal_tag(expr)?,
            None => u8::try_from(next).map_err(|_| {
                syn::Error::new_spanned(&variant.ident, "enum has more than 256 variants")
            })?,
        };
        tags.push(tag);
        next = u16::from(tag) + 1;
    }

    Ok(tags)
}

fn literal_tag(expr: &syn::Expr) -> syn::Result<u8> {
    if let syn::Expr::Lit(expr_lit) = expr
        && let syn::Lit::Int(int) = &expr_lit.lit
    {
        return int.base10_parse::<u8>();
    }
    Err(syn::Error::new_spanned(
        expr,
        "discriminant must be an integer literal that fits in u8",
    ))
}
