extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, parse_macro_input};

/// Field bindings for a set of fields, named after the field for named fields and `fieldN` for
/// tuple fields. Returned alongside the field types.
fn bindings(fields: &Fields) -> Vec<(Ident, &syn::Type)> {
    match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .map(|f| (f.ident.clone().expect("named field"), &f.ty))
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, f)| (format_ident!("field{}", i), &f.ty))
            .collect(),
        Fields::Unit => vec![],
    }
}

/// Pattern (or constructor) for a set of fields using the bindings from `bindings`.
fn destructure(path: TokenStream2, fields: &Fields, names: &[Ident]) -> TokenStream2 {
    match fields {
        Fields::Named(_) => quote! { #path { #(#names),* } },
        Fields::Unnamed(_) => quote! { #path ( #(#names),* ) },
        Fields::Unit => quote! { #path },
    }
}

#[proc_macro_derive(Encode)]
pub fn encode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let body = match input.data {
        Data::Struct(data) => {
            let fields = bindings(&data.fields);
            let names: Vec<_> = fields.iter().map(|(n, _)| n.clone()).collect();
            let pattern = destructure(quote! { Self }, &data.fields, &names);

            quote! {
                let #pattern = self;
                let mut encoder = crate::storage::encdec::EncodeBuilder::new();
                #( encoder = encoder.append(#names); )*
                encoder.build()
            }
        }
        Data::Enum(data_enum) => {
            if data_enum.variants.len() > u8::MAX as usize {
                return syn::Error::new_spanned(name, "Encode supports at most 255 variants")
                    .to_compile_error()
                    .into();
            }

            let arms = data_enum.variants.iter().enumerate().map(|(index, variant)| {
                let variant_name = &variant.ident;
                let kind = index as u8;
                let fields = bindings(&variant.fields);
                let names: Vec<_> = fields.iter().map(|(n, _)| n.clone()).collect();
                let pattern = destructure(quote! { Self::#variant_name }, &variant.fields, &names);

                quote! {
                    #pattern => {
                        let mut encoder = crate::storage::encdec::EncodeBuilder::new().append(&#kind);
                        #( encoder = encoder.append(#names); )*
                        encoder.build()
                    }
                }
            });

            quote! {
                match self {
                    #(#arms),*
                }
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(name, "Encode only supports structs and enums")
                .to_compile_error()
                .into();
        }
    };

    quote! {
        impl crate::storage::encdec::Encode for #name {
            fn encode(&self) -> Vec<u8> {
                #body
            }
        }
    }
    .into()
}

#[proc_macro_derive(Decode)]
pub fn decode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let decode_fields = |fields: &Fields| {
        let fields = bindings(fields);
        let steps = fields.iter().map(|(field_name, field_ty)| {
            quote! {
                let (#field_name, bytes) =
                    <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
            }
        });
        let names: Vec<_> = fields.iter().map(|(n, _)| n.clone()).collect();

        (quote! { #(#steps)* }, names)
    };

    let body = match input.data {
        Data::Struct(data) => {
            let (steps, names) = decode_fields(&data.fields);
            let constructor = destructure(quote! { Self }, &data.fields, &names);

            quote! {
                #steps
                Ok((#constructor, bytes))
            }
        }
        Data::Enum(data_enum) => {
            let arms = data_enum.variants.iter().enumerate().map(|(index, variant)| {
                let variant_name = &variant.ident;
                let kind = index as u8;
                let (steps, names) = decode_fields(&variant.fields);
                let constructor =
                    destructure(quote! { Self::#variant_name }, &variant.fields, &names);

                quote! {
                    #kind => {
                        #steps
                        Ok((#constructor, bytes))
                    }
                }
            });

            quote! {
                let (kind, bytes) = match bytes.split_first() {
                    Some((kind, rest)) => (*kind, rest),
                    None => {
                        return Err(crate::storage::encdec::DecodingError::MalformedInput(
                            "enum insufficient bytes".to_string(),
                            bytes.to_vec(),
                        ))
                    }
                };

                match kind {
                    #(#arms)*
                    _ => Err(crate::storage::encdec::DecodingError::InvalidEnumKind(vec![kind])),
                }
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(name, "Decode only supports structs and enums")
                .to_compile_error()
                .into();
        }
    };

    quote! {
        impl crate::storage::encdec::Decode for #name {
            fn decode(bytes: &[u8]) -> crate::storage::encdec::DecodingResult<'_, Self> {
                #body
            }
        }
    }
    .into()
}
