//! # Accessor Derive
//!
//! This crate provides a derive macro for generating builder-style setters
//! for configuration and request structs.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, GenericArgument, LitBool, PathArguments, Type, TypePath,
    parse_macro_input, spanned::Spanned,
};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `const .with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// - Skipping a field: `#[setters(skip)]`
/// - Optional fields: `#[setters(strip_option)]` on an `Option<T>` field makes
///   the setters take `T` and store `Some(value)`. These setters are not
///   `const`.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Window<T> where T: Default {
///     start: u64,
///     #[setters(strip_option)]
///     hint: Option<u64>,
///     #[setters(skip)]
///     _phantom: T,
/// }
///
/// let mut w = Window { start: 1, hint: None, _phantom: u8::default() };
/// w.set_start(0x1000).set_hint(0x4000);
/// let w = w.with_start(0x2000);
/// assert_eq!(w.start, 0x2000);
/// assert_eq!(w.hint, Some(0x4000));
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(
                    ident.span(),
                    "GenerateSetters does not apply to unit structs",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new(
                ident.span(),
                "GenerateSetters can only be derived for structs",
            )
            .to_compile_error()
            .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = FieldOptions::parse(&field.attrs);
        if opts.skip {
            continue;
        }

        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);
        let set_doc = format!("Sets `{fname}`.");
        let with_doc = format!("Returns `self` with `{fname}` replaced.");

        if opts.strip_option {
            let Some(inner) = option_inner(&field.ty) else {
                return syn::Error::new(field.ty.span(), "strip_option requires an Option<T> field")
                    .to_compile_error()
                    .into();
            };

            methods.push(quote! {
                #[doc = #set_doc]
                #[inline]
                pub fn #set_name(&mut self, value: #inner) -> &mut Self {
                    self.#fname = ::core::option::Option::Some(value);
                    self
                }

                #[doc = #with_doc]
                #[inline]
                #[must_use]
                pub fn #with_name(mut self, value: #inner) -> Self {
                    self.#fname = ::core::option::Option::Some(value);
                    self
                }
            });
            continue;
        }

        let ty = &field.ty;
        methods.push(quote! {
            #[doc = #set_doc]
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[doc = #with_doc]
            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    strip_option: bool,
}

impl FieldOptions {
    fn parse(attrs: &[syn::Attribute]) -> Self {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            // Accept #[setters(skip)], #[setters(skip = true)] and #[setters(strip_option)]
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    if meta.input.is_empty() {
                        opts.skip = true;
                    } else if let Ok(v) = meta.value()?.parse::<LitBool>()
                        && v.value
                    {
                        opts.skip = true;
                    }
                } else if meta.path.is_ident("strip_option") {
                    opts.strip_option = true;
                }
                Ok(())
            });
        }
        opts
    }
}

/// The `T` of an `Option<T>` (also matching `core::option::Option<T>`).
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(TypePath { qself: None, path }) = ty else {
        return None;
    };
    let last = path.segments.last()?;
    if last.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &last.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}
