use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, GenericArgument, LitStr, Path, PathArguments, Type, spanned::Spanned,
};

pub fn derive_shaped(input: DeriveInput) -> TokenStream {
    match expand(input) {
        Ok(expanded) => expanded,
        Err(err) => err.to_compile_error(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "`Shaped` can only be derived for structs",
            ));
        }
    };

    // locate the layout field and how to reach it
    let (access, ty) = match fields {
        Fields::Unnamed(fields_unnamed) => {
            if fields_unnamed.unnamed.len() != 1 {
                return Err(syn::Error::new(
                    fields_unnamed.span(),
                    "tuple structs must have exactly one field",
                ));
            }
            (quote! { self.0 }, &fields_unnamed.unnamed[0].ty)
        }
        Fields::Named(fields_named) => {
            let marked: Vec<_> = fields_named
                .named
                .iter()
                .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("layout")))
                .collect();
            if marked.len() != 1 {
                let msg = match marked.len() {
                    0 => "no field marked with #[layout] attribute",
                    _ => "multiple fields marked with #[layout] attribute",
                };
                return Err(syn::Error::new(fields_named.span(), msg));
            }
            let ident = &marked[0].ident;
            (quote! { self.#ident }, &marked[0].ty)
        }
        Fields::Unit => {
            return Err(syn::Error::new(
                input.span(),
                "unit structs are not supported by `Shaped` derive",
            ));
        }
    };
    let dim = layout_dim(ty)?;

    // parse container attributes
    let mut crate_name = None;
    let mut readonly = false;
    for attr in &input.attrs {
        if !attr.path().is_ident("shaped") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let s: LitStr = meta.value()?.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("readonly") {
                readonly = true;
                Ok(())
            } else {
                Err(meta.error(
                    "unexpected attribute; supported are `crate` and `readonly`",
                ))
            }
        })?;
    }
    let base = match crate_name {
        Some(path) => quote!(#path),
        None => quote!(::memspace),
    };

    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let shaped = quote! {
        impl #impl_generics #base::memory::Shaped<#dim> for #name #ty_generics #where_clause {
            #[inline]
            fn layout(&self) -> &#base::layout::Layout<#dim> {
                &#access
            }
        }
    };
    let shaped_mut = (!readonly).then(|| {
        quote! {
            impl #impl_generics #base::memory::ShapedMut<#dim> for #name #ty_generics #where_clause {
                #[inline]
                unsafe fn layout_mut(&mut self) -> &mut #base::layout::Layout<#dim> {
                    &mut #access
                }
            }
        }
    });

    Ok(quote! {
        #shaped
        #shaped_mut
    })
}

/// Extracts `D` out of a field typed `Layout<D>`.
fn layout_dim(ty: &Type) -> syn::Result<&GenericArgument> {
    let error = || syn::Error::new(ty.span(), "layout field must be of type `Layout<D>`");
    let Type::Path(path) = ty else {
        return Err(error());
    };
    let segment = path.path.segments.last().ok_or_else(error)?;
    if segment.ident != "Layout" {
        return Err(error());
    }
    match &segment.arguments {
        PathArguments::AngleBracketed(args) if args.args.len() == 1 => Ok(&args.args[0]),
        _ => Err(error()),
    }
}
