use proc_macro::TokenStream;
use quote::quote;
use syn::{Error, FnArg, ItemFn, ReturnType, parse_macro_input};

extern crate proc_macro;

/// Turns `async fn name(ctx: &mut UserContext) -> ActionResult { .. }` into a plain
/// function returning a boxed future, which is what task actions and hooks take.
///
/// ```ignore
/// #[action]
/// async fn list_products(ctx: &mut UserContext) -> ActionResult {
///     ctx.request("GET /api/products", Request::get("/api/products")).await?;
///     Ok(())
/// }
///
/// let task = TaskSpec::new("GET /api/products", list_products).with_weight(3);
/// ```
#[proc_macro_attribute]
pub fn action(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemFn);
    match expand_action(ast) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand_action(ast: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = ast;

    if sig.asyncness.is_none() {
        return Err(Error::new_spanned(
            sig.fn_token,
            "#[action] expects an `async fn`",
        ));
    }
    if sig.inputs.len() != 1 || !matches!(sig.inputs.first(), Some(FnArg::Typed(_))) {
        return Err(Error::new_spanned(
            &sig.inputs,
            "#[action] functions take exactly one argument: `&mut UserContext`",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &sig.generics,
            "#[action] functions cannot be generic",
        ));
    }
    let output = match &sig.output {
        ReturnType::Type(_, ty) => ty,
        ReturnType::Default => {
            return Err(Error::new_spanned(
                &sig,
                "#[action] functions must return `ActionResult`",
            ));
        }
    };

    let name = &sig.ident;
    let inputs = &sig.inputs;
    Ok(quote! {
        #(#attrs)*
        #vis fn #name(#inputs) -> ::stampede::BoxFuture<'_, #output> {
            ::std::boxed::Box::pin(async move #block)
        }
    })
}
