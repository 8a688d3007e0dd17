//! `#[deadline]` turns a sync or async function into a `#[test]` that fails
//! instead of hanging when it runs past its budget.
//!
//! ```ignore
//! #[test_deadline::deadline]
//! fn parses() { /* ... */ }
//!
//! #[test_deadline::deadline(5)]
//! async fn negotiates() { /* ... */ }
//! ```
//!
//! Async bodies run on a fresh current-thread tokio runtime. Every body runs
//! on its own thread so a body that blocks the runtime still trips the
//! deadline.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn deadline(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = if attr.is_empty() {
        DEFAULT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "deadline must be at least one second")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if !sig.inputs.is_empty() {
        return syn::Error::new_spanned(&sig.inputs, "deadline tests take no arguments")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();

    let body: TokenStream2 = if sig.asyncness.take().is_some() {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build test runtime")
                .block_on(async move #block)
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body;
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s deadline", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Strips `#[test]` and `#[tokio::test]` so the generated wrapper is the only
/// test entry point.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
