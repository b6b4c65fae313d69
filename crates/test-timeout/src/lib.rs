use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `(secs)`, `(paused)` or `(secs, paused)`; every part optional.
struct TimeoutArgs {
    secs: u64,
    paused: Option<Ident>,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: None,
        };
        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new(
                        lit.span(),
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            } else if lookahead.peek(Ident) {
                let ident: Ident = input.parse()?;
                if ident != "paused" {
                    return Err(syn::Error::new(
                        ident.span(),
                        "unknown option, expected `paused`",
                    ));
                }
                args.paused = Some(ident);
            } else {
                return Err(lookahead.error());
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

/// Runs `body` on a helper thread and fails the test if it has not reported
/// back within `secs`. Panics inside the body are forwarded unchanged.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}

/// Async test on a current-thread Tokio runtime with a watchdog. Pass
/// `paused` to start the runtime clock paused (requires tokio `test-util`).
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["tokio", "test"]))
        .collect();

    let start_paused = args.paused.is_some();
    let secs = args.secs;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(#start_paused)
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let guarded = watchdog(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

/// Synchronous test with a watchdog.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    if let Some(paused) = args.paused {
        return syn::Error::new(paused.span(), "`paused` only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["test"]))
        .collect();

    let guarded = watchdog(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}
