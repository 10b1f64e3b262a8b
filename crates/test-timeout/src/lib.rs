use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Runs an async test on a current-thread runtime whose clock starts paused.
///
/// Timers advance instantly whenever the runtime is idle, so reconnect
/// backoffs and poll intervals elapse without real waiting. The body is
/// bounded twice: by a virtual-time `tokio::time::timeout` and by a
/// wall-clock guard on the spawning thread, which catches a test that spins
/// without ever yielding to the timer wheel.
///
/// The test crate must enable tokio's `test-util` feature.
#[proc_macro_attribute]
pub fn tokio_paused_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs: u64 = 30;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        timeout_secs = match lit.base10_parse() {
            Ok(0) => {
                return syn::Error::new_spanned(&lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(value) => value,
            Err(err) => return err.to_compile_error().into(),
        };
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_paused_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_harness_attribute(attr))
        .collect();

    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let virtual_budget = std::time::Duration::from_secs(#timeout_secs);
            let wall_budget = virtual_budget + std::time::Duration::from_secs(5);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .start_paused(true)
                            .build()
                            .expect("failed to build paused Tokio runtime");
                        runtime.block_on(async {
                            tokio::time::timeout(virtual_budget, async move #block)
                                .await
                                .expect("test exceeded its virtual time budget");
                        });
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(wall_budget) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test {} did not finish within {:?} of wall time", #name, wall_budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the expansion owns the harness attribute.
fn is_test_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
