use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Test budget written as `30`, `secs = 30` or `ms = 500`.
struct TimeoutBudget {
    millis: u64,
}

impl Parse for TimeoutBudget {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                millis: DEFAULT_TIMEOUT_MS,
            });
        }

        let (unit, lit) = if input.peek(Ident) {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            (Some(unit), input.parse::<LitInt>()?)
        } else {
            (None, input.parse::<LitInt>()?)
        };
        let value: u64 = lit.base10_parse()?;
        if value == 0 {
            return Err(syn::Error::new_spanned(&lit, "timeout must be greater than zero"));
        }

        let millis = match unit {
            None => value.saturating_mul(1_000),
            Some(unit) if unit == "secs" => value.saturating_mul(1_000),
            Some(unit) if unit == "ms" => value,
            Some(unit) => {
                return Err(syn::Error::new_spanned(
                    unit,
                    "expected `secs = N` or `ms = N`",
                ))
            }
        };
        Ok(Self { millis })
    }
}

/// Runs an async test on its own current-thread runtime and fails it once the
/// budget runs out, even if the future never yields.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutBudget { millis } = parse_macro_input!(attr as TimeoutBudget);

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_millis(#millis);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Grace period so the in-runtime timeout reports first when it can.
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_millis(250)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
