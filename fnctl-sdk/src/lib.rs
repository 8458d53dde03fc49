//! Helpers for writing `module` functions in Rust, compiled to `wasm32-unknown-unknown`.
//!
//! ```ignore
//! use fnctl_sdk::{Context, Event, handler};
//!
//! handler!(handler, hello);
//!
//! fn hello(event: Event, _context: Context) -> Result<String, std::convert::Infallible> {
//!     Ok(format!("Hello, {}", event.query.get("name").map(String::as_str).unwrap_or("world")))
//! }
//! ```

pub use {
    fnctl_core::{Context, Event, GuestOutput, GuestPayload},
    serde_json::{self, Value, json},
};

pub mod sys;

/// Exports `$symbol` with the handler ABI, calling `$func(event, context)`.
///
/// `$func` returns `Result<impl Serialize, impl Display>`. Errors are reported to the host as
/// handler failures and served as 500.
#[macro_export]
macro_rules! handler {
    ($symbol:ident, $func:path) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn $symbol(ptr: i32, len: i32) -> i64 {
            $crate::sys::invoke(ptr, len, $func)
        }
    };
}
