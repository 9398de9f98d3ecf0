#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating hundreds of pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in timestamp/size handling
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod platform;
pub mod relay;
pub mod signature;
pub mod store;
pub mod thread;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
