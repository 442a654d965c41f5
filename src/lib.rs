#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::large_enum_variant,
    clippy::needless_pass_by_value,
    clippy::match_same_arms,
    clippy::too_many_lines,
    clippy::struct_excessive_bools,
    clippy::similar_names
)]

pub mod config;
pub mod engine;
pub mod protocol;
pub mod security;
pub mod server;
pub mod tcop;
pub mod txn;

pub use config::GatewayConfig;
pub use server::Server;
