pub mod api;
pub mod document;
pub mod engines;
pub mod error;
pub mod media;
pub mod sync;
pub mod utils;
pub mod worker;

use std::env;

use once_cell::sync::Lazy;

const DEFAULT_LOG_DIR: &str = "./logs";

pub static LOG_DIR: Lazy<String> = Lazy::new(|| match env::var("SCRIBE_LOG_DIR") {
    Ok(dir) => dir,
    Err(_) => dotenv::var("SCRIBE_LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()),
});

pub fn init_env() {
    dotenv::dotenv().ok();
}
