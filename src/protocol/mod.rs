mod http;
mod parser;
mod types;

pub use http::*;
pub use parser::*;
pub use types::*;
