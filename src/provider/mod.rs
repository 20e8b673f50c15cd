mod anthropic;
#[cfg(test)]
pub(crate) mod mock;
mod traits;

pub use anthropic::AnthropicEngine;
pub use traits::*;
