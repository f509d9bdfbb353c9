//! A tokenizer for wikitext, the markup language of MediaWiki-style wikis.
//!
//! The tokenizer turns a string of wikitext into a flat, ordered token
//! stream covering templates, template arguments, wikilinks, external
//! links, headings, HTML tags, comments, and character entities. Malformed
//! markup is never an error: anything that cannot be closed under the rules
//! of its enclosing construct is rolled back and re-emitted as literal
//! text, so concatenating every token's source span reproduces the input
//! exactly.
//!
//! ```
//! use wikitok::{tokenize, Token};
//!
//! let tokens = tokenize("{{foo|bar}}").unwrap();
//! assert_eq!(tokens[0], Token::TemplateOpen);
//! assert_eq!(tokens[1], Token::text("foo"));
//! ```

mod contexts;
pub mod definitions;
mod tokenizer;
mod tokens;

pub use tokenizer::{Tokenizer, TokenizerError};
pub use tokens::Token;

/// Tokenize a string of wikitext into a flat token stream.
///
/// Ill-formed markup becomes literal text rather than an error; the error
/// type only covers internal invariant breakage.
pub fn tokenize(input: &str) -> Result<Vec<Token>, TokenizerError> {
    let mut tokenizer = Tokenizer::new();
    tokenizer.tokenize(input, 0, false)
}
