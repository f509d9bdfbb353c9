//! The token vocabulary emitted by the tokenizer.
//!
//! One variant per token kind; each variant carries exactly the attributes
//! that kind has. Optional strings are `Option<String>` so that an absent
//! attribute is distinguishable from an empty one.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Token {
    Text { text: String },

    TemplateOpen,
    TemplateParamSeparator,
    TemplateParamEquals,
    TemplateClose,

    ArgumentOpen,
    ArgumentSeparator,
    ArgumentClose,

    WikilinkOpen,
    WikilinkSeparator,
    WikilinkClose,

    ExternalLinkOpen { brackets: bool },
    ExternalLinkSeparator,
    ExternalLinkClose,

    HTMLEntityStart,
    HTMLEntityNumeric { hexadecimal: bool },
    HTMLEntityEnd,

    HeadingStart { level: u8 },
    HeadingEnd,

    CommentStart,
    CommentEnd,

    TagOpenOpen { wiki_markup: Option<String> },
    TagAttrStart { pad_first: String, pad_before_eq: String, pad_after_eq: String },
    TagAttrEquals,
    TagAttrQuote { char: String },
    TagCloseOpen { padding: Option<String>, wiki_markup: Option<String> },
    TagCloseSelfclose { padding: Option<String>, implicit: bool, wiki_markup: Option<String> },
    TagOpenClose,
    TagCloseClose,
}

impl Token {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Token::Text { text: text.into() }
    }

    /// The text payload, if this is a `Text` token.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Token::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Token::Text { .. })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Text { text } => write!(f, "Text(text={:?})", text),
            Token::ExternalLinkOpen { brackets } => {
                write!(f, "ExternalLinkOpen(brackets={})", brackets)
            }
            Token::HTMLEntityNumeric { hexadecimal } => {
                write!(f, "HTMLEntityNumeric(hexadecimal={})", hexadecimal)
            }
            Token::HeadingStart { level } => write!(f, "HeadingStart(level={})", level),
            Token::TagOpenOpen { wiki_markup } => {
                write!(f, "TagOpenOpen(wiki_markup={:?})", wiki_markup)
            }
            Token::TagAttrStart { pad_first, pad_before_eq, pad_after_eq } => write!(
                f,
                "TagAttrStart(pad_first={:?}, pad_before_eq={:?}, pad_after_eq={:?})",
                pad_first, pad_before_eq, pad_after_eq
            ),
            Token::TagAttrQuote { char } => write!(f, "TagAttrQuote(char={:?})", char),
            Token::TagCloseOpen { padding, wiki_markup } => {
                write!(f, "TagCloseOpen(padding={:?}, wiki_markup={:?})", padding, wiki_markup)
            }
            Token::TagCloseSelfclose { padding, implicit, wiki_markup } => write!(
                f,
                "TagCloseSelfclose(padding={:?}, implicit={}, wiki_markup={:?})",
                padding, implicit, wiki_markup
            ),
            other => {
                // Variants without attributes print as a bare kind name.
                let name = match other {
                    Token::TemplateOpen => "TemplateOpen",
                    Token::TemplateParamSeparator => "TemplateParamSeparator",
                    Token::TemplateParamEquals => "TemplateParamEquals",
                    Token::TemplateClose => "TemplateClose",
                    Token::ArgumentOpen => "ArgumentOpen",
                    Token::ArgumentSeparator => "ArgumentSeparator",
                    Token::ArgumentClose => "ArgumentClose",
                    Token::WikilinkOpen => "WikilinkOpen",
                    Token::WikilinkSeparator => "WikilinkSeparator",
                    Token::WikilinkClose => "WikilinkClose",
                    Token::ExternalLinkSeparator => "ExternalLinkSeparator",
                    Token::ExternalLinkClose => "ExternalLinkClose",
                    Token::HTMLEntityStart => "HTMLEntityStart",
                    Token::HTMLEntityEnd => "HTMLEntityEnd",
                    Token::HeadingEnd => "HeadingEnd",
                    Token::CommentStart => "CommentStart",
                    Token::CommentEnd => "CommentEnd",
                    Token::TagAttrEquals => "TagAttrEquals",
                    Token::TagOpenClose => "TagOpenClose",
                    Token::TagCloseClose => "TagCloseClose",
                    _ => unreachable!(),
                };
                f.write_str(name)
            }
        }
    }
}
