//! Bit constants describing what the current parse frame is inside of.
//!
//! Handlers consult these to decide which closers, separators, and nested
//! constructs are legal at the head, and set the scratch flags (`HAS_TEXT`,
//! `FAIL_*`) that drive the safety scan for restrictive contexts.

pub const TEMPLATE_NAME: u64 = 1 << 0;
pub const TEMPLATE_PARAM_KEY: u64 = 1 << 1;
pub const TEMPLATE_PARAM_VALUE: u64 = 1 << 2;
pub const TEMPLATE: u64 = TEMPLATE_NAME | TEMPLATE_PARAM_KEY | TEMPLATE_PARAM_VALUE;

pub const ARGUMENT_NAME: u64 = 1 << 3;
pub const ARGUMENT_DEFAULT: u64 = 1 << 4;
pub const ARGUMENT: u64 = ARGUMENT_NAME | ARGUMENT_DEFAULT;

pub const WIKILINK_TITLE: u64 = 1 << 5;
pub const WIKILINK_TEXT: u64 = 1 << 6;
pub const WIKILINK: u64 = WIKILINK_TITLE | WIKILINK_TEXT;

pub const EXT_LINK_URI: u64 = 1 << 7;
pub const EXT_LINK_TITLE: u64 = 1 << 8;
pub const EXT_LINK: u64 = EXT_LINK_URI | EXT_LINK_TITLE;

pub const HEADING_LEVEL_1: u64 = 1 << 9;
pub const HEADING_LEVEL_2: u64 = 1 << 10;
pub const HEADING_LEVEL_3: u64 = 1 << 11;
pub const HEADING_LEVEL_4: u64 = 1 << 12;
pub const HEADING_LEVEL_5: u64 = 1 << 13;
pub const HEADING_LEVEL_6: u64 = 1 << 14;
pub const HEADING: u64 = HEADING_LEVEL_1
    | HEADING_LEVEL_2
    | HEADING_LEVEL_3
    | HEADING_LEVEL_4
    | HEADING_LEVEL_5
    | HEADING_LEVEL_6;

pub const TAG_OPEN: u64 = 1 << 15;
pub const TAG_ATTR: u64 = 1 << 16;
pub const TAG_BODY: u64 = 1 << 17;
pub const TAG_CLOSE: u64 = 1 << 18;
pub const TAG: u64 = TAG_OPEN | TAG_ATTR | TAG_BODY | TAG_CLOSE;

pub const STYLE_ITALICS: u64 = 1 << 19;
pub const STYLE_BOLD: u64 = 1 << 20;
pub const STYLE_PASS_AGAIN: u64 = 1 << 21;
pub const STYLE_SECOND_PASS: u64 = 1 << 22;
pub const STYLE: u64 = STYLE_ITALICS | STYLE_BOLD | STYLE_PASS_AGAIN | STYLE_SECOND_PASS;

pub const DL_TERM: u64 = 1 << 23;

// Scratch flags for the template-name / link-title safety scan.
pub const HAS_TEXT: u64 = 1 << 24;
pub const FAIL_ON_TEXT: u64 = 1 << 25;
pub const FAIL_NEXT: u64 = 1 << 26;
pub const FAIL_ON_LBRACE: u64 = 1 << 27;
pub const FAIL_ON_RBRACE: u64 = 1 << 28;
pub const FAIL_ON_EQUALS: u64 = 1 << 29;
pub const HAS_TEMPLATE: u64 = 1 << 30;
pub const SAFETY_CHECK: u64 = HAS_TEXT
    | FAIL_ON_TEXT
    | FAIL_NEXT
    | FAIL_ON_LBRACE
    | FAIL_ON_RBRACE
    | FAIL_ON_EQUALS
    | HAS_TEMPLATE;

pub const HTML_ENTITY: u64 = 1 << 31;

// Global contexts (tokenizer-wide, not per-frame):
pub const GL_HEADING: u64 = 1 << 0;

// Aggregate contexts:

/// Contexts in which reaching end of input fails the frame.
pub const FAIL: u64 = TEMPLATE | ARGUMENT | WIKILINK | EXT_LINK_TITLE | HEADING | TAG | STYLE;

/// Contexts that run the safety scan on every chunk.
pub const UNSAFE: u64 = TEMPLATE_NAME
    | WIKILINK_TITLE
    | EXT_LINK_TITLE
    | TEMPLATE_PARAM_KEY
    | ARGUMENT_NAME
    | TAG_CLOSE;

/// Contexts that keep a second frame on the stack and must drop it on failure.
pub const DOUBLE: u64 = TEMPLATE_PARAM_KEY | TAG_CLOSE;

pub const NO_WIKILINKS: u64 = TEMPLATE_NAME | ARGUMENT_NAME | WIKILINK_TITLE | EXT_LINK_URI;

pub const NO_EXT_LINKS: u64 = TEMPLATE_NAME | ARGUMENT_NAME | WIKILINK_TITLE | EXT_LINK;

/// Render a context mask as a `|`-joined flag list for debugging.
pub fn describe(context: u64) -> String {
    let contexts = [
        ("TEMPLATE_NAME", TEMPLATE_NAME),
        ("TEMPLATE_PARAM_KEY", TEMPLATE_PARAM_KEY),
        ("TEMPLATE_PARAM_VALUE", TEMPLATE_PARAM_VALUE),
        ("ARGUMENT_NAME", ARGUMENT_NAME),
        ("ARGUMENT_DEFAULT", ARGUMENT_DEFAULT),
        ("WIKILINK_TITLE", WIKILINK_TITLE),
        ("WIKILINK_TEXT", WIKILINK_TEXT),
        ("EXT_LINK_URI", EXT_LINK_URI),
        ("EXT_LINK_TITLE", EXT_LINK_TITLE),
        ("HEADING_LEVEL_1", HEADING_LEVEL_1),
        ("HEADING_LEVEL_2", HEADING_LEVEL_2),
        ("HEADING_LEVEL_3", HEADING_LEVEL_3),
        ("HEADING_LEVEL_4", HEADING_LEVEL_4),
        ("HEADING_LEVEL_5", HEADING_LEVEL_5),
        ("HEADING_LEVEL_6", HEADING_LEVEL_6),
        ("TAG_OPEN", TAG_OPEN),
        ("TAG_ATTR", TAG_ATTR),
        ("TAG_BODY", TAG_BODY),
        ("TAG_CLOSE", TAG_CLOSE),
        ("STYLE_ITALICS", STYLE_ITALICS),
        ("STYLE_BOLD", STYLE_BOLD),
        ("STYLE_PASS_AGAIN", STYLE_PASS_AGAIN),
        ("STYLE_SECOND_PASS", STYLE_SECOND_PASS),
        ("DL_TERM", DL_TERM),
        ("HAS_TEXT", HAS_TEXT),
        ("FAIL_ON_TEXT", FAIL_ON_TEXT),
        ("FAIL_NEXT", FAIL_NEXT),
        ("FAIL_ON_LBRACE", FAIL_ON_LBRACE),
        ("FAIL_ON_RBRACE", FAIL_ON_RBRACE),
        ("FAIL_ON_EQUALS", FAIL_ON_EQUALS),
        ("HAS_TEMPLATE", HAS_TEMPLATE),
        ("HTML_ENTITY", HTML_ENTITY),
    ];

    let mut flags = Vec::new();
    for &(name, value) in &contexts {
        if context & value != 0 {
            flags.push(name);
        }
    }
    flags.join("|")
}
