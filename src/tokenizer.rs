//! The tokenizer: a context-sensitive state machine over marker-split
//! chunks of wikitext, with speculative descent and rollback.
//!
//! Each open construct gets its own frame (token stack, context mask,
//! textbuffer). When a construct cannot be closed under the rules of its
//! context, the frame is discarded, the cursor is restored, and the opener
//! is re-emitted as literal text so the interior re-tokenizes in the parent
//! context. Routes that failed once are memoized by `(head, context)` and
//! refused immediately on the next attempt.

use std::collections::HashSet;

use either::Either;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::contexts;
use crate::definitions;
use crate::tokens::Token;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenizerError {
    #[error("no valid parse route from context {0:#x}")]
    BadRoute(u64),
    #[error("unexpected TagCloseSelfclose while closing a single tag")]
    UnexpectedTagCloseSelfclose,
    #[error("missed TagCloseOpen while closing a single tag")]
    MissedTagCloseOpen,
    #[error("tokenizer finished with {0} frame(s) still on the stack")]
    NonEmptyExitStack(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Start,
    End,
}

/// A unit of input: either a chunk of text (a marker character or a run of
/// non-marker characters) or one of the two stream boundaries.
type Chunk = Either<String, Sentinel>;

trait ChunkExt {
    fn is(&self, s: &str) -> bool;
    fn text(&self) -> Option<&str>;
    fn is_end(&self) -> bool;
}

impl ChunkExt for Chunk {
    fn is(&self, s: &str) -> bool {
        matches!(self, Either::Left(t) if t == s)
    }

    fn text(&self) -> Option<&str> {
        match self {
            Either::Left(t) => Some(t),
            Either::Right(_) => None,
        }
    }

    fn is_end(&self) -> bool {
        matches!(self, Either::Right(Sentinel::End))
    }
}

/// The characters the input is split on. Every structural decision is made
/// by looking at these one at a time; everything between them is plain text.
const MARKERS: &[&str] = &[
    "{", "}", "[", "]", "<", ">", "|", "=", "&", "'", "\"", "#", "*", ";", ":", "\\", "/", "-",
    "!", "\n",
];

static MARKER_SPLITTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r##"[{}\[\]<>|=&'"#*;:\\/\-!\n]"##).unwrap());

/// Splits whitespace runs, quotes, and backslashes out of open-tag chunks.
static TAG_SPLITTER: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\s"'\\]+"#).unwrap());

const URISCHEME: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+.-";

const MAX_DEPTH: usize = 100;

/// Split `text` into the pieces between matches plus the matches themselves,
/// in order. Empty pieces are kept and filtered by the caller.
fn split_keeping_matches<'t>(re: &Regex, text: &'t str) -> Vec<&'t str> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in re.find_iter(text) {
        pieces.push(&text[last..m.start()]);
        pieces.push(m.as_str());
        last = m.end();
    }
    pieces.push(&text[last..]);
    pieces
}

fn is_marker(chunk: &Chunk) -> bool {
    match chunk {
        Either::Left(s) => MARKERS.contains(&s.as_str()),
        Either::Right(_) => true,
    }
}

fn is_line_start(chunk: &Chunk) -> bool {
    matches!(chunk, Either::Right(Sentinel::Start)) || chunk.is("\n")
}

bitflags::bitflags! {
    /// Micro-states of the open-tag attribute scanner.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct TagOpenContext: u8 {
        const CX_NAME = 1 << 0;
        const CX_ATTR_READY = 1 << 1;
        const CX_ATTR_NAME = 1 << 2;
        const CX_ATTR_VALUE = 1 << 3;
        const CX_QUOTED = 1 << 4;
        const CX_NOTE_SPACE = 1 << 5;
        const CX_NOTE_EQUALS = 1 << 6;
        const CX_NOTE_QUOTE = 1 << 7;
    }
}

/// Scratch state while scanning an open tag (`<name attr="value">`).
struct TagOpenData {
    context: TagOpenContext,
    pad_first: String,
    pad_before_eq: String,
    pad_after_eq: String,
    quoter: Option<String>,
    reset: i64,
}

impl TagOpenData {
    fn new() -> Self {
        TagOpenData {
            context: TagOpenContext::CX_NAME,
            pad_first: String::new(),
            pad_before_eq: String::new(),
            pad_after_eq: String::new(),
            quoter: None,
            reset: 0,
        }
    }
}

/// One suspended parse: the tokens produced so far, the context mask, the
/// pending text run, and the `(head, context)` identity used for route
/// memoization.
#[derive(Debug)]
struct Stack {
    tokens: Vec<Token>,
    context: u64,
    textbuffer: Vec<String>,
    ident: (i64, u64),
}

pub struct Tokenizer {
    text: Vec<String>,
    head: i64,
    stacks: Vec<Stack>,
    global: u64,
    depth: usize,
    heading_level: usize,
    bad_routes: HashSet<(i64, u64)>,
    skip_style_tags: bool,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer {
            text: Vec::new(),
            head: 0,
            stacks: Vec::new(),
            global: 0,
            depth: 0,
            heading_level: 0,
            bad_routes: HashSet::new(),
            skip_style_tags: false,
        }
    }

    fn stack(&self) -> &Vec<Token> {
        &self.stacks.last().expect("no active frame").tokens
    }

    fn stack_mut(&mut self) -> &mut Vec<Token> {
        &mut self.stacks.last_mut().expect("no active frame").tokens
    }

    fn context(&self) -> u64 {
        self.stacks.last().expect("no active frame").context
    }

    fn context_mut(&mut self) -> &mut u64 {
        &mut self.stacks.last_mut().expect("no active frame").context
    }

    fn textbuffer(&self) -> &Vec<String> {
        &self.stacks.last().expect("no active frame").textbuffer
    }

    fn textbuffer_mut(&mut self) -> &mut Vec<String> {
        &mut self.stacks.last_mut().expect("no active frame").textbuffer
    }

    fn stack_ident(&self) -> (i64, u64) {
        self.stacks.last().expect("no active frame").ident
    }

    /// Add a new frame (token stack, context, textbuffer) to the list,
    /// refusing routes that are already known to be bad.
    fn push(&mut self, context: u64) -> Result<(), TokenizerError> {
        let ident = (self.head, context);
        if self.bad_routes.contains(&ident) {
            return Err(TokenizerError::BadRoute(context));
        }
        self.stacks.push(Stack {
            tokens: Vec::new(),
            context,
            textbuffer: Vec::new(),
            ident,
        });
        self.depth += 1;
        Ok(())
    }

    /// Flush the textbuffer onto the stack as a single `Text` token.
    fn push_textbuffer(&mut self) {
        if self.textbuffer().is_empty() {
            return;
        }
        let buffer = std::mem::take(self.textbuffer_mut());
        let joined = buffer.concat();
        if !joined.is_empty() {
            self.stack_mut().push(Token::Text { text: joined });
        }
    }

    /// Pop the current frame, returning its token stack.
    fn pop(&mut self) -> Vec<Token> {
        self.push_textbuffer();
        self.depth -= 1;
        self.stacks.pop().map(|s| s.tokens).unwrap_or_default()
    }

    /// Whether opening another construct would exceed the depth ceiling.
    fn can_recurse(&self) -> bool {
        self.depth < MAX_DEPTH
    }

    /// Remember that the current route (head + context at push time) is
    /// invalid, so `push` can refuse it immediately next time.
    fn memoize_bad_route(&mut self) {
        let ident = self.stack_ident();
        self.bad_routes.insert(ident);
    }

    /// Fail the current route: discard the frame and produce the error the
    /// caller should return.
    #[must_use]
    fn fail_route(&mut self) -> TokenizerError {
        let context = self.context();
        self.memoize_bad_route();
        self.pop();
        TokenizerError::BadRoute(context)
    }

    /// Write a token to the end of the current token stack.
    fn emit(&mut self, token: Token) {
        self.push_textbuffer();
        self.stack_mut().push(token);
    }

    /// Write a token to the beginning of the current token stack.
    fn emit_first(&mut self, token: Token) {
        self.push_textbuffer();
        self.stack_mut().insert(0, token);
    }

    /// Write text to the current textbuffer.
    fn emit_text(&mut self, text: impl Into<String>) {
        self.textbuffer_mut().push(text.into());
    }

    /// Write a series of tokens to the current stack at once, merging a
    /// leading `Text` token into the textbuffer so adjacent text coalesces.
    fn emit_all(&mut self, mut tokenlist: Vec<Token>) {
        if matches!(tokenlist.first(), Some(Token::Text { .. })) {
            if let Token::Text { text } = tokenlist.remove(0) {
                self.emit_text(text);
            }
        }
        self.push_textbuffer();
        self.stack_mut().extend(tokenlist);
    }

    /// Pop the current frame, write *text*, and then write the frame's
    /// tokens after it. Used when an opener turns out to be literal.
    fn emit_text_then_stack(&mut self, text: impl Into<String>) {
        let stack = self.pop();
        self.emit_text(text);
        if !stack.is_empty() {
            self.emit_all(stack);
        }
        self.head -= 1;
    }

    /// Read the chunk *delta* places from the head.
    fn read(&self, delta: i64) -> Chunk {
        let index = self.head + delta;
        if index < 0 {
            return Either::Right(Sentinel::Start);
        }
        match self.text.get(index as usize) {
            Some(text) => Either::Left(text.clone()),
            None => Either::Right(Sentinel::End),
        }
    }

    /// Read the chunk at the head, failing the route at end of input.
    fn read_strict(&mut self) -> Result<String, TokenizerError> {
        match self.read(0) {
            Either::Left(text) => Ok(text),
            Either::Right(_) => Err(self.fail_route()),
        }
    }

    /// Parse a template at the head of the wikicode string.
    fn parse_template(&mut self, has_content: bool) -> Result<(), TokenizerError> {
        let reset = self.head;
        let mut context = contexts::TEMPLATE_NAME;
        if has_content {
            context |= contexts::HAS_TEMPLATE;
        }
        match self.parse(context, true) {
            Ok(template) => {
                self.emit_first(Token::TemplateOpen);
                self.emit_all(template);
                self.emit(Token::TemplateClose);
                Ok(())
            }
            Err(e) => {
                self.head = reset;
                Err(e)
            }
        }
    }

    /// Parse an argument at the head of the wikicode string.
    fn parse_argument(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head;
        match self.parse(contexts::ARGUMENT_NAME, true) {
            Ok(argument) => {
                self.emit_first(Token::ArgumentOpen);
                self.emit_all(argument);
                self.emit(Token::ArgumentClose);
                Ok(())
            }
            Err(e) => {
                self.head = reset;
                Err(e)
            }
        }
    }

    /// Parse a template or argument at the head. A run of N braces is split
    /// greedily: arguments consume three, templates two, and a leftover
    /// single brace joins the preceding literal text.
    fn parse_template_or_argument(&mut self) -> Result<(), TokenizerError> {
        self.head += 2;
        let mut braces: usize = 2;
        while self.read(0).is("{") {
            self.head += 1;
            braces += 1;
        }
        let mut has_content = false;
        self.push(0)?;

        while braces > 0 {
            if braces == 1 {
                self.emit_text_then_stack("{");
                return Ok(());
            }
            if braces == 2 {
                match self.parse_template(has_content) {
                    Ok(()) => {}
                    Err(TokenizerError::BadRoute(_)) => {
                        self.emit_text_then_stack("{{");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                break;
            }
            match self.parse_argument() {
                Ok(()) => braces -= 3,
                Err(TokenizerError::BadRoute(_)) => match self.parse_template(has_content) {
                    Ok(()) => braces -= 2,
                    Err(TokenizerError::BadRoute(_)) => {
                        self.emit_text_then_stack("{".repeat(braces));
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
            if braces > 0 {
                has_content = true;
                self.head += 1;
            }
        }

        let tmp = self.pop();
        self.emit_all(tmp);
        if self.context() & contexts::FAIL_NEXT != 0 {
            *self.context_mut() ^= contexts::FAIL_NEXT;
        }
        Ok(())
    }

    /// Handle a template parameter separator (`|`) at the head.
    fn handle_template_param(&mut self) -> Result<(), TokenizerError> {
        if self.context() & contexts::TEMPLATE_NAME != 0 {
            if self.context() & (contexts::HAS_TEXT | contexts::HAS_TEMPLATE) == 0 {
                return Err(self.fail_route());
            }
            *self.context_mut() ^= contexts::TEMPLATE_NAME;
        } else if self.context() & contexts::TEMPLATE_PARAM_VALUE != 0 {
            *self.context_mut() ^= contexts::TEMPLATE_PARAM_VALUE;
        } else {
            let tmp = self.pop();
            self.emit_all(tmp);
        }
        *self.context_mut() |= contexts::TEMPLATE_PARAM_KEY;
        self.emit(Token::TemplateParamSeparator);
        self.push(self.context())?;
        Ok(())
    }

    /// Handle the first equals sign in a template parameter.
    fn handle_template_param_value(&mut self) {
        let tmp = self.pop();
        self.emit_all(tmp);
        *self.context_mut() ^= contexts::TEMPLATE_PARAM_KEY;
        *self.context_mut() |= contexts::TEMPLATE_PARAM_VALUE;
        self.emit(Token::TemplateParamEquals);
    }

    /// Handle the end of a template at the head of the string.
    fn handle_template_end(&mut self) -> Result<Vec<Token>, TokenizerError> {
        if self.context() & contexts::TEMPLATE_NAME != 0 {
            if self.context() & (contexts::HAS_TEXT | contexts::HAS_TEMPLATE) == 0 {
                return Err(self.fail_route());
            }
        } else if self.context() & contexts::TEMPLATE_PARAM_KEY != 0 {
            let tmp = self.pop();
            self.emit_all(tmp);
        }
        self.head += 1;
        Ok(self.pop())
    }

    /// Handle the separator between an argument's name and default.
    fn handle_argument_separator(&mut self) {
        *self.context_mut() ^= contexts::ARGUMENT_NAME;
        *self.context_mut() |= contexts::ARGUMENT_DEFAULT;
        self.emit(Token::ArgumentSeparator);
    }

    /// Handle the end of an argument at the head of the string.
    fn handle_argument_end(&mut self) -> Vec<Token> {
        self.head += 2;
        self.pop()
    }

    /// Parse an internal wikilink at the head of the wikicode string.
    fn parse_wikilink(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head + 1;
        self.head += 2;
        // A wikilink that opens like `[[http://…` is really a bracketed
        // external link behind a literal bracket; try that reading first.
        match self.really_parse_external_link(true) {
            Ok((link, _extra)) => {
                if self.context() & contexts::EXT_LINK_TITLE != 0 {
                    self.head = reset;
                    self.emit_text("[[");
                    return Ok(());
                }
                self.emit_text("[");
                self.emit(Token::ExternalLinkOpen { brackets: true });
                self.emit_all(link);
                self.emit(Token::ExternalLinkClose);
                Ok(())
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset + 1;
                match self.parse(contexts::WIKILINK_TITLE, true) {
                    Ok(wikilink) => {
                        self.emit(Token::WikilinkOpen);
                        self.emit_all(wikilink);
                        self.emit(Token::WikilinkClose);
                    }
                    Err(TokenizerError::BadRoute(_)) => {
                        self.head = reset;
                        self.emit_text("[[");
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_wikilink_separator(&mut self) {
        *self.context_mut() ^= contexts::WIKILINK_TITLE;
        *self.context_mut() |= contexts::WIKILINK_TEXT;
        self.emit(Token::WikilinkSeparator);
    }

    fn handle_wikilink_end(&mut self) -> Vec<Token> {
        self.head += 1;
        self.pop()
    }

    /// Parse the URI scheme of a bracket-enclosed external link.
    fn parse_bracketed_uri_scheme(&mut self) -> Result<(), TokenizerError> {
        self.push(contexts::EXT_LINK_URI)?;
        if self.read(0).is("/") && self.read(1).is("/") {
            self.emit_text("//");
            self.head += 2;
        } else {
            let mut scheme = String::new();
            while let Some(this) = self.read(0).text().map(str::to_string) {
                if !this.chars().all(|c| URISCHEME.contains(c)) {
                    break;
                }
                scheme.push_str(&this);
                self.emit_text(this);
                self.head += 1;
            }
            if !self.read(0).is(":") {
                return Err(self.fail_route());
            }
            self.emit_text(":");
            self.head += 1;
            let slashes = self.read(0).is("/") && self.read(1).is("/");
            if slashes {
                self.emit_text("//");
                self.head += 2;
            }
            if !definitions::is_scheme(&scheme, slashes) {
                return Err(self.fail_route());
            }
        }
        Ok(())
    }

    /// Parse the URI scheme of a free (no brackets) external link. The
    /// scheme was already tokenized as text, so backtrack through the
    /// textbuffer to recover it. Fails by returning `BadRoute` directly:
    /// nothing has been pushed yet, so there is no frame to discard.
    fn parse_free_uri_scheme(&mut self) -> Result<(), TokenizerError> {
        let mut scheme = String::new();
        'backtrack: for chunk in self.textbuffer().iter().rev() {
            for ch in chunk.chars().rev() {
                if !ch.is_alphanumeric() && !"+-.".contains(ch) {
                    break 'backtrack;
                }
                if !URISCHEME.contains(ch) {
                    return Err(TokenizerError::BadRoute(self.context()));
                }
                scheme.insert(0, ch);
            }
        }
        let slashes = self.read(0).is("/") && self.read(1).is("/");
        if !definitions::is_scheme(&scheme, slashes) {
            return Err(TokenizerError::BadRoute(self.context()));
        }
        self.push(self.context() | contexts::EXT_LINK_URI)?;
        self.emit_text(scheme);
        self.emit_text(":");
        if slashes {
            self.emit_text("//");
            self.head += 2;
        }
        Ok(())
    }

    /// Handle text in a free external link, deferring trailing punctuation
    /// until something structural proves the URL continues.
    fn handle_free_link_text(&mut self, punct: &mut String, tail: &mut String, this: &str) {
        if this.contains('(') && punct.contains(')') {
            punct.retain(|c| c != ')');
        }
        // Find the longest all-punctuation suffix.
        let mut split = this.len();
        for (i, ch) in this.char_indices().rev() {
            if punct.contains(ch) {
                split = i;
            } else {
                break;
            }
        }
        let (stripped, punct_tail) = this.split_at(split);
        if !punct_tail.is_empty() {
            if !stripped.is_empty() && !tail.is_empty() {
                let pending = std::mem::take(tail);
                self.emit_text(pending);
            }
            tail.push_str(punct_tail);
            self.emit_text(stripped.to_string());
        } else {
            if !tail.is_empty() {
                let pending = std::mem::take(tail);
                self.emit_text(pending);
            }
            self.emit_text(this.to_string());
        }
    }

    /// Return whether the current head is the end of a URI.
    fn is_uri_end(&self, this: &Chunk, nxt: &Chunk) -> bool {
        if this.is_end() {
            return true;
        }
        let Some(s) = this.text() else {
            return true;
        };
        let after = self.read(2);
        let ctx = self.context();
        matches!(s, "\n" | "[" | "]" | "<" | ">" | "\"")
            || s.contains(' ')
            || (s == "'" && nxt.is("'"))
            || (s == "|" && ctx & contexts::TEMPLATE != 0)
            || (s == "=" && ctx & (contexts::TEMPLATE_PARAM_KEY | contexts::HEADING) != 0)
            || (s == "}" && nxt.is("}") && ctx & contexts::TEMPLATE != 0)
            || (s == "}" && nxt.is("}") && after.is("}") && ctx & contexts::ARGUMENT != 0)
    }

    /// Really parse an external link, assuming the head is past the opening
    /// bracket (bracketed) or at the scheme's colon (free).
    fn really_parse_external_link(
        &mut self,
        brackets: bool,
    ) -> Result<(Vec<Token>, Option<String>), TokenizerError> {
        let (invalid, mut punct): (&[char], String) = if brackets {
            self.parse_bracketed_uri_scheme()?;
            (&['\n', ' ', ']'][..], String::new())
        } else {
            self.parse_free_uri_scheme()?;
            (&['\n', ' ', '[', ']'][..], String::from(",;\\.:!?)"))
        };

        let first = self.read(0);
        if first.is_end() {
            return Err(self.fail_route());
        }
        if let Some(c0) = first.text().and_then(|s| s.chars().next()) {
            if invalid.contains(&c0) {
                return Err(self.fail_route());
            }
        }

        let mut tail = String::new();
        loop {
            let this = self.read(0);
            let nxt = self.read(1);
            if this.is("&") {
                if !tail.is_empty() {
                    let pending = std::mem::take(&mut tail);
                    self.emit_text(pending);
                }
                self.parse_entity()?;
            } else if this.is("<")
                && nxt.is("!")
                && self.read(2).is("-")
                && self.read(3).is("-")
            {
                if !tail.is_empty() {
                    let pending = std::mem::take(&mut tail);
                    self.emit_text(pending);
                }
                self.parse_comment()?;
            } else if this.is("{") && nxt.is("{") && self.can_recurse() {
                if !tail.is_empty() {
                    let pending = std::mem::take(&mut tail);
                    self.emit_text(pending);
                }
                self.parse_template_or_argument()?;
            } else if brackets {
                if this.is_end() || this.is("\n") {
                    return Err(self.fail_route());
                }
                if this.is("]") {
                    return Ok((self.pop(), None));
                }
                if self.is_uri_end(&this, &nxt) {
                    let text = this.text().unwrap_or_default().to_string();
                    if let Some(at) = text.find(' ') {
                        // The separator itself is zero-width; the space
                        // stays in the stream as part of the link title.
                        let (before, after) = text.split_at(at);
                        self.emit_text(before.to_string());
                        self.emit(Token::ExternalLinkSeparator);
                        self.emit_text(after.to_string());
                        self.head += 1;
                    } else {
                        self.emit(Token::ExternalLinkSeparator);
                    }
                    *self.context_mut() ^= contexts::EXT_LINK_URI;
                    *self.context_mut() |= contexts::EXT_LINK_TITLE;
                    return Ok((self.parse(0, false)?, None));
                }
                let text = this.text().unwrap_or_default().to_string();
                self.emit_text(text);
            } else {
                if self.is_uri_end(&this, &nxt) {
                    match this.text().map(str::to_string) {
                        Some(text) if text.contains(' ') => {
                            let at = text.find(' ').unwrap_or(text.len());
                            let (before, after) = text.split_at(at);
                            self.handle_free_link_text(&mut punct, &mut tail, before);
                            tail.push_str(after);
                        }
                        _ => {
                            self.head -= 1;
                        }
                    }
                    return Ok((self.pop(), Some(tail)));
                }
                let text = this.text().unwrap_or_default().to_string();
                self.handle_free_link_text(&mut punct, &mut tail, &text);
            }
            self.head += 1;
        }
    }

    /// Strip a recognized scheme back out of the textbuffer once a free
    /// link is confirmed, so it is not emitted twice.
    fn remove_uri_scheme_from_textbuffer(&mut self, scheme: &str) {
        let mut length = scheme.len();
        while length > 0 {
            let Some(last) = self.textbuffer_mut().last_mut() else {
                break;
            };
            if length < last.len() {
                last.truncate(last.len() - length);
                break;
            }
            length -= last.len();
            self.textbuffer_mut().pop();
        }
    }

    /// Parse an external link at the head of the wikicode string.
    fn parse_external_link(&mut self, brackets: bool) -> Result<(), TokenizerError> {
        if self.context() & contexts::NO_EXT_LINKS != 0 || !self.can_recurse() {
            if !brackets && self.context() & contexts::DL_TERM != 0 {
                self.handle_dl_term();
            } else if let Some(text) = self.read(0).text().map(str::to_string) {
                self.emit_text(text);
            }
            return Ok(());
        }

        let reset = self.head;
        self.head += 1;
        match self.really_parse_external_link(brackets) {
            Ok((link, extra)) => {
                if !brackets {
                    let scheme = link
                        .first()
                        .and_then(Token::as_text)
                        .and_then(|t| t.split(':').next())
                        .unwrap_or_default()
                        .to_string();
                    self.remove_uri_scheme_from_textbuffer(&scheme);
                }
                self.emit(Token::ExternalLinkOpen { brackets });
                self.emit_all(link);
                self.emit(Token::ExternalLinkClose);
                if let Some(extra) = extra {
                    if !extra.is_empty() {
                        self.emit_text(extra);
                    }
                }
                Ok(())
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset;
                if !brackets && self.context() & contexts::DL_TERM != 0 {
                    self.handle_dl_term();
                } else if let Some(text) = self.read(0).text().map(str::to_string) {
                    self.emit_text(text);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Parse a section heading at the head of the wikicode string.
    fn parse_heading(&mut self) -> Result<(), TokenizerError> {
        self.global |= contexts::GL_HEADING;
        let reset = self.head;
        self.head += 1;
        let mut best: usize = 1;
        while self.read(0).is("=") {
            best += 1;
            self.head += 1;
        }
        let context = contexts::HEADING_LEVEL_1 << (best - 1).min(5);

        let result = match self.parse(context, true) {
            Ok(title) => {
                let level = self.heading_level;
                self.emit(Token::HeadingStart { level: level as u8 });
                if level < best {
                    self.emit_text("=".repeat(best - level));
                }
                self.emit_all(title);
                self.emit(Token::HeadingEnd);
                Ok(())
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset + best as i64 - 1;
                self.emit_text("=".repeat(best));
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.global ^= contexts::GL_HEADING;
        result
    }

    /// Handle the closing run of a section heading. The chosen level is
    /// left in `self.heading_level` for `parse_heading` to pick up.
    fn handle_heading_end(&mut self) -> Result<Vec<Token>, TokenizerError> {
        let reset = self.head;
        self.head += 1;
        let mut best: usize = 1;
        while self.read(0).is("=") {
            best += 1;
            self.head += 1;
        }
        let bits = (self.context() & contexts::HEADING) / contexts::HEADING_LEVEL_1;
        let current = bits.trailing_zeros() as usize + 1;
        let level = current.min(best.min(6));

        // A later closing run on the same line supersedes this one.
        match self.parse(self.context(), true) {
            Ok(after) => {
                self.emit_text("=".repeat(best));
                self.emit_all(after);
                Ok(self.pop())
            }
            Err(TokenizerError::BadRoute(_)) => {
                if level < best {
                    self.emit_text("=".repeat(best - level));
                }
                self.head = reset + best as i64 - 1;
                self.heading_level = level;
                Ok(self.pop())
            }
            Err(e) => Err(e),
        }
    }

    /// Actually parse an HTML entity and ensure that it is valid.
    fn really_parse_entity(&mut self) -> Result<(), TokenizerError> {
        self.emit(Token::HTMLEntityStart);
        self.head += 1;

        let mut this = self.read_strict()?;
        let (numeric, hexadecimal) = if this == "#" {
            self.head += 1;
            this = self.read_strict()?;
            if let Some(rest) = this.strip_prefix('x') {
                self.emit(Token::HTMLEntityNumeric { hexadecimal: true });
                if rest.is_empty() {
                    return Err(self.fail_route());
                }
                this = rest.to_string();
                (true, true)
            } else {
                self.emit(Token::HTMLEntityNumeric { hexadecimal: false });
                (true, false)
            }
        } else {
            (false, false)
        };

        let valid: fn(char) -> bool = if hexadecimal {
            |c| c.is_ascii_hexdigit()
        } else if numeric {
            |c| c.is_ascii_digit()
        } else {
            |c| c.is_ascii_alphanumeric()
        };
        if this.is_empty() || !this.chars().all(valid) {
            return Err(self.fail_route());
        }

        self.head += 1;
        if !self.read(0).is(";") {
            return Err(self.fail_route());
        }
        if numeric {
            let radix = if hexadecimal { 16 } else { 10 };
            match i64::from_str_radix(&this, radix) {
                Ok(value) if (1..=0x10FFFF).contains(&value) => {}
                _ => return Err(self.fail_route()),
            }
        } else if !definitions::is_entity(&this) {
            return Err(self.fail_route());
        }

        self.emit(Token::text(this));
        self.emit(Token::HTMLEntityEnd);
        Ok(())
    }

    /// Parse an HTML entity at the head of the wikicode string.
    fn parse_entity(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head;
        let result = match self.push(contexts::HTML_ENTITY) {
            Ok(()) => self.really_parse_entity(),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let tmp = self.pop();
                self.emit_all(tmp);
                Ok(())
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset;
                if let Some(text) = self.read(0).text().map(str::to_string) {
                    self.emit_text(text);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Parse an HTML comment at the head of the wikicode string.
    fn parse_comment(&mut self) -> Result<(), TokenizerError> {
        self.head += 4;
        let reset = self.head - 1;
        self.push(0)?;
        loop {
            let this = self.read(0);
            if this.is_end() {
                // Unterminated; everything after `<!--` is ordinary text.
                self.pop();
                self.head = reset;
                self.emit_text("<!--");
                return Ok(());
            }
            if this.is("-") && self.read(1).is("-") && self.read(2).is(">") {
                self.emit_first(Token::CommentStart);
                self.emit(Token::CommentEnd);
                let tmp = self.pop();
                self.emit_all(tmp);
                self.head += 2;
                if self.context() & contexts::FAIL_NEXT != 0 {
                    // The safety scan flags `<!` as a potential bad route; a
                    // completed comment proves it was fine.
                    *self.context_mut() ^= contexts::FAIL_NEXT;
                }
                return Ok(());
            }
            if let Some(text) = this.text().map(str::to_string) {
                self.emit_text(text);
            }
            self.head += 1;
        }
    }

    /// Write a pending tag attribute from *data* to the stack.
    fn push_tag_buffer(&mut self, data: &mut TagOpenData) {
        if data.context.contains(TagOpenContext::CX_QUOTED) {
            self.emit_first(Token::TagAttrQuote {
                char: data.quoter.clone().unwrap_or_default(),
            });
            let tmp = self.pop();
            self.emit_all(tmp);
        }
        self.emit_first(Token::TagAttrStart {
            pad_first: std::mem::take(&mut data.pad_first),
            pad_before_eq: std::mem::take(&mut data.pad_before_eq),
            pad_after_eq: std::mem::take(&mut data.pad_after_eq),
        });
        let tmp = self.pop();
        self.emit_all(tmp);
    }

    /// Handle whitespace inside of an HTML open tag.
    fn handle_tag_space(&mut self, data: &mut TagOpenData, text: &str) {
        let ctx = data.context;
        let end_of_value = ctx.contains(TagOpenContext::CX_ATTR_VALUE)
            && !ctx.intersects(TagOpenContext::CX_QUOTED | TagOpenContext::CX_NOTE_QUOTE);
        if end_of_value
            || (ctx.contains(TagOpenContext::CX_QUOTED)
                && ctx.contains(TagOpenContext::CX_NOTE_SPACE))
        {
            self.push_tag_buffer(data);
            data.context = TagOpenContext::CX_ATTR_READY;
        } else if ctx.contains(TagOpenContext::CX_NOTE_SPACE) {
            data.context = TagOpenContext::CX_ATTR_READY;
        } else if ctx.contains(TagOpenContext::CX_ATTR_NAME) {
            data.context |= TagOpenContext::CX_NOTE_EQUALS;
        }
        if ctx.contains(TagOpenContext::CX_QUOTED) && !ctx.contains(TagOpenContext::CX_NOTE_SPACE)
        {
            self.emit_text(text.to_string());
        } else if data.context.contains(TagOpenContext::CX_ATTR_READY) {
            data.pad_first.push_str(text);
        } else if data.context.contains(TagOpenContext::CX_NOTE_EQUALS) {
            data.pad_before_eq.push_str(text);
        } else {
            data.pad_after_eq.push_str(text);
        }
    }

    /// Handle regular text inside of an HTML open tag.
    fn handle_tag_text(&mut self, text: &str) -> Result<(), TokenizerError> {
        let nxt = self.read(1);
        if !self.can_recurse() || !MARKERS.contains(&text) {
            self.emit_text(text.to_string());
        } else if text == "{" && nxt.is("{") {
            self.parse_template_or_argument()?;
        } else if text == "[" && nxt.is("[") {
            self.parse_wikilink()?;
        } else if text == "<" {
            self.parse_tag()?;
        } else {
            self.emit_text(text.to_string());
        }
        Ok(())
    }

    /// Handle all sorts of text data inside of an HTML open tag.
    fn handle_tag_data(&mut self, data: &mut TagOpenData, text: &str) -> Result<(), TokenizerError> {
        let pieces: Vec<String> = split_keeping_matches(&TAG_SPLITTER, text)
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        for chunk in pieces {
            if data.context.contains(TagOpenContext::CX_NAME) {
                if MARKERS.contains(&chunk.as_str())
                    || chunk.chars().all(char::is_whitespace)
                {
                    // Tags must start with text, not markers or spaces.
                    return Err(self.fail_route());
                }
                data.context = TagOpenContext::CX_NOTE_SPACE;
            } else if chunk.chars().all(char::is_whitespace) {
                self.handle_tag_space(data, &chunk);
                continue;
            } else if data.context.contains(TagOpenContext::CX_NOTE_SPACE) {
                if data.context.contains(TagOpenContext::CX_QUOTED) {
                    // Misquoted attribute: retry it as an unquoted value.
                    data.context = TagOpenContext::CX_ATTR_VALUE;
                    self.memoize_bad_route();
                    self.pop();
                    self.head = data.reset - 1; // auto-incremented by the caller
                    return Ok(());
                }
                return Err(self.fail_route());
            } else if data.context.contains(TagOpenContext::CX_ATTR_READY) {
                data.context = TagOpenContext::CX_ATTR_NAME;
                self.push(contexts::TAG_ATTR)?;
            } else if data.context.contains(TagOpenContext::CX_ATTR_NAME) {
                if chunk == "=" {
                    data.context = TagOpenContext::CX_ATTR_VALUE | TagOpenContext::CX_NOTE_QUOTE;
                    self.emit(Token::TagAttrEquals);
                    continue;
                }
                if data.context.contains(TagOpenContext::CX_NOTE_EQUALS) {
                    self.push_tag_buffer(data);
                    data.context = TagOpenContext::CX_ATTR_NAME;
                    self.push(contexts::TAG_ATTR)?;
                }
            } else {
                let escaped = self.read(-1).is("\\") && !self.read(-2).is("\\");
                if data.context.contains(TagOpenContext::CX_NOTE_QUOTE) {
                    data.context ^= TagOpenContext::CX_NOTE_QUOTE;
                    if (chunk == "\"" || chunk == "'") && !escaped {
                        data.context |= TagOpenContext::CX_QUOTED;
                        data.quoter = Some(chunk.clone());
                        data.reset = self.head;
                        match self.push(self.context()) {
                            Ok(()) => continue,
                            Err(TokenizerError::BadRoute(_)) => {
                                // Already failed to parse this as quoted.
                                data.context = TagOpenContext::CX_ATTR_VALUE;
                                self.head -= 1;
                                return Ok(());
                            }
                            Err(e) => return Err(e),
                        }
                    }
                } else if data.context.contains(TagOpenContext::CX_QUOTED) {
                    if Some(chunk.as_str()) == data.quoter.as_deref() && !escaped {
                        data.context |= TagOpenContext::CX_NOTE_SPACE;
                        continue;
                    }
                }
            }
            self.handle_tag_text(&chunk)?;
        }
        Ok(())
    }

    /// Handle the closing of an open tag (`>` or `/>`).
    fn handle_tag_close_open(&mut self, data: &mut TagOpenData, selfclose: bool) {
        if data
            .context
            .intersects(TagOpenContext::CX_ATTR_NAME | TagOpenContext::CX_ATTR_VALUE)
        {
            self.push_tag_buffer(data);
        }
        let padding = Some(std::mem::take(&mut data.pad_first));
        if selfclose {
            self.emit(Token::TagCloseSelfclose {
                padding,
                implicit: false,
                wiki_markup: None,
            });
        } else {
            self.emit(Token::TagCloseOpen {
                padding,
                wiki_markup: None,
            });
        }
        self.head += 1;
    }

    /// Handle the opening of a closing tag (`</foo>`).
    fn handle_tag_open_close(&mut self) -> Result<(), TokenizerError> {
        self.emit(Token::TagOpenClose);
        self.push(contexts::TAG_CLOSE)?;
        self.head += 1;
        Ok(())
    }

    /// Handle the ending of a closing tag, checking the name matches.
    fn handle_tag_close_close(&mut self) -> Result<Vec<Token>, TokenizerError> {
        fn strip(token: &Token) -> Option<String> {
            token.as_text().map(|t| t.trim_end().to_lowercase())
        }

        let closing = self.pop();
        let name_matches = closing.len() == 1
            && strip(&closing[0]).is_some()
            && strip(&closing[0]) == self.stack().get(1).and_then(strip);
        if !name_matches {
            return Err(self.fail_route());
        }
        self.emit_all(closing);
        self.emit(Token::TagCloseClose);
        Ok(self.pop())
    }

    /// Handle the body of an HTML tag that is parser-blacklisted: the
    /// contents are a single text run up to the matching closing tag.
    fn handle_blacklisted_tag(&mut self) -> Result<Vec<Token>, TokenizerError> {
        let name = self
            .stack()
            .get(1)
            .and_then(Token::as_text)
            .unwrap_or_default()
            .trim_end()
            .to_lowercase();
        loop {
            let this = self.read(0);
            let nxt = self.read(1);
            if this.is_end() {
                return Err(self.fail_route());
            } else if this.is("<") && nxt.is("/") {
                let candidate = self.read(2);
                let closer_matches = candidate
                    .text()
                    .map(|t| t.trim_end().to_lowercase() == name)
                    .unwrap_or(false)
                    && self.read(3).is(">");
                if closer_matches {
                    let raw = candidate.text().unwrap_or_default().to_string();
                    self.head += 2;
                    self.emit(Token::TagOpenClose);
                    self.emit_text(raw);
                    self.emit(Token::TagCloseClose);
                    self.head += 1; // leave the head on the `>`
                    return Ok(self.pop());
                }
                self.emit_text("<");
                self.head += 1;
            } else {
                if let Some(text) = this.text().map(str::to_string) {
                    self.emit_text(text);
                }
                self.head += 1;
            }
        }
    }

    /// Handle the stream end when inside a single-only tag like `<br>`:
    /// the `>` already emitted becomes a self-closure.
    fn handle_single_only_tag_end(&mut self) -> Vec<Token> {
        let padding = match self.stack_mut().pop() {
            Some(Token::TagCloseOpen { padding, .. }) => padding.unwrap_or_default(),
            _ => String::new(),
        };
        self.emit(Token::TagCloseSelfclose {
            padding: Some(padding),
            implicit: true,
            wiki_markup: None,
        });
        self.head -= 1; // offset the displacement done by handle_tag_close_open
        self.pop()
    }

    /// Handle the stream end when inside a single-supporting tag like
    /// `<li>`: rewrite its `TagCloseOpen` into an implicit self-closure.
    fn handle_single_tag_end(&mut self) -> Result<Vec<Token>, TokenizerError> {
        let stack = self.stack_mut();
        // Find the TagCloseOpen matching the TagOpenOpen at index 0.
        let mut depth = 1;
        let mut found = None;
        for (index, token) in stack.iter().enumerate().skip(2) {
            match token {
                Token::TagOpenOpen { .. } => depth += 1,
                Token::TagCloseOpen { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        found = Some(index);
                        break;
                    }
                }
                Token::TagCloseSelfclose { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        return Err(TokenizerError::UnexpectedTagCloseSelfclose);
                    }
                }
                _ => {}
            }
        }
        let Some(index) = found else {
            return Err(TokenizerError::MissedTagCloseOpen);
        };
        let padding = match &stack[index] {
            Token::TagCloseOpen { padding, .. } => padding.clone().unwrap_or_default(),
            _ => String::new(),
        };
        stack[index] = Token::TagCloseSelfclose {
            padding: Some(padding),
            implicit: true,
            wiki_markup: None,
        };
        Ok(self.pop())
    }

    /// Actually parse an HTML tag, starting with the open (`<foo>`).
    fn really_parse_tag(&mut self) -> Result<Vec<Token>, TokenizerError> {
        let mut data = TagOpenData::new();
        self.push(contexts::TAG_OPEN)?;
        self.emit(Token::TagOpenOpen { wiki_markup: None });
        loop {
            let this = self.read(0);
            let nxt = self.read(1);
            let can_exit = !data
                .context
                .intersects(TagOpenContext::CX_QUOTED | TagOpenContext::CX_NAME)
                || data.context.contains(TagOpenContext::CX_NOTE_SPACE);
            if this.is_end() {
                if self.context() & contexts::TAG_ATTR != 0 {
                    if data.context.contains(TagOpenContext::CX_QUOTED) {
                        // Unclosed attribute quote: reset, don't die.
                        data.context = TagOpenContext::CX_ATTR_VALUE;
                        self.memoize_bad_route();
                        self.pop();
                        self.head = data.reset;
                        continue;
                    }
                    self.pop();
                }
                return Err(self.fail_route());
            } else if this.is(">") && can_exit {
                self.handle_tag_close_open(&mut data, false);
                *self.context_mut() = contexts::TAG_BODY;
                let name = self
                    .stack()
                    .get(1)
                    .and_then(Token::as_text)
                    .unwrap_or_default()
                    .to_string();
                if definitions::is_single_only(&name) {
                    return Ok(self.handle_single_only_tag_end());
                }
                if definitions::is_parsable(&name) {
                    return self.parse(0, false);
                }
                return self.handle_blacklisted_tag();
            } else if this.is("/") && nxt.is(">") && can_exit {
                self.handle_tag_close_open(&mut data, true);
                return Ok(self.pop());
            } else if let Some(text) = this.text().map(str::to_string) {
                self.handle_tag_data(&mut data, &text)?;
            }
            self.head += 1;
        }
    }

    /// Parse an HTML tag at the head of the wikicode string.
    fn parse_tag(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head;
        self.head += 1;
        match self.really_parse_tag() {
            Ok(tag) => self.emit_all(tag),
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset;
                self.emit_text("<");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Write the body of a wiki-markup style tag (`''`/`'''`).
    fn emit_style_tag(&mut self, tag: &str, markup: &str, body: Vec<Token>) {
        self.emit(Token::TagOpenOpen {
            wiki_markup: Some(markup.to_string()),
        });
        self.emit_text(tag.to_string());
        self.emit(Token::TagCloseOpen {
            padding: None,
            wiki_markup: None,
        });
        self.emit_all(body);
        self.emit(Token::TagOpenClose);
        self.emit_text(tag.to_string());
        self.emit(Token::TagCloseClose);
    }

    /// Parse wiki-style italics.
    fn parse_italics(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head;
        match self.parse(contexts::STYLE_ITALICS, true) {
            Ok(stack) => self.emit_style_tag("i", "''", stack),
            Err(TokenizerError::BadRoute(route)) => {
                self.head = reset;
                if route & contexts::STYLE_PASS_AGAIN != 0 {
                    let new_ctx = contexts::STYLE_ITALICS | contexts::STYLE_SECOND_PASS;
                    match self.parse(new_ctx, true) {
                        Ok(stack) => self.emit_style_tag("i", "''", stack),
                        Err(TokenizerError::BadRoute(_)) => {
                            self.head = reset;
                            self.emit_text("''");
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    self.emit_text("''");
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Parse wiki-style bold. Returns whether the caller's frame is over.
    fn parse_bold(&mut self) -> Result<bool, TokenizerError> {
        let reset = self.head;
        match self.parse(contexts::STYLE_BOLD, true) {
            Ok(stack) => {
                self.emit_style_tag("b", "'''", stack);
                Ok(false)
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset;
                if self.context() & contexts::STYLE_SECOND_PASS != 0 {
                    self.emit_text("'");
                    return Ok(true);
                }
                if self.context() & contexts::STYLE_ITALICS != 0 {
                    *self.context_mut() |= contexts::STYLE_PASS_AGAIN;
                    self.emit_text("'''");
                } else {
                    self.emit_text("'");
                    self.parse_italics()?;
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Parse wiki-style italics and bold together (five ticks).
    fn parse_italics_and_bold(&mut self) -> Result<(), TokenizerError> {
        let reset = self.head;
        match self.parse(contexts::STYLE_BOLD, true) {
            Ok(stack) => {
                let reset = self.head;
                match self.parse(contexts::STYLE_ITALICS, true) {
                    Ok(stack2) => {
                        self.push(0)?;
                        self.emit_style_tag("b", "'''", stack);
                        self.emit_all(stack2);
                        let tmp = self.pop();
                        self.emit_style_tag("i", "''", tmp);
                    }
                    Err(TokenizerError::BadRoute(_)) => {
                        self.head = reset;
                        self.emit_text("''");
                        self.emit_style_tag("b", "'''", stack);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(TokenizerError::BadRoute(_)) => {
                self.head = reset;
                match self.parse(contexts::STYLE_ITALICS, true) {
                    Ok(stack) => {
                        let reset = self.head;
                        match self.parse(contexts::STYLE_BOLD, true) {
                            Ok(stack2) => {
                                self.push(0)?;
                                self.emit_style_tag("i", "''", stack);
                                self.emit_all(stack2);
                                let tmp = self.pop();
                                self.emit_style_tag("b", "'''", tmp);
                            }
                            Err(TokenizerError::BadRoute(_)) => {
                                self.head = reset;
                                self.emit_text("'''");
                                self.emit_style_tag("i", "''", stack);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(TokenizerError::BadRoute(_)) => {
                        self.head = reset;
                        self.emit_text("'''''");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Parse wiki-style formatting (`''`/`'''` for italics/bold).
    fn parse_style(&mut self) -> Result<Option<Vec<Token>>, TokenizerError> {
        self.head += 2;
        let mut ticks = 2;
        while self.read(0).is("'") {
            self.head += 1;
            ticks += 1;
        }
        let italics = self.context() & contexts::STYLE_ITALICS != 0;
        let bold = self.context() & contexts::STYLE_BOLD != 0;

        if ticks > 5 {
            self.emit_text("'".repeat(ticks - 5));
            ticks = 5;
        } else if ticks == 4 {
            self.emit_text("'");
            ticks = 3;
        }

        if (italics && (ticks == 2 || ticks == 5)) || (bold && (ticks == 3 || ticks == 5)) {
            if ticks == 5 {
                self.head -= if italics { 3 } else { 2 };
            }
            return Ok(Some(self.pop()));
        }
        if !self.can_recurse() {
            if ticks == 3 {
                if self.context() & contexts::STYLE_SECOND_PASS != 0 {
                    self.emit_text("'");
                    return Ok(Some(self.pop()));
                }
                if self.context() & contexts::STYLE_ITALICS != 0 {
                    *self.context_mut() |= contexts::STYLE_PASS_AGAIN;
                }
            }
            self.emit_text("'".repeat(ticks));
        } else if ticks == 2 {
            self.parse_italics()?;
        } else if ticks == 3 {
            if self.parse_bold()? {
                return Ok(Some(self.pop()));
            }
        } else {
            self.parse_italics_and_bold()?;
        }
        self.head -= 1;
        Ok(None)
    }

    /// Handle a list marker at the head (`#`, `*`, `;`, `:`).
    fn handle_list_marker(&mut self) {
        let Some(markup) = self.read(0).text().map(str::to_string) else {
            return;
        };
        if markup == ";" {
            *self.context_mut() |= contexts::DL_TERM;
        }
        let Some(tag) = definitions::get_html_tag(&markup) else {
            return;
        };
        self.emit(Token::TagOpenOpen {
            wiki_markup: Some(markup),
        });
        self.emit_text(tag.to_string());
        self.emit(Token::TagCloseSelfclose {
            padding: None,
            implicit: false,
            wiki_markup: None,
        });
    }

    /// Handle a wiki-style list (`#`, `*`, `;`, `:`).
    fn handle_list(&mut self) {
        self.handle_list_marker();
        while matches!(self.read(1).text(), Some("#" | "*" | ";" | ":")) {
            self.head += 1;
            self.handle_list_marker();
        }
    }

    /// Handle a wiki-style horizontal rule (`----`).
    fn handle_hr(&mut self) {
        let mut length = 4;
        self.head += 3;
        while self.read(1).is("-") {
            length += 1;
            self.head += 1;
        }
        self.emit(Token::TagOpenOpen {
            wiki_markup: Some("-".repeat(length)),
        });
        self.emit_text("hr".to_string());
        self.emit(Token::TagCloseSelfclose {
            padding: None,
            implicit: false,
            wiki_markup: None,
        });
    }

    /// Handle the term in a description list (`foo` in `;foo:bar`).
    fn handle_dl_term(&mut self) {
        *self.context_mut() ^= contexts::DL_TERM;
        if self.read(0).is(":") {
            self.handle_list_marker();
        } else {
            self.emit_text("\n");
        }
    }

    /// Handle the end of the stream of wikitext.
    fn handle_end(&mut self) -> Result<Vec<Token>, TokenizerError> {
        if self.context() & contexts::FAIL != 0 {
            if self.context() & contexts::TAG_BODY != 0 {
                let name = self
                    .stack()
                    .get(1)
                    .and_then(Token::as_text)
                    .unwrap_or_default()
                    .to_string();
                if definitions::is_single(&name) {
                    return self.handle_single_tag_end();
                }
            }
            if self.context() & contexts::DOUBLE != 0 {
                self.pop();
            }
            return Err(self.fail_route());
        }
        Ok(self.pop())
    }

    /// Make sure we are not trying to write an invalid character in a
    /// restrictive context. May set scratch flags for later chunks.
    fn verify_safe(&mut self, this: &Chunk) -> bool {
        let context = self.context();
        if context & contexts::FAIL_NEXT != 0 {
            return false;
        }
        if context & contexts::WIKILINK_TITLE != 0 {
            match this.text() {
                Some("]") | Some("{") => {
                    *self.context_mut() |= contexts::FAIL_NEXT;
                }
                Some("\n") | Some("[") | Some("}") | Some(">") => return false,
                Some("<") => {
                    if self.read(1).is("!") {
                        *self.context_mut() |= contexts::FAIL_NEXT;
                    } else {
                        return false;
                    }
                }
                _ => {}
            }
            return true;
        }
        if context & contexts::EXT_LINK_TITLE != 0 {
            return !this.is("\n");
        }
        if context & contexts::TEMPLATE_NAME != 0 {
            match this.text() {
                Some("{") => {
                    *self.context_mut() |= contexts::HAS_TEMPLATE | contexts::FAIL_NEXT;
                    return true;
                }
                Some("}") => {
                    *self.context_mut() |= contexts::FAIL_NEXT;
                    return true;
                }
                Some("<") if self.read(1).is("!") => {
                    *self.context_mut() |= contexts::FAIL_NEXT;
                    return true;
                }
                Some("[") | Some("]") | Some("<") | Some(">") => return false,
                Some("|") => return true,
                _ => {}
            }
            let nonspace = this.text().is_none_or(|t| !t.trim().is_empty());
            if context & contexts::HAS_TEXT != 0 {
                if context & contexts::FAIL_ON_TEXT != 0 {
                    if nonspace {
                        return false;
                    }
                } else if this.is("\n") {
                    *self.context_mut() |= contexts::FAIL_ON_TEXT;
                }
            } else if nonspace {
                *self.context_mut() |= contexts::HAS_TEXT;
            }
            return true;
        }
        if context & contexts::TAG_CLOSE != 0 {
            return !this.is("<");
        }
        if context & contexts::FAIL_ON_EQUALS != 0 {
            if this.is("=") {
                return false;
            }
        } else if context & contexts::FAIL_ON_LBRACE != 0 {
            if this.is("{") || (self.read(-1).is("{") && self.read(-2).is("{")) {
                if context & contexts::TEMPLATE != 0 {
                    *self.context_mut() |= contexts::FAIL_ON_EQUALS;
                } else {
                    *self.context_mut() |= contexts::FAIL_NEXT;
                }
                return true;
            }
            *self.context_mut() ^= contexts::FAIL_ON_LBRACE;
        } else if context & contexts::FAIL_ON_RBRACE != 0 {
            if this.is("}") {
                *self.context_mut() |= contexts::FAIL_NEXT;
                return true;
            }
            *self.context_mut() ^= contexts::FAIL_ON_RBRACE;
        } else if this.is("{") {
            *self.context_mut() |= contexts::FAIL_ON_LBRACE;
        } else if this.is("}") {
            *self.context_mut() |= contexts::FAIL_ON_RBRACE;
        }
        true
    }

    /// Parse the wikicode string, using *context* for when to stop.
    fn parse(&mut self, context: u64, push: bool) -> Result<Vec<Token>, TokenizerError> {
        if push {
            self.push(context)?;
        }
        loop {
            let this = self.read(0);
            if self.context() & contexts::UNSAFE != 0 && !self.verify_safe(&this) {
                if self.context() & contexts::DOUBLE != 0 {
                    self.pop();
                }
                return Err(self.fail_route());
            }
            if !is_marker(&this) {
                if let Either::Left(text) = this {
                    self.emit_text(text);
                }
                self.head += 1;
                continue;
            }
            if this.is_end() {
                return self.handle_end();
            }
            let nxt = self.read(1);
            if this.is("{") && nxt.is("{") {
                if self.can_recurse() {
                    self.parse_template_or_argument()?;
                } else {
                    self.emit_text("{");
                }
            } else if this.is("|") && self.context() & contexts::TEMPLATE != 0 {
                self.handle_template_param()?;
            } else if this.is("=") && self.context() & contexts::TEMPLATE_PARAM_KEY != 0 {
                if self.global & contexts::GL_HEADING == 0
                    && is_line_start(&self.read(-1))
                    && nxt.is("=")
                {
                    self.parse_heading()?;
                } else {
                    self.handle_template_param_value();
                }
            } else if this.is("}") && nxt.is("}") && self.context() & contexts::TEMPLATE != 0 {
                return self.handle_template_end();
            } else if this.is("|") && self.context() & contexts::ARGUMENT_NAME != 0 {
                self.handle_argument_separator();
            } else if this.is("}") && nxt.is("}") && self.context() & contexts::ARGUMENT != 0 {
                if self.read(2).is("}") {
                    return Ok(self.handle_argument_end());
                }
                self.emit_text("}");
            } else if this.is("[") && nxt.is("[") && self.can_recurse() {
                if self.context() & contexts::NO_WIKILINKS == 0 {
                    self.parse_wikilink()?;
                } else {
                    self.emit_text("[");
                }
            } else if this.is("|") && self.context() & contexts::WIKILINK_TITLE != 0 {
                self.handle_wikilink_separator();
            } else if this.is("]") && nxt.is("]") && self.context() & contexts::WIKILINK != 0 {
                return Ok(self.handle_wikilink_end());
            } else if this.is("[") {
                self.parse_external_link(true)?;
            } else if this.is(":") && !is_marker(&self.read(-1)) {
                self.parse_external_link(false)?;
            } else if this.is("]") && self.context() & contexts::EXT_LINK_TITLE != 0 {
                return Ok(self.pop());
            } else if this.is("=")
                && self.global & contexts::GL_HEADING == 0
                && self.context() & contexts::TEMPLATE == 0
                && is_line_start(&self.read(-1))
            {
                self.parse_heading()?;
            } else if this.is("=") && self.context() & contexts::HEADING != 0 {
                return self.handle_heading_end();
            } else if this.is("\n") && self.context() & contexts::HEADING != 0 {
                return Err(self.fail_route());
            } else if this.is("&") {
                self.parse_entity()?;
            } else if this.is("<") && nxt.is("!") {
                if self.read(2).is("-") && self.read(3).is("-") {
                    self.parse_comment()?;
                } else {
                    self.emit_text("<");
                }
            } else if this.is("<") && nxt.is("/") && !self.read(2).is_end() {
                if self.context() & contexts::TAG_BODY != 0 {
                    self.handle_tag_open_close()?;
                } else {
                    // A stray closing tag carries no structure of its own.
                    self.emit_text("</");
                    self.head += 1;
                }
            } else if this.is("<") && self.context() & contexts::TAG_CLOSE == 0 {
                if self.can_recurse() {
                    self.parse_tag()?;
                } else {
                    self.emit_text("<");
                }
            } else if this.is(">") && self.context() & contexts::TAG_CLOSE != 0 {
                return self.handle_tag_close_close();
            } else if this.is("'") && nxt.is("'") && !self.skip_style_tags {
                if let Some(result) = self.parse_style()? {
                    return Ok(result);
                }
            } else if is_line_start(&self.read(-1))
                && matches!(this.text(), Some("#" | "*" | ";" | ":"))
            {
                self.handle_list();
            } else if is_line_start(&self.read(-1))
                && this.is("-")
                && nxt.is("-")
                && self.read(2).is("-")
                && self.read(3).is("-")
            {
                self.handle_hr();
            } else if (this.is("\n") || this.is(":")) && self.context() & contexts::DL_TERM != 0 {
                self.handle_dl_term();
            } else if let Either::Left(text) = this {
                self.emit_text(text);
            }
            self.head += 1;
        }
    }

    /// Build a list of tokens from a string of wikitext and return it.
    pub fn tokenize(
        &mut self,
        text: &str,
        context: u64,
        skip_style_tags: bool,
    ) -> Result<Vec<Token>, TokenizerError> {
        self.text = split_keeping_matches(&MARKER_SPLITTER, text)
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();
        self.head = 0;
        self.global = 0;
        self.depth = 0;
        self.heading_level = 0;
        self.stacks.clear();
        self.bad_routes.clear();
        self.skip_style_tags = skip_style_tags;

        let result = self.parse(context, true);
        if !self.stacks.is_empty() {
            let leftover = self.stacks.len();
            self.stacks.clear();
            return Err(TokenizerError::NonEmptyExitStack(leftover));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Token::*;

    fn tok(input: &str) -> Vec<Token> {
        Tokenizer::new()
            .tokenize(input, 0, false)
            .unwrap_or_else(|e| panic!("tokenize({:?}) failed: {}", input, e))
    }

    fn text(s: &str) -> Token {
        Token::text(s)
    }

    /// Reconstruct the source from a token stream. Structural tokens have
    /// fixed spans; paired state (heading levels, bracket flags, tag
    /// wiki-markup) is tracked on small stacks.
    fn render(tokens: &[Token]) -> String {
        struct TagFrame {
            wiki_markup: Option<String>,
            in_name: bool,
        }
        let mut out = String::new();
        let mut headings: Vec<u8> = Vec::new();
        let mut ext_brackets: Vec<bool> = Vec::new();
        let mut tags: Vec<TagFrame> = Vec::new();
        let mut open_quote: Option<String> = None;
        let mut pending_eq: Option<(String, String)> = None;

        for token in tokens {
            match token {
                Text { text } => {
                    let skip = tags
                        .last()
                        .map(|t| t.in_name && t.wiki_markup.is_some())
                        .unwrap_or(false);
                    if !skip {
                        out.push_str(text);
                    }
                }
                TemplateOpen => out.push_str("{{"),
                TemplateClose => out.push_str("}}"),
                TemplateParamSeparator => out.push('|'),
                TemplateParamEquals => out.push('='),
                ArgumentOpen => out.push_str("{{{"),
                ArgumentClose => out.push_str("}}}"),
                ArgumentSeparator => out.push('|'),
                WikilinkOpen => out.push_str("[["),
                WikilinkClose => out.push_str("]]"),
                WikilinkSeparator => out.push('|'),
                ExternalLinkOpen { brackets } => {
                    ext_brackets.push(*brackets);
                    if *brackets {
                        out.push('[');
                    }
                }
                ExternalLinkSeparator => {}
                ExternalLinkClose => {
                    if ext_brackets.pop().unwrap_or(false) {
                        out.push(']');
                    }
                }
                HTMLEntityStart => out.push('&'),
                HTMLEntityNumeric { hexadecimal } => {
                    out.push('#');
                    if *hexadecimal {
                        out.push('x');
                    }
                }
                HTMLEntityEnd => out.push(';'),
                HeadingStart { level } => {
                    headings.push(*level);
                    out.push_str(&"=".repeat(*level as usize));
                }
                HeadingEnd => {
                    let level = headings.pop().unwrap_or(1);
                    out.push_str(&"=".repeat(level as usize));
                }
                CommentStart => out.push_str("<!--"),
                CommentEnd => out.push_str("-->"),
                TagOpenOpen { wiki_markup } => {
                    match wiki_markup {
                        Some(m) => out.push_str(m),
                        None => out.push('<'),
                    }
                    tags.push(TagFrame {
                        wiki_markup: wiki_markup.clone(),
                        in_name: true,
                    });
                }
                TagAttrStart { pad_first, pad_before_eq, pad_after_eq } => {
                    if let Some(q) = open_quote.take() {
                        out.push_str(&q);
                    }
                    // A valueless attribute still carries its pad_before_eq.
                    if let Some((before, _)) = pending_eq.take() {
                        out.push_str(&before);
                    }
                    out.push_str(pad_first);
                    pending_eq = Some((pad_before_eq.clone(), pad_after_eq.clone()));
                }
                TagAttrEquals => {
                    if let Some((before, after)) = pending_eq.take() {
                        out.push_str(&before);
                        out.push('=');
                        out.push_str(&after);
                    } else {
                        out.push('=');
                    }
                }
                TagAttrQuote { char } => {
                    out.push_str(char);
                    open_quote = Some(char.clone());
                }
                TagCloseOpen { padding, .. } => {
                    if let Some(q) = open_quote.take() {
                        out.push_str(&q);
                    }
                    if let Some((before, _)) = pending_eq.take() {
                        out.push_str(&before);
                    }
                    if let Some(frame) = tags.last_mut() {
                        frame.in_name = false;
                        if frame.wiki_markup.is_none() {
                            out.push_str(padding.as_deref().unwrap_or(""));
                            out.push('>');
                        }
                    }
                }
                TagCloseSelfclose { padding, implicit, .. } => {
                    if let Some(q) = open_quote.take() {
                        out.push_str(&q);
                    }
                    if let Some((before, _)) = pending_eq.take() {
                        out.push_str(&before);
                    }
                    let frame = tags.pop();
                    let wiki = frame.map(|f| f.wiki_markup.is_some()).unwrap_or(false);
                    if !wiki {
                        out.push_str(padding.as_deref().unwrap_or(""));
                        if *implicit {
                            out.push('>');
                        } else {
                            out.push_str("/>");
                        }
                    }
                }
                TagOpenClose => {
                    if let Some(frame) = tags.last_mut() {
                        frame.in_name = true;
                        match &frame.wiki_markup {
                            Some(m) => out.push_str(&m.clone()),
                            None => out.push_str("</"),
                        }
                    }
                }
                TagCloseClose => {
                    if tags.pop().map(|f| f.wiki_markup.is_none()).unwrap_or(true) {
                        out.push('>');
                    }
                }
            }
        }
        out
    }

    /// Every opener must have a matching closer, properly nested, and
    /// separators must sit directly inside their own construct.
    fn assert_balanced(tokens: &[Token], input: &str) {
        #[derive(Debug, PartialEq)]
        enum Kind {
            Template,
            Argument,
            Wikilink,
            ExtLink,
            Heading,
            Comment,
            Entity,
            Tag,
        }
        let mut stack = Vec::new();
        for token in tokens {
            match token {
                TemplateOpen => stack.push(Kind::Template),
                TemplateClose => assert_eq!(stack.pop(), Some(Kind::Template), "{:?}", input),
                TemplateParamSeparator | TemplateParamEquals => {
                    assert_eq!(stack.last(), Some(&Kind::Template), "{:?}", input)
                }
                ArgumentOpen => stack.push(Kind::Argument),
                ArgumentClose => assert_eq!(stack.pop(), Some(Kind::Argument), "{:?}", input),
                ArgumentSeparator => {
                    assert_eq!(stack.last(), Some(&Kind::Argument), "{:?}", input)
                }
                WikilinkOpen => stack.push(Kind::Wikilink),
                WikilinkClose => assert_eq!(stack.pop(), Some(Kind::Wikilink), "{:?}", input),
                WikilinkSeparator => {
                    assert_eq!(stack.last(), Some(&Kind::Wikilink), "{:?}", input)
                }
                ExternalLinkOpen { .. } => stack.push(Kind::ExtLink),
                ExternalLinkClose => assert_eq!(stack.pop(), Some(Kind::ExtLink), "{:?}", input),
                ExternalLinkSeparator => {
                    assert_eq!(stack.last(), Some(&Kind::ExtLink), "{:?}", input)
                }
                HeadingStart { .. } => stack.push(Kind::Heading),
                HeadingEnd => assert_eq!(stack.pop(), Some(Kind::Heading), "{:?}", input),
                CommentStart => stack.push(Kind::Comment),
                CommentEnd => assert_eq!(stack.pop(), Some(Kind::Comment), "{:?}", input),
                HTMLEntityStart => stack.push(Kind::Entity),
                HTMLEntityEnd => assert_eq!(stack.pop(), Some(Kind::Entity), "{:?}", input),
                TagOpenOpen { .. } => stack.push(Kind::Tag),
                TagCloseSelfclose { .. } | TagCloseClose => {
                    assert_eq!(stack.pop(), Some(Kind::Tag), "{:?}", input)
                }
                _ => {}
            }
        }
        assert!(stack.is_empty(), "unclosed constructs in {:?}: {:?}", input, stack);
    }

    #[test]
    fn empty_input() {
        assert_eq!(tok(""), vec![]);
    }

    #[test]
    fn plain_text() {
        assert_eq!(tok("hello, world"), vec![text("hello, world")]);
    }

    #[test]
    fn lone_openers_are_text() {
        assert_eq!(tok("{{"), vec![text("{{")]);
        assert_eq!(tok("[["), vec![text("[[")]);
        assert_eq!(tok("["), vec![text("[")]);
        assert_eq!(tok("{"), vec![text("{")]);
        assert_eq!(tok("<"), vec![text("<")]);
        assert_eq!(tok("="), vec![text("=")]);
    }

    #[test]
    fn pure_closers_are_text() {
        assert_eq!(tok("}}}}"), vec![text("}}}}")]);
        assert_eq!(tok("]]"), vec![text("]]")]);
    }

    #[test]
    fn simple_template() {
        assert_eq!(
            tok("{{foo}}"),
            vec![TemplateOpen, text("foo"), TemplateClose]
        );
    }

    #[test]
    fn template_with_params() {
        assert_eq!(
            tok("{{foo|bar|key=value}}"),
            vec![
                TemplateOpen,
                text("foo"),
                TemplateParamSeparator,
                text("bar"),
                TemplateParamSeparator,
                text("key"),
                TemplateParamEquals,
                text("value"),
                TemplateClose,
            ]
        );
    }

    #[test]
    fn second_equals_in_param_is_text() {
        assert_eq!(
            tok("{{foo|a=b=c}}"),
            vec![
                TemplateOpen,
                text("foo"),
                TemplateParamSeparator,
                text("a"),
                TemplateParamEquals,
                text("b=c"),
                TemplateClose,
            ]
        );
    }

    #[test]
    fn nested_templates() {
        assert_eq!(
            tok("{{foo|{{bar}}}}"),
            vec![
                TemplateOpen,
                text("foo"),
                TemplateParamSeparator,
                TemplateOpen,
                text("bar"),
                TemplateClose,
                TemplateClose,
            ]
        );
    }

    #[test]
    fn link_in_template_name_invalidates_template() {
        // spec case 1
        assert_eq!(
            tok("{{foo[[bar]]}}"),
            vec![
                text("{{foo"),
                WikilinkOpen,
                text("bar"),
                WikilinkClose,
                text("}}"),
            ]
        );
    }

    #[test]
    fn tag_in_template_name_invalidates_template() {
        assert_eq!(
            tok("{{foo<b>bar</b>}}"),
            vec![
                text("{{foo"),
                TagOpenOpen { wiki_markup: None },
                text("b"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("bar"),
                TagOpenClose,
                text("b"),
                TagCloseClose,
                text("}}"),
            ]
        );
    }

    #[test]
    fn template_in_entity_body_invalidates_entity() {
        // spec case 2
        assert_eq!(
            tok("&n{{bs}}p;"),
            vec![
                text("&n"),
                TemplateOpen,
                text("bs"),
                TemplateClose,
                text("p;"),
            ]
        );
    }

    #[test]
    fn unclosed_template_is_text() {
        assert_eq!(tok("{{foo|bar"), vec![text("{{foo|bar")]);
    }

    #[test]
    fn empty_template_name_is_text() {
        assert_eq!(tok("{{}}"), vec![text("{{}}")]);
        assert_eq!(tok("{{|foo}}"), vec![text("{{|foo}}")]);
    }

    #[test]
    fn newline_then_comment_keeps_template_valid() {
        assert_eq!(
            tok("{{foo\n<!-- comment -->|bar}}"),
            vec![
                TemplateOpen,
                text("foo\n"),
                CommentStart,
                text(" comment "),
                CommentEnd,
                TemplateParamSeparator,
                text("bar"),
                TemplateClose,
            ]
        );
    }

    #[test]
    fn stray_text_after_newline_invalidates_template() {
        // spec case 8
        assert_eq!(
            tok("{{foobar\n<!-- comment -->invalid|key=value}}"),
            vec![
                text("{{foobar\n"),
                CommentStart,
                text(" comment "),
                CommentEnd,
                text("invalid|key=value}}"),
            ]
        );
    }

    #[test]
    fn bare_angle_bang_in_template_name_invalidates() {
        assert_eq!(tok("{{foo\n<!bar}}"), vec![text("{{foo\n<!bar}}")]);
    }

    #[test]
    fn simple_argument() {
        assert_eq!(
            tok("{{{foo}}}"),
            vec![ArgumentOpen, text("foo"), ArgumentClose]
        );
    }

    #[test]
    fn argument_with_default() {
        assert_eq!(
            tok("{{{foo|bar|baz}}}"),
            vec![
                ArgumentOpen,
                text("foo"),
                ArgumentSeparator,
                text("bar|baz"),
                ArgumentClose,
            ]
        );
    }

    #[test]
    fn brace_run_splits_argument_first() {
        // Four braces: a literal brace, then a three-brace argument.
        assert_eq!(
            tok("{{{{foo}}}}"),
            vec![
                text("{"),
                ArgumentOpen,
                text("foo"),
                ArgumentClose,
                text("}"),
            ]
        );
    }

    #[test]
    fn brace_run_template_wrapping_argument() {
        // Five braces: the inner three close first, so a template whose
        // name is a three-brace argument.
        assert_eq!(
            tok("{{{{{foo}}}}}"),
            vec![
                TemplateOpen,
                ArgumentOpen,
                text("foo"),
                ArgumentClose,
                TemplateClose,
            ]
        );
    }

    #[test]
    fn simple_wikilink() {
        assert_eq!(
            tok("[[foo]]"),
            vec![WikilinkOpen, text("foo"), WikilinkClose]
        );
        assert_eq!(
            tok("[[foo|bar]]"),
            vec![
                WikilinkOpen,
                text("foo"),
                WikilinkSeparator,
                text("bar"),
                WikilinkClose,
            ]
        );
    }

    #[test]
    fn newline_in_wikilink_title_is_text() {
        assert_eq!(tok("[[foo\nbar]]"), vec![text("[[foo\nbar]]")]);
    }

    #[test]
    fn unclosed_wikilink_is_text() {
        assert_eq!(tok("[[foo|bar"), vec![text("[[foo|bar")]);
    }

    #[test]
    fn second_pipe_in_wikilink_is_text() {
        assert_eq!(
            tok("[[foo|bar|baz]]"),
            vec![
                WikilinkOpen,
                text("foo"),
                WikilinkSeparator,
                text("bar|baz"),
                WikilinkClose,
            ]
        );
    }

    #[test]
    fn incomplete_comment_in_link_title_invalidates() {
        assert_eq!(tok("[[foo<!--bar]]"), vec![text("[[foo<!--bar]]")]);
        assert_eq!(tok("[[foo<!bar]]"), vec![text("[[foo<!bar]]")]);
    }

    #[test]
    fn complete_comment_in_link_title_is_fine() {
        assert_eq!(
            tok("[[foo<!--bar-->baz]]"),
            vec![
                WikilinkOpen,
                text("foo"),
                CommentStart,
                text("bar"),
                CommentEnd,
                text("baz"),
                WikilinkClose,
            ]
        );
    }

    #[test]
    fn wikilink_that_is_really_an_external_link() {
        assert_eq!(
            tok("[[http://example.com]]"),
            vec![
                text("["),
                ExternalLinkOpen { brackets: true },
                text("http://example.com"),
                ExternalLinkClose,
                text("]"),
            ]
        );
    }

    #[test]
    fn heading_basic() {
        assert_eq!(
            tok("== Foo =="),
            vec![HeadingStart { level: 2 }, text(" Foo "), HeadingEnd]
        );
    }

    #[test]
    fn heading_requires_line_start() {
        assert_eq!(tok("x == Foo =="), vec![text("x == Foo ==")]);
        assert_eq!(
            tok("x\n== Foo =="),
            vec![
                text("x\n"),
                HeadingStart { level: 2 },
                text(" Foo "),
                HeadingEnd,
            ]
        );
    }

    #[test]
    fn heading_level_is_min_of_runs() {
        assert_eq!(
            tok("=== x =="),
            vec![HeadingStart { level: 2 }, text("= x "), HeadingEnd]
        );
        assert_eq!(
            tok("== x ==="),
            vec![HeadingStart { level: 2 }, text(" x ="), HeadingEnd]
        );
    }

    #[test]
    fn heading_without_closer_is_text() {
        assert_eq!(tok("== Foo"), vec![text("== Foo")]);
        assert_eq!(tok("== Foo\nbar"), vec![text("== Foo\nbar")]);
        assert_eq!(tok("==="), vec![text("===")]);
    }

    #[test]
    fn heading_level_caps_at_six() {
        assert_eq!(
            tok("======= x ======="),
            vec![HeadingStart { level: 6 }, text("= x ="), HeadingEnd]
        );
    }

    #[test]
    fn heading_with_nested_constructs() {
        // spec case 7
        assert_eq!(
            tok("== Head{{ing}} [[with]] {{{funky|{{stuf}}}}} =="),
            vec![
                HeadingStart { level: 2 },
                text(" Head"),
                TemplateOpen,
                text("ing"),
                TemplateClose,
                text(" "),
                WikilinkOpen,
                text("with"),
                WikilinkClose,
                text(" "),
                ArgumentOpen,
                text("funky"),
                ArgumentSeparator,
                TemplateOpen,
                text("stuf"),
                TemplateClose,
                ArgumentClose,
                text(" "),
                HeadingEnd,
            ]
        );
    }

    #[test]
    fn bracketed_external_link() {
        assert_eq!(
            tok("[http://example.com]"),
            vec![
                ExternalLinkOpen { brackets: true },
                text("http://example.com"),
                ExternalLinkClose,
            ]
        );
    }

    #[test]
    fn bracketed_external_link_with_label() {
        assert_eq!(
            tok("[http://example.com foo bar]"),
            vec![
                ExternalLinkOpen { brackets: true },
                text("http://example.com"),
                ExternalLinkSeparator,
                text(" foo bar"),
                ExternalLinkClose,
            ]
        );
    }

    #[test]
    fn bracketed_link_unknown_scheme_is_text() {
        assert_eq!(tok("[foo://example.com]"), vec![text("[foo://example.com]")]);
    }

    #[test]
    fn bracketed_link_broken_by_newline_falls_back_to_free_link() {
        assert_eq!(
            tok("[http://example.com\nfoo]"),
            vec![
                text("["),
                ExternalLinkOpen { brackets: false },
                text("http://example.com"),
                ExternalLinkClose,
                text("\nfoo]"),
            ]
        );
    }

    #[test]
    fn free_link() {
        assert_eq!(
            tok("http://example.com"),
            vec![
                ExternalLinkOpen { brackets: false },
                text("http://example.com"),
                ExternalLinkClose,
            ]
        );
    }

    #[test]
    fn free_link_in_running_text() {
        assert_eq!(
            tok("visit http://example.com now"),
            vec![
                text("visit "),
                ExternalLinkOpen { brackets: false },
                text("http://example.com"),
                ExternalLinkClose,
                text(" now"),
            ]
        );
    }

    #[test]
    fn free_link_trailing_punctuation_is_trimmed() {
        assert_eq!(
            tok("see http://example.com."),
            vec![
                text("see "),
                ExternalLinkOpen { brackets: false },
                text("http://example.com"),
                ExternalLinkClose,
                text("."),
            ]
        );
        assert_eq!(
            tok("see http://example.com/foo.,"),
            vec![
                text("see "),
                ExternalLinkOpen { brackets: false },
                text("http://example.com/foo"),
                ExternalLinkClose,
                text(".,"),
            ]
        );
    }

    #[test]
    fn free_link_punct_before_structure_is_kept() {
        // Trailing punctuation attaches after all when structure follows.
        assert_eq!(
            tok("http://example.com/foo.{{tpl}}"),
            vec![
                ExternalLinkOpen { brackets: false },
                text("http://example.com/foo."),
                TemplateOpen,
                text("tpl"),
                TemplateClose,
                ExternalLinkClose,
            ]
        );
    }

    #[test]
    fn free_link_close_paren_valid_after_open_paren() {
        assert_eq!(
            tok("http://example.com/foo_(bar)"),
            vec![
                ExternalLinkOpen { brackets: false },
                text("http://example.com/foo_(bar)"),
                ExternalLinkClose,
            ]
        );
        assert_eq!(
            tok("http://example.com/foo)"),
            vec![
                ExternalLinkOpen { brackets: false },
                text("http://example.com/foo"),
                ExternalLinkClose,
                text(")"),
            ]
        );
    }

    #[test]
    fn free_link_ends_at_style_tag() {
        // spec case 5
        assert_eq!(
            tok("http://example.com/foo''bar''"),
            vec![
                ExternalLinkOpen { brackets: false },
                text("http://example.com/foo"),
                ExternalLinkClose,
                TagOpenOpen { wiki_markup: Some("''".to_string()) },
                text("i"),
                TagCloseOpen { padding: None, wiki_markup: None },
                text("bar"),
                TagOpenClose,
                text("i"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn free_link_mailto_scheme_without_slashes() {
        // spec case 3
        assert_eq!(
            tok(";;;mailto:example"),
            vec![
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                ExternalLinkOpen { brackets: false },
                text("mailto:example"),
                ExternalLinkClose,
            ]
        );
    }

    #[test]
    fn unknown_scheme_is_not_a_url() {
        // spec case 4
        assert_eq!(
            tok(";;;malito:example"),
            vec![
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                text("malito"),
                TagOpenOpen { wiki_markup: Some(":".to_string()) },
                text("dd"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                text("example"),
            ]
        );
    }

    #[test]
    fn free_link_inside_image_caption() {
        // spec case 6
        assert_eq!(
            tok("[[File:Example.png|thumb|http://example.com]]"),
            vec![
                WikilinkOpen,
                text("File:Example.png"),
                WikilinkSeparator,
                text("thumb|"),
                ExternalLinkOpen { brackets: false },
                text("http://example.com"),
                ExternalLinkClose,
                WikilinkClose,
            ]
        );
    }

    #[test]
    fn no_free_links_inside_wikilink_title() {
        assert_eq!(
            tok("[[http example.com|mailto:foo]]"),
            vec![
                WikilinkOpen,
                text("http example.com"),
                WikilinkSeparator,
                ExternalLinkOpen { brackets: false },
                text("mailto:foo"),
                ExternalLinkClose,
                WikilinkClose,
            ]
        );
    }

    #[test]
    fn comment_basic() {
        assert_eq!(
            tok("<!-- foo -->"),
            vec![CommentStart, text(" foo "), CommentEnd]
        );
    }

    #[test]
    fn unterminated_comment_is_text() {
        assert_eq!(tok("<!-- foo"), vec![text("<!-- foo")]);
        assert_eq!(tok("<!foo"), vec![text("<!foo")]);
    }

    #[test]
    fn comment_in_template_name() {
        assert_eq!(
            tok("{{foo<!--bar-->}}"),
            vec![
                TemplateOpen,
                text("foo"),
                CommentStart,
                text("bar"),
                CommentEnd,
                TemplateClose,
            ]
        );
    }

    #[test]
    fn named_entity() {
        assert_eq!(
            tok("&nbsp;"),
            vec![HTMLEntityStart, text("nbsp"), HTMLEntityEnd]
        );
    }

    #[test]
    fn unknown_named_entity_is_text() {
        assert_eq!(tok("&bogus;"), vec![text("&bogus;")]);
        assert_eq!(tok("&nbsp"), vec![text("&nbsp")]);
    }

    #[test]
    fn numeric_entities() {
        assert_eq!(
            tok("&#123;"),
            vec![
                HTMLEntityStart,
                HTMLEntityNumeric { hexadecimal: false },
                text("123"),
                HTMLEntityEnd,
            ]
        );
        assert_eq!(
            tok("&#x1F;"),
            vec![
                HTMLEntityStart,
                HTMLEntityNumeric { hexadecimal: true },
                text("1F"),
                HTMLEntityEnd,
            ]
        );
    }

    #[test]
    fn bad_numeric_entities_are_text() {
        assert_eq!(tok("&#X1F;"), vec![text("&#X1F;")]);
        assert_eq!(tok("&#0;"), vec![text("&#0;")]);
        assert_eq!(tok("&#1114112;"), vec![text("&#1114112;")]);
        assert_eq!(tok("&#x;"), vec![text("&#x;")]);
        assert_eq!(tok("&#12a;"), vec![text("&#12a;")]);
    }

    #[test]
    fn tag_basic() {
        assert_eq!(
            tok("<ref>foo</ref>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("ref"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("foo"),
                TagOpenClose,
                text("ref"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn tag_with_quoted_attribute() {
        assert_eq!(
            tok("<b class=\"foo\">bar</b>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("b"),
                TagAttrStart {
                    pad_first: " ".to_string(),
                    pad_before_eq: String::new(),
                    pad_after_eq: String::new(),
                },
                text("class"),
                TagAttrEquals,
                TagAttrQuote { char: "\"".to_string() },
                text("foo"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("bar"),
                TagOpenClose,
                text("b"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn tag_attribute_padding_is_preserved() {
        assert_eq!(
            tok("<b  a = x >y</b>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("b"),
                TagAttrStart {
                    pad_first: "  ".to_string(),
                    pad_before_eq: " ".to_string(),
                    pad_after_eq: " ".to_string(),
                },
                text("a"),
                TagAttrEquals,
                text("x"),
                TagCloseOpen { padding: Some(" ".to_string()), wiki_markup: None },
                text("y"),
                TagOpenClose,
                text("b"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn tag_with_valueless_attributes() {
        assert_eq!(
            tok("<ol reversed start>x</ol>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("ol"),
                TagAttrStart {
                    pad_first: " ".to_string(),
                    pad_before_eq: " ".to_string(),
                    pad_after_eq: String::new(),
                },
                text("reversed"),
                TagAttrStart {
                    pad_first: String::new(),
                    pad_before_eq: String::new(),
                    pad_after_eq: String::new(),
                },
                text("start"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("x"),
                TagOpenClose,
                text("ol"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn selfclosing_tag() {
        assert_eq!(
            tok("<br/>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("br"),
                TagCloseSelfclose {
                    padding: Some(String::new()),
                    implicit: false,
                    wiki_markup: None,
                },
            ]
        );
        assert_eq!(
            tok("<br />"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("br"),
                TagCloseSelfclose {
                    padding: Some(" ".to_string()),
                    implicit: false,
                    wiki_markup: None,
                },
            ]
        );
    }

    #[test]
    fn single_only_tag_closes_implicitly() {
        assert_eq!(
            tok("<br>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("br"),
                TagCloseSelfclose {
                    padding: Some(String::new()),
                    implicit: true,
                    wiki_markup: None,
                },
            ]
        );
    }

    #[test]
    fn single_tag_closes_implicitly_at_end() {
        assert_eq!(
            tok("<li>foo"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("li"),
                TagCloseSelfclose {
                    padding: Some(String::new()),
                    implicit: true,
                    wiki_markup: None,
                },
                text("foo"),
            ]
        );
    }

    #[test]
    fn unclosed_ordinary_tag_is_text() {
        assert_eq!(tok("<b>foo"), vec![text("<b>foo")]);
        assert_eq!(tok("<b foo"), vec![text("<b foo")]);
        assert_eq!(tok("<b>foo</i>"), vec![text("<b>foo</i>")]);
    }

    #[test]
    fn mismatched_close_is_rescanned() {
        // The inner construct survives the enclosing tag's rollback.
        assert_eq!(
            tok("<b>{{foo}}"),
            vec![
                text("<b>"),
                TemplateOpen,
                text("foo"),
                TemplateClose,
            ]
        );
    }

    #[test]
    fn stray_closing_tag_is_text() {
        assert_eq!(tok("</b>"), vec![text("</b>")]);
    }

    #[test]
    fn closing_tag_name_match_ignores_case_and_space() {
        assert_eq!(
            tok("<b>x</B >"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("b"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("x"),
                TagOpenClose,
                text("B "),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn tag_in_wikilink_title_invalidates() {
        assert_eq!(
            tok("[[foo<b>bar</b>]]"),
            vec![
                text("[[foo"),
                TagOpenOpen { wiki_markup: None },
                text("b"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("bar"),
                TagOpenClose,
                text("b"),
                TagCloseClose,
                text("]]"),
            ]
        );
    }

    #[test]
    fn nowiki_body_is_raw_text() {
        assert_eq!(
            tok("<nowiki>{{foo}} [[bar]]</nowiki>"),
            vec![
                TagOpenOpen { wiki_markup: None },
                text("nowiki"),
                TagCloseOpen { padding: Some(String::new()), wiki_markup: None },
                text("{{foo}} [[bar]]"),
                TagOpenClose,
                text("nowiki"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn unclosed_nowiki_is_rescanned() {
        assert_eq!(
            tok("<nowiki>{{foo}}"),
            vec![
                text("<nowiki>"),
                TemplateOpen,
                text("foo"),
                TemplateClose,
            ]
        );
    }

    #[test]
    fn italics_and_bold() {
        assert_eq!(
            tok("''foo''"),
            vec![
                TagOpenOpen { wiki_markup: Some("''".to_string()) },
                text("i"),
                TagCloseOpen { padding: None, wiki_markup: None },
                text("foo"),
                TagOpenClose,
                text("i"),
                TagCloseClose,
            ]
        );
        assert_eq!(
            tok("'''foo'''"),
            vec![
                TagOpenOpen { wiki_markup: Some("'''".to_string()) },
                text("b"),
                TagCloseOpen { padding: None, wiki_markup: None },
                text("foo"),
                TagOpenClose,
                text("b"),
                TagCloseClose,
            ]
        );
    }

    #[test]
    fn unclosed_italics_is_text() {
        assert_eq!(tok("''foo"), vec![text("''foo")]);
    }

    #[test]
    fn list_markers_at_line_start() {
        assert_eq!(
            tok("* foo"),
            vec![
                TagOpenOpen { wiki_markup: Some("*".to_string()) },
                text("li"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                text(" foo"),
            ]
        );
        assert_eq!(tok("foo * bar"), vec![text("foo * bar")]);
    }

    #[test]
    fn dl_term_splits_on_colon() {
        assert_eq!(
            tok(";foo:bar"),
            vec![
                TagOpenOpen { wiki_markup: Some(";".to_string()) },
                text("dt"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                text("foo"),
                TagOpenOpen { wiki_markup: Some(":".to_string()) },
                text("dd"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
                text("bar"),
            ]
        );
    }

    #[test]
    fn horizontal_rule() {
        assert_eq!(
            tok("----"),
            vec![
                TagOpenOpen { wiki_markup: Some("----".to_string()) },
                text("hr"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
            ]
        );
        assert_eq!(
            tok("------"),
            vec![
                TagOpenOpen { wiki_markup: Some("------".to_string()) },
                text("hr"),
                TagCloseSelfclose { padding: None, implicit: false, wiki_markup: None },
            ]
        );
        assert_eq!(tok("x----"), vec![text("x----")]);
    }

    #[test]
    fn depth_ceiling_degrades_to_text() {
        let deep = "{{a|".repeat(MAX_DEPTH * 2);
        let tokens = Tokenizer::new().tokenize(&deep, 0, false).unwrap();
        assert_balanced(&tokens, "deep nesting");
        assert_eq!(render(&tokens), deep);
    }

    const CORPUS: &[&str] = &[
        "",
        "hello, world",
        "{{foo}}",
        "{{foo|bar|key=value}}",
        "{{foo[[bar]]}}",
        "{{foo|{{bar|{{baz}}}}}}",
        "{{foo\n<!-- comment -->|bar}}",
        "{{foobar\n<!-- comment -->invalid|key=value}}",
        "&n{{bs}}p;",
        "{{{foo|default}}}",
        "{{{{foo}}}}",
        "{{{{{foo}}}}}",
        "{{{{{{foo}}}}}}",
        "[[foo]]",
        "[[foo|bar [[baz]]]]",
        "[[foo\nbar]]",
        "[[File:Example.png|thumb|http://example.com]]",
        "[[http://example.com]]",
        "== Head{{ing}} [[with]] {{{funky|{{stuf}}}}} ==",
        "=== x ==",
        "== x ===",
        "====\n",
        "[http://example.com foo bar]",
        "[http://example.com]",
        "[//example.com protocol relative]",
        "see http://example.com. done",
        "http://example.com/foo''bar''",
        ";;;mailto:example",
        ";;;malito:example",
        ";foo:bar",
        "*#;: mixed",
        "----",
        "<ref name=\"x\">cite</ref>",
        "<b  a = x >y</b>",
        "<br><br/><br />",
        "<li>item",
        "<nowiki>{{raw}}</nowiki>",
        "<b>unclosed",
        "</b>",
        "''i'' and '''b''' and '''''ib'''''",
        "''foo",
        "'''''x''",
        "&nbsp;&#123;&#x1F;&bogus;",
        "&#X1F;",
        "a}b}}c}}}d",
        "}}}}",
        "{|\n|-\n| cell\n|}",
        "text with | pipe = equals",
        "\\escaped\\",
        "nested [http://x.com ''label''] link",
    ];

    #[test]
    fn p1_round_trip_fidelity() {
        for input in CORPUS {
            let tokens = tok(input);
            assert_eq!(render(&tokens), *input, "round trip failed for {:?}", input);
        }
    }

    #[test]
    fn p2_well_nestedness() {
        for input in CORPUS {
            let tokens = tok(input);
            assert_balanced(&tokens, input);
        }
    }

    #[test]
    fn p3_literal_text_concatenates() {
        // Inputs that tokenize to a single Text token and whose doubling
        // cannot pair a dangling opener with a fresh one.
        let literals = [
            "plain text",
            "}}}}",
            "]]",
            "a}b}}c}}}d",
            "text with | pipe = equals",
            "\\escaped\\",
            "&bogus;",
        ];
        for input in literals {
            assert_eq!(tok(input), vec![text(input)], "not literal: {:?}", input);
            let doubled = format!("{}{}", input, input);
            assert_eq!(
                tok(&doubled),
                vec![text(&doubled)],
                "literal doubling failed for {:?}",
                input
            );
        }
    }

    #[test]
    fn p4_no_adjacent_text_tokens() {
        for input in CORPUS {
            let tokens = tok(input);
            for pair in tokens.windows(2) {
                assert!(
                    !(pair[0].is_text() && pair[1].is_text()),
                    "adjacent Text tokens for {:?}: {:?}",
                    input,
                    tokens
                );
            }
        }
    }

    #[test]
    fn p5_no_empty_text_tokens() {
        for input in CORPUS {
            for token in tok(input) {
                assert_ne!(
                    token.as_text(),
                    Some(""),
                    "empty Text token for {:?}",
                    input
                );
            }
        }
    }

    #[test]
    fn splitter_keeps_every_byte() {
        let input = "a{{b|c}}d [[e]] <f>&g;\n";
        let pieces = split_keeping_matches(&MARKER_SPLITTER, input);
        assert_eq!(pieces.concat(), input);
    }
}
