//! Static data about wiki markup: external-link URI schemes, HTML tag
//! classification, wiki-markup shorthands, and the named HTML entity table.
//!
//! These are tables rather than logic so that additions are data edits.

use phf::phf_set;

/// Recognized URI schemes. The flag records whether the scheme requires
/// `//` after the colon when written as a free link.
static URI_SCHEMES: &[(&str, bool)] = &[
    ("bitcoin", false),
    ("ftp", true),
    ("ftps", true),
    ("geo", false),
    ("git", true),
    ("gopher", true),
    ("http", true),
    ("https", true),
    ("irc", true),
    ("ircs", true),
    ("magnet", false),
    ("mailto", false),
    ("mms", true),
    ("news", false),
    ("nntp", true),
    ("redis", true),
    ("sftp", true),
    ("sip", false),
    ("sips", false),
    ("sms", false),
    ("ssh", true),
    ("svn", true),
    ("tel", false),
    ("telnet", true),
    ("urn", false),
    ("worldwind", true),
    ("xmpp", false),
];

/// Tags whose bodies are swallowed whole instead of being tokenized.
static PARSER_BLACKLIST: &[&str] = &[
    "categorytree",
    "ce",
    "chem",
    "gallery",
    "graph",
    "hiero",
    "imagemap",
    "inputbox",
    "math",
    "nowiki",
    "pre",
    "score",
    "section",
    "source",
    "syntaxhighlight",
    "templatedata",
    "timeline",
];

static INVISIBLE_TAGS: &[&str] = &[
    "categorytree",
    "gallery",
    "graph",
    "imagemap",
    "inputbox",
    "math",
    "score",
    "section",
    "templatedata",
    "timeline",
];

static SINGLE_ONLY: &[&str] = &["br", "wbr", "hr", "meta", "link", "img"];
static SINGLE: &[&str] = &[
    "br", "wbr", "hr", "meta", "link", "img", "li", "dt", "dd", "th", "td", "tr",
];

/// The HTML 4.01 named character references, without the trailing `;`.
static HTML_ENTITIES: phf::Set<&'static str> = phf_set! {
    "AElig", "Aacute", "Acirc", "Agrave", "Alpha", "Aring", "Atilde", "Auml",
    "Beta", "Ccedil", "Chi", "Dagger", "Delta", "ETH", "Eacute", "Ecirc",
    "Egrave", "Epsilon", "Eta", "Euml", "Gamma", "Iacute", "Icirc", "Igrave",
    "Iota", "Iuml", "Kappa", "Lambda", "Mu", "Ntilde", "Nu", "OElig",
    "Oacute", "Ocirc", "Ograve", "Omega", "Omicron", "Oslash", "Otilde",
    "Ouml", "Phi", "Pi", "Prime", "Psi", "Rho", "Scaron", "Sigma", "THORN",
    "Tau", "Theta", "Uacute", "Ucirc", "Ugrave", "Upsilon", "Uuml", "Xi",
    "Yacute", "Yuml", "Zeta", "aacute", "acirc", "acute", "aelig", "agrave",
    "alefsym", "alpha", "amp", "and", "ang", "aring", "asymp", "atilde",
    "auml", "bdquo", "beta", "brvbar", "bull", "cap", "ccedil", "cedil",
    "cent", "chi", "circ", "clubs", "cong", "copy", "crarr", "cup", "curren",
    "dArr", "dagger", "darr", "deg", "delta", "diams", "divide", "eacute",
    "ecirc", "egrave", "empty", "emsp", "ensp", "epsilon", "equiv", "eta",
    "eth", "euml", "euro", "exist", "fnof", "forall", "frac12", "frac14",
    "frac34", "frasl", "gamma", "ge", "gt", "hArr", "harr", "hearts",
    "hellip", "iacute", "icirc", "iexcl", "igrave", "image", "infin", "int",
    "iota", "iquest", "isin", "iuml", "kappa", "lArr", "lambda", "lang",
    "laquo", "larr", "lceil", "ldquo", "le", "lfloor", "lowast", "loz",
    "lrm", "lsaquo", "lsquo", "lt", "macr", "mdash", "micro", "middot",
    "minus", "mu", "nabla", "nbsp", "ndash", "ne", "ni", "not", "notin",
    "nsub", "ntilde", "nu", "oacute", "ocirc", "oelig", "ograve", "oline",
    "omega", "omicron", "oplus", "or", "ordf", "ordm", "oslash", "otilde",
    "otimes", "ouml", "para", "part", "permil", "perp", "phi", "pi", "piv",
    "plusmn", "pound", "prime", "prod", "prop", "psi", "quot", "rArr",
    "radic", "rang", "raquo", "rarr", "rceil", "rdquo", "real", "reg",
    "rfloor", "rho", "rlm", "rsaquo", "rsquo", "sbquo", "scaron", "sdot",
    "sect", "shy", "sigma", "sigmaf", "sim", "spades", "sub", "sube", "sum",
    "sup", "sup1", "sup2", "sup3", "supe", "szlig", "tau", "there4",
    "theta", "thetasym", "thinsp", "thorn", "tilde", "times", "trade",
    "uArr", "uacute", "uarr", "ucirc", "ugrave", "uml", "upsih", "upsilon",
    "uuml", "weierp", "xi", "yacute", "yen", "yuml", "zeta", "zwj", "zwnj",
};

/// Return the HTML tag associated with the given wiki-markup shorthand.
pub fn get_html_tag(markup: &str) -> Option<&'static str> {
    match markup {
        "#" | "*" => Some("li"),
        ";" => Some("dt"),
        ":" => Some("dd"),
        _ => None,
    }
}

/// Return whether the given tag's contents should be passed to the parser.
pub fn is_parsable(tag: &str) -> bool {
    let tag_lower = tag.to_lowercase();
    !PARSER_BLACKLIST.contains(&tag_lower.as_str())
}

/// Return whether or not the given tag contains visible text.
pub fn is_visible(tag: &str) -> bool {
    let tag_lower = tag.to_lowercase();
    !INVISIBLE_TAGS.contains(&tag_lower.as_str())
}

/// Return whether the given tag can exist without a close tag.
pub fn is_single(tag: &str) -> bool {
    let tag_lower = tag.to_lowercase();
    SINGLE.contains(&tag_lower.as_str())
}

/// Return whether the given tag must exist without a close tag.
pub fn is_single_only(tag: &str) -> bool {
    let tag_lower = tag.to_lowercase();
    SINGLE_ONLY.contains(&tag_lower.as_str())
}

/// Return whether *scheme* is valid for external links.
///
/// With `slashes`, any known scheme is accepted; without, only schemes that
/// do not require `//` are.
pub fn is_scheme(scheme: &str, slashes: bool) -> bool {
    let scheme_lower = scheme.to_lowercase();
    for &(s, needs_slashes) in URI_SCHEMES {
        if s == scheme_lower {
            return if slashes { true } else { !needs_slashes };
        }
    }
    false
}

/// Return whether *name* is a known named HTML entity (case-sensitive,
/// without `&` and `;`).
pub fn is_entity(name: &str) -> bool {
    HTML_ENTITIES.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes() {
        assert!(is_scheme("http", true));
        assert!(is_scheme("HTTP", true));
        assert!(!is_scheme("http", false));
        assert!(is_scheme("mailto", false));
        assert!(is_scheme("mailto", true));
        assert!(!is_scheme("malito", false));
        assert!(!is_scheme("", false));
    }

    #[test]
    fn tag_classes() {
        assert!(is_single_only("br"));
        assert!(is_single_only("BR"));
        assert!(is_single("li"));
        assert!(!is_single_only("li"));
        assert!(!is_parsable("nowiki"));
        assert!(is_parsable("ref"));
        assert!(!is_visible("gallery"));
        assert!(is_visible("b"));
    }

    #[test]
    fn markup_shorthands() {
        assert_eq!(get_html_tag(";"), Some("dt"));
        assert_eq!(get_html_tag(":"), Some("dd"));
        assert_eq!(get_html_tag("#"), Some("li"));
        assert_eq!(get_html_tag("*"), Some("li"));
        assert_eq!(get_html_tag("|"), None);
    }

    #[test]
    fn entities() {
        assert!(is_entity("nbsp"));
        assert!(is_entity("AElig"));
        assert!(!is_entity("NBSP"));
        assert!(!is_entity("bogus"));
    }
}
