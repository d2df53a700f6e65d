//! Allow-list sanitizing of HTML bodies before they are served.

use std::borrow::Cow;

use ammonia::Builder;

const TABLE_CELLS: [&str; 2] = ["td", "th"];
const STYLED: [&str; 5] = ["p", "div", "span", "td", "th"];

/// Strip scripts, event handlers and anything outside the allow-list from
/// an HTML body.
///
/// Links get `rel="nofollow noopener noreferrer"`. Images keep `data:`
/// sources; other image URLs survive here but the served CSP blocks them.
pub fn sanitize_markup(html: &str) -> String {
    let mut builder = Builder::default();
    builder
        .add_tags([
            "p", "br", "strong", "em", "u", "s", "del", "ins", "h1", "h2", "h3", "h4", "h5", "h6",
            "ul", "ol", "li", "blockquote", "pre", "code", "table", "thead", "tbody", "tfoot",
            "tr", "th", "td", "div", "span", "hr",
        ])
        .add_generic_attributes(["class"])
        .add_tag_attributes("img", ["alt", "title"])
        .link_rel(Some("nofollow noopener noreferrer"))
        .add_url_schemes(["data"])
        .attribute_filter(|element, attribute, value| {
            if value.trim_start().to_ascii_lowercase().starts_with("data:")
                && !(element == "img" && attribute == "src")
            {
                return None;
            }
            Some(Cow::Borrowed(value))
        });
    for tag in STYLED {
        builder.add_tag_attributes(tag, ["style"]);
    }
    for tag in TABLE_CELLS {
        builder.add_tag_attributes(tag, ["colspan", "rowspan"]);
    }
    builder.clean(html).to_string()
}
