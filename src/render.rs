use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(.*?)```").expect("fence pattern"));

const PRE_STYLE: &str = "background:#161b22;padding:10px;border-radius:5px;color:#dcdcdc;";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn inline(text: &str) -> String {
    escape(text).replace('\n', "<br>")
}

/// Renders message text as HTML markup, turning each complete fenced span
/// into a monospace `<pre>` block. Pure and deterministic; callers gate it
/// behind `accumulator::fences_balanced` so an unmatched trailing fence
/// never reaches it mid-block.
pub fn render(text: &str) -> String {
    let mut out = String::new();
    let mut last = 0;

    for caps in FENCED_BLOCK.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let code = caps.get(1).expect("capture").as_str();
        out.push_str(&inline(&text[last..whole.start()]));
        out.push_str(&format!("<pre style='{}'>{}</pre>", PRE_STYLE, inline(code)));
        last = whole.end();
    }
    out.push_str(&inline(&text[last..]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_only_escapes_and_breaks() {
        let rendered = render("a < b & c > d\nnext line");
        assert_eq!(rendered, "a &lt; b &amp; c &gt; d<br>next line");
    }

    #[test]
    fn test_code_block_becomes_pre_with_escaped_content() {
        let rendered = render("```py\nx=1\n```");
        assert!(rendered.starts_with("<pre"));
        assert!(rendered.contains("py<br>x=1<br>"));
        assert!(!rendered.contains("```"));
    }

    #[test]
    fn test_html_escaped_inside_code() {
        let rendered = render("```<a href=\"x\">&</a>```");
        assert!(rendered.contains("&lt;a href=\"x\"&gt;&amp;&lt;/a&gt;"));
        assert!(!rendered.contains("<a "));
    }

    #[test]
    fn test_text_around_blocks_kept_in_order() {
        let rendered = render("before ```one``` between ```two``` after");
        let first_pre = rendered.find("<pre").unwrap();
        let second_pre = rendered.rfind("<pre").unwrap();
        assert!(rendered.starts_with("before "));
        assert!(rendered.ends_with(" after"));
        assert!(first_pre < second_pre);
        assert!(rendered.contains("one"));
        assert!(rendered.contains("two"));
    }

    #[test]
    fn test_split_is_non_greedy() {
        // Two separate blocks, not one block swallowing the middle.
        let rendered = render("```a``` mid ```b```");
        assert!(rendered.contains("</pre> mid <pre"));
    }

    #[test]
    fn test_deterministic() {
        let text = "x ```code\nline``` y";
        assert_eq!(render(text), render(text));
    }
}
