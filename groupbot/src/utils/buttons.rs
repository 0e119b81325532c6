use crate::message::UrlButton;

const SEPARATORS: [char; 4] = ['|', ' ', '-', ','];
const URL_PREFIXES: [&str; 3] = ["http://", "https://", "t.me/"];

/// Result of parsing a button block, one button per line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedButtons {
    pub buttons: Vec<UrlButton>,
    /// 1-based numbers of lines that could not be parsed
    pub invalid_lines: Vec<usize>,
}

/// Parse one `text|url` line. Also accepts space, `-` and `,` as separator.
pub fn parse_button_line(line: &str) -> Option<UrlButton> {
    let line = line.trim();
    SEPARATORS.iter().find_map(|separator| {
        let (text, url) = line.split_once(*separator)?;
        let (text, url) = (text.trim(), url.trim());
        if text.is_empty() || !URL_PREFIXES.iter().any(|prefix| url.starts_with(prefix)) {
            return None;
        }
        let url = if url.starts_with("t.me/") {
            format!("https://{url}")
        } else {
            url.to_string()
        };
        url::Url::parse(&url).ok()?;
        Some(UrlButton {
            text: text.to_string(),
            url,
        })
    })
}

/// Parse a multi-line button block. Lines beyond `max` are reported as invalid.
pub fn parse_buttons(input: &str, max: usize) -> ParsedButtons {
    let mut parsed = ParsedButtons::default();
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_button_line(line) {
            Some(button) if parsed.buttons.len() < max => parsed.buttons.push(button),
            _ => parsed.invalid_lines.push(index + 1),
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_button_line_separators() {
        let expected = UrlButton {
            text: "官网".to_string(),
            url: "https://example.com".to_string(),
        };
        assert_eq!(parse_button_line("官网|https://example.com"), Some(expected.clone()));
        assert_eq!(parse_button_line("官网 | https://example.com"), Some(expected.clone()));
        assert_eq!(parse_button_line("官网 https://example.com"), Some(expected.clone()));
        assert_eq!(parse_button_line("官网-https://example.com"), Some(expected.clone()));
        assert_eq!(parse_button_line("官网,https://example.com"), Some(expected));
    }

    #[test]
    fn test_parse_button_line_telegram_link() {
        let button = parse_button_line("联系我们 t.me/username").unwrap();
        assert_eq!(button.url, "https://t.me/username");
    }

    #[test]
    fn test_parse_button_line_rejects() {
        assert_eq!(parse_button_line("no url here"), None);
        assert_eq!(parse_button_line("|https://example.com"), None);
        assert_eq!(parse_button_line("ftp|ftp://example.com"), None);
    }

    #[test]
    fn test_parse_buttons() {
        let parsed = parse_buttons("A|https://a.com\n\nbroken\nB https://b.com\nC https://c.com", 2);
        assert_eq!(parsed.buttons.len(), 2);
        assert_eq!(parsed.buttons[1].text, "B");
        assert_eq!(parsed.invalid_lines, vec![3, 5]);
    }
}
