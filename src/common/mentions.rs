//! Inline mention markup: `@[Display Name](userId)` embedded in plain
//! message text. The raw text is what gets persisted and redisplayed, so the
//! same scanner runs on send (to collect the `mentions` list) and on render
//! (to highlight). Malformed spans fall back to literal text.

#[derive(Debug, Clone, PartialEq)]
pub enum MentionToken {
    Text(String),
    Mention { name: String, id: String },
}

/// Scan `content` into a token stream. Anything that is not a well-formed
/// `@[name](id)` span stays literal text.
pub fn parse(content: &str) -> Vec<MentionToken> {
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < content.len() {
        if content[i..].starts_with("@[") {
            if let Some((name, id, end)) = scan_mention(content, i) {
                if text_start < i {
                    tokens.push(MentionToken::Text(content[text_start..i].to_string()));
                }
                tokens.push(MentionToken::Mention { name, id });
                i = end;
                text_start = i;
                continue;
            }
        }
        i += content[i..]
            .chars()
            .next()
            .map(|c| c.len_utf8())
            .unwrap_or(1);
    }

    if text_start < content.len() {
        tokens.push(MentionToken::Text(content[text_start..].to_string()));
    }
    tokens
}

// Returns (name, id, byte offset just past the closing paren) when the span
// starting at `start` is well-formed.
fn scan_mention(content: &str, start: usize) -> Option<(String, String, usize)> {
    let name_start = start + 2;
    let name_len = content[name_start..].find(']')?;
    let after_name = name_start + name_len + 1;
    let rest = &content[after_name..];
    if !rest.starts_with('(') {
        return None;
    }
    let id_len = rest.find(')')?;
    let id = &rest[1..id_len];
    if id.is_empty() {
        return None;
    }
    let name = &content[name_start..name_start + name_len];
    Some((name.to_string(), id.to_string(), after_name + id_len + 1))
}

/// Collect the user ids referenced by `content`, in order of first
/// appearance, without duplicates. This is what rides alongside the raw text
/// as the `mentions` list on send.
pub fn extract_mention_ids(content: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for token in parse(content) {
        if let MentionToken::Mention { id, .. } = token {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Reassemble tokens into the canonical wire text.
pub fn render(tokens: &[MentionToken]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            MentionToken::Text(text) => out.push_str(text),
            MentionToken::Mention { name, id } => {
                out.push_str(&format!("@[{}]({})", name, id));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mention_between_text() {
        let tokens = parse("Hello @[Ana](u2), ciao");
        assert_eq!(
            tokens,
            vec![
                MentionToken::Text("Hello ".to_string()),
                MentionToken::Mention {
                    name: "Ana".to_string(),
                    id: "u2".to_string()
                },
                MentionToken::Text(", ciao".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_spans_stay_literal() {
        assert_eq!(
            parse("@[Ana](u2"),
            vec![MentionToken::Text("@[Ana](u2".to_string())]
        );
        assert_eq!(
            parse("@[Ana] (u2)"),
            vec![MentionToken::Text("@[Ana] (u2)".to_string())]
        );
        assert_eq!(parse("@[Ana]()"), vec![MentionToken::Text("@[Ana]()".to_string())]);
    }

    #[test]
    fn extracts_ids_in_order_without_duplicates() {
        let ids = extract_mention_ids("@[Ana](u2) hi @[Bo](u3) again @[Ana](u2)");
        assert_eq!(ids, vec!["u2".to_string(), "u3".to_string()]);
    }

    #[test]
    fn render_roundtrips_canonical_text() {
        let text = "Hello @[Ana Maria](u2)! @[Bo](u3)";
        assert_eq!(render(&parse(text)), text);
    }

    #[test]
    fn handles_multibyte_text_around_mentions() {
        let text = "héllo @[Žana](u9) 👋";
        let tokens = parse(text);
        assert_eq!(tokens.len(), 3);
        assert_eq!(render(&tokens), text);
    }
}
