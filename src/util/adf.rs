use serde_json::{json, Value};

/// Block nodes whose inline content can carry a prefix.
const TEXT_BLOCKS: &[&str] = &["paragraph", "heading"];

/// True for an Atlassian Document Format root: `{"type": "doc", "content": [...]}`.
pub fn is_adf_doc(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("doc")
        && value.get("content").map_or(false, Value::is_array)
}

/// Flatten an ADF document to plain text, one line per text block.
pub fn adf_to_text(value: &Value) -> Option<String> {
    if !is_adf_doc(value) {
        return None;
    }
    let mut lines = Vec::new();
    collect_lines(value.get("content")?, &mut lines);
    Some(lines.join("\n"))
}

fn collect_lines(nodes: &Value, lines: &mut Vec<String>) {
    let Some(nodes) = nodes.as_array() else {
        return;
    };
    for node in nodes {
        let node_type = node.get("type").and_then(Value::as_str);
        if node_type.map_or(false, |t| TEXT_BLOCKS.contains(&t)) {
            lines.push(inline_text(node));
        } else if let Some(children) = node.get("content") {
            collect_lines(children, lines);
        }
    }
}

fn inline_text(block: &Value) -> String {
    let mut out = String::new();
    if let Some(inline) = block.get("content").and_then(Value::as_array) {
        for node in inline {
            match node.get("type").and_then(Value::as_str) {
                Some("text") => out.push_str(node.get("text").and_then(Value::as_str).unwrap_or("")),
                Some("hardBreak") => out.push('\n'),
                _ => {}
            }
        }
    }
    out
}

/// Build a minimal ADF document, one paragraph per non-blank line.
pub fn text_to_adf(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| json!({"type": "paragraph", "content": [{"type": "text", "text": line}]}))
        .collect();
    let content = if paragraphs.is_empty() {
        vec![json!({"type": "paragraph", "content": []})]
    } else {
        paragraphs
    };
    json!({"type": "doc", "version": 1, "content": content})
}

/// Insert `prefix` ahead of the first text block of an ADF document.
///
/// Returns `None` when the document shape isn't one we can edit safely; callers
/// fall back to the unmodified value. A document whose first text node already
/// starts with the prefix is returned unchanged.
pub fn prefix_adf(doc: &Value, prefix: &str) -> Option<Value> {
    if !is_adf_doc(doc) || prefix.is_empty() {
        return None;
    }
    let mut doc = doc.clone();
    let prefix_node = json!({"type": "text", "text": format!("{prefix} ")});

    let content = doc.get_mut("content")?.as_array_mut()?;
    if content.is_empty() {
        content.push(json!({"type": "paragraph", "content": [prefix_node]}));
        return Some(doc);
    }

    let path = find_text_block(content)?;
    let block = node_at_mut(content, &path)?.as_object_mut()?;
    let inline = block
        .entry("content")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()?;

    let already_prefixed = inline
        .iter()
        .find(|n| n.get("type").and_then(Value::as_str) == Some("text"))
        .map(|n| n.get("text").and_then(Value::as_str).map(|t| t.starts_with(prefix)));
    match already_prefixed {
        Some(None) => return None,
        Some(Some(true)) => {}
        _ => inline.insert(0, prefix_node),
    }
    Some(doc)
}

fn find_text_block(nodes: &[Value]) -> Option<Vec<usize>> {
    for (i, node) in nodes.iter().enumerate() {
        let node_type = node.get("type").and_then(Value::as_str);
        if node_type.map_or(false, |t| TEXT_BLOCKS.contains(&t)) {
            return Some(vec![i]);
        }
        if let Some(children) = node.get("content").and_then(Value::as_array) {
            if let Some(mut path) = find_text_block(children) {
                path.insert(0, i);
                return Some(path);
            }
        }
    }
    None
}

fn node_at_mut<'a>(nodes: &'a mut [Value], path: &[usize]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let node = nodes.get_mut(*first)?;
    if rest.is_empty() {
        return Some(node);
    }
    let children = node.get_mut("content")?.as_array_mut()?;
    node_at_mut(children, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(paragraphs: &[&str]) -> Value {
        text_to_adf(&paragraphs.join("\n"))
    }

    #[test]
    fn text_round_trips_through_adf() {
        let value = doc(&["Login fails", "on Safari"]);
        assert!(is_adf_doc(&value));
        assert_eq!(adf_to_text(&value).as_deref(), Some("Login fails\non Safari"));
    }

    #[test]
    fn blank_text_gives_one_empty_paragraph() {
        let value = text_to_adf("   \n");
        assert_eq!(value["content"].as_array().unwrap().len(), 1);
        assert_eq!(value["content"][0]["content"], json!([]));
    }

    #[test]
    fn non_documents_are_not_adf() {
        assert!(!is_adf_doc(&json!("plain")));
        assert!(!is_adf_doc(&json!({"type": "paragraph", "content": []})));
        assert!(!is_adf_doc(&json!({"type": "doc"})));
        assert_eq!(adf_to_text(&json!({"value": "High"})), None);
    }

    #[test]
    fn prefix_lands_before_first_text() {
        let out = prefix_adf(&doc(&["Login fails"]), "[MB-EAL]").unwrap();
        let inline = out["content"][0]["content"].as_array().unwrap();
        assert_eq!(inline[0], json!({"type": "text", "text": "[MB-EAL] "}));
        assert_eq!(inline[1]["text"], "Login fails");
        assert_eq!(adf_to_text(&out).as_deref(), Some("[MB-EAL] Login fails"));
    }

    #[test]
    fn prefix_is_idempotent() {
        let once = prefix_adf(&doc(&["Login fails"]), "[P]").unwrap();
        let twice = prefix_adf(&once, "[P]").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn prefix_finds_paragraph_nested_in_list() {
        let value = json!({
            "type": "doc", "version": 1,
            "content": [
                {"type": "rule"},
                {"type": "bulletList", "content": [
                    {"type": "listItem", "content": [
                        {"type": "paragraph", "content": [{"type": "text", "text": "item"}]}
                    ]}
                ]}
            ]
        });
        let out = prefix_adf(&value, "[P]").unwrap();
        let para = &out["content"][1]["content"][0]["content"][0];
        assert_eq!(para["content"][0]["text"], "[P] ");
        assert_eq!(out["content"][0], json!({"type": "rule"}));
    }

    #[test]
    fn prefix_fills_empty_document_and_empty_paragraph() {
        let empty = json!({"type": "doc", "version": 1, "content": []});
        let out = prefix_adf(&empty, "[P]").unwrap();
        assert_eq!(adf_to_text(&out).as_deref(), Some("[P] "));

        let out = prefix_adf(&text_to_adf(""), "[P]").unwrap();
        assert_eq!(out["content"][0]["content"][0]["text"], "[P] ");
    }

    #[test]
    fn unrecognized_shapes_fall_back() {
        let only_code = json!({"type": "doc", "version": 1, "content": [
            {"type": "codeBlock", "attrs": {}}
        ]});
        assert_eq!(prefix_adf(&only_code, "[P]"), None);

        let broken_text = json!({"type": "doc", "version": 1, "content": [
            {"type": "paragraph", "content": [{"type": "text"}]}
        ]});
        assert_eq!(prefix_adf(&broken_text, "[P]"), None);

        assert_eq!(prefix_adf(&json!("not a doc"), "[P]"), None);
    }
}
