//! Deterministic conversion between plain text and Atlassian Document Format
//! (`spec.md` §4.6.e). One direction is a simple line-oriented scan; the
//! other is a recursive walk of the node tree.

use serde_json::{json, Value};

/// `convertToAdf`: scans `text` line by line. `#`/`##`/`###` become heading
/// levels 1-3, `- `/`* ` become a one-item bullet list, fenced ``` blocks
/// aggregate into a single code block, everything else is a paragraph.
pub fn convert_to_adf(text: &str) -> Value {
    let mut content = Vec::new();
    let mut lines = text.lines().peekable();
    let mut saw_any = false;

    while let Some(line) = lines.next() {
        saw_any = true;
        if let Some(lang) = line.strip_prefix("```").map(str::trim) {
            let mut code_lines = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    break;
                }
                code_lines.push(inner);
            }
            let mut attrs = json!({});
            if !lang.is_empty() {
                attrs["language"] = json!(lang);
            }
            content.push(json!({
                "type": "codeBlock",
                "attrs": attrs,
                "content": [{"type": "text", "text": code_lines.join("\n")}],
            }));
            continue;
        }

        if let Some(heading) = heading_level(line) {
            let (level, rest) = heading;
            content.push(heading_node(level, rest));
            continue;
        }

        if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            content.push(json!({
                "type": "bulletList",
                "content": [{
                    "type": "listItem",
                    "content": [paragraph_node(item)],
                }],
            }));
            continue;
        }

        content.push(paragraph_node(line));
    }

    if !saw_any {
        content.push(paragraph_node(""));
    }

    json!({"version": 1, "type": "doc", "content": content})
}

fn heading_level(line: &str) -> Option<(u8, &str)> {
    for (prefix, level) in [("### ", 3u8), ("## ", 2), ("# ", 1)] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return Some((level, rest));
        }
    }
    None
}

fn heading_node(level: u8, text: &str) -> Value {
    json!({
        "type": "heading",
        "attrs": {"level": level},
        "content": [{"type": "text", "text": text}],
    })
}

fn paragraph_node(text: &str) -> Value {
    if text.is_empty() {
        json!({"type": "paragraph", "content": []})
    } else {
        json!({"type": "paragraph", "content": [{"type": "text", "text": text}]})
    }
}

/// `convertFromAdf`: recursively extracts text from the node tree. Unknown
/// node types degrade to the concatenation of their children's text.
pub fn convert_from_adf(adf: &Value) -> String {
    match adf.get("content").and_then(Value::as_array) {
        Some(nodes) => nodes.iter().map(convert_node).collect::<Vec<_>>().join("\n"),
        None => String::new(),
    }
}

fn convert_node(node: &Value) -> String {
    let node_type = node.get("type").and_then(Value::as_str).unwrap_or("");
    match node_type {
        "text" => node.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
        "heading" => {
            let level = node.get("attrs").and_then(|a| a.get("level")).and_then(Value::as_u64).unwrap_or(1);
            format!("{} {}", "#".repeat(level as usize), children_text(node, ""))
        }
        "bulletList" | "orderedList" => node
            .get("content")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(|i| format!("- {}", children_text(i, "\n"))).collect::<Vec<_>>().join("\n"))
            .unwrap_or_default(),
        "codeBlock" => format!("```\n{}\n```", children_text(node, "\n")),
        "paragraph" => children_text(node, ""),
        _ => children_text(node, ""),
    }
}

fn children_text(node: &Value, join_with: &str) -> String {
    node.get("content")
        .and_then(Value::as_array)
        .map(|nodes| nodes.iter().map(convert_node).collect::<Vec<_>>().join(join_with))
        .unwrap_or_default()
}
