//! Rendering canonical messages into provider API payloads.
//!
//! Body selection runs in priority order over `helper_metadata`: interactive
//! buttons, interactive list, document, image, plain text. String fields are
//! truncated to the provider's documented limits (by characters).

use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};
use url::Url;

use tb_common::Message;

use crate::turn::TurnApiClient;
use crate::Result;

const BODY_TEXT_LIMIT: usize = 1024;
const HEADER_TEXT_LIMIT: usize = 60;
const FOOTER_TEXT_LIMIT: usize = 60;
const BUTTON_COUNT_LIMIT: usize = 3;
const BUTTON_ID_LIMIT: usize = 256;
const BUTTON_TITLE_LIMIT: usize = 20;
const LIST_BUTTON_LIMIT: usize = 20;
const SECTION_COUNT_LIMIT: usize = 10;
const ROW_ID_LIMIT: usize = 200;
const ROW_TITLE_LIMIT: usize = 24;

fn truncate(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}

/// Final path segment of a URL, percent-decoded with `+` treated as space.
pub fn filename_from_url(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let decoded = percent_decode_str(&path.replace('+', " "))
        .decode_utf8_lossy()
        .to_string();
    decoded
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Small URL predicate used to decide whether a button header is a media
/// reference or literal text.
fn is_valid_url(value: &str) -> bool {
    if value.contains(['\t', '\r', '\n']) {
        return false;
    }
    match Url::parse(value) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https" | "ftp" | "ftps") && url.has_host()
        }
        Err(_) => false,
    }
}

/// Build the JSON body for `POST /v1/messages`, uploading referenced media
/// as needed.
pub async fn build_payload(client: &TurnApiClient, message: &Message) -> Result<Value> {
    let mut data = Map::new();
    data.insert("to".to_string(), json!(message.to_addr));
    let content = message.content.as_deref().unwrap_or("");

    if let Some(buttons) = message.buttons() {
        let mut interactive = Map::new();
        interactive.insert("type".to_string(), json!("button"));
        interactive.insert(
            "body".to_string(),
            json!({"text": truncate(content, BODY_TEXT_LIMIT)}),
        );

        let rendered: Vec<Value> = buttons
            .iter()
            .take(BUTTON_COUNT_LIMIT)
            .filter_map(Value::as_str)
            .map(|option| {
                json!({
                    "type": "reply",
                    "reply": {
                        "id": truncate(option, BUTTON_ID_LIMIT),
                        "title": truncate(option, BUTTON_TITLE_LIMIT),
                    },
                })
            })
            .collect();
        interactive.insert("action".to_string(), json!({"buttons": rendered}));

        if let Some(header) = message.header() {
            interactive.insert("header".to_string(), button_header(client, header).await?);
        }
        if let Some(footer) = message.footer() {
            interactive.insert(
                "footer".to_string(),
                json!({"text": truncate(footer, FOOTER_TEXT_LIMIT)}),
            );
        }

        data.insert("type".to_string(), json!("interactive"));
        data.insert("interactive".to_string(), Value::Object(interactive));
    } else if let Some(sections) = message.sections() {
        let mut interactive = Map::new();
        interactive.insert("type".to_string(), json!("list"));
        interactive.insert(
            "body".to_string(),
            json!({"text": truncate(content, BODY_TEXT_LIMIT)}),
        );

        let mut action = Map::new();
        if let Some(button) = message.list_button() {
            action.insert("button".to_string(), json!(truncate(button, LIST_BUTTON_LIMIT)));
        }
        action.insert(
            "sections".to_string(),
            Value::Array(
                sections
                    .iter()
                    .take(SECTION_COUNT_LIMIT)
                    .map(limit_section)
                    .collect(),
            ),
        );
        interactive.insert("action".to_string(), Value::Object(action));

        if let Some(header) = message.header() {
            interactive.insert(
                "header".to_string(),
                json!({"type": "text", "text": truncate(header, HEADER_TEXT_LIMIT)}),
            );
        }
        if let Some(footer) = message.footer() {
            interactive.insert(
                "footer".to_string(),
                json!({"text": truncate(footer, FOOTER_TEXT_LIMIT)}),
            );
        }

        data.insert("type".to_string(), json!("interactive"));
        data.insert("interactive".to_string(), Value::Object(interactive));
    } else if let Some(document_url) = message.document_url() {
        let media = client.upload_media(document_url).await?;
        data.insert("type".to_string(), json!("document"));
        data.insert(
            "document".to_string(),
            json!({
                "id": media.media_id,
                "filename": filename_from_url(document_url),
            }),
        );
    } else if let Some(image_url) = message.image_url() {
        let media = client.upload_media(image_url).await?;
        let mut image = Map::new();
        image.insert("id".to_string(), json!(media.media_id));
        if !content.is_empty() {
            image.insert("caption".to_string(), json!(content));
        }
        data.insert("type".to_string(), json!("image"));
        data.insert("image".to_string(), Value::Object(image));
    } else {
        data.insert("text".to_string(), json!({"body": content}));
    }

    Ok(Value::Object(data))
}

/// Header object for a buttons message. A URL-shaped header is uploaded and
/// typed by its source content type; anything else is literal text.
async fn button_header(client: &TurnApiClient, header: &str) -> Result<Value> {
    if !is_valid_url(header) {
        return Ok(json!({"type": "text", "text": truncate(header, HEADER_TEXT_LIMIT)}));
    }

    let media = client.upload_media(header).await?;
    Ok(match media.content_type.as_str() {
        "image/jpeg" | "image/png" => {
            json!({"type": "image", "image": {"id": media.media_id}})
        }
        "video/mp4" | "video/3gpp" => {
            json!({"type": "video", "video": {"id": media.media_id}})
        }
        _ => json!({
            "type": "document",
            "document": {
                "id": media.media_id,
                "filename": filename_from_url(header),
            },
        }),
    })
}

/// Apply row-level limits inside one list section, leaving everything else
/// (descriptions, unknown keys) untouched.
fn limit_section(section: &Value) -> Value {
    let mut section = section.clone();
    if let Some(rows) = section.get_mut("rows").and_then(Value::as_array_mut) {
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                let id = truncate(id, ROW_ID_LIMIT);
                row["id"] = json!(id);
            }
            if let Some(title) = row.get("title").and_then(Value::as_str) {
                let title = truncate(title, ROW_TITLE_LIMIT);
                row["title"] = json!(title);
            }
        }
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_percent_and_plus_decoded() {
        assert_eq!(
            filename_from_url("http://example.org/cached+%26.pdf"),
            "cached &.pdf"
        );
        assert_eq!(
            filename_from_url("http://example.org/docs/test_document.pdf"),
            "test_document.pdf"
        );
    }

    #[test]
    fn url_predicate() {
        assert!(is_valid_url("http://example.org/image.png"));
        assert!(is_valid_url("https://example.org"));
        assert!(!is_valid_url("test header"));
        assert!(!is_valid_url("http://exa\nmple.org"));
        assert!(!is_valid_url("file:///etc/passwd"));
    }

    #[test]
    fn section_rows_are_limited() {
        let section = serde_json::json!({
            "title": "s1",
            "rows": [{
                "id": "id ".repeat(200),
                "title": "title ".repeat(6),
                "description": "row 1",
            }],
        });
        let limited = limit_section(&section);
        let row = &limited["rows"][0];
        assert_eq!(row["id"].as_str().unwrap().chars().count(), 200);
        assert_eq!(row["title"].as_str().unwrap().chars().count(), 24);
        assert_eq!(row["description"], "row 1");
        assert_eq!(limited["title"], "s1");
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
    }
}
