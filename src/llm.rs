use regex::Regex;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::{sync::LazyLock, time::Duration};

#[derive(Debug, Clone)]
pub struct LlmClient {
    pub base: String,
    pub token: String,
    pub model: String,
}

impl LlmClient {
    #[must_use]
    pub const fn new(base: String, token: String, model: String) -> Self {
        Self { base, token, model }
    }

    /// # Errors
    ///
    /// Will return err if the request fails or if the response doesn't carry
    /// a parseable JSON object.
    pub async fn chat_json(
        &self,
        http: &reqwest::Client,
        system: &str,
        user: &str,
        temperature: f32,
        timeout: Duration,
        max_tokens: Option<u32>,
    ) -> anyhow::Result<JsonValue> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Body<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            #[serde(skip_serializing_if = "Option::is_none")]
            max_tokens: Option<u32>,
            response_format: JsonValue,
        }

        let url = format!("{}/chat/completions", self.base.trim_end_matches('/'));

        let body = Body {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
            max_tokens,
            response_format: json!({ "type": "json_object" }),
        };

        let mut req = http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&body);

        if !self.token.trim().is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            anyhow::bail!("LLM HTTP {status}: {text}");
        }

        let envelope: JsonValue = serde_json::from_str(&text)?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("LLM response missing content"))?;

        // 1) direct parse
        if let Ok(js) = serde_json::from_str::<JsonValue>(content) {
            return Ok(js);
        }
        // 2) fenced ```json
        if let Some(js) = extract_fenced_json(content) {
            return Ok(serde_json::from_str(&js)?);
        }
        // 3) balanced object fallback
        if let Some(js) = extract_largest_json_object(content) {
            return Ok(serde_json::from_str(&js)?);
        }

        anyhow::bail!(
            "LLM did not return valid JSON. Preview: {}",
            &content.chars().take(500).collect::<String>()
        )
    }
}

/// Extract a JSON object from a ```json ... ``` fenced block.
/// Accepts ```json``` or plain ``` ``` fences (case-insensitive).
pub fn extract_fenced_json(s: &str) -> Option<String> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

    FENCE_RE
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Fallback: find the largest balanced `{ ... }` object in free text.
/// String-aware, so braces inside quoted values don't confuse the scan.
#[must_use]
pub fn extract_largest_json_object(s: &str) -> Option<String> {
    let mut best: Option<(usize, usize)> = None;

    let mut depth: usize = 0;
    let mut start: Option<usize> = None;
    let mut in_str = false;
    let mut esc = false;

    for (i, ch) in s.char_indices() {
        if in_str {
            if esc {
                esc = false;
            } else if ch == '\\' {
                esc = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }

        match ch {
            '"' => in_str = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(st) = start.take() {
                        let longer = best.is_none_or(|(a, b)| i - st > b - a);
                        if longer {
                            best = Some((st, i));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(a, b)| s[a..=b].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_extracted() {
        let s = "Here you go:\n```json\n{\"corrected_query\": \"apple\"}\n```\nDone.";
        let js = extract_fenced_json(s).unwrap();
        assert_eq!(js, "{\"corrected_query\": \"apple\"}");
    }

    #[test]
    fn largest_object_wins() {
        let s = "noise {\"a\":1} more {\"b\":{\"c\":2},\"d\":3} tail";
        let js = extract_largest_json_object(s).unwrap();
        assert_eq!(js, "{\"b\":{\"c\":2},\"d\":3}");
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let s = "{\"msg\": \"don't match this } brace\", \"n\": 1}";
        let js = extract_largest_json_object(s).unwrap();
        assert_eq!(js, s);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_largest_json_object("nothing here").is_none());
        assert!(extract_fenced_json("nothing here").is_none());
    }
}
