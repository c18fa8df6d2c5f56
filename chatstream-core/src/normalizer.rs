use crate::model::{CompletionRequest, ContentPart, MessageContent};
use unicode_normalization::UnicodeNormalization;

const MAX_OUTPUT_TOKENS_CAP: u32 = 100_000;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

fn clean_content(content: &mut MessageContent) {
    match content {
        MessageContent::Text(s) => *s = clean_text(s),
        MessageContent::Parts(parts) => {
            for part in parts.iter_mut() {
                if let ContentPart::Text { text } = part {
                    *text = clean_text(text);
                }
            }
        }
    }
}

/// Canonical form of an incoming request before it reaches the generator.
pub fn normalize_request(mut req: CompletionRequest) -> CompletionRequest {
    req.model = req.model.trim().to_string();
    for msg in &mut req.messages {
        clean_content(&mut msg.content);
    }
    let params = &mut req.params;
    params.temperature = Some(match params.temperature {
        Some(t) => clamp_round_f32(t, 0.0, 2.0, 3),
        None => 1.0,
    });
    params.top_p = Some(match params.top_p {
        Some(p) => clamp_round_f32(p, 0.0, 1.0, 4),
        None => 1.0,
    });
    if let Some(stops) = &mut params.stop_sequences {
        stops.sort();
        stops.dedup();
        if stops.is_empty() {
            params.stop_sequences = None;
        }
    }
    if let Some(max) = params.max_output_tokens
        && max > MAX_OUTPUT_TOKENS_CAP
    {
        params.max_output_tokens = Some(MAX_OUTPUT_TOKENS_CAP);
    }
    req
}
