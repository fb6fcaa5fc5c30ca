//! Character-window chunking for ingested documents.

/// Split text into overlapping character windows, snapping each window end
/// to a nearby sentence boundary when one exists.
pub fn split_into_chunks(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();

    if total == 0 || chunk_size == 0 {
        return chunks;
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut start = 0;

    while start < total {
        let end = (start + chunk_size).min(total);
        let window: String = chars[start..end].iter().collect();

        let piece = if end < total {
            snap_to_sentence_boundary(&window)
        } else {
            window
        };

        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            chunks.push(piece);
        }

        start += step;
    }

    chunks
}

/// Look for a sentence ending in the last fifth of the window and cut
/// there; otherwise keep the window as-is.
fn snap_to_sentence_boundary(window: &str) -> String {
    const ENDINGS: [&str; 8] = [". ", "! ", "? ", ".\n", "!\n", "?\n", "。", "！"];

    let chars: Vec<char> = window.chars().collect();
    let search_from = (chars.len() * 4) / 5;
    let tail: String = chars[search_from..].iter().collect();

    for ending in ENDINGS {
        if let Some(pos) = tail.rfind(ending) {
            let head: String = chars[..search_from].iter().collect();
            return format!("{}{}", head, &tail[..pos + ending.len()]);
        }
    }

    window.to_string()
}
