use crate::models::{Message, RetrievalResult};

/// `<text> (source: <filename>, position: <position>)`
pub fn render_result(result: &RetrievalResult) -> String {
    format!(
        "{} (source: {}, position: {})",
        result.chunk_text, result.source_filename, result.position
    )
}

/// Prepend one system message carrying the retrieved context. The history
/// itself is never modified; with nothing retrieved it is returned as is
/// and the flag is false.
pub fn augment(history: &[Message], retrieved: &[RetrievalResult]) -> (Vec<Message>, bool) {
    if retrieved.is_empty() {
        return (history.to_vec(), false);
    }

    let context = retrieved
        .iter()
        .map(render_result)
        .collect::<Vec<_>>()
        .join("\n");

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(context));
    messages.extend_from_slice(history);
    (messages, true)
}
