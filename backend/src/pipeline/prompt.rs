use crate::storage::RetrievedChunk;

/// Contractual refusal sentence. Downstream consumers pattern-match on it,
/// so it must never change without coordinating with them.
pub const REFUSAL_NOTICE: &str =
    "The provided document does not contain information to answer this question.";

/// Assembles the fixed instruction template: system instruction, retrieved
/// context joined with blank lines in retrieval order, then the question.
/// Overlapping chunk text is left duplicated on purpose.
pub fn build_prompt(chunks: &[RetrievedChunk], question: &str) -> String {
    let context = chunks
        .iter()
        .map(|chunk| chunk.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are an assistant that answers questions using only the provided context.\n\
         If the context does not contain the information needed to answer, reply exactly: \"{REFUSAL_NOTICE}\"\n\
         Do not guess and do not use outside knowledge.\n\
         \n\
         [Context]\n\
         {context}\n\
         \n\
         [Question]\n\
         {question}\n\
         \n\
         [Answer]\n"
    )
}
