use crate::error::RagError;

use super::utils::{chunk_by_char_window, compute_hash_id};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

impl ChunkConfig {
    fn validate(&self) -> Result<(), RagError> {
        if self.chunk_size == 0 || self.chunk_overlap == 0 {
            return Err(RagError::InvalidConfig(
                "chunk_size and chunk_overlap must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, content: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, RagError>;
}

#[derive(Debug, Default, Clone)]
pub struct CharacterChunker;

impl Chunker for CharacterChunker {
    fn chunk(&self, content: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, RagError> {
        config.validate()?;

        let windows = chunk_by_char_window(content, config.chunk_size, config.chunk_overlap);
        Ok(windows
            .into_iter()
            .enumerate()
            .map(|(index, content)| Chunk {
                id: compute_hash_id(&content, "chunk-"),
                content,
                index,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::compute_hash_id;
    use super::*;

    fn chunk(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
        CharacterChunker
            .chunk(
                content,
                &ChunkConfig {
                    chunk_size,
                    chunk_overlap,
                },
            )
            .unwrap()
    }

    fn sample_text(len: usize) -> String {
        (0..len)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect()
    }

    #[test]
    fn twelve_hundred_chars_split_into_three_windows() {
        let chunks = chunk(&sample_text(1200), 500, 50);
        assert_eq!(chunks.len(), 3);
        let lengths: Vec<usize> = chunks.iter().map(|c| c.content.chars().count()).collect();
        assert_eq!(lengths, vec![500, 500, 300]);
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn chunks_reconstruct_the_original_text() {
        for (len, size, overlap) in [(1200, 500, 50), (777, 100, 30), (64, 64, 10), (3, 10, 2)] {
            let text = sample_text(len);
            let chunks = chunk(&text, size, overlap);

            let mut rebuilt = String::new();
            for chunk in &chunks {
                if rebuilt.is_empty() {
                    rebuilt.push_str(&chunk.content);
                } else {
                    rebuilt.extend(chunk.content.chars().skip(overlap));
                }
            }
            assert_eq!(rebuilt, text, "len={len} size={size} overlap={overlap}");
        }
    }

    #[test]
    fn chunk_count_matches_the_window_bound() {
        for (len, size, overlap) in [(1200, 500, 50), (501, 500, 50), (500, 500, 50), (999, 100, 25)]
        {
            let step = size - overlap;
            let expected = ((len - overlap) + step - 1) / step;
            let chunks = chunk(&sample_text(len), size, overlap);
            assert_eq!(chunks.len(), expected, "len={len} size={size} overlap={overlap}");
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk("", 500, 50).is_empty());
    }

    #[test]
    fn short_input_yields_one_chunk() {
        let chunks = chunk("tiny", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "tiny");
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let result = CharacterChunker.chunk(
            "text",
            &ChunkConfig {
                chunk_size: 50,
                chunk_overlap: 50,
            },
        );
        assert!(matches!(result, Err(RagError::InvalidConfig(_))));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for (size, overlap) in [(0, 0), (0, 10), (10, 0)] {
            let result = CharacterChunker.chunk(
                "text",
                &ChunkConfig {
                    chunk_size: size,
                    chunk_overlap: overlap,
                },
            );
            assert!(matches!(result, Err(RagError::InvalidConfig(_))));
        }
    }

    #[test]
    fn identical_content_gets_identical_ids() {
        let chunks = chunk(&sample_text(1200), 500, 50);
        assert_eq!(chunks[0].id, compute_hash_id(&chunks[0].content, "chunk-"));
    }
}
