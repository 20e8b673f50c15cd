//! Word tokenizer shared by the lexical index and the hashing embedder.
//! Splits on anything that is not a word character and lowercases.

/// Split text into lowercase word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    split_words(text)
        .map(str::to_lowercase)
        .collect()
}

fn split_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_splits_punctuation() {
        assert_eq!(
            tokenize("Hello, World! tokio::spawn(async_fn)"),
            vec!["hello", "world", "tokio", "spawn", "async_fn"]
        );
    }

    #[test]
    fn hyphen_separates_words() {
        assert_eq!(tokenize("rate-limit"), vec!["rate", "limit"]);
    }

    #[test]
    fn empty_input() {
        assert!(tokenize("  ... ").is_empty());
    }
}
