//! Helpers shared by the integration tests.

use std::collections::HashMap;

use florence2::geometry::BoundingBox;
use florence2::tokenizer::{AddedToken, Tokenizer, TokenizerConfig};

#[must_use]
pub fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() < tol
}

#[must_use]
pub fn box_close(actual: &BoundingBox<f32>, expected: [f32; 4], tol: f32) -> bool {
    [actual.xmin, actual.ymin, actual.xmax, actual.ymax]
        .into_iter()
        .zip(expected)
        .all(|(a, e)| approx_eq(a, e, tol))
}

/// `[CLS]`, `[SEP]`, `[UNK]` at ids 0 to 2, then `tokens` in order.
///
/// The three markers are special added tokens, so skip-special decoding
/// drops them.
#[must_use]
pub fn bert_style_tokenizer(tokens: &[&str]) -> Tokenizer {
    let mut vocab = HashMap::from([
        ("[CLS]".to_owned(), 0),
        ("[SEP]".to_owned(), 1),
        ("[UNK]".to_owned(), 2),
    ]);
    for token in tokens {
        let next = u32::try_from(vocab.len()).unwrap_or(u32::MAX);
        vocab.entry((*token).to_owned()).or_insert(next);
    }
    let mut config = TokenizerConfig {
        cls_token: Some("[CLS]".into()),
        sep_token: Some("[SEP]".into()),
        unk_token: Some("[UNK]".into()),
        ..TokenizerConfig::default()
    };
    for (id, marker) in ["[CLS]", "[SEP]", "[UNK]"].into_iter().enumerate() {
        config
            .added_tokens_decoder
            .insert(id.to_string(), AddedToken::new(marker, true));
    }
    Tokenizer::new(vocab, &config).unwrap_or_else(|e| panic!("tokenizer assets: {e}"))
}
