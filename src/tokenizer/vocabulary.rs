//! Fixed bidirectional token table.

use std::collections::HashMap;

use super::TokenizerError;

/// Immutable id ↔ token mapping covering every id in `[0, len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocabulary {
    /// Builds the table from base entries and added tokens.
    ///
    /// Added tokens may claim unassigned ids or repeat the content already
    /// held at their id. When the same string appears under several ids,
    /// reverse lookup resolves to the lowest.
    ///
    /// # Errors
    ///
    /// Fails when both inputs are empty, when an id lies beyond the number of
    /// tokens supplied, when two base entries share an id, when an added
    /// token disagrees with the base entry at its id, or when the combined
    /// table leaves an id unassigned.
    pub fn new<I, A>(entries: I, added: A) -> Result<Self, TokenizerError>
    where
        I: IntoIterator<Item = (String, u32)>,
        A: IntoIterator<Item = (u32, String)>,
    {
        let mut entries: Vec<(String, u32)> = entries.into_iter().collect();
        let added: Vec<(u32, String)> = added.into_iter().collect();
        // A gap-free table of n tokens only uses ids below n.
        let capacity = entries.len() + added.len();
        let out_of_range = entries
            .iter()
            .map(|(_, id)| *id)
            .chain(added.iter().map(|(id, _)| *id))
            .find(|&id| id as usize >= capacity);
        if let Some(id) = out_of_range {
            return Err(TokenizerError::IdOutOfRange {
                id,
                tokens: capacity,
            });
        }

        let mut slots: Vec<Option<String>> = Vec::new();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (token, id) in entries {
            let slot = slot_mut(&mut slots, id);
            if let Some(existing) = slot.as_ref() {
                return Err(TokenizerError::DuplicateId {
                    id,
                    existing: existing.clone(),
                    token,
                });
            }
            *slot = Some(token);
        }

        for (id, content) in added {
            let slot = slot_mut(&mut slots, id);
            match slot.as_deref() {
                Some(existing) if existing != content => {
                    return Err(TokenizerError::AddedTokenConflict {
                        id,
                        existing: existing.to_owned(),
                        content,
                    });
                }
                Some(_) => {}
                None => *slot = Some(content),
            }
        }

        if slots.is_empty() {
            return Err(TokenizerError::EmptyVocabulary);
        }

        let mut tokens = Vec::with_capacity(slots.len());
        let mut ids = HashMap::with_capacity(slots.len());
        for (id, slot) in (0_u32..).zip(slots) {
            let token = slot.ok_or(TokenizerError::MissingId(id))?;
            ids.entry(token.clone()).or_insert(id);
            tokens.push(token);
        }
        Ok(Self { tokens, ids })
    }

    /// Number of ids in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token string for `id`.
    #[must_use]
    pub fn token(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.tokens.get(i))
            .map(String::as_str)
    }

    /// Lowest id whose token is `token`.
    #[must_use]
    pub fn id(&self, token: &str) -> Option<i64> {
        self.ids.get(token).map(|&id| i64::from(id))
    }
}

fn slot_mut(slots: &mut Vec<Option<String>>, id: u32) -> &mut Option<String> {
    let index = id as usize;
    if slots.len() <= index {
        slots.resize(index + 1, None);
    }
    &mut slots[index]
}
