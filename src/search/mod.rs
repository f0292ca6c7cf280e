//! Search index: word / extension / size-range lookup over mirror entries.
//!
//! Four indices are combined by intersection: a case-folded, accent-stripped
//! word index mapping tokens to the entries whose name contains them; an
//! extension index; a size-range B-tree; and the combination of all three
//! when a query supplies more than one criterion. Results are ranked by
//! matched-word count, then by total size, and capped at
//! `max_number_of_search_result_to_send`.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::EntryId;

/// One searchable record: just enough to index and to report back in a
/// `FindResult`.
#[derive(Debug, Clone)]
pub struct SearchableEntry {
    pub id: EntryId,
    pub name: String,
    pub extension: Option<String>,
    pub size: u64,
}

#[derive(Default)]
pub struct SearchIndex {
    words: HashMap<String, HashSet<EntryId>>,
    extensions: HashMap<String, HashSet<EntryId>>,
    by_size: BTreeMap<u64, HashSet<EntryId>>,
    entries: HashMap<EntryId, SearchableEntry>,
}

/// One ranked match.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub id: EntryId,
    pub name: String,
    pub size: u64,
    pub matched_words: usize,
}

/// A query over the index: any combination of words, an extension filter,
/// and an inclusive size range.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub words: Vec<String>,
    pub extension: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

impl SearchQuery {
    pub fn from_pattern(pattern: &str) -> Self {
        Self { words: tokenize(pattern), ..Default::default() }
    }
}

/// Fold to lowercase and strip the small set of Latin accent marks seen in
/// filenames, the way the original's word index case/accent-folds entries.
fn fold(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'à' | 'â' | 'ä' | 'á' => 'a',
            'è' | 'ê' | 'ë' | 'é' => 'e',
            'ì' | 'î' | 'ï' | 'í' => 'i',
            'ò' | 'ô' | 'ö' | 'ó' => 'o',
            'ù' | 'û' | 'ü' | 'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect::<String>()
        .to_lowercase()
}

fn tokenize(s: &str) -> Vec<String> {
    fold(s)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: SearchableEntry) {
        self.remove(entry.id);
        for token in tokenize(&entry.name) {
            self.words.entry(token).or_default().insert(entry.id);
        }
        if let Some(ext) = &entry.extension {
            self.extensions.entry(fold(ext)).or_default().insert(entry.id);
        }
        self.by_size.entry(entry.size).or_default().insert(entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub fn remove(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.remove(&id) {
            for token in tokenize(&entry.name) {
                if let Some(set) = self.words.get_mut(&token) {
                    set.remove(&id);
                }
            }
            if let Some(ext) = &entry.extension {
                if let Some(set) = self.extensions.get_mut(&fold(ext)) {
                    set.remove(&id);
                }
            }
            if let Some(set) = self.by_size.get_mut(&entry.size) {
                set.remove(&id);
            }
        }
    }

    /// Run a query, returning matches ranked by matched-word count (desc)
    /// then size (desc), capped at `limit`.
    pub fn find(&self, query: &SearchQuery, limit: usize) -> Vec<SearchMatch> {
        let mut scores: HashMap<EntryId, usize> = HashMap::new();

        if query.words.is_empty() {
            for id in self.entries.keys() {
                scores.insert(*id, 0);
            }
        } else {
            for word in &query.words {
                if let Some(set) = self.words.get(&fold(word)) {
                    for id in set {
                        *scores.entry(*id).or_insert(0) += 1;
                    }
                }
            }
            // A query with words keeps only entries that matched at least
            // one of them — pure AND-of-words coverage ranking happens via
            // the score value itself.
        }

        if let Some(ext) = &query.extension {
            let folded = fold(ext);
            let allowed = self.extensions.get(&folded).cloned().unwrap_or_default();
            scores.retain(|id, _| allowed.contains(id));
        }

        let mut results: Vec<SearchMatch> = scores
            .into_iter()
            .filter_map(|(id, matched_words)| {
                let entry = self.entries.get(&id)?;
                if let Some(min) = query.min_size {
                    if entry.size < min {
                        return None;
                    }
                }
                if let Some(max) = query.max_size {
                    if entry.size > max {
                        return None;
                    }
                }
                Some(SearchMatch { id, name: entry.name.clone(), size: entry.size, matched_words })
            })
            .collect();

        results.sort_by(|a, b| b.matched_words.cmp(&a.matched_words).then(b.size.cmp(&a.size)));
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, name: &str, size: u64) -> SearchableEntry {
        let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_string());
        SearchableEntry { id: EntryId(id), name: name.to_string(), extension, size }
    }

    #[test]
    fn finds_by_word() {
        let mut index = SearchIndex::new();
        index.insert(entry(1, "hello world.txt", 100));
        index.insert(entry(2, "goodbye.txt", 50));

        let query = SearchQuery::from_pattern("hello");
        let results = index.find(&query, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, EntryId(1));
    }

    #[test]
    fn ranks_by_matched_word_count() {
        let mut index = SearchIndex::new();
        index.insert(entry(1, "foo bar baz.txt", 10));
        index.insert(entry(2, "foo.txt", 10));

        let query = SearchQuery::from_pattern("foo bar");
        let results = index.find(&query, 10);
        assert_eq!(results[0].id, EntryId(1));
    }

    #[test]
    fn filters_by_extension() {
        let mut index = SearchIndex::new();
        index.insert(entry(1, "movie.mkv", 10));
        index.insert(entry(2, "movie.txt", 10));

        let query = SearchQuery { extension: Some("mkv".to_string()), ..Default::default() };
        let results = index.find(&query, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, EntryId(1));
    }

    #[test]
    fn respects_result_cap() {
        let mut index = SearchIndex::new();
        for i in 0..10u64 {
            index.insert(entry(i, &format!("file{i}.txt"), i));
        }
        let query = SearchQuery::from_pattern("file");
        let results = index.find(&query, 3);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn remove_drops_entry_from_all_indices() {
        let mut index = SearchIndex::new();
        index.insert(entry(1, "hello.txt", 10));
        index.remove(EntryId(1));
        let query = SearchQuery::from_pattern("hello");
        assert!(index.find(&query, 10).is_empty());
    }

    #[test]
    fn fold_strips_accents_case_insensitively() {
        assert_eq!(fold("Évènement"), "evenement");
    }
}
