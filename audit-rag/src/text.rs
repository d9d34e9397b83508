//! Shared text normalisation for the built-in embedder and reasoner.

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is", "it",
    "its", "of", "on", "or", "our", "that", "the", "this", "to", "was", "we", "were", "which",
    "will", "with",
];

/// Sustainability-reporting vocabulary. Each group is a head term and the
/// words a report commonly uses in its place; membership is symmetric.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("disclosure", &["reporting", "transparency", "statement", "publication"]),
    ("report", &["disclose", "publish", "submit"]),
    ("compliance", &["adherence", "conformity", "observance"]),
    ("emissions", &["ghg", "carbon", "co2", "pollution", "greenhouse", "exhaust"]),
    ("governance", &["management", "oversight", "stewardship", "administration"]),
    ("sustainability", &["environmental", "esg", "sustainable"]),
    ("risk", &["exposure", "hazard", "threat", "vulnerability"]),
    ("stakeholder", &["investor", "shareholder", "community"]),
    ("policy", &["guideline", "regulation", "procedure"]),
    ("engagement", &["involvement", "participation", "consultation"]),
    ("remuneration", &["compensation", "salary", "pay", "wages"]),
    ("revenue", &["income", "sales", "turnover", "proceeds"]),
    ("profit", &["earnings", "margin", "surplus"]),
    ("waste", &["refuse", "debris", "scrap", "disposal"]),
    ("energy", &["power", "electricity", "fuel"]),
    ("water", &["withdrawal", "consumption"]),
    ("jobs", &["employment", "hiring", "workforce"]),
    ("investment", &["funding", "capital", "expenditure", "financing"]),
    ("corruption", &["bribery", "fraud", "misconduct"]),
];

/// Lower-cased alphanumeric terms of `text`, without stopwords and
/// single-character tokens, in order of appearance.
pub(crate) fn content_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Every term sharing a synonym group with `term`, excluding `term` itself.
/// A trailing plural `s` is ignored when looking the term up.
pub(crate) fn synonyms_of(term: &str) -> Vec<&'static str> {
    let singular = term.strip_suffix('s').filter(|s| s.len() > 2);
    let is_term = |word: &str| word == term || Some(word) == singular;
    let mut related = Vec::new();
    for &(head, words) in SYNONYMS {
        if is_term(head) || words.iter().any(|&w| is_term(w)) {
            for word in std::iter::once(head).chain(words.iter().copied()) {
                if !is_term(word) && !related.contains(&word) {
                    related.push(word);
                }
            }
        }
    }
    related
}

/// `base` followed by the synonyms of the content terms of `source` that
/// `base` does not already mention.
pub(crate) fn widen_query(base: &str, source: &str) -> String {
    let mut seen = content_terms(base);
    let mut query = base.to_string();
    for term in content_terms(source) {
        for word in synonyms_of(&term) {
            if !seen.iter().any(|s| s == word) {
                seen.push(word.to_string());
                query.push(' ');
                query.push_str(word);
            }
        }
    }
    query
}
