use crate::{
    index::text,
    record::Record,
    value::Value,
};
use std::{collections::BTreeSet, fmt, sync::Arc};

/// A user-supplied indexing function: `(index_name, record)` to the keys
/// the object should be findable under.
pub type IndexerFn = dyn Fn(&str, &Record) -> BTreeSet<String> + Send + Sync;

///
/// Indexer
///
/// Pure key extractors. Built-ins read the attribute named like the index;
/// `Keywords` can be pointed at several source attributes; `Custom` sees
/// the whole record.
///

#[derive(Clone)]
pub enum Indexer {
    /// The attribute value itself; list values contribute one key each.
    Value,
    /// Lowercased, trimmed, internal whitespace collapsed.
    Normalize,
    /// Compatibility-decomposed, combining marks dropped.
    NoAccents,
    /// `Normalize` then `NoAccents`, punctuation folded to spaces.
    Keyword,
    /// Tokenized keywords over one or more source attributes.
    Keywords {
        attrs: Vec<&'static str>,
        min_len: usize,
    },
    /// Last-save time, rendered sortable.
    UpdateTime,
    /// Cumulative path prefixes: `a/b/c` yields `a`, `a/b`, `a/b/c`.
    Paths { separator: char },
    Custom(Arc<IndexerFn>),
}

impl Indexer {
    /// `Keywords` sourcing the attribute named like the index.
    #[must_use]
    pub const fn keywords(min_len: usize) -> Self {
        Self::Keywords {
            attrs: Vec::new(),
            min_len,
        }
    }

    /// `Keywords` over explicit source attributes.
    #[must_use]
    pub fn keywords_over(attrs: impl IntoIterator<Item = &'static str>, min_len: usize) -> Self {
        Self::Keywords {
            attrs: attrs.into_iter().collect(),
            min_len,
        }
    }

    #[must_use]
    pub fn custom(
        f: impl Fn(&str, &Record) -> BTreeSet<String> + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Keys the record should appear under for the index called `name`.
    #[must_use]
    pub fn keys(&self, name: &str, record: &Record) -> BTreeSet<String> {
        match self {
            Self::Value => attr_strings(record, name).into_iter().collect(),
            Self::Normalize => attr_strings(record, name)
                .iter()
                .map(|s| text::normalize(s))
                .collect(),
            Self::NoAccents => attr_strings(record, name)
                .iter()
                .map(|s| text::fold_accents(s))
                .collect(),
            Self::Keyword => attr_strings(record, name)
                .iter()
                .map(|s| text::keyword(s))
                .collect(),
            Self::Keywords { attrs, min_len } => {
                let mut out = BTreeSet::new();
                let sources: Vec<&str> = if attrs.is_empty() {
                    vec![name]
                } else {
                    attrs.clone()
                };
                for attr in sources {
                    for s in attr_strings(record, attr) {
                        out.extend(text::keywords(&s, *min_len));
                    }
                }
                out
            }
            Self::UpdateTime => BTreeSet::from([record.update_time().sort_key()]),
            Self::Paths { separator } => {
                let mut out = BTreeSet::new();
                for s in attr_strings(record, name) {
                    let mut current = String::new();
                    for segment in s.split(*separator).filter(|seg| !seg.is_empty()) {
                        if current.is_empty() {
                            current.push_str(segment);
                        } else {
                            current.push(*separator);
                            current.push_str(segment);
                        }
                        out.insert(current.clone());
                    }
                }
                out
            }
            Self::Custom(f) => f(name, record),
        }
        .into_iter()
        .filter(|k| !k.is_empty())
        .collect()
    }
}

impl fmt::Debug for Indexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => f.write_str("Value"),
            Self::Normalize => f.write_str("Normalize"),
            Self::NoAccents => f.write_str("NoAccents"),
            Self::Keyword => f.write_str("Keyword"),
            Self::Keywords { attrs, min_len } => f
                .debug_struct("Keywords")
                .field("attrs", attrs)
                .field("min_len", min_len)
                .finish(),
            Self::UpdateTime => f.write_str("UpdateTime"),
            Self::Paths { separator } => {
                f.debug_struct("Paths").field("separator", separator).finish()
            }
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// String views of one attribute: scalars yield one, lists one per
/// element, maps one per value. Absent and null attributes yield none.
fn attr_strings(record: &Record, name: &str) -> Vec<String> {
    let Some(value) = record.attr(name) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    collect_strings(&value, &mut out);
    out
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::List(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Map(entries) => {
            for item in entries.values() {
                collect_strings(item, out);
            }
        }
        other => {
            if let Some(s) = other.to_text() {
                out.push(s);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::Timestamp, oid::Oid};
    use std::collections::BTreeMap;

    fn record(props: &[(&str, Value)]) -> Record {
        Record {
            class: "Article".to_owned(),
            oid: Oid::parse("A1").unwrap(),
            properties: props
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
            relations: BTreeMap::new(),
            updates: BTreeMap::from([("oid".to_owned(), Timestamp::from_millis(1234))]),
        }
    }

    fn keys(indexer: &Indexer, name: &str, r: &Record) -> Vec<String> {
        indexer.keys(name, r).into_iter().collect()
    }

    #[test]
    fn value_passes_through_and_expands_lists() {
        let r = record(&[(
            "tags",
            Value::List(vec!["red".into(), "blue".into()]),
        )]);
        assert_eq!(keys(&Indexer::Value, "tags", &r), vec!["blue", "red"]);
    }

    #[test]
    fn absent_attribute_yields_no_keys() {
        let r = record(&[]);
        assert!(Indexer::Normalize.keys("email", &r).is_empty());
    }

    #[test]
    fn normalize_produces_lookup_key() {
        let r = record(&[("email", "  Alice@Example.COM ".into())]);
        assert_eq!(
            keys(&Indexer::Normalize, "email", &r),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn keywords_tokenize_across_attributes() {
        let r = record(&[
            ("title", "The quick fox".into()),
            ("content", "over lazy dogs".into()),
        ]);
        let indexer = Indexer::keywords_over(["title", "content"], 3);
        assert_eq!(
            keys(&indexer, "keywords", &r),
            vec!["dogs", "fox", "lazy", "over", "quick", "the"]
        );
    }

    #[test]
    fn keywords_drop_short_tokens() {
        let r = record(&[("title", "a an the fox".into())]);
        let indexer = Indexer::keywords(3);
        assert_eq!(keys(&indexer, "title", &r), vec!["fox", "the"]);
    }

    #[test]
    fn update_time_is_sortable() {
        let r = record(&[]);
        assert_eq!(
            keys(&Indexer::UpdateTime, "recent", &r),
            vec![Timestamp::from_millis(1234).sort_key()]
        );
    }

    #[test]
    fn paths_yield_cumulative_prefixes() {
        let r = record(&[("folder", "a/b/c".into())]);
        assert_eq!(
            keys(&Indexer::Paths { separator: '/' }, "folder", &r),
            vec!["a", "a/b", "a/b/c"]
        );
    }

    #[test]
    fn custom_sees_the_whole_record() {
        let r = record(&[("title", "X".into())]);
        let indexer = Indexer::custom(|_, record| {
            BTreeSet::from([format!("class:{}", record.class)])
        });
        assert_eq!(keys(&indexer, "any", &r), vec!["class:Article"]);
    }
}
